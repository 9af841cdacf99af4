//! # Capture/Encode-Mux Engine
//!
//! Accepts raw capture PCM, slices it into encoder-sized frames, resamples,
//! encodes and writes the packets to a live output. Everything the resampler
//! produces is kept and regrouped into encoder frames, so the stream clock
//! follows the capture clock whatever the rate ratio.
//!
//! ## States:
//! ```text
//! Idle ──start()──> Starting ──ok──> Running ──stop()──> Idle
//!                      └────failure (rolled back)──> Idle
//! ```
//!
//! ## Timestamps:
//! Frame pts counts samples in the encoder's time base and advances by the
//! number of samples each frame actually carried. Packets are rescaled to
//! the output's millisecond time base on the way out.

use crate::audio::codec::{AudioEncoder, CodecKind, EncoderFrame, EncoderSettings};
use crate::audio::format::{
    rescale_ts, s16le_bytes_to_samples, ChannelLayout, PcmSpec, SampleData, SampleFormat, TimeBase,
    S16_BYTES,
};
use crate::audio::resampler::Resampler;
use crate::error::StreamError;
use crate::stream::flv::AudioParams;
use crate::stream::output::{LiveOutput, StreamBackend, StreamTarget};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Frame size used when the encoder accepts any size.
pub const DEFAULT_FRAME_SIZE: usize = 1024;
pub const DEFAULT_BIT_RATE: u32 = 128_000;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamerState {
    Idle,
    Starting,
    Running,
}

/// Lifecycle notifications, broadcast to any number of listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "lowercase")]
pub enum StreamerEvent {
    Started { url: String },
    Stopped,
    Log(String),
    Error(String),
}

/// Encoder and capture parameters for the next session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub codec: CodecKind,
    pub bit_rate: u32,
    pub capture_rate: u32,
    pub capture_channels: u16,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            codec: CodecKind::MuLaw,
            bit_rate: DEFAULT_BIT_RATE,
            capture_rate: 44100,
            capture_channels: 1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamerStats {
    pub sessions_started: u64,
    pub bytes_pushed: u64,
    pub frames_encoded: u64,
    pub packets_written: u64,
    pub slices_skipped: u64,
    pub write_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamerStatus {
    pub state: StreamerState,
    pub url: String,
    pub codec: CodecKind,
    pub encoder_sample_rate: Option<u32>,
    pub frame_size: Option<usize>,
    pub pts: Option<i64>,
    pub pending_bytes: usize,
    pub stats: StreamerStats,
}

/// Sends events and mirrors them to the log.
#[derive(Clone)]
struct EventBus {
    tx: broadcast::Sender<StreamerEvent>,
}

impl EventBus {
    fn emit(&self, event: StreamerEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    fn log(&self, message: String) {
        info!("{}", message);
        self.emit(StreamerEvent::Log(message));
    }

    fn error(&self, message: String) {
        error!("{}", message);
        self.emit(StreamerEvent::Error(message));
    }
}

/// Everything owned by one running session. Dropping it releases the
/// encoder, resampler and transport.
struct ActiveSession {
    encoder: Box<dyn AudioEncoder>,
    encoder_time_base: TimeBase,
    resampler: Resampler,
    output: LiveOutput,
    stream_index: usize,
    frame_size: usize,
    /// The encoder only accepts frames of exactly `frame_size` samples.
    fixed_frame: bool,
    frame_bytes: usize,
    pts: i64,
    pending: Vec<u8>,
    /// Resampled audio not yet submitted, in the encoder's format.
    resampled: SampleData,
}

impl ActiveSession {
    /// Encode every complete frame waiting in the accumulator.
    fn encode_pending(&mut self, events: &EventBus, stats: &mut StreamerStats) {
        while self.pending.len() >= self.frame_bytes {
            let slice: Vec<u8> = self.pending.drain(..self.frame_bytes).collect();
            self.resample(&slice, events, stats);
            self.encode_resampled(false, events, stats);
        }
    }

    /// Resample one slice of capture PCM, keeping every produced frame.
    fn resample(&mut self, slice: &[u8], events: &EventBus, stats: &mut StreamerStats) {
        let input = SampleData::S16(s16le_bytes_to_samples(slice));
        let capacity = self.resampler.out_capacity(input.frames(self.resampler.input().channels()));
        match self.resampler.convert(&input, capacity) {
            Ok(converted) => self.resampled.append(converted),
            Err(e) => {
                events.error(format!("Audio resampling failed: {e}"));
                stats.slices_skipped += 1;
            }
        }
    }

    /// Submit resampled audio in encoder-sized frames. Fixed-size encoders
    /// get a short last frame only when `flush` is set.
    fn encode_resampled(&mut self, flush: bool, events: &EventBus, stats: &mut StreamerStats) {
        let channels = self.encoder.channels();
        loop {
            let available = self.resampled.frames(channels);
            let take = if !self.fixed_frame || flush {
                available.min(self.frame_size)
            } else if available >= self.frame_size {
                self.frame_size
            } else {
                0
            };
            if take == 0 {
                return;
            }
            let data = self.resampled.take_front(take * channels as usize);
            self.submit(data, take, events, stats);
        }
    }

    fn submit(&mut self, data: SampleData, frames: usize, events: &EventBus, stats: &mut StreamerStats) {
        let frame = EncoderFrame { pts: self.pts, data };
        self.pts += frames as i64;

        if let Err(e) = self.encoder.send_frame(Some(&frame)) {
            events.error(format!("Encoding audio frame failed: {e}"));
            stats.slices_skipped += 1;
            return;
        }
        stats.frames_encoded += 1;

        if let Err(e) = self.drain_packets(stats) {
            events.error(format!("Writing stream packet failed: {e}"));
            stats.write_errors += 1;
        }
    }

    /// Push the partial slice and the resampler tail through the encoder.
    fn flush_audio(&mut self, events: &EventBus, stats: &mut StreamerStats) {
        let whole = self.pending.len() - self.pending.len() % (self.frame_bytes / self.frame_size);
        if whole > 0 {
            let tail: Vec<u8> = self.pending.drain(..whole).collect();
            self.resample(&tail, events, stats);
        }
        match self.resampler.flush() {
            Ok(rest) => self.resampled.append(rest),
            Err(e) => warn!(error = %e, "Flushing resampler failed"),
        }
        self.encode_resampled(true, events, stats);
    }

    /// Write every packet the encoder has ready. Stops at the first write
    /// failure.
    fn drain_packets(&mut self, stats: &mut StreamerStats) -> Result<(), StreamError> {
        while let Some(packet) = self.encoder.receive_packet()? {
            let pts = rescale_ts(packet.pts, self.encoder_time_base, self.output.time_base());
            self.output.write_packet(self.stream_index, pts, &packet.data)?;
            stats.packets_written += 1;
        }
        Ok(())
    }
}

pub struct Streamer {
    backend: Box<dyn StreamBackend>,
    target: StreamTarget,
    settings: StreamSettings,
    state: StreamerState,
    session: Option<ActiveSession>,
    events: EventBus,
    stats: StreamerStats,
}

impl Streamer {
    pub fn new(settings: StreamSettings, target: StreamTarget, backend: Box<dyn StreamBackend>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            target,
            settings,
            state: StreamerState::Idle,
            session: None,
            events: EventBus { tx },
            stats: StreamerStats::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamerEvent> {
        self.events.tx.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<StreamerEvent> {
        self.events.tx.clone()
    }

    pub fn state(&self) -> StreamerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == StreamerState::Running
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    /// Takes effect on the next `start()`.
    pub fn set_target(&mut self, target: StreamTarget) {
        self.target = target;
    }

    pub fn set_server(&mut self, host: impl Into<String>, port: u16) {
        self.target.host = host.into();
        self.target.port = port;
    }

    pub fn set_stream_key(&mut self, key: impl Into<String>) {
        self.target.stream_key = key.into();
    }

    /// Capture format of the PCM passed to `push_pcm`. A channel count of 0
    /// means mono.
    pub fn set_audio_format(&mut self, sample_rate: u32, channels: u16) {
        self.settings.capture_rate = sample_rate;
        self.settings.capture_channels = channels.max(1);
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: StreamSettings) {
        self.settings = settings;
    }

    /// Bytes waiting for a complete encoder frame.
    pub fn pending_bytes(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.pending.len())
    }

    pub fn status(&self) -> StreamerStatus {
        let session = self.session.as_ref();
        StreamerStatus {
            state: self.state,
            url: self.target.url(),
            codec: self.settings.codec,
            encoder_sample_rate: session.map(|s| s.encoder.sample_rate()),
            frame_size: session.map(|s| s.frame_size),
            pts: session.map(|s| s.pts),
            pending_bytes: self.pending_bytes(),
            stats: self.stats,
        }
    }

    /// Open the output and begin accepting PCM.
    ///
    /// ## Returns:
    /// - **`AlreadyRunning`** if a session is active (it is left untouched)
    /// - **`MissingStreamKey`** / **`InvalidTarget`** for an unusable target
    /// - any setup failure, after everything opened so far is released
    pub fn start(&mut self) -> Result<(), StreamError> {
        if self.state != StreamerState::Idle {
            self.events.error("Streaming is already running".to_string());
            return Err(StreamError::AlreadyRunning);
        }
        if let Err(e) = self.target.validate() {
            self.events.error(format!("Cannot start streaming: {e}"));
            return Err(e);
        }

        self.release();
        self.state = StreamerState::Starting;
        match self.open_session() {
            Ok(session) => {
                let url = self.target.url();
                info!(
                    url = %url,
                    codec = session.encoder.codec().name(),
                    sample_rate = session.encoder.sample_rate(),
                    frame_size = session.frame_size,
                    "Streaming started"
                );
                self.session = Some(session);
                self.state = StreamerState::Running;
                self.stats.sessions_started += 1;
                self.events.emit(StreamerEvent::Started { url: url.clone() });
                self.events.log(format!("Streaming to {url}"));
                Ok(())
            }
            Err(e) => {
                self.release();
                self.state = StreamerState::Idle;
                self.events.error(format!("Failed to start streaming: {e}"));
                Err(e)
            }
        }
    }

    fn open_session(&mut self) -> Result<ActiveSession, StreamError> {
        let mut output = LiveOutput::new(self.target.clone());

        let settings = EncoderSettings {
            sample_rate: self.settings.capture_rate,
            channels: self.settings.capture_channels,
            bit_rate: self.settings.bit_rate,
            global_header: output.requires_global_header(),
        };
        let encoder = self.backend.open_encoder(self.settings.codec, &settings)?;

        let stream_index = output.add_stream(AudioParams {
            codec: encoder.codec(),
            sample_rate: encoder.sample_rate(),
            channels: encoder.channels(),
            bit_rate: encoder.bit_rate(),
            extradata: encoder.extradata().map(<[u8]>::to_vec),
        })?;

        if output.needs_transport() {
            let transport = self.backend.open_transport(&self.target)?;
            output.attach_transport(transport);
        }

        let fixed_frame = encoder.frame_size().is_some_and(|n| n > 0);
        let frame_size = encoder
            .frame_size()
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_FRAME_SIZE);

        let capture = PcmSpec::new(
            self.settings.capture_rate,
            ChannelLayout::default_for(self.settings.capture_channels),
            SampleFormat::S16,
        );
        let resampler = Resampler::new(capture, encoder.input_spec())?;
        let encoder_format = encoder.sample_format();

        output.write_header()?;

        debug!(
            capture_rate = capture.sample_rate,
            encoder_rate = encoder.sample_rate(),
            frame_size,
            "Capture session configured"
        );
        Ok(ActiveSession {
            encoder_time_base: encoder.time_base(),
            encoder,
            resampler,
            output,
            stream_index,
            frame_size,
            fixed_frame,
            frame_bytes: frame_size * self.settings.capture_channels as usize * S16_BYTES,
            pts: 0,
            pending: Vec::new(),
            resampled: SampleData::empty(encoder_format),
        })
    }

    /// Queue capture PCM (S16LE in the capture format). Ignored unless running.
    pub fn push_pcm(&mut self, pcm: &[u8]) {
        if self.state != StreamerState::Running || pcm.is_empty() {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        self.stats.bytes_pushed += pcm.len() as u64;
        session.pending.extend_from_slice(pcm);
        session.encode_pending(&self.events, &mut self.stats);
    }

    /// Flush and close the running session. Does nothing but release
    /// leftovers when not running.
    pub fn stop(&mut self) {
        if self.state != StreamerState::Running {
            self.release();
            return;
        }

        if let Some(mut session) = self.session.take() {
            session.flush_audio(&self.events, &mut self.stats);
            match session.encoder.send_frame(None) {
                Ok(()) => {
                    if let Err(e) = session.drain_packets(&mut self.stats) {
                        warn!(error = %e, "Flushing encoder failed");
                    }
                }
                Err(e) => warn!(error = %e, "Encoder rejected end of stream"),
            }
            if let Err(e) = session.output.write_trailer() {
                warn!(error = %e, "Writing stream trailer failed");
            }
            if !session.pending.is_empty() {
                debug!(bytes = session.pending.len(), "Discarding partial sample");
            }
        }

        self.release();
        self.state = StreamerState::Idle;
        self.events.emit(StreamerEvent::Stopped);
        self.events.log("Streaming stopped".to_string());
    }

    fn release(&mut self) {
        self.session = None;
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::codec::EncodedPacket;
    use crate::error::CodecError;
    use crate::stream::output::tests::MemorySink;
    use crate::stream::output::TagSink;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::broadcast::error::TryRecvError;

    /// Encoder that holds one frame back until flushed.
    pub(crate) struct FakeEncoder {
        rate: u32,
        frame_size: Option<usize>,
        frames: Arc<Mutex<Vec<EncoderFrame>>>,
        held: VecDeque<EncodedPacket>,
        ready: VecDeque<EncodedPacket>,
    }

    impl AudioEncoder for FakeEncoder {
        fn codec(&self) -> CodecKind {
            if self.rate == 8000 {
                CodecKind::MuLaw
            } else {
                CodecKind::Pcm
            }
        }
        fn sample_rate(&self) -> u32 {
            self.rate
        }
        fn channels(&self) -> u16 {
            1
        }
        fn sample_format(&self) -> SampleFormat {
            SampleFormat::S16
        }
        fn bit_rate(&self) -> u32 {
            self.rate * 16
        }
        fn frame_size(&self) -> Option<usize> {
            self.frame_size
        }
        fn send_frame(&mut self, frame: Option<&EncoderFrame>) -> Result<(), CodecError> {
            match frame {
                Some(frame) => {
                    self.frames.lock().unwrap().push(frame.clone());
                    self.held.push_back(EncodedPacket {
                        data: frame.data.to_s16le_bytes(),
                        pts: frame.pts,
                        duration: frame.data.len() as i64,
                    });
                    while self.held.len() > 1 {
                        if let Some(p) = self.held.pop_front() {
                            self.ready.push_back(p);
                        }
                    }
                }
                None => self.ready.extend(self.held.drain(..)),
            }
            Ok(())
        }
        fn receive_packet(&mut self) -> Result<Option<EncodedPacket>, CodecError> {
            Ok(self.ready.pop_front())
        }
    }

    #[derive(Clone)]
    pub(crate) struct FakeBackend {
        pub rate: u32,
        pub frame_size: Option<usize>,
        pub frames: Arc<Mutex<Vec<EncoderFrame>>>,
        pub sink: MemorySink,
        pub fail_transport: bool,
    }

    impl FakeBackend {
        pub(crate) fn new(rate: u32, frame_size: Option<usize>) -> Self {
            Self {
                rate,
                frame_size,
                frames: Arc::default(),
                sink: MemorySink::default(),
                fail_transport: false,
            }
        }
    }

    impl StreamBackend for FakeBackend {
        fn open_encoder(
            &self,
            _codec: CodecKind,
            _settings: &EncoderSettings,
        ) -> Result<Box<dyn AudioEncoder>, StreamError> {
            Ok(Box::new(FakeEncoder {
                rate: self.rate,
                frame_size: self.frame_size,
                frames: self.frames.clone(),
                held: VecDeque::new(),
                ready: VecDeque::new(),
            }))
        }

        fn open_transport(&self, target: &StreamTarget) -> Result<Box<dyn TagSink>, StreamError> {
            if self.fail_transport {
                return Err(StreamError::transport(
                    format!("connect {}", target.url()),
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                ));
            }
            Ok(Box::new(self.sink.clone()))
        }
    }

    pub(crate) fn streamer(backend: &FakeBackend, capture_rate: u32) -> Streamer {
        let settings = StreamSettings {
            codec: CodecKind::MuLaw,
            bit_rate: DEFAULT_BIT_RATE,
            capture_rate,
            capture_channels: 1,
        };
        Streamer::new(
            settings,
            StreamTarget::rtmp("127.0.0.1", 1935, "live", "stream_g_u"),
            Box::new(backend.clone()),
        )
    }

    fn pcm(samples: &[i16]) -> Vec<u8> {
        crate::audio::format::s16_to_le_bytes(samples)
    }

    fn drain(rx: &mut broadcast::Receiver<StreamerEvent>) -> Vec<StreamerEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(e) => events.push(e),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return events,
            }
        }
    }

    #[test]
    fn pcm_is_sliced_into_whole_encoder_frames() {
        let backend = FakeBackend::new(8000, Some(4));
        let mut s = streamer(&backend, 8000);
        s.start().unwrap();

        // 4 samples per frame, mono: 8 bytes per frame.
        s.push_pcm(&[1, 0, 2, 0, 3]);
        assert!(backend.frames.lock().unwrap().is_empty());
        assert_eq!(s.pending_bytes(), 5);

        let mut rest = vec![0u8];
        rest.extend(pcm(&[4, 5, 6, 7, 8, 9, 10, 11, 12, 13]));
        s.push_pcm(&rest);

        let frames = backend.frames.lock().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data, SampleData::S16(vec![1, 2, 3, 4]));
        assert_eq!(frames[2].data, SampleData::S16(vec![9, 10, 11, 12]));
        assert_eq!(s.pending_bytes(), 2);
    }

    #[test]
    fn pts_advances_by_samples_produced() {
        let backend = FakeBackend::new(8000, Some(4));
        let mut s = streamer(&backend, 8000);
        s.start().unwrap();
        s.push_pcm(&pcm(&[0; 16]));
        s.stop();

        let pts: Vec<i64> = backend.frames.lock().unwrap().iter().map(|f| f.pts).collect();
        assert_eq!(pts, vec![0, 4, 8, 12]);

        // Packets reach the output in ms, never decreasing.
        let tags = backend.sink.tags.lock().unwrap();
        let stamps: Vec<u32> = tags.iter().skip(1).map(|t| t.timestamp).collect();
        assert_eq!(stamps, vec![0, 1, 1, 2]);
    }

    #[test]
    fn resampled_frames_carry_their_real_length() {
        let backend = FakeBackend::new(8000, None);
        let mut s = streamer(&backend, 16000);
        s.start().unwrap();
        assert_eq!(s.status().frame_size, Some(DEFAULT_FRAME_SIZE));

        s.push_pcm(&pcm(&vec![100; DEFAULT_FRAME_SIZE * 2]));
        let frames = backend.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        let first = frames[0].data.len() as i64;
        assert!(first > 0 && first <= 513);
        assert_eq!(frames[1].pts, first);
    }

    #[test]
    fn stop_when_idle_is_silent() {
        let backend = FakeBackend::new(8000, Some(4));
        let mut s = streamer(&backend, 8000);
        let mut rx = s.subscribe();
        s.stop();
        s.stop();
        assert_eq!(s.state(), StreamerState::Idle);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn second_start_is_rejected_and_leaves_session_alone() {
        let backend = FakeBackend::new(8000, Some(4));
        let mut s = streamer(&backend, 8000);
        let mut rx = s.subscribe();

        s.start().unwrap();
        s.push_pcm(&[1, 2, 3]);
        assert!(matches!(s.start(), Err(StreamError::AlreadyRunning)));
        assert!(s.is_running());
        assert_eq!(s.pending_bytes(), 3);

        s.stop();
        assert_eq!(s.state(), StreamerState::Idle);
        let events = drain(&mut rx);
        assert!(matches!(&events[0], StreamerEvent::Started { url } if url == "rtmp://127.0.0.1:1935/live/stream_g_u"));
        assert!(events.iter().any(|e| matches!(e, StreamerEvent::Error(_))));
        assert!(events.contains(&StreamerEvent::Stopped));
        assert!(*backend.sink.finished.lock().unwrap());
    }

    #[test]
    fn failed_start_rolls_back_to_idle() {
        let mut backend = FakeBackend::new(8000, Some(4));
        backend.fail_transport = true;
        let mut s = streamer(&backend, 8000);
        let mut rx = s.subscribe();

        assert!(matches!(s.start(), Err(StreamError::Transport { .. })));
        assert_eq!(s.state(), StreamerState::Idle);
        s.push_pcm(&pcm(&[1; 8]));
        assert!(backend.frames.lock().unwrap().is_empty());
        assert!(matches!(drain(&mut rx).as_slice(), [StreamerEvent::Error(_)]));
    }

    #[test]
    fn empty_stream_key_is_refused() {
        let backend = FakeBackend::new(8000, Some(4));
        let mut s = streamer(&backend, 8000);
        s.set_stream_key("");
        assert!(matches!(s.start(), Err(StreamError::MissingStreamKey)));
        assert_eq!(s.state(), StreamerState::Idle);
    }

    #[test]
    fn write_failure_keeps_the_session_running() {
        let backend = FakeBackend::new(8000, Some(4));
        let mut s = streamer(&backend, 8000);
        let mut rx = s.subscribe();
        s.start().unwrap();

        *backend.sink.fail_writes.lock().unwrap() = true;
        s.push_pcm(&pcm(&[0; 12]));
        // The first frame is held back, the other two fail to write.
        assert!(s.is_running());
        assert_eq!(s.status().stats.write_errors, 2);

        *backend.sink.fail_writes.lock().unwrap() = false;
        s.push_pcm(&pcm(&[0; 4]));
        assert_eq!(s.status().stats.packets_written, 1);
        assert!(drain(&mut rx).iter().any(|e| matches!(e, StreamerEvent::Error(m) if m.contains("peer closed"))));
    }

    #[test]
    fn stop_flushes_held_packets() {
        let backend = FakeBackend::new(8000, Some(4));
        let mut s = streamer(&backend, 8000);
        s.start().unwrap();
        s.push_pcm(&pcm(&[0; 12]));
        assert_eq!(s.status().stats.packets_written, 2);
        s.stop();
        assert_eq!(s.status().stats.packets_written, 3);
    }

    #[test]
    fn upsampled_capture_keeps_pace_with_real_time() {
        let backend = FakeBackend::new(44100, Some(1024));
        let mut s = streamer(&backend, 16000);
        s.start().unwrap();

        // 10 s of 16 kHz capture in 100 ms chunks.
        let chunk = pcm(&[250; 1600]);
        for _ in 0..100 {
            s.push_pcm(&chunk);
            let delay = s.session.as_ref().unwrap().resampler.delay();
            assert!(delay < 1024, "resampler holds {delay} frames");
        }

        let pts = s.status().pts.unwrap();
        let seconds = pts as f64 / 44100.0;
        assert!((seconds - 10.0).abs() < 0.1, "stream clock at {seconds} s");
        {
            let frames = backend.frames.lock().unwrap();
            assert!(frames.iter().all(|f| f.data.len() == 1024));
        }

        // Stopping drains the partial slice and the filter tail.
        s.stop();
        let total: usize = backend.frames.lock().unwrap().iter().map(|f| f.data.len()).sum();
        assert!((440_990..=441_400).contains(&total), "encoded {total} samples");
    }
}
