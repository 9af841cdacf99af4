//! # Live Output
//!
//! Where encoded packets go: an FLV-framed stream addressed by a
//! [`StreamTarget`], written through a [`TagSink`] transport.
//!
//! ## Transports:
//! - **rtmp**: publish to `rtmp://host:port/app/key`
//! - **file**: the same FLV container written to a local path
//! - **null**: nothing is opened; packets are counted and discarded
//!
//! The [`StreamBackend`] trait is the seam the streamer opens encoders and
//! transports through, so tests can run the whole engine in memory.

use crate::audio::codec::{make_encoder, AudioEncoder, CodecKind, EncoderSettings};
use crate::audio::format::TimeBase;
use crate::error::StreamError;
use crate::stream::flv::{AudioParams, FlvTag, FlvWriter};
use crate::stream::rtmp::{RtmpPublisher, RtmpTarget};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputProtocol {
    Rtmp,
    File,
    Null,
}

/// Address of one live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub protocol: OutputProtocol,
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream_key: String,
    pub file_path: Option<PathBuf>,
}

impl StreamTarget {
    pub fn rtmp(host: impl Into<String>, port: u16, app: impl Into<String>, stream_key: impl Into<String>) -> Self {
        Self {
            protocol: OutputProtocol::Rtmp,
            host: host.into(),
            port,
            app: app.into(),
            stream_key: stream_key.into(),
            file_path: None,
        }
    }

    pub fn url(&self) -> String {
        match self.protocol {
            OutputProtocol::Rtmp => self.rtmp_target().url(),
            OutputProtocol::File => format!(
                "file:{}",
                self.file_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ),
            OutputProtocol::Null => format!("null:{}", self.stream_key),
        }
    }

    pub fn rtmp_target(&self) -> RtmpTarget {
        RtmpTarget {
            host: self.host.clone(),
            port: self.port,
            app: self.app.clone(),
            stream_key: self.stream_key.clone(),
        }
    }

    /// Check the target can be opened. An empty key is always refused.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.stream_key.trim().is_empty() {
            return Err(StreamError::MissingStreamKey);
        }
        match self.protocol {
            OutputProtocol::Rtmp => {
                if self.host.trim().is_empty() {
                    return Err(StreamError::InvalidTarget("server host is empty".into()));
                }
                if self.port == 0 {
                    return Err(StreamError::InvalidTarget("server port is 0".into()));
                }
            }
            OutputProtocol::File => {
                if self.file_path.is_none() {
                    return Err(StreamError::InvalidTarget("file output needs a path".into()));
                }
            }
            OutputProtocol::Null => {}
        }
        Ok(())
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_key_part(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Stream key for a group/user pair: `stream_<group>_<user>`.
pub fn stream_key_for(group_id: &str, user_id: &str) -> String {
    format!("stream_{}_{}", sanitize_key_part(group_id), sanitize_key_part(user_id))
}

/// Byte transport for FLV tags.
pub trait TagSink: Send {
    fn send_tag(&mut self, tag: &FlvTag) -> Result<(), StreamError>;

    /// Flush and close. Called once, from `write_trailer`.
    fn finish(&mut self) -> Result<(), StreamError>;
}

/// FLV file on disk.
pub struct FlvFileSink {
    path: PathBuf,
    writer: FlvWriter<BufWriter<File>>,
}

impl FlvFileSink {
    pub fn create(path: PathBuf) -> Result<Self, StreamError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StreamError::transport(format!("create {}", parent.display()), e))?;
        }
        let file = File::create(&path)
            .map_err(|e| StreamError::transport(format!("create {}", path.display()), e))?;
        let writer = FlvWriter::new(BufWriter::new(file))
            .map_err(|e| StreamError::transport(format!("write header to {}", path.display()), e))?;
        Ok(Self { path, writer })
    }
}

impl TagSink for FlvFileSink {
    fn send_tag(&mut self, tag: &FlvTag) -> Result<(), StreamError> {
        self.writer
            .write_tag(tag)
            .map_err(|e| StreamError::transport(format!("write {}", self.path.display()), e))
    }

    fn finish(&mut self) -> Result<(), StreamError> {
        self.writer
            .flush()
            .map_err(|e| StreamError::transport(format!("flush {}", self.path.display()), e))
    }
}

/// Opens encoders and transports for the streamer.
pub trait StreamBackend: Send {
    fn open_encoder(
        &self,
        codec: CodecKind,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn AudioEncoder>, StreamError>;

    fn open_transport(&self, target: &StreamTarget) -> Result<Box<dyn TagSink>, StreamError>;
}

/// Real encoders, real sockets and files.
#[derive(Debug, Clone)]
pub struct NetworkBackend {
    pub timeout: Duration,
}

impl Default for NetworkBackend {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl StreamBackend for NetworkBackend {
    fn open_encoder(
        &self,
        codec: CodecKind,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn AudioEncoder>, StreamError> {
        Ok(make_encoder(codec, settings)?)
    }

    fn open_transport(&self, target: &StreamTarget) -> Result<Box<dyn TagSink>, StreamError> {
        match target.protocol {
            OutputProtocol::Rtmp => Ok(Box::new(RtmpPublisher::connect(&target.rtmp_target(), self.timeout)?)),
            OutputProtocol::File => {
                let path = target
                    .file_path
                    .clone()
                    .ok_or_else(|| StreamError::InvalidTarget("file output needs a path".into()))?;
                Ok(Box::new(FlvFileSink::create(path)?))
            }
            OutputProtocol::Null => Err(StreamError::InvalidTarget(
                "null output has no transport".into(),
            )),
        }
    }
}

/// FLV output with a single audio stream.
pub struct LiveOutput {
    target: StreamTarget,
    stream: Option<AudioParams>,
    sink: Option<Box<dyn TagSink>>,
    header_written: bool,
    last_timestamp: u32,
    packets_written: u64,
    bytes_written: u64,
}

impl LiveOutput {
    pub fn new(target: StreamTarget) -> Self {
        Self {
            target,
            stream: None,
            sink: None,
            header_written: false,
            last_timestamp: 0,
            packets_written: 0,
            bytes_written: 0,
        }
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    /// FLV keeps codec configuration out of band.
    pub fn requires_global_header(&self) -> bool {
        true
    }

    /// Whether this output writes through a transport at all.
    pub fn needs_transport(&self) -> bool {
        self.target.protocol != OutputProtocol::Null
    }

    /// Stream timestamps are milliseconds.
    pub fn time_base(&self) -> TimeBase {
        TimeBase::MILLIS
    }

    /// Declare the audio stream. Returns its index.
    pub fn add_stream(&mut self, params: AudioParams) -> Result<usize, StreamError> {
        if self.stream.is_some() {
            return Err(StreamError::Container("output already has an audio stream".into()));
        }
        params.sound_flags()?;
        self.stream = Some(params);
        Ok(0)
    }

    pub fn attach_transport(&mut self, sink: Box<dyn TagSink>) {
        self.sink = Some(sink);
    }

    pub fn write_header(&mut self) -> Result<(), StreamError> {
        let params = self
            .stream
            .as_ref()
            .ok_or_else(|| StreamError::Container("no audio stream declared".into()))?;
        let metadata = FlvTag::metadata(params);
        let sequence_header = FlvTag::sequence_header(params)?;

        if let Some(sink) = self.sink.as_mut() {
            sink.send_tag(&metadata)?;
            if let Some(tag) = sequence_header {
                sink.send_tag(&tag)?;
            }
        }
        self.header_written = true;
        debug!(url = %self.target.url(), "Output header written");
        Ok(())
    }

    /// Write one packet. `pts` is in [`LiveOutput::time_base`] units.
    pub fn write_packet(&mut self, stream_index: usize, pts: i64, data: &[u8]) -> Result<(), StreamError> {
        if !self.header_written {
            return Err(StreamError::Container("packet written before header".into()));
        }
        let params = match (stream_index, self.stream.as_ref()) {
            (0, Some(params)) => params,
            _ => {
                return Err(StreamError::Container(format!("no stream with index {stream_index}")));
            }
        };

        let mut timestamp = pts.clamp(0, u32::MAX as i64) as u32;
        if timestamp < self.last_timestamp {
            warn!(timestamp, last = self.last_timestamp, "Non-monotonic timestamp, clamping");
            timestamp = self.last_timestamp;
        }
        let tag = FlvTag::audio(params, timestamp, data)?;
        if let Some(sink) = self.sink.as_mut() {
            sink.send_tag(&tag)?;
        }
        self.last_timestamp = timestamp;
        self.packets_written += 1;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Finish the container and close the transport.
    pub fn write_trailer(&mut self) -> Result<(), StreamError> {
        let result = match self.sink.as_mut() {
            Some(sink) if self.header_written => sink.finish(),
            _ => Ok(()),
        };
        info!(
            url = %self.target.url(),
            packets = self.packets_written,
            bytes = self.bytes_written,
            "Output closed"
        );
        self.sink = None;
        result
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Transport that records every tag in memory.
    #[derive(Clone, Default)]
    pub(crate) struct MemorySink {
        pub tags: Arc<Mutex<Vec<FlvTag>>>,
        pub finished: Arc<Mutex<bool>>,
        pub fail_writes: Arc<Mutex<bool>>,
    }

    impl TagSink for MemorySink {
        fn send_tag(&mut self, tag: &FlvTag) -> Result<(), StreamError> {
            if *self.fail_writes.lock().unwrap() {
                return Err(StreamError::transport(
                    "send audio",
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed"),
                ));
            }
            self.tags.lock().unwrap().push(tag.clone());
            Ok(())
        }

        fn finish(&mut self) -> Result<(), StreamError> {
            *self.finished.lock().unwrap() = true;
            Ok(())
        }
    }

    fn mulaw() -> AudioParams {
        AudioParams {
            codec: CodecKind::MuLaw,
            sample_rate: 8000,
            channels: 1,
            bit_rate: 64_000,
            extradata: None,
        }
    }

    #[test]
    fn stream_keys_are_sanitized() {
        assert_eq!(stream_key_for("grp 1", "ü/ser"), "stream_grp_1___ser");
        assert_eq!(stream_key_for("a-b_c", "42"), "stream_a-b_c_42");
    }

    #[test]
    fn rtmp_url_uses_port_and_app() {
        let target = StreamTarget::rtmp("10.0.0.5", 1935, "live", "stream_g_u");
        assert_eq!(target.url(), "rtmp://10.0.0.5:1935/live/stream_g_u");
    }

    #[test]
    fn validation_requires_a_key_and_host() {
        let mut target = StreamTarget::rtmp("host", 1935, "live", "  ");
        assert!(matches!(target.validate(), Err(StreamError::MissingStreamKey)));
        target.stream_key = "k".into();
        target.host = String::new();
        assert!(matches!(target.validate(), Err(StreamError::InvalidTarget(_))));
    }

    #[test]
    fn header_then_packets_then_trailer() {
        let sink = MemorySink::default();
        let mut out = LiveOutput::new(StreamTarget::rtmp("h", 1935, "live", "k"));
        assert!(out.write_packet(0, 0, &[1]).is_err());

        out.add_stream(mulaw()).unwrap();
        out.attach_transport(Box::new(sink.clone()));
        out.write_header().unwrap();
        out.write_packet(0, 20, &[1, 2]).unwrap();
        out.write_packet(0, 10, &[3]).unwrap();
        out.write_trailer().unwrap();

        let tags = sink.tags.lock().unwrap();
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[0].tag_type, crate::stream::flv::TAG_SCRIPT);
        assert_eq!(tags[1].body, vec![0x82, 1, 2]);
        // Timestamps never go backwards.
        assert_eq!(tags[2].timestamp, 20);
        assert!(*sink.finished.lock().unwrap());
        assert_eq!(out.packets_written(), 2);
    }

    #[test]
    fn rejects_streams_flv_cannot_describe() {
        let mut out = LiveOutput::new(StreamTarget::rtmp("h", 1935, "live", "k"));
        let mut params = mulaw();
        params.sample_rate = 16000;
        assert!(matches!(out.add_stream(params), Err(StreamError::Container(_))));
    }

    #[test]
    fn file_sink_writes_a_playable_flv() {
        let path = std::env::temp_dir().join(format!("intercom-{}.flv", uuid::Uuid::new_v4()));
        let mut target = StreamTarget::rtmp("", 0, "", "k");
        target.protocol = OutputProtocol::File;
        target.file_path = Some(path.clone());
        assert!(target.validate().is_ok());

        let backend = NetworkBackend::default();
        let mut out = LiveOutput::new(target.clone());
        out.add_stream(mulaw()).unwrap();
        out.attach_transport(backend.open_transport(&target).unwrap());
        out.write_header().unwrap();
        out.write_packet(0, 0, &[0xFF; 8]).unwrap();
        out.write_trailer().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..3], b"FLV");
        assert_eq!(bytes[13], crate::stream::flv::TAG_SCRIPT);
        std::fs::remove_file(&path).ok();
    }
}
