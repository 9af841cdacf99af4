//! # Receive Pipeline
//!
//! Wires the frame codec, session recorder and decode engine together and
//! runs them on one dedicated thread fed by the transport.
//!
//! ```text
//! transport ──(bounded channel)──> receive worker
//!                                    ├─ parse frame
//!                                    ├─ record raw payload
//!                                    └─ decode + play
//! ```

use crate::audio::decoder::DecodeEngine;
use crate::audio::frame::{AudioFrame, WireMessage};
use crate::audio::recorder::SessionRecorder;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Counters for the receive path, readable from the control API.
#[derive(Debug, Default)]
pub struct ReceiveStats {
    pub messages: AtomicU64,
    pub audio_frames: AtomicU64,
    pub ignored_frames: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub payload_bytes: AtomicU64,
    pub rejected_payloads: AtomicU64,
    pub pcm_bytes_played: AtomicU64,
    pub recordings_completed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiveSnapshot {
    pub messages: u64,
    pub audio_frames: u64,
    pub ignored_frames: u64,
    pub malformed_frames: u64,
    pub payload_bytes: u64,
    pub rejected_payloads: u64,
    pub pcm_bytes_played: u64,
    pub recordings_completed: u64,
}

impl ReceiveStats {
    pub fn snapshot(&self) -> ReceiveSnapshot {
        ReceiveSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            ignored_frames: self.ignored_frames.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            payload_bytes: self.payload_bytes.load(Ordering::Relaxed),
            rejected_payloads: self.rejected_payloads.load(Ordering::Relaxed),
            pcm_bytes_played: self.pcm_bytes_played.load(Ordering::Relaxed),
            recordings_completed: self.recordings_completed.load(Ordering::Relaxed),
        }
    }
}

pub struct ReceivePipeline {
    recorder: SessionRecorder,
    engine: DecodeEngine,
    stats: Arc<ReceiveStats>,
}

impl ReceivePipeline {
    pub fn new(recorder: SessionRecorder, engine: DecodeEngine, stats: Arc<ReceiveStats>) -> Self {
        Self {
            recorder,
            engine,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ReceiveStats> {
        &self.stats
    }

    /// Process one complete transport message.
    pub fn handle_message(&mut self, bytes: &[u8]) {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);

        let frame = match AudioFrame::parse(bytes) {
            Ok(WireMessage::Audio(frame)) => frame,
            Ok(WireMessage::Other { frame_type }) => {
                trace!(frame_type, "Ignoring non-audio frame");
                self.stats.ignored_frames.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                warn!(bytes = bytes.len(), error = %e, "Dropping malformed frame");
                self.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        self.stats.audio_frames.fetch_add(1, Ordering::Relaxed);
        self.stats
            .payload_bytes
            .fetch_add(frame.payload.len() as u64, Ordering::Relaxed);
        debug!(
            sender = %frame.sender_name,
            flag = ?frame.flag,
            bytes = frame.payload.len(),
            "Audio frame received"
        );

        if self.recorder.handle(frame.flag, &frame.payload).is_some() {
            self.stats.recordings_completed.fetch_add(1, Ordering::Relaxed);
        }

        if frame.payload.is_empty() {
            return;
        }
        let report = self.engine.decode_and_play(&frame.payload);
        if report.rejected {
            self.stats.rejected_payloads.fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .pcm_bytes_played
            .fetch_add(report.bytes_written as u64, Ordering::Relaxed);
    }

    /// Close any open recording.
    pub fn shutdown(&mut self) {
        if self.recorder.close().is_some() {
            self.stats.recordings_completed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Run `pipeline` on its own thread until the channel closes.
pub fn spawn_receive_worker(
    mut pipeline: ReceivePipeline,
    mut rx: mpsc::Receiver<Vec<u8>>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("receive-pipeline".to_string())
        .spawn(move || {
            info!("Receive pipeline started");
            while let Some(message) = rx.blocking_recv() {
                pipeline.handle_message(&message);
            }
            pipeline.shutdown();
            info!("Receive pipeline stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::aac::tests::SILENT_STEREO_FRAME;
    use crate::audio::codec::g711::linear_to_alaw;
    use crate::audio::codec::CodecKind;
    use crate::audio::decoder::tests::CaptureSink;
    use crate::audio::format::s16le_bytes_to_samples;
    use crate::audio::frame::SessionFlag;
    use std::fs;
    use std::path::PathBuf;

    fn frame(flag: SessionFlag, payload: Vec<u8>) -> Vec<u8> {
        AudioFrame {
            flag,
            group_id: b"g".to_vec(),
            sender_id: b"s".to_vec(),
            sender_name: "Tester".to_string(),
            timestamp: 0,
            payload,
        }
        .encode()
    }

    fn pipeline(dir: &PathBuf, sink: &CaptureSink) -> ReceivePipeline {
        let recorder = SessionRecorder::new(dir, CodecKind::ALaw.file_extension(), true);
        let engine = DecodeEngine::new(CodecKind::ALaw, 0, 8000, Box::new(sink.clone()));
        ReceivePipeline::new(recorder, engine, Arc::new(ReceiveStats::default()))
    }

    #[test]
    fn burst_is_played_and_recorded() {
        let dir = std::env::temp_dir().join(format!("intercom-rx-{}", uuid::Uuid::new_v4()));
        let sink = CaptureSink::default();
        let mut p = pipeline(&dir, &sink);

        let chunks: Vec<Vec<u8>> = [[0i16; 80], [1200; 80], [-1200; 80], [300; 80]]
            .iter()
            .map(|c| c.iter().map(|&s| linear_to_alaw(s)).collect())
            .collect();
        p.handle_message(&frame(SessionFlag::Start, chunks[0].clone()));
        p.handle_message(&frame(SessionFlag::Continue, chunks[1].clone()));
        p.handle_message(&frame(SessionFlag::Continue, chunks[2].clone()));
        p.handle_message(&frame(SessionFlag::End, chunks[3].clone()));

        // 8 kHz in, 8 kHz out: every sample plays.
        assert_eq!(s16le_bytes_to_samples(&sink.bytes()).len(), 320);

        let files: Vec<_> = fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(files.len(), 1);
        assert_eq!(fs::read(files[0].path()).unwrap(), chunks.concat());

        let snap = p.stats().snapshot();
        assert_eq!(snap.audio_frames, 4);
        assert_eq!(snap.recordings_completed, 1);
        assert_eq!(snap.pcm_bytes_played, 640);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn aac_burst_plays_every_frame() {
        let dir = std::env::temp_dir().join(format!("intercom-rx-{}", uuid::Uuid::new_v4()));
        let sink = CaptureSink::default();
        let recorder = SessionRecorder::new(&dir, CodecKind::Aac.file_extension(), true);
        let engine = DecodeEngine::new(CodecKind::Aac, 0, 44100, Box::new(sink.clone()));
        let mut p = ReceivePipeline::new(recorder, engine, Arc::new(ReceiveStats::default()));

        let payload = SILENT_STEREO_FRAME.to_vec();
        for flag in [SessionFlag::Start, SessionFlag::Continue, SessionFlag::Continue, SessionFlag::End] {
            p.handle_message(&frame(flag, payload.clone()));
        }

        let chunks = sink.0.lock().unwrap().clone();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() == 2048));

        let files: Vec<_> = fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].path().to_string_lossy().ends_with(".aac"));
        assert_eq!(fs::read(files[0].path()).unwrap(), payload.repeat(4));

        let snap = p.stats().snapshot();
        assert_eq!(snap.rejected_payloads, 0);
        assert_eq!(snap.malformed_frames, 0);
        assert_eq!(snap.recordings_completed, 1);
        assert_eq!(snap.pcm_bytes_played, 4 * 2048);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn non_audio_and_malformed_messages_have_no_effect() {
        let dir = std::env::temp_dir().join(format!("intercom-rx-{}", uuid::Uuid::new_v4()));
        let sink = CaptureSink::default();
        let mut p = pipeline(&dir, &sink);

        p.handle_message(&[1, 0, 0, 0, 0]);
        let mut truncated = frame(SessionFlag::Start, vec![0xD5; 10]);
        truncated.truncate(truncated.len() - 3);
        p.handle_message(&truncated);
        p.handle_message(&[]);

        assert!(sink.bytes().is_empty());
        assert!(!dir.exists());
        let snap = p.stats().snapshot();
        assert_eq!(snap.ignored_frames, 1);
        assert_eq!(snap.malformed_frames, 2);
        assert_eq!(snap.audio_frames, 0);
    }

    #[test]
    fn empty_payload_still_drives_the_recorder() {
        let dir = std::env::temp_dir().join(format!("intercom-rx-{}", uuid::Uuid::new_v4()));
        let sink = CaptureSink::default();
        let mut p = pipeline(&dir, &sink);

        p.handle_message(&frame(SessionFlag::Start, Vec::new()));
        assert!(sink.bytes().is_empty());
        p.handle_message(&frame(SessionFlag::End, vec![0xD5]));
        assert_eq!(p.stats().snapshot().recordings_completed, 1);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn worker_drains_until_the_channel_closes() {
        let dir = std::env::temp_dir().join(format!("intercom-rx-{}", uuid::Uuid::new_v4()));
        let sink = CaptureSink::default();
        let p = pipeline(&dir, &sink);
        let stats = p.stats().clone();

        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_receive_worker(p, rx).unwrap();
        tx.blocking_send(frame(SessionFlag::Start, vec![0xD5; 40])).unwrap();
        drop(tx);
        handle.join().unwrap();

        // The open burst is closed on shutdown.
        assert_eq!(stats.snapshot().recordings_completed, 1);
        assert_eq!(sink.bytes().len(), 80);
        fs::remove_dir_all(&dir).ok();
    }
}
