//! # Playback Sink
//!
//! Where decoded mono S16LE audio goes. The decode engine only sees the
//! [`PlaybackSink`] trait; the default sink is a bounded queue feeding a
//! dedicated output thread that keeps the device open for the lifetime of
//! the receive pipeline.
//!
//! ## Output thread:
//! - **`device-audio` feature**: owns a cpal output stream at the target rate
//! - **headless**: drains the queue and counts what would have been played

use crate::audio::format::{s16_to_f32, s16le_bytes_to_samples};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Destination for converted PCM. Writes are best effort and must not block.
pub trait PlaybackSink: Send {
    fn write(&mut self, pcm: &[u8]);
}

/// Counters shared between the sink and its output thread.
#[derive(Debug, Default)]
pub struct PlaybackStats {
    pub chunks_queued: AtomicU64,
    pub chunks_dropped: AtomicU64,
    pub bytes_played: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaybackSnapshot {
    pub chunks_queued: u64,
    pub chunks_dropped: u64,
    pub bytes_played: u64,
}

impl PlaybackStats {
    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            chunks_queued: self.chunks_queued.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            bytes_played: self.bytes_played.load(Ordering::Relaxed),
        }
    }
}

/// Producer side: hands chunks to the output thread, dropping them when the
/// thread falls behind.
pub struct QueuedPlayback {
    tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<PlaybackStats>,
}

impl PlaybackSink for QueuedPlayback {
    fn write(&mut self, pcm: &[u8]) {
        if pcm.is_empty() {
            return;
        }
        match self.tx.try_send(pcm.to_vec()) {
            Ok(()) => {
                self.stats.chunks_queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.chunks_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    warn!(dropped, "Playback queue full, dropping audio");
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Create a sink and the receiving end its output thread consumes.
pub fn playback_channel(capacity: usize) -> (QueuedPlayback, mpsc::Receiver<Vec<u8>>, Arc<PlaybackStats>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(PlaybackStats::default());
    (
        QueuedPlayback {
            tx,
            stats: stats.clone(),
        },
        rx,
        stats,
    )
}

/// Start the output thread for `rx`. It runs until every sender is dropped.
pub fn spawn_output(
    rx: mpsc::Receiver<Vec<u8>>,
    sample_rate: u32,
    stats: Arc<PlaybackStats>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("playback-output".to_string())
        .spawn(move || run_output(rx, sample_rate, stats))
}

#[cfg(not(feature = "device-audio"))]
fn run_output(mut rx: mpsc::Receiver<Vec<u8>>, sample_rate: u32, stats: Arc<PlaybackStats>) {
    info!(sample_rate, "Headless playback output started");
    while let Some(chunk) = rx.blocking_recv() {
        stats
            .bytes_played
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    debug!("Playback output stopped");
}

#[cfg(feature = "device-audio")]
fn run_output(mut rx: mpsc::Receiver<Vec<u8>>, sample_rate: u32, stats: Arc<PlaybackStats>) {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // Roughly two seconds of audio; older samples are discarded beyond that.
    let max_buffered = sample_rate as usize * 2;

    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        warn!("No audio output device found, falling back to headless playback");
        drain_headless(rx, &stats);
        return;
    };

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::with_capacity(max_buffered)));
    let callback_buffer = buffer.clone();

    let stream = match device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let Ok(mut buf) = callback_buffer.lock() else {
                data.fill(0.0);
                return;
            };
            for sample in data.iter_mut() {
                *sample = buf.pop_front().unwrap_or(0.0);
            }
        },
        |err| warn!(error = %err, "Audio output stream error"),
        None,
    ) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Failed to open audio output, falling back to headless playback");
            drain_headless(rx, &stats);
            return;
        }
    };

    if let Err(e) = stream.play() {
        warn!(error = %e, "Failed to start audio output, falling back to headless playback");
        drain_headless(rx, &stats);
        return;
    }
    info!(sample_rate, "Audio output device opened");

    while let Some(chunk) = rx.blocking_recv() {
        let samples = s16le_bytes_to_samples(&chunk);
        if let Ok(mut buf) = buffer.lock() {
            buf.extend(samples.into_iter().map(s16_to_f32));
            let excess = buf.len().saturating_sub(max_buffered);
            buf.drain(..excess);
        }
        stats
            .bytes_played
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    debug!("Playback output stopped");
}

#[cfg(feature = "device-audio")]
fn drain_headless(mut rx: mpsc::Receiver<Vec<u8>>, stats: &PlaybackStats) {
    while let Some(chunk) = rx.blocking_recv() {
        stats
            .bytes_played
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
}

/// Peak level of an S16LE chunk in `[0.0, 1.0]`, used for level logging.
pub fn peak_level(pcm: &[u8]) -> f32 {
    s16le_bytes_to_samples(pcm)
        .into_iter()
        .map(|s| s16_to_f32(s).abs())
        .fold(0.0, f32::max)
}
