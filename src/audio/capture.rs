//! # Microphone Capture
//!
//! Feeds the default input device into the stream controller as interleaved
//! S16LE at the capture rate and channel count. Only built with the
//! `device-audio` feature.
//!
//! The cpal stream is not `Send`, so a dedicated thread owns it and keeps it
//! alive until [`CaptureHandle::stop`] is called or the handle is dropped.

use crate::audio::format::{f32_to_s16, s16_to_le_bytes};
use crate::audio::playback::peak_level;
use crate::stream::StreamController;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Chunks between level log lines.
const LEVEL_LOG_INTERVAL: u64 = 200;

pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the default microphone and push its audio to `controller`.
pub fn spawn_capture(
    controller: StreamController,
    sample_rate: u32,
    channels: u16,
) -> std::io::Result<CaptureHandle> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let thread = thread::Builder::new()
        .name("mic-capture".to_string())
        .spawn(move || run_capture(controller, sample_rate, channels.max(1), flag))?;
    Ok(CaptureHandle {
        running,
        thread: Some(thread),
    })
}

fn run_capture(controller: StreamController, sample_rate: u32, channels: u16, running: Arc<AtomicBool>) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        warn!("No audio input device found, microphone capture disabled");
        return;
    };
    debug!(device = ?device.name(), "Using audio input device");

    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut chunks: u64 = 0;
    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let samples: Vec<i16> = data.iter().copied().map(f32_to_s16).collect();
            let pcm = s16_to_le_bytes(&samples);
            chunks += 1;
            if chunks % LEVEL_LOG_INTERVAL == 0 {
                debug!(peak = peak_level(&pcm), chunks, "Microphone level");
            }
            controller.push_pcm(pcm);
        },
        |err| warn!(error = %err, "Audio input stream error"),
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Failed to open audio input");
            return;
        }
    };
    if let Err(e) = stream.play() {
        warn!(error = %e, "Failed to start audio input");
        return;
    }
    info!(sample_rate, channels, "Microphone capture started");

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }
    drop(stream);
    info!("Microphone capture stopped");
}
