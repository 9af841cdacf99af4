//! # Stream Controller
//!
//! One worker thread owns the [`Streamer`]. Everything else talks to it through
//! a cloneable [`StreamController`] handle:
//!
//! - **commands** (start, stop, status, settings) wait for queue space and get
//!   a reply over a oneshot channel
//! - **PCM chunks** use `try_send`; when the queue is full the newest chunk is
//!   dropped and counted
//!
//! Network writes block inside the worker only. The worker exits, stopping any
//! running session, once every handle is dropped.

use crate::error::StreamError;
use crate::stream::output::StreamTarget;
use crate::stream::streamer::{StreamSettings, Streamer, StreamerEvent, StreamerStatus};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<T>;

enum WorkerMessage {
    Pcm(Vec<u8>),
    Start {
        target: Option<StreamTarget>,
        reply: Reply<Result<StreamerStatus, StreamError>>,
    },
    Stop {
        reply: Reply<StreamerStatus>,
    },
    Status {
        reply: Reply<StreamerStatus>,
    },
    Configure {
        settings: StreamSettings,
        target: StreamTarget,
        reply: Reply<()>,
    },
}

#[derive(Debug, Default)]
pub struct QueueStats {
    pub chunks_queued: AtomicU64,
    pub chunks_dropped: AtomicU64,
    pub bytes_queued: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueSnapshot {
    pub capacity: usize,
    pub chunks_queued: u64,
    pub chunks_dropped: u64,
    pub bytes_queued: u64,
}

/// Handle to the streaming worker.
#[derive(Clone)]
pub struct StreamController {
    tx: mpsc::Sender<WorkerMessage>,
    events: broadcast::Sender<StreamerEvent>,
    stats: Arc<QueueStats>,
    capacity: usize,
}

impl StreamController {
    /// Move `streamer` onto a new worker thread.
    pub fn spawn(streamer: Streamer, queue_capacity: usize) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (controller, rx) = Self::channel(streamer.event_sender(), queue_capacity);
        let handle = std::thread::Builder::new()
            .name("stream-worker".into())
            .spawn(move || run_worker(streamer, rx))?;
        info!(queue_capacity, "Stream worker started");
        Ok((controller, handle))
    }

    fn channel(
        events: broadcast::Sender<StreamerEvent>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<WorkerMessage>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let controller = Self {
            tx,
            events,
            stats: Arc::new(QueueStats::default()),
            capacity,
        };
        (controller, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamerEvent> {
        self.events.subscribe()
    }

    /// Queue capture PCM without blocking. Returns false if the chunk was
    /// dropped.
    pub fn push_pcm(&self, pcm: Vec<u8>) -> bool {
        if pcm.is_empty() {
            return true;
        }
        let len = pcm.len() as u64;
        match self.tx.try_send(WorkerMessage::Pcm(pcm)) {
            Ok(()) => {
                self.stats.chunks_queued.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_queued.fetch_add(len, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.stats.chunks_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(dropped, "Stream queue full, dropping PCM chunk");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Start streaming, optionally to a new target.
    pub async fn start(&self, target: Option<StreamTarget>) -> Result<StreamerStatus, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerMessage::Start { target, reply }).await?;
        rx.await.map_err(|_| StreamError::WorkerGone)?
    }

    pub async fn stop(&self) -> Result<StreamerStatus, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerMessage::Stop { reply }).await?;
        rx.await.map_err(|_| StreamError::WorkerGone)
    }

    pub async fn status(&self) -> Result<StreamerStatus, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerMessage::Status { reply }).await?;
        rx.await.map_err(|_| StreamError::WorkerGone)
    }

    /// Replace encoder settings and the default target. Applies from the
    /// next start.
    pub async fn configure(&self, settings: StreamSettings, target: StreamTarget) -> Result<(), StreamError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerMessage::Configure {
            settings,
            target,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StreamError::WorkerGone)
    }

    pub fn queue_stats(&self) -> QueueSnapshot {
        QueueSnapshot {
            capacity: self.capacity,
            chunks_queued: self.stats.chunks_queued.load(Ordering::Relaxed),
            chunks_dropped: self.stats.chunks_dropped.load(Ordering::Relaxed),
            bytes_queued: self.stats.bytes_queued.load(Ordering::Relaxed),
        }
    }

    async fn send(&self, message: WorkerMessage) -> Result<(), StreamError> {
        self.tx.send(message).await.map_err(|_| StreamError::WorkerGone)
    }
}

fn run_worker(mut streamer: Streamer, mut rx: mpsc::Receiver<WorkerMessage>) {
    while let Some(message) = rx.blocking_recv() {
        match message {
            WorkerMessage::Pcm(pcm) => streamer.push_pcm(&pcm),
            WorkerMessage::Start { target, reply } => {
                if let Some(target) = target {
                    if !streamer.is_running() {
                        streamer.set_target(target);
                    }
                }
                let result = streamer.start().map(|()| streamer.status());
                let _ = reply.send(result);
            }
            WorkerMessage::Stop { reply } => {
                streamer.stop();
                let _ = reply.send(streamer.status());
            }
            WorkerMessage::Status { reply } => {
                let _ = reply.send(streamer.status());
            }
            WorkerMessage::Configure {
                settings,
                target,
                reply,
            } => {
                streamer.set_settings(settings);
                if !streamer.is_running() {
                    streamer.set_target(target);
                }
                let _ = reply.send(());
            }
        }
    }
    debug!("Stream worker channel closed");
    streamer.stop();
    info!("Stream worker stopped");
}
