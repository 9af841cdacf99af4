//! # Application State
//!
//! Shared state for the control API: configuration, HTTP metrics, handles to
//! the running pipelines and a log of streaming events.
//!
//! ## Locking:
//! Mutable pieces sit behind `Arc<RwLock<T>>`; snapshots are cloned out so no
//! lock is held while a response is serialized. A poisoned lock is recovered,
//! since every guarded value is plain data that stays consistent.

use crate::audio::playback::PlaybackStats;
use crate::audio::receiver::ReceiveStats;
use crate::config::AppConfig;
use crate::stream::controller::StreamController;
use crate::stream::streamer::StreamerEvent;
use crate::transport::TransportStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

/// Handles to the long-running pipelines.
#[derive(Clone)]
pub struct PipelineHandles {
    pub receive: Arc<ReceiveStats>,
    pub playback: Arc<PlaybackStats>,
    pub transport: Arc<TransportStats>,
    pub stream: StreamController,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub stream_events: Arc<RwLock<StreamEventLog>>,
    pub pipelines: PipelineHandles,
    pub start_time: Instant,
}

#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: `"<METHOD> <path>"`.
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// What the streaming engine has reported so far. `last_error` backs the
/// "error occurred" indicator.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StreamEventLog {
    pub sessions_started: u64,
    pub sessions_stopped: u64,
    pub errors: u64,
    pub last_url: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
}

impl StreamEventLog {
    pub fn record(&mut self, event: &StreamerEvent) {
        match event {
            StreamerEvent::Started { url } => {
                self.sessions_started += 1;
                self.last_url = Some(url.clone());
            }
            StreamerEvent::Stopped => self.sessions_stopped += 1,
            StreamerEvent::Log(message) => self.last_message = Some(message.clone()),
            StreamerEvent::Error(message) => {
                self.errors += 1;
                self.last_error = Some(message.clone());
                self.last_error_at = Some(Utc::now());
            }
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl AppState {
    pub fn new(config: AppConfig, pipelines: PipelineHandles) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            stream_events: Arc::new(RwLock::new(StreamEventLog::default())),
            pipelines,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released on return.
    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Replace the configuration if it validates.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *write(&self.config) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        write(&self.metrics).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        write(&self.metrics).error_count += 1;
    }

    /// Record one finished request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write(&self.metrics);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = read(&self.metrics);
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn stream_event_log(&self) -> StreamEventLog {
        read(&self.stream_events).clone()
    }

    pub fn record_stream_event(&self, event: &StreamerEvent) {
        write(&self.stream_events).record(event);
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Feed streaming events into the state until the engine goes away.
pub async fn watch_stream_events(state: AppState, mut events: broadcast::Receiver<StreamerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => state.record_stream_event(&event),
            Err(RecvError::Lagged(missed)) => debug!(missed, "Stream event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, `0.0..=1.0`.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
