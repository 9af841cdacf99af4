//! # Transport Adapter
//!
//! WebSocket client that delivers complete binary wire messages to the
//! receive pipeline.
//!
//! ## Connection:
//! - connects to `<url>/<client_id>`
//! - sends a text `"ping"` every `heartbeat_secs`; `"pong"` replies are ignored
//! - every binary message is forwarded unchanged, in arrival order
//! - on disconnect, reconnects with exponential backoff (1 s doubling up to
//!   `reconnect_max_secs`)

use crate::config::TransportConfig;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, trace, warn};

const HEARTBEAT_TEXT: &str = "ping";
const HEARTBEAT_REPLY: &str = "pong";

#[derive(Debug, Default)]
pub struct TransportStats {
    pub connects: AtomicU64,
    pub disconnects: AtomicU64,
    pub binary_messages: AtomicU64,
    pub binary_bytes: AtomicU64,
    pub heartbeats_sent: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportSnapshot {
    pub connects: u64,
    pub disconnects: u64,
    pub binary_messages: u64,
    pub binary_bytes: u64,
    pub heartbeats_sent: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            binary_messages: self.binary_messages.load(Ordering::Relaxed),
            binary_bytes: self.binary_bytes.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
        }
    }
}

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Server closed or the socket failed; reconnect.
    Closed,
    /// Shutdown was requested.
    Shutdown,
    /// The receive pipeline is gone; nothing left to deliver to.
    PipelineGone,
}

/// `<base>/<client_id>`, tolerating a trailing slash on `base`.
pub fn endpoint_url(base: &str, client_id: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), client_id)
}

/// Delay before reconnect attempt `attempt` (0-based): 1 s, 2 s, 4 s ... capped.
pub fn backoff_delay(attempt: u32, max_secs: u64) -> Duration {
    let secs = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    Duration::from_secs(secs.min(max_secs.max(1)))
}

/// Connect, forward, reconnect, until shutdown or the pipeline goes away.
pub async fn run_transport(
    config: TransportConfig,
    client_id: String,
    tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<TransportStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = endpoint_url(&config.url, &client_id);
    let heartbeat = Duration::from_secs(config.heartbeat_secs.max(1));
    let mut attempt: u32 = 0;

    info!(url = %url, "Transport starting");
    loop {
        if *shutdown.borrow() {
            break;
        }

        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                attempt = 0;
                stats.connects.fetch_add(1, Ordering::Relaxed);
                info!(url = %url, "Transport connected");

                let end = run_session(ws, heartbeat, tx.clone(), stats.clone(), shutdown.clone()).await;
                stats.disconnects.fetch_add(1, Ordering::Relaxed);
                match end {
                    SessionEnd::Closed => warn!(url = %url, "Transport disconnected"),
                    SessionEnd::Shutdown => break,
                    SessionEnd::PipelineGone => {
                        warn!("Receive pipeline closed, stopping transport");
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(url = %url, error = %e, attempt, "Transport connect failed");
            }
        }

        let delay = backoff_delay(attempt, config.reconnect_max_secs);
        attempt = attempt.saturating_add(1);
        debug!(delay_secs = delay.as_secs(), "Reconnecting after delay");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("Transport stopped");
}

/// Drive one connected socket until it closes.
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    heartbeat: Duration,
    tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<TransportStats>,
    mut shutdown: watch::Receiver<bool>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    let mut ticker = tokio::time::interval(heartbeat);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = write.send(Message::Text(HEARTBEAT_TEXT.to_string())).await {
                    warn!(error = %e, "Heartbeat send failed");
                    return SessionEnd::Closed;
                }
                stats.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
            }
            message = read.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    stats.binary_messages.fetch_add(1, Ordering::Relaxed);
                    stats.binary_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                    if tx.send(data).await.is_err() {
                        return SessionEnd::PipelineGone;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if text == HEARTBEAT_REPLY {
                        trace!("Heartbeat acknowledged");
                    } else {
                        debug!(len = text.len(), "Ignoring text message");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(frame = ?frame, "Server closed the connection");
                    return SessionEnd::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Transport read failed");
                    return SessionEnd::Closed;
                }
                None => return SessionEnd::Closed,
            },
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn socket_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    #[test]
    fn endpoint_appends_client_id() {
        assert_eq!(endpoint_url("ws://h:9000/ws", "c1"), "ws://h:9000/ws/c1");
        assert_eq!(endpoint_url("ws://h:9000/ws/", "c1"), "ws://h:9000/ws/c1");
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let delays: Vec<u64> = (0..6).map(|a| backoff_delay(a, 10).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(backoff_delay(200, 10).as_secs(), 10);
        assert_eq!(backoff_delay(0, 0).as_secs(), 1);
    }

    #[tokio::test]
    async fn binary_messages_are_forwarded_in_order() {
        let (client, mut server) = socket_pair().await;
        let (tx, mut rx) = mpsc::channel(8);
        let stats = Arc::new(TransportStats::default());
        let (_stop, stop_rx) = watch::channel(false);
        let session = tokio::spawn(run_session(
            client,
            Duration::from_secs(60),
            tx,
            stats.clone(),
            stop_rx,
        ));

        server.send(Message::Binary(vec![6, 0, 1])).await.unwrap();
        server.send(Message::Text("pong".to_string())).await.unwrap();
        server.send(Message::Binary(vec![6, 2])).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![6, 0, 1]);
        assert_eq!(rx.recv().await.unwrap(), vec![6, 2]);

        server.send(Message::Close(None)).await.unwrap();
        assert_eq!(session.await.unwrap(), SessionEnd::Closed);
        assert_eq!(stats.snapshot().binary_messages, 2);
        assert_eq!(stats.snapshot().binary_bytes, 5);
    }

    #[tokio::test]
    async fn heartbeat_is_a_text_ping() {
        let (client, mut server) = socket_pair().await;
        let (tx, _rx) = mpsc::channel(1);
        let (_stop, stop_rx) = watch::channel(false);
        let stats = Arc::new(TransportStats::default());
        let session = tokio::spawn(run_session(
            client,
            Duration::from_millis(20),
            tx,
            stats.clone(),
            stop_rx,
        ));

        let first = server.next().await.unwrap().unwrap();
        assert_eq!(first, Message::Text("ping".to_string()));

        drop(server);
        assert_eq!(session.await.unwrap(), SessionEnd::Closed);
        assert!(stats.snapshot().heartbeats_sent >= 1);
    }

    #[tokio::test]
    async fn shutdown_ends_the_session() {
        let (client, _server) = socket_pair().await;
        let (tx, _rx) = mpsc::channel(1);
        let (stop, stop_rx) = watch::channel(false);
        let session = tokio::spawn(run_session(
            client,
            Duration::from_secs(60),
            tx,
            Arc::new(TransportStats::default()),
            stop_rx,
        ));
        stop.send(true).unwrap();
        assert_eq!(session.await.unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn closed_pipeline_stops_forwarding() {
        let (client, mut server) = socket_pair().await;
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (_stop, stop_rx) = watch::channel(false);
        let session = tokio::spawn(run_session(
            client,
            Duration::from_secs(60),
            tx,
            Arc::new(TransportStats::default()),
            stop_rx,
        ));
        server.send(Message::Binary(vec![6])).await.unwrap();
        assert_eq!(session.await.unwrap(), SessionEnd::PipelineGone);
    }
}
