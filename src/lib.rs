//! # intercom-audio
//!
//! Real-time push-to-talk audio: receive wire frames, record and play them;
//! capture, encode and publish a live stream; and a small control API over
//! both pipelines.
//!
//! ## Application Architecture:
//! - **audio**: frame codec, decode engine, playback, recorder, receive worker
//! - **stream**: capture/encode-mux engine, FLV, RTMP, stream worker
//! - **transport**: WebSocket client for inbound frames
//! - **config** / **state** / **health** / **handlers** / **middleware**: control API
//! - **error**: typed errors and HTTP error responses

pub mod audio;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod state;
pub mod stream;
pub mod transport;
