//! # Live Streaming
//!
//! The send path: capture PCM is resampled, encoded and muxed into FLV, then
//! published over RTMP (or written to a local file).
//!
//! ## Layers:
//! - **controller**: worker thread and handle that own the engine
//! - **streamer**: capture/encode-mux state machine
//! - **output**: stream target, container output, transports
//! - **flv** / **rtmp** / **amf**: container and wire protocol

pub mod amf;
pub mod controller;
pub mod flv;
pub mod output;
pub mod rtmp;
pub mod streamer;

pub use controller::StreamController;
pub use output::{NetworkBackend, OutputProtocol, StreamTarget};
pub use streamer::{StreamSettings, Streamer, StreamerEvent, StreamerState, StreamerStatus};
