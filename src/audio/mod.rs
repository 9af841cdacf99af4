//! # Audio Pipelines
//!
//! The receive path and the shared audio primitives.
//!
//! ## Receive path:
//! ```text
//! wire message -> frame -> recorder (raw payload to disk)
//!                       -> decoder -> resampler -> playback
//! ```
//!
//! ## Key Components:
//! - **frame**: wire frame parse/serialize
//! - **codec**: decoder/encoder traits with AAC, G.711 and PCM implementations
//! - **resampler**: streaming rate/layout/format conversion
//! - **decoder**: decode engine feeding the playback sink
//! - **playback**: playback sink and output thread
//! - **recorder**: per-burst session recorder
//! - **receiver**: wires the above together on a worker thread
//! - **capture**: microphone input (`device-audio` feature)

#[cfg(feature = "device-audio")]
pub mod capture;
pub mod codec;
pub mod decoder;
pub mod format;
pub mod frame;
pub mod playback;
pub mod receiver;
pub mod recorder;
pub mod resampler;
