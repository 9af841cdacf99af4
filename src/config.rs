//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (with `INTERCOM` prefix and `__` separator)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` for the control server
//! 2. Environment variables (`INTERCOM__STREAMING__HOST`, `INTERCOM__PLAYBACK__SAMPLE_RATE`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: control API bind address
//! - **transport**: WebSocket source of inbound wire frames
//! - **playback**: receive codec and playback format
//! - **recording**: session recorder output
//! - **streaming**: live-stream target and encoder

use crate::audio::codec::CodecKind;
use crate::stream::output::{OutputProtocol, StreamTarget};
use crate::stream::streamer::StreamSettings;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub playback: PlaybackConfig,
    pub recording: RecordingConfig,
    pub streaming: StreamingConfig,
}

/// Control API bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Inbound wire-frame connection.
///
/// ## Fields:
/// - `url`: WebSocket base URL; the client id is appended as the last path segment
/// - `client_id`: empty means a random id per process
/// - `queue_capacity`: messages buffered between the socket and the receive pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub enabled: bool,
    pub url: String,
    pub client_id: String,
    pub heartbeat_secs: u64,
    pub reconnect_max_secs: u64,
    pub queue_capacity: usize,
}

/// Receive-side decoding and playback.
///
/// ## Fields:
/// - `codec`: payload codec of inbound audio frames
/// - `sample_rate`: fixed playback rate everything is resampled to
/// - `pcm_sample_rate`: rate of inbound payloads when `codec` is `pcm`
/// - `queue_capacity`: converted chunks buffered ahead of the output device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub codec: CodecKind,
    pub sample_rate: u32,
    pub pcm_sample_rate: u32,
    pub queue_capacity: usize,
}

/// Session recorder. A missing directory means next to the executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub directory: Option<String>,
}

/// Live-stream target and encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub protocol: OutputProtocol,
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream_key: String,
    pub file_path: Option<String>,
    pub codec: CodecKind,
    pub bit_rate: u32,
    pub capture_sample_rate: u32,
    pub capture_channels: u16,
    pub queue_capacity: usize,
    pub connect_timeout_secs: u64,
    pub microphone: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            transport: TransportConfig {
                enabled: true,
                url: "ws://127.0.0.1:9000/ws".to_string(),
                client_id: String::new(),
                heartbeat_secs: 5,
                reconnect_max_secs: 10,
                queue_capacity: 256,
            },
            playback: PlaybackConfig {
                codec: CodecKind::Aac,
                sample_rate: 44100,
                pcm_sample_rate: 44100,
                queue_capacity: 64,
            },
            recording: RecordingConfig {
                enabled: true,
                directory: None,
            },
            streaming: StreamingConfig {
                protocol: OutputProtocol::Rtmp,
                host: "127.0.0.1".to_string(),
                port: crate::stream::rtmp::DEFAULT_PORT,
                app: "live".to_string(),
                stream_key: String::new(),
                file_path: None,
                codec: CodecKind::MuLaw,
                bit_rate: 128_000,
                capture_sample_rate: 44100,
                capture_channels: 1,
                queue_capacity: 64,
                connect_timeout_secs: 10,
                microphone: false,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `INTERCOM__STREAMING__HOST=10.0.0.5`: RTMP server
    /// - `INTERCOM__STREAMING__STREAM_KEY=stream_g1_u7`: stream key
    /// - `INTERCOM__TRANSPORT__URL=ws://server:9000/ws`: inbound frames
    /// - `HOST=0.0.0.0` / `PORT=3000`: control server
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("INTERCOM").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values no pipeline can run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.transport.enabled && self.transport.url.trim().is_empty() {
            return Err(anyhow::anyhow!("Transport URL cannot be empty"));
        }
        if self.transport.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Transport queue capacity must be greater than 0"));
        }

        if self.playback.sample_rate == 0 || self.playback.pcm_sample_rate == 0 {
            return Err(anyhow::anyhow!("Playback sample rates must be greater than 0"));
        }
        if self.playback.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Playback queue capacity must be greater than 0"));
        }

        let streaming = &self.streaming;
        if streaming.port == 0 {
            return Err(anyhow::anyhow!("Streaming port cannot be 0"));
        }
        if streaming.capture_sample_rate == 0 {
            return Err(anyhow::anyhow!("Capture sample rate must be greater than 0"));
        }
        if !(1..=2).contains(&streaming.capture_channels) {
            return Err(anyhow::anyhow!(
                "Capture channels must be 1 or 2, got {}",
                streaming.capture_channels
            ));
        }
        if streaming.bit_rate == 0 {
            return Err(anyhow::anyhow!("Streaming bit rate must be greater than 0"));
        }
        if streaming.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Streaming queue capacity must be greater than 0"));
        }
        if streaming.protocol == OutputProtocol::File && streaming.file_path.is_none() {
            return Err(anyhow::anyhow!("File streaming needs streaming.file_path"));
        }

        Ok(())
    }

    /// Apply a partial JSON update to the streaming and recording sections.
    ///
    /// Unknown keys are ignored; the result is validated before returning.
    /// For example `{"streaming": {"stream_key": "stream_g_u"}}` changes only
    /// the key.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(streaming) = partial_config.get("streaming") {
            let s = &mut self.streaming;
            if let Some(protocol) = streaming.get("protocol") {
                s.protocol = serde_json::from_value(protocol.clone())?;
            }
            if let Some(host) = streaming.get("host").and_then(|v| v.as_str()) {
                s.host = host.to_string();
            }
            if let Some(port) = streaming.get("port").and_then(|v| v.as_u64()) {
                s.port = u16::try_from(port)?;
            }
            if let Some(app) = streaming.get("app").and_then(|v| v.as_str()) {
                s.app = app.to_string();
            }
            if let Some(key) = streaming.get("stream_key").and_then(|v| v.as_str()) {
                s.stream_key = key.to_string();
            }
            if let Some(path) = streaming.get("file_path") {
                s.file_path = path.as_str().map(str::to_string);
            }
            if let Some(codec) = streaming.get("codec") {
                s.codec = serde_json::from_value(codec.clone())?;
            }
            if let Some(bit_rate) = streaming.get("bit_rate").and_then(|v| v.as_u64()) {
                s.bit_rate = u32::try_from(bit_rate)?;
            }
            if let Some(rate) = streaming.get("capture_sample_rate").and_then(|v| v.as_u64()) {
                s.capture_sample_rate = u32::try_from(rate)?;
            }
            if let Some(channels) = streaming.get("capture_channels").and_then(|v| v.as_u64()) {
                s.capture_channels = u16::try_from(channels)?;
            }
        }

        if let Some(recording) = partial_config.get("recording") {
            if let Some(enabled) = recording.get("enabled").and_then(|v| v.as_bool()) {
                self.recording.enabled = enabled;
            }
            if let Some(directory) = recording.get("directory") {
                self.recording.directory = directory.as_str().map(str::to_string);
            }
        }

        self.validate()?;
        Ok(())
    }
}

impl TransportConfig {
    /// Configured client id, or a fresh random one.
    pub fn resolve_client_id(&self) -> String {
        if self.client_id.trim().is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.client_id.clone()
        }
    }
}

impl RecordingConfig {
    pub fn directory_path(&self) -> PathBuf {
        self.directory
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(crate::audio::recorder::SessionRecorder::default_dir)
    }
}

impl StreamingConfig {
    pub fn settings(&self) -> StreamSettings {
        StreamSettings {
            codec: self.codec,
            bit_rate: self.bit_rate,
            capture_rate: self.capture_sample_rate,
            capture_channels: self.capture_channels,
        }
    }

    /// Default target; the stream key may still be empty.
    pub fn target(&self) -> StreamTarget {
        StreamTarget {
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port,
            app: self.app.clone(),
            stream_key: self.stream_key.clone(),
            file_path: self.file_path.as_deref().map(PathBuf::from),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.streaming.port, 1935);
        assert_eq!(config.streaming.app, "live");
        assert_eq!(config.transport.heartbeat_secs, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.streaming.capture_channels = 3;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.playback.sample_rate = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.streaming.protocol = OutputProtocol::File;
        assert!(config.validate().is_err());
        config.streaming.file_path = Some("out.flv".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"streaming": {"host": "10.0.0.5", "stream_key": "stream_g_u", "codec": "alaw"},
                       "recording": {"enabled": false}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.streaming.host, "10.0.0.5");
        assert_eq!(config.streaming.codec, CodecKind::ALaw);
        assert!(!config.recording.enabled);
        assert_eq!(config.streaming.port, 1935);
        assert_eq!(config.streaming.target().url(), "rtmp://10.0.0.5:1935/live/stream_g_u");
    }

    #[test]
    fn test_config_update_rejects_bad_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"streaming": {"port": 70000}}"#).is_err());
        assert!(config.update_from_json(r#"{"streaming": {"codec": "opus"}}"#).is_err());
        assert!(config.update_from_json("not json").is_err());
    }

    #[test]
    fn explicit_client_id_is_kept() {
        let mut transport = AppConfig::default().transport;
        assert!(!transport.resolve_client_id().is_empty());
        transport.client_id = "desk-7".into();
        assert_eq!(transport.resolve_client_id(), "desk-7");
    }
}
