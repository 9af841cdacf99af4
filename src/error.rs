//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **Pipeline errors** (`FrameError`, `CodecError`, `ResampleError`,
//!   `StreamError`): typed failures raised inside the audio pipelines. They are
//!   logged and converted into skip-and-continue behaviour at the pipeline
//!   boundary; only `StreamError` ever reaches a caller (from `start()`).
//! - **`AppError`**: failures of the local control API, converted into JSON
//!   HTTP responses.
//!
//! ## Error Conversion:
//! - `From<StreamError> for AppError` maps engine refusals onto HTTP statuses
//! - `From<anyhow::Error>`, `From<serde_json::Error>`, `From<config::ConfigError>`
//!   let handlers use `?` on setup and parsing code

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::io;
use thiserror::Error;

/// Failure to parse one inbound wire frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty message")]
    Empty,

    #[error("truncated frame: {field} needs {needed} bytes, {available} left")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },
}

/// Failure inside an audio decoder or encoder.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("codec already flushed")]
    Flushed,

    #[error("decoder backend: {0}")]
    Backend(String),
}

/// Failure to configure or run a resampler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResampleError {
    #[error("invalid resampler configuration: {0}")]
    InvalidSpec(String),

    #[error("{samples} samples is not a whole number of {channels}-channel frames")]
    Misaligned { samples: usize, channels: u16 },

    #[error("input is {got}, resampler was configured for {expected}")]
    FormatMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("resampler: {0}")]
    Engine(String),
}

/// Failure of the capture/encode/mux engine or its output.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("streaming is already running")]
    AlreadyRunning,

    #[error("no stream key configured")]
    MissingStreamKey,

    #[error("invalid stream target: {0}")]
    InvalidTarget(String),

    #[error("encoder: {0}")]
    Codec(#[from] CodecError),

    #[error("resampler: {0}")]
    Resample(#[from] ResampleError),

    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("rtmp: {0}")]
    Protocol(String),

    #[error("container: {0}")]
    Container(String),

    #[error("streaming worker is not running")]
    WorkerGone,
}

impl StreamError {
    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        StreamError::Transport {
            context: context.into(),
            source,
        }
    }
}

/// Errors returned by the control API.
///
/// ## Error Categories:
/// - **Internal**: unexpected server-side failures (500)
/// - **BadRequest**: malformed request bodies (400)
/// - **NotFound**: unknown resources (404)
/// - **Conflict**: the request clashes with the current pipeline state (409)
/// - **Unavailable**: a pipeline worker is not reachable (503)
/// - **ConfigError**: configuration loading problems (500)
/// - **ValidationError**: values rejected by validation (400)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// JSON body shape shared by every error response:
///
/// ```json
/// { "error": { "type": "conflict", "message": "...", "timestamp": "..." } }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Malformed JSON is the client's fault, so it maps to 400 rather than 500.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<StreamError> for AppError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::AlreadyRunning => AppError::Conflict(err.to_string()),
            StreamError::MissingStreamKey | StreamError::InvalidTarget(_) => {
                AppError::ValidationError(err.to_string())
            }
            StreamError::WorkerGone => AppError::Unavailable(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Shorthand for control-API results.
pub type AppResult<T> = Result<T, AppError>;
