//! # Session Recorder
//!
//! Archives the raw compressed bytes of each talk burst to its own file,
//! driven by the session flag on every audio frame.
//!
//! ## State machine:
//! | Flag | Idle | Recording |
//! |------|------|-----------|
//! | start | open a new file, write | close the stale file, open a new one, write |
//! | continue | open a new file, write | write |
//! | end | ignore | write, close |
//! | other | ignore | ignore |
//!
//! Files are named `recv_audio_<yyyyMMdd_HHmmss>.<ext>`. Open and write
//! failures are logged; they never stop playback.

use crate::audio::frame::SessionFlag;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Recorder state. A burst owns its file handle until it ends.
#[derive(Debug)]
pub enum RecorderState {
    Idle,
    Recording {
        file: File,
        path: PathBuf,
        id: Uuid,
        bytes: u64,
    },
}

/// A finished burst, returned when its file is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub id: Uuid,
    pub path: PathBuf,
    pub bytes: u64,
}

pub struct SessionRecorder {
    dir: PathBuf,
    extension: String,
    enabled: bool,
    state: RecorderState,
}

impl SessionRecorder {
    pub fn new(dir: impl Into<PathBuf>, extension: &str, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
            enabled,
            state: RecorderState::Idle,
        }
    }

    /// Directory of the running executable, or the working directory if
    /// that cannot be determined.
    pub fn default_dir() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn state(&self) -> &RecorderState {
        &self.state
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, RecorderState::Recording { .. })
    }

    /// Apply one frame to the state machine. Returns the recording that was
    /// closed by this frame, if any.
    pub fn handle(&mut self, flag: SessionFlag, payload: &[u8]) -> Option<Recording> {
        if !self.enabled {
            return None;
        }

        match flag {
            SessionFlag::Start => {
                let stale = self.close();
                if let Some(stale) = &stale {
                    warn!(path = %stale.path.display(), "New burst started before the previous one ended");
                }
                self.open();
                self.write(payload);
                stale
            }
            SessionFlag::Continue => {
                if !self.is_recording() {
                    debug!("Burst start was missed, opening a recording mid-burst");
                    self.open();
                }
                self.write(payload);
                None
            }
            SessionFlag::End => {
                if !self.is_recording() {
                    return None;
                }
                self.write(payload);
                self.close()
            }
            SessionFlag::Other(value) => {
                debug!(flag = value, "Unknown session flag, recorder untouched");
                None
            }
        }
    }

    /// Flush and close the open file, if any.
    pub fn close(&mut self) -> Option<Recording> {
        match std::mem::replace(&mut self.state, RecorderState::Idle) {
            RecorderState::Idle => None,
            RecorderState::Recording {
                mut file,
                path,
                id,
                bytes,
            } => {
                if let Err(e) = file.flush() {
                    warn!(path = %path.display(), error = %e, "Failed to flush recording");
                }
                info!(recording_id = %id, path = %path.display(), bytes, "Recording closed");
                Some(Recording { id, path, bytes })
            }
        }
    }

    fn open(&mut self) {
        match self.create_file() {
            Ok((file, path)) => {
                let id = Uuid::new_v4();
                info!(recording_id = %id, path = %path.display(), "Recording started");
                self.state = RecorderState::Recording {
                    file,
                    path,
                    id,
                    bytes: 0,
                };
            }
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to open recording file");
                self.state = RecorderState::Idle;
            }
        }
    }

    fn create_file(&self) -> io::Result<(File, PathBuf)> {
        fs::create_dir_all(&self.dir)?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();

        let mut suffix = 0u32;
        loop {
            let name = if suffix == 0 {
                format!("recv_audio_{stamp}.{}", self.extension)
            } else {
                format!("recv_audio_{stamp}_{suffix}.{}", self.extension)
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((file, path)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && suffix < 1000 => suffix += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&mut self, payload: &[u8]) {
        if let RecorderState::Recording {
            file, path, bytes, ..
        } = &mut self.state
        {
            match file.write_all(payload) {
                Ok(()) => *bytes += payload.len() as u64,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write recording"),
            }
        }
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        self.close();
    }
}
