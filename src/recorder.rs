//! Asciicast v2 session recording
//!
//! One recorder per proxied channel. The file is only created once an
//! interactive session actually starts (`shell` or `exec`) and produces
//! bytes; a header line is written exactly once before the first event.
//! Recording failures degrade silently: the proxy keeps relaying, the
//! recorder just stops.
//!
//! Format: first line is a JSON header object, every following line is a
//! `[seconds_since_start, "i"|"o", data]` JSON array.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::tag::FlowDirection;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recording already started")]
    AlreadyStarted,

    #[error("recording already finished")]
    Finished,

    #[error("terminal parameters already set")]
    PtyAlreadySet,
}

/// Terminal parameters captured from a `pty-req`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PtyParams {
    pub term: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Serialize)]
struct Header<'a> {
    version: u32,
    width: u32,
    height: u32,
    timestamp: u64,
    env: HeaderEnv<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a str>,
}

#[derive(Serialize)]
struct HeaderEnv<'a> {
    #[serde(rename = "TERM")]
    term: &'a str,
}

struct Inner {
    path: PathBuf,
    tag: String,
    max_bytes: u64,
    written: u64,
    file: Option<File>,
    header_written: bool,
    done: bool,
    pty: Option<PtyParams>,
    command: Option<String>,
    started_wall: Option<SystemTime>,
    started_instant: Option<Instant>,
}

/// Append-only asciicast writer, internally serialized.
///
/// The lock is only held across in-memory state changes and local file
/// writes, never across network I/O.
pub struct SessionRecorder {
    inner: Mutex<Inner>,
}

impl SessionRecorder {
    pub fn new(path: PathBuf, tag: String, max_bytes: u64) -> Self {
        SessionRecorder {
            inner: Mutex::new(Inner {
                path,
                tag,
                max_bytes,
                written: 0,
                file: None,
                header_written: false,
                done: false,
                pty: None,
                command: None,
                started_wall: None,
                started_instant: None,
            }),
        }
    }

    /// Capture terminal type and geometry. A channel gets at most one PTY.
    pub fn set_pty(&self, params: PtyParams) -> Result<(), RecorderError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pty.is_some() {
            return Err(RecorderError::PtyAlreadySet);
        }
        inner.pty = Some(params);
        Ok(())
    }

    /// Arm the recorder: events will be written from now on. `command` is
    /// the exec command line, or `None` for a plain shell.
    pub fn start(&self, command: Option<String>) -> Result<(), RecorderError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.done {
            return Err(RecorderError::Finished);
        }
        if inner.started_instant.is_some() {
            return Err(RecorderError::AlreadyStarted);
        }
        inner.command = command;
        inner.started_wall = Some(SystemTime::now());
        inner.started_instant = Some(Instant::now());
        Ok(())
    }

    /// Append one event. A no-op before `start` and after the recorder is
    /// done; never fails the caller. Empty payloads are skipped.
    pub fn write(&self, direction: FlowDirection, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.done || inner.started_instant.is_none() {
            return;
        }

        if inner.file.is_none() && !inner.open_file() {
            return;
        }
        if !inner.header_written && !inner.write_header() {
            return;
        }

        let elapsed = inner
            .started_instant
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default();
        let event = (
            elapsed,
            direction.cast_letter(),
            String::from_utf8_lossy(bytes),
        );
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                debug!("[{}] recording event encode failed: {}", inner.tag, err);
                inner.finish();
                return;
            }
        };

        // The cap covers event lines; reaching it ends the recording but
        // never the channel.
        let line_bytes = line.len() as u64 + 1;
        if inner.written + line_bytes > inner.max_bytes {
            debug!("[{}] recording cap reached, closing", inner.tag);
            inner.finish();
            return;
        }

        let result = match inner.file.as_mut() {
            Some(file) => writeln!(file, "{}", line),
            None => return,
        };
        match result {
            Ok(()) => inner.written += line_bytes,
            Err(err) => {
                debug!("[{}] recording write failed: {}", inner.tag, err);
                inner.finish();
            }
        }
    }

    /// Close the recording. Further writes are dropped.
    pub fn close(&self) {
        self.inner.lock().unwrap().finish();
    }

    /// Whether the recorder has been armed by a shell/exec request.
    pub fn started(&self) -> bool {
        self.inner.lock().unwrap().started_instant.is_some()
    }
}

impl Inner {
    fn open_file(&mut self) -> bool {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if let Err(err) = DirBuilder::new().recursive(true).mode(0o700).create(parent) {
                    debug!("[{}] recording dir create failed: {}", self.tag, err);
                    self.finish();
                    return false;
                }
            }
        }
        match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
        {
            Ok(file) => {
                info!("[{}] Recording to {}", self.tag, self.path.display());
                self.file = Some(file);
                true
            }
            Err(err) => {
                debug!("[{}] recording open failed: {}", self.tag, err);
                self.finish();
                false
            }
        }
    }

    fn write_header(&mut self) -> bool {
        let (width, height, term) = match &self.pty {
            Some(pty) => (pty.width, pty.height, pty.term.as_str()),
            None => (0, 0, ""),
        };
        let timestamp = self
            .started_wall
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let header = Header {
            version: 2,
            width,
            height,
            timestamp,
            env: HeaderEnv { term },
            command: self.command.as_deref(),
        };
        let line = match serde_json::to_string(&header) {
            Ok(line) => line,
            Err(err) => {
                debug!("[{}] recording header encode failed: {}", self.tag, err);
                self.finish();
                return false;
            }
        };
        let result = match self.file.as_mut() {
            Some(file) => writeln!(file, "{}", line),
            None => return false,
        };
        if let Err(err) = result {
            debug!("[{}] recording header write failed: {}", self.tag, err);
            self.finish();
            return false;
        }
        self.header_written = true;
        true
    }

    fn finish(&mut self) {
        self.done = true;
        self.file = None;
    }
}

/// Recording file path for a channel: tag plus an RFC3339 timestamp inside
/// the log directory, with `:` made filesystem-friendly.
pub fn cast_path(log_dir: &Path, tag: &str) -> PathBuf {
    let stamp = Utc::now()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', "-");
    log_dir.join(format!("{}-{}.cast", tag.replace(':', "-"), stamp))
}
