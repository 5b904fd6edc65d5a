//! # Activity Log
//!
//! Operator-facing trail of what each module did: one plain-text file per
//! module (plus one for the orchestrator) under the log directory, one line
//! per event:
//!
//! ```text
//! 2025-03-14T09:26:53Z [OK] item 1042: enriched listing
//! ```
//!
//! Files are append-only; [`ActivityLog::clear_all`] truncates them.

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::OrchestratorError;

const LOG_EXTENSION: &str = "log";

/// Event marker written between brackets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivityEvent {
    Start,
    Stop,
    Ok,
    Fail,
    Crash,
    Stuck,
    Recovered,
    Info,
}

impl ActivityEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityEvent::Start => "START",
            ActivityEvent::Stop => "STOP",
            ActivityEvent::Ok => "OK",
            ActivityEvent::Fail => "FAIL",
            ActivityEvent::Crash => "CRASH",
            ActivityEvent::Stuck => "STUCK",
            ActivityEvent::Recovered => "RECOVERED",
            ActivityEvent::Info => "INFO",
        }
    }
}

impl fmt::Display for ActivityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ActivityLog {
    dir: PathBuf,
}

impl ActivityLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `name`. Characters outside `[A-Za-z0-9_.-]` become `_`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.{LOG_EXTENSION}"))
    }

    pub fn format_line(event: ActivityEvent, message: &str) -> String {
        format!(
            "{} [{}] {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            event,
            message.replace('\n', " ")
        )
    }

    fn io_error(path: &Path, e: std::io::Error) -> OrchestratorError {
        OrchestratorError::ActivityLog(format!("{}: {e}", path.display()))
    }

    /// Append one event line to `name`'s log
    pub async fn append(&self, name: &str, event: ActivityEvent, message: &str) -> Result<(), OrchestratorError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?;

        let path = self.path_for(name);
        let mut line = Self::format_line(event, message);
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Self::io_error(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Self::io_error(&path, e))?;
        file.flush().await.map_err(|e| Self::io_error(&path, e))
    }

    /// Append, logging instead of failing
    pub async fn record(&self, name: &str, event: ActivityEvent, message: &str) {
        if let Err(e) = self.append(name, event, message).await {
            warn!(log = %name, event = %event, error = %e, "Failed to write activity log");
        }
    }

    /// Append from synchronous code by spawning onto the current runtime.
    /// Dropped with a warning when called outside a runtime.
    pub fn record_detached(self: &Arc<Self>, name: &str, event: ActivityEvent, message: String) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let log = Arc::clone(self);
                let name = name.to_string();
                handle.spawn(async move {
                    log.record(&name, event, &message).await;
                });
            }
            Err(_) => warn!(log = %name, event = %event, "No runtime available; activity line dropped"),
        }
    }

    /// Last `limit` lines of `name`'s log, oldest first. A missing log is empty.
    pub async fn tail(&self, name: &str, limit: usize) -> Result<Vec<String>, OrchestratorError> {
        let path = self.path_for(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error(&path, e)),
        };

        let lines: Vec<&str> = content.lines().collect();
        let skip = lines.len().saturating_sub(limit);
        Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
    }

    /// Truncate every log file. Returns how many files were cleared.
    pub async fn clear_all(&self) -> Result<usize, OrchestratorError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Self::io_error(&self.dir, e)),
        };

        let mut cleared = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(LOG_EXTENSION) {
                tokio::fs::write(&path, b"")
                    .await
                    .map_err(|e| Self::io_error(&path, e))?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}
