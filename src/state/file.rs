//! # JSON File Backend
//!
//! Keeps the whole cycle document in one human-readable JSON file. Every
//! write replaces the document atomically: the new content goes to a sibling
//! temp file which is then renamed over the original, so a crash mid-write
//! leaves the previous version intact.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::backend::StateBackend;
use super::types::CycleState;
use crate::constants::CycleStatus;
use crate::error::{StateError, StateResult};

#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(path: &Path, error: std::io::Error) -> StateError {
        StateError::Io {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Read whatever cycle the file holds, regardless of status
    pub async fn read(&self) -> StateResult<Option<CycleState>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(&self.path, e)),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Move an unreadable state file aside so a fresh cycle can be written
    pub async fn quarantine(&self) -> StateResult<PathBuf> {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
        let target = self.path.with_file_name(name);
        tokio::fs::rename(&self.path, &target)
            .await
            .map_err(|e| Self::io_error(&self.path, e))?;
        warn!(from = %self.path.display(), to = %target.display(), "Quarantined unreadable state file");
        Ok(target)
    }

    async fn write(&self, cycle: &CycleState) -> StateResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_error(parent, e))?;
        }

        let json = serde_json::to_string_pretty(cycle)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, json)
            .await
            .map_err(|e| Self::io_error(&temp, e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| Self::io_error(&self.path, e))?;

        debug!(path = %self.path.display(), cycle_id = %cycle.cycle_id, "State file written");
        Ok(())
    }
}

#[async_trait]
impl StateBackend for JsonFileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load_running_cycle(&self) -> StateResult<Option<CycleState>> {
        Ok(self
            .read()
            .await?
            .filter(|cycle| cycle.status == CycleStatus::Running))
    }

    async fn save_cycle(&self, cycle: &CycleState) -> StateResult<()> {
        self.write(cycle).await
    }

    async fn save_module(&self, cycle: &CycleState, _module: &str) -> StateResult<()> {
        self.write(cycle).await
    }

    async fn clear(&self) -> StateResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(&self.path, e)),
        }
    }
}
