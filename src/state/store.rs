//! File-backed snapshot store.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::state::EngineSnapshot;
use crate::util::blocking;
use crate::Result;

/// Reads and writes one snapshot file.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash mid-write never leaves a truncated snapshot behind.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn save_sync(&self, snapshot: &EngineSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!(dir = %parent.display(), "creating state directory");
                fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(snapshot)?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, &self.path)?;
        debug!(
            path = %self.path.display(),
            tasks = snapshot.tasks.len(),
            agents = snapshot.agents.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Read the snapshot, or `None` if no file exists yet.
    pub fn load_sync(&self) -> Result<Option<EngineSnapshot>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "snapshot file not found");
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        let snapshot: EngineSnapshot = serde_json::from_str(&contents)?;
        snapshot.check_version()?;
        debug!(tasks = snapshot.tasks.len(), "snapshot loaded");
        Ok(Some(snapshot))
    }

    pub async fn save(&self, snapshot: EngineSnapshot) -> Result<()> {
        let store = self.clone();
        blocking(move || store.save_sync(&snapshot)).await
    }

    pub async fn load(&self) -> Result<Option<EngineSnapshot>> {
        let store = self.clone();
        blocking(move || store.load_sync()).await
    }
}
