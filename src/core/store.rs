use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::pet::PetState;

/// Best-effort JSON file holding the last known pet state.
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

    /// Returns `Ok(None)` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<PetState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read pet state from {:?}", self.path))?;
        let state = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt pet state in {:?}", self.path))?;
        Ok(Some(state))
    }

    /// Writes to a sibling temp file first so a crash never leaves half a document behind.
    pub fn save(&self, state: &PetState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(state)?)
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move pet state into {:?}", self.path))?;
        Ok(())
    }
}
