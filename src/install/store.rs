use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::ports::StateStore;
use super::state::InstallRecord;

/// 설치 상태 저장소 - install-state.json 관리
pub struct JsonStateStore {
    file_path: PathBuf,
}

impl JsonStateStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<Option<InstallRecord>> {
        if !self.file_path.exists() {
            tracing::info!("Install state file does not exist, treating as a fresh install");
            return Ok(None);
        }

        let content = fs::read_to_string(&self.file_path)
            .with_context(|| format!("Failed to read {}", self.file_path.display()))?;
        let record: InstallRecord = serde_json::from_str(&content)
            .with_context(|| format!("Invalid install state in {}", self.file_path.display()))?;
        tracing::info!("Loaded install state '{}'", record.state);
        Ok(Some(record))
    }

    fn save(&self, record: &InstallRecord) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(record)?;
        fs::write(&self.file_path, content)
            .with_context(|| format!("Failed to write {}", self.file_path.display()))?;
        tracing::debug!("Saved install state '{}'", record.state);
        Ok(())
    }
}
