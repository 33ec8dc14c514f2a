use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime_env::{Device, Mirrors};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallState {
    #[default]
    NotInstalled,
    Started,
    Installed,
    /// Legacy-format migration pending; collapses into `Installed`
    Upgraded,
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotInstalled => "not-installed",
            Self::Started => "started",
            Self::Installed => "installed",
            Self::Upgraded => "upgraded",
        })
    }
}

impl InstallState {
    pub fn can_transition(&self, to: InstallState) -> bool {
        matches!(
            (self, to),
            (Self::NotInstalled, Self::Started)
                // interrupted install re-runs from the top
                | (Self::Started, Self::Started)
                | (Self::Started, Self::Installed)
                | (Self::Upgraded, Self::Installed)
        )
    }

    pub fn is_installed(&self) -> bool {
        matches!(self, Self::Installed | Self::Upgraded)
    }
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid install state transition: {0} -> {1}")]
    InvalidTransition(InstallState, InstallState),
}

impl TransitionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidTransition(..) => "INVALID_TRANSITION",
        }
    }
}

/// Persisted key-value record describing one installation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallRecord {
    pub base_path: Option<PathBuf>,
    pub state: InstallState,
    pub device: Option<Device>,
    pub mirrors: Mirrors,
    pub migration_source: Option<PathBuf>,
    /// Unix timestamp (seconds) of the last transition
    pub updated_at: Option<u64>,
}

impl InstallRecord {
    /// Move to `to`, stamping the time of the change.
    pub fn transition(&mut self, to: InstallState) -> Result<(), TransitionError> {
        if !self.state.can_transition(to) {
            return Err(TransitionError::InvalidTransition(self.state, to));
        }
        tracing::info!("Install state transition: {} -> {}", self.state, to);
        self.state = to;
        self.updated_at = Some(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        );
        Ok(())
    }
}
