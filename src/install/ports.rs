//! Collaborator seams of the installation flow.
//!
//! The flow only talks to these traits; the binary wires console/filesystem
//! implementations, tests wire in-memory ones.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Result;

use super::state::InstallRecord;
use super::validation::ValidationReport;
use crate::runtime_env::{Device, EnvError, Mirrors, RequirementsStatus, RuntimeEnvironment};
use crate::shell::ChannelSpawner;

/// Answers collected by the first-run wizard.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallOptions {
    pub base_path: PathBuf,
    pub device: Device,
    pub mirrors: Mirrors,
    /// Previous installation to copy user data and models from
    pub migration_source: Option<PathBuf>,
}

/// What the user asked the troubleshooter to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TroubleshootRequest {
    Recheck,
    ReinstallRequirements,
    ResetEnvironment,
    ClearCache,
}

impl FromStr for TroubleshootRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "recheck" | "r" => Ok(Self::Recheck),
            "reinstall" | "reinstall-requirements" => Ok(Self::ReinstallRequirements),
            "reset" | "reset-environment" => Ok(Self::ResetEnvironment),
            "clear-cache" | "cache" => Ok(Self::ClearCache),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// Key-value persistence of the install record.
pub trait StateStore {
    /// `None` when nothing has been persisted yet.
    fn load(&self) -> Result<Option<InstallRecord>>;
    fn save(&self, record: &InstallRecord) -> Result<()>;
}

#[allow(async_fn_in_trait)]
pub trait InstallUi {
    async fn collect_options(&mut self) -> Result<InstallOptions>;

    async fn present_report(&mut self, report: &ValidationReport);

    async fn report_error(&mut self, error: &anyhow::Error);

    /// Blocks until the user picks an action. An error ends the flow.
    async fn wait_for_request(&mut self) -> Result<TroubleshootRequest>;
}

/// Filesystem work around the environment itself.
#[allow(async_fn_in_trait)]
pub trait InstallHost {
    /// Create the data directories and seed default config.
    async fn prepare_directories(&mut self, base_path: &Path) -> Result<()>;

    async fn migrate_user_data(&mut self, from: &Path, to: &Path) -> Result<()>;

    /// One-time conversion of a legacy on-disk layout.
    async fn migrate_legacy_format(&mut self, base_path: &Path) -> Result<()>;
}

/// The runtime environment as the installation flow sees it.
#[allow(async_fn_in_trait)]
pub trait RuntimeOps {
    fn exists(&self) -> bool;

    fn python_path(&self) -> PathBuf;

    /// Whether the managed installer itself can be executed.
    async fn installer_available(&self) -> bool;

    async fn create(&mut self) -> Result<(), EnvError>;

    async fn has_requirements(&self) -> Result<RequirementsStatus, EnvError>;

    async fn reinstall_requirements(&mut self) -> Result<(), EnvError>;

    async fn recreate(&mut self) -> Result<(), EnvError>;

    async fn clear_cache(&self) -> Result<(), EnvError>;
}

impl<S: ChannelSpawner> RuntimeOps for RuntimeEnvironment<S> {
    fn exists(&self) -> bool {
        RuntimeEnvironment::exists(self)
    }

    fn python_path(&self) -> PathBuf {
        RuntimeEnvironment::python_path(self)
    }

    async fn installer_available(&self) -> bool {
        self.uv_version().await.is_ok()
    }

    async fn create(&mut self) -> Result<(), EnvError> {
        RuntimeEnvironment::create(self).await
    }

    async fn has_requirements(&self) -> Result<RequirementsStatus, EnvError> {
        RuntimeEnvironment::has_requirements(self).await
    }

    async fn reinstall_requirements(&mut self) -> Result<(), EnvError> {
        RuntimeEnvironment::reinstall_requirements(self).await
    }

    async fn recreate(&mut self) -> Result<(), EnvError> {
        RuntimeEnvironment::recreate(self).await
    }

    async fn clear_cache(&self) -> Result<(), EnvError> {
        RuntimeEnvironment::clear_cache(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requests() {
        assert_eq!("".parse(), Ok(TroubleshootRequest::Recheck));
        assert_eq!(" Reinstall ".parse(), Ok(TroubleshootRequest::ReinstallRequirements));
        assert_eq!("reset".parse(), Ok(TroubleshootRequest::ResetEnvironment));
        assert_eq!("clear-cache".parse(), Ok(TroubleshootRequest::ClearCache));
        assert!("format c:".parse::<TroubleshootRequest>().is_err());
    }
}
