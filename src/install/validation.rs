//! Installation health report.
//!
//! Problems are data, not errors: every check lands in the report and the
//! troubleshooting loop decides what to do with it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ports::RuntimeOps;
use super::state::InstallRecord;
use crate::runtime_env::{Device, RequirementsStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checks: BTreeMap<String, CheckStatus>,
    /// Dependencies drifted in a recognised, repairable way
    pub package_upgrade: bool,
}

impl ValidationReport {
    pub fn set(&mut self, check: &str, status: CheckStatus) {
        self.checks.insert(check.to_string(), status);
    }

    pub fn get(&self, check: &str) -> Option<CheckStatus> {
        self.checks.get(check).copied()
    }

    /// Valid iff no check is an error.
    pub fn is_valid(&self) -> bool {
        !self.checks.values().any(|s| *s == CheckStatus::Error)
    }

    pub fn needs_package_upgrade(&self) -> bool {
        self.package_upgrade
    }

    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.checks
            .iter()
            .filter(|(_, s)| **s == CheckStatus::Error)
            .map(|(name, _)| name.as_str())
    }
}

fn status(ok: bool) -> CheckStatus {
    if ok {
        CheckStatus::Ok
    } else {
        CheckStatus::Error
    }
}

/// Default checks for an installation.
pub async fn validate_installation<R: RuntimeOps>(
    record: &InstallRecord,
    app_root: &Path,
    runtime: &R,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    let base_ok = record.base_path.as_deref().map(Path::is_dir).unwrap_or(false);
    report.set("base_path", status(base_ok));
    report.set("app_root", status(app_root.is_dir()));
    report.set("uv", status(runtime.installer_available().await));

    if record.device == Some(Device::Unsupported) {
        // environment is managed by hand; its contents are not ours to judge
        report.set("venv_directory", CheckStatus::Warning);
        tracing::info!("Validation: manual environment setup, skipping Python checks");
        return report;
    }

    let venv_ok = runtime.exists();
    report.set("venv_directory", status(venv_ok));
    if !venv_ok {
        report.set("python", CheckStatus::Error);
        report.set("python_packages", CheckStatus::Error);
        return report;
    }

    report.set("python", status(runtime.python_path().is_file()));

    match runtime.has_requirements().await {
        Ok(RequirementsStatus::Ok) => report.set("python_packages", CheckStatus::Ok),
        Ok(RequirementsStatus::PackageUpgrade) => {
            report.set("python_packages", CheckStatus::Warning);
            report.package_upgrade = true;
        }
        Ok(RequirementsStatus::Error) => report.set("python_packages", CheckStatus::Error),
        Err(e) => {
            tracing::warn!("Requirements check failed: {}", e);
            report.set("python_packages", CheckStatus::Error);
        }
    }

    let failed: Vec<&str> = report.errors().collect();
    if failed.is_empty() {
        tracing::info!("Validation passed");
    } else {
        tracing::warn!("Validation failed: {}", failed.join(", "));
    }
    report
}
