//! Launcher configuration: `runtime-keeper.toml`
//!
//! Every field has a default, so a missing file or a partial file both load.
//! `RUNTIME_KEEPER_BASE_PATH` / `RUNTIME_KEEPER_DEVICE` override the install
//! section after parsing.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::runtime_env::{Device, Mirrors};

pub const CONFIG_ENV: &str = "RUNTIME_KEEPER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "runtime-keeper.toml";

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct LauncherConfig {
    /// Key-value install record (JSON)
    pub state_file: PathBuf,
    /// `uv` executable; a bare name is looked up on PATH
    pub uv_path: PathBuf,
    pub python_version: String,
    /// Shell program for the command channel; platform default when unset
    pub shell: Option<String>,
    pub app: AppConfig,
    pub install: InstallConfig,
    pub server: ServerConfig,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("install-state.json"),
            uv_path: PathBuf::from(if cfg!(target_os = "windows") { "uv.exe" } else { "uv" }),
            python_version: "3.12".to_string(),
            shell: None,
            app: AppConfig::default(),
            install: InstallConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Layout of the bundled application (read-only resources).
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub root: PathBuf,
    /// Entry script, relative to `root`
    pub main_script: PathBuf,
    /// Core requirements, relative to `root`
    pub requirements: PathBuf,
    /// Bundled manager plugin requirements, relative to `root`
    pub manager_requirements: PathBuf,
    /// Directory holding the precompiled `<platform>_<device>.compiled` lockfiles
    pub lockfile_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("app"),
            main_script: PathBuf::from("main.py"),
            requirements: PathBuf::from("requirements.txt"),
            manager_requirements: PathBuf::from("custom_nodes/manager/requirements.txt"),
            lockfile_dir: PathBuf::from("requirements"),
        }
    }
}

impl AppConfig {
    pub fn main_script_path(&self) -> PathBuf {
        self.root.join(&self.main_script)
    }

    pub fn requirements_path(&self) -> PathBuf {
        self.root.join(&self.requirements)
    }

    pub fn manager_requirements_path(&self) -> PathBuf {
        self.root.join(&self.manager_requirements)
    }

    pub fn lockfile_dir_path(&self) -> PathBuf {
        self.root.join(&self.lockfile_dir)
    }
}

/// First-run answers used when no interactive wizard is attached.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct InstallConfig {
    pub base_path: Option<PathBuf>,
    pub device: Option<Device>,
    pub mirrors: Mirrors,
    /// Previous installation to copy user data and models from
    pub migration_source: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Interpreter used to run the server; the venv python when unset
    pub program: Option<PathBuf>,
    /// Inserted between the entry script and the composed flags
    pub prefix_args: Vec<String>,
    pub listen: String,
    pub port: u16,
    /// Extra launch flags; an empty value is a bare flag
    pub extra_args: BTreeMap<String, String>,
    pub health_path: String,
    pub poll_interval_ms: u64,
    pub max_wait_secs: u64,
    pub kill_timeout_secs: u64,
    /// Regex with a `level` group used to classify server log lines
    pub log_level_pattern: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: None,
            prefix_args: Vec::new(),
            listen: "127.0.0.1".to_string(),
            port: 8000,
            extra_args: BTreeMap::new(),
            health_path: "/queue".to_string(),
            poll_interval_ms: 1_000,
            // custom plugins install their own dependencies on first start
            max_wait_secs: 20 * 60,
            kill_timeout_secs: 10,
            log_level_pattern: None,
        }
    }
}

impl ServerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    /// Exchange the editable config for a read-only view.
    pub fn freeze(self) -> FrozenServerConfig {
        FrozenServerConfig(Arc::new(self))
    }
}

/// Read-only server settings, held by the supervisor once it owns the process.
#[derive(Debug, Clone)]
pub struct FrozenServerConfig(Arc<ServerConfig>);

impl Deref for FrozenServerConfig {
    type Target = ServerConfig;

    fn deref(&self) -> &ServerConfig {
        &self.0
    }
}

impl LauncherConfig {
    /// Path from `RUNTIME_KEEPER_CONFIG`, else `./runtime-keeper.toml`.
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let s = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            Self::from_toml(&s).with_context(|| format!("Invalid config {}", path.display()))?
        } else {
            tracing::info!("Config file {} not found, using defaults", path.display());
            Self::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(base) = std::env::var("RUNTIME_KEEPER_BASE_PATH") {
            if !base.trim().is_empty() {
                self.install.base_path = Some(PathBuf::from(base));
            }
        }
        if let Ok(device) = std::env::var("RUNTIME_KEEPER_DEVICE") {
            match device.parse::<Device>() {
                Ok(d) => self.install.device = Some(d),
                Err(e) => tracing::warn!("Ignoring RUNTIME_KEEPER_DEVICE: {}", e),
            }
        }
    }
}
