//! Python runtime environment for the bundled application.
//!
//! An isolated venv created and populated by `uv`, laid out under the
//! installation's base directory:
//!
//! ```text
//! <base_path>/
//!   .venv/          ← the environment (python + dependencies)
//!   uv-cache/       ← uv download/build cache
//!   uv-python/      ← uv-managed python builds
//! ```
//!
//! Interactive installer runs go through a [`CommandChannel`] so their output
//! streams to the log sink. Each public operation opens one channel, does one
//! logical unit of work, and shuts the channel down on every exit path.
//! Short read-only queries (dry runs, version probes) run as direct
//! subprocesses instead.

mod device;
mod requirements;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::json;
use tokio::process::Command;

pub use device::{
    Device, Mirrors, Platform, TORCH_CPU_MIRROR, TORCH_CUDA_MIRROR, TORCH_NIGHTLY_CPU_MIRROR,
};
pub use requirements::{
    classify, is_core_upgrade, is_manager_upgrade, is_unchanged, RequirementsStatus,
    CORE_ADDITION_ALLOWLIST, CORE_REMOVAL_ALLOWLIST, MANAGER_UPGRADE_PACKAGES, NO_CHANGES_PHRASE,
};

use crate::config::AppConfig;
use crate::events::tracked;
use crate::logs::LogSink;
use crate::shell::{
    ChannelOptions, ChannelSpawner, CommandChannel, CommandResult, ShellError, ShellSpawner,
};
use crate::utils::apply_creation_flags;

const VENV_DIR_NAME: &str = ".venv";
const UV_CACHE_DIR_NAME: &str = "uv-cache";
const UV_PYTHON_DIR_NAME: &str = "uv-python";

/// The accelerator package trio, always installed together.
const TORCH_PACKAGES: [&str; 3] = ["torch", "torchvision", "torchaudio"];

/// Resolution strategy that lets packages come from any configured index.
const INDEX_STRATEGY: [&str; 2] = ["--index-strategy", "unsafe-best-match"];

// ─── Errors ──────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum EnvError {
    #[error("{step} failed (exit code {exit_code:?})")]
    CommandFailed {
        step: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error("Failed to run '{program}': {source}")]
    Exec {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Filesystem error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EnvError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CommandFailed { .. } => "COMMAND_FAILED",
            Self::Shell(e) => e.error_code(),
            Self::Exec { .. } => "EXEC_FAILED",
            Self::Io { .. } => "IO_ERROR",
        }
    }

    /// Captured output of a failed installer step, for diagnostics.
    pub fn output(&self) -> Option<(&str, &str)> {
        match self {
            Self::CommandFailed { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }
}

// ─── Settings ────────────────────────────────────────────────

/// Everything the environment needs, passed in by its owner.
#[derive(Debug, Clone)]
pub struct EnvSettings {
    pub base_path: PathBuf,
    pub app: AppConfig,
    pub uv_path: PathBuf,
    pub python_version: String,
    pub device: Device,
    pub mirrors: Mirrors,
    pub platform: Platform,
}

// ─── Runtime Environment ─────────────────────────────────────

pub struct RuntimeEnvironment<S: ChannelSpawner = ShellSpawner> {
    settings: EnvSettings,
    venv_path: PathBuf,
    spawner: S,
    sink: LogSink,
}

impl<S: ChannelSpawner> RuntimeEnvironment<S> {
    pub fn new(mut settings: EnvSettings, spawner: S, sink: LogSink) -> Self {
        settings.mirrors = settings.mirrors.normalized();
        let venv_path = settings.base_path.join(VENV_DIR_NAME);
        Self {
            settings,
            venv_path,
            spawner,
            sink,
        }
    }

    pub fn settings(&self) -> &EnvSettings {
        &self.settings
    }

    pub fn device(&self) -> Device {
        self.settings.device
    }

    pub fn base_path(&self) -> &Path {
        &self.settings.base_path
    }

    pub fn venv_path(&self) -> &Path {
        &self.venv_path
    }

    pub fn exists(&self) -> bool {
        self.venv_path.is_dir()
    }

    pub fn python_path(&self) -> PathBuf {
        if cfg!(target_os = "windows") {
            self.venv_path.join("Scripts").join("python.exe")
        } else {
            self.venv_path.join("bin").join("python")
        }
    }

    fn bin_dir(&self) -> PathBuf {
        if cfg!(target_os = "windows") {
            self.venv_path.join("Scripts")
        } else {
            self.venv_path.join("bin")
        }
    }

    /// Precompiled lockfile for this platform/device, if one applies.
    pub fn lockfile_path(&self) -> Option<PathBuf> {
        self.settings
            .platform
            .lockfile_name(self.settings.device)
            .map(|name| self.settings.app.lockfile_dir_path().join(name))
    }

    /// Environment for every uv/python invocation.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let base = &self.settings.base_path;
        let mut vars = vec![
            ("VIRTUAL_ENV".to_string(), self.venv_path.to_string_lossy().into_owned()),
            ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            (
                "UV_CACHE_DIR".to_string(),
                base.join(UV_CACHE_DIR_NAME).to_string_lossy().into_owned(),
            ),
            (
                "UV_PYTHON_INSTALL_DIR".to_string(),
                base.join(UV_PYTHON_DIR_NAME).to_string_lossy().into_owned(),
            ),
        ];
        vars.extend(self.settings.mirrors.env_vars());

        let mut paths = vec![self.bin_dir()];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        if let Ok(joined) = std::env::join_paths(paths) {
            vars.push(("PATH".to_string(), joined.to_string_lossy().into_owned()));
        }
        vars
    }

    fn uv(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.settings.uv_path.to_string_lossy().into_owned())
            .chain(args.iter().map(|a| a.to_string()))
            .collect()
    }

    fn path_arg(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    // ═══════════════════════════════════════════════════════════
    //  Public operations
    // ═══════════════════════════════════════════════════════════

    /// Create the venv, bootstrap pip and install dependencies.
    ///
    /// A no-op when the user chose manual setup or when the venv directory
    /// already exists. A partially created venv is left in place on failure.
    pub async fn create(&mut self) -> Result<(), EnvError> {
        if self.settings.device == Device::Unsupported {
            tracing::info!("Unsupported device selected, skipping Python environment setup");
            return Ok(());
        }
        if self.exists() {
            tracing::info!("Python environment already exists: {}", self.venv_path.display());
            return Ok(());
        }

        tracked("create_python_environment", async {
            self.ensure_base_dir().await?;
            let mut channel = self.open_channel().await?;
            let result = self.build_in(&mut channel).await;
            channel.shutdown().await;
            result
        })
        .await
    }

    /// Install dependencies into the existing venv (fast path + fallback).
    pub async fn install_requirements(&mut self) -> Result<(), EnvError> {
        let mut channel = self.open_channel().await?;
        let result = self.install_requirements_in(&mut channel).await;
        channel.shutdown().await;
        result
    }

    /// Check both requirement files against the venv without installing.
    pub async fn has_requirements(&self) -> Result<RequirementsStatus, EnvError> {
        let core = self.settings.app.requirements_path();
        let manager = self.settings.app.manager_requirements_path();

        let core_output = self.dry_run(&core).await?;
        let manager_output = self.dry_run(&manager).await?;

        let status = classify(&core_output, &manager_output);
        tracing::info!("Requirements status: {:?}", status);
        Ok(status)
    }

    /// Manual install; on failure rebuild the venv from scratch and try once more.
    pub async fn reinstall_requirements(&mut self) -> Result<(), EnvError> {
        tracked("reinstall_requirements", async {
            let mut channel = self.open_channel().await?;
            let first = self.manual_install_in(&mut channel).await;
            channel.shutdown().await;

            let Err(first_err) = first else {
                return Ok(());
            };
            tracing::warn!("Manual install failed ({}), recreating the environment", first_err);

            self.remove_environment().await?;
            let mut channel = self.open_channel().await?;
            let result = self.rebuild_and_install_in(&mut channel).await;
            channel.shutdown().await;
            result
        })
        .await
    }

    /// Delete the venv and build it again, dependencies included.
    pub async fn recreate(&mut self) -> Result<(), EnvError> {
        tracked("recreate_python_environment", async {
            self.remove_environment().await?;
            self.ensure_base_dir().await?;
            let mut channel = self.open_channel().await?;
            let result = self.build_in(&mut channel).await;
            channel.shutdown().await;
            result
        })
        .await
    }

    pub async fn remove_environment(&self) -> Result<(), EnvError> {
        if !self.venv_path.exists() {
            return Ok(());
        }
        tracing::info!("Removing Python environment: {}", self.venv_path.display());
        tokio::fs::remove_dir_all(&self.venv_path)
            .await
            .map_err(|source| EnvError::Io {
                path: self.venv_path.clone(),
                source,
            })
    }

    /// `uv cache clean`
    pub async fn clear_cache(&self) -> Result<(), EnvError> {
        let result = self.run_direct(&self.uv(&["cache", "clean"])).await?;
        if !result.success() {
            return Err(failed("Clear uv cache", result));
        }
        Ok(())
    }

    /// `uv --version`; fails when the installer cannot be executed.
    pub async fn uv_version(&self) -> Result<String, EnvError> {
        let result = self.run_direct(&self.uv(&["--version"])).await?;
        if !result.success() {
            return Err(failed("Query uv version", result));
        }
        Ok(result.stdout.trim().to_string())
    }

    /// `python --version` of the venv interpreter.
    pub async fn python_version(&self) -> Result<String, EnvError> {
        let argv = vec![Self::path_arg(&self.python_path()), "--version".to_string()];
        let result = self.run_direct(&argv).await?;
        if !result.success() {
            return Err(failed("Query python version", result));
        }
        Ok(result.combined_output().trim().to_string())
    }

    /// Diagnostic summary of the environment.
    pub async fn status(&self) -> serde_json::Value {
        let exists = self.exists();
        let mut info = json!({
            "available": exists,
            "base_path": self.settings.base_path.to_string_lossy(),
            "venv_path": self.venv_path.to_string_lossy(),
            "python_path": self.python_path().to_string_lossy(),
            "python_version_requested": self.settings.python_version,
            "device": self.settings.device,
            "platform": self.settings.platform,
            "mirrors": self.settings.mirrors,
            "torch_mirror": self.settings.mirrors.torch_mirror_for(self.settings.device),
            "lockfile": self.lockfile_path().map(|p| p.to_string_lossy().into_owned()),
        });
        if exists {
            match self.python_version().await {
                Ok(ver) => info["python_version"] = json!(ver),
                Err(e) => info["python_error"] = json!(e.to_string()),
            }
        }
        info
    }

    // ═══════════════════════════════════════════════════════════
    //  Internal: steps run inside an open channel
    // ═══════════════════════════════════════════════════════════

    async fn open_channel(&self) -> Result<S::Channel, EnvError> {
        let options = ChannelOptions {
            cwd: self.settings.base_path.clone(),
            env: self.env_vars(),
            sink: self.sink.clone(),
        };
        Ok(self.spawner.spawn(&options).await?)
    }

    async fn ensure_base_dir(&self) -> Result<(), EnvError> {
        let base = &self.settings.base_path;
        tokio::fs::create_dir_all(base)
            .await
            .map_err(|source| EnvError::Io {
                path: base.clone(),
                source,
            })
    }

    async fn build_in(&self, channel: &mut S::Channel) -> Result<(), EnvError> {
        self.create_venv_in(channel).await?;
        self.ensure_pip_in(channel).await?;
        self.install_requirements_in(channel).await
    }

    async fn rebuild_and_install_in(&self, channel: &mut S::Channel) -> Result<(), EnvError> {
        self.create_venv_in(channel).await?;
        self.ensure_pip_in(channel).await?;
        self.manual_install_in(channel).await
    }

    async fn create_venv_in(&self, channel: &mut S::Channel) -> Result<(), EnvError> {
        tracing::info!(
            "Creating Python {} environment at {}",
            self.settings.python_version,
            self.venv_path.display()
        );
        let venv = Self::path_arg(&self.venv_path);
        let argv = self.uv(&[
            "venv",
            "--python",
            &self.settings.python_version,
            "--python-preference",
            "only-managed",
            &venv,
        ]);
        self.run_checked(channel, "Create virtual environment", &argv).await?;
        Ok(())
    }

    async fn ensure_pip_in(&self, channel: &mut S::Channel) -> Result<(), EnvError> {
        let argv = vec![
            Self::path_arg(&self.python_path()),
            "-m".to_string(),
            "ensurepip".to_string(),
            "--upgrade".to_string(),
        ];
        self.run_checked(channel, "Bootstrap pip", &argv).await?;
        Ok(())
    }

    /// Fast path from the compiled lockfile, manual install otherwise.
    async fn install_requirements_in(&self, channel: &mut S::Channel) -> Result<(), EnvError> {
        let Some(lockfile) = self.lockfile_path() else {
            tracing::info!(
                "No compiled lockfile for {:?}/{}, installing packages individually",
                self.settings.platform,
                self.settings.device
            );
            return self.manual_install_in(channel).await;
        };
        if !lockfile.is_file() {
            tracing::warn!("Compiled lockfile missing: {}", lockfile.display());
            return self.manual_install_in(channel).await;
        }

        tracing::info!("Installing dependencies from {}", lockfile.display());
        let lockfile_arg = Self::path_arg(&lockfile);
        let torch_mirror = self.settings.mirrors.torch_mirror_for(self.settings.device);
        let mut argv = self.uv(&["pip", "install", "-r", &lockfile_arg]);
        argv.extend(INDEX_STRATEGY.iter().map(|s| s.to_string()));
        argv.extend(["--extra-index-url".to_string(), torch_mirror]);

        let result = channel.run_argv(&argv).await?;
        if result.success() {
            return Ok(());
        }
        tracing::warn!(
            "Compiled requirements install failed (exit code {:?}), falling back to manual install",
            result.exit_code
        );
        self.manual_install_in(channel).await
    }

    /// Accelerator trio, then core requirements, then manager requirements.
    async fn manual_install_in(&self, channel: &mut S::Channel) -> Result<(), EnvError> {
        let torch_mirror = self.settings.mirrors.torch_mirror_for(self.settings.device);
        let mut torch = self.uv(&["pip", "install", "-U"]);
        torch.extend(TORCH_PACKAGES.iter().map(|s| s.to_string()));
        torch.extend(["--index-url".to_string(), torch_mirror]);
        if self.settings.platform.needs_nightly_torch() {
            torch.push("--pre".to_string());
        }
        self.run_checked(channel, "Install accelerator packages", &torch).await?;

        let core = Self::path_arg(&self.settings.app.requirements_path());
        let mut argv = self.uv(&["pip", "install", "-r", &core]);
        argv.extend(INDEX_STRATEGY.iter().map(|s| s.to_string()));
        self.run_checked(channel, "Install core requirements", &argv).await?;

        let manager = Self::path_arg(&self.settings.app.manager_requirements_path());
        let mut argv = self.uv(&["pip", "install", "-r", &manager]);
        argv.extend(INDEX_STRATEGY.iter().map(|s| s.to_string()));
        self.run_checked(channel, "Install manager requirements", &argv).await?;

        Ok(())
    }

    async fn run_checked(
        &self,
        channel: &mut S::Channel,
        step: &str,
        argv: &[String],
    ) -> Result<CommandResult, EnvError> {
        tracing::info!("{}", step);
        tracing::debug!("$ {}", argv.join(" "));
        let result = channel.run_argv(argv).await?;
        if !result.success() {
            tracing::error!("{} failed with exit code {:?}", step, result.exit_code);
            return Err(failed(step, result));
        }
        Ok(result)
    }

    // ═══════════════════════════════════════════════════════════
    //  Internal: direct subprocesses
    // ═══════════════════════════════════════════════════════════

    async fn dry_run(&self, requirements: &Path) -> Result<String, EnvError> {
        let req = Self::path_arg(requirements);
        let argv = self.uv(&["pip", "install", "--dry-run", "-r", &req]);
        let result = self.run_direct(&argv).await?;
        // exit code is irrelevant here; the text is the signal
        Ok(result.combined_output())
    }

    async fn run_direct(&self, argv: &[String]) -> Result<CommandResult, EnvError> {
        let (program, args) = argv.split_first().ok_or_else(|| EnvError::Exec {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;
        tracing::debug!("$ {}", argv.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .envs(self.env_vars());
        if self.settings.base_path.is_dir() {
            cmd.current_dir(&self.settings.base_path);
        }
        apply_creation_flags(&mut cmd);

        let output = cmd.output().await.map_err(|source| EnvError::Exec {
            program: program.clone(),
            source,
        })?;
        Ok(CommandResult {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn failed(step: &str, result: CommandResult) -> EnvError {
    EnvError::CommandFailed {
        step: step.to_string(),
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base: &Path, platform: Platform, device: Device) -> EnvSettings {
        EnvSettings {
            base_path: base.to_path_buf(),
            app: AppConfig {
                root: PathBuf::from("/opt/app"),
                ..AppConfig::default()
            },
            uv_path: PathBuf::from("uv"),
            python_version: "3.12".into(),
            device,
            mirrors: Mirrors {
                pypi: Some(String::new()),
                ..Mirrors::default()
            },
            platform,
        }
    }

    fn env(platform: Platform, device: Device) -> RuntimeEnvironment {
        RuntimeEnvironment::new(
            settings(Path::new("/data/base"), platform, device),
            ShellSpawner::platform_default(),
            LogSink::new(),
        )
    }

    #[test]
    fn test_paths() {
        let e = env(Platform::Linux, Device::Nvidia);
        assert_eq!(e.venv_path(), Path::new("/data/base/.venv"));
        assert!(e.python_path().starts_with("/data/base/.venv"));
        assert_eq!(
            e.lockfile_path(),
            Some(PathBuf::from("/opt/app/requirements/linux_nvidia.compiled"))
        );
        assert_eq!(env(Platform::MacOs, Device::Mps).lockfile_path(), None);
    }

    #[test]
    fn test_env_vars_pin_encoding_and_skip_empty_mirrors() {
        let e = env(Platform::Linux, Device::Cpu);
        let vars = e.env_vars();
        let get = |k: &str| vars.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        assert_eq!(get("PYTHONIOENCODING").as_deref(), Some("utf-8"));
        assert_eq!(get("VIRTUAL_ENV").as_deref(), Some("/data/base/.venv"));
        assert!(get("UV_DEFAULT_INDEX").is_none());
        assert!(get("PATH").unwrap().contains(".venv"));
    }

    #[test]
    fn test_uv_argv() {
        let e = env(Platform::Linux, Device::Cpu);
        assert_eq!(e.uv(&["cache", "clean"]), vec!["uv", "cache", "clean"]);
    }

    #[tokio::test]
    async fn test_unsupported_device_create_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let mut e = RuntimeEnvironment::new(
            settings(&base, Platform::Linux, Device::Unsupported),
            ShellSpawner::platform_default(),
            LogSink::new(),
        );
        e.create().await.unwrap();
        assert!(!e.exists());
        assert!(!base.exists());
    }

    #[tokio::test]
    async fn test_status_reports_missing_env() {
        let e = env(Platform::Linux, Device::Nvidia);
        let s = e.status().await;
        assert_eq!(s["available"], json!(false));
        assert_eq!(s["device"], json!("nvidia"));
        assert_eq!(s["torch_mirror"], json!(TORCH_CUDA_MIRROR));
    }

    #[test]
    fn test_error_codes() {
        let e = EnvError::CommandFailed {
            step: "Install core requirements".into(),
            exit_code: Some(2),
            stdout: "out".into(),
            stderr: "err".into(),
        };
        assert_eq!(e.error_code(), "COMMAND_FAILED");
        assert_eq!(e.output(), Some(("out", "err")));
        assert!(e.to_string().contains("Install core requirements"));
        assert_eq!(EnvError::Shell(ShellError::Closed).error_code(), "SHELL_CLOSED");
    }
}
