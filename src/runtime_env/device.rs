//! Accelerator device, host platform and mirror selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::non_empty;

pub const TORCH_CUDA_MIRROR: &str = "https://download.pytorch.org/whl/cu128";
pub const TORCH_CPU_MIRROR: &str = "https://download.pytorch.org/whl/cpu";
pub const TORCH_NIGHTLY_CPU_MIRROR: &str = "https://download.pytorch.org/whl/nightly/cpu";

/// Accelerator the user selected during install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Nvidia,
    Cpu,
    Mps,
    /// User elected to set up the environment manually
    Unsupported,
}

impl Device {
    /// Default index for the accelerator package trio.
    pub fn default_torch_mirror(&self) -> &'static str {
        match self {
            Self::Nvidia => TORCH_CUDA_MIRROR,
            Self::Mps => TORCH_NIGHTLY_CPU_MIRROR,
            Self::Cpu | Self::Unsupported => TORCH_CPU_MIRROR,
        }
    }

    /// Best guess for a first run without an explicit choice.
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            return Self::Mps;
        }
        let nvidia = std::process::Command::new("nvidia-smi")
            .arg("-L")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if nvidia {
            Self::Nvidia
        } else {
            Self::Cpu
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nvidia => "nvidia",
            Self::Cpu => "cpu",
            Self::Mps => "mps",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nvidia" | "cuda" => Ok(Self::Nvidia),
            "cpu" => Ok(Self::Cpu),
            "mps" | "apple" => Ok(Self::Mps),
            "unsupported" | "manual" => Ok(Self::Unsupported),
            other => Err(format!("unknown device '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }

    /// macOS needs a nightly accelerator build, which no lockfile pins.
    pub fn supports_lockfile(&self) -> bool {
        !matches!(self, Self::MacOs)
    }

    pub fn needs_nightly_torch(&self) -> bool {
        matches!(self, Self::MacOs)
    }

    /// File name of the precompiled lockfile for this platform/device.
    pub fn lockfile_name(&self, device: Device) -> Option<String> {
        if !self.supports_lockfile() {
            return None;
        }
        let os = match self {
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::MacOs => return None,
        };
        let accel = match device {
            Device::Nvidia => "nvidia",
            Device::Cpu | Device::Mps => "cpu",
            Device::Unsupported => return None,
        };
        Some(format!("{}_{}.compiled", os, accel))
    }
}

/// Optional download mirrors; empty strings count as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mirrors {
    /// Standalone python builds
    pub python: Option<String>,
    /// Package index
    pub pypi: Option<String>,
    /// Accelerator packages
    pub torch: Option<String>,
}

impl Mirrors {
    pub fn normalized(&self) -> Self {
        Self {
            python: non_empty(self.python.as_deref()).map(String::from),
            pypi: non_empty(self.pypi.as_deref()).map(String::from),
            torch: non_empty(self.torch.as_deref()).map(String::from),
        }
    }

    /// Index URL for the accelerator trio.
    ///
    /// A CPU-only mirror paired with a non-CPU device is replaced by that
    /// device's default; it would silently install CPU wheels.
    pub fn torch_mirror_for(&self, device: Device) -> String {
        match non_empty(self.torch.as_deref()) {
            None => device.default_torch_mirror().to_string(),
            Some(url) if is_cpu_mirror(url) && !matches!(device, Device::Cpu | Device::Unsupported) => {
                tracing::warn!(
                    "Torch mirror {} only serves CPU builds, using {} for device '{}'",
                    url,
                    device.default_torch_mirror(),
                    device
                );
                device.default_torch_mirror().to_string()
            }
            Some(url) => url.to_string(),
        }
    }

    /// Environment variables understood by `uv`.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        if let Some(url) = non_empty(self.python.as_deref()) {
            vars.push(("UV_PYTHON_INSTALL_MIRROR".to_string(), url.to_string()));
        }
        if let Some(url) = non_empty(self.pypi.as_deref()) {
            vars.push(("UV_DEFAULT_INDEX".to_string(), url.to_string()));
        }
        vars
    }
}

fn is_cpu_mirror(url: &str) -> bool {
    url.trim_end_matches('/') == TORCH_CPU_MIRROR
}
