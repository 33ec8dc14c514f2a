//! Default filesystem host: data directories, model-path config, migrations.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::ports::InstallHost;

/// Directories created under every base path.
pub const DATA_DIRS: &[&str] = &["models", "user", "input", "output", "custom_nodes"];

/// Subdirectories copied from a previous installation.
pub const MIGRATED_DIRS: &[&str] = &["user", "models"];

pub const MODEL_PATHS_CONFIG: &str = "extra_models_config.yaml";

/// Top-level key of our entry in the model-path config.
const MODEL_PATHS_KEY: &str = "runtime_keeper";

/// Model categories listed in the seeded config.
const MODEL_CATEGORIES: &[&str] = &[
    "checkpoints",
    "clip",
    "clip_vision",
    "configs",
    "controlnet",
    "diffusion_models",
    "embeddings",
    "loras",
    "upscale_models",
    "vae",
];

const LEGACY_SETTINGS: &str = "comfy.settings.json";

#[derive(Debug, Clone, Default)]
pub struct DirectoryHost;

impl DirectoryHost {
    pub fn new() -> Self {
        Self
    }
}

impl InstallHost for DirectoryHost {
    async fn prepare_directories(&mut self, base_path: &Path) -> Result<()> {
        let base = base_path.to_path_buf();
        tokio::task::spawn_blocking(move || seed_directories(&base)).await?
    }

    async fn migrate_user_data(&mut self, from: &Path, to: &Path) -> Result<()> {
        let (from, to) = (from.to_path_buf(), to.to_path_buf());
        tokio::task::spawn_blocking(move || migrate_dirs(&from, &to)).await?
    }

    async fn migrate_legacy_format(&mut self, base_path: &Path) -> Result<()> {
        let base = base_path.to_path_buf();
        tokio::task::spawn_blocking(move || move_legacy_settings(&base)).await?
    }
}

fn seed_directories(base: &Path) -> Result<()> {
    for dir in DATA_DIRS {
        let path = base.join(dir);
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
    }

    let config = base.join(MODEL_PATHS_CONFIG);
    if config.exists() {
        tracing::info!("Keeping existing {}", config.display());
        return Ok(());
    }
    fs::write(&config, model_paths_yaml(base)?)
        .with_context(|| format!("Failed to write {}", config.display()))?;
    tracing::info!("Wrote {}", config.display());
    Ok(())
}

/// One entry of the model-path config.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ModelPaths {
    pub base_path: PathBuf,
    pub is_default: bool,
    #[serde(flatten)]
    pub categories: BTreeMap<String, String>,
}

/// Model search paths rooted at `base`.
pub fn model_paths_yaml(base: &Path) -> Result<String> {
    let entry = ModelPaths {
        base_path: base.to_path_buf(),
        is_default: true,
        categories: MODEL_CATEGORIES
            .iter()
            .map(|c| (c.to_string(), format!("models/{}/", c)))
            .collect(),
    };
    let config = BTreeMap::from([(MODEL_PATHS_KEY, entry)]);
    let body = serde_yaml::to_string(&config).context("Failed to serialize model paths")?;
    Ok(format!("# Model search paths for the bundled server\n{}", body))
}

fn migrate_dirs(from: &Path, to: &Path) -> Result<()> {
    if !from.is_dir() {
        anyhow::bail!("Migration source {} is not a directory", from.display());
    }
    for dir in MIGRATED_DIRS {
        let src = from.join(dir);
        if !src.is_dir() {
            tracing::info!("Nothing to migrate in {}", src.display());
            continue;
        }
        let copied = copy_tree(&src, &to.join(dir))
            .with_context(|| format!("Failed to migrate {}", src.display()))?;
        tracing::info!("Migrated {} files from {}", copied, src.display());
    }
    Ok(())
}

/// Copy `src` into `dst` recursively; files already present are kept.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<usize> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() && !target.exists() {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// `user/comfy.settings.json` → `user/default/comfy.settings.json`
fn move_legacy_settings(base: &Path) -> Result<()> {
    let legacy = base.join("user").join(LEGACY_SETTINGS);
    let current: PathBuf = base.join("user").join("default").join(LEGACY_SETTINGS);
    if !legacy.is_file() {
        return Ok(());
    }
    if current.exists() {
        tracing::warn!(
            "Both {} and {} exist, keeping the current one",
            legacy.display(),
            current.display()
        );
        return Ok(());
    }
    if let Some(parent) = current.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&legacy, &current)
        .with_context(|| format!("Failed to move {}", legacy.display()))?;
    tracing::info!("Moved legacy settings to {}", current.display());
    Ok(())
}
