//! Launch flag composition.

use std::collections::BTreeMap;
use std::path::Path;

/// User-facing launch options; `extra` holds arbitrary flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerArgs {
    pub listen: String,
    pub port: u16,
    pub extra: BTreeMap<String, String>,
}

impl ServerArgs {
    pub fn new(listen: impl Into<String>, port: u16) -> Self {
        Self {
            listen: listen.into(),
            port,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_flag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Flat key/value view; `listen` and `port` override same-named extras.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = normalize(&self.extra);
        map.insert("listen".to_string(), self.listen.clone());
        map.insert("port".to_string(), self.port.to_string());
        map
    }
}

/// Flags the launcher always controls: working directories and the model
/// paths config, all under the installation's base path.
pub fn core_args(base_path: &Path) -> BTreeMap<String, String> {
    let dir = |name: &str| base_path.join(name).to_string_lossy().into_owned();
    BTreeMap::from([
        ("base-directory".to_string(), base_path.to_string_lossy().into_owned()),
        ("user-directory".to_string(), dir("user")),
        ("input-directory".to_string(), dir("input")),
        ("output-directory".to_string(), dir("output")),
        ("extra-model-paths-config".to_string(), dir("extra_models_config.yaml")),
    ])
}

/// `--user-directory` and `user-directory` name the same flag.
fn flag_name(key: &str) -> &str {
    key.trim_start_matches('-')
}

/// Re-key by flag name, dropping keys that are only dashes.
fn normalize(args: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    args.iter()
        .filter(|(k, _)| !flag_name(k).is_empty())
        .map(|(k, v)| (flag_name(k).to_string(), v.clone()))
        .collect()
}

/// Keys are compared by flag name; `core` is applied last and wins.
pub fn merge_args(
    user: &BTreeMap<String, String>,
    core: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = normalize(user);
    merged.extend(normalize(core));
    merged
}

/// `{cpu: "", port: "8188"}` → `["--cpu", "--port", "8188"]`
pub fn build_cli_args(args: &BTreeMap<String, String>) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len() * 2);
    for (key, value) in args {
        let key = flag_name(key);
        if key.is_empty() {
            continue;
        }
        out.push(format!("--{}", key));
        if !value.is_empty() {
            out.push(value.clone());
        }
    }
    out
}
