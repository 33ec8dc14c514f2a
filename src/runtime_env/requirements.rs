//! Dry-run classification of `uv pip install --dry-run` output.
//!
//! The installer exposes no structured diff, so the text is matched against
//! three predicates. Anything not positively recognised is `Error`, which
//! routes to the troubleshooting UI instead of a silent reinstall.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::utils::strip_ansi;

/// Exact phrase printed when the environment already satisfies a file.
pub const NO_CHANGES_PHRASE: &str = "Would make no changes";

/// Packages the bundled manager plugin adds on a known self-upgrade.
pub const MANAGER_UPGRADE_PACKAGES: &[&str] = &["chardet", "toml", "uv"];

/// Core packages whose old versions may be removed during an upgrade.
pub const CORE_REMOVAL_ALLOWLIST: &[&str] = &[
    "comfyui-frontend-package",
    "comfyui-workflow-templates",
    "comfyui-embedded-docs",
    "av",
];

/// Core packages a routine release bump may add.
pub const CORE_ADDITION_ALLOWLIST: &[&str] = &[
    "comfyui-frontend-package",
    "comfyui-workflow-templates",
    "comfyui-embedded-docs",
    "av",
    "spandrel",
    "alembic",
    "sqlalchemy",
    "pydantic-settings",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequirementsStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "package-upgrade")]
    PackageUpgrade,
}

fn manager_tail_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bWould install ([1-3]) packages?((?:\s+\+ [A-Za-z0-9._-]+==[^\s]+){1,3})\s*$")
            .expect("manager upgrade pattern compiles")
    })
}

fn package_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([+-]) ([A-Za-z0-9._-]+)==").expect("package line pattern compiles")
    })
}

/// `Foo_Bar` and `foo-bar` are the same distribution.
fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace(['_', '.'], "-")
}

fn in_list(name: &str, list: &[&str]) -> bool {
    let name = normalize_name(name);
    list.iter().any(|allowed| normalize_name(allowed) == name)
}

/// `(sign, normalized name)` for every `+ pkg==ver` / `- pkg==ver` line.
fn package_lines(output: &str) -> Vec<(char, String)> {
    output
        .lines()
        .map(strip_ansi)
        .filter_map(|line| {
            let caps = package_line_regex().captures(&line)?;
            let sign = caps.get(1)?.as_str().chars().next()?;
            Some((sign, normalize_name(caps.get(2)?.as_str())))
        })
        .collect()
}

pub fn is_unchanged(output: &str) -> bool {
    output.contains(NO_CHANGES_PHRASE)
}

/// "Would install 1–3 packages", all of them from the manager allow-list,
/// and nothing else removed.
pub fn is_manager_upgrade(output: &str) -> bool {
    let clean: String = output.lines().map(strip_ansi).collect::<Vec<_>>().join("\n");
    let Some(caps) = manager_tail_regex().captures(&clean) else {
        return false;
    };
    let declared: usize = caps[1].parse().unwrap_or(0);

    let lines = package_lines(&clean);
    let added: Vec<&String> = lines.iter().filter(|(s, _)| *s == '+').map(|(_, n)| n).collect();
    if added.len() != declared {
        return false;
    }
    lines
        .iter()
        .all(|(_, name)| in_list(name, MANAGER_UPGRADE_PACKAGES))
}

/// Removals limited to the removal allow-list and at least one addition from
/// the addition allow-list.
pub fn is_core_upgrade(output: &str) -> bool {
    let mut allowed_adds = 0;
    for (sign, name) in package_lines(output) {
        match sign {
            '-' if !in_list(&name, CORE_REMOVAL_ALLOWLIST) => return false,
            '+' if in_list(&name, CORE_ADDITION_ALLOWLIST) => allowed_adds += 1,
            _ => {}
        }
    }
    allowed_adds > 0
}

/// Combine the core and manager dry runs.
pub fn classify(core_output: &str, manager_output: &str) -> RequirementsStatus {
    let core_ok = is_unchanged(core_output);
    let manager_ok = is_unchanged(manager_output);
    if core_ok && manager_ok {
        return RequirementsStatus::Ok;
    }

    let core_upgrade = !core_ok && is_core_upgrade(core_output);
    let manager_upgrade = !manager_ok && is_manager_upgrade(manager_output);
    if (core_ok && manager_upgrade) || (manager_ok && core_upgrade) || (core_upgrade && manager_upgrade) {
        return RequirementsStatus::PackageUpgrade;
    }

    tracing::info!(
        "Requirements drift not recognised (core ok: {}, manager ok: {})",
        core_ok,
        manager_ok
    );
    RequirementsStatus::Error
}
