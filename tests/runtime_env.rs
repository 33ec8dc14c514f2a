//! RuntimeEnvironment against a scripted stand-in for `uv`.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use runtime_keeper::config::AppConfig;
use runtime_keeper::logs::LogSink;
use runtime_keeper::runtime_env::{
    Device, EnvError, EnvSettings, Mirrors, Platform, RequirementsStatus, RuntimeEnvironment,
    TORCH_CPU_MIRROR, TORCH_NIGHTLY_CPU_MIRROR,
};
use runtime_keeper::shell::{
    ChannelOptions, ChannelSpawner, CommandChannel, CommandResult, ShellError, ShellKind,
    ShellSpawner,
};
use tempfile::TempDir;

/// Logs every invocation to `calls.log` next to itself. Behaviour is steered
/// by marker files in the same directory:
/// - `lock_exit`: exit code for a lockfile install
/// - `torch_exit`: exit code for the accelerator install
/// - `torch_fail_once`: fail the next accelerator install, then succeed
/// - `<requirements>.dry`: dry-run output for that requirements file
const FAKE_UV: &str = r#"#!/bin/sh
DIR=$(cd "$(dirname "$0")" && pwd)
echo "$*" >> "$DIR/calls.log"
case "$1" in
  --version)
    echo "uv 0.5.11"
    exit 0 ;;
  cache)
    exit 0 ;;
  venv)
    for last; do :; done
    mkdir -p "$last/bin"
    printf '#!/bin/sh\necho "Python 3.12.7"\n' > "$last/bin/python"
    chmod +x "$last/bin/python"
    exit 0 ;;
  pip)
    shift 2
    case "$1" in
      --dry-run)
        if [ -f "$3.dry" ]; then cat "$3.dry"; else echo "Would make no changes"; fi
        exit 0 ;;
      -U)
        if [ -f "$DIR/torch_fail_once" ]; then rm "$DIR/torch_fail_once"; echo "torch download failed" >&2; exit 1; fi
        if [ -f "$DIR/torch_exit" ]; then exit "$(cat "$DIR/torch_exit")"; fi
        exit 0 ;;
      -r)
        case "$2" in
          *.compiled)
            if [ -f "$DIR/lock_exit" ]; then exit "$(cat "$DIR/lock_exit")"; fi ;;
        esac
        exit 0 ;;
    esac ;;
esac
exit 0
"#;

struct Fixture {
    _dir: TempDir,
    tools: PathBuf,
    base: PathBuf,
    app: AppConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("tools");
        fs::create_dir_all(&tools).unwrap();
        let uv = tools.join("uv");
        fs::write(&uv, FAKE_UV).unwrap();
        fs::set_permissions(&uv, fs::Permissions::from_mode(0o755)).unwrap();

        let app = AppConfig {
            root: dir.path().join("app"),
            ..AppConfig::default()
        };
        fs::create_dir_all(app.manager_requirements_path().parent().unwrap()).unwrap();
        fs::create_dir_all(app.lockfile_dir_path()).unwrap();
        fs::write(app.requirements_path(), "numpy\n").unwrap();
        fs::write(app.manager_requirements_path(), "uv\n").unwrap();
        fs::write(app.lockfile_dir_path().join("linux_cpu.compiled"), "numpy==2.1.0\n").unwrap();

        Self {
            base: dir.path().join("base"),
            tools,
            app,
            _dir: dir,
        }
    }

    fn env(&self, platform: Platform, device: Device) -> RuntimeEnvironment {
        self.env_with(
            platform,
            device,
            ShellSpawner::new("sh", Vec::new(), ShellKind::Posix),
        )
    }

    fn env_with<S: ChannelSpawner>(
        &self,
        platform: Platform,
        device: Device,
        spawner: S,
    ) -> RuntimeEnvironment<S> {
        let settings = EnvSettings {
            base_path: self.base.clone(),
            app: self.app.clone(),
            uv_path: self.tools.join("uv"),
            python_version: "3.12".to_string(),
            device,
            mirrors: Mirrors::default(),
            platform,
        };
        RuntimeEnvironment::new(settings, spawner, LogSink::new())
    }

    fn control(&self, name: &str, content: &str) {
        fs::write(self.tools.join(name), content).unwrap();
    }

    fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.tools.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

fn dry_output(requirements: &Path, output: &str) {
    let mut path = requirements.as_os_str().to_owned();
    path.push(".dry");
    fs::write(PathBuf::from(path), output).unwrap();
}

#[tokio::test]
async fn test_create_uses_compiled_lockfile() {
    let fx = Fixture::new();
    let mut env = fx.env(Platform::Linux, Device::Cpu);

    env.create().await.unwrap();
    assert!(env.exists());
    assert!(env.python_path().is_file());

    let calls = fx.calls();
    assert!(calls[0].starts_with("venv --python 3.12 --python-preference only-managed"));
    let lock = calls.iter().find(|c| c.contains("linux_cpu.compiled")).unwrap();
    assert!(lock.contains("--index-strategy unsafe-best-match"));
    assert!(lock.contains(&format!("--extra-index-url {}", TORCH_CPU_MIRROR)));
    assert_eq!(fx.count("pip install -U"), 0);
}

#[tokio::test]
async fn test_second_create_is_noop() {
    let fx = Fixture::new();
    let mut env = fx.env(Platform::Linux, Device::Cpu);
    env.create().await.unwrap();
    let before = fx.calls().len();

    env.create().await.unwrap();
    assert_eq!(fx.calls().len(), before);
}

#[tokio::test]
async fn test_failed_lockfile_falls_back_to_manual_install() {
    let fx = Fixture::new();
    fx.control("lock_exit", "1");
    let mut env = fx.env(Platform::Linux, Device::Cpu);

    env.create().await.unwrap();

    let calls = fx.calls();
    let torch = calls.iter().position(|c| c.starts_with("pip install -U torch torchvision torchaudio")).unwrap();
    let core = calls.iter().position(|c| c.ends_with("/app/requirements.txt --index-strategy unsafe-best-match")).unwrap();
    let manager = calls.iter().position(|c| c.contains("custom_nodes/manager/requirements.txt")).unwrap();
    assert!(torch < core && core < manager);
    assert!(calls[torch].contains(&format!("--index-url {}", TORCH_CPU_MIRROR)));
}

#[tokio::test]
async fn test_macos_skips_lockfile_and_uses_nightly() {
    let fx = Fixture::new();
    let mut env = fx.env(Platform::MacOs, Device::Mps);

    env.create().await.unwrap();

    assert!(!fx.calls().iter().any(|c| c.contains(".compiled")));
    let torch = fx.calls().into_iter().find(|c| c.starts_with("pip install -U")).unwrap();
    assert!(torch.contains(TORCH_NIGHTLY_CPU_MIRROR));
    assert!(torch.ends_with("--pre"));
}

#[tokio::test]
async fn test_manual_install_failure_propagates_and_keeps_partial_env() {
    let fx = Fixture::new();
    fx.control("lock_exit", "1");
    fx.control("torch_exit", "2");
    let mut env = fx.env(Platform::Linux, Device::Cpu);

    let err = env.create().await.unwrap_err();
    match &err {
        EnvError::CommandFailed { step, exit_code, .. } => {
            assert_eq!(step, "Install accelerator packages");
            assert_eq!(*exit_code, Some(2));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(err.error_code(), "COMMAND_FAILED");
    // left for diagnostics
    assert!(env.exists());
    // later steps never ran
    assert!(!fx.calls().iter().any(|c| c.contains("manager/requirements.txt")));
}

#[tokio::test]
async fn test_has_requirements_classification() {
    let fx = Fixture::new();
    let mut env = fx.env(Platform::Linux, Device::Cpu);
    env.create().await.unwrap();

    assert_eq!(env.has_requirements().await.unwrap(), RequirementsStatus::Ok);

    dry_output(
        &fx.app.manager_requirements_path(),
        "Resolved 9 packages in 20ms\nWould install 1 package\n + uv==0.5.11\n",
    );
    assert_eq!(env.has_requirements().await.unwrap(), RequirementsStatus::PackageUpgrade);

    dry_output(
        &fx.app.requirements_path(),
        "Would uninstall 1 package\nWould install 1 package\n - torch==2.5.1\n + torch==2.6.0\n",
    );
    assert_eq!(env.has_requirements().await.unwrap(), RequirementsStatus::Error);

    assert_eq!(fx.count("pip install --dry-run -r"), 6);
}

#[tokio::test]
async fn test_reinstall_recreates_env_after_failure() {
    let fx = Fixture::new();
    let mut env = fx.env(Platform::Linux, Device::Cpu);
    env.create().await.unwrap();
    assert_eq!(fx.count("venv "), 1);

    fx.control("torch_fail_once", "");
    env.reinstall_requirements().await.unwrap();

    assert_eq!(fx.count("venv "), 2);
    assert_eq!(fx.count("pip install -U torch"), 2);
    assert!(env.exists());
}

#[tokio::test]
async fn test_reinstall_gives_up_after_one_retry() {
    let fx = Fixture::new();
    let mut env = fx.env(Platform::Linux, Device::Cpu);
    env.create().await.unwrap();

    fx.control("torch_exit", "1");
    assert!(env.reinstall_requirements().await.is_err());
    assert_eq!(fx.count("pip install -U torch"), 2);
}

#[tokio::test]
async fn test_maintenance_operations() {
    let fx = Fixture::new();
    let mut env = fx.env(Platform::Linux, Device::Cpu);
    env.create().await.unwrap();

    env.clear_cache().await.unwrap();
    assert_eq!(fx.count("cache clean"), 1);

    assert_eq!(env.uv_version().await.unwrap(), "uv 0.5.11");
    let status = env.status().await;
    assert_eq!(status["available"], true);
    assert_eq!(status["python_version"], "Python 3.12.7");

    env.remove_environment().await.unwrap();
    assert!(!env.exists());
    // removing twice is fine
    env.remove_environment().await.unwrap();

    env.recreate().await.unwrap();
    assert!(env.exists());
    assert_eq!(fx.count("venv "), 2);
}

#[tokio::test]
async fn test_unsupported_device_skips_everything() {
    let fx = Fixture::new();
    let mut env = fx.env(Platform::Linux, Device::Unsupported);
    env.create().await.unwrap();
    assert!(!env.exists());
    assert!(fx.calls().is_empty());
}

// ─── Channel lifecycle ───────────────────────────────────────

#[derive(Default)]
struct ChannelLedger {
    spawned: usize,
    shut_down: usize,
    commands: Vec<String>,
}

/// Scripted channels: a command containing any `failing` fragment exits 1.
#[derive(Clone, Default)]
struct CountingSpawner {
    ledger: Arc<Mutex<ChannelLedger>>,
    failing: Vec<&'static str>,
}

impl CountingSpawner {
    fn failing(fragments: &[&'static str]) -> Self {
        Self {
            failing: fragments.to_vec(),
            ..Self::default()
        }
    }

    fn counts(&self) -> (usize, usize) {
        let ledger = self.ledger.lock().unwrap();
        (ledger.spawned, ledger.shut_down)
    }

    fn ran(&self, fragment: &str) -> usize {
        let ledger = self.ledger.lock().unwrap();
        ledger.commands.iter().filter(|c| c.contains(fragment)).count()
    }
}

struct CountingChannel {
    ledger: Arc<Mutex<ChannelLedger>>,
    failing: Vec<&'static str>,
    open: bool,
}

impl ChannelSpawner for CountingSpawner {
    type Channel = CountingChannel;

    async fn spawn(&self, _options: &ChannelOptions) -> Result<Self::Channel, ShellError> {
        self.ledger.lock().unwrap().spawned += 1;
        Ok(CountingChannel {
            ledger: self.ledger.clone(),
            failing: self.failing.clone(),
            open: true,
        })
    }
}

impl CommandChannel for CountingChannel {
    fn kind(&self) -> ShellKind {
        ShellKind::Posix
    }

    async fn run(&mut self, command: &str) -> Result<CommandResult, ShellError> {
        assert!(self.open, "command sent to a shut-down channel");
        self.ledger.lock().unwrap().commands.push(command.to_string());
        let fails = self.failing.iter().any(|f| command.contains(f));
        Ok(CommandResult {
            exit_code: Some(if fails { 1 } else { 0 }),
            stdout: String::new(),
            stderr: if fails { "simulated failure".into() } else { String::new() },
        })
    }

    async fn shutdown(&mut self) {
        if self.open {
            self.open = false;
            self.ledger.lock().unwrap().shut_down += 1;
        }
    }
}

#[tokio::test]
async fn test_failed_create_shuts_its_channel() {
    let fx = Fixture::new();
    let spawner = CountingSpawner::failing(&["ensurepip"]);
    let mut env = fx.env_with(Platform::Linux, Device::Cpu, spawner.clone());

    let err = env.create().await.unwrap_err();
    assert!(matches!(err, EnvError::CommandFailed { ref step, .. } if step == "Bootstrap pip"));
    assert_eq!(err.output(), Some(("", "simulated failure")));
    assert_eq!(spawner.counts(), (1, 1));
}

#[tokio::test]
async fn test_failed_reinstall_shuts_both_channels() {
    let fx = Fixture::new();
    let spawner = CountingSpawner::failing(&["torchvision"]);
    let mut env = fx.env_with(Platform::Linux, Device::Cpu, spawner.clone());

    assert!(env.reinstall_requirements().await.is_err());
    assert_eq!(spawner.counts(), (2, 2));
    assert_eq!(spawner.ran("torchvision"), 2);
    assert_eq!(spawner.ran(" venv "), 1);
}

#[tokio::test]
async fn test_install_requirements_shuts_its_channel() {
    let fx = Fixture::new();
    let spawner = CountingSpawner::default();
    let mut env = fx.env_with(Platform::Linux, Device::Cpu, spawner.clone());

    env.install_requirements().await.unwrap();
    assert_eq!(spawner.counts(), (1, 1));
    assert_eq!(spawner.ran("linux_cpu.compiled"), 1);
    assert_eq!(spawner.ran("torchvision"), 0);

    // lockfile failure falls back inside the same channel
    let spawner = CountingSpawner::failing(&[".compiled"]);
    let mut env = fx.env_with(Platform::Linux, Device::Cpu, spawner.clone());
    env.install_requirements().await.unwrap();
    assert_eq!(spawner.counts(), (1, 1));
    assert_eq!(spawner.ran("torchvision"), 1);
}

#[tokio::test]
async fn test_failed_recreate_shuts_its_channel() {
    let fx = Fixture::new();
    let spawner = CountingSpawner::failing(&[" venv "]);
    let mut env = fx.env_with(Platform::Linux, Device::Cpu, spawner.clone());

    assert!(env.recreate().await.is_err());
    assert_eq!(spawner.counts(), (1, 1));
    println!("✓ channel lifecycle tests passed");
}
