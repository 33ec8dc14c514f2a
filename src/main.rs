use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::error::RecvError;

use runtime_keeper::config::{InstallConfig, LauncherConfig};
use runtime_keeper::install::{
    CheckStatus, DirectoryHost, InstallOptions, InstallRecord, InstallUi, InstallationManager,
    JsonStateStore, TroubleshootRequest, ValidationReport,
};
use runtime_keeper::logs::{LogLevel, LogSink};
use runtime_keeper::runtime_env::{Device, EnvSettings, Platform, RuntimeEnvironment};
use runtime_keeper::server::{core_args, LaunchCommand, ServerSupervisor};
use runtime_keeper::shell::ShellSpawner;
use runtime_keeper::utils::strip_ansi;

const DEFAULT_BASE_DIR: &str = "runtime-keeper-data";

#[tokio::main]
async fn main() -> Result<()> {
    // 로깅 초기화
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config_path = LauncherConfig::default_path();
    let mut config = LauncherConfig::load(&config_path)?;
    config.app.root = absolute(&config.app.root)?;
    tracing::info!("runtime-keeper starting (config: {})", config_path.display());

    let install_sink = LogSink::new();
    mirror_to_tracing(&install_sink, "install");

    let spawner = match config.shell.as_deref() {
        Some(program) => ShellSpawner::from_program(program),
        None => ShellSpawner::platform_default(),
    };

    // ─── Installation ────────────────────────────────────────
    let runtime = {
        let cfg = &config;
        let make_runtime = |record: &InstallRecord| {
            RuntimeEnvironment::new(env_settings(cfg, record), spawner.clone(), install_sink.clone())
        };
        let mut manager = InstallationManager::new(
            JsonStateStore::new(&config.state_file),
            ConsoleUi::new(config.install.clone()),
            DirectoryHost::new(),
            config.app.root.clone(),
            make_runtime,
        );
        let record = manager.ensure_installed().await?;
        tracing::info!("Installation ready ({})", record.state);
        manager
            .into_runtime()
            .context("Installation finished without a runtime environment")?
    };

    // ─── Server ──────────────────────────────────────────────
    let server_sink = match config.server.log_level_pattern.as_deref() {
        Some(pattern) => LogSink::new().with_level_pattern(pattern),
        None => LogSink::new(),
    };
    mirror_to_tracing(&server_sink, "server");

    let program = config
        .server
        .program
        .clone()
        .unwrap_or_else(|| runtime.python_path());
    let mut launch = LaunchCommand::new(program);
    launch.prefix_args = std::iter::once(config.app.main_script_path().to_string_lossy().into_owned())
        .chain(config.server.prefix_args.iter().cloned())
        .collect();
    launch.core_args = core_args(runtime.base_path());
    launch.cwd = Some(config.app.root.clone());
    launch.env = runtime.env_vars();

    let mut supervisor = ServerSupervisor::new(config.server.clone().freeze(), launch, server_sink);
    let args = supervisor.default_args();
    match supervisor.start(&args).await {
        Ok(()) => tracing::info!("Server ready on http://{}:{}", args.listen, args.port),
        Err(e) if e.timed_out_whilst_starting() => {
            tracing::warn!("{} - leaving it running in the background", e);
        }
        Err(e) => {
            tracing::error!("[{}] {}", e.error_code(), e);
            return Err(e.into());
        }
    }

    // Graceful shutdown: Ctrl+C 시 서버 종료
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Shutdown signal received, stopping server...");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if !supervisor.is_running() {
                    tracing::info!("Server exited with code {:?}", supervisor.exit_code());
                    return Ok(());
                }
            }
        }
    }

    if let Err(e) = supervisor.kill().await {
        tracing::error!("[{}] {}", e.error_code(), e);
        return Err(e.into());
    }
    tracing::info!("runtime-keeper shutting down");
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("Failed to resolve working directory")?
        .join(path))
}

fn env_settings(config: &LauncherConfig, record: &InstallRecord) -> EnvSettings {
    let base_path = record
        .base_path
        .clone()
        .or_else(|| config.install.base_path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));
    EnvSettings {
        base_path: absolute(&base_path).unwrap_or(base_path),
        app: config.app.clone(),
        uv_path: config.uv_path.clone(),
        python_version: config.python_version.clone(),
        device: record.device.or(config.install.device).unwrap_or(Device::Cpu),
        mirrors: record.mirrors.clone(),
        platform: Platform::current(),
    }
}

/// Forward captured child output to the log.
fn mirror_to_tracing(sink: &LogSink, label: &'static str) {
    let mut rx = sink.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(line) => {
                    let text = strip_ansi(&line.content);
                    match line.level {
                        LogLevel::Error => tracing::error!("[{}] {}", label, text),
                        LogLevel::Warn => tracing::warn!("[{}] {}", label, text),
                        LogLevel::Debug => tracing::debug!("[{}] {}", label, text),
                        LogLevel::Info => tracing::info!("[{}] {}", label, text),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("[{}] {} lines skipped", label, skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

// ─── Console troubleshooter ──────────────────────────────────

/// Takes first-run answers from config and troubleshooting actions from stdin.
struct ConsoleUi {
    install: InstallConfig,
    lines: Lines<BufReader<Stdin>>,
}

impl ConsoleUi {
    fn new(install: InstallConfig) -> Self {
        Self {
            install,
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl InstallUi for ConsoleUi {
    async fn collect_options(&mut self) -> Result<InstallOptions> {
        let base_path = match self.install.base_path.clone() {
            Some(path) => path,
            None => PathBuf::from(DEFAULT_BASE_DIR),
        };
        let device = self.install.device.unwrap_or_else(|| {
            let detected = Device::detect();
            tracing::info!("No device configured, detected '{}'", detected);
            detected
        });
        let options = InstallOptions {
            base_path: absolute(&base_path)?,
            device,
            mirrors: self.install.mirrors.normalized(),
            migration_source: self.install.migration_source.clone(),
        };
        tracing::info!(
            "Installing into {} for device '{}'",
            options.base_path.display(),
            options.device
        );
        Ok(options)
    }

    async fn present_report(&mut self, report: &ValidationReport) {
        println!();
        println!("Installation problems found:");
        for (check, status) in &report.checks {
            let mark = match status {
                CheckStatus::Ok => "✓",
                CheckStatus::Warning => "!",
                CheckStatus::Error => "✗",
            };
            println!("  {} {}", mark, check);
        }
        println!();
        println!("Press Enter to re-check, or type: reinstall | reset | clear-cache | quit");
    }

    async fn report_error(&mut self, error: &anyhow::Error) {
        tracing::error!("{:#}", error);
        eprintln!("✗ Error: {:#}", error);
    }

    async fn wait_for_request(&mut self) -> Result<TroubleshootRequest> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                anyhow::bail!("Input closed while installation problems remain");
            };
            if line.trim().eq_ignore_ascii_case("quit") {
                anyhow::bail!("Aborted by user");
            }
            match line.parse::<TroubleshootRequest>() {
                Ok(request) => return Ok(request),
                Err(e) => println!("{}", e),
            }
        }
    }
}
