//! Server supervisor: launches the bundled server and owns its lifetime.
//!
//! `start` spawns the process and races three events; the first one wins:
//!
//! ```text
//!   process exits ──── code 0 → Ok, otherwise Crashed / ProcessError
//!   health probe  ──── 2xx    → Ok (process keeps running)
//!   deadline      ──── TimedOutWhilstStarting (process may still be alive)
//! ```

mod args;
mod health;
mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;

pub use args::{build_cli_args, core_args, merge_args, ServerArgs};
pub use health::{health_url, HealthProbe};
pub use process::{wait_for_exit, ProcessState, ServerProcess};

use crate::config::FrozenServerConfig;
use crate::events::tracked;
use crate::logs::{LogLine, LogSink};

// ─── Errors ──────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("Server is already running (pid {pid:?})")]
    AlreadyRunning { pid: Option<u32> },

    #[error("Failed to spawn server '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server exited during startup (exit code {code:?})")]
    Crashed { code: Option<i32> },

    #[error("Failed to wait for server process: {0}")]
    ProcessError(String),

    #[error("Server did not become ready within {waited:?}")]
    TimedOutWhilstStarting { waited: Duration },

    #[error("Failed to signal server: {0}")]
    KillSignal(String),

    #[error("Server did not exit within {0:?} of being signalled")]
    KillTimeout(Duration),
}

impl ServerError {
    /// The server may still be starting in the background.
    pub fn timed_out_whilst_starting(&self) -> bool {
        matches!(self, Self::TimedOutWhilstStarting { .. })
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::Crashed { .. } => "SERVER_CRASHED",
            Self::ProcessError(_) => "PROCESS_ERROR",
            Self::TimedOutWhilstStarting { .. } => "STARTUP_TIMEOUT",
            Self::KillSignal(_) => "KILL_FAILED",
            Self::KillTimeout(_) => "KILL_TIMEOUT",
        }
    }
}

// ─── Launch description ──────────────────────────────────────

/// How to run the server; flags from [`ServerArgs`] are appended after
/// `prefix_args`.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: PathBuf,
    /// Entry script and fixed options
    pub prefix_args: Vec<String>,
    /// Flags the launcher controls; these win over user flags
    pub core_args: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            core_args: BTreeMap::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Full argv after `program` for the given user args.
    pub fn argv(&self, args: &ServerArgs) -> Vec<String> {
        let mut argv = self.prefix_args.clone();
        argv.extend(build_cli_args(&merge_args(&args.to_map(), &self.core_args)));
        argv
    }

    /// Address the server will actually bind, core flags applied.
    pub fn effective_address(&self, args: &ServerArgs) -> (String, u16) {
        let listen = self
            .core_args
            .get("listen")
            .cloned()
            .unwrap_or_else(|| args.listen.clone());
        let port = self
            .core_args
            .get("port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(args.port);
        (listen, port)
    }
}

// ─── Supervisor ──────────────────────────────────────────────

pub struct ServerSupervisor {
    config: FrozenServerConfig,
    launch: LaunchCommand,
    sink: LogSink,
    process: Option<ServerProcess>,
}

impl ServerSupervisor {
    pub fn new(config: FrozenServerConfig, launch: LaunchCommand, sink: LogSink) -> Self {
        Self {
            config,
            launch,
            sink,
            process: None,
        }
    }

    /// User args from config (`listen`, `port`, `extra_args`).
    pub fn default_args(&self) -> ServerArgs {
        ServerArgs {
            listen: self.config.listen.clone(),
            port: self.config.port,
            extra: self.config.extra_args.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.process.as_ref().map(|p| p.is_running()).unwrap_or(false)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid())
    }

    /// Exit code of the last process, once it has exited.
    pub fn exit_code(&self) -> Option<i32> {
        match self.process.as_ref()?.state() {
            ProcessState::Exited(code) => code,
            _ => None,
        }
    }

    /// Live server output.
    pub fn logs(&self) -> broadcast::Receiver<LogLine> {
        self.sink.subscribe()
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    /// Spawn the server and wait until it is ready, exits or times out.
    pub async fn start(&mut self, args: &ServerArgs) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning { pid: self.pid() });
        }

        let argv = self.launch.argv(args);
        tracing::info!(
            "Starting server: {} {}",
            self.launch.program.display(),
            argv.join(" ")
        );

        let process = ServerProcess::spawn(
            &self.launch.program,
            &argv,
            self.launch.cwd.as_deref(),
            &self.launch.env,
            self.sink.clone(),
        )
        .map_err(|source| ServerError::Spawn {
            program: self.launch.program.to_string_lossy().into_owned(),
            source,
        })?;
        let mut exit_rx = process.watch();
        self.process = Some(process);

        let (listen, port) = self.launch.effective_address(args);
        let probe = HealthProbe::new(&listen, port, &self.config.health_path);
        let interval = self.config.poll_interval();
        let max_wait = self.config.max_wait();

        tracked("start_server", async {
            tokio::select! {
                biased;
                state = wait_for_exit(&mut exit_rx) => match state {
                    ProcessState::Exited(Some(0)) => {
                        tracing::info!("Server exited cleanly during startup");
                        Ok(())
                    }
                    ProcessState::Exited(code) => Err(ServerError::Crashed { code }),
                    ProcessState::Failed(msg) => Err(ServerError::ProcessError(msg)),
                    ProcessState::Running => Err(ServerError::ProcessError(
                        "exit watch closed while running".to_string(),
                    )),
                },
                _ = probe.wait_until_ready(interval) => Ok(()),
                _ = tokio::time::sleep(max_wait) => {
                    tracing::warn!(
                        "Server at {} still not responding after {:?}",
                        probe.url(),
                        max_wait
                    );
                    Err(ServerError::TimedOutWhilstStarting { waited: max_wait })
                }
            }
        })
        .await
    }

    /// Terminate the server and wait for it to exit.
    pub async fn kill(&mut self) -> Result<(), ServerError> {
        let Some(process) = self.process.as_ref() else {
            return Ok(());
        };
        if !process.is_running() {
            self.process = None;
            return Ok(());
        }

        tracing::info!("Stopping server (pid {:?})", process.pid());
        process.terminate().await.map_err(ServerError::KillSignal)?;

        let timeout = self.config.kill_timeout();
        let mut rx = process.watch();
        match tokio::time::timeout(timeout, wait_for_exit(&mut rx)).await {
            Ok(state) => {
                tracing::info!("Server stopped: {:?}", state);
                self.process = None;
                Ok(())
            }
            Err(_) => Err(ServerError::KillTimeout(timeout)),
        }
    }
}
