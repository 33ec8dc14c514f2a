//! The supervised server process.
//!
//! stdout/stderr are forwarded line by line to a [`LogSink`]; a waiter task
//! owns the child and publishes its state through a watch channel, so the
//! supervisor can race "process exited" against other events without holding
//! the child itself.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use crate::logs::{LogSink, LogSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exit code; `None` when terminated by a signal
    Exited(Option<i32>),
    /// Waiting on the child failed
    Failed(String),
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

pub struct ServerProcess {
    pid: Option<u32>,
    state_rx: watch::Receiver<ProcessState>,
}

impl ServerProcess {
    pub fn spawn(
        program: &Path,
        args: &[String],
        cwd: Option<&Path>,
        env: &[(String, String)],
        sink: LogSink,
    ) -> std::io::Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, LogSource::Stdout, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, LogSource::Stderr, sink.clone()));
        }

        let (state_tx, state_rx) = watch::channel(ProcessState::Running);

        // ── process waiter ───────────────────────────────────
        {
            let sink = sink.clone();
            tokio::spawn(async move {
                let state = match child.wait().await {
                    Ok(status) => {
                        sink.system(format!("Server exited with {}", status));
                        ProcessState::Exited(status.code())
                    }
                    Err(e) => {
                        sink.system(format!("Failed to wait for server: {}", e));
                        ProcessState::Failed(e.to_string())
                    }
                };
                tracing::info!("Server process finished: {:?}", state);
                let _ = state_tx.send(state);
            });
        }

        match pid {
            Some(pid) => sink.system(format!("Server started with PID {}", pid)),
            None => sink.system("Server started"),
        };

        Ok(Self { pid, state_rx })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state_rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state_rx.borrow().is_running()
    }

    /// Independent handle for awaiting the exit.
    pub fn watch(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    /// Ask the process to terminate.
    pub async fn terminate(&self) -> Result<(), String> {
        let Some(pid) = self.pid else {
            return Err("process id is unknown".to_string());
        };
        send_terminate(pid).await
    }
}

#[cfg(unix)]
async fn send_terminate(pid: u32) -> Result<(), String> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| format!("Failed to send SIGTERM to {}: {}", pid, e))
}

#[cfg(not(unix))]
async fn send_terminate(pid: u32) -> Result<(), String> {
    let mut cmd = Command::new("taskkill");
    cmd.args(["/T", "/F", "/PID", &pid.to_string()]);
    crate::utils::apply_creation_flags(&mut cmd);
    let output = cmd
        .output()
        .await
        .map_err(|e| format!("Failed to run taskkill for {}: {}", pid, e))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "taskkill failed for {}: {}",
            pid,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Resolve once the watched process is no longer running.
pub async fn wait_for_exit(rx: &mut watch::Receiver<ProcessState>) -> ProcessState {
    loop {
        let state = rx.borrow_and_update().clone();
        if !state.is_running() {
            return state;
        }
        if rx.changed().await.is_err() {
            // waiter task gone without reporting
            return rx.borrow().clone();
        }
    }
}

async fn forward_lines<R>(reader: R, source: LogSource, sink: LogSink)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink.push(source, line);
    }
}
