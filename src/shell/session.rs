use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use super::{
    match_marker, new_marker, ChannelOptions, ChannelSpawner, CommandChannel, CommandResult,
    ShellError, ShellKind,
};
use crate::logs::{LogSink, LogSource};
use crate::utils::{apply_creation_flags, strip_ansi};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Spawns interactive shell processes.
#[derive(Debug, Clone)]
pub struct ShellSpawner {
    program: String,
    args: Vec<String>,
    kind: ShellKind,
}

impl ShellSpawner {
    pub fn new(program: impl Into<String>, args: Vec<String>, kind: ShellKind) -> Self {
        Self {
            program: program.into(),
            args,
            kind,
        }
    }

    /// `sh` on POSIX, `powershell` reading commands from stdin on Windows.
    pub fn platform_default() -> Self {
        match ShellKind::platform_default() {
            ShellKind::PowerShell => Self::new(
                "powershell",
                vec![
                    "-NoLogo".into(),
                    "-NoProfile".into(),
                    "-NonInteractive".into(),
                    "-Command".into(),
                    "-".into(),
                ],
                ShellKind::PowerShell,
            ),
            ShellKind::Posix => Self::new("sh", Vec::new(), ShellKind::Posix),
        }
    }

    /// A configured shell program; the dialect is guessed from its name.
    pub fn from_program(program: &str) -> Self {
        let lower = program.to_lowercase();
        if lower.contains("pwsh") || lower.contains("powershell") {
            Self::new(
                program,
                vec!["-NoLogo".into(), "-NoProfile".into(), "-Command".into(), "-".into()],
                ShellKind::PowerShell,
            )
        } else {
            Self::new(program, Vec::new(), ShellKind::Posix)
        }
    }

    pub fn kind(&self) -> ShellKind {
        self.kind
    }
}

impl ChannelSpawner for ShellSpawner {
    type Channel = ShellChannel;

    async fn spawn(&self, options: &ChannelOptions) -> Result<Self::Channel, ShellError> {
        ShellChannel::spawn(self, options).await
    }
}

/// A live shell session. Dropping it kills the shell.
pub struct ShellChannel {
    kind: ShellKind,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::UnboundedReceiver<(LogSource, String)>,
    pid: Option<u32>,
}

impl ShellChannel {
    async fn spawn(spawner: &ShellSpawner, options: &ChannelOptions) -> Result<Self, ShellError> {
        let mut cmd = Command::new(&spawner.program);
        cmd.args(&spawner.args)
            .current_dir(&options.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ShellError::Spawn {
            program: spawner.program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or(ShellError::Stdio)?;
        let stdout = child.stdout.take().ok_or(ShellError::Stdio)?;
        let stderr = child.stderr.take().ok_or(ShellError::Stdio)?;

        let (tx, rx) = mpsc::unbounded_channel();
        forward_lines(stdout, LogSource::Stdout, options.sink.clone(), tx.clone());
        forward_lines(stderr, LogSource::Stderr, options.sink.clone(), tx);

        tracing::debug!("Shell '{}' started (pid: {:?})", spawner.program, pid);
        options
            .sink
            .system(format!("Shell '{}' started", spawner.program));

        Ok(Self {
            kind: spawner.kind,
            child,
            stdin: Some(stdin),
            lines: rx,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl CommandChannel for ShellChannel {
    fn kind(&self) -> ShellKind {
        self.kind
    }

    async fn run(&mut self, command: &str) -> Result<CommandResult, ShellError> {
        let marker = new_marker();
        let payload = format!("{}\n{}\n", command.trim_end(), self.kind.trailer(&marker));

        let stdin = self.stdin.as_mut().ok_or(ShellError::Closed)?;
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(ShellError::Write)?;
        stdin.flush().await.map_err(ShellError::Write)?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = None;
        let mut stderr_done = false;
        while let Some((source, raw)) = self.lines.recv().await {
            let clean = strip_ansi(&raw);
            let buf = match source {
                LogSource::Stderr => &mut stderr,
                _ => &mut stdout,
            };
            let Some((partial, code_text)) = match_marker(&clean, &marker) else {
                buf.push_str(&clean);
                buf.push('\n');
                continue;
            };
            if !partial.trim().is_empty() {
                buf.push_str(partial);
                buf.push('\n');
            }
            if source == LogSource::Stderr {
                stderr_done = true;
            } else {
                exit_code = Some(self.kind.parse_exit(code_text));
            }
            if let (Some(code), true) = (exit_code, stderr_done) {
                return Ok(CommandResult {
                    exit_code: Some(code),
                    stdout,
                    stderr,
                });
            }
        }
        Err(ShellError::Closed)
    }

    async fn shutdown(&mut self) {
        // closing stdin lets the shell exit on its own; kill if it lingers
        drop(self.stdin.take());
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("Shell (pid: {:?}) exited with {}", self.pid, status),
            Ok(Err(e)) => tracing::warn!("Failed to wait for shell (pid: {:?}): {}", self.pid, e),
            Err(_) => {
                tracing::warn!("Shell (pid: {:?}) did not exit, killing", self.pid);
                if let Err(e) = self.child.kill().await {
                    tracing::warn!("Failed to kill shell (pid: {:?}): {}", self.pid, e);
                }
            }
        }
    }
}

/// Read lines (lossy UTF-8) into the sink and the channel's line queue.
fn forward_lines<R>(
    reader: R,
    source: LogSource,
    sink: LogSink,
    tx: mpsc::UnboundedSender<(LogSource, String)>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    sink.push(source, line.clone());
                    if tx.send((source, line)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}
