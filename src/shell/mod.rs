//! Command channel: runs commands through one long-lived interactive shell.
//!
//! The shell gives no "command finished" event, so every command is followed
//! by a trailer that echoes a unique marker plus the shell's last-exit-code
//! expression, and the bare marker on stderr. Output is scanned
//! (ANSI-stripped) for the marker; the rest of the stdout line is the exit
//! code. A command is complete once both streams have shown it.
//!
//! ```text
//! > uv pip install -r requirements.txt
//! > echo "__RK_DONE_<uuid>__:$?"; echo "__RK_DONE_<uuid>__" 1>&2
//! ...installer output...
//! __RK_DONE_<uuid>__:0          ← stdout: exit code
//! __RK_DONE_<uuid>__            ← stderr: drained
//! ```
//!
//! Callers only see the [`CommandChannel`] / [`ChannelSpawner`] traits, so a
//! structured-exec backend can replace the shell without touching them.

mod session;

use std::path::PathBuf;
use std::time::Duration;

pub use session::{ShellChannel, ShellSpawner};

use crate::logs::LogSink;

/// PowerShell reports `False` for a failed command; there is no numeric code.
pub const POWERSHELL_FAILURE_EXIT: i32 = -999;

/// The marker line carried something that is neither a number nor a boolean.
pub const UNKNOWN_EXIT: i32 = -998;

const MARKER_PREFIX: &str = "__RK_DONE_";

// ─── Types ───────────────────────────────────────────────────

/// Outcome of one command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr; used where the tool mixes the two.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ShellError {
    #[error("Failed to spawn shell '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Shell stdio handles are unavailable")]
    Stdio,

    #[error("Failed to write to shell: {0}")]
    Write(#[source] std::io::Error),

    #[error("Shell exited before the command completed")]
    Closed,

    #[error("Command did not complete within {0:?}")]
    Timeout(Duration),
}

impl ShellError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "SHELL_SPAWN_FAILED",
            Self::Stdio => "SHELL_STDIO",
            Self::Write(_) => "SHELL_WRITE_FAILED",
            Self::Closed => "SHELL_CLOSED",
            Self::Timeout(_) => "SHELL_TIMEOUT",
        }
    }
}

// ─── Shell dialects ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    /// sh / bash / zsh
    Posix,
    PowerShell,
}

impl ShellKind {
    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            Self::PowerShell
        } else {
            Self::Posix
        }
    }

    /// Trailer line appended after each command. The marker goes to both
    /// streams so neither is cut short; only stdout carries the exit code.
    pub fn trailer(&self, marker: &str) -> String {
        match self {
            Self::Posix => format!("echo \"{m}:$?\"; echo \"{m}\" 1>&2", m = marker),
            Self::PowerShell => format!(
                "Write-Output \"{m}:$?\"; [Console]::Error.WriteLine(\"{m}\")",
                m = marker
            ),
        }
    }

    /// Quote one argument so the shell passes it through untouched.
    pub fn quote(&self, arg: &str) -> String {
        let safe = !arg.is_empty()
            && arg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
        if safe {
            return arg.to_string();
        }
        match self {
            Self::Posix => format!("'{}'", arg.replace('\'', r"'\''")),
            Self::PowerShell => format!("'{}'", arg.replace('\'', "''")),
        }
    }

    /// Render an argv into a single command line for this shell.
    pub fn render(&self, argv: &[String]) -> String {
        let quoted: Vec<String> = argv.iter().map(|a| self.quote(a)).collect();
        match self {
            Self::Posix => quoted.join(" "),
            // call operator so a quoted program path is executed, not echoed
            Self::PowerShell => format!("& {}", quoted.join(" ")),
        }
    }

    /// Interpret the text after the marker as an exit code.
    pub fn parse_exit(&self, text: &str) -> i32 {
        let text = text.trim();
        if let Ok(code) = text.parse::<i32>() {
            return code;
        }
        match (self, text) {
            (Self::PowerShell, "True") => 0,
            (Self::PowerShell, "False") => POWERSHELL_FAILURE_EXIT,
            _ => UNKNOWN_EXIT,
        }
    }
}

/// New marker token, unique per command.
pub(crate) fn new_marker() -> String {
    format!("{}{}__", MARKER_PREFIX, uuid::Uuid::new_v4().simple())
}

/// If `line` (already ANSI-stripped) carries the completion marker, return
/// the output that preceded it on the same line and the exit-code text.
///
/// Output without a trailing newline puts the marker mid-line. An echoed
/// trailer command (`"<marker>:$?"`) is not a completion.
pub(crate) fn match_marker<'a>(line: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    let pos = line.find(marker)?;
    let before = &line[..pos];
    if before.ends_with('"') {
        return None;
    }
    let rest = &line[pos + marker.len()..];
    Some((before, rest.strip_prefix(':').unwrap_or(rest)))
}

// ─── Channel traits ──────────────────────────────────────────

/// Everything a spawned channel needs from its owner.
#[derive(Clone)]
pub struct ChannelOptions {
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Receives every raw output line, trailer echo included.
    pub sink: LogSink,
}

/// One command at a time; `&mut self` keeps callers from interleaving.
#[allow(async_fn_in_trait)]
pub trait CommandChannel {
    fn kind(&self) -> ShellKind;

    /// Run a command line and resolve with its exit code.
    async fn run(&mut self, command: &str) -> Result<CommandResult, ShellError>;

    /// Tear down the process behind the channel.
    async fn shutdown(&mut self);

    /// `run` bounded by a wall-clock timeout.
    async fn run_and_wait(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ShellError> {
        match tokio::time::timeout(timeout, self.run(command)).await {
            Ok(result) => result,
            Err(_) => Err(ShellError::Timeout(timeout)),
        }
    }

    /// Quote `argv` for this shell and run it.
    async fn run_argv(&mut self, argv: &[String]) -> Result<CommandResult, ShellError> {
        let command = self.kind().render(argv);
        self.run(&command).await
    }
}

/// Creates fresh channels; one per logical unit of work.
#[allow(async_fn_in_trait)]
pub trait ChannelSpawner {
    type Channel: CommandChannel;

    async fn spawn(&self, options: &ChannelOptions) -> Result<Self::Channel, ShellError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_exit_codes() {
        let k = ShellKind::Posix;
        assert_eq!(k.parse_exit("0"), 0);
        assert_eq!(k.parse_exit(" 127 "), 127);
        assert_eq!(k.parse_exit("True"), UNKNOWN_EXIT);
        assert_eq!(k.parse_exit(""), UNKNOWN_EXIT);
    }

    #[test]
    fn test_powershell_boolean_sentinels() {
        let k = ShellKind::PowerShell;
        assert_eq!(k.parse_exit("True"), 0);
        assert_eq!(k.parse_exit("False"), POWERSHELL_FAILURE_EXIT);
        assert_eq!(k.parse_exit("1"), 1);
        assert_eq!(k.parse_exit("maybe"), UNKNOWN_EXIT);
        assert_ne!(POWERSHELL_FAILURE_EXIT, UNKNOWN_EXIT);
    }

    #[test]
    fn test_match_marker() {
        let marker = new_marker();
        let line = format!("{}:0", marker);
        assert_eq!(match_marker(&line, &marker), Some(("", "0")));
        assert_eq!(
            match_marker(&format!("  {}:False", marker), &marker),
            Some(("  ", "False"))
        );
        assert_eq!(match_marker("echo something", &marker), None);
        // a different command's marker never matches
        assert_eq!(match_marker(&format!("{}:0", new_marker()), &marker), None);
    }

    #[test]
    fn test_marker_after_unterminated_output() {
        let marker = new_marker();
        let line = format!("no newline|{}:1", marker);
        assert_eq!(match_marker(&line, &marker), Some(("no newline|", "1")));
    }

    #[test]
    fn test_echoed_trailer_is_not_completion() {
        let marker = new_marker();
        let echoed = ShellKind::PowerShell.trailer(&marker);
        assert_eq!(match_marker(&echoed, &marker), None);
    }

    #[test]
    fn test_markers_are_unique() {
        assert_ne!(new_marker(), new_marker());
        assert!(new_marker().starts_with(MARKER_PREFIX));
    }

    #[test]
    fn test_posix_quoting() {
        let k = ShellKind::Posix;
        assert_eq!(k.quote("--dry-run"), "--dry-run");
        assert_eq!(k.quote("/opt/app/requirements.txt"), "/opt/app/requirements.txt");
        assert_eq!(k.quote("my dir"), "'my dir'");
        assert_eq!(k.quote("it's"), r"'it'\''s'");
        assert_eq!(k.quote(""), "''");
    }

    #[test]
    fn test_powershell_render() {
        let k = ShellKind::PowerShell;
        let argv = vec![
            r"C:\Program Files\uv.exe".to_string(),
            "pip".to_string(),
            "install".to_string(),
        ];
        assert_eq!(k.render(&argv), r"& 'C:\Program Files\uv.exe' pip install");
        assert_eq!(k.quote("o'neil"), "'o''neil'");
    }

    #[test]
    fn test_trailers() {
        assert_eq!(ShellKind::Posix.trailer("M"), "echo \"M:$?\"; echo \"M\" 1>&2");
        assert_eq!(
            ShellKind::PowerShell.trailer("M"),
            "Write-Output \"M:$?\"; [Console]::Error.WriteLine(\"M\")"
        );
    }

    #[test]
    fn test_echoed_posix_trailer_is_not_completion() {
        let marker = new_marker();
        assert_eq!(match_marker(&ShellKind::Posix.trailer(&marker), &marker), None);
        // the stderr half carries no exit code
        assert_eq!(match_marker(&marker, &marker), Some(("", "")));
    }

    #[test]
    fn test_combined_output() {
        let r = CommandResult {
            exit_code: Some(0),
            stdout: "a\n".into(),
            stderr: "b\n".into(),
        };
        assert!(r.success());
        assert_eq!(r.combined_output(), "a\nb\n");
    }
}
