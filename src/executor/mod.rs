//! Command execution abstraction for lpci.
//!
//! This module provides:
//! - [`CommandSpec`]: Specification for commands to execute
//! - [`ExecutionResult`]: Result of command execution
//! - [`CommandExecutor`]: Trait for command execution strategies
//! - [`RealCommandExecutor`]: Production implementation using `std::process::Command`
//!
//! All interaction with the container backend goes through this layer, which
//! keeps the provider and the pipeline executor testable with a recording
//! mock.

mod pipe;
mod real;

use std::ffi::OsString;
use std::process::ExitStatus;

use anyhow::Result;
use camino::Utf8PathBuf;

pub use real::RealCommandExecutor;

/// Formats arguments into a space-separated, debug-quoted string.
///
/// Used by error messages to consistently format command arguments
/// (e.g., `"exec" "--" "bash"`).
pub(crate) fn format_command_args(args: &[OsString]) -> String {
    args.iter()
        .map(|a| format!("{:?}", a.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Specification for a command to be executed
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// The command to execute (e.g., "lxc")
    pub command: String,
    /// Command arguments; `OsString` because container-produced file names
    /// may contain arbitrary non-UTF-8 byte sequences
    pub args: Vec<OsString>,
    /// Working directory (optional, defaults to current directory)
    pub cwd: Option<Utf8PathBuf>,
    /// Environment variables to set (in addition to inherited environment)
    pub env: Vec<(String, String)>,
    /// When true, stdout is collected into [`ExecutionResult::stdout`]
    /// instead of being streamed to the log
    pub capture: bool,
    /// Bytes fed to the command's stdin; stdin is closed after writing
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    /// Creates a new CommandSpec with command and args.
    #[must_use]
    pub fn new<I, A>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            capture: false,
            stdin: None,
        }
    }

    /// Sets the working directory
    #[must_use]
    pub fn with_cwd(mut self, cwd: Utf8PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    /// Requests captured stdout instead of streamed output.
    #[must_use]
    pub fn with_capture(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Feeds the given bytes to the command's stdin.
    #[must_use]
    pub fn with_stdin(mut self, content: Vec<u8>) -> Self {
        self.stdin = Some(content);
        self
    }

    /// Adds multiple environment variables.
    #[must_use]
    pub fn with_envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

/// Result of command execution
#[derive(Debug)]
pub struct ExecutionResult {
    /// Exit status of the command
    pub status: Option<ExitStatus>,
    /// Collected stdout bytes; empty unless [`CommandSpec::capture`] was set
    pub stdout: Vec<u8>,
}

impl ExecutionResult {
    /// Returns true if the command executed successfully.
    pub fn success(&self) -> bool {
        self.status.is_none_or(|s| s.success())
    }

    /// Returns the exit code if available
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Trait for command execution.
///
/// Implementations must be `Send + Sync` so the executor can be shared via
/// `Arc<dyn CommandExecutor>` while reader threads stream output.
pub trait CommandExecutor: Send + Sync {
    /// Executes a command with the given specification.
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult>;
}
