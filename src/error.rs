//! Domain-specific error types for lpci.
//!
//! This module defines `LpciError`, a `thiserror`-based enum that provides
//! typed variants for the failure modes the pipeline executor distinguishes.
//! Public API functions return `Result<T, LpciError>` or `anyhow::Result`;
//! `LpciError` implements `Into<anyhow::Error>`, so the `?` operator converts
//! it automatically at boundaries that return `anyhow::Result`.
//!
//! Every variant maps to a process exit code via [`LpciError::retcode`]:
//! user errors exit 1, while a job command that exits non-zero propagates
//! its own status as the process exit code.

use std::io;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent messages for common IO error kinds (e.g.,
/// "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)").
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Domain-specific error type for lpci.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LpciError {
    /// The configuration file could not be loaded, parsed, or validated.
    #[error("configuration error: {0}")]
    Config(String),

    /// A job selected a plugin that is not registered.
    #[error("configuration error: unknown plugin '{0}'")]
    UnknownPlugin(String),

    /// The container provider is unavailable or a backend operation failed.
    /// The backend's own message is preserved verbatim.
    #[error("{0}")]
    Provider(String),

    /// A path produced by the container escaped its containment boundary.
    #[error("'{path}' is not relative to '{container}'")]
    PathEscape {
        /// The offending path, after any symlink resolution.
        path: String,
        /// The boundary the path must stay under.
        container: String,
    },

    /// An output glob pattern matched no files in the build tree.
    #[error("{pattern} has not matched any output files.")]
    NoMatchingFiles {
        /// The pattern as written in the configuration.
        pattern: String,
    },

    /// A command run inside a job's environment exited non-zero.
    #[error("Job '{job}' for {series}/{architecture} failed with exit status {status}.")]
    JobFailed {
        job: String,
        series: String,
        architecture: String,
        /// Exit status of the failing command, surfaced as the process
        /// exit code.
        status: i32,
    },

    /// A fatal condition with an explicit message and exit code, used for
    /// stage aggregation and input-resolution failures.
    #[error("{message}")]
    Command { message: String, retcode: i32 },

    /// A backend command could not be executed (spawn failure, wait
    /// failure, reader-thread panic, missing binary).
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command that was executed.
        command: String,
        /// Human-readable reason for the failure.
        status: String,
    },

    /// The run was cancelled by a signal; teardown has already run.
    #[error("Interrupted.")]
    Interrupted,

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred, usually a path.
        context: String,
        /// Derived from [`io_error_kind_message`] for consistent formatting.
        message: String,
        #[source]
        source: std::io::Error,
    },
}

impl LpciError {
    /// Creates an `Io` variant with the `message` field derived from the
    /// `source` via [`io_error_kind_message`].
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Creates a `Command` variant with the default user-error exit code.
    pub(crate) fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
            retcode: 1,
        }
    }

    /// Creates an `Execution` variant from a command spec and a status
    /// description.
    pub(crate) fn execution(spec: &crate::executor::CommandSpec, status: impl Into<String>) -> Self {
        let command = if spec.args.is_empty() {
            spec.command.clone()
        } else {
            format!(
                "{} {}",
                spec.command,
                crate::executor::format_command_args(&spec.args)
            )
        };
        Self::Execution {
            command,
            status: status.into(),
        }
    }

    /// Creates an `Execution` variant for a binary that could not be found
    /// on PATH.
    pub(crate) fn command_not_found(command: &str) -> Self {
        Self::Execution {
            command: command.to_string(),
            status: "command not found on PATH".to_string(),
        }
    }

    /// The process exit code this error maps to.
    pub fn retcode(&self) -> i32 {
        match self {
            Self::JobFailed { status, .. } => *status,
            Self::Command { retcode, .. } => *retcode,
            _ => 1,
        }
    }
}
