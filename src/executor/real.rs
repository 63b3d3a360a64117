//! Real command executor implementation.
//!
//! This module provides [`RealCommandExecutor`], which executes commands
//! using `std::process::Command` with real-time output streaming, or with
//! captured stdout when the spec requests it.

use std::process::{Child, Command, Stdio};
use std::thread;
use std::thread::JoinHandle;

use anyhow::Result;
use which::which;

use super::pipe::{StreamType, panic_message, read_pipe_to_log, read_pipe_to_vec};
use super::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::error::LpciError;

/// Cleans up a child process and its associated reader threads.
///
/// Kills the child process, waits for it to terminate, and joins all
/// reader threads to prevent resource leaks. Called from error paths in
/// [`RealCommandExecutor::execute()`].
fn cleanup_child_process<T, I>(child: &mut Child, handles: I)
where
    I: IntoIterator<Item = JoinHandle<T>>,
{
    let pid = child.id();
    if let Err(e) = child.kill() {
        tracing::debug!(pid = pid, "kill returned error (process may have already exited): {}", e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = pid, "failed to wait for child process after kill: {}", e);
    }
    for handle in handles {
        if let Err(e) = handle.join() {
            tracing::warn!("reader thread panicked during cleanup: {}", panic_message(&*e));
        }
    }
}

/// Command executor that runs actual system commands.
pub struct RealCommandExecutor;

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        let program = which(&spec.command).map_err(|e| {
            tracing::debug!("command lookup failed for '{}': {}", spec.command, e);
            LpciError::command_not_found(&spec.command)
        })?;

        let mut command = Command::new(&program);
        command.args(&spec.args);

        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd.as_std_path());
        }

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Err(
                    LpciError::execution(spec, format!("failed to spawn command: {}", e)).into(),
                );
            }
        };

        tracing::trace!("spawned command: {}: pid={}", spec.command, child.id());

        // Write stdin before spawning readers and close it so the child
        // sees EOF; the payloads here (profiles, sources lists) are far
        // smaller than the pipe buffer.
        if let Some(content) = &spec.stdin {
            use std::io::Write;
            if let Some(mut stdin) = child.stdin.take()
                && let Err(e) = stdin.write_all(content)
            {
                cleanup_child_process::<Vec<u8>, _>(&mut child, []);
                return Err(
                    LpciError::execution(spec, format!("failed to write to stdin: {}", e)).into(),
                );
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let capture = spec.capture;

        let stdout_handle = match thread::Builder::new()
            .name("stdout-reader".to_string())
            .spawn(move || {
                if capture {
                    read_pipe_to_vec(stdout_pipe)
                } else {
                    read_pipe_to_log(stdout_pipe, StreamType::Stdout);
                    Vec::new()
                }
            }) {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process::<Vec<u8>, _>(&mut child, []);
                return Err(LpciError::execution(
                    spec,
                    format!("failed to spawn stdout reader thread: {}", e),
                )
                .into());
            }
        };

        let stderr_handle = match thread::Builder::new()
            .name("stderr-reader".to_string())
            .spawn(move || read_pipe_to_log(stderr_pipe, StreamType::Stderr))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, [stdout_handle]);
                return Err(LpciError::execution(
                    spec,
                    format!("failed to spawn stderr reader thread: {}", e),
                )
                .into());
            }
        };

        let status = match child.wait() {
            Ok(s) => s,
            Err(e) => {
                // If waiting fails, the process might still be running.
                // Kill it and join both readers to prevent resource leaks.
                let pid = child.id();
                if let Err(kill_err) = child.kill() {
                    tracing::debug!(pid = pid, "kill returned error: {}", kill_err);
                }
                if let Err(join_err) = stdout_handle.join() {
                    tracing::warn!("stdout reader panicked during cleanup: {}", panic_message(&*join_err));
                }
                if let Err(join_err) = stderr_handle.join() {
                    tracing::warn!("stderr reader panicked during cleanup: {}", panic_message(&*join_err));
                }
                return Err(LpciError::execution(
                    spec,
                    format!("failed to wait for command: {}", e),
                )
                .into());
            }
        };

        let stdout = match stdout_handle.join() {
            Ok(bytes) => bytes,
            Err(e) => {
                let msg = panic_message(&*e);
                tracing::error!(stream = "stdout", panic = msg, "reader thread panicked");
                return Err(LpciError::execution(
                    spec,
                    format!("stdout reader thread panicked: {}", msg),
                )
                .into());
            }
        };
        if let Err(e) = stderr_handle.join() {
            let msg = panic_message(&*e);
            tracing::error!(stream = "stderr", panic = msg, "reader thread panicked");
            return Err(LpciError::execution(
                spec,
                format!("stderr reader thread panicked: {}", msg),
            )
            .into());
        }

        tracing::trace!("executed command: {}: success={}", spec.command, status.success());

        Ok(ExecutionResult {
            status: Some(status),
            stdout,
        })
    }
}
