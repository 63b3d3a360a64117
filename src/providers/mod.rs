//! Build environment provider support.
//!
//! A provider creates, reuses, and destroys the per-job container
//! instances jobs run in. Instance names are deterministic in
//! (project name, project-path inode, series, architecture), so re-runs
//! reuse cached base instances and `--clean` reliably targets them.
//!
//! The LXD backend in [`lxd`] is the reference implementation; everything
//! above it talks to the [`Provider`] / [`ProviderInstance`] traits only.

pub mod lxd;

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::LazyLock;

use camino::Utf8Path;
use regex::Regex;

use crate::env::{MANAGED_MODE_ENV, is_managed_mode};
use crate::error::LpciError;
use crate::executor::ExecutionResult;

/// Shell PATH baseline inside managed environments.
const COMMAND_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:/snap/bin";

/// Host environment variables forwarded into backend commands.
const PASSTHROUGH_ENV: &[&str] = &["http_proxy", "https_proxy", "no_proxy"];

/// Base-image aliases per supported series. Data, not code: the build farm
/// adds series faster than this tool releases.
pub const SERIES_TO_BUILDD_IMAGE_ALIAS: &[(&str, &str)] = &[
    ("xenial", "16.04"),
    ("bionic", "18.04"),
    ("focal", "20.04"),
    ("jammy", "22.04"),
    ("mantic", "23.10"),
    ("noble", "24.04"),
    ("oracular", "24.10"),
    ("devel", "devel"),
];

/// Looks up the base-image alias for a series.
pub fn series_image_alias(series: &str) -> Option<&'static str> {
    SERIES_TO_BUILDD_IMAGE_ALIAS
        .iter()
        .find(|(name, _)| *name == series)
        .map(|(_, alias)| *alias)
}

static INSTANCE_NAME_DISALLOWED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9-]").expect("static regex"));

/// Replaces characters the backend rejects in instance names and truncates
/// to the backend's 63-byte limit.
pub fn sanitize_instance_name(name: &str) -> String {
    let mut sanitized = INSTANCE_NAME_DISALLOWED_RE.replace_all(name, "-").into_owned();
    sanitized.truncate(63);
    sanitized
}

/// The inode of the project path, which distinguishes two checkouts of the
/// same project on one host.
pub fn project_inode(project_path: &Utf8Path) -> Result<u64, LpciError> {
    let stat = rustix::fs::stat(project_path.as_std_path())
        .map_err(|e| LpciError::io(project_path.to_string(), e.into()))?;
    Ok(stat.st_ino)
}

/// A running instance a job executes inside.
///
/// Paths on the container side are `Path`/`OsString`, not UTF-8 paths:
/// file names produced by a job can contain arbitrary byte sequences.
pub trait ProviderInstance {
    /// The backend's name for this instance.
    fn name(&self) -> &str;

    /// Runs a command inside the instance. With `capture`, stdout is
    /// collected into the result; otherwise both streams go to the log.
    fn execute_run(
        &self,
        command: &[OsString],
        cwd: Option<&Utf8Path>,
        environment: &BTreeMap<String, String>,
        capture: bool,
    ) -> Result<ExecutionResult, LpciError>;

    /// Copies a file out of the instance to the host.
    fn pull_file(&self, source: &Path, destination: &Path) -> Result<(), LpciError>;

    /// Copies a host file into the instance by absolute path. The parent
    /// directory must already exist; callers create it with `mkdir -p`.
    fn push_file(&self, source: &Path, destination: &Path) -> Result<(), LpciError>;

    /// Writes bytes to a file inside the instance with the given mode,
    /// owned by root:root.
    fn push_file_io(
        &self,
        destination: &Utf8Path,
        content: &[u8],
        file_mode: &str,
    ) -> Result<(), LpciError>;
}

/// A prepared instance with scoped teardown.
///
/// Callers must invoke [`release`](LaunchedEnvironment::release) when done
/// with the environment so teardown errors surface; dropping an unreleased
/// environment still tears it down as a backstop.
pub trait LaunchedEnvironment: ProviderInstance {
    /// Removes the build tree, unmounts everything, and stops the
    /// instance. Idempotent.
    fn release(&mut self) -> Result<(), LpciError>;
}

/// A build environment provider.
pub trait Provider {
    /// Check if the provider is installed and available for use.
    fn is_available(&self) -> bool;

    /// Ensure the provider is available, prompting to install it if
    /// required.
    fn ensure_available(&self) -> Result<(), LpciError>;

    /// Deterministic instance name for the given coordinates.
    fn get_instance_name(
        &self,
        project_name: &str,
        project_path: &Utf8Path,
        series: &str,
        architecture: &str,
    ) -> Result<String, LpciError> {
        let inode = project_inode(project_path)?;
        Ok(sanitize_instance_name(&format!(
            "lpci-{}-{}-{}-{}",
            project_name, inode, series, architecture
        )))
    }

    /// Deletes this project's instances and returns their names.
    ///
    /// With `instances` empty, every instance in the provider's namespace
    /// is considered; in either case only names matching this project and
    /// project-path inode are deleted.
    fn clean_project_environments(
        &self,
        project_name: &str,
        project_path: &Utf8Path,
        instances: &[String],
    ) -> Result<Vec<String>, LpciError>;

    /// Launches (or reuses) a prepared instance with the project staged at
    /// the build tree.
    fn launched_environment(
        &self,
        project_name: &str,
        project_path: &Utf8Path,
        series: &str,
        architecture: &str,
        gpu_nvidia: bool,
    ) -> Result<Box<dyn LaunchedEnvironment>, LpciError>;

    /// The environment for commands run via the backend: a fixed PATH
    /// baseline, the managed-mode marker, and proxy passthrough.
    fn get_command_environment(&self) -> BTreeMap<String, String> {
        let mut environment = BTreeMap::from([
            ("PATH".to_string(), COMMAND_PATH.to_string()),
            (MANAGED_MODE_ENV.to_string(), "1".to_string()),
        ]);
        for key in PASSTHROUGH_ENV {
            if let Ok(value) = env::var(key) {
                environment.insert(key.to_string(), value);
            }
        }
        environment
    }
}

/// The regex matching instances owned by a (project, inode) pair.
pub(crate) fn project_instance_re(project_name: &str, inode: u64) -> Regex {
    let sanitized = sanitize_instance_name(project_name);
    Regex::new(&format!(
        "^lpci-{}-{}-.+-.+$",
        regex::escape(&sanitized),
        inode
    ))
    .expect("escaped project name")
}

/// Ask the user for a yes/no answer.
///
/// Returns the default when stdin is not a tty or the answer is empty.
/// Confirmation is not supported in managed mode.
pub(crate) fn ask_user(prompt: &str, default: bool) -> Result<bool, LpciError> {
    if is_managed_mode() {
        return Err(LpciError::Provider(
            "confirmation not supported in managed mode".to_string(),
        ));
    }
    if !std::io::stdin().is_terminal() {
        return Ok(default);
    }

    let choices = if default { " [Y/n]: " } else { " [y/N]: " };
    eprint!("{}{}", prompt, choices);
    let mut reply = String::new();
    std::io::stdin()
        .read_line(&mut reply)
        .map_err(|e| LpciError::io("failed to read confirmation", e))?;
    let reply = reply.trim().to_lowercase();
    Ok(match reply.chars().next() {
        Some('y') => true,
        Some('n') => false,
        _ => default,
    })
}
