//! Managed-environment constants and helpers.
//!
//! A "managed environment" is the container instance in which a job's
//! commands execute. The paths here are fixed by the build-farm contract:
//! home is `/root`, the project is bind-staged at `/root/tmp-project` and
//! then copied to `/build/lpci/project`.

use std::env;

use camino::{Utf8Path, Utf8PathBuf};

/// Environment variable marking that lpci itself runs inside a managed
/// environment (set by the build-farm dispatcher).
pub const MANAGED_MODE_ENV: &str = "LPCI_MANAGED_MODE";

/// Name of the non-root user account inside managed environments.
pub const MANAGED_USER: &str = "_lpci";

/// Home directory inside a managed environment.
pub fn managed_environment_home_path() -> Utf8PathBuf {
    Utf8PathBuf::from("/root")
}

/// Staging path the host project is bind-mounted at before being copied
/// into the build tree.
pub fn managed_environment_tmp_project_path() -> Utf8PathBuf {
    managed_environment_home_path().join("tmp-project")
}

/// The build tree: where a job's commands run inside the container.
pub fn managed_environment_project_path() -> Utf8PathBuf {
    Utf8PathBuf::from("/build/lpci/project")
}

/// Parent of the build tree; output paths may escape into it by one level.
pub fn managed_environment_build_path() -> Utf8PathBuf {
    managed_environment_project_path()
        .parent()
        .unwrap_or(Utf8Path::new("/"))
        .to_owned()
}

/// True when running under the build-farm dispatcher.
pub fn is_managed_mode() -> bool {
    env::var(MANAGED_MODE_ENV).as_deref() == Ok("1")
}

/// The host's architecture under its dpkg name, which is what job
/// `architectures` lists use.
pub fn get_host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "powerpc64" => "ppc64el",
        other => other,
    }
}
