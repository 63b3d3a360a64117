//! LXD build environment provider.
//!
//! Drives the `lxc` client through the command executor: project and
//! profile management, base-image launch with reuse, project staging into
//! the build tree, file transfer, and scoped teardown. Backend error text
//! is preserved in the wrapped errors.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use camino::Utf8Path;
use serde_yaml::{Mapping, Value};
use tracing::{debug, trace};
use which::which;

use super::{
    LaunchedEnvironment, Provider, ProviderInstance, ask_user, project_inode,
    project_instance_re, series_image_alias,
};
use crate::env;
use crate::error::LpciError;
use crate::executor::{CommandExecutor, CommandSpec, ExecutionResult, format_command_args};

/// Tag for prepared instances. Any change to the launch configuration
/// bumps this and invalidates cached base instances.
const COMPATIBILITY_TAG: &str = "lpci-buildd-base-v7.0";
const COMPATIBILITY_TAG_KEY: &str = "user.lpci-compatibility-tag";

const IMAGE_REMOTE_NAME: &str = "craft-com.ubuntu.cloud-buildd";
const IMAGE_REMOTE_ADDR: &str = "https://cloud-images.ubuntu.com/buildd/releases";

/// Device name the project is bind-staged through.
const PROJECT_DEVICE: &str = "tmp-project";

const INSTALL_HINT: &str = "Visit https://snapcraft.io/lxd for instructions \
    on how to install the LXD snap for your distribution.";

/// A LXD build environment provider.
pub struct LxdProvider {
    executor: Arc<dyn CommandExecutor>,
    lxd_project: String,
    lxd_remote: String,
}

impl LxdProvider {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            lxd_project: "lpci".to_string(),
            lxd_remote: "local".to_string(),
        }
    }

    /// Runs `lxc` and returns the result regardless of exit status.
    fn lxc_status(
        &self,
        args: Vec<OsString>,
        capture: bool,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecutionResult, LpciError> {
        let mut spec = CommandSpec::new("lxc", args);
        if capture {
            spec = spec.with_capture();
        }
        if let Some(content) = stdin {
            spec = spec.with_stdin(content);
        }
        self.executor
            .execute(&spec)
            .map_err(|e| LpciError::Provider(e.to_string()))
    }

    /// Runs `lxc`, failing on a non-zero exit status.
    fn lxc(
        &self,
        args: Vec<OsString>,
        capture: bool,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecutionResult, LpciError> {
        let rendered = format!("lxc {}", format_command_args(&args));
        let result = self.lxc_status(args, capture, stdin)?;
        if !result.success() {
            return Err(LpciError::Provider(format!(
                "{} failed with exit status {}",
                rendered,
                result.code().unwrap_or(-1)
            )));
        }
        Ok(result)
    }

    fn list_instance_names(&self) -> Result<Vec<String>, LpciError> {
        let result = self.lxc(
            to_args(["list", "--project", &self.lxd_project, "--format", "csv", "--columns", "n"]),
            true,
            None,
        )?;
        Ok(String::from_utf8_lossy(&result.stdout)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    fn ensure_project(&self) -> Result<(), LpciError> {
        let result = self.lxc(to_args(["project", "list", "--format", "csv"]), true, None)?;
        let exists = String::from_utf8_lossy(&result.stdout).lines().any(|line| {
            let name = line.split(',').next().unwrap_or_default();
            name.trim_end_matches(" (current)") == self.lxd_project
        });
        if !exists {
            self.lxc(to_args(["project", "create", &self.lxd_project]), true, None)?;
        }
        Ok(())
    }

    fn ensure_image_remote(&self) -> Result<(), LpciError> {
        let result = self.lxc(to_args(["remote", "list", "--format", "csv"]), true, None)?;
        let exists = String::from_utf8_lossy(&result.stdout)
            .lines()
            .any(|line| line.split(',').next().unwrap_or_default() == IMAGE_REMOTE_NAME);
        if !exists {
            self.lxc(
                to_args([
                    "remote",
                    "add",
                    IMAGE_REMOTE_NAME,
                    IMAGE_REMOTE_ADDR,
                    "--protocol",
                    "simplestreams",
                ]),
                true,
                None,
            )?;
        }
        Ok(())
    }

    /// Copies the default project's default profile into our project,
    /// adding or removing the GPU passthrough keys. Last-write-wins and
    /// idempotent: the same inputs always produce the same profile.
    fn configure_default_profile(&self, gpu_nvidia: bool) -> Result<(), LpciError> {
        let shown = self.lxc(
            to_args(["profile", "show", "default", "--project", "default"]),
            true,
            None,
        )?;
        let mut profile: Mapping = serde_yaml::from_slice(&shown.stdout)
            .map_err(|e| LpciError::Provider(format!("failed to parse default profile: {}", e)))?;

        let config = mapping_entry(&mut profile, "config");
        if gpu_nvidia {
            config.insert(Value::from("nvidia.runtime"), Value::from("true"));
        } else {
            config.remove(&Value::from("nvidia.runtime"));
        }
        let devices = mapping_entry(&mut profile, "devices");
        if gpu_nvidia {
            let mut gpu = Mapping::new();
            gpu.insert(Value::from("type"), Value::from("gpu"));
            devices.insert(Value::from("gpu"), Value::Mapping(gpu));
        } else {
            devices.remove(&Value::from("gpu"));
        }

        let rendered = serde_yaml::to_string(&profile)
            .map_err(|e| LpciError::Provider(format!("failed to render profile: {}", e)))?;
        self.lxc(
            to_args(["profile", "edit", "default", "--project", &self.lxd_project]),
            true,
            Some(rendered.into_bytes()),
        )?;
        Ok(())
    }

    fn instance_exists(&self, name: &str) -> Result<bool, LpciError> {
        let result = self.lxc_status(
            to_args(["info", name, "--project", &self.lxd_project]),
            true,
            None,
        )?;
        Ok(result.success())
    }

    fn instance_compatibility_tag(&self, name: &str) -> Result<String, LpciError> {
        let result = self.lxc(
            to_args(["config", "get", name, COMPATIBILITY_TAG_KEY, "--project", &self.lxd_project]),
            true,
            None,
        )?;
        Ok(String::from_utf8_lossy(&result.stdout).trim().to_string())
    }

    fn delete_instance(&self, name: &str) -> Result<(), LpciError> {
        self.lxc(
            to_args(["delete", name, "--force", "--project", &self.lxd_project]),
            true,
            None,
        )?;
        Ok(())
    }

    /// Launches the named instance from the base image, or reuses a
    /// cached instance whose compatibility tag still matches.
    fn launch_or_reuse(&self, name: &str, alias: &str) -> Result<(), LpciError> {
        if self.instance_exists(name)? {
            if self.instance_compatibility_tag(name)? == COMPATIBILITY_TAG {
                debug!("reusing instance '{}'", name);
                // Tolerate "already running".
                let started = self.lxc_status(
                    to_args(["start", name, "--project", &self.lxd_project]),
                    true,
                    None,
                )?;
                if !started.success() {
                    trace!("lxc start '{}' returned non-zero; instance may be running", name);
                }
                return Ok(());
            }
            debug!("instance '{}' has an outdated base; recreating", name);
            self.delete_instance(name)?;
        }

        self.ensure_image_remote()?;
        self.lxc(
            to_args([
                "launch",
                &format!("{}:{}", IMAGE_REMOTE_NAME, alias),
                name,
                "--project",
                &self.lxd_project,
                "--config",
                &format!("{}={}", COMPATIBILITY_TAG_KEY, COMPATIBILITY_TAG),
            ]),
            true,
            None,
        )?;
        Ok(())
    }

    /// Stages the host project into the build tree: bind-mount at the
    /// staging path, wipe and copy, then unmount the bind.
    fn stage_project(
        &self,
        instance: &mut LxdInstance,
        project_path: &Utf8Path,
    ) -> Result<(), LpciError> {
        let tmp_project = env::managed_environment_tmp_project_path();
        let build_tree = env::managed_environment_project_path();
        let build_parent = env::managed_environment_build_path();

        instance.add_disk_device(PROJECT_DEVICE, project_path, &tmp_project)?;

        let staged = (|| {
            instance.exec_checked(&["rm", "-rf", build_tree.as_str()])?;
            instance.exec_checked(&["mkdir", "-p", build_parent.as_str()])?;
            instance.exec_checked(&["cp", "-a", tmp_project.as_str(), build_tree.as_str()])?;
            // The non-root account jobs may drop privileges to.
            instance.exec_checked(&[
                "bash",
                "-c",
                &format!("id -u {user} >/dev/null 2>&1 || useradd -m {user}", user = env::MANAGED_USER),
            ])
        })();
        let unmounted = instance.remove_disk_device(PROJECT_DEVICE);

        match (staged, unmounted) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Err(stage_err), Err(unmount_err)) => {
                tracing::error!("unmounting staged project also failed: {}", unmount_err);
                Err(stage_err)
            }
        }
    }
}

impl Provider for LxdProvider {
    fn is_available(&self) -> bool {
        which("lxc").is_ok()
    }

    fn ensure_available(&self) -> Result<(), LpciError> {
        if !self.is_available() {
            let install = ask_user(
                "LXD is required, but not installed. Do you wish to install LXD \
                 and configure it with the defaults?",
                false,
            )?;
            if !install {
                return Err(LpciError::Provider(format!(
                    "LXD is required, but not installed. {}",
                    INSTALL_HINT
                )));
            }
            let installed = self
                .executor
                .execute(&CommandSpec::new("snap", ["install", "lxd"]).with_capture())
                .map_err(|e| LpciError::Provider(e.to_string()))?;
            let initialized = if installed.success() {
                self.executor
                    .execute(&CommandSpec::new("lxd", ["init", "--auto"]).with_capture())
                    .map_err(|e| LpciError::Provider(e.to_string()))?
                    .success()
            } else {
                false
            };
            if !installed.success() || !initialized {
                return Err(LpciError::Provider(format!(
                    "Failed to install LXD. {}",
                    INSTALL_HINT
                )));
            }
        }

        let ready = self
            .executor
            .execute(&CommandSpec::new("lxd", ["waitready", "--timeout=600"]).with_capture())
            .map_err(|e| LpciError::Provider(e.to_string()))?;
        if !ready.success() {
            return Err(LpciError::Provider("LXD is installed but not ready for use".to_string()));
        }
        Ok(())
    }

    fn clean_project_environments(
        &self,
        project_name: &str,
        project_path: &Utf8Path,
        instances: &[String],
    ) -> Result<Vec<String>, LpciError> {
        let mut deleted = Vec::new();
        if !self.is_available() {
            return Ok(deleted);
        }

        let inode = project_inode(project_path)?;
        let names = if instances.is_empty() {
            self.list_instance_names()?
        } else {
            instances.to_vec()
        };

        let matcher = project_instance_re(project_name, inode);
        for name in names {
            if matcher.is_match(&name) {
                trace!("Deleting container '{}'.", name);
                self.delete_instance(&name)?;
                deleted.push(name);
            } else {
                trace!("Not deleting container '{}'.", name);
            }
        }
        Ok(deleted)
    }

    fn launched_environment(
        &self,
        project_name: &str,
        project_path: &Utf8Path,
        series: &str,
        architecture: &str,
        gpu_nvidia: bool,
    ) -> Result<Box<dyn LaunchedEnvironment>, LpciError> {
        let alias = series_image_alias(series)
            .ok_or_else(|| LpciError::Provider(format!("no base image alias for series '{}'", series)))?;
        let instance_name =
            self.get_instance_name(project_name, project_path, series, architecture)?;

        self.ensure_project()?;
        self.configure_default_profile(gpu_nvidia)?;
        self.launch_or_reuse(&instance_name, alias)?;

        let mut instance = LxdInstance {
            name: instance_name,
            lxd_project: self.lxd_project.clone(),
            lxd_remote: self.lxd_remote.clone(),
            executor: self.executor.clone(),
            command_env: self.get_command_environment(),
            devices: Vec::new(),
            released: false,
        };

        if let Err(e) = self.stage_project(&mut instance, project_path) {
            if let Err(release_err) = instance.release() {
                tracing::error!("teardown after failed staging also failed: {}", release_err);
            }
            return Err(e);
        }
        Ok(Box::new(instance))
    }
}

/// A running LXD instance scoped to one job variant.
pub struct LxdInstance {
    name: String,
    lxd_project: String,
    lxd_remote: String,
    executor: Arc<dyn CommandExecutor>,
    command_env: BTreeMap<String, String>,
    /// Disk devices added to this instance, removed again at release.
    devices: Vec<String>,
    released: bool,
}

impl LxdInstance {
    fn scoped_name(&self) -> String {
        format!("{}:{}", self.lxd_remote, self.name)
    }

    /// `<remote>:<name><absolute path>` as `lxc file` wants it; the path
    /// is appended byte-for-byte so non-UTF-8 names survive.
    fn file_location(&self, path: &Path) -> OsString {
        let mut location = OsString::from(self.scoped_name());
        location.push(path.as_os_str());
        location
    }

    fn lxc(&self, args: Vec<OsString>, capture: bool, stdin: Option<Vec<u8>>) -> Result<ExecutionResult, LpciError> {
        let mut spec = CommandSpec::new("lxc", args);
        if capture {
            spec = spec.with_capture();
        }
        if let Some(content) = stdin {
            spec = spec.with_stdin(content);
        }
        self.executor
            .execute(&spec)
            .map_err(|e| LpciError::Provider(e.to_string()))
    }

    fn lxc_checked(&self, args: Vec<OsString>, capture: bool, stdin: Option<Vec<u8>>) -> Result<ExecutionResult, LpciError> {
        let rendered = format!("lxc {}", format_command_args(&args));
        let result = self.lxc(args, capture, stdin)?;
        if !result.success() {
            return Err(LpciError::Provider(format!(
                "{} failed with exit status {}",
                rendered,
                result.code().unwrap_or(-1)
            )));
        }
        Ok(result)
    }

    /// Runs a command in the instance, failing on non-zero exit.
    fn exec_checked(&self, command: &[&str]) -> Result<(), LpciError> {
        let command: Vec<OsString> = command.iter().map(OsString::from).collect();
        let result = self.execute_run(&command, None, &BTreeMap::new(), true)?;
        if !result.success() {
            return Err(LpciError::Provider(format!(
                "command {} failed in instance '{}' with exit status {}",
                format_command_args(&command),
                self.name,
                result.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }

    fn add_disk_device(
        &mut self,
        device: &str,
        source: &Utf8Path,
        target: &Utf8Path,
    ) -> Result<(), LpciError> {
        self.lxc_checked(
            to_args([
                "config",
                "device",
                "add",
                &self.name,
                device,
                "disk",
                &format!("source={}", source),
                &format!("path={}", target),
                "--project",
                &self.lxd_project,
            ]),
            true,
            None,
        )?;
        self.devices.push(device.to_string());
        Ok(())
    }

    fn remove_disk_device(&mut self, device: &str) -> Result<(), LpciError> {
        self.lxc_checked(
            to_args([
                "config",
                "device",
                "remove",
                &self.name,
                device,
                "--project",
                &self.lxd_project,
            ]),
            true,
            None,
        )?;
        self.devices.retain(|name| name != device);
        Ok(())
    }
}

impl ProviderInstance for LxdInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute_run(
        &self,
        command: &[OsString],
        cwd: Option<&Utf8Path>,
        environment: &BTreeMap<String, String>,
        capture: bool,
    ) -> Result<ExecutionResult, LpciError> {
        let mut args: Vec<OsString> = to_args(["exec", &self.scoped_name(), "--project", &self.lxd_project]);
        if let Some(cwd) = cwd {
            args.push("--cwd".into());
            args.push(cwd.as_str().into());
        }
        let mut merged = self.command_env.clone();
        merged.extend(environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (key, value) in &merged {
            args.push("--env".into());
            args.push(format!("{}={}", key, value).into());
        }
        args.push("--".into());
        args.extend(command.iter().cloned());
        self.lxc(args, capture, None)
    }

    fn pull_file(&self, source: &Path, destination: &Path) -> Result<(), LpciError> {
        let mut args: Vec<OsString> = to_args(["file", "pull"]);
        args.push(self.file_location(source));
        args.push(destination.as_os_str().to_owned());
        args.push("--project".into());
        args.push(self.lxd_project.clone().into());
        self.lxc_checked(args, true, None)?;
        Ok(())
    }

    fn push_file(&self, source: &Path, destination: &Path) -> Result<(), LpciError> {
        let mut args: Vec<OsString> = to_args(["file", "push"]);
        args.push(source.as_os_str().to_owned());
        args.push(self.file_location(destination));
        args.push("--project".into());
        args.push(self.lxd_project.clone().into());
        self.lxc_checked(args, true, None)?;
        Ok(())
    }

    fn push_file_io(
        &self,
        destination: &Utf8Path,
        content: &[u8],
        file_mode: &str,
    ) -> Result<(), LpciError> {
        let mut args: Vec<OsString> = to_args(["file", "push", "-"]);
        args.push(self.file_location(destination.as_std_path()));
        args.extend(to_args([
            "--mode",
            file_mode,
            "--uid",
            "0",
            "--gid",
            "0",
            "--project",
            &self.lxd_project,
        ]));
        self.lxc_checked(args, true, Some(content.to_vec()))?;
        Ok(())
    }
}

impl LaunchedEnvironment for LxdInstance {
    fn release(&mut self) -> Result<(), LpciError> {
        if self.released {
            return Ok(());
        }

        let mut errors: Vec<String> = Vec::new();

        let build_tree = env::managed_environment_project_path();
        if let Err(e) = self.exec_checked(&["rm", "-rf", build_tree.as_str()]) {
            errors.push(e.to_string());
        }
        for device in self.devices.clone() {
            if let Err(e) = self.remove_disk_device(&device) {
                errors.push(e.to_string());
            }
        }
        if let Err(e) = self.lxc_checked(
            to_args(["stop", &self.name, "--force", "--project", &self.lxd_project]),
            true,
            None,
        ) {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            self.released = true;
            Ok(())
        } else {
            Err(LpciError::Provider(errors.join("; ")))
        }
    }
}

impl Drop for LxdInstance {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.release()
        {
            tracing::error!(
                "failed to tear down instance '{}' during cleanup: {}. \
                Manual cleanup may be required: lxc delete {} --force --project {}",
                self.name,
                e,
                self.name,
                self.lxd_project
            );
        }
    }
}

fn mapping_entry<'a>(profile: &'a mut Mapping, key: &str) -> &'a mut Mapping {
    let key = Value::from(key);
    if !matches!(profile.get(&key), Some(Value::Mapping(_))) {
        profile.insert(key.clone(), Value::Mapping(Mapping::new()));
    }
    match profile.get_mut(&key) {
        Some(Value::Mapping(mapping)) => mapping,
        _ => unreachable!("entry inserted above"),
    }
}

fn to_args<const N: usize>(args: [&str; N]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}
