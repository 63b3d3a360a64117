//! Pipeline executor.
//!
//! Ties the config model, plugin set, artifact I/O, and container
//! provider together for one full pipeline run or a single indexed job.
//!
//! Within a job, the order is fixed: snaps, packages (including the apt
//! sources rewrite), input copy-in, before/run/after commands, output
//! copy-out, properties write. Stages run in declared order; jobs within a
//! stage all attempt before a combined failure stops the pipeline.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{error, info};

use crate::artifacts;
use crate::config::{Config, Input, Job, License};
use crate::env::{get_host_architecture, managed_environment_project_path};
use crate::error::LpciError;
use crate::interrupt;
use crate::plugin::{PluginSet, PluginSettings, parse_plugin_settings};
use crate::providers::{Provider, ProviderInstance};
use crate::secrets;

/// Options common to `run` and `run-one`.
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    pub output_directory: Option<Utf8PathBuf>,
    /// Delete this run's instances after each job.
    pub clean: bool,
    /// Replacement lines for `/etc/apt/sources.list`, replacing it
    /// wholesale.
    pub replace_package_repositories: Vec<String>,
    /// Extra sources lines appended ahead of per-job repositories.
    pub package_repositories: Vec<String>,
    /// `KEY=VALUE` environment overrides, applied last.
    pub set_env: Vec<String>,
    /// `K=V` plugin settings.
    pub plugin_settings: Vec<String>,
    pub secrets_file: Option<Utf8PathBuf>,
    pub gpu_nvidia: bool,
}

struct JobContext<'a> {
    provider: &'a dyn Provider,
    project_name: &'a str,
    project_path: &'a Utf8Path,
    options: &'a RunOptions,
    secrets: BTreeMap<String, String>,
    plugin_settings: PluginSettings,
    env_overrides: Vec<(String, String)>,
    license: Option<&'a License>,
}

impl<'a> JobContext<'a> {
    fn new(
        config: &'a Config,
        provider: &'a dyn Provider,
        project_name: &'a str,
        project_path: &'a Utf8Path,
        options: &'a RunOptions,
    ) -> Result<Self, LpciError> {
        let secrets = match &options.secrets_file {
            Some(path) => secrets::load_secrets(path)?,
            None => BTreeMap::new(),
        };
        Ok(Self {
            provider,
            project_name,
            project_path,
            options,
            secrets,
            plugin_settings: parse_plugin_settings(&options.plugin_settings)?,
            env_overrides: parse_env_overrides(&options.set_env)?,
            license: config.license.as_ref(),
        })
    }
}

/// Run a pipeline, launching managed environments as needed.
pub fn run_pipeline(
    config: &Config,
    provider: &dyn Provider,
    project_name: &str,
    project_path: &Utf8Path,
    options: &RunOptions,
) -> Result<(), LpciError> {
    provider.ensure_available()?;
    let context = JobContext::new(config, provider, project_name, project_path, options)?;

    for stage in &config.pipeline {
        let mut stage_failed = false;
        for job_name in stage {
            if let Err(e) = run_job_variants(&context, config, job_name.as_str()) {
                // An interrupt aborts the whole pipeline, not just the
                // stage; the failing job's teardown has already run.
                if matches!(e, LpciError::Interrupted) || stage.len() == 1 {
                    // Single-job stage: reraise for simpler error messages.
                    return Err(e);
                }
                error!("{}", e);
                stage_failed = true;
            }
        }
        if stage_failed {
            return Err(LpciError::command(format!(
                "Some jobs in {} failed; stopping.",
                format_stage(stage.iter().map(|name| name.as_str()))
            )));
        }
    }
    Ok(())
}

/// Select and run a single job variant from a pipeline.
///
/// This entry point is for the build-farm dispatcher, which invokes one
/// numbered job at a time.
pub fn run_one(
    config: &Config,
    provider: &dyn Provider,
    project_name: &str,
    project_path: &Utf8Path,
    job_name: &str,
    index: usize,
    options: &RunOptions,
) -> Result<(), LpciError> {
    provider.ensure_available()?;
    let context = JobContext::new(config, provider, project_name, project_path, options)?;

    let variants = config
        .jobs
        .get(job_name)
        .filter(|variants| !variants.is_empty())
        .ok_or_else(|| LpciError::command(format!("No job definition for '{}'", job_name)))?;
    let job = variants.get(index).ok_or_else(|| {
        LpciError::command(format!(
            "No job definition with index {} for '{}'",
            index, job_name
        ))
    })?;

    run_variant_with_cleanup(&context, job_name, index, job)
}

/// Runs every variant of one job, cleaning up each variant's instance
/// afterwards when `--clean` is set. The first failing variant stops the
/// remaining ones.
fn run_job_variants(
    context: &JobContext<'_>,
    config: &Config,
    job_name: &str,
) -> Result<(), LpciError> {
    let variants = config
        .jobs
        .get(job_name)
        .filter(|variants| !variants.is_empty())
        .ok_or_else(|| LpciError::command(format!("No job definition for '{}'", job_name)))?;
    for (index, job) in variants.iter().enumerate() {
        interrupt::check()?;
        run_variant_with_cleanup(context, job_name, index, job)?;
    }
    Ok(())
}

fn run_variant_with_cleanup(
    context: &JobContext<'_>,
    job_name: &str,
    index: usize,
    job: &Job,
) -> Result<(), LpciError> {
    let instance_name = context.provider.get_instance_name(
        context.project_name,
        context.project_path,
        job.series.as_str(),
        get_host_architecture(),
    )?;

    let result = run_job(context, job_name, index, job);

    if context.options.clean {
        let cleaned = context.provider.clean_project_environments(
            context.project_name,
            context.project_path,
            std::slice::from_ref(&instance_name),
        );
        match (result, cleaned) {
            (Ok(()), Ok(_)) => Ok(()),
            (Err(e), Ok(_)) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Err(run_err), Err(clean_err)) => {
                error!("cleaning instance '{}' also failed: {}", instance_name, clean_err);
                Err(run_err)
            }
        }
    } else {
        result
    }
}

/// Run a single job variant.
fn run_job(
    context: &JobContext<'_>,
    job_name: &str,
    index: usize,
    job: &Job,
) -> Result<(), LpciError> {
    let host_architecture = get_host_architecture();
    // The dispatcher never dispatches architectures with no matching
    // variant, so a mismatch is a silent skip rather than an error.
    if !job.architectures.iter().any(|arch| arch.as_str() == host_architecture) {
        return Ok(());
    }
    interrupt::check()?;

    let plugins = PluginSet::for_job(job, &context.plugin_settings)?;
    let before_run = plugins.resolve_before_run(job).filter(|cmd| !cmd.is_empty());
    let run = plugins.resolve_run(job).filter(|cmd| !cmd.is_empty());
    let after_run = plugins.resolve_after_run(job).filter(|cmd| !cmd.is_empty());

    let Some(run) = run else {
        return Err(LpciError::command(format!(
            "Job '{}' for {}/{} does not set 'run'",
            job_name, job.series, host_architecture
        )));
    };

    let environment = build_environment(&plugins, job, &context.env_overrides);

    info!("Launching environment for {}/{}", job.series, host_architecture);
    let mut instance = context.provider.launched_environment(
        context.project_name,
        context.project_path,
        job.series.as_str(),
        host_architecture,
        context.options.gpu_nvidia,
    )?;

    let result = run_job_in_instance(
        context,
        job_name,
        index,
        job,
        &plugins,
        &environment,
        [before_run.as_deref(), Some(run.as_str()), after_run.as_deref()],
        instance.as_ref(),
        host_architecture,
    );
    let released = instance.release();

    match (result, released) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) => Err(e),
        (Ok(()), Err(e)) => Err(e),
        (Err(run_err), Err(release_err)) => {
            error!("tearing down the environment also failed: {}", release_err);
            Err(run_err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_job_in_instance(
    context: &JobContext<'_>,
    job_name: &str,
    index: usize,
    job: &Job,
    plugins: &PluginSet,
    environment: &BTreeMap<String, String>,
    commands: [Option<&str>; 3],
    instance: &dyn ProviderInstance,
    host_architecture: &str,
) -> Result<(), LpciError> {
    let remote_cwd = managed_environment_project_path();

    for snap in plugins.install_snaps() {
        interrupt::check()?;
        info!("Running `snap install {}`", snap.name);
        let mut command: Vec<OsString> = ["snap", "install", &snap.name, "--channel", &snap.channel]
            .iter()
            .map(OsString::from)
            .collect();
        if snap.classic {
            command.push("--classic".into());
        }
        let result = instance.execute_run(&command, None, &BTreeMap::new(), false)?;
        if !result.success() {
            return Err(LpciError::Provider(format!(
                "Failed to install snap '{}' from channel '{}'",
                snap.name, snap.channel
            )));
        }
    }

    let packages = plugins.install_packages();
    if !packages.is_empty() {
        interrupt::check()?;
        update_package_sources(context, job, instance)?;

        run_apt_command(
            instance,
            job_name,
            job,
            host_architecture,
            &remote_cwd,
            environment,
            &["apt", "update"],
        )?;

        info!("Installing system packages");
        let mut apt_install: Vec<&str> = vec!["apt", "install", "-y"];
        apt_install.extend(packages.iter().map(String::as_str));
        run_apt_command(
            instance,
            job_name,
            job,
            host_architecture,
            &remote_cwd,
            environment,
            &apt_install,
        )?;
    }

    if let Some(input) = &job.input {
        interrupt::check()?;
        let output_directory = context.options.output_directory.as_deref().ok_or_else(|| {
            LpciError::command(format!(
                "Job '{}' requires an input but no output directory was provided",
                job_name
            ))
        })?;
        let source_path = input_source_path(output_directory, input)?;
        artifacts::copy_input_paths(input, &remote_cwd, instance, &source_path)?;
    }

    for command in commands.into_iter().flatten() {
        interrupt::check()?;
        run_instance_command(
            command,
            job_name,
            job,
            host_architecture,
            instance,
            &remote_cwd,
            environment,
        )?;
    }

    if let (Some(output), Some(output_directory)) =
        (&job.output, context.options.output_directory.as_deref())
    {
        interrupt::check()?;
        let target_path = output_directory.join(job_name).join(index.to_string());
        fs::create_dir_all(&target_path)
            .map_err(|e| LpciError::io(target_path.to_string(), e))?;
        artifacts::copy_output_paths(output, &remote_cwd, instance, &target_path)?;
        artifacts::copy_output_properties(output, context.license, &remote_cwd, instance, &target_path)?;
    }

    Ok(())
}

/// Rewrites `/etc/apt/sources.list` inside the instance: wholesale
/// replacement when requested, otherwise the current content with CLI
/// extras appended first (they win per apt's precedence) and per-job
/// repositories after, with secrets rendered over the final text.
fn update_package_sources(
    context: &JobContext<'_>,
    job: &Job,
    instance: &dyn ProviderInstance,
) -> Result<(), LpciError> {
    let replace = &context.options.replace_package_repositories;
    let extra = &context.options.package_repositories;
    let job_repositories = job.package_repositories.as_deref().unwrap_or_default();

    if replace.is_empty() && extra.is_empty() && job_repositories.is_empty() {
        return Ok(());
    }

    let mut content = if replace.is_empty() {
        let command: Vec<OsString> =
            ["cat", "/etc/apt/sources.list"].iter().map(OsString::from).collect();
        let result = instance.execute_run(&command, None, &BTreeMap::new(), true)?;
        if !result.success() {
            return Err(LpciError::Provider(format!(
                "failed to read /etc/apt/sources.list in instance '{}'",
                instance.name()
            )));
        }
        String::from_utf8_lossy(&result.stdout).into_owned()
    } else {
        info!("Replacing /etc/apt/sources.list");
        String::new()
    };

    for line in replace.iter().chain(extra.iter()) {
        content.push_str(line);
        content.push('\n');
    }
    for repository in job_repositories {
        for line in repository.sources_lines() {
            content.push_str(&line);
            content.push('\n');
        }
    }

    if !context.secrets.is_empty() {
        content = secrets::render(&content, &context.secrets);
    }

    instance.push_file_io(Utf8Path::new("/etc/apt/sources.list"), content.as_bytes(), "0644")
}

fn run_apt_command(
    instance: &dyn ProviderInstance,
    job_name: &str,
    job: &Job,
    host_architecture: &str,
    remote_cwd: &Utf8Path,
    environment: &BTreeMap<String, String>,
    command: &[&str],
) -> Result<(), LpciError> {
    info!("Running {}", command.join(" "));
    let os_command: Vec<OsString> = command.iter().map(OsString::from).collect();
    let result = instance.execute_run(&os_command, Some(remote_cwd), environment, false)?;
    if !result.success() {
        let status = result.code().unwrap_or(1);
        return Err(LpciError::Command {
            message: format!(
                "Job '{}' for {}/{} failed with exit status {} while running `{}`.",
                job_name,
                job.series,
                host_architecture,
                status,
                command.join(" ")
            ),
            retcode: status,
        });
    }
    Ok(())
}

fn run_instance_command(
    command: &str,
    job_name: &str,
    job: &Job,
    host_architecture: &str,
    instance: &dyn ProviderInstance,
    remote_cwd: &Utf8Path,
    environment: &BTreeMap<String, String>,
) -> Result<(), LpciError> {
    let full_command: Vec<OsString> = ["bash", "--noprofile", "--norc", "-ec", command]
        .iter()
        .map(OsString::from)
        .collect();
    info!("Running command for the job...");
    let result = instance.execute_run(&full_command, Some(remote_cwd), environment, false)?;
    if !result.success() {
        return Err(LpciError::JobFailed {
            job: job_name.to_string(),
            series: job.series.to_string(),
            architecture: host_architecture.to_string(),
            status: result.code().unwrap_or(1),
        });
    }
    Ok(())
}

/// Environment for the job's commands: the plugin set's contribution,
/// overlaid by the job's `environment` (null deletes), overlaid by CLI
/// overrides.
fn build_environment(
    plugins: &PluginSet,
    job: &Job,
    env_overrides: &[(String, String)],
) -> BTreeMap<String, String> {
    let mut environment = plugins.environment();
    if let Some(job_environment) = &job.environment {
        for (key, value) in job_environment {
            match value {
                Some(value) => {
                    environment.insert(key.clone(), value.clone());
                }
                None => {
                    environment.remove(key);
                }
            }
        }
    }
    for (key, value) in env_overrides {
        environment.insert(key.clone(), value.clone());
    }
    environment
}

/// Parses `KEY=VALUE` pairs from the CLI; only the first `=` splits.
fn parse_env_overrides(pairs: &[String]) -> Result<Vec<(String, String)>, LpciError> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| {
                    LpciError::command(format!(
                        "invalid environment variable '{}': expected KEY=VALUE",
                        pair
                    ))
                })
        })
        .collect()
}

/// The prior job's single output directory `<output_dir>/<job_name>/<index>/`.
fn input_source_path(output_directory: &Utf8Path, input: &Input) -> Result<Utf8PathBuf, LpciError> {
    let parent = output_directory.join(&input.job_name);
    let entries = match parent.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LpciError::command(format!(
                "Job '{}' has no output directories",
                input.job_name
            )));
        }
        Err(e) => return Err(LpciError::io(parent.to_string(), e)),
    };
    let mut directories: Vec<Utf8PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LpciError::io(parent.to_string(), e))?;
        if entry.path().is_dir() {
            directories.push(entry.path().to_owned());
        }
    }
    match directories.as_slice() {
        [] => Err(LpciError::command(format!(
            "Job '{}' has no output directories",
            input.job_name
        ))),
        [single] => Ok(single.clone()),
        _ => Err(LpciError::command(format!(
            "Job '{}' has more than one output directory",
            input.job_name
        ))),
    }
}

/// Python-style list rendering for stage error messages:
/// `['lint', 'test']`.
fn format_stage<'a>(names: impl Iterator<Item = &'a str>) -> String {
    let quoted: Vec<String> = names.map(|name| format!("'{}'", name)).collect();
    format!("[{}]", quoted.join(", "))
}
