pub mod artifacts;
pub mod cli;
pub mod config;
pub mod env;
pub mod error;
pub mod executor;
pub mod interrupt;
pub mod plugin;
pub mod providers;
pub mod runner;
pub mod secrets;

pub use error::LpciError;

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

use crate::config::Config;
use crate::executor::RealCommandExecutor;
use crate::providers::Provider;
use crate::providers::lxd::LxdProvider;
use crate::runner::RunOptions;

pub fn init_logging(log_level: cli::LogLevel) -> anyhow::Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// The project is the current directory: its basename names instances and
/// output subtrees, its inode pins them to this checkout.
fn project_identity() -> Result<(String, Utf8PathBuf), LpciError> {
    let cwd = std::env::current_dir()
        .map_err(|e| LpciError::io("failed to determine current directory", e))?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|p| LpciError::Config(format!("project directory is not UTF-8: {:?}", p)))?;
    let name = cwd
        .file_name()
        .unwrap_or("project")
        .to_string();
    Ok((name, cwd))
}

fn default_provider() -> LxdProvider {
    LxdProvider::new(Arc::new(RealCommandExecutor))
}

/// Collects the run options, folding the deprecated
/// `--apt-replace-repositories` alias into `--replace-package-repositories`.
fn run_options(job: &cli::JobArgs) -> RunOptions {
    let mut replace = job.replace_package_repositories.clone();
    if !job.apt_replace_repositories.is_empty() {
        warn!(
            "Option --apt-replace-repositories is deprecated. \
            Please use --replace-package-repositories instead."
        );
        replace.extend(job.apt_replace_repositories.iter().cloned());
    }
    RunOptions {
        output_directory: job.output_directory.clone(),
        clean: job.clean,
        replace_package_repositories: replace,
        package_repositories: job.package_repository.clone(),
        set_env: job.set_env.clone(),
        plugin_settings: job.plugin_setting.clone(),
        secrets_file: job.secrets.clone(),
        gpu_nvidia: job.gpu_nvidia,
    }
}

/// `lpci run`: run the full pipeline.
pub fn run_command(args: &cli::RunArgs) -> Result<(), LpciError> {
    let config = Config::load(&args.common.config)?;
    let (project_name, project_path) = project_identity()?;
    let provider = default_provider();
    let options = run_options(&args.job);
    runner::run_pipeline(&config, &provider, &project_name, &project_path, &options)
}

/// `lpci run-one`: run a single numbered job variant.
pub fn run_one_command(args: &cli::RunOneArgs) -> Result<(), LpciError> {
    let config = Config::load(&args.common.config)?;
    let (project_name, project_path) = project_identity()?;
    let provider = default_provider();
    let options = run_options(&args.job);
    runner::run_one(
        &config,
        &provider,
        &project_name,
        &project_path,
        &args.job_name,
        args.index,
        &options,
    )
}

/// `lpci clean`: delete the managed environments for this project.
///
/// Only meaningful from a project directory, so the configuration must
/// load before the backend is touched.
pub fn clean_command(args: &cli::CleanArgs) -> Result<(), LpciError> {
    Config::load(&args.common.config)?;
    let (project_name, project_path) = project_identity()?;

    info!("Deleting the managed environments for the '{}' project.", project_name);
    let provider = default_provider();
    provider.ensure_available()?;
    provider.clean_project_environments(&project_name, &project_path, &[])?;
    info!("Deleted the managed environments for the '{}' project.", project_name);
    Ok(())
}

/// The version description printed by `lpci version`.
pub fn version_description() -> String {
    format!("{}, version {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
