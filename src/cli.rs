//! Command-line interface definitions for lpci.
//!
//! This module defines the CLI structure using the `clap` crate: the
//! `run`, `run-one`, `clean`, `version`, and `completions` subcommands and
//! their arguments. Invoking `lpci` with no subcommand runs the pipeline
//! with default arguments.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use clap_complete::Shell;

/// Top-level CLI structure that serves as the entry point for parsing
/// command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    /// The subcommand to execute; defaults to `run`.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// The available subcommands in the application.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the configured pipeline, launching managed environments as
    /// needed.
    Run(RunArgs),

    /// Select and run a single job variant from the pipeline.
    ///
    /// This command is for use by the build farm, which dispatches one
    /// numbered job at a time.
    #[command(name = "run-one")]
    RunOne(RunOneArgs),

    /// Delete the managed environments created for this project.
    Clean(CleanArgs),

    /// Show version information and exit.
    Version,

    /// Generate shell completion scripts.
    ///
    /// The generated script should be sourced in your shell's
    /// configuration file or saved to your shell's completion directory.
    Completions(CompletionsArgs),
}

/// Arguments shared across the pipeline-touching commands.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Path to the pipeline configuration file.
    #[arg(short, long, default_value = ".launchpad.yaml", value_hint = ValueHint::FilePath)]
    pub config: Utf8PathBuf,

    /// Set the log level for controlling verbosity of output.
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,
}

impl Default for CommonArgs {
    fn default() -> Self {
        Self {
            config: Utf8PathBuf::from(".launchpad.yaml"),
            log_level: LogLevel::Info,
        }
    }
}

/// Job-execution options shared by `run` and `run-one`.
#[derive(Args, Debug, Clone, Default)]
pub struct JobArgs {
    /// Write job output under this directory.
    #[arg(long, value_hint = ValueHint::DirPath)]
    pub output_directory: Option<Utf8PathBuf>,

    /// Delete the managed environments of this run after each job.
    #[arg(long)]
    pub clean: bool,

    /// Replace /etc/apt/sources.list wholesale with this line (repeatable).
    #[arg(long, value_name = "SOURCE_LINE")]
    pub replace_package_repositories: Vec<String>,

    /// Deprecated alias for --replace-package-repositories.
    #[arg(long, value_name = "SOURCE_LINE", hide = true)]
    pub apt_replace_repositories: Vec<String>,

    /// Append this sources line ahead of per-job repositories (repeatable).
    #[arg(long = "package-repository", value_name = "SOURCE_LINE")]
    pub package_repository: Vec<String>,

    /// Set an environment variable for job commands (repeatable).
    #[arg(long = "set-env", value_name = "KEY=VALUE")]
    pub set_env: Vec<String>,

    /// Set a plugin setting (repeatable).
    #[arg(long = "plugin-setting", value_name = "K=V")]
    pub plugin_setting: Vec<String>,

    /// YAML file providing secrets for package-repository templates.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub secrets: Option<Utf8PathBuf>,

    /// Pass an NVIDIA GPU through to the managed environments.
    #[arg(long)]
    pub gpu_nvidia: bool,
}

/// Arguments for the `run` command.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub job: JobArgs,
}

/// Arguments for the `run-one` command.
#[derive(Args, Debug, Clone)]
pub struct RunOneArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub job: JobArgs,

    /// Name of the job to run.
    pub job_name: String,

    /// Index into the job's matrix-expanded variants.
    pub index: usize,
}

/// Arguments for the `clean` command.
#[derive(Args, Debug, Clone)]
pub struct CleanArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Arguments for the `completions` command.
#[derive(Args, Debug, Clone)]
pub struct CompletionsArgs {
    /// The shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Log levels mapping directly to the levels used by the `tracing` crate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Parses command-line arguments into a structured `Cli` instance.
pub fn parse_args() -> Cli {
    Cli::parse()
}
