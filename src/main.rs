use std::io;
use std::process;

use clap::CommandFactory;
use clap_complete::generate;
use tracing::error;

use lpci::{cli, clean_command, init_logging, run_command, run_one_command, version_description};

fn main() {
    let args = cli::parse_args();

    // Handle completions before setting up logging so the generated
    // script stays clean.
    if let Some(cli::Commands::Completions(opts)) = &args.command {
        let mut cmd = cli::Cli::command();
        generate(opts.shell, &mut cmd, env!("CARGO_PKG_NAME"), &mut io::stdout());
        return;
    }

    let log_level = match &args.command {
        None => cli::LogLevel::Info,
        Some(cli::Commands::Run(opts)) => opts.common.log_level,
        Some(cli::Commands::RunOne(opts)) => opts.common.log_level,
        Some(cli::Commands::Clean(opts)) => opts.common.log_level,
        Some(cli::Commands::Version) => cli::LogLevel::Info,
        Some(cli::Commands::Completions(_)) => unreachable!("completions handled above"),
    };
    if let Err(e) = init_logging(log_level) {
        eprintln!("lpci: {:#}", e);
        process::exit(1);
    }
    if let Err(e) = lpci::interrupt::install_handler() {
        eprintln!("lpci: {:#}", e);
        process::exit(1);
    }

    let result = match &args.command {
        None => run_command(&cli::RunArgs::default()),
        Some(cli::Commands::Run(opts)) => run_command(opts),
        Some(cli::Commands::RunOne(opts)) => run_one_command(opts),
        Some(cli::Commands::Clean(opts)) => clean_command(opts),
        Some(cli::Commands::Version) => {
            println!("{}", version_description());
            Ok(())
        }
        Some(cli::Commands::Completions(_)) => unreachable!("completions handled above"),
    };

    if let Err(e) = result {
        error!("{}", e);
        process::exit(e.retcode());
    }
}
