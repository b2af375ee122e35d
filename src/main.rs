#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate log;

#[macro_use]
extern crate failure;

mod build_request;
mod build_result;
mod config_file;
mod diagnostics;
mod errors;
mod folders;
mod integrations;
mod listener;
mod logging;
mod pipeline;
mod stop_signal;

use clap::{Parser, Subcommand};
use config_file::Config;
use integrations::command_runner::SystemRunner;
use listener::Listener;
use log::LevelFilter;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use stop_signal::StopSignal;

const SMOKE_TEST_SETTLE: Duration = Duration::from_secs(3);
const SMOKE_TEST_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(about = "Listens for Unity build requests and runs them")]
struct Cli {
    /// Defaults to the config.toml next to the executable.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Poll for build requests until the stop file appears (default).
    Listen,
    /// Check that git works and origin is reachable.
    CheckGit,
    /// Start and stop the listener via the stop file, against an empty
    /// stand-in subscription.
    SmokeTest,
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    if let Err(e) = logging::init_logging(&config.paths.log_folder, level) {
        eprintln!("Unable to initialize logging: {}", e);
        process::exit(2);
    }
    info!("--Main--: Loaded config from {}", config_path.display());

    let stop = StopSignal::new(&config.listener.stop_file);
    let runner = SystemRunner::new(stop.clone());

    let exit_code = match cli.command.unwrap_or(CliCommand::Listen) {
        CliCommand::Listen => {
            if let Err(e) = config.validate() {
                error!("--Main--: {}", e);
                process::exit(2);
            }
            if let Err(e) = folders::ensure_folder(&config.paths.build_output) {
                error!("--Main--: Unable to create {}: {}", config.paths.build_output.display(), e);
                process::exit(2);
            }
            if let Err(e) = stop.install_ctrlc_handler() {
                warn!("--Main--: Ctrl-C handler not installed: {}", e);
            }
            Listener::new(&config, &runner, &stop).run();
            0
        }
        CliCommand::CheckGit => match diagnostics::check_git(&config, &runner) {
            Ok(_) => 0,
            Err(e) => {
                error!("--Diagnostics--: git check failed: {}", e);
                1
            }
        },
        CliCommand::SmokeTest => {
            match diagnostics::smoke_test(&config, SMOKE_TEST_SETTLE, SMOKE_TEST_GRACE) {
                Ok(_) => 0,
                Err(e) => {
                    error!("--Diagnostics--: Smoke test failed: {}", e);
                    1
                }
            }
        }
    };
    process::exit(exit_code);
}
