// Entry point for the `executor` binary.
//
// `executor [run]` loads the settings file, applies `EXECUTOR_*` overrides and
// runs the worker pool until Ctrl-C / SIGTERM. `executor init` writes a default
// settings file; `executor validate` only loads and checks it.

use clap::{Parser, Subcommand};
use executor_common::constants::return_code;
use executor_common::{ConfigurationStore, LogFormat, Options};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use executor_listener::service;

#[derive(Parser, Debug)]
#[command(name = "executor", version, about = "Runs queued jobs in isolated environments")]
struct Args {
    /// Path to the JSON settings file.
    #[arg(long, global = true, default_value = "executor.json")]
    config: PathBuf,

    /// Handle at most one job per worker, then exit.
    #[arg(long, global = true)]
    once: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the executor (the default).
    Run,
    /// Write a settings file with default values.
    Init {
        /// Overwrite an existing settings file.
        #[arg(long)]
        force: bool,
    },
    /// Load and validate the settings file, then exit.
    Validate,
}

fn main() {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(async move { run(args).await });

    std::process::exit(exit_code);
}

async fn run(args: Args) -> i32 {
    executor_common::tracing::init(LogFormat::from_env());

    let store = ConfigurationStore::new(&args.config);

    match args.command.unwrap_or(Cmd::Run) {
        Cmd::Init { force } => init(&store, force),
        Cmd::Validate => match store.load() {
            Ok(_) => return_code::SUCCESS,
            Err(e) => {
                tracing::error!("invalid settings: {e:#}");
                return_code::CONFIGURATION_ERROR
            }
        },
        Cmd::Run => {
            let options = match store.load() {
                Ok(options) => options,
                Err(e) => {
                    tracing::error!("failed to load settings: {e:#}");
                    return return_code::CONFIGURATION_ERROR;
                }
            };

            tracing::info!(version = env!("CARGO_PKG_VERSION"), "executor starting");

            let shutdown = CancellationToken::new();
            service::install_signal_handlers(&shutdown);

            match service::run(options, args.once, shutdown).await {
                Ok(()) => return_code::SUCCESS,
                Err(e) => {
                    tracing::error!("executor failed: {e:#}");
                    return_code::TERMINATED_ERROR
                }
            }
        }
    }
}

fn init(store: &ConfigurationStore, force: bool) -> i32 {
    if store.is_configured() && !force {
        tracing::error!(
            path = %store.config_file_path().display(),
            "settings file already exists, pass --force to overwrite"
        );
        return return_code::CONFIGURATION_ERROR;
    }

    let options = Options {
        queue_name: Some("default".to_string()),
        ..Default::default()
    };
    match store.save(&options) {
        Ok(()) => {
            tracing::info!(path = %store.config_file_path().display(), "wrote default settings");
            return_code::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            return_code::TERMINATED_ERROR
        }
    }
}
