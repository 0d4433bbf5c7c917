//! RPC server binary.

use std::path::PathBuf;

use clap::Parser;
use server::config::{Config, DEFAULT_CONFIG};
use server::{logging, metrics, signal};

#[derive(Parser)]
#[command(name = "rpc-server")]
#[command(about = "Framed RPC server with encrypted sessions")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print!("{DEFAULT_CONFIG}");
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    let shutdown = match signal::install_signal_handler() {
        Ok(flag) => flag,
        Err(e) => {
            tracing::error!(error = %e, "cannot install signal handler");
            std::process::exit(1);
        }
    };

    let result = server::run(config, &shutdown);
    metrics::log_snapshot();
    if let Err(e) = result {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}
