mod cli;
mod engine;
mod error;
mod model;
mod orchestrator;
#[cfg(test)]
mod test_support;
mod text_summary;
mod viewport;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Log records go to stderr; RUST_LOG wins over `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

// Single-threaded, cooperative scheduling: every task shares one thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_tracing(args.verbose);
    let is_silent = args.silent;
    let is_json = args.json;

    match cli::run(args).await {
        Ok(()) => {
            // Explicitly exit with code 0 on success, especially for scripted modes
            if is_json {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => {
            if is_silent {
                println!("{}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
