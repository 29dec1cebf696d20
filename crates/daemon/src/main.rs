use clap::Parser;
use tracing_subscriber::EnvFilter;

use cirrus_daemon::cli;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Args::parse();
    if let Err(e) = cli::execute(args).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
