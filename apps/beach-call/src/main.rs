mod app;
mod cli;
mod clipboard;
mod error;
mod media;
mod prompt;
mod telemetry;

use clap::Parser;
use tracing::debug;

use crate::cli::Cli;
use crate::error::CliError;
use crate::telemetry::logging;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_config = cli.logging.to_config();
    logging::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(
        target: "beach_call::app",
        log_level = log_config.level.as_str(),
        log_file = ?log_config.file,
        "logging configured"
    );

    app::run(cli).await
}
