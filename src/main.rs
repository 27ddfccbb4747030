//! Binary entry point.

use clap::Parser;
use log::error;

use domain_verifier::{logging, run_service, LogFormat, LogLevel, Settings};

/// DNS onboarding verifier for hosted email forwarding.
///
/// All service configuration comes from environment variables; the CLI only
/// controls log output.
#[derive(Parser, Debug)]
#[command(name = "domain-verifier", version, about)]
struct Cli {
    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Log output format
    #[arg(long, value_enum, default_value = "plain")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logger_with(cli.log_level.into(), cli.log_format) {
        eprintln!("Failed to initialize logger: {e}");
        std::process::exit(1);
    }

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_service(settings).await {
        error!("Service failed: {e:#}");
        std::process::exit(1);
    }
}
