use clap::Parser as _;

use kvbench::config::{Cli, LogLevel, RunConfig};
use kvbench::orchestrator;

/// No log sink is installed unless `--log-level` asks for one, so the
/// tracing macros in the hot path cost a branch and nothing more.
fn init_tracing(level: LogLevel) {
    let max_level = match level {
        LogLevel::Off => return,
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warning => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
    };
    // Logs go to stderr; stdout belongs to the CSV/report output.
    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    let config = match RunConfig::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = orchestrator::run(config).await {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}
