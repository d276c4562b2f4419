use clap::Parser;
use kquant::application::Service;
use kquant::config::Config;
use kquant::infrastructure::masking::MaskingStdout;
use kquant::infrastructure::persistence::repositories::{ErrorLogRow, Severity};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::prelude::*;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 2;
const EXIT_DEPENDENCY: u8 = 3;
const EXIT_AUTH: u8 = 4;
const EXIT_ABORTED: u8 = 5;

#[derive(Parser)]
#[command(name = "kquant", about = "Automated KOSPI/KOSDAQ quant trading service")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Validate configuration and exit.
    #[arg(long)]
    check_config: bool,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into());
    // Every sink goes through the secret mask.
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(MaskingStdout),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(MaskingStdout),
            )
            .init();
    }
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_logging(false);
            error!("Configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    init_logging(config.structured_logging);

    if cli.check_config {
        info!("Configuration OK ({} environment)", config.broker.environment);
        return ExitCode::from(EXIT_OK);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build runtime: {e}");
            return ExitCode::from(EXIT_DEPENDENCY);
        }
    };

    let code = runtime.block_on(run(config));
    ExitCode::from(code)
}

async fn run(config: Config) -> u8 {
    info!("Starting kquant ({} environment)", config.broker.environment);

    let service = match Service::build(config).await {
        Ok(service) => Arc::new(service),
        Err(e) => {
            let code = classify_build_failure(&e);
            error!("Failed to build service (exit {code}): {e:#}");
            return code;
        }
    };

    let _reporter = service.spawn_metrics_reporter();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler = service.scheduler();

    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    tokio::select! {
        result = scheduler.run(shutdown_rx) => {
            match result {
                Ok(()) => EXIT_OK,
                Err(e) => {
                    error!("Scheduler failed: {e:#}");
                    record_exit(&service, &format!("scheduler failed: {e:#}")).await;
                    EXIT_DEPENDENCY
                }
            }
        }
        _ = ctrl_c => {
            info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
            record_exit(&service, "user abort (SIGINT)").await;
            EXIT_ABORTED
        }
    }
}

/// Map build failures onto the exit-code contract: authentication
/// problems are 4, everything else missing at startup is 3.
fn classify_build_failure(error: &anyhow::Error) -> u8 {
    let text = format!("{error:#}").to_lowercase();
    if text.contains("token") || text.contains("auth") || text.contains("credential") {
        EXIT_AUTH
    } else {
        EXIT_DEPENDENCY
    }
}

/// Every non-zero exit leaves a terminating error row (best effort; the
/// database itself may be the failure).
async fn record_exit(service: &Service, message: &str) {
    let _ = service
        .error_log
        .insert(
            &ErrorLogRow::new(Severity::Critical, "main", message)
                .with_type_tag("terminating"),
        )
        .await;
}
