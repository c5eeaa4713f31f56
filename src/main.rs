//! pimgov - Privileged Access Governance Reconciler
//!
//! Converges Azure AD / Azure RBAC privileged access (activation policies,
//! eligibility grants, access reviews) to a declarative desired state file.

#![deny(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pimgov::auth::oauth::read_client_secret;
use pimgov::auth::{OAuth2Client, TokenManager};
use pimgov::config::Config;
use pimgov::desired::{default_desired_path, DesiredState};
use pimgov::directory::{GraphDirectoryClient, RetryPolicy};
use pimgov::error::AppError;
use pimgov::reconcile::{Orchestrator, RunContext};

/// Reconcile privileged access in Azure AD and Azure RBAC with a desired state file.
#[derive(Parser, Debug)]
#[command(name = "pimgov", version, about)]
struct Cli {
    /// Desired state file (defaults to the user config directory)
    #[arg(short, long, value_name = "FILE")]
    desired: Option<PathBuf>,

    /// Print the report as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Maximum concurrent directory calls (overrides config)
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() {
    // Load .env file (if present) before anything else
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<i32, AppError> {
    let config = Config::load().map_err(|e| AppError::Config(format!("{:#}", e)))?;
    init_logging(&config.logging.level);

    info!("Starting pimgov v{}", env!("CARGO_PKG_VERSION"));

    let desired_path = cli
        .desired
        .or_else(default_desired_path)
        .ok_or_else(|| AppError::Config("no desired state file given".to_string()))?;
    let desired = DesiredState::load(&desired_path)?;

    let secret = read_client_secret()?;
    let oauth_client =
        OAuth2Client::new(&config, secret).map_err(|e| AppError::Config(format!("{:#}", e)))?;
    let tokens = Arc::new(TokenManager::new(
        oauth_client,
        config.token.refresh_before_expiry_seconds,
    ));
    let client = GraphDirectoryClient::new(&config, tokens)?;

    let ctx = RunContext::new(
        RetryPolicy::from_config(&config.retry),
        cli.concurrency.unwrap_or(config.reconcile.max_concurrency),
        Utc::now(),
    );
    let report = Orchestrator::new(client, ctx).run(&desired).await;

    if cli.json {
        let json = report
            .to_json()
            .map_err(|e| AppError::Io(std::io::Error::other(e)))?;
        println!("{}", json);
    } else {
        print!("{}", report.render_table());
    }

    Ok(report.exit_code())
}

/// Log to stderr so stdout carries only the report.
///
/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}
