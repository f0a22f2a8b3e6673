//! Clauth daemon entry point.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};

use clauth::advisory::{spawn_poller, AdvisoryPoller};
use clauth::audit::AuditLog;
use clauth::cli::{Cli, Command};
use clauth::config::Config;
use clauth::runtime::Runtime;
use clauth::storage::StateDir;
use clauth::{server, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::VerifyAudit => verify_audit(&config),
        Command::Serve => serve(config, cli.passphrase).await,
    }
}

fn verify_audit(config: &Config) -> anyhow::Result<ExitCode> {
    let state = StateDir::open(config.state_dir()).context("Cannot open state directory")?;
    let audit = AuditLog::new(state.audit());
    let report = audit.verify_integrity().context("Audit verification failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn serve(config: Config, passphrase: Option<String>) -> anyhow::Result<ExitCode> {
    let Some(passphrase) = passphrase else {
        bail!("No passphrase supplied; set CLAUTH_PASSPHRASE or --passphrase");
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        state_dir = %config.state_dir().display(),
        "Starting clauth"
    );

    let runtime = Arc::new(
        Runtime::build(config, &passphrase)
            .await
            .context("Failed to start runtime")?,
    );

    // Background advisory poller, when feeds are configured.
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    if !runtime.config.advisory.feeds.is_empty() {
        let poller = AdvisoryPoller::load(
            runtime.state.advisory_state(),
            runtime.config.advisory.feeds.clone(),
            Arc::clone(&runtime.audit),
            runtime.alerts.clone(),
        )
        .context("Failed to start advisory poller")?;
        spawn_poller(
            Arc::new(poller),
            Duration::from_millis(runtime.config.advisory.poll_interval_ms),
            shutdown_tx.subscribe(),
        );
    }

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    };

    let result = server::serve(Arc::clone(&runtime), shutdown).await;
    let _ = shutdown_tx.send(());

    if let Err(e) = result {
        runtime.shutdown();
        return Err(e).context("Server error");
    }

    info!("Clauth shutdown complete");
    Ok(ExitCode::SUCCESS)
}
