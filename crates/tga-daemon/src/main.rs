//! tga-daemon - Talos Governance Agent sidecar.
//!
//! Boots the governance runtime: configuration from `TGA_*` environment
//! variables, the `SQLite` state store, and the startup recovery pass that
//! verifies the hash chain before any request is accepted. Integrity
//! violations are startup-fatal and exit non-zero after a diagnostic; the
//! log is the ground truth for audit and is never silently repaired.
//!
//! The protocol adapter that frames tool calls attaches to the runtime
//! exposed by the `tga-daemon` library; this binary owns process lifecycle
//! only.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tga_core::capability::{CapabilityVerifier, VerifierConfig};
use tga_core::clock::SystemClock;
use tga_core::config::GovernanceConfig;
use tga_core::store::SqliteStateStore;
use tga_daemon::machine::GovernanceRuntime;
use tga_daemon::recovery;

/// tga-daemon - capability-gated tool call governance
#[derive(Parser, Debug)]
#[command(name = "tga-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Override the state store path from TGA_DB_PATH
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Fail-closed startup: a missing or malformed Supervisor key, an
    // unownable store file, or a damaged log all refuse service here.
    let mut config = GovernanceConfig::from_env().context("configuration failed")?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    info!(
        identity = %config.identity,
        db_path = %config.db_path.display(),
        "starting governance agent"
    );

    let store = Arc::new(
        SqliteStateStore::open(&config.db_path).context("state store failed to open")?,
    );

    let clock = Arc::new(SystemClock);
    let recovered = match recovery::recover(store.as_ref(), clock.as_ref()) {
        Ok(recovered) => recovered,
        Err(e) => {
            // Never serve over a log that does not verify
            error!(code = e.error_code(), error = %e, "recovery refused to start");
            return Err(e).context("recovery failed");
        },
    };

    info!(
        records_verified = recovered.report.records_verified,
        orphans_resolved = recovered.report.orphans_resolved,
        expired_resolved = recovered.report.expired_resolved,
        open_traces = recovered.report.open_traces,
        "log verified, accepting requests"
    );

    let verifier = CapabilityVerifier::new(VerifierConfig {
        supervisor_key: config.supervisor_key,
        identity: config.identity.clone(),
        clock_skew: config.clock_skew,
    });

    // Held for the life of the process; the protocol adapter drives it
    let _runtime = Arc::new(GovernanceRuntime::new(
        store,
        verifier,
        config.session_cache_size,
        recovered.traces,
        clock,
    ));

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("received SIGINT");
        }
    }

    info!("governance agent shut down");
    Ok(())
}
