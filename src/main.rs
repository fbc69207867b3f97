//! cni-migration - live node-by-node CNI migration CLI tool.
//!
//! Moves a running Kubernetes cluster from one network plugin to another
//! through ordered, idempotent steps:
//! - Preflight connectivity probe
//! - Dual-plugin preparation and node rolls
//! - CNI priority change
//! - Per-node migration with drain, taint and forced eviction
//! - Clean-up of the old plugin

mod annotate;
mod config;
mod connectivity;
mod error;
mod k8s;
mod labels;
mod node;
mod output;
mod phase;
mod resources;
mod sequencer;
mod steps;
mod wait;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use dialoguer::{Confirm, theme::ColorfulTheme};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use config::{Args, Config, LogFormat, MigrationConfig};
use k8s::cluster::{ClusterClient, KubeCluster};
use k8s::node_ops::Kubectl;
use sequencer::{Sequencer, StepSelection};
use steps::StepContext;

/// Signals after the first one that are only logged before forcing exit.
const SIGNALS_BEFORE_EXIT: u32 = 4;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = Config::from_args(args);

    if let Err(e) = init_tracing(&config.log_level, config.log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    debug!("Starting cni-migration");

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    if let Err(e) = run(&config, cancel).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

/// Main application logic.
async fn run(config: &Config, cancel: CancellationToken) -> Result<()> {
    let migration = MigrationConfig::load(&config.config_path)?;

    let client =
        k8s::client::build_client(config.context.as_deref(), config.kubeconfig.as_deref()).await?;
    let context_name =
        k8s::client::current_context(config.context.as_deref(), config.kubeconfig.as_deref());
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeCluster::new(client));

    if config.status {
        let mut nodes = cluster.list_nodes().await?;
        nodes.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        output::print_status(&nodes, &migration.labels, &context_name);
        return Ok(());
    }

    if config.selection == StepSelection::Only(Default::default()) {
        info!("No steps specified");
        return Ok(());
    }

    if config.dry_run {
        println!(
            "{} No changes will be made to context '{}'",
            "[DRY RUN]".yellow(),
            context_name.bold()
        );
    } else if !config.yes {
        let proceed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Run migration steps against context '{}'?",
                context_name
            ))
            .default(false)
            .interact()?;

        if !proceed {
            info!("Aborted by user");
            return Ok(());
        }
    }

    let ops = Arc::new(Kubectl::new(
        config.context.as_deref(),
        config.kubeconfig.as_deref(),
        cancel.clone(),
    ));
    let ctx = Arc::new(StepContext::new(migration, cluster, ops, cancel));
    let sequencer = Sequencer::new(steps::registry(ctx, config.node_target.clone()))?;

    let outcomes = sequencer
        .execute(&config.selection, config.dry_run)
        .instrument(info_span!("migration", dry_run = config.dry_run))
        .await?;

    output::print_summary(&outcomes, config.dry_run);
    Ok(())
}

/// Cancel on the first interrupt, then force exit once interrupts keep coming.
async fn watch_signals(cancel: CancellationToken) {
    let mut received: u32 = 0;
    loop {
        if let Err(e) = wait_for_signal().await {
            warn!("Failed to listen for signals: {}", e);
            return;
        }
        received += 1;

        if received == 1 {
            warn!("Received interrupt, cancelling in-flight operations");
            cancel.cancel();
        } else if received <= SIGNALS_BEFORE_EXIT {
            warn!(
                "Already shutting down, {} more interrupts force exit",
                SIGNALS_BEFORE_EXIT + 1 - received
            );
        } else {
            error!("Forced exit");
            std::process::exit(1);
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Initialize tracing subscriber.
fn init_tracing(log_level: &str, format: LogFormat) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {}", e))?;

    match format {
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Text => fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init(),
    }

    Ok(())
}
