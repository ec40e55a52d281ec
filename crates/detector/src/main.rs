mod cli;
mod config;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};

use policy_engine::{
    loader, match_all, Alert, ClusterLabelProvider, Deployment, Event, NamespaceLabelProvider,
    PolicySet, StaticLabelProvider,
};
use risk_reprocess::{
    run_workers, AdmissionGate, InMemoryDeploymentStore, ReprocessPipeline, ReprocessQueue,
    RiskManager,
};

use crate::cli::{Cli, Command};
use crate::config::{Config, ReprocessingConfig};

// ---------------------------------------------------------------------------
// AlertPrinter
// ---------------------------------------------------------------------------

/// Risk manager that writes each reprocessed deployment and its alerts to
/// stdout as one JSON line.
struct AlertPrinter;

#[async_trait]
impl RiskManager for AlertPrinter {
    async fn reprocess_deployment_risk(
        &self,
        deployment: &Deployment,
        alerts: Vec<Alert>,
    ) -> anyhow::Result<()> {
        let line = serde_json::json!({
            "deployment_id": deployment.id,
            "deployment_name": deployment.name,
            "cluster_id": deployment.cluster_id,
            "alerts": alerts,
        });
        println!("{}", serde_json::to_string(&line)?);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Policy loading
// ---------------------------------------------------------------------------

/// Load the policies at `path` (a file or a directory) into a new set bound
/// to the configured label providers. Returns the set and the number of
/// policies that failed to compile.
fn load_policy_set(path: &Path, cfg: &Config) -> Result<(PolicySet, usize)> {
    let clusters = Arc::new(StaticLabelProvider::from_map(cfg.labels.clusters.clone()));
    let namespaces = Arc::new(StaticLabelProvider::from_map(cfg.labels.namespaces.clone()));
    let set = PolicySet::new(
        Some(clusters as Arc<dyn ClusterLabelProvider>),
        Some(namespaces as Arc<dyn NamespaceLabelProvider>),
    );

    let policies = if path.is_dir() {
        loader::load_policy_dir(path)
    } else {
        loader::load_policies(path)
    }
    .context("failed to load policies")?;

    let total = policies.len();
    let failed = policies
        .iter()
        .filter(|policy| set.upsert_policy(policy).is_err())
        .count();

    info!(
        path = %path.display(),
        total,
        compiled = set.len(),
        failed,
        "policies loaded"
    );
    Ok((set, failed))
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn evaluate<R>(set: &PolicySet, reader: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut events = 0usize;
    let mut alerts = 0usize;

    while let Some(line) = lines.next_line().await.context("failed to read events")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed event");
                continue;
            }
        };
        events += 1;

        let outcome = match_all(set, &event);
        if let Some(errors) = &outcome.errors {
            warn!(line = line_no, error = %errors, "some policies failed to evaluate");
        }
        for alert in &outcome.alerts {
            println!("{}", serde_json::to_string(alert)?);
        }
        alerts += outcome.alerts.len();
    }

    info!(events, alerts, "event evaluation finished");
    Ok(())
}

async fn load_deployments(path: &Path) -> Result<InMemoryDeploymentStore> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open deployments file: {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let store = InMemoryDeploymentStore::new();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let deployment: Deployment = serde_json::from_str(&line).with_context(|| {
            format!("invalid deployment on line {line_no} of {}", path.display())
        })?;
        store.insert(deployment);
    }
    Ok(store)
}

async fn reprocess(
    set: PolicySet,
    deployments_path: &Path,
    cluster: Option<&str>,
    cfg: &ReprocessingConfig,
) -> Result<()> {
    // 1. Load the deployment store.
    let store = Arc::new(load_deployments(deployments_path).await?);

    // 2. Build the gated pipeline.
    let gate = AdmissionGate::new(cfg.max_concurrency, cfg.semaphore_wait());
    let pipeline = Arc::new(ReprocessPipeline::new(
        store.clone(),
        Arc::new(AlertPrinter),
        Arc::new(set),
        gate.clone(),
    ));

    info!(
        deployments = store.len(),
        max_concurrency = gate.capacity(),
        semaphore_wait_secs = gate.wait_timeout().as_secs(),
        workers = cfg.workers,
        "risk reprocessing starting"
    );

    // 3. Fill the queue, then close it so workers stop once it drains.
    let queue = Arc::new(ReprocessQueue::new());
    match cluster {
        Some(cluster_id) => {
            pipeline.reconcile(cluster_id, &queue).await?;
        }
        None => {
            queue.extend(store.ids());
        }
    }
    queue.close();

    // 4. Cancel outstanding work on ctrl-c or SIGTERM.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = cancel_tx.send(true);
    });

    // 5. Run the worker pool to completion.
    let summary = run_workers(pipeline, queue, cfg.workers, cancel_rx).await;
    let stats = gate.stats();

    info!(
        completed = summary.completed,
        not_found = summary.not_found,
        failed = summary.failed,
        timed_out = summary.timed_out,
        cancelled = summary.cancelled,
        gate_timeouts = stats.timeouts,
        "risk reprocessing finished"
    );
    if summary.failed > 0 {
        warn!(failed = summary.failed, "some deployments failed to reprocess");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT (ctrl-c)"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
                info!("received SIGINT (ctrl-c)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT (ctrl-c)");
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref policies) = cli.policies {
        cfg.policies.dir = policies.clone();
    }
    if let Some(ref level) = cli.log_level {
        cfg.logging.level = level.clone();
    }
    if let Command::Reprocess {
        max_concurrency,
        wait_secs,
        workers,
        ..
    } = &cli.command
    {
        if let Some(max) = max_concurrency {
            cfg.reprocessing.max_concurrency = *max;
        }
        if let Some(wait) = wait_secs {
            cfg.reprocessing.semaphore_wait_secs = *wait;
        }
        if let Some(workers) = workers {
            cfg.reprocessing.workers = *workers;
        }
    }
    cfg.reprocessing.validate()?;

    // 3. Init tracing-subscriber with JSON format. Alerts own stdout.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    info!(
        config_file = %cli.config.display(),
        policies = %cfg.policies.dir.display(),
        "detector starting"
    );

    // 4. Load and compile policies.
    let (set, failed) = load_policy_set(&cfg.policies.dir, &cfg)?;

    // 5. Dispatch.
    match &cli.command {
        Command::Check => {
            if failed > 0 {
                error!(failed, "policy check failed");
                bail!("{failed} policies failed to compile");
            }
            info!(compiled = set.len(), "all policies compiled");
        }
        Command::Evaluate { events: Some(path) } => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open events file: {}", path.display()))?;
            evaluate(&set, BufReader::new(file)).await?;
        }
        Command::Evaluate { events: None } => {
            evaluate(&set, BufReader::new(tokio::io::stdin())).await?;
        }
        Command::Reprocess {
            deployments,
            cluster,
            ..
        } => {
            reprocess(set, deployments, cluster.as_deref(), &cfg.reprocessing).await?;
        }
    }

    info!("detector shutting down");
    Ok(())
}
