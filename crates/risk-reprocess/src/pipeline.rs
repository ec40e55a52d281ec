use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use policy_engine::{match_all, Alert, Deployment, Event, PolicySet};

use crate::admission::{cancelled, AdmissionError, AdmissionGate, CancelSignal};
use crate::queue::ReprocessQueue;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Read access to stored deployments.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// `Ok(None)` if the deployment no longer exists.
    async fn get_deployment(&self, id: &str) -> anyhow::Result<Option<Deployment>>;

    /// IDs of every deployment in `cluster_id`.
    async fn cluster_deployments(&self, cluster_id: &str) -> anyhow::Result<Vec<String>>;
}

/// Recomputes a deployment's risk from its current policy alerts.
#[async_trait]
pub trait RiskManager: Send + Sync {
    async fn reprocess_deployment_risk(
        &self,
        deployment: &Deployment,
        alerts: Vec<Alert>,
    ) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Request lifecycle
// ---------------------------------------------------------------------------

/// Where a reprocessing request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprocessState {
    Queued,
    Admitted,
    Evaluating,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl fmt::Display for ReprocessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReprocessState::Queued => "queued",
            ReprocessState::Admitted => "admitted",
            ReprocessState::Evaluating => "evaluating",
            ReprocessState::Completed => "completed",
            ReprocessState::Failed => "failed",
            ReprocessState::TimedOut => "timed_out",
            ReprocessState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Successful end of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprocessOutcome {
    Completed { alerts: usize },
    /// The deployment was deleted before it was reprocessed.
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum ReprocessError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("cancelled while reprocessing deployment '{0}'")]
    Cancelled(String),

    #[error("failed to fetch deployment '{id}'")]
    Fetch {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("risk reprocessing failed for deployment '{id}'")]
    Risk {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ReprocessError {
    /// Terminal state this error leaves the request in.
    pub fn state(&self) -> ReprocessState {
        match self {
            ReprocessError::Admission(AdmissionError::TimedOut { .. }) => ReprocessState::TimedOut,
            ReprocessError::Admission(AdmissionError::Cancelled) | ReprocessError::Cancelled(_) => {
                ReprocessState::Cancelled
            }
            _ => ReprocessState::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Re-evaluates deployment risk behind an [`AdmissionGate`].
pub struct ReprocessPipeline {
    deployments: Arc<dyn DeploymentStore>,
    risk: Arc<dyn RiskManager>,
    policies: Arc<PolicySet>,
    gate: AdmissionGate,
}

impl fmt::Debug for ReprocessPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReprocessPipeline")
            .field("policies", &self.policies.len())
            .field("gate", &self.gate)
            .finish()
    }
}

impl ReprocessPipeline {
    pub fn new(
        deployments: Arc<dyn DeploymentStore>,
        risk: Arc<dyn RiskManager>,
        policies: Arc<PolicySet>,
        gate: AdmissionGate,
    ) -> Self {
        Self {
            deployments,
            risk,
            policies,
            gate,
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Reprocess one deployment.
    ///
    /// The slot is taken before the deployment is fetched so that requests
    /// waiting for admission hold no deployment data, and it is released
    /// when this returns, whatever the outcome.
    pub async fn run(
        &self,
        deployment_id: &str,
        cancel: &CancelSignal,
    ) -> Result<ReprocessOutcome, ReprocessError> {
        trace_state(deployment_id, ReprocessState::Queued);
        let _permit = self.gate.acquire(cancel).await?;
        trace_state(deployment_id, ReprocessState::Admitted);

        let mut cancel = cancel.clone();
        let fetched = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                return Err(ReprocessError::Cancelled(deployment_id.to_string()));
            }
            fetched = self.deployments.get_deployment(deployment_id) => fetched,
        };
        let deployment = match fetched {
            Ok(Some(deployment)) => deployment,
            Ok(None) => {
                debug!(deployment_id, "deployment no longer exists; nothing to reprocess");
                return Ok(ReprocessOutcome::NotFound);
            }
            Err(source) => {
                return Err(ReprocessError::Fetch {
                    id: deployment_id.to_string(),
                    source,
                })
            }
        };

        trace_state(deployment_id, ReprocessState::Evaluating);
        let outcome = match_all(&self.policies, &Event::Deployment(deployment.clone()));
        if let Some(errors) = &outcome.errors {
            warn!(
                deployment_id,
                failed_policies = errors.len(),
                error = %errors,
                "some policies failed to evaluate during reprocessing"
            );
        }
        let alerts = outcome.alerts.len();

        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                return Err(ReprocessError::Cancelled(deployment_id.to_string()));
            }
            result = self.risk.reprocess_deployment_risk(&deployment, outcome.alerts) => {
                result.map_err(|source| ReprocessError::Risk {
                    id: deployment_id.to_string(),
                    source,
                })?;
            }
        }

        trace_state(deployment_id, ReprocessState::Completed);
        Ok(ReprocessOutcome::Completed { alerts })
    }

    /// Queue every deployment of `cluster_id`, typically after the cluster
    /// finished syncing. Returns how many IDs were newly queued.
    pub async fn reconcile(
        &self,
        cluster_id: &str,
        queue: &ReprocessQueue,
    ) -> anyhow::Result<usize> {
        let ids = self.deployments.cluster_deployments(cluster_id).await?;
        let total = ids.len();
        let queued = queue.extend(ids);
        info!(
            cluster_id,
            total,
            queued,
            "queued cluster deployments for risk reprocessing"
        );
        Ok(queued)
    }
}

fn trace_state(deployment_id: &str, state: ReprocessState) {
    tracing::trace!(deployment_id, %state, "reprocess state");
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Per-outcome counts over a worker pool's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: usize,
    pub not_found: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl WorkerSummary {
    fn record(&mut self, result: &Result<ReprocessOutcome, ReprocessError>) {
        match result {
            Ok(ReprocessOutcome::Completed { .. }) => self.completed += 1,
            Ok(ReprocessOutcome::NotFound) => self.not_found += 1,
            Err(err) => match err.state() {
                ReprocessState::TimedOut => self.timed_out += 1,
                ReprocessState::Cancelled => self.cancelled += 1,
                _ => self.failed += 1,
            },
        }
    }

    fn merge(&mut self, other: WorkerSummary) {
        self.completed += other.completed;
        self.not_found += other.not_found;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.cancelled += other.cancelled;
    }
}

/// Run `workers` tasks pulling from `queue` until it is closed and drained
/// or `cancel` fires. Blocked workers stop pulling, which is what applies
/// backpressure to the queue. At least one worker always runs.
pub async fn run_workers(
    pipeline: Arc<ReprocessPipeline>,
    queue: Arc<ReprocessQueue>,
    workers: usize,
    cancel: CancelSignal,
) -> WorkerSummary {
    let workers = if workers == 0 {
        warn!("a pool of 0 workers processes nothing; using 1");
        1
    } else {
        workers
    };
    let mut tasks = JoinSet::new();
    for worker in 0..workers {
        let pipeline = Arc::clone(&pipeline);
        let queue = Arc::clone(&queue);
        let mut cancel = cancel.clone();
        tasks.spawn(async move {
            let mut summary = WorkerSummary::default();
            loop {
                let id = tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => break,
                    id = queue.pop() => match id {
                        Some(id) => id,
                        None => break,
                    },
                };
                let result = pipeline.run(&id, &cancel).await;
                match &result {
                    Ok(outcome) => {
                        debug!(worker, deployment_id = %id, ?outcome, "reprocessed deployment")
                    }
                    Err(err) if err.state() == ReprocessState::Failed => {
                        warn!(worker, deployment_id = %id, error = %err, "reprocessing failed")
                    }
                    // Timeouts are logged by the gate; cancellation is expected.
                    Err(_) => {}
                }
                summary.record(&result);
            }
            summary
        });
    }

    let mut total = WorkerSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(summary) => total.merge(summary),
            Err(err) => warn!(error = %err, "reprocess worker stopped abnormally"),
        }
    }
    info!(?total, "reprocess workers finished");
    total
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::watch;

    use super::*;
    use crate::store::InMemoryDeploymentStore;
    use policy_engine::{Container, ImageName, Policy};

    const LATEST_TAG: &str = r#"
id: latest-tag
name: Latest tag
severity: LOW
lifecycle_stages: [DEPLOY]
policy_sections:
  - policy_groups:
      - field_name: Image Tag
        values: ["latest"]
"#;

    fn deployment(id: &str, cluster: &str, tag: &str) -> Deployment {
        Deployment {
            id: id.into(),
            name: format!("{id}-name"),
            cluster_id: cluster.into(),
            namespace: "default".into(),
            containers: vec![Container {
                name: "app".into(),
                image: ImageName {
                    tag: tag.into(),
                    ..Default::default()
                },
                privileged: false,
            }],
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct RecordingRisk {
        seen: Mutex<Vec<(String, usize)>>,
        fail: bool,
    }

    #[async_trait]
    impl RiskManager for RecordingRisk {
        async fn reprocess_deployment_risk(
            &self,
            deployment: &Deployment,
            alerts: Vec<Alert>,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("risk store unavailable");
            }
            self.seen
                .lock()
                .unwrap()
                .push((deployment.id.clone(), alerts.len()));
            Ok(())
        }
    }

    /// Counts fetches so tests can tell whether admission gated them.
    struct CountingStore {
        inner: InMemoryDeploymentStore,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl DeploymentStore for CountingStore {
        async fn get_deployment(&self, id: &str) -> anyhow::Result<Option<Deployment>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.get_deployment(id).await
        }

        async fn cluster_deployments(&self, cluster_id: &str) -> anyhow::Result<Vec<String>> {
            self.inner.cluster_deployments(cluster_id).await
        }
    }

    struct Fixture {
        pipeline: Arc<ReprocessPipeline>,
        store: Arc<CountingStore>,
        risk: Arc<RecordingRisk>,
    }

    fn fixture(capacity: usize, wait: Duration, risk: RecordingRisk) -> Fixture {
        let inner = InMemoryDeploymentStore::new();
        inner.insert(deployment("d1", "c1", "latest"));
        inner.insert(deployment("d2", "c1", "1.2.3"));
        inner.insert(deployment("d3", "c2", "latest"));
        let store = Arc::new(CountingStore {
            inner,
            fetches: AtomicUsize::new(0),
        });

        let policies = Arc::new(PolicySet::default());
        let policy: Policy = serde_yml::from_str(LATEST_TAG).unwrap();
        policies.upsert_policy(&policy).unwrap();

        let risk = Arc::new(risk);
        let pipeline = Arc::new(ReprocessPipeline::new(
            store.clone(),
            risk.clone(),
            policies,
            AdmissionGate::new(capacity, wait),
        ));
        Fixture {
            pipeline,
            store,
            risk,
        }
    }

    #[tokio::test]
    async fn run_evaluates_and_hands_alerts_to_risk() {
        let f = fixture(2, Duration::ZERO, RecordingRisk::default());
        let (_tx, cancel) = watch::channel(false);

        let outcome = f.pipeline.run("d1", &cancel).await.unwrap();
        assert_eq!(outcome, ReprocessOutcome::Completed { alerts: 1 });
        let outcome = f.pipeline.run("d2", &cancel).await.unwrap();
        assert_eq!(outcome, ReprocessOutcome::Completed { alerts: 0 });

        assert_eq!(
            *f.risk.seen.lock().unwrap(),
            vec![("d1".to_string(), 1), ("d2".to_string(), 0)]
        );
        assert_eq!(f.pipeline.gate().stats().holding, 0);
        assert_eq!(f.pipeline.gate().available(), 2);
    }

    #[tokio::test]
    async fn missing_deployment_completes_quietly() {
        let f = fixture(1, Duration::ZERO, RecordingRisk::default());
        let (_tx, cancel) = watch::channel(false);
        let outcome = f.pipeline.run("gone", &cancel).await.unwrap();
        assert_eq!(outcome, ReprocessOutcome::NotFound);
        assert!(f.risk.seen.lock().unwrap().is_empty());
        assert_eq!(f.pipeline.gate().available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_request_never_fetches() {
        let f = fixture(1, Duration::from_millis(100), RecordingRisk::default());
        let (_tx, cancel) = watch::channel(false);
        let _held = f.pipeline.gate().acquire(&cancel).await.unwrap();

        let err = f.pipeline.run("d1", &cancel).await.unwrap_err();
        assert_eq!(err.state(), ReprocessState::TimedOut);
        assert_eq!(f.store.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(f.pipeline.gate().stats().timeouts, 1);
    }

    #[tokio::test]
    async fn risk_failure_releases_the_slot() {
        let f = fixture(
            1,
            Duration::ZERO,
            RecordingRisk {
                fail: true,
                ..Default::default()
            },
        );
        let (_tx, cancel) = watch::channel(false);
        let err = f.pipeline.run("d1", &cancel).await.unwrap_err();
        assert_eq!(err.state(), ReprocessState::Failed);
        assert!(matches!(err, ReprocessError::Risk { ref id, .. } if id == "d1"));
        assert_eq!(f.pipeline.gate().available(), 1);
    }

    #[tokio::test]
    async fn cancelled_request_is_not_a_failure() {
        let f = fixture(1, Duration::ZERO, RecordingRisk::default());
        let (_tx, cancel) = watch::channel(true);
        let err = f.pipeline.run("d1", &cancel).await.unwrap_err();
        assert_eq!(err.state(), ReprocessState::Cancelled);
        assert_eq!(f.store.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reconcile_queues_cluster_deployments_once() {
        let f = fixture(1, Duration::ZERO, RecordingRisk::default());
        let queue = ReprocessQueue::new();
        assert_eq!(f.pipeline.reconcile("c1", &queue).await.unwrap(), 2);
        assert_eq!(f.pipeline.reconcile("c1", &queue).await.unwrap(), 0);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let f = fixture(2, Duration::ZERO, RecordingRisk::default());
        let queue = Arc::new(ReprocessQueue::new());
        queue.extend(["d1", "d2", "d3", "missing"]);
        queue.close();

        let (_tx, cancel) = watch::channel(false);
        let summary = run_workers(f.pipeline.clone(), queue.clone(), 3, cancel).await;

        assert_eq!(summary.completed, 3);
        assert_eq!(summary.not_found, 1);
        assert_eq!(summary.failed + summary.timed_out + summary.cancelled, 0);
        assert!(queue.is_empty());
        let mut seen: Vec<_> = f
            .risk
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["d1", "d2", "d3"]);
    }

    #[tokio::test]
    async fn zero_workers_still_drain_the_queue() {
        let f = fixture(0, Duration::ZERO, RecordingRisk::default());
        assert_eq!(f.pipeline.gate().capacity(), 1);
        let queue = Arc::new(ReprocessQueue::new());
        queue.extend(["d1", "d3"]);
        queue.close();

        let (_tx, cancel) = watch::channel(false);
        let summary = run_workers(f.pipeline.clone(), queue.clone(), 0, cancel).await;

        assert_eq!(summary.completed, 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn workers_stop_on_cancel() {
        let f = fixture(1, Duration::ZERO, RecordingRisk::default());
        let queue = Arc::new(ReprocessQueue::new());
        let (tx, cancel) = watch::channel(false);

        let pool = tokio::spawn(run_workers(f.pipeline.clone(), queue.clone(), 4, cancel));
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        let summary = pool.await.unwrap();
        assert_eq!(summary, WorkerSummary::default());
    }
}
