//! # risk-reprocess
//!
//! Re-evaluates deployment risk in bulk without overrunning shared
//! resources. Deployment IDs go through a deduplicating
//! [`ReprocessQueue`]; a fixed pool of workers pulls from it, and each
//! request must pass an [`AdmissionGate`] (a semaphore with a wait timeout)
//! before the deployment is fetched and evaluated.

pub mod admission;
mod pipeline;
mod queue;
mod store;

pub use admission::{AdmissionError, AdmissionGate, AdmissionPermit, AdmissionStats, CancelSignal};
pub use pipeline::{
    run_workers, DeploymentStore, ReprocessError, ReprocessOutcome, ReprocessPipeline,
    ReprocessState, RiskManager, WorkerSummary,
};
pub use queue::ReprocessQueue;
pub use store::InMemoryDeploymentStore;
