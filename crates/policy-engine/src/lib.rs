//! # policy-engine
//!
//! Compiles declarative security policies and evaluates runtime events
//! against them. Policies are compiled once into immutable
//! [`CompiledPolicy`] values held in a [`PolicySet`]; events are matched
//! against the set and every match yields an [`Alert`] with typed
//! violations. Enforcement, persistence and notification are left to the
//! caller.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use policy_engine::{loader, match_all, Event, PolicySet};
//!
//! let set = PolicySet::default();
//! for policy in loader::load_policies("policies.yaml").unwrap() {
//!     set.upsert_policy(&policy).unwrap();
//! }
//! let event: Event = serde_json::from_str(r#"{"type": "deployment", "id": "d1",
//!     "name": "web", "cluster_id": "c1"}"#).unwrap();
//! let outcome = match_all(&set, &event);
//! println!("{} alerts", outcome.alerts.len());
//! ```

mod compiler;
mod error;
mod evaluator;
mod event;
pub mod fields;
pub mod loader;
mod policy_set;
mod schema;
pub mod scope;
mod violation;

// Re-export primary public API at crate root.
pub use compiler::{compile, compile_with_providers, CompiledPolicy};
pub use error::{CompileError, ErrorList, EvaluationError, PolicySetError};
pub use evaluator::{match_all, EvaluationCache, MatchAllOutcome};
pub use event::{
    Container, Deployment, Event, EventKind, FileAccess, FileInfo, FileOperation, ImageName,
    Node, ProcessIndicator, ProcessSignal, ScopeContext,
};
pub use policy_set::{PolicySet, PolicyStore};
pub use schema::{
    EventSource, ExcludedDeployment, Exclusion, LifecycleStage, Policy, PolicyGroup,
    PolicySection, Scope, ScopeLabel, Severity,
};
pub use scope::{ClusterLabelProvider, Labels, NamespaceLabelProvider, StaticLabelProvider};
pub use violation::{Alert, AlertEntity, AlertViolation, ViolationType, Violations};
