use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use chrono::Utc;
use tracing::{debug, trace};

use crate::compiler::{CompiledPolicy, GroupMatch};
use crate::error::{ErrorList, EvaluationError};
use crate::event::Event;
use crate::policy_set::PolicySet;
use crate::scope::{ClusterLabelProvider, Labels, NamespaceLabelProvider};
use crate::violation::{Alert, AlertViolation, Violations};

// ---------------------------------------------------------------------------
// Per-event scratch state
// ---------------------------------------------------------------------------

/// Scratch space reused across the policies evaluated against one event.
///
/// Holds label lookups so that many label-scoped policies cost one provider
/// call per cluster or namespace. Call [`reset`](Self::reset) (or build a new
/// cache) before moving to the next event; labels are never kept longer than
/// that. Not meant to be shared between threads.
#[derive(Debug, Default)]
pub struct EvaluationCache {
    cluster_labels: HashMap<String, Option<Labels>>,
    namespace_labels: HashMap<String, Option<Labels>>,
}

impl EvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything looked up so far, keeping the allocations.
    pub fn reset(&mut self) {
        self.cluster_labels.clear();
        self.namespace_labels.clear();
    }

    pub(crate) fn cluster_labels(
        &mut self,
        provider: &dyn ClusterLabelProvider,
        cluster_id: &str,
    ) -> Result<Option<&Labels>, EvaluationError> {
        if !self.cluster_labels.contains_key(cluster_id) {
            let labels = provider.cluster_labels(cluster_id).map_err(|err| {
                EvaluationError::LabelLookup {
                    kind: "cluster",
                    id: cluster_id.to_string(),
                    source: err.into(),
                }
            })?;
            self.cluster_labels.insert(cluster_id.to_string(), labels);
        }
        Ok(self.cluster_labels.get(cluster_id).and_then(Option::as_ref))
    }

    pub(crate) fn namespace_labels(
        &mut self,
        provider: &dyn NamespaceLabelProvider,
        namespace_id: &str,
    ) -> Result<Option<&Labels>, EvaluationError> {
        if !self.namespace_labels.contains_key(namespace_id) {
            let labels = provider.namespace_labels(namespace_id).map_err(|err| {
                EvaluationError::LabelLookup {
                    kind: "namespace",
                    id: namespace_id.to_string(),
                    source: err.into(),
                }
            })?;
            self.namespace_labels.insert(namespace_id.to_string(), labels);
        }
        Ok(self.namespace_labels.get(namespace_id).and_then(Option::as_ref))
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

impl CompiledPolicy {
    /// Evaluate `event` against this policy.
    ///
    /// Returns an empty [`Violations`] when nothing matched, the event is out
    /// of scope, or an active exclusion covers the deployment. Scope and
    /// exclusion lookups only happen once a section has matched. A panic in
    /// a matcher or a label provider is returned as
    /// [`EvaluationError::MatcherPanicked`].
    pub fn matches(
        &self,
        cache: &mut EvaluationCache,
        event: &Event,
    ) -> Result<Violations, EvaluationError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.match_event(cache, event))).unwrap_or_else(
            |payload| {
                Err(EvaluationError::MatcherPanicked {
                    policy_id: self.id().to_string(),
                    message: panic_message(payload.as_ref()),
                })
            },
        )
    }

    fn match_event(
        &self,
        cache: &mut EvaluationCache,
        event: &Event,
    ) -> Result<Violations, EvaluationError> {
        let Some(groups) = self.first_matching_section(event) else {
            trace!(policy_id = %self.id(), kind = ?event.kind(), "no section matched");
            return Ok(Violations::default());
        };

        if !self.scope().matches(&event.scope_context(), cache)? {
            trace!(policy_id = %self.id(), "event out of policy scope");
            return Ok(Violations::default());
        }

        if self.is_excluded(event, cache, Utc::now())? {
            return Ok(Violations::default());
        }

        let violations = build_violations(event, &groups);
        debug!(
            policy_id = %self.id(),
            kind = ?event.kind(),
            violations = violations.len(),
            "policy matched"
        );
        Ok(violations)
    }
}

/// File and process events produce one violation describing the event
/// itself. Deployment events produce one violation per matched group.
fn build_violations(event: &Event, groups: &[GroupMatch]) -> Violations {
    let alert_violations = match event {
        Event::DeploymentFileAccess { access, .. } | Event::NodeFileAccess { access, .. } => {
            vec![AlertViolation::file_access(access)]
        }
        Event::Process { indicator, .. } => vec![AlertViolation::process(indicator)],
        Event::Deployment(_) => groups
            .iter()
            .map(|group| AlertViolation::generic(group_message(group)))
            .collect(),
    };
    Violations { alert_violations }
}

fn group_message(group: &GroupMatch) -> String {
    if group.negate || group.values.is_empty() {
        format!("'{}' does not match any allowed value", group.field)
    } else {
        format!("'{}' matched: {}", group.field, group.values.join(", "))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Bulk evaluation
// ---------------------------------------------------------------------------

/// Result of evaluating one event against a whole [`PolicySet`].
#[derive(Debug, Default)]
pub struct MatchAllOutcome {
    pub alerts: Vec<Alert>,
    /// Per-policy failures. Other policies were still evaluated.
    pub errors: Option<ErrorList>,
}

/// Evaluate `event` against every eligible policy in `set`.
///
/// Policies that are disabled, lack the event's lifecycle stage, or listen
/// to a different event source are skipped before matching. One policy
/// failing does not stop the others.
pub fn match_all(set: &PolicySet, event: &Event) -> MatchAllOutcome {
    let mut cache = EvaluationCache::new();
    let mut alerts = Vec::new();

    let result = set.for_each(|compiled| {
        if !compiled.is_eligible(event) {
            return Ok(());
        }
        let violations = compiled.matches(&mut cache, event)?;
        if !violations.is_empty() {
            alerts.push(Alert::new(compiled.policy(), event, violations));
        }
        Ok(())
    });

    MatchAllOutcome {
        alerts,
        errors: result.err(),
    }
}
