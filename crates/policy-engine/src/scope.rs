//! Scope resolution.
//!
//! A policy's scope entries are compiled into a [`ScopeResolver`] bound to
//! the label providers handed to the compiler. The engine never talks to a
//! datastore directly; label lookups go through the provider traits and are
//! cached only inside an [`EvaluationCache`] for a single event.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use crate::error::{CompileError, EvaluationError};
use crate::evaluator::EvaluationCache;
use crate::event::ScopeContext;
use crate::schema::{Scope, ScopeLabel};

pub type Labels = HashMap<String, String>;

/// Looks up the labels of a cluster.
///
/// `Ok(None)` means the cluster does not exist; that is a non-match, not an
/// error. Implementations backed by a remote store enforce their own lookup
/// deadline.
pub trait ClusterLabelProvider: Send + Sync {
    fn cluster_labels(&self, cluster_id: &str) -> anyhow::Result<Option<Labels>>;
}

/// Looks up the labels of a namespace by namespace ID.
pub trait NamespaceLabelProvider: Send + Sync {
    fn namespace_labels(&self, namespace_id: &str) -> anyhow::Result<Option<Labels>>;
}

/// In-memory label source keyed by cluster or namespace ID. Labels can be
/// replaced at any time; resolvers observe the change on the next event.
#[derive(Debug, Default)]
pub struct StaticLabelProvider {
    labels: RwLock<HashMap<String, Labels>>,
}

impl StaticLabelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(labels: HashMap<String, Labels>) -> Self {
        Self {
            labels: RwLock::new(labels),
        }
    }

    pub fn set_labels(&self, id: impl Into<String>, labels: Labels) {
        self.labels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), labels);
    }

    fn get(&self, id: &str) -> Option<Labels> {
        self.labels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

impl ClusterLabelProvider for StaticLabelProvider {
    fn cluster_labels(&self, cluster_id: &str) -> anyhow::Result<Option<Labels>> {
        Ok(self.get(cluster_id))
    }
}

impl NamespaceLabelProvider for StaticLabelProvider {
    fn namespace_labels(&self, namespace_id: &str) -> anyhow::Result<Option<Labels>> {
        Ok(self.get(namespace_id))
    }
}

// ---------------------------------------------------------------------------
// Compiled scope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum ScopeRule {
    Direct {
        cluster: Option<String>,
        namespace: Option<String>,
    },
    Labels {
        cluster: Option<ScopeLabel>,
        namespace: Option<ScopeLabel>,
    },
}

/// Compiled form of a list of [`Scope`] entries.
#[derive(Clone, Default)]
pub struct ScopeResolver {
    rules: Vec<ScopeRule>,
    cluster_provider: Option<Arc<dyn ClusterLabelProvider>>,
    namespace_provider: Option<Arc<dyn NamespaceLabelProvider>>,
}

impl std::fmt::Debug for ScopeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeResolver")
            .field("rules", &self.rules)
            .field("cluster_provider", &self.cluster_provider.is_some())
            .field("namespace_provider", &self.namespace_provider.is_some())
            .finish()
    }
}

impl ScopeResolver {
    /// Validate and compile `scopes`, binding the given providers.
    pub fn compile(
        scopes: &[Scope],
        cluster_provider: Option<Arc<dyn ClusterLabelProvider>>,
        namespace_provider: Option<Arc<dyn NamespaceLabelProvider>>,
    ) -> Result<Self, CompileError> {
        let rules = scopes
            .iter()
            .enumerate()
            .map(|(index, scope)| {
                compile_rule(
                    index,
                    scope,
                    cluster_provider.is_some(),
                    namespace_provider.is_some(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            cluster_provider,
            namespace_provider,
        })
    }

    /// A resolver without entries matches everything.
    pub fn is_wildcard(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether the event at `ctx` falls inside any scope entry.
    pub fn matches(
        &self,
        ctx: &ScopeContext<'_>,
        cache: &mut EvaluationCache,
    ) -> Result<bool, EvaluationError> {
        if self.rules.is_empty() {
            return Ok(true);
        }
        for rule in &self.rules {
            if self.rule_matches(rule, ctx, cache)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn rule_matches(
        &self,
        rule: &ScopeRule,
        ctx: &ScopeContext<'_>,
        cache: &mut EvaluationCache,
    ) -> Result<bool, EvaluationError> {
        match rule {
            ScopeRule::Direct { cluster, namespace } => {
                if let Some(cluster) = cluster {
                    if cluster != ctx.cluster_id {
                        return Ok(false);
                    }
                }
                if let Some(namespace) = namespace {
                    if ctx.namespace != Some(namespace.as_str()) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ScopeRule::Labels { cluster, namespace } => {
                if let Some(label) = cluster {
                    if !self.cluster_label_matches(label, ctx, cache)? {
                        return Ok(false);
                    }
                }
                if let Some(label) = namespace {
                    if !self.namespace_label_matches(label, ctx, cache)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    fn cluster_label_matches(
        &self,
        label: &ScopeLabel,
        ctx: &ScopeContext<'_>,
        cache: &mut EvaluationCache,
    ) -> Result<bool, EvaluationError> {
        // Checked at compile time; a missing provider cannot get here.
        let Some(provider) = self.cluster_provider.as_deref() else {
            return Ok(false);
        };
        if ctx.cluster_id.is_empty() {
            return Ok(false);
        }
        let labels = cache.cluster_labels(provider, ctx.cluster_id)?;
        let matched = has_label(labels, label);
        trace!(cluster_id = ctx.cluster_id, key = %label.key, matched, "cluster label scope");
        Ok(matched)
    }

    fn namespace_label_matches(
        &self,
        label: &ScopeLabel,
        ctx: &ScopeContext<'_>,
        cache: &mut EvaluationCache,
    ) -> Result<bool, EvaluationError> {
        let Some(provider) = self.namespace_provider.as_deref() else {
            return Ok(false);
        };
        let Some(namespace_id) = ctx.namespace_id.filter(|id| !id.is_empty()) else {
            return Ok(false);
        };
        let labels = cache.namespace_labels(provider, namespace_id)?;
        let matched = has_label(labels, label);
        trace!(namespace_id, key = %label.key, matched, "namespace label scope");
        Ok(matched)
    }
}

fn has_label(labels: Option<&Labels>, label: &ScopeLabel) -> bool {
    labels
        .and_then(|l| l.get(&label.key))
        .is_some_and(|v| *v == label.value)
}

fn compile_rule(
    index: usize,
    scope: &Scope,
    has_cluster_provider: bool,
    has_namespace_provider: bool,
) -> Result<ScopeRule, CompileError> {
    let invalid = |reason: &str| CompileError::InvalidScope {
        index,
        reason: reason.to_string(),
    };

    let direct = scope.cluster.is_some() || scope.namespace.is_some();
    let labelled = scope.cluster_label.is_some() || scope.namespace_label.is_some();

    match (direct, labelled) {
        (true, true) => Err(invalid(
            "cluster/namespace cannot be combined with cluster_label/namespace_label",
        )),
        (false, false) => Err(invalid("scope entry sets no field")),
        (true, false) => {
            if scope.cluster.as_deref() == Some("") || scope.namespace.as_deref() == Some("") {
                return Err(invalid("cluster and namespace must not be empty"));
            }
            Ok(ScopeRule::Direct {
                cluster: scope.cluster.clone(),
                namespace: scope.namespace.clone(),
            })
        }
        (false, true) => {
            for label in [&scope.cluster_label, &scope.namespace_label]
                .into_iter()
                .flatten()
            {
                if label.key.is_empty() {
                    return Err(invalid("label key must not be empty"));
                }
            }
            if scope.cluster_label.is_some() && !has_cluster_provider {
                return Err(CompileError::MissingLabelProvider {
                    index,
                    kind: "cluster",
                });
            }
            if scope.namespace_label.is_some() && !has_namespace_provider {
                return Err(CompileError::MissingLabelProvider {
                    index,
                    kind: "namespace",
                });
            }
            Ok(ScopeRule::Labels {
                cluster: scope.cluster_label.clone(),
                namespace: scope.namespace_label.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProvider;

    impl ClusterLabelProvider for FailingProvider {
        fn cluster_labels(&self, _cluster_id: &str) -> anyhow::Result<Option<Labels>> {
            anyhow::bail!("cluster store unavailable")
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn providers() -> Arc<StaticLabelProvider> {
        let provider = StaticLabelProvider::new();
        provider.set_labels("c1", labels(&[("env", "prod")]));
        provider.set_labels("c2", labels(&[("env", "staging")]));
        provider.set_labels("ns-1", labels(&[("team", "backend")]));
        Arc::new(provider)
    }

    fn ctx<'a>(cluster_id: &'a str, namespace: &'a str, namespace_id: &'a str) -> ScopeContext<'a> {
        ScopeContext {
            cluster_id,
            namespace: Some(namespace),
            namespace_id: Some(namespace_id),
        }
    }

    fn resolver(scopes: &[Scope]) -> ScopeResolver {
        let p = providers();
        ScopeResolver::compile(scopes, Some(p.clone()), Some(p)).expect("scope should compile")
    }

    fn cluster_label(key: &str, value: &str) -> Scope {
        Scope {
            cluster_label: Some(ScopeLabel::new(key, value)),
            ..Default::default()
        }
    }

    #[test]
    fn no_entries_match_everything() {
        let r = resolver(&[]);
        assert!(r.is_wildcard());
        let mut cache = EvaluationCache::default();
        assert!(r.matches(&ctx("any", "any", "any"), &mut cache).unwrap());
    }

    #[test]
    fn direct_cluster_and_namespace() {
        let r = resolver(&[Scope {
            cluster: Some("c1".into()),
            namespace: Some("web".into()),
            ..Default::default()
        }]);
        let mut cache = EvaluationCache::default();
        assert!(r.matches(&ctx("c1", "web", "ns-1"), &mut cache).unwrap());
        assert!(!r.matches(&ctx("c1", "db", "ns-2"), &mut cache).unwrap());
        assert!(!r.matches(&ctx("c2", "web", "ns-1"), &mut cache).unwrap());
    }

    #[test]
    fn cluster_label_match() {
        let r = resolver(&[cluster_label("env", "prod")]);
        let mut cache = EvaluationCache::default();
        assert!(r.matches(&ctx("c1", "web", "ns-1"), &mut cache).unwrap());

        let mut cache = EvaluationCache::default();
        assert!(!r.matches(&ctx("c2", "web", "ns-1"), &mut cache).unwrap());
    }

    #[test]
    fn unknown_cluster_is_a_non_match() {
        let r = resolver(&[cluster_label("env", "prod")]);
        let mut cache = EvaluationCache::default();
        assert!(!r.matches(&ctx("c9", "web", "ns-1"), &mut cache).unwrap());
    }

    #[test]
    fn both_labels_must_match() {
        let r = resolver(&[Scope {
            cluster_label: Some(ScopeLabel::new("env", "prod")),
            namespace_label: Some(ScopeLabel::new("team", "backend")),
            ..Default::default()
        }]);
        let mut cache = EvaluationCache::default();
        assert!(r.matches(&ctx("c1", "web", "ns-1"), &mut cache).unwrap());

        let mut cache = EvaluationCache::default();
        assert!(!r.matches(&ctx("c1", "web", "ns-2"), &mut cache).unwrap());
    }

    #[test]
    fn entries_are_ored() {
        let r = resolver(&[
            Scope {
                cluster: Some("c9".into()),
                ..Default::default()
            },
            cluster_label("env", "staging"),
        ]);
        let mut cache = EvaluationCache::default();
        assert!(r.matches(&ctx("c2", "web", "ns-1"), &mut cache).unwrap());
    }

    #[test]
    fn labels_are_read_live_between_events() {
        let provider = providers();
        let r = ScopeResolver::compile(&[cluster_label("env", "prod")], Some(provider.clone()), None)
            .unwrap();

        let mut cache = EvaluationCache::default();
        assert!(!r.matches(&ctx("c2", "web", "ns-1"), &mut cache).unwrap());

        provider.set_labels("c2", labels(&[("env", "prod")]));
        cache.reset();
        assert!(r.matches(&ctx("c2", "web", "ns-1"), &mut cache).unwrap());
    }

    #[test]
    fn provider_failure_is_an_error() {
        let r = ScopeResolver::compile(
            &[cluster_label("env", "prod")],
            Some(Arc::new(FailingProvider)),
            None,
        )
        .unwrap();
        let mut cache = EvaluationCache::default();
        let err = r.matches(&ctx("c1", "web", "ns-1"), &mut cache).unwrap_err();
        assert!(
            err.to_string().contains("cluster store unavailable"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn mixed_direct_and_label_rejected() {
        let p = providers();
        let err = ScopeResolver::compile(
            &[Scope {
                cluster: Some("c1".into()),
                cluster_label: Some(ScopeLabel::new("env", "prod")),
                ..Default::default()
            }],
            Some(p.clone()),
            Some(p),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::InvalidScope { index: 0, .. }));
    }

    #[test]
    fn empty_entry_rejected() {
        let err = ScopeResolver::compile(&[Scope::default()], None, None).unwrap_err();
        assert!(err.to_string().contains("sets no field"), "{err}");
    }

    #[test]
    fn label_scope_without_provider_rejected() {
        let err = ScopeResolver::compile(&[cluster_label("env", "prod")], None, None).unwrap_err();
        assert!(matches!(
            err,
            CompileError::MissingLabelProvider {
                index: 0,
                kind: "cluster"
            }
        ));
    }

    #[test]
    fn node_context_never_matches_namespace_labels() {
        let p = providers();
        let r = ScopeResolver::compile(
            &[Scope {
                namespace_label: Some(ScopeLabel::new("team", "backend")),
                ..Default::default()
            }],
            None,
            Some(p),
        )
        .unwrap();
        let node_ctx = ScopeContext {
            cluster_id: "c1",
            namespace: None,
            namespace_id: None,
        };
        let mut cache = EvaluationCache::default();
        assert!(!r.matches(&node_ctx, &mut cache).unwrap());
    }
}
