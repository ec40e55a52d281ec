use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{CompileError, EvaluationError};
use crate::evaluator::EvaluationCache;
use crate::event::{Deployment, Event, EventKind, FileOperation, ScopeContext};
use crate::fields::{FieldMatcher, FieldName};
use crate::schema::{EventSource, Exclusion, LifecycleStage, Policy, PolicyGroup};
use crate::scope::{ClusterLabelProvider, NamespaceLabelProvider, ScopeResolver};

// ---------------------------------------------------------------------------
// Compiled representation
// ---------------------------------------------------------------------------

/// One group of a section: a field predicate, optional negation, and an
/// optional file-operation restriction.
#[derive(Debug)]
pub(crate) struct CompiledGroup {
    matcher: FieldMatcher,
    negate: bool,
    operations: Option<Vec<FileOperation>>,
}

/// Outcome of a single group, kept for building violation messages.
#[derive(Debug, Clone)]
pub(crate) struct GroupMatch {
    pub field: FieldName,
    pub negate: bool,
    pub values: Vec<String>,
}

impl CompiledGroup {
    /// Without an operation restriction the group is `field XOR negate`.
    /// With one, negation applies to the operation test only:
    /// `field AND (negate ? op not in set : op in set)`.
    fn evaluate(&self, event: &Event) -> Option<GroupMatch> {
        let field = self.matcher.evaluate(event);
        let matched = match &self.operations {
            None => field.matched != self.negate,
            Some(operations) => {
                let op_listed = event
                    .file_access()
                    .is_some_and(|access| operations.contains(&access.operation));
                field.matched && (op_listed != self.negate)
            }
        };
        matched.then(|| GroupMatch {
            field: self.matcher.field(),
            negate: self.negate,
            values: field.values,
        })
    }
}

#[derive(Debug)]
pub(crate) struct CompiledSection {
    groups: Vec<CompiledGroup>,
}

impl CompiledSection {
    /// A section only applies to events that carry every field it names.
    fn applies_to(&self, kind: EventKind) -> bool {
        self.groups.iter().all(|g| g.matcher.field().available_on(kind))
    }

    /// All groups must match; returns their outcomes if they do.
    fn evaluate(&self, event: &Event) -> Option<Vec<GroupMatch>> {
        if !self.applies_to(event.kind()) {
            return None;
        }
        self.groups.iter().map(|g| g.evaluate(event)).collect()
    }
}

#[derive(Debug)]
struct CompiledExclusion {
    name: String,
    deployment_name: Option<String>,
    scope: Option<ScopeResolver>,
    expiration: Option<DateTime<Utc>>,
}

impl CompiledExclusion {
    fn excludes(
        &self,
        deployment: &Deployment,
        ctx: &ScopeContext<'_>,
        cache: &mut EvaluationCache,
        now: DateTime<Utc>,
    ) -> Result<bool, EvaluationError> {
        if self.expiration.is_some_and(|expiry| expiry <= now) {
            return Ok(false);
        }
        if let Some(name) = &self.deployment_name {
            if *name != deployment.name {
                return Ok(false);
            }
        }
        match &self.scope {
            Some(scope) => scope.matches(ctx, cache),
            None => Ok(true),
        }
    }
}

/// The executable form of a [`Policy`].
///
/// Owns its own copy of the policy; nothing in it changes after
/// construction. Updating a policy means compiling a new `CompiledPolicy`.
#[derive(Debug)]
pub struct CompiledPolicy {
    policy: Policy,
    sections: Vec<CompiledSection>,
    scope: ScopeResolver,
    exclusions: Vec<CompiledExclusion>,
}

impl CompiledPolicy {
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn id(&self) -> &str {
        &self.policy.id
    }

    /// Whether `event` should be evaluated against this policy at all:
    /// enabled, right lifecycle stage, and for runtime events the same
    /// event source.
    pub fn is_eligible(&self, event: &Event) -> bool {
        let stage = event.lifecycle_stage();
        if self.policy.disabled || !self.policy.has_lifecycle_stage(stage) {
            return false;
        }
        match event.kind() {
            EventKind::Deployment => true,
            _ => self.policy.event_source == event.source(),
        }
    }

    pub(crate) fn scope(&self) -> &ScopeResolver {
        &self.scope
    }

    /// Outcomes of the first matching section, if any.
    pub(crate) fn first_matching_section(&self, event: &Event) -> Option<Vec<GroupMatch>> {
        self.sections.iter().find_map(|s| s.evaluate(event))
    }

    pub(crate) fn is_excluded(
        &self,
        event: &Event,
        cache: &mut EvaluationCache,
        now: DateTime<Utc>,
    ) -> Result<bool, EvaluationError> {
        let Some(deployment) = event.deployment() else {
            return Ok(false);
        };
        let ctx = event.scope_context();
        for exclusion in &self.exclusions {
            if exclusion.excludes(deployment, &ctx, cache, now)? {
                debug!(
                    policy_id = %self.policy.id,
                    exclusion = %exclusion.name,
                    deployment = %deployment.name,
                    "deployment excluded from policy"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Compile `policy` without label providers. Policies scoped by cluster or
/// namespace labels fail to compile this way.
pub fn compile(policy: &Policy) -> Result<CompiledPolicy, CompileError> {
    compile_with_providers(policy, None, None)
}

/// Compile `policy`, binding the label providers used for label scopes.
pub fn compile_with_providers(
    policy: &Policy,
    cluster_provider: Option<Arc<dyn ClusterLabelProvider>>,
    namespace_provider: Option<Arc<dyn NamespaceLabelProvider>>,
) -> Result<CompiledPolicy, CompileError> {
    let policy = policy.clone();

    if policy.id.is_empty() {
        return Err(CompileError::EmptyId);
    }
    if policy.name.is_empty() {
        return Err(CompileError::EmptyName(policy.id));
    }
    if policy.policy_sections.is_empty() {
        return Err(CompileError::NoSections(policy.id));
    }
    // Runtime events always carry a concrete source; without one the policy
    // could never be selected.
    if policy.has_lifecycle_stage(LifecycleStage::Runtime)
        && policy.event_source == EventSource::NotApplicable
    {
        return Err(CompileError::RuntimeWithoutEventSource(policy.id));
    }

    let mut sections = Vec::with_capacity(policy.policy_sections.len());
    for (index, section) in policy.policy_sections.iter().enumerate() {
        if section.policy_groups.is_empty() {
            return Err(CompileError::EmptySection {
                policy_id: policy.id.clone(),
                section: index,
            });
        }
        let groups = section
            .policy_groups
            .iter()
            .map(|group| compile_group(&policy, group))
            .collect::<Result<Vec<_>, _>>()?;
        sections.push(CompiledSection { groups });
    }

    let scope = ScopeResolver::compile(
        &policy.scope,
        cluster_provider.clone(),
        namespace_provider.clone(),
    )?;

    let exclusions = policy
        .exclusions
        .iter()
        .map(|e| compile_exclusion(e, &cluster_provider, &namespace_provider))
        .collect::<Result<Vec<_>, _>>()?;

    debug!(
        policy_id = %policy.id,
        sections = sections.len(),
        scoped = !scope.is_wildcard(),
        exclusions = exclusions.len(),
        "compiled policy"
    );

    Ok(CompiledPolicy {
        policy,
        sections,
        scope,
        exclusions,
    })
}

fn compile_group(policy: &Policy, group: &PolicyGroup) -> Result<CompiledGroup, CompileError> {
    let field: FieldName = group.field_name.parse()?;
    if !field.allowed_for(policy.event_source) {
        return Err(CompileError::UnsupportedField {
            field: field.as_str(),
            event_source: policy.event_source,
        });
    }

    let matcher = FieldMatcher::compile(field, &group.values)?;

    let operations = match &group.operations {
        None => None,
        Some(_) if !field.is_path() => {
            return Err(CompileError::OperationsNotSupported(field.as_str()));
        }
        Some(ops) if ops.is_empty() => {
            return Err(CompileError::InvalidValue {
                field: field.as_str(),
                value: String::new(),
                reason: "operation restriction must list at least one operation".to_string(),
            });
        }
        Some(ops) => Some(ops.clone()),
    };

    Ok(CompiledGroup {
        matcher,
        negate: group.negate,
        operations,
    })
}

fn compile_exclusion(
    exclusion: &Exclusion,
    cluster_provider: &Option<Arc<dyn ClusterLabelProvider>>,
    namespace_provider: &Option<Arc<dyn NamespaceLabelProvider>>,
) -> Result<CompiledExclusion, CompileError> {
    let wrap = |source: CompileError| CompileError::InvalidExclusion {
        name: exclusion.name.clone(),
        source: Box::new(source),
    };

    let Some(deployment) = &exclusion.deployment else {
        return Err(wrap(CompileError::InvalidScope {
            index: 0,
            reason: "exclusion names no deployment".to_string(),
        }));
    };

    let scope = deployment
        .scope
        .as_ref()
        .map(|scope| {
            ScopeResolver::compile(
                std::slice::from_ref(scope),
                cluster_provider.clone(),
                namespace_provider.clone(),
            )
        })
        .transpose()
        .map_err(wrap)?;

    Ok(CompiledExclusion {
        name: exclusion.name.clone(),
        deployment_name: deployment.name.clone().filter(|n| !n.is_empty()),
        scope,
        expiration: exclusion.expiration,
    })
}
