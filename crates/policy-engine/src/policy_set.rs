//! Live registry of compiled policies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::Context;
use tracing::{debug, error, info};

use crate::compiler::{compile_with_providers, CompiledPolicy};
use crate::error::{ErrorList, PolicySetError};
use crate::schema::Policy;
use crate::scope::{ClusterLabelProvider, NamespaceLabelProvider};

type PolicyMap = HashMap<String, Arc<CompiledPolicy>>;

/// Rewrites of one policy attempted by [`PolicySet::remove_notifier`].
const NOTIFIER_REMOVAL_ATTEMPTS: usize = 3;

/// Persists policy updates made by the registry itself.
pub trait PolicyStore: Send + Sync {
    fn update_policy(&self, policy: &Policy) -> anyhow::Result<()>;
}

/// Concurrency-safe map from policy ID to [`CompiledPolicy`].
///
/// Readers take a snapshot of the current map and never wait on a compile
/// or on another reader. Writers build a new map and publish it with a
/// single pointer swap, serialized by `write_lock`.
pub struct PolicySet {
    policies: RwLock<Arc<PolicyMap>>,
    write_lock: Mutex<()>,
    cluster_provider: Option<Arc<dyn ClusterLabelProvider>>,
    namespace_provider: Option<Arc<dyn NamespaceLabelProvider>>,
}

impl std::fmt::Debug for PolicySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicySet")
            .field("num_policies", &self.len())
            .field("cluster_provider", &self.cluster_provider.is_some())
            .field("namespace_provider", &self.namespace_provider.is_some())
            .finish()
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl PolicySet {
    /// Create an empty set. Every policy upserted later is compiled against
    /// these label providers.
    pub fn new(
        cluster_provider: Option<Arc<dyn ClusterLabelProvider>>,
        namespace_provider: Option<Arc<dyn NamespaceLabelProvider>>,
    ) -> Self {
        Self {
            policies: RwLock::new(Arc::new(HashMap::new())),
            write_lock: Mutex::new(()),
            cluster_provider,
            namespace_provider,
        }
    }

    fn snapshot(&self) -> Arc<PolicyMap> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Copy the current map, apply `update`, and publish the result.
    fn modify(&self, update: impl FnOnce(&mut PolicyMap)) {
        self.try_modify(|map| {
            update(map);
            true
        });
    }

    /// Like [`modify`](Self::modify), but nothing is published when `update`
    /// returns `false`.
    fn try_modify(&self, update: impl FnOnce(&mut PolicyMap) -> bool) -> bool {
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.snapshot()).clone();
        if !update(&mut next) {
            return false;
        }
        *self.policies.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        true
    }

    // -- Mutation -------------------------------------------------------------

    /// Compile `policy` and install it, replacing any entry with the same
    /// ID. On a compile error the previous entry stays in place.
    pub fn upsert_policy(&self, policy: &Policy) -> Result<(), PolicySetError> {
        let compiled = compile_with_providers(
            policy,
            self.cluster_provider.clone(),
            self.namespace_provider.clone(),
        )
        .inspect_err(|err| {
            error!(
                policy_id = %policy.id,
                policy_name = %policy.name,
                error = %err,
                "policy failed to compile"
            );
        })?;

        let id = policy.id.clone();
        self.modify(|map| {
            map.insert(id, Arc::new(compiled));
        });
        debug!(policy_id = %policy.id, "policy upserted");
        Ok(())
    }

    /// Remove the entry for `id`. Missing IDs are ignored.
    pub fn remove_policy(&self, id: &str) {
        if !self.exists(id) {
            return;
        }
        self.modify(|map| {
            map.remove(id);
        });
        debug!(policy_id = id, "policy removed");
    }

    /// Drop `notifier_id` from every policy that references it, persist each
    /// rewritten policy through `store` and re-upsert it.
    ///
    /// A rewrite is only published over the entry it was derived from. If the
    /// policy was upserted concurrently, the newer version is rewritten
    /// instead, up to [`NOTIFIER_REMOVAL_ATTEMPTS`] times.
    pub fn remove_notifier(
        &self,
        notifier_id: &str,
        store: &dyn PolicyStore,
    ) -> Result<(), ErrorList> {
        let mut errors = ErrorList::new("notifier removal");
        for id in self.snapshot().keys() {
            if let Err(err) = self.remove_notifier_from(id, notifier_id, store) {
                errors.push(err);
            }
        }
        if errors.is_empty() {
            info!(notifier_id, "notifier removed from policies");
        }
        errors.into_result()
    }

    fn remove_notifier_from(
        &self,
        id: &str,
        notifier_id: &str,
        store: &dyn PolicyStore,
    ) -> anyhow::Result<()> {
        for _ in 0..NOTIFIER_REMOVAL_ATTEMPTS {
            let Some(current) = self.snapshot().get(id).cloned() else {
                return Ok(());
            };
            let policy = current.policy();
            if !policy.notifiers.iter().any(|n| n == notifier_id) {
                return Ok(());
            }
            let mut updated = policy.clone();
            updated.notifiers.retain(|n| n != notifier_id);

            store
                .update_policy(&updated)
                .with_context(|| format!("updating policy '{id}'"))?;
            let compiled = compile_with_providers(
                &updated,
                self.cluster_provider.clone(),
                self.namespace_provider.clone(),
            )
            .with_context(|| format!("re-upserting policy '{id}'"))?;

            let published = self.try_modify(|map| match map.get(id) {
                Some(entry) if Arc::ptr_eq(entry, &current) => {
                    map.insert(id.to_string(), Arc::new(compiled));
                    true
                }
                _ => false,
            });
            if published {
                debug!(policy_id = id, notifier_id, "notifier removed from policy");
                return Ok(());
            }
            debug!(policy_id = id, "policy changed during notifier removal; retrying");
        }
        anyhow::bail!("policy '{id}' kept changing during notifier removal")
    }

    // -- Reads ----------------------------------------------------------------

    pub fn exists(&self, id: &str) -> bool {
        self.snapshot().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` on the policy registered under `id`.
    pub fn for_one<F>(&self, id: &str, f: F) -> Result<(), PolicySetError>
    where
        F: FnOnce(&CompiledPolicy) -> anyhow::Result<()>,
    {
        let snapshot = self.snapshot();
        let compiled = snapshot
            .get(id)
            .ok_or_else(|| PolicySetError::NotFound(id.to_string()))?;
        f(compiled.as_ref()).map_err(PolicySetError::Callback)
    }

    /// Run `f` on every registered policy, in no particular order.
    ///
    /// Iterates a snapshot taken on entry. A failing callback does not stop
    /// the pass; every failure is returned together, tagged with its policy
    /// ID.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), ErrorList>
    where
        F: FnMut(&CompiledPolicy) -> anyhow::Result<()>,
    {
        let mut errors = ErrorList::new("policy evaluation");
        for (id, compiled) in self.snapshot().iter() {
            if let Err(err) = f(compiled.as_ref()) {
                errors.push(err.context(format!("policy '{id}'")));
            }
        }
        errors.into_result()
    }

    /// Point-in-time copy of the registry.
    pub fn compiled_policies(&self) -> HashMap<String, Arc<CompiledPolicy>> {
        (*self.snapshot()).clone()
    }
}
