//! In-memory state store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::model::{ContextId, FailoverJob, NetworkMapping, VmContext};

use super::{FailoverStore, StoreError};

#[derive(Debug, Default)]
struct State {
    contexts: BTreeMap<ContextId, VmContext>,
    mappings: BTreeMap<ContextId, Vec<NetworkMapping>>,
    jobs: BTreeMap<ContextId, Vec<FailoverJob>>,
}

/// Thread-safe store backed by ordered maps. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with `contexts`.
    #[must_use]
    pub fn with_contexts(contexts: impl IntoIterator<Item = VmContext>) -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            for context in contexts {
                state.contexts.insert(context.context_id.clone(), context);
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FailoverStore for MemoryStore {
    fn context(&self, context_id: &ContextId) -> Result<VmContext, StoreError> {
        self.lock()
            .contexts
            .get(context_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "context",
                id: context_id.to_string(),
            })
    }

    fn save_context(&self, context: &VmContext) -> Result<(), StoreError> {
        self.lock()
            .contexts
            .insert(context.context_id.clone(), context.clone());
        Ok(())
    }

    fn network_mappings(&self, context_id: &ContextId) -> Result<Vec<NetworkMapping>, StoreError> {
        Ok(self
            .lock()
            .mappings
            .get(context_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save_network_mappings(
        &self,
        context_id: &ContextId,
        mappings: &[NetworkMapping],
    ) -> Result<(), StoreError> {
        self.lock()
            .mappings
            .insert(context_id.clone(), mappings.to_vec());
        Ok(())
    }

    fn jobs(&self, context_id: &ContextId) -> Result<Vec<FailoverJob>, StoreError> {
        Ok(self
            .lock()
            .jobs
            .get(context_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save_job(&self, job: &FailoverJob) -> Result<(), StoreError> {
        let mut state = self.lock();
        let jobs = state.jobs.entry(job.context_id.clone()).or_default();
        match jobs.iter_mut().find(|existing| existing.job_id == job.job_id) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        Ok(())
    }
}
