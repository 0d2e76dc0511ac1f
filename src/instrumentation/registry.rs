//! Method metadata table of one profiling session.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::marking::MethodResolver;
use crate::types::MethodSignature;
use crate::wire::MethodId;

#[derive(Debug, Default)]
struct RegistryInner {
    by_id: HashMap<MethodId, MethodSignature>,
    by_signature: HashMap<MethodSignature, MethodId>,
    next_id: MethodId,
}

/// Maps method ids to `(class, name, signature)`.
///
/// Ids are assigned sequentially from 1 when the coordinator instruments a method.
/// Names resolved by the agent for sampled ids are inserted as they arrive.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    inner: RwLock<RegistryInner>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of `method`, assigning the next free one on first sight.
    pub fn register(&self, method: MethodSignature) -> MethodId {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(&id) = inner.by_signature.get(&method) {
            return id;
        }
        let mut id = inner.next_id.max(0) + 1;
        while inner.by_id.contains_key(&id) {
            id += 1;
        }
        inner.next_id = id;
        inner.by_id.insert(id, method.clone());
        inner.by_signature.insert(method, id);
        id
    }

    /// Records a name the agent resolved for `method_id`, replacing any earlier one.
    pub fn insert(&self, method_id: MethodId, method: MethodSignature) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = inner.by_id.insert(method_id, method.clone()) {
            inner.by_signature.remove(&previous);
        }
        inner.by_signature.entry(method).or_insert(method_id);
    }

    pub fn get(&self, method_id: MethodId) -> Option<MethodSignature> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).by_id.get(&method_id).cloned()
    }

    pub fn id_of(&self, method: &MethodSignature) -> Option<MethodId> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).by_signature.get(method).copied()
    }

    pub fn contains(&self, method_id: MethodId) -> bool {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).by_id.contains_key(&method_id)
    }

    /// Ids from `method_ids` that have no name yet.
    pub fn unresolved(&self, method_ids: &[MethodId]) -> Vec<MethodId> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut missing: Vec<MethodId> =
            method_ids.iter().copied().filter(|id| !inner.by_id.contains_key(id)).collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = RegistryInner::default();
    }
}

impl MethodResolver for MethodRegistry {
    fn resolve(&self, method_id: MethodId) -> Option<MethodSignature> {
        self.get(method_id)
    }
}
