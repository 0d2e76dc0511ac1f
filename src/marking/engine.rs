use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tracing::{debug, info, trace};

use super::{MethodResolver, StateObserver};
use crate::types::{Mark, MarkMapping, RootSelector, first_match};
use crate::wire::MethodId;

/// Label reported for [`Mark::DEFAULT`] when no label was configured.
pub const DEFAULT_MARK_LABEL: &str = "Uncategorized";

/// Cached mark of one method with the generation it was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheEntry {
    mark: Mark,
    generation: u64,
}

impl CacheEntry {
    fn is_valid(&self, current_generation: u64) -> bool {
        self.generation == current_generation
    }
}

#[derive(Debug)]
struct EngineState {
    generation: u64,
    mappings: Arc<[MarkMapping]>,
}

/// Assigns marks to methods.
///
/// The mapping list is swapped atomically by [`configure`](Self::configure). Each swap
/// bumps a generation counter; cached marks carry the generation they were computed
/// against and are served only while it is current, so a lookup never mixes the old and
/// new mapping sets.
///
/// Lock order is always state before cache.
pub struct MarkingEngine {
    resolver: Arc<dyn MethodResolver>,
    state: RwLock<EngineState>,
    cache: RwLock<HashMap<MethodId, CacheEntry>>,
    labels: RwLock<HashMap<Mark, String>>,
    observers: Mutex<Vec<Weak<dyn StateObserver>>>,
}

impl MarkingEngine {
    pub fn new(resolver: Arc<dyn MethodResolver>) -> Self {
        Self {
            resolver,
            state: RwLock::new(EngineState { generation: 0, mappings: Arc::from(Vec::new()) }),
            cache: RwLock::new(HashMap::new()),
            labels: RwLock::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Installs a new mapping list.
    ///
    /// Returns `false` and changes nothing when `mappings` equals the current list.
    /// Otherwise the generation is bumped, the cache cleared and observers notified.
    pub fn configure(&self, mappings: Vec<MarkMapping>) -> bool {
        let count = mappings.len();
        let generation = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state.mappings == *mappings {
                debug!("Mark mappings unchanged, keeping generation {}", state.generation);
                return false;
            }
            state.mappings = Arc::from(mappings);
            state.generation += 1;
            self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
            state.generation
        };

        info!("Marking engine configured with {} mappings (generation {})", count, generation);
        self.notify(generation);
        true
    }

    /// Removes all mappings; every method becomes [`Mark::DEFAULT`].
    pub fn deconfigure(&self) -> bool {
        self.configure(Vec::new())
    }

    /// Installs display names for marks.
    pub fn set_labels(&self, labels: HashMap<Mark, String>) {
        *self.labels.write().unwrap_or_else(PoisonError::into_inner) = labels;
    }

    pub fn label(&self, mark: Mark) -> String {
        if let Some(label) = self.labels.read().unwrap_or_else(PoisonError::into_inner).get(&mark) {
            return label.clone();
        }
        if mark.is_default() { DEFAULT_MARK_LABEL.to_string() } else { mark.to_string() }
    }

    pub fn generation(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).generation
    }

    pub fn mappings(&self) -> Arc<[MarkMapping]> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner).mappings)
    }

    pub fn is_configured(&self) -> bool {
        !self.state.read().unwrap_or_else(PoisonError::into_inner).mappings.is_empty()
    }

    /// Root selectors that make sure every mapped method gets instrumented.
    pub fn marker_selectors(&self) -> Vec<RootSelector> {
        let mut selectors: Vec<RootSelector> = Vec::new();
        for mapping in self.mappings().iter() {
            let selector = mapping.covering_selector();
            if !selectors.contains(&selector) {
                selectors.push(selector);
            }
        }
        selectors
    }

    pub fn mark_method(&self, method_id: MethodId) -> Mark {
        self.mark_method_tagged(method_id).0
    }

    /// Mark of `method_id` together with the generation it was computed against.
    ///
    /// Methods the resolver does not know yet are [`Mark::DEFAULT`] and are not cached.
    pub fn mark_method_tagged(&self, method_id: MethodId) -> (Mark, u64) {
        let (generation, mappings) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.get(&method_id) {
                if entry.is_valid(state.generation) {
                    return (entry.mark, state.generation);
                }
            }
            (state.generation, Arc::clone(&state.mappings))
        };

        let Some(method) = self.resolver.resolve(method_id) else {
            trace!("Method {} not resolved yet", method_id);
            return (Mark::DEFAULT, generation);
        };
        let mark = first_match(&mappings, &method.flattened());

        // Written only if no swap happened since the mappings were read; holding the
        // state read lock keeps `configure` out until the write is done.
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.generation == generation {
            self.cache
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(method_id, CacheEntry { mark, generation });
        }
        (mark, generation)
    }

    /// Registers an observer. Only a weak reference is kept.
    pub fn add_observer(&self, observer: &Arc<dyn StateObserver>) {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner).push(Arc::downgrade(observer));
    }

    fn notify(&self, generation: u64) {
        let live: Vec<Arc<dyn StateObserver>> = {
            let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in live {
            observer.state_changed(generation);
        }
    }

    pub fn cached_methods(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for MarkingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MarkingEngine")
            .field("generation", &state.generation)
            .field("mappings", &state.mappings.len())
            .finish_non_exhaustive()
    }
}
