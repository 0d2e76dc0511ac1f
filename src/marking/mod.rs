//! Mark attribution.
//!
//! Marks group methods into logical categories (e.g. "persistence", "rendering") so CPU
//! time can be reported per category. The [`MarkingEngine`] maps a method id to its mark
//! via prefix matching on the flattened signature `class.method(sig)`. A [`MarkTracker`]
//! follows one traversal of a calling-context tree and knows the mark in effect at the
//! current node.
//!
//! ```rust
//! use std::sync::Arc;
//! use jfluid::instrumentation::MethodRegistry;
//! use jfluid::marking::{MarkTracker, MarkingEngine};
//! use jfluid::types::{Mark, MarkMapping, MethodSignature};
//!
//! let registry = Arc::new(MethodRegistry::new());
//! let query = registry.register(MethodSignature::new("com.app.db.Pool", "query", "()V"));
//! let helper = registry.register(MethodSignature::new("com.app.util.Strings", "trim", "()V"));
//!
//! let engine = Arc::new(MarkingEngine::new(registry));
//! engine.configure(vec![MarkMapping::new("com.app.db.", Mark::new(1))]);
//!
//! let mut tracker = MarkTracker::new(Arc::clone(&engine));
//! tracker.on_start();
//! tracker.on_node(query);
//! tracker.on_node(helper);
//! // The helper has no mark of its own and runs on behalf of the database code.
//! assert_eq!(tracker.current_mark(), Mark::new(1));
//! tracker.on_backout();
//! tracker.on_backout();
//! tracker.on_stop();
//! ```

mod engine;
mod tracker;

pub use engine::{DEFAULT_MARK_LABEL, MarkingEngine};
pub use tracker::MarkTracker;

use crate::types::MethodSignature;
use crate::wire::MethodId;

/// Resolves a method id to its `(class, name, signature)`.
pub trait MethodResolver: Send + Sync {
    fn resolve(&self, method_id: MethodId) -> Option<MethodSignature>;
}

/// Notified after every mapping swap with the new generation.
pub trait StateObserver: Send + Sync {
    fn state_changed(&self, generation: u64);
}
