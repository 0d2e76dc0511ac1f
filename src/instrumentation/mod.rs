//! Instrumentation coordination.
//!
//! When the agent reports loaded classes, the [`InstrumentationCoordinator`] reads each
//! class file, selects candidate methods with the session's root selectors, asks the
//! external [`Instrumentor`] for rewritten bytes and assembles the index-aligned
//! [`InstrumentationResult`] sent back to the agent. Instrumented methods get ids in the
//! shared [`MethodRegistry`].

mod coordinator;
mod registry;

pub use coordinator::InstrumentationCoordinator;
pub use registry::MethodRegistry;
pub use crate::wire::{ClassError, InstrumentationResult};

use crate::error::InstrumentError;
use crate::types::RootSelector;

/// The bytecode rewriter.
///
/// Returns `Ok(None)` when the class needs no changes. Implementations run on tokio's
/// blocking pool while the agent waits for the answer.
pub trait Instrumentor: Send + Sync {
    fn instrument(
        &self,
        class_name: &str,
        class_bytes: &[u8],
        root_selectors: &[RootSelector],
    ) -> Result<Option<Vec<u8>>, InstrumentError>;
}
