//! Core domain types shared by the protocol and the profiler logic.
//!
//! ## Architecture
//!
//! - [`LoadedClass`] is a class reported by the agent, with its raw class file
//! - [`RootSelector`] picks the methods that get instrumented
//! - [`MethodSignature`] is a resolved `(class, name, signature)` triple with its
//!   flattened `class.method(sig)` form
//! - [`Mark`] and [`MarkMapping`] categorize methods by flattened-signature prefix
//! - [`InstrumentationType`] maps to the agent's instrumentation mode codes
//! - [`UpdateRate`] bounds how often telemetry consumers are notified
//!
//! ## Usage Example
//!
//! ```rust
//! use jfluid::types::{first_match, Mark, MarkMapping, MethodSignature};
//!
//! let mappings = vec![
//!     MarkMapping::new("com.foo.", Mark::new(1)),
//!     MarkMapping::new("com.foo.Bar.", Mark::new(2)),
//! ];
//! let method = MethodSignature::new("com.foo.Bar", "run", "()V");
//!
//! // First mapping in list order wins, even when a later one is more specific.
//! assert_eq!(first_match(&mappings, &method.flattened()), Mark::new(1));
//! ```

mod instr_type;
mod loaded_class;
mod mark;
mod selector;
mod update_rate;

// Re-export all public types
pub use instr_type::InstrumentationType;
pub use loaded_class::LoadedClass;
pub use mark::{Mark, MarkMapping, first_match};
pub use selector::{MethodSignature, RootSelector};
pub use update_rate::UpdateRate;
