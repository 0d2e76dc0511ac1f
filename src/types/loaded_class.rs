//! Classes reported by the agent as loaded in the target JVM

use bytes::Bytes;

/// One class loaded in the target JVM, with its raw class file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedClass {
    /// Dotted class name
    pub name: String,
    /// Id of the defining class loader
    pub loader_id: i32,
    /// Id of the defining loader's parent (`-1` for the bootstrap loader)
    pub parent_loader_id: i32,
    /// Class file bytes as seen by the JVM (zero-copy via `Bytes`)
    pub bytes: Bytes,
}

impl LoadedClass {
    pub fn new(
        name: impl Into<String>,
        loader_id: i32,
        parent_loader_id: i32,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self { name: name.into(), loader_id, parent_loader_id, bytes: bytes.into() }
    }
}
