//! Payloads of status and complex responses.

use bytes::Bytes;

use super::MethodId;
use super::format::{WireReader, WireWriter};
use crate::error::{DecodeError, EncodeError};
use crate::types::MethodSignature;

/// Generic yes/no answer, optionally explaining a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub ok: bool,
    pub error_message: Option<String>,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self { ok: true, error_message: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { ok: false, error_message: Some(message.into()) }
    }

    pub(crate) fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), EncodeError> {
        w.put_i32(i32::from(self.ok));
        w.put_optional_string("error_message", self.error_message.as_deref())
    }

    /// The family tag is followed directly by the flag, so it is read as an `i32`.
    pub(crate) fn decode(ok: i32, r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let ok = match ok {
            0 => false,
            1 => true,
            other => {
                return Err(DecodeError::malformed("status response", format!("ok flag {other}")));
            }
        };
        Ok(Self { ok, error_message: r.read_optional_string("error_message")? })
    }
}

/// A class that could not be instrumented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassError {
    pub class_name: String,
    pub message: String,
}

/// Outcome of instrumenting a batch of classes.
///
/// Entries are index-aligned and follow the order in which classes were presented. A
/// class that was left untouched has no method ids and no replacement bytes. The three
/// per-class vectors are private so they can only grow together.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstrumentationResult {
    class_names: Vec<String>,
    method_ids: Vec<Vec<MethodId>>,
    replacement_bytes: Vec<Option<Bytes>>,
    errors: Vec<ClassError>,
}

impl InstrumentationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(classes: usize) -> Self {
        Self {
            class_names: Vec::with_capacity(classes),
            method_ids: Vec::with_capacity(classes),
            replacement_bytes: Vec::with_capacity(classes),
            errors: Vec::new(),
        }
    }

    /// Appends a class together with its instrumented method ids and new class file.
    pub fn push_class(
        &mut self,
        class_name: impl Into<String>,
        method_ids: Vec<MethodId>,
        replacement: Option<Bytes>,
    ) {
        self.class_names.push(class_name.into());
        self.method_ids.push(method_ids);
        self.replacement_bytes.push(replacement);
    }

    /// Appends a class that keeps its original bytes.
    pub fn push_untouched(&mut self, class_name: impl Into<String>) {
        self.push_class(class_name, Vec::new(), None);
    }

    pub fn record_error(&mut self, class_name: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ClassError { class_name: class_name.into(), message: message.into() });
    }

    pub fn len(&self) -> usize {
        self.class_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_names.is_empty()
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn method_ids(&self) -> &[Vec<MethodId>] {
        &self.method_ids
    }

    pub fn replacement_bytes(&self) -> &[Option<Bytes>] {
        &self.replacement_bytes
    }

    pub fn errors(&self) -> &[ClassError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// All per-class failures joined into one line, `None` when there were none.
    pub fn error_message(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let parts: Vec<String> =
            self.errors.iter().map(|e| format!("{}: {}", e.class_name, e.message)).collect();
        Some(parts.join("; "))
    }

    /// Number of classes that received new bytes.
    pub fn replaced_count(&self) -> usize {
        self.replacement_bytes.iter().filter(|b| b.is_some()).count()
    }

    /// Every instrumented `(class name, method id)` pair in presentation order.
    pub fn instrumented_methods(&self) -> impl Iterator<Item = (&str, MethodId)> + '_ {
        self.class_names
            .iter()
            .zip(&self.method_ids)
            .flat_map(|(name, ids)| ids.iter().map(move |&id| (name.as_str(), id)))
    }

    pub(crate) fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), EncodeError> {
        if self.class_names.len() != self.method_ids.len()
            || self.class_names.len() != self.replacement_bytes.len()
        {
            return Err(EncodeError::Misaligned { context: "instrumentation result" });
        }
        let bytes: Vec<Option<Vec<u8>>> =
            self.replacement_bytes.iter().map(|b| b.as_ref().map(|b| b.to_vec())).collect();
        let error_classes: Vec<&str> = self.errors.iter().map(|e| e.class_name.as_str()).collect();
        let error_messages: Vec<&str> = self.errors.iter().map(|e| e.message.as_str()).collect();

        w.put_string_array("class_names", &self.class_names)?;
        w.put_i32_arrays("method_ids", &self.method_ids)?;
        w.put_byte_arrays("replacement_bytes", &bytes)?;
        w.put_string_array("error_classes", &error_classes)?;
        w.put_string_array("error_messages", &error_messages)
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let class_names = r.read_string_array("class_names")?;
        let method_ids = r.read_i32_arrays("method_ids")?;
        let replacement_bytes = r.read_byte_arrays("replacement_bytes")?;
        let error_classes = r.read_string_array("error_classes")?;
        let error_messages = r.read_string_array("error_messages")?;

        if class_names.len() != method_ids.len() || class_names.len() != replacement_bytes.len()
        {
            return Err(DecodeError::malformed(
                "instrumentation result",
                format!(
                    "{} classes, {} method id lists, {} replacements",
                    class_names.len(),
                    method_ids.len(),
                    replacement_bytes.len()
                ),
            ));
        }
        if error_classes.len() != error_messages.len() {
            return Err(DecodeError::malformed(
                "instrumentation result",
                format!(
                    "{} failed classes, {} error messages",
                    error_classes.len(),
                    error_messages.len()
                ),
            ));
        }

        Ok(Self {
            class_names,
            method_ids,
            replacement_bytes: replacement_bytes.into_iter().map(|b| b.map(Bytes::from)).collect(),
            errors: error_classes
                .into_iter()
                .zip(error_messages)
                .map(|(class_name, message)| ClassError { class_name, message })
                .collect(),
        })
    }
}

/// Number of general telemetry values in a [`MonitoredNumbers`] response.
pub const GENERAL_NUMBERS_SIZE: usize = 10;

/// Positions of the general telemetry values.
pub mod general_index {
    pub const FREE_MEMORY: usize = 0;
    pub const TOTAL_MEMORY: usize = 1;
    pub const USER_THREADS: usize = 2;
    pub const SYSTEM_THREADS: usize = 3;
    pub const SURVIVING_GENERATIONS: usize = 4;
    pub const GC_TIME: usize = 5;
    pub const GC_PAUSE: usize = 6;
    pub const LOADED_CLASSES: usize = 7;
    pub const TIMESTAMP: usize = 8;
    pub const PROCESS_CPU_TIME: usize = 9;
}

/// Raw telemetry snapshot as sent by the agent.
///
/// The number of general values is not checked here; conversion into a
/// [`TelemetrySample`](crate::telemetry::TelemetrySample) rejects a wrong count.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MonitoredNumbers {
    pub general_numbers: Vec<i64>,
    pub gc_starts: Vec<i64>,
    pub gc_finishes: Vec<i64>,
}

impl MonitoredNumbers {
    pub(crate) fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), EncodeError> {
        w.put_i64_array("general_numbers", &self.general_numbers)?;
        w.put_i64_array("gc_starts", &self.gc_starts)?;
        w.put_i64_array("gc_finishes", &self.gc_finishes)
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            general_numbers: r.read_i64_array("general_numbers")?,
            gc_starts: r.read_i64_array("gc_starts")?,
            gc_finishes: r.read_i64_array("gc_finishes")?,
        })
    }
}

/// Names for the method ids of a `GetMethodNamesForJMethodIds` request, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodNames {
    pub methods: Vec<MethodSignature>,
}

impl MethodNames {
    pub(crate) fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), EncodeError> {
        let classes: Vec<&str> = self.methods.iter().map(|m| m.class_name.as_str()).collect();
        let names: Vec<&str> = self.methods.iter().map(|m| m.method_name.as_str()).collect();
        let signatures: Vec<&str> = self.methods.iter().map(|m| m.signature.as_str()).collect();
        w.put_string_array("class_names", &classes)?;
        w.put_string_array("method_names", &names)?;
        w.put_string_array("signatures", &signatures)
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let classes = r.read_string_array("class_names")?;
        let names = r.read_string_array("method_names")?;
        let signatures = r.read_string_array("signatures")?;
        if classes.len() != names.len() || classes.len() != signatures.len() {
            return Err(DecodeError::malformed(
                "method names",
                format!(
                    "{} classes, {} names, {} signatures",
                    classes.len(),
                    names.len(),
                    signatures.len()
                ),
            ));
        }
        let methods = classes
            .into_iter()
            .zip(names)
            .zip(signatures)
            .map(|((class, name), sig)| MethodSignature::new(class, name, sig))
            .collect();
        Ok(Self { methods })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassIdResponse {
    pub class_id: Option<i32>,
}

impl ClassIdResponse {
    pub(crate) fn encode(&self, w: &mut WireWriter<'_>) {
        w.put_bool(self.class_id.is_some());
        w.put_i32(self.class_id.unwrap_or(0));
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let found = r.read_bool("class_found")?;
        let id = r.read_i32()?;
        Ok(Self { class_id: found.then_some(id) })
    }
}

/// Properties of the target JVM.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmProperties {
    pub java_version: String,
    pub vm_version: String,
    pub java_command: String,
    pub jvm_arguments: String,
    pub max_heap_size: i64,
    pub start_time: i64,
}

impl VmProperties {
    pub(crate) fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), EncodeError> {
        w.put_string("java_version", &self.java_version)?;
        w.put_string("vm_version", &self.vm_version)?;
        w.put_string("java_command", &self.java_command)?;
        w.put_string("jvm_arguments", &self.jvm_arguments)?;
        w.put_i64(self.max_heap_size);
        w.put_i64(self.start_time);
        Ok(())
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            java_version: r.read_string("java_version")?,
            vm_version: r.read_string("vm_version")?,
            java_command: r.read_string("java_command")?,
            jvm_arguments: r.read_string("jvm_arguments")?,
            max_heap_size: r.read_i64()?,
            start_time: r.read_i64()?,
        })
    }
}
