//! Payloads of complex commands.

use bytes::Bytes;

use super::MethodId;
use super::format::{WireReader, WireWriter};
use crate::error::{DecodeError, EncodeError};
use crate::types::{InstrumentationType, LoadedClass};

fn aligned(lengths: &[usize]) -> bool {
    lengths.windows(2).all(|pair| pair[0] == pair[1])
}

/// First batch of classes loaded by the target JVM once a root class appeared.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RootClassLoaded {
    pub classes: Vec<LoadedClass>,
}

impl RootClassLoaded {
    pub(crate) fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), EncodeError> {
        let names: Vec<&str> = self.classes.iter().map(|c| c.name.as_str()).collect();
        let loaders: Vec<i32> = self.classes.iter().map(|c| c.loader_id).collect();
        let parents: Vec<i32> = self.classes.iter().map(|c| c.parent_loader_id).collect();
        let bytes: Vec<Option<Vec<u8>>> =
            self.classes.iter().map(|c| Some(c.bytes.to_vec())).collect();

        w.put_string_array("class_names", &names)?;
        w.put_i32_array("loader_ids", &loaders)?;
        w.put_i32_array("parent_loader_ids", &parents)?;
        w.put_byte_arrays("class_bytes", &bytes)
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let names = r.read_string_array("class_names")?;
        let loaders = r.read_i32_array("loader_ids")?;
        let parents = r.read_i32_array("parent_loader_ids")?;
        let bytes = r.read_byte_arrays("class_bytes")?;

        if !aligned(&[names.len(), loaders.len(), parents.len(), bytes.len()]) {
            return Err(DecodeError::malformed(
                "RootClassLoaded",
                format!(
                    "{} names, {} loader ids, {} parent ids, {} class files",
                    names.len(),
                    loaders.len(),
                    parents.len(),
                    bytes.len()
                ),
            ));
        }

        let classes = names
            .into_iter()
            .zip(loaders)
            .zip(parents)
            .zip(bytes)
            .map(|(((name, loader), parent), bytes)| {
                LoadedClass::new(name, loader, parent, bytes.unwrap_or_default())
            })
            .collect();
        Ok(Self { classes })
    }
}

/// A single class loaded after the root batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLoaded {
    pub class: LoadedClass,
}

impl ClassLoaded {
    pub(crate) fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), EncodeError> {
        w.put_string("class_name", &self.class.name)?;
        w.put_i32(self.class.loader_id);
        w.put_i32(self.class.parent_loader_id);
        w.put_bytes("class_bytes", &self.class.bytes)
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let name = r.read_string("class_name")?;
        let loader_id = r.read_i32()?;
        let parent_loader_id = r.read_i32()?;
        let bytes = r.read_bytes("class_bytes")?;
        Ok(Self { class: LoadedClass::new(name, loader_id, parent_loader_id, bytes) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInvokedFirstTime {
    pub method_id: MethodId,
}

/// One class whose bytes the agent should redefine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassReplacement {
    pub class_name: String,
    pub loader_id: i32,
    pub bytes: Bytes,
}

impl ClassReplacement {
    pub fn new(class_name: impl Into<String>, loader_id: i32, bytes: impl Into<Bytes>) -> Self {
        Self { class_name: class_name.into(), loader_id, bytes: bytes.into() }
    }
}

/// Redefine a group of classes in the target JVM.
///
/// Sent with [`InstrumentationType::None`] and the original class files to remove all
/// injected code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentMethodGroup {
    pub instr_type: InstrumentationType,
    pub classes: Vec<ClassReplacement>,
}

impl InstrumentMethodGroup {
    pub(crate) fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), EncodeError> {
        let names: Vec<&str> = self.classes.iter().map(|c| c.class_name.as_str()).collect();
        let loaders: Vec<i32> = self.classes.iter().map(|c| c.loader_id).collect();
        let bytes: Vec<Option<Vec<u8>>> =
            self.classes.iter().map(|c| Some(c.bytes.to_vec())).collect();

        w.put_i32(self.instr_type.code());
        w.put_string_array("class_names", &names)?;
        w.put_i32_array("loader_ids", &loaders)?;
        w.put_byte_arrays("class_bytes", &bytes)
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let instr_type = InstrumentationType::from_code(r.read_i32()?)?;
        let names = r.read_string_array("class_names")?;
        let loaders = r.read_i32_array("loader_ids")?;
        let bytes = r.read_byte_arrays("class_bytes")?;

        if !aligned(&[names.len(), loaders.len(), bytes.len()]) {
            return Err(DecodeError::malformed(
                "InstrumentMethodGroup",
                format!(
                    "{} names, {} loader ids, {} class files",
                    names.len(),
                    loaders.len(),
                    bytes.len()
                ),
            ));
        }

        let mut classes = Vec::with_capacity(names.len());
        for ((class_name, loader_id), bytes) in names.into_iter().zip(loaders).zip(bytes) {
            let Some(bytes) = bytes else {
                return Err(DecodeError::malformed(
                    "InstrumentMethodGroup",
                    format!("missing class file for {class_name}"),
                ));
            };
            classes.push(ClassReplacement::new(class_name, loader_id, bytes));
        }
        Ok(Self { instr_type, classes })
    }
}

/// Start profiling: tells the agent which classes trigger the root batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateProfiling {
    pub instr_type: InstrumentationType,
    pub root_class_names: Vec<String>,
    pub instrument_spawned_threads: bool,
}

impl InitiateProfiling {
    pub(crate) fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), EncodeError> {
        w.put_i32(self.instr_type.code());
        w.put_string_array("root_class_names", &self.root_class_names)?;
        w.put_bool(self.instrument_spawned_threads);
        Ok(())
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            instr_type: InstrumentationType::from_code(r.read_i32()?)?,
            root_class_names: r.read_string_array("root_class_names")?,
            instrument_spawned_threads: r.read_bool("instrument_spawned_threads")?,
        })
    }
}

/// Ask the agent to resolve sampled method ids into names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetMethodNames {
    pub method_ids: Vec<MethodId>,
}

/// The agent's event buffer was flushed to shared storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBufferDumped {
    pub buffer_size: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetClassId {
    pub class_name: String,
    pub loader_id: i32,
}

/// Instrumentation parameters that may change while profiling is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeableInstrParams {
    pub lock_contention_monitoring: bool,
    pub sampling_interval_ms: i32,
    pub thread_sampling_interval_ms: i32,
}

impl ChangeableInstrParams {
    pub(crate) fn encode(&self, w: &mut WireWriter<'_>) {
        w.put_bool(self.lock_contention_monitoring);
        w.put_i32(self.sampling_interval_ms);
        w.put_i32(self.thread_sampling_interval_ms);
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            lock_contention_monitoring: r.read_bool("lock_contention_monitoring")?,
            sampling_interval_ms: r.read_i32()?,
            thread_sampling_interval_ms: r.read_i32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeHeapDump {
    pub output_file: String,
}
