//! Test fixtures shared by unit tests and benchmarks.
//!
//! - [`ClassFileBuilder`] assembles small but structurally valid class files
//! - [`sample`] / [`sample_numbers`] build telemetry snapshots
//! - [`ScriptedInstrumentor`] stands in for the external bytecode rewriter
//! - [`FakeAgent`] answers profiler requests over any async stream

#![cfg(any(test, feature = "benchmark"))]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{InstrumentError, SessionError};
use crate::instrumentation::Instrumentor;
use crate::session::Session;
use crate::telemetry::TelemetrySample;
use crate::types::{MethodSignature, RootSelector};
use crate::wire::{
    ClassIdResponse, Command, GENERAL_NUMBERS_SIZE, Message, MethodId, MethodNames,
    MonitoredNumbers, Response, SimpleCommand, VmProperties, general_index,
};

const ACC_PUBLIC: u16 = 0x0001;
const ACC_SUPER: u16 = 0x0020;
const ACC_ABSTRACT: u16 = 0x0400;

/// Builds class files accepted by [`ClassFile::parse`](crate::classfile::ClassFile::parse).
#[derive(Debug, Clone)]
pub struct ClassFileBuilder {
    pool: Vec<u8>,
    slots: u16,
    utf8: HashMap<String, u16>,
    this_class: u16,
    super_class: u16,
    methods: Vec<(u16, u16, u16, bool)>,
}

impl ClassFileBuilder {
    /// `internal_name` uses slashes, e.g. `com/example/Service`.
    pub fn new(internal_name: &str) -> Self {
        let mut builder = Self {
            pool: Vec::new(),
            slots: 0,
            utf8: HashMap::new(),
            this_class: 0,
            super_class: 0,
            methods: Vec::new(),
        };
        builder.this_class = builder.class_ref(internal_name);
        builder.super_class = builder.class_ref("java/lang/Object");
        builder
    }

    fn utf8(&mut self, value: &str) -> u16 {
        if let Some(&index) = self.utf8.get(value) {
            return index;
        }
        self.pool.push(1);
        self.pool.extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.pool.extend_from_slice(value.as_bytes());
        self.slots += 1;
        self.utf8.insert(value.to_string(), self.slots);
        self.slots
    }

    fn class_ref(&mut self, internal_name: &str) -> u16 {
        let name = self.utf8(internal_name);
        self.pool.push(7);
        self.pool.extend_from_slice(&name.to_be_bytes());
        self.slots += 1;
        self.slots
    }

    /// Adds a `long` constant, which occupies two pool slots.
    pub fn long_constant(mut self, value: i64) -> Self {
        self.pool.push(5);
        self.pool.extend_from_slice(&value.to_be_bytes());
        self.slots += 2;
        self
    }

    pub fn method(mut self, name: &str, descriptor: &str) -> Self {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        self.methods.push((ACC_PUBLIC, name, descriptor, true));
        self
    }

    pub fn abstract_method(mut self, name: &str, descriptor: &str) -> Self {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        self.methods.push((ACC_PUBLIC | ACC_ABSTRACT, name, descriptor, false));
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        let code = self.utf8("Code");

        let mut out = Vec::with_capacity(64 + self.pool.len());
        out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&(self.slots + 1).to_be_bytes());
        out.extend_from_slice(&self.pool);
        out.extend_from_slice(&(ACC_PUBLIC | ACC_SUPER).to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // interfaces
        out.extend_from_slice(&0u16.to_be_bytes()); // fields
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for &(flags, name, descriptor, has_code) in &self.methods {
            out.extend_from_slice(&flags.to_be_bytes());
            out.extend_from_slice(&name.to_be_bytes());
            out.extend_from_slice(&descriptor.to_be_bytes());
            if has_code {
                // Opaque body: max_stack, max_locals, code_length 1, `return`, no handlers.
                let body: [u8; 13] = [0, 1, 0, 1, 0, 0, 0, 1, 0xb1, 0, 0, 0, 0];
                out.extend_from_slice(&1u16.to_be_bytes());
                out.extend_from_slice(&code.to_be_bytes());
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(&body);
            } else {
                out.extend_from_slice(&0u16.to_be_bytes());
            }
        }
        out.extend_from_slice(&0u16.to_be_bytes()); // class attributes
        out
    }
}

/// A telemetry sample at `timestamp` with plausible general values.
pub fn sample(timestamp: i64, gc_starts: &[i64], gc_finishes: &[i64]) -> TelemetrySample {
    TelemetrySample {
        timestamp,
        free_memory: 64 << 20,
        total_memory: 256 << 20,
        user_threads: 12,
        system_threads: 4,
        surviving_generations: 3,
        loaded_classes: 1_500,
        relative_gc_time: 15,
        last_gc_pause: 2,
        process_cpu_time: timestamp * 1_000,
        gc_starts: gc_starts.to_vec(),
        gc_finishes: gc_finishes.to_vec(),
    }
}

/// The wire form of [`sample`].
pub fn sample_numbers(timestamp: i64, gc_starts: &[i64], gc_finishes: &[i64]) -> MonitoredNumbers {
    let mut general = vec![0i64; GENERAL_NUMBERS_SIZE];
    general[general_index::FREE_MEMORY] = 64 << 20;
    general[general_index::TOTAL_MEMORY] = 256 << 20;
    general[general_index::USER_THREADS] = 12;
    general[general_index::SYSTEM_THREADS] = 4;
    general[general_index::SURVIVING_GENERATIONS] = 3;
    general[general_index::GC_TIME] = 15;
    general[general_index::GC_PAUSE] = 2;
    general[general_index::LOADED_CLASSES] = 1_500;
    general[general_index::TIMESTAMP] = timestamp;
    general[general_index::PROCESS_CPU_TIME] = timestamp * 1_000;
    MonitoredNumbers {
        general_numbers: general,
        gc_starts: gc_starts.to_vec(),
        gc_finishes: gc_finishes.to_vec(),
    }
}

/// Instrumentor that appends a marker to the class bytes and fails for chosen classes.
#[derive(Debug, Default)]
pub struct ScriptedInstrumentor {
    failing: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

/// Appended to every class file rewritten by [`ScriptedInstrumentor`].
pub const INSTRUMENTED_MARKER: &[u8] = b"#instrumented";

impl ScriptedInstrumentor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(mut self, class_name: &str) -> Self {
        self.failing.insert(class_name.to_string());
        self
    }

    /// Class names passed to `instrument`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Instrumentor for ScriptedInstrumentor {
    fn instrument(
        &self,
        class_name: &str,
        class_bytes: &[u8],
        _selectors: &[RootSelector],
    ) -> Result<Option<Vec<u8>>, InstrumentError> {
        self.calls.lock().unwrap().push(class_name.to_string());
        if self.failing.contains(class_name) {
            return Err(InstrumentError::new(format!("cannot rewrite {class_name}")));
        }
        let mut out = class_bytes.to_vec();
        out.extend_from_slice(INSTRUMENTED_MARKER);
        Ok(Some(out))
    }
}

/// Scripted stand-in for the agent running inside the target JVM.
#[derive(Debug, Clone, Default)]
pub struct FakeAgent {
    telemetry: VecDeque<MonitoredNumbers>,
    method_names: HashMap<MethodId, MethodSignature>,
    vm_properties: VmProperties,
}

/// Handle to a running [`FakeAgent`].
pub struct FakeAgentHandle {
    session: Arc<Session>,
    responses: mpsc::UnboundedReceiver<Response>,
    received: Arc<Mutex<Vec<Command>>>,
    task: JoinHandle<()>,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self {
            vm_properties: VmProperties {
                java_version: "21.0.2".to_string(),
                vm_version: "21.0.2+13".to_string(),
                java_command: "com.example.Main".to_string(),
                jvm_arguments: "-Xmx512m".to_string(),
                max_heap_size: 512 << 20,
                start_time: 1_700_000_000_000,
            },
            ..Self::default()
        }
    }

    /// Snapshots returned for successive `GetMonitoredNumbers`; the last one repeats.
    pub fn with_telemetry(mut self, samples: Vec<MonitoredNumbers>) -> Self {
        self.telemetry = samples.into();
        self
    }

    pub fn with_method_name(mut self, method_id: MethodId, method: MethodSignature) -> Self {
        self.method_names.insert(method_id, method);
        self
    }

    /// Runs the agent on the far end of `stream`.
    pub fn spawn<S>(self, stream: S) -> FakeAgentHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Arc::new(Session::new(stream));
        let (response_tx, responses) = mpsc::unbounded_channel();
        let received = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn(self.serve(Arc::clone(&session), response_tx, Arc::clone(&received)));
        FakeAgentHandle { session, responses, received, task }
    }

    async fn serve(
        mut self,
        session: Arc<Session>,
        responses: mpsc::UnboundedSender<Response>,
        received: Arc<Mutex<Vec<Command>>>,
    ) {
        loop {
            let command = match session.receive().await {
                Ok(Message::Command(command)) => command,
                Ok(Message::Response(response)) => {
                    let _ = responses.send(response);
                    continue;
                }
                Err(_) => break,
            };
            debug!("Fake agent received {}", command.name());
            received.lock().unwrap().push(command.clone());

            if !command.expects_response() {
                continue;
            }
            let response = self.answer(&command);
            if session.send_response(&response).await.is_err() {
                break;
            }
        }
    }

    fn answer(&mut self, command: &Command) -> Response {
        match command {
            Command::Simple(SimpleCommand::GetMonitoredNumbers) => {
                let numbers = if self.telemetry.len() > 1 {
                    self.telemetry.pop_front()
                } else {
                    self.telemetry.front().cloned()
                };
                Response::MonitoredNumbers(numbers.unwrap_or_else(|| sample_numbers(0, &[], &[])))
            }
            Command::Simple(SimpleCommand::GetVmProperties) => {
                Response::VmProperties(self.vm_properties.clone())
            }
            Command::GetMethodNamesForJMethodIds(request) => Response::MethodNames(MethodNames {
                methods: request
                    .method_ids
                    .iter()
                    .map(|id| {
                        self.method_names.get(id).cloned().unwrap_or_else(|| {
                            MethodSignature::new("unknown.Class", format!("method{id}"), "()V")
                        })
                    })
                    .collect(),
            }),
            Command::GetClassId(_) => Response::ClassId(ClassIdResponse { class_id: None }),
            _ => Response::ok(),
        }
    }
}

impl FakeAgentHandle {
    /// Sends an agent-initiated command and waits for the profiler's answer.
    pub async fn request(&mut self, command: Command) -> Result<Response, SessionError> {
        self.session.send_command(&command).await?;
        self.responses.recv().await.ok_or(SessionError::Closed)
    }

    pub async fn notify(&self, command: Command) -> Result<(), SessionError> {
        self.session.send_command(&command).await
    }

    /// Commands received from the profiler so far.
    pub fn received(&self) -> Vec<Command> {
        self.received.lock().unwrap().clone()
    }

    /// Closes the agent side; the profiler sees end of stream.
    pub async fn disconnect(self) {
        self.session.shutdown().await;
        let _ = self.task.await;
    }
}

/// A profiler-side session connected to a fresh [`FakeAgent`].
pub fn connected_pair(agent: FakeAgent) -> (Session, FakeAgentHandle) {
    let (profiler, agent_end) = tokio::io::duplex(64 * 1024);
    (Session::new(profiler), agent.spawn(agent_end))
}
