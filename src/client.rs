//! Profiler-side client for one agent connection

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cct::{CallTree, MarkTimeCollector};
use crate::config::ProfilerConfig;
use crate::driver::TelemetryMonitor;
use crate::error::ProfilerError;
use crate::instrumentation::{InstrumentationCoordinator, Instrumentor, MethodRegistry};
use crate::marking::MarkingEngine;
use crate::providers::AgentSource;
use crate::session::{Connection, Session};
use crate::telemetry::TelemetryStore;
use crate::types::{MarkMapping, RootSelector};
use crate::wire::{
    ChangeableInstrParams, ClassIdResponse, Command, GetMethodNames, InitiateProfiling,
    MethodId, Response, SimpleCommand, StatusResponse, VmProperties,
};
use crate::Result;

const EVENT_CAPACITY: usize = 256;

/// Things that happened on the connection, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfilerEvent {
    /// The first class-load batch was answered
    RootClassesInstrumented { classes: usize, methods: usize },
    /// A class loaded later was instrumented
    ClassInstrumented { class_name: String, methods: usize },
    /// One class could not be instrumented; profiling continues without it
    InstrumentationWarning { class_name: String, message: String },
    MethodInvokedFirstTime { method_id: MethodId },
    EventBufferDumped { buffer_size: i32 },
    ResultsAvailable,
    /// The target VM is shutting down
    AgentShutdown,
    ConnectionClosed,
}

/// State the dispatch task shares with the client.
struct Shared {
    connection: Arc<Connection>,
    coordinator: Mutex<InstrumentationCoordinator>,
    engine: Arc<MarkingEngine>,
    root_selectors: Vec<RootSelector>,
    events: broadcast::Sender<ProfilerEvent>,
}

/// Drives one profiling session against a connected agent.
///
/// Commands sent by the agent (class loads, class id lookups, buffer dumps) are answered
/// on a background task. Requests to the agent go through the methods here.
pub struct ProfilerClient {
    shared: Arc<Shared>,
    registry: Arc<MethodRegistry>,
    store: Arc<TelemetryStore>,
    config: ProfilerConfig,
    dispatch: JoinHandle<()>,
}

impl ProfilerClient {
    /// Starts the dispatcher over `session`. Must be called inside a tokio runtime.
    pub fn new(session: Session, instrumentor: Arc<dyn Instrumentor>, config: ProfilerConfig) -> Self {
        let registry = Arc::new(MethodRegistry::new());
        let engine = Arc::new(MarkingEngine::new(registry.clone()));
        let (mappings, labels) = config.mark_configuration();
        engine.set_labels(labels);
        engine.configure(mappings);

        let coordinator = InstrumentationCoordinator::new(instrumentor, Arc::clone(&registry))
            .with_instrumentation_type(config.instrumentation.mode);
        let (connection, incoming) = Connection::spawn(session, config.agent.request_timeout());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            connection: Arc::new(connection),
            coordinator: Mutex::new(coordinator),
            engine,
            root_selectors: config.instrumentation.root_selectors.clone(),
            events,
        });
        let dispatch = tokio::spawn(Self::dispatch_task(Arc::clone(&shared), incoming));

        info!(
            "Profiler client started ({:?}, {} root selectors, {} mark categories)",
            config.instrumentation.mode,
            config.instrumentation.root_selectors.len(),
            config.marks.len()
        );
        Self {
            shared,
            registry,
            store: Arc::new(TelemetryStore::with_chunk_size(config.telemetry.chunk_size)),
            config,
            dispatch,
        }
    }

    async fn dispatch_task(shared: Arc<Shared>, mut incoming: mpsc::UnboundedReceiver<Command>) {
        info!("Command dispatch started");
        while let Some(command) = incoming.recv().await {
            let expects_response = command.expects_response();
            let response = match command {
                // The instrumentor may take a while and locks the coordinator.
                command @ (Command::RootClassLoaded(_) | Command::ClassLoaded(_)) => {
                    let shared = Arc::clone(&shared);
                    match tokio::task::spawn_blocking(move || shared.handle(command)).await {
                        Ok(response) => response,
                        Err(e) => {
                            warn!("Instrumentation task failed: {}", e);
                            Response::Status(StatusResponse::error("instrumentation failed"))
                        }
                    }
                }
                command => shared.handle(command),
            };
            if !expects_response {
                continue;
            }
            if let Err(e) = shared.connection.respond(response).await {
                warn!("Failed to answer agent: {}", e);
                if e.is_session_ending() {
                    break;
                }
            }
        }
        let _ = shared.events.send(ProfilerEvent::ConnectionClosed);
        info!("Command dispatch ended");
    }

    /// Receiver for connection events. Slow receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProfilerEvent> {
        self.shared.events.subscribe()
    }

    /// Selectors sent with the root batch: the configured ones plus those covering
    /// every mark mapping.
    pub fn effective_root_selectors(&self) -> Vec<RootSelector> {
        self.shared.effective_root_selectors()
    }

    /// Asks the agent to start profiling the configured roots.
    pub async fn initiate_profiling(&self) -> Result<()> {
        let selectors = self.effective_root_selectors();
        if selectors.is_empty() && self.config.instrumentation.mode.instruments_methods() {
            return Err(ProfilerError::config_error("no root selectors configured"));
        }
        let mut root_class_names: Vec<String> = Vec::with_capacity(selectors.len());
        for selector in &selectors {
            if !root_class_names.contains(&selector.class_name) {
                root_class_names.push(selector.class_name.clone());
            }
        }
        info!("Initiating profiling of {} root classes", root_class_names.len());
        self.shared
            .connection
            .request_ok(Command::InitiateProfiling(InitiateProfiling {
                instr_type: self.config.instrumentation.mode,
                root_class_names,
                instrument_spawned_threads: self.config.instrumentation.instrument_spawned_threads,
            }))
            .await
    }

    pub async fn check_connection(&self) -> Result<()> {
        self.shared.connection.request_ok(SimpleCommand::CheckConnection.into()).await
    }

    pub async fn vm_properties(&self) -> Result<VmProperties> {
        match self.shared.connection.request(SimpleCommand::GetVmProperties.into()).await? {
            Response::VmProperties(properties) => Ok(properties),
            other => Err(ProfilerError::unexpected_response("VmProperties", other.name())),
        }
    }

    pub async fn run_gc(&self) -> Result<()> {
        self.shared.connection.request_ok(SimpleCommand::RunGc.into()).await
    }

    pub async fn suspend_target(&self) -> Result<()> {
        self.shared.connection.request_ok(SimpleCommand::SuspendTargetApp.into()).await
    }

    pub async fn resume_target(&self) -> Result<()> {
        self.shared.connection.request_ok(SimpleCommand::ResumeTargetApp.into()).await
    }

    /// Clears collected results on both sides.
    pub async fn reset_collectors(&self) -> Result<()> {
        self.shared.connection.request_ok(SimpleCommand::ResetProfilerCollectors.into()).await?;
        self.store.reset();
        Ok(())
    }

    pub async fn set_changeable_params(&self, params: ChangeableInstrParams) -> Result<()> {
        self.shared.connection.request_ok(Command::SetChangeableInstrParams(params)).await
    }

    /// Fetches names for the method ids the registry does not know yet.
    ///
    /// Returns how many names were added.
    pub async fn resolve_method_names(&self, method_ids: &[MethodId]) -> Result<usize> {
        let unresolved = self.registry.unresolved(method_ids);
        if unresolved.is_empty() {
            return Ok(0);
        }
        debug!("Resolving {} method names", unresolved.len());

        let response = self
            .shared
            .connection
            .request(Command::GetMethodNamesForJMethodIds(GetMethodNames {
                method_ids: unresolved.clone(),
            }))
            .await?;
        let names = match response {
            Response::MethodNames(names) => names,
            other => return Err(ProfilerError::unexpected_response("MethodNames", other.name())),
        };
        if names.methods.len() != unresolved.len() {
            return Err(ProfilerError::unexpected_response(
                "MethodNames",
                format!("{} names for {} ids", names.methods.len(), unresolved.len()),
            ));
        }
        for (method_id, method) in unresolved.iter().zip(names.methods) {
            self.registry.insert(*method_id, method);
        }
        Ok(unresolved.len())
    }

    /// Time per mark label for a sampled call tree, largest first.
    pub async fn mark_times(&self, tree: &CallTree) -> Result<Vec<(String, u64)>> {
        self.resolve_method_names(&tree.method_ids()).await?;
        let mut collector = MarkTimeCollector::new(Arc::clone(&self.shared.engine));
        tree.walk(&mut collector);
        Ok(collector.report())
    }

    /// Replaces the mark mappings. Returns `false` if they were unchanged.
    pub fn configure_marks(&self, mappings: Vec<MarkMapping>) -> bool {
        self.shared.engine.configure(mappings)
    }

    /// Puts back the original bytes of every instrumented class.
    pub async fn clear_all_instrumentation(&self) -> Result<()> {
        let command = self
            .shared
            .coordinator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear_all_instrumentation_command();
        self.shared.connection.request_ok(command).await
    }

    /// Starts polling telemetry into this client's store.
    ///
    /// Polling stops when the returned monitor is dropped or the connection closes.
    pub fn start_telemetry(&self) -> TelemetryMonitor {
        let source =
            AgentSource::new(Arc::clone(&self.shared.connection), self.config.telemetry.poll_interval());
        TelemetryMonitor::start(source, Arc::clone(&self.store))
    }

    /// Detaches from the target VM, leaving it running.
    pub async fn detach(&self) -> Result<()> {
        self.shared.connection.request_ok(SimpleCommand::Detach.into()).await?;
        info!("Detached from agent");
        self.shared.connection.shutdown().await;
        Ok(())
    }

    pub async fn terminate_target(&self) -> Result<()> {
        self.shared.connection.request_ok(SimpleCommand::TerminateTargetJvm.into()).await?;
        self.shared.connection.shutdown().await;
        Ok(())
    }

    pub fn close(&self) {
        self.shared.connection.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.connection.is_closed()
    }

    pub fn engine(&self) -> &Arc<MarkingEngine> {
        &self.shared.engine
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn instrumented_class_count(&self) -> usize {
        self.shared.coordinator.lock().unwrap_or_else(PoisonError::into_inner).instrumented_class_count()
    }
}

impl Drop for ProfilerClient {
    fn drop(&mut self) {
        debug!("Dropping profiler client");
        self.shared.connection.close();
        self.dispatch.abort();
    }
}

impl Shared {
    fn effective_root_selectors(&self) -> Vec<RootSelector> {
        let mut selectors = self.root_selectors.clone();
        for selector in self.engine.marker_selectors() {
            if !selectors.contains(&selector) {
                selectors.push(selector);
            }
        }
        selectors
    }

    fn emit(&self, event: ProfilerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Builds the answer to one agent command.
    fn handle(&self, command: Command) -> Response {
        match command {
            Command::RootClassLoaded(loaded) => {
                let selectors = self.effective_root_selectors();
                let result = self
                    .coordinator
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .build_initial_response(&selectors, &loaded.classes);
                for error in result.errors() {
                    self.emit(ProfilerEvent::InstrumentationWarning {
                        class_name: error.class_name.clone(),
                        message: error.message.clone(),
                    });
                }
                self.emit(ProfilerEvent::RootClassesInstrumented {
                    classes: result.replaced_count(),
                    methods: result.instrumented_methods().count(),
                });
                Response::InstrumentMethodGroup(result)
            }
            Command::ClassLoaded(loaded) => {
                let result = self
                    .coordinator
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .build_follow_up_response(&loaded.class);
                for error in result.errors() {
                    self.emit(ProfilerEvent::InstrumentationWarning {
                        class_name: error.class_name.clone(),
                        message: error.message.clone(),
                    });
                }
                if result.replaced_count() > 0 {
                    self.emit(ProfilerEvent::ClassInstrumented {
                        class_name: loaded.class.name.clone(),
                        methods: result.instrumented_methods().count(),
                    });
                }
                Response::InstrumentMethodGroup(result)
            }
            Command::GetClassId(request) => {
                let class_id = self
                    .coordinator
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .class_id(&request.class_name, request.loader_id);
                trace!("Class id {} for {}", class_id, request.class_name);
                Response::ClassId(ClassIdResponse { class_id: Some(class_id) })
            }
            Command::MethodInvokedFirstTime(invoked) => {
                self.emit(ProfilerEvent::MethodInvokedFirstTime { method_id: invoked.method_id });
                Response::ok()
            }
            Command::EventBufferDumped(dumped) => {
                debug!("Agent dumped {} bytes of events", dumped.buffer_size);
                self.emit(ProfilerEvent::EventBufferDumped { buffer_size: dumped.buffer_size });
                Response::ok()
            }
            Command::Simple(SimpleCommand::ResultsAvailable) => {
                self.emit(ProfilerEvent::ResultsAvailable);
                Response::ok()
            }
            Command::Simple(SimpleCommand::ShutdownInitiated) => {
                info!("Target VM is shutting down");
                self.emit(ProfilerEvent::AgentShutdown);
                Response::ok()
            }
            Command::Simple(SimpleCommand::StillAlive) => {
                trace!("Agent still alive");
                Response::ok()
            }
            other => {
                debug!("Agent sent {}, acknowledging", other.name());
                Response::ok()
            }
        }
    }
}
