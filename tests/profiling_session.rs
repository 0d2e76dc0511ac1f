//! Profiling Session Tests
//!
//! Drives a `ProfilerClient` against a scripted agent over an in-memory duplex stream,
//! from the root class batch to restoring the original classes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jfluid::cct::CallTree;
use jfluid::types::{InstrumentationType, LoadedClass, MethodSignature};
use jfluid::wire::{
    ClassLoaded, Command, GENERAL_NUMBERS_SIZE, Message, MethodInvokedFirstTime, MonitoredNumbers,
    Response, RootClassLoaded, SimpleCommand, general_index,
};
use jfluid::{
    GcInterval, InstrumentError, Instrumentor, ProfilerClient, ProfilerConfig, ProfilerError,
    ProfilerEvent, RootSelector, Session,
};
use tokio::sync::{broadcast, mpsc};

const CONFIG: &str = r#"
instrumentation:
  mode: recursive_full
  root_selectors:
    - class: "com.shop.**"
marks:
  - name: Persistence
    selectors: ["org.orm.Session."]
  - name: Web
    selectors: ["com.shop.web."]
telemetry:
  poll_interval_ms: 10
"#;

/// Appends a trailer so rewritten classes are recognisable.
struct TrailerInstrumentor;

const TRAILER: &[u8] = b"+profiled";

impl Instrumentor for TrailerInstrumentor {
    fn instrument(
        &self,
        _class_name: &str,
        class_bytes: &[u8],
        _selectors: &[RootSelector],
    ) -> Result<Option<Vec<u8>>, InstrumentError> {
        Ok(Some([class_bytes, TRAILER].concat()))
    }
}

/// Smallest class file the profiler accepts: a pool of names and methods without attributes.
fn class_file(name: &str, methods: &[(&str, &str)]) -> Vec<u8> {
    let mut pool: Vec<u8> = Vec::new();
    let mut slots = 0u16;
    let mut utf8 = |pool: &mut Vec<u8>, text: &str| {
        pool.push(1);
        pool.extend_from_slice(&(text.len() as u16).to_be_bytes());
        pool.extend_from_slice(text.as_bytes());
        slots += 1;
        slots
    };

    let this_name = utf8(&mut pool, name.replace('.', "/").as_str());
    let super_name = utf8(&mut pool, "java/lang/Object");
    let method_refs: Vec<(u16, u16)> =
        methods.iter().map(|&(m, d)| (utf8(&mut pool, m), utf8(&mut pool, d))).collect();
    for name_index in [this_name, super_name] {
        pool.push(7);
        pool.extend_from_slice(&name_index.to_be_bytes());
    }
    let this_class = slots + 1;
    let super_class = slots + 2;
    let count = slots + 3;

    let mut out = Vec::new();
    out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 52]);
    out.extend_from_slice(&count.to_be_bytes());
    out.extend_from_slice(&pool);
    out.extend_from_slice(&0x0021u16.to_be_bytes());
    out.extend_from_slice(&this_class.to_be_bytes());
    out.extend_from_slice(&super_class.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]); // interfaces, fields
    out.extend_from_slice(&(methods.len() as u16).to_be_bytes());
    for (name, descriptor) in method_refs {
        out.extend_from_slice(&0x0001u16.to_be_bytes());
        out.extend_from_slice(&name.to_be_bytes());
        out.extend_from_slice(&descriptor.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
    }
    out.extend_from_slice(&[0, 0]);
    out
}

fn loaded(name: &str, methods: &[(&str, &str)]) -> LoadedClass {
    LoadedClass::new(name, 7, -1, class_file(name, methods))
}

fn snapshot(timestamp: i64, gc_starts: &[i64], gc_finishes: &[i64]) -> MonitoredNumbers {
    let mut general = vec![0; GENERAL_NUMBERS_SIZE];
    general[general_index::TIMESTAMP] = timestamp;
    general[general_index::TOTAL_MEMORY] = 512 << 20;
    general[general_index::FREE_MEMORY] = 128 << 20;
    MonitoredNumbers {
        general_numbers: general,
        gc_starts: gc_starts.to_vec(),
        gc_finishes: gc_finishes.to_vec(),
    }
}

/// Agent end of the connection: answers profiler requests, forwards everything else.
struct ScriptedAgent {
    session: Arc<Session>,
    commands: mpsc::UnboundedReceiver<Command>,
    responses: mpsc::UnboundedReceiver<Response>,
}

impl ScriptedAgent {
    fn spawn(stream: tokio::io::DuplexStream, telemetry: Vec<MonitoredNumbers>) -> Self {
        let session = Arc::new(Session::new(stream));
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (response_tx, responses) = mpsc::unbounded_channel();
        let telemetry = Arc::new(Mutex::new(VecDeque::from(telemetry)));

        let reader = Arc::clone(&session);
        tokio::spawn(async move {
            while let Ok(message) = reader.receive().await {
                let command = match message {
                    Message::Response(response) => {
                        let _ = response_tx.send(response);
                        continue;
                    }
                    Message::Command(command) => command,
                };
                let answer = match &command {
                    Command::Simple(SimpleCommand::GetMonitoredNumbers) => {
                        let mut queue = telemetry.lock().unwrap();
                        let next = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
                        Response::MonitoredNumbers(next.unwrap_or_else(|| snapshot(0, &[], &[])))
                    }
                    Command::Simple(SimpleCommand::RunGc) => Response::error("explicit GC is disabled"),
                    _ => Response::ok(),
                };
                let expects_response = command.expects_response();
                let _ = command_tx.send(command);
                if expects_response && reader.send_response(&answer).await.is_err() {
                    break;
                }
            }
        });

        Self { session, commands, responses }
    }

    async fn request(&mut self, command: Command) -> Response {
        self.session.send_command(&command).await.unwrap();
        self.responses.recv().await.unwrap()
    }

    async fn next_command(&mut self) -> Command {
        self.commands.recv().await.unwrap()
    }
}

fn start() -> (ProfilerClient, ScriptedAgent) {
    start_with_telemetry(Vec::new())
}

fn start_with_telemetry(telemetry: Vec<MonitoredNumbers>) -> (ProfilerClient, ScriptedAgent) {
    let _ = tracing_subscriber::fmt::try_init();
    let (profiler_end, agent_end) = tokio::io::duplex(64 * 1024);
    let agent = ScriptedAgent::spawn(agent_end, telemetry);
    let config = ProfilerConfig::from_yaml(CONFIG).unwrap();
    let client = ProfilerClient::new(Session::new(profiler_end), Arc::new(TrailerInstrumentor), config);
    (client, agent)
}

async fn next_event(events: &mut broadcast::Receiver<ProfilerEvent>) -> ProfilerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn full_session_instruments_attributes_and_restores() {
    let (client, mut agent) = start();
    let mut events = client.subscribe();

    client.initiate_profiling().await.unwrap();
    let Command::InitiateProfiling(initiate) = agent.next_command().await else {
        panic!("expected InitiateProfiling first");
    };
    assert_eq!(initiate.instr_type, InstrumentationType::RecursiveFull);
    assert_eq!(initiate.root_class_names[0], "com.shop.**");
    // Mark categories outside the configured roots still get instrumented.
    assert!(initiate.root_class_names.contains(&"org.orm.Session".to_string()));

    let originals = vec![
        loaded("com.shop.Checkout", &[("run", "()V"), ("total", "()J")]),
        loaded("org.orm.Session", &[("find", "(J)Ljava/lang/Object;")]),
        loaded("org.other.Library", &[("call", "()V")]),
        loaded("com.shop.web.Api", &[("handle", "()V")]),
    ];
    let response = agent.request(Command::RootClassLoaded(RootClassLoaded { classes: originals.clone() })).await;
    let Response::InstrumentMethodGroup(result) = response else {
        panic!("unexpected answer to the root batch: {response:?}");
    };
    let names: Vec<&str> = originals.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(result.class_names(), names.as_slice());
    assert_eq!(result.replaced_count(), 3);
    assert!(result.replacement_bytes()[2].is_none());
    assert!(result.replacement_bytes()[0].as_ref().unwrap().ends_with(TRAILER));
    assert_eq!(
        next_event(&mut events).await,
        ProfilerEvent::RootClassesInstrumented { classes: 3, methods: 4 }
    );

    let id = |class: &str, method: &str, sig: &str| {
        client.registry().id_of(&MethodSignature::new(class, method, sig)).unwrap()
    };
    let run = id("com.shop.Checkout", "run", "()V");
    let find = id("org.orm.Session", "find", "(J)Ljava/lang/Object;");
    let handle = id("com.shop.web.Api", "handle", "()V");

    let response =
        agent.request(Command::MethodInvokedFirstTime(MethodInvokedFirstTime { method_id: run })).await;
    assert!(response.is_ok());
    assert_eq!(next_event(&mut events).await, ProfilerEvent::MethodInvokedFirstTime { method_id: run });

    let mut tree = CallTree::new();
    tree.add_stack(&[run, find], 30);
    tree.add_stack(&[run], 10);
    tree.add_stack(&[handle, find], 5);
    tree.add_stack(&[handle], 7);
    assert_eq!(
        client.mark_times(&tree).await.unwrap(),
        vec![
            ("Persistence".to_string(), 35),
            ("Uncategorized".to_string(), 10),
            ("Web".to_string(), 7),
        ]
    );

    let late = loaded("com.shop.Late", &[("go", "()V")]);
    let response = agent.request(Command::ClassLoaded(ClassLoaded { class: late.clone() })).await;
    assert!(matches!(response, Response::InstrumentMethodGroup(ref r) if r.replaced_count() == 1));
    assert_eq!(
        next_event(&mut events).await,
        ProfilerEvent::ClassInstrumented { class_name: "com.shop.Late".to_string(), methods: 1 }
    );
    assert_eq!(client.instrumented_class_count(), 4);

    client.clear_all_instrumentation().await.unwrap();
    let Command::InstrumentMethodGroup(restore) = agent.next_command().await else {
        panic!("expected the restoring InstrumentMethodGroup");
    };
    assert_eq!(restore.instr_type, InstrumentationType::None);
    assert_eq!(restore.classes.len(), 4);
    for class in &restore.classes {
        let original = originals.iter().chain([&late]).find(|c| c.name == class.class_name).unwrap();
        assert_eq!(class.bytes, original.bytes);
    }
    assert_eq!(client.instrumented_class_count(), 0);

    client.detach().await.unwrap();
    assert!(matches!(agent.next_command().await, Command::Simple(SimpleCommand::Detach)));
    assert!(client.is_closed());
    loop {
        if next_event(&mut events).await == ProfilerEvent::ConnectionClosed {
            break;
        }
    }
}

#[tokio::test]
async fn refused_requests_surface_the_agent_message() {
    let (client, _agent) = start();

    client.check_connection().await.unwrap();
    match client.run_gc().await {
        Err(ProfilerError::Agent { message }) => assert_eq!(message, "explicit GC is disabled"),
        other => panic!("expected an agent error, got {other:?}"),
    }
    // A refusal leaves the connection usable.
    assert!(!client.is_closed());
    client.check_connection().await.unwrap();
}

#[tokio::test]
async fn agent_shutdown_ends_the_session() {
    let (client, agent) = start();
    let mut events = client.subscribe();

    agent.session.send_command(&SimpleCommand::ShutdownInitiated.into()).await.unwrap();
    assert_eq!(next_event(&mut events).await, ProfilerEvent::AgentShutdown);

    agent.session.shutdown().await;
    assert_eq!(next_event(&mut events).await, ProfilerEvent::ConnectionClosed);

    let err = client.check_connection().await.unwrap_err();
    assert!(err.is_session_ending(), "{err:?}");
}

#[tokio::test]
async fn telemetry_history_pairs_collections_across_polls() {
    let (client, _agent) = start_with_telemetry(vec![
        snapshot(1_000, &[], &[]),
        snapshot(2_000, &[1_900], &[]),
        snapshot(3_000, &[], &[2_050]),
        snapshot(4_000, &[3_100], &[3_120]),
    ]);

    let monitor = client.start_telemetry();
    assert!(tokio::time::timeout(Duration::from_secs(5), monitor.wait_for(4)).await.unwrap());
    monitor.stop();

    let store = client.store();
    assert_eq!(&store.timestamps()[..4], &[1_000, 2_000, 3_000, 4_000]);
    assert_eq!(store.get(0).unwrap().used_memory(), 384 << 20);
    assert_eq!(
        &store.gc_intervals()[..2],
        &[GcInterval { start: 1_900, finish: 2_050 }, GcInterval { start: 3_100, finish: 3_120 }]
    );

    client.reset_collectors().await.unwrap();
    assert!(client.store().is_empty());
}
