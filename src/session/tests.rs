use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use super::*;
use crate::error::{DecodeError, ProfilerError};
use crate::wire::{
    EventBufferDumped, GetMethodNames, MethodNames, SimpleCommand, StatusResponse, VmProperties,
};

fn pair() -> (Session, Session) {
    let _ = tracing_subscriber::fmt::try_init();
    let (profiler, agent) = tokio::io::duplex(256);
    (Session::new(profiler), Session::new(agent))
}

#[tokio::test]
async fn commands_and_responses_cross_in_both_directions() {
    let (profiler, agent) = pair();

    profiler.send_command(&SimpleCommand::CheckConnection.into()).await.unwrap();
    assert_eq!(
        agent.receive().await.unwrap(),
        Message::Command(Command::Simple(SimpleCommand::CheckConnection))
    );

    agent.send_response(&Response::ok()).await.unwrap();
    assert_eq!(profiler.receive().await.unwrap(), Message::Response(Response::ok()));

    // The agent may also initiate.
    let dumped = Command::EventBufferDumped(EventBufferDumped { buffer_size: 4096 });
    agent.send_command(&dumped).await.unwrap();
    assert_eq!(profiler.receive().await.unwrap(), Message::Command(dumped));
}

#[tokio::test]
async fn frames_larger_than_the_pipe_are_reassembled() {
    let (profiler, agent) = pair();
    let request = Command::GetMethodNamesForJMethodIds(GetMethodNames {
        method_ids: (0..2_000).collect(),
    });

    let expected = request.clone();
    let sender = tokio::spawn(async move {
        profiler.send_command(&request).await.unwrap();
        profiler
    });

    assert_eq!(agent.receive().await.unwrap(), Message::Command(expected));
    sender.await.unwrap();
}

#[tokio::test]
async fn close_unblocks_a_pending_receive() {
    let (profiler, _agent) = pair();
    let profiler = Arc::new(profiler);

    let waiting = {
        let profiler = Arc::clone(&profiler);
        tokio::spawn(async move { profiler.receive().await })
    };
    tokio::task::yield_now().await;

    profiler.close();
    let result = tokio::time::timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
    assert!(matches!(result, Err(SessionError::Closed)));
    assert!(profiler.is_closed());
    assert!(matches!(
        profiler.send_command(&SimpleCommand::RunGc.into()).await,
        Err(SessionError::Closed)
    ));
}

#[tokio::test]
async fn decode_failure_is_reported_once_then_closed() {
    let _ = tracing_subscriber::fmt::try_init();
    let (profiler, mut raw_agent) = tokio::io::duplex(64);
    let profiler = Session::new(profiler);

    raw_agent.write_all(&[9, 0, 0, 0, 1]).await.unwrap();

    let first = profiler.receive().await;
    assert!(matches!(
        first,
        Err(SessionError::Decode(DecodeError::UnknownKind { family: 9, kind: 1 }))
    ));
    assert!(matches!(profiler.receive().await, Err(SessionError::Closed)));
    assert!(matches!(
        profiler.send_response(&Response::ok()).await,
        Err(SessionError::Closed)
    ));
}

#[tokio::test]
async fn stream_ending_inside_a_frame_is_truncated() {
    let _ = tracing_subscriber::fmt::try_init();
    let (profiler, mut raw_agent) = tokio::io::duplex(64);
    let profiler = Session::new(profiler);

    raw_agent.write_all(&[1, 0, 0]).await.unwrap();
    drop(raw_agent);

    assert!(matches!(
        profiler.receive().await,
        Err(SessionError::Decode(DecodeError::Truncated { .. }))
    ));
    assert!(profiler.is_closed());
}

#[tokio::test]
async fn stream_ending_between_frames_is_a_clean_close() {
    let (profiler, agent) = pair();
    agent.send_command(&SimpleCommand::ShutdownCompleted.into()).await.unwrap();
    agent.shutdown().await;

    assert!(profiler.receive().await.is_ok());
    assert!(matches!(profiler.receive().await, Err(SessionError::Closed)));
}

/// Answers every request from the profiler until the stream closes.
async fn answer_requests(agent: Session) {
    while let Ok(message) = agent.receive().await {
        let Message::Command(command) = message else { continue };
        let response = match command {
            Command::Simple(SimpleCommand::GetVmProperties) => Response::VmProperties(VmProperties {
                java_version: "21".to_string(),
                ..VmProperties::default()
            }),
            Command::GetMethodNamesForJMethodIds(request) => Response::MethodNames(MethodNames {
                methods: request
                    .method_ids
                    .iter()
                    .map(|id| crate::types::MethodSignature::new("a.B", format!("m{id}"), "()V"))
                    .collect(),
            }),
            Command::Simple(SimpleCommand::SuspendTargetApp) => {
                Response::Status(StatusResponse::error("cannot suspend"))
            }
            command if command.expects_response() => Response::ok(),
            _ => continue,
        };
        if agent.send_response(&response).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn concurrent_requests_receive_their_own_responses() {
    let (profiler, agent) = pair();
    tokio::spawn(answer_requests(agent));
    let (connection, _incoming) = Connection::spawn(profiler, Duration::from_secs(5));

    let (props, names, ok) = tokio::join!(
        connection.request(SimpleCommand::GetVmProperties.into()),
        connection.request(Command::GetMethodNamesForJMethodIds(GetMethodNames {
            method_ids: vec![7, 8],
        })),
        connection.request(SimpleCommand::CheckConnection.into()),
    );

    assert!(matches!(props.unwrap(), Response::VmProperties(p) if p.java_version == "21"));
    match names.unwrap() {
        Response::MethodNames(names) => {
            assert_eq!(names.methods.len(), 2);
            assert_eq!(names.methods[1].method_name, "m8");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(ok.unwrap().is_ok());
}

#[tokio::test]
async fn refused_requests_surface_the_agent_message() {
    let (profiler, agent) = pair();
    tokio::spawn(answer_requests(agent));
    let (connection, _incoming) = Connection::spawn(profiler, Duration::from_secs(5));

    let err = connection.request_ok(SimpleCommand::SuspendTargetApp.into()).await.unwrap_err();
    assert!(matches!(err, ProfilerError::Agent { ref message } if message == "cannot suspend"));
    assert!(!err.is_session_ending());
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn agent_commands_are_forwarded_while_requests_wait() {
    let (profiler, agent) = pair();
    let (connection, mut incoming) = Connection::spawn(profiler, Duration::from_secs(5));

    let agent_task = tokio::spawn(async move {
        let request = agent.receive().await.unwrap();
        assert_eq!(request, Message::Command(SimpleCommand::CheckConnection.into()));
        // A notification slips in before the answer.
        agent.send_command(&SimpleCommand::StillAlive.into()).await.unwrap();
        agent.send_response(&Response::ok()).await.unwrap();
        agent
    });

    let response = connection.request(SimpleCommand::CheckConnection.into()).await.unwrap();
    assert!(response.is_ok());
    assert_eq!(incoming.recv().await, Some(Command::Simple(SimpleCommand::StillAlive)));
    agent_task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn request_timeout_closes_the_connection() {
    let (profiler, _silent_agent) = pair();
    let (connection, _incoming) = Connection::spawn(profiler, Duration::from_millis(250));

    let err = connection.request(SimpleCommand::CheckConnection.into()).await.unwrap_err();
    assert!(matches!(err, ProfilerError::Timeout { .. }));
    assert!(err.is_session_ending());
    assert!(connection.is_closed());

    let err = connection.request(SimpleCommand::CheckConnection.into()).await.unwrap_err();
    assert!(matches!(err, ProfilerError::Session(SessionError::Closed)));
}

#[tokio::test]
async fn lost_connection_fails_the_outstanding_request() {
    let (profiler, agent) = pair();
    let (connection, _incoming) = Connection::spawn(profiler, Duration::from_secs(5));

    tokio::spawn(async move {
        let _ = agent.receive().await;
        agent.shutdown().await;
    });

    let err = connection.request(SimpleCommand::GetMonitoredNumbers.into()).await.unwrap_err();
    assert!(matches!(err, ProfilerError::Session(SessionError::Closed)));
    connection.closed().await;
}

#[tokio::test(start_paused = true)]
async fn abandoned_request_does_not_take_the_next_response() {
    let (profiler, agent) = pair();
    let (connection, _incoming) = Connection::spawn(profiler, Duration::from_secs(2));
    let connection = Arc::new(connection);

    // Larger than the pipe, so it holds the writer until the agent reads.
    let names = Response::MethodNames(MethodNames {
        methods: (0..300)
            .map(|i| crate::types::MethodSignature::new("com.example.Large", format!("method{i}"), "()V"))
            .collect(),
    });
    let responder = {
        let connection = Arc::clone(&connection);
        let names = names.clone();
        tokio::spawn(async move { connection.respond(names).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    // Gives up while still waiting for the writer.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        connection.request(SimpleCommand::CheckConnection.into()),
    )
    .await;
    assert!(abandoned.is_err());

    let agent_task = tokio::spawn(async move {
        assert_eq!(agent.receive().await.unwrap(), Message::Response(names));
        let next = agent.receive().await.unwrap();
        agent.send_response(&Response::ok()).await.unwrap();
        (agent, next)
    });

    let response = connection.request(SimpleCommand::RunGc.into()).await.unwrap();
    assert!(response.is_ok());
    assert!(!connection.is_closed());

    responder.await.unwrap().unwrap();
    let (_agent, next) = agent_task.await.unwrap();
    assert_eq!(next, Message::Command(SimpleCommand::RunGc.into()));
}
