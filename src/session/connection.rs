//! Request/response pairing over a [`Session`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Session;
use crate::error::{ProfilerError, SessionError};
use crate::wire::{Command, Message, Response};

/// Default time to wait for the answer to a request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<VecDeque<oneshot::Sender<Response>>>>;

/// Dispatches one session's traffic.
///
/// A background task reads every incoming message. Responses complete the oldest
/// pending request; commands sent by the agent are forwarded to the receiver returned
/// by [`Connection::spawn`]. Requests are serialized, so at most one is outstanding and
/// responses pair up in FIFO order.
pub struct Connection {
    session: Arc<Session>,
    pending: Pending,
    request_lock: tokio::sync::Mutex<()>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Starts the reader task. Must be called inside a tokio runtime.
    pub fn spawn(
        session: Session,
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let session = Arc::new(session);
        let pending: Pending = Arc::default();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let reader =
            tokio::spawn(Self::reader_task(Arc::clone(&session), Arc::clone(&pending), incoming_tx));

        let connection = Self {
            session,
            pending,
            request_lock: tokio::sync::Mutex::new(()),
            request_timeout,
            reader,
        };
        (connection, incoming_rx)
    }

    async fn reader_task(
        session: Arc<Session>,
        pending: Pending,
        incoming: mpsc::UnboundedSender<Command>,
    ) {
        info!("Connection reader started");
        let mut messages = 0u64;

        loop {
            match session.receive().await {
                Ok(Message::Response(response)) => {
                    messages += 1;
                    let waiter = pending.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                    match waiter {
                        Some(waiter) => {
                            // The requester may have timed out and gone away.
                            let _ = waiter.send(response);
                        }
                        None => {
                            error!("Unsolicited {} response, closing connection", response.name());
                            session.close();
                            break;
                        }
                    }
                }
                Ok(Message::Command(command)) => {
                    messages += 1;
                    debug!("Agent sent {}", command.name());
                    if incoming.send(command).is_err() {
                        debug!("No receiver for agent commands, dropping");
                    }
                }
                Err(SessionError::Closed) => {
                    info!("Connection closed after {} messages", messages);
                    break;
                }
                Err(e) => {
                    error!("Connection lost after {} messages: {}", messages, e);
                    break;
                }
            }
        }

        // Dropping the senders fails every outstanding request with `Closed`.
        pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Sends a command and waits for its response.
    ///
    /// A notification is sent without waiting and answers with a synthetic OK status. If
    /// the response does not arrive within the request timeout the connection is closed,
    /// because later responses could no longer be paired with their requests.
    pub async fn request(&self, command: Command) -> Result<Response, ProfilerError> {
        if !command.expects_response() {
            self.notify(command).await?;
            return Ok(Response::ok());
        }

        let _serial = self.request_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        // Registered between buffering and flushing the frame: the answer cannot overtake
        // the registration, and a request dropped before buffering leaves no waiter behind.
        let pending = &self.pending;
        self.session
            .send_command_then(&command, move || {
                pending.lock().unwrap_or_else(PoisonError::into_inner).push_back(tx);
            })
            .await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => {
                debug!("{} answered with {}", command.name(), response.name());
                Ok(response)
            }
            Ok(Err(_)) => Err(SessionError::Closed.into()),
            Err(_) => {
                warn!(
                    "{} not answered within {:?}, closing connection",
                    command.name(),
                    self.request_timeout
                );
                self.session.close();
                Err(ProfilerError::Timeout { duration: self.request_timeout })
            }
        }
    }

    /// Sends a request and fails unless the agent answers with an OK status.
    pub async fn request_ok(&self, command: Command) -> Result<(), ProfilerError> {
        match self.request(command).await? {
            Response::Status(status) if status.ok => Ok(()),
            Response::Status(status) => Err(ProfilerError::Agent {
                message: status.error_message.unwrap_or_else(|| "request refused".to_string()),
            }),
            other => Err(ProfilerError::unexpected_response("Status", other.name())),
        }
    }

    pub async fn notify(&self, command: Command) -> Result<(), ProfilerError> {
        Ok(self.session.send_command(&command).await?)
    }

    /// Answers a command the agent sent.
    pub async fn respond(&self, response: Response) -> Result<(), ProfilerError> {
        Ok(self.session.send_response(&response).await?)
    }

    pub fn close(&self) {
        self.session.close();
    }

    /// Closes the connection and signals end of stream to the agent.
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Resolves once the connection is closed for any reason.
    pub async fn closed(&self) {
        self.session.closed().await
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.session.close();
        self.reader.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}
