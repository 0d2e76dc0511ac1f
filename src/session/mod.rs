//! Transport session over one bidirectional byte stream.
//!
//! A [`Session`] owns the stream and speaks the [`wire`](crate::wire) protocol on it. The
//! read and write halves sit behind separate locks, so a task blocked in
//! [`Session::receive`] never delays a send. [`Connection`] adds request/response pairing
//! on top of a session.

mod connection;

#[cfg(test)]
mod tests;

pub use connection::{Connection, DEFAULT_REQUEST_TIMEOUT};

use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{Encoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::{CodecError, SessionError};
use crate::wire::{Command, Message, Response, WireCodec};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One protocol connection. Never reusable once closed.
pub struct Session {
    reader: Mutex<FramedRead<BoxedReader, WireCodec>>,
    writer: Mutex<FramedWrite<BoxedWriter, WireCodec>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Session {
    /// Wraps any bidirectional stream, e.g. a `TcpStream` or one end of `tokio::io::duplex`.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_parts(read_half, write_half)
    }

    /// Builds a session from already separated halves.
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self {
            reader: Mutex::new(FramedRead::new(reader, WireCodec::new())),
            writer: Mutex::new(FramedWrite::new(writer, WireCodec::new())),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn send_command(&self, command: &Command) -> Result<(), SessionError> {
        trace!("Sending command {}", command.name());
        self.send(command).await
    }

    pub async fn send_response(&self, response: &Response) -> Result<(), SessionError> {
        trace!("Sending response {}", response.name());
        self.send(response).await
    }

    /// Sends a command and runs `on_buffered` once its frame sits in the write buffer,
    /// before it is flushed.
    ///
    /// The peer cannot see the command before `on_buffered` has run. If the returned future
    /// is dropped, either the frame was buffered and `on_buffered` ran, or neither happened.
    pub(crate) async fn send_command_then<F>(
        &self,
        command: &Command,
        on_buffered: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(),
    {
        trace!("Sending command {}", command.name());
        self.send_then(command, on_buffered).await
    }

    async fn send<I>(&self, item: I) -> Result<(), SessionError>
    where
        WireCodec: Encoder<I, Error = CodecError>,
    {
        self.send_then(item, || {}).await
    }

    /// The frame is fully encoded before the first byte is written. An encoding error
    /// leaves the session open since nothing reached the stream.
    async fn send_then<I, F>(&self, item: I, on_buffered: F) -> Result<(), SessionError>
    where
        WireCodec: Encoder<I, Error = CodecError>,
        F: FnOnce(),
    {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionError::Closed),
            result = async {
                let mut writer = self.writer.lock().await;
                writer.feed(item).await?;
                on_buffered();
                writer.flush().await
            } => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(CodecError::Encode(e)) => Err(SessionError::Encode(e)),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Waits for the next message from the peer.
    ///
    /// Returns [`SessionError::Closed`] as soon as [`close`](Self::close) is called, even
    /// while waiting for data. The peer closing the stream between frames also reports
    /// `Closed`.
    pub async fn receive(&self) -> Result<Message, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionError::Closed),
            next = async {
                let mut reader = self.reader.lock().await;
                reader.next().await
            } => next,
        };

        match next {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => Err(self.fail(e.into())),
            None => {
                debug!("Peer closed the stream");
                self.close();
                Err(SessionError::Closed)
            }
        }
    }

    /// Closes the session and wakes every pending `receive` and `send`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Session closed");
        }
        self.cancel.cancel();
    }

    /// Closes the session and shuts down the write half so the peer sees end of stream.
    pub async fn shutdown(&self) {
        self.close();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!("Shutdown of write half failed: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Records a transport failure: the caller gets the cause, later calls get `Closed`.
    fn fail(&self, err: SessionError) -> SessionError {
        if !self.closed.swap(true, Ordering::AcqRel) {
            error!("Session failed: {}", err);
        }
        self.cancel.cancel();
        err
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("closed", &self.is_closed()).finish_non_exhaustive()
    }
}
