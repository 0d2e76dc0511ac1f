//! Error types for the profiler core.
//!
//! Errors are layered the same way the protocol is:
//!
//! - **Decode/Encode Errors**: malformed, unknown or truncated wire data
//! - **Session Errors**: I/O failure or use of a closed connection
//! - **Instrumentation Errors**: the external bytecode rewriter failed for one class
//! - **Profiler Errors**: the crate-level error that wraps all of the above
//!
//! ## Session-ending vs. per-class problems
//!
//! A decode or session error ends the current profiling connection and should be
//! reported as "connection lost / protocol error". An instrumentation error is a
//! warning about a single class and never ends the session:
//!
//! ```rust
//! use jfluid::{InstrumentError, ProfilerError};
//!
//! let warning = ProfilerError::instrumentation("com.example.Broken", InstrumentError::new("bad stack map"));
//! assert!(!warning.is_session_ending());
//!
//! let lost = ProfilerError::from(jfluid::SessionError::Closed);
//! assert!(lost.is_session_ending());
//! for suggestion in lost.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for profiler operations.
pub type Result<T, E = ProfilerError> = std::result::Result<T, E>;

/// Failure to turn bytes into a [`Message`](crate::wire::Message).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("Unknown message kind {kind} in family {family}")]
    UnknownKind { family: u8, kind: i32 },

    #[error("Invalid simple opcode {opcode}")]
    InvalidOpcode { opcode: i32 },

    #[error("Truncated message: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid length {length} for {field}")]
    InvalidLength { field: &'static str, length: i64 },

    #[error("Field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("Malformed {context}: {details}")]
    Malformed { context: &'static str, details: String },

    #[error("{trailing} trailing bytes after message")]
    TrailingBytes { trailing: usize },
}

impl DecodeError {
    pub(crate) fn malformed(context: &'static str, details: impl Into<String>) -> Self {
        DecodeError::Malformed { context, details: details.into() }
    }
}

/// Failure to turn a message into bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{field} is too large to encode: {length} exceeds {max}")]
    TooLarge { field: &'static str, length: usize, max: usize },

    #[error("Parallel arrays of {context} differ in length")]
    Misaligned { context: &'static str },
}

/// Error raised by the framed codec. Wraps I/O so it can be used with `tokio_util::codec`.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Transport I/O error")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by a [`Session`](crate::session::Session).
///
/// The call that observes the underlying failure gets `Io`/`Decode`/`Encode`; every call
/// after that gets `Closed`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("Session I/O failed")]
    Io(#[source] std::io::Error),

    #[error("Protocol error: {0}")]
    Decode(#[source] DecodeError),

    #[error("Message could not be encoded: {0}")]
    Encode(#[source] EncodeError),
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Decode(e) => SessionError::Decode(e),
            CodecError::Encode(e) => SessionError::Encode(e),
            CodecError::Io(e) => SessionError::Io(e),
        }
    }
}

/// Error reported by the external bytecode rewriter for one class.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct InstrumentError {
    message: String,
}

impl InstrumentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Main error type for profiler operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProfilerError {
    #[error("Failed to connect to agent: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Connection lost")]
    Session(#[from] SessionError),

    #[error("Protocol error")]
    Decode(#[from] DecodeError),

    #[error("Message could not be encoded")]
    Encode(#[from] EncodeError),

    #[error("Instrumentation of class {class_name} failed")]
    Instrumentation {
        class_name: String,
        #[source]
        source: InstrumentError,
    },

    #[error("Class file {class_name} is malformed: {details}")]
    ClassFormat { class_name: String, details: String },

    #[error("Agent reported an error: {message}")]
    Agent { message: String },

    #[error("Unexpected response: expected {expected}, received {received}")]
    UnexpectedResponse { expected: &'static str, received: String },

    #[error("Request timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Configuration file error: {path}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid telemetry sample: {details}")]
    Telemetry { details: String },
}

impl ProfilerError {
    /// Returns whether this error ends the profiling connection.
    pub fn is_session_ending(&self) -> bool {
        match self {
            ProfilerError::Connection { .. } => true,
            ProfilerError::Session(_) => true,
            ProfilerError::Decode(_) => true,
            ProfilerError::Timeout { .. } => true,
            ProfilerError::UnexpectedResponse { .. } => true,
            ProfilerError::Encode(_) => false,
            ProfilerError::Instrumentation { .. } => false,
            ProfilerError::ClassFormat { .. } => false,
            ProfilerError::Agent { .. } => false,
            ProfilerError::Config { .. } => false,
            ProfilerError::ConfigFile { .. } => false,
            ProfilerError::Telemetry { .. } => false,
        }
    }

    /// Returns whether the operation may succeed when retried on a new connection.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProfilerError::Connection { .. } => true,
            ProfilerError::Session(SessionError::Io(_)) => true,
            ProfilerError::Session(_) => false,
            ProfilerError::Timeout { .. } => true,
            ProfilerError::Agent { .. } => true,
            _ => false,
        }
    }

    /// Short user-facing category, used by front ends to pick a message.
    pub fn category(&self) -> &'static str {
        if self.is_session_ending() {
            match self {
                ProfilerError::Decode(_)
                | ProfilerError::Session(SessionError::Decode(_))
                | ProfilerError::UnexpectedResponse { .. } => "protocol error",
                _ => "connection lost",
            }
        } else {
            match self {
                ProfilerError::Instrumentation { .. } | ProfilerError::ClassFormat { .. } => {
                    "instrumentation warning"
                }
                ProfilerError::Config { .. } | ProfilerError::ConfigFile { .. } => {
                    "configuration error"
                }
                _ => "profiler error",
            }
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            ProfilerError::Connection { .. } => vec![
                "Ensure the target JVM was started with the profiler agent",
                "Check the agent port and firewall settings",
                "Try attaching again",
            ],
            ProfilerError::Session(_) | ProfilerError::Timeout { .. } => vec![
                "Check whether the target JVM is still running",
                "Reconnect to the agent",
            ],
            ProfilerError::Decode(_) | ProfilerError::UnexpectedResponse { .. } => vec![
                "Verify the agent and profiler versions match",
                "Reconnect to the agent",
            ],
            ProfilerError::Encode(_) => vec!["Reduce the size of the instrumentation batch"],
            ProfilerError::Instrumentation { .. } | ProfilerError::ClassFormat { .. } => vec![
                "Exclude the class from the root selectors",
                "Continue profiling, the class runs uninstrumented",
            ],
            ProfilerError::Agent { .. } => vec![
                "Inspect the agent log for details",
                "Retry the operation",
            ],
            ProfilerError::Config { .. } | ProfilerError::ConfigFile { .. } => vec![
                "Check the configuration file syntax",
                "Remove empty selectors and mark names",
            ],
            ProfilerError::Telemetry { .. } => vec!["Verify the agent and profiler versions match"],
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        ProfilerError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        ProfilerError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for per-class instrumentation failures.
    pub fn instrumentation(class_name: impl Into<String>, source: InstrumentError) -> Self {
        ProfilerError::Instrumentation { class_name: class_name.into(), source }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(reason: impl Into<String>) -> Self {
        ProfilerError::Config { reason: reason.into() }
    }

    /// Helper constructor for a response of the wrong kind.
    pub fn unexpected_response(expected: &'static str, received: impl Into<String>) -> Self {
        ProfilerError::UnexpectedResponse { expected, received: received.into() }
    }
}

impl From<CodecError> for ProfilerError {
    fn from(err: CodecError) -> Self {
        ProfilerError::Session(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(test)]
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn error_messages_carry_their_context(
            reason in ".*",
            class_name in "[a-z]+(\\.[A-Z][a-z]+)+",
            kind in any::<i32>(),
            family in any::<u8>(),
            details in ".*"
          ) {
            let connection = ProfilerError::connection_failed(reason.clone());
            prop_assert!(connection.to_string().contains(&reason));

            let warning = ProfilerError::instrumentation(class_name.clone(), InstrumentError::new(details.clone()));
            prop_assert!(warning.to_string().contains(&class_name));
            prop_assert!(!warning.is_session_ending());

            let unknown = DecodeError::UnknownKind { family, kind };
            prop_assert!(unknown.to_string().contains(&kind.to_string()));
          }

          #[test]
          fn session_failures_always_end_the_session(opcode in any::<i32>(), needed in 0usize..4096) {
            let decode = ProfilerError::from(DecodeError::InvalidOpcode { opcode });
            prop_assert!(decode.is_session_ending());
            prop_assert_eq!(decode.category(), "protocol error");

            let truncated = ProfilerError::from(SessionError::Decode(DecodeError::Truncated { needed, available: 0 }));
            prop_assert!(truncated.is_session_ending());
            prop_assert_eq!(truncated.category(), "protocol error");
          }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<ProfilerError>();
        assert_send_sync_static::<SessionError>();
        assert_send_sync_static::<DecodeError>();
    }

    #[test]
    fn categories_distinguish_lost_connection_from_class_warnings() {
        let lost = ProfilerError::from(SessionError::Closed);
        assert_eq!(lost.category(), "connection lost");

        let io = ProfilerError::from(SessionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(io.is_retryable());
        assert_eq!(io.category(), "connection lost");

        let warning = ProfilerError::instrumentation("a.B", InstrumentError::new("boom"));
        assert_eq!(warning.category(), "instrumentation warning");
        assert!(!warning.recovery_suggestions().is_empty());
    }

    #[test]
    fn codec_errors_map_onto_session_errors() {
        let err: SessionError = CodecError::Decode(DecodeError::InvalidOpcode { opcode: 0 }).into();
        assert!(matches!(err, SessionError::Decode(DecodeError::InvalidOpcode { opcode: 0 })));

        let err: SessionError =
            CodecError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe")).into();
        assert!(matches!(err, SessionError::Io(_)));
    }

    #[test]
    fn recovery_suggestions_are_descriptive() {
        let errors = [
            ProfilerError::connection_failed("refused"),
            ProfilerError::from(SessionError::Closed),
            ProfilerError::config_error("empty mark name"),
            ProfilerError::Timeout { duration: Duration::from_secs(1) },
        ];
        for error in &errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty());
            for suggestion in suggestions {
                assert!(suggestion.len() > 5);
            }
        }
    }
}
