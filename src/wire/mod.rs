//! Wire protocol between the profiler and the agent in the target JVM.
//!
//! ## Frame Structure
//!
//! Every frame starts with a one-byte family followed by a big-endian `i32`:
//!
//! | Family | Meaning          | Followed by                                   |
//! |--------|------------------|-----------------------------------------------|
//! | `1`    | simple command   | opcode in `1..=20`, no body                   |
//! | `2`    | complex command  | kind tag, kind-specific payload               |
//! | `3`    | status response  | `ok` flag (as `i32` 0/1), optional message    |
//! | `4`    | complex response | kind tag, kind-specific payload               |
//!
//! Frames carry no outer length: the payload layout of each kind determines where the
//! frame ends (see [`format`] for field encodings). Unknown families, kinds and opcodes
//! are rejected rather than skipped.
//!
//! Both peers speak the same codec. The profiler sends most commands, but the agent also
//! sends commands of its own (class-load batches, shutdown notices), so either side may
//! receive a [`Command`] or a [`Response`] at any time.

mod codec;
mod commands;
pub mod format;
mod responses;

pub use codec::{WireCodec, decode, decode_prefix, encode, encode_into};
pub use commands::{
    ChangeableInstrParams, ClassLoaded, ClassReplacement, EventBufferDumped, GetClassId,
    GetMethodNames, InitiateProfiling, InstrumentMethodGroup, MethodInvokedFirstTime,
    RootClassLoaded, TakeHeapDump,
};
pub use format::{MAX_ARRAY_LEN, MAX_BYTES_LEN};
pub use responses::{
    ClassError, ClassIdResponse, GENERAL_NUMBERS_SIZE, InstrumentationResult, MethodNames,
    MonitoredNumbers, StatusResponse, VmProperties, general_index,
};

use crate::error::DecodeError;

/// Identifier of an instrumented or sampled method, as assigned by the profiler.
pub type MethodId = i32;

/// Frame family tags.
pub(crate) mod family {
    pub const SIMPLE_COMMAND: u8 = 1;
    pub const COMPLEX_COMMAND: u8 = 2;
    pub const STATUS_RESPONSE: u8 = 3;
    pub const COMPLEX_RESPONSE: u8 = 4;
}

/// Commands without a payload. The discriminant is the wire opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimpleCommand {
    CheckConnection = 1,
    StartTargetApp = 2,
    SuspendTargetApp = 3,
    ResumeTargetApp = 4,
    GetMonitoredNumbers = 5,
    RunGc = 6,
    ResetProfilerCollectors = 7,
    DumpExistingResults = 8,
    DumpExistingResultsLive = 9,
    PrepareDetach = 10,
    Detach = 11,
    TerminateTargetJvm = 12,
    ShutdownInitiated = 13,
    ShutdownOk = 14,
    ShutdownCompleted = 15,
    StillAlive = 16,
    ResultsAvailable = 17,
    DeactivateInjectedCode = 18,
    GetVmProperties = 19,
    InstrumentReflection = 20,
}

impl SimpleCommand {
    /// Every simple command, indexed by `opcode - 1`.
    pub const ALL: [SimpleCommand; 20] = [
        SimpleCommand::CheckConnection,
        SimpleCommand::StartTargetApp,
        SimpleCommand::SuspendTargetApp,
        SimpleCommand::ResumeTargetApp,
        SimpleCommand::GetMonitoredNumbers,
        SimpleCommand::RunGc,
        SimpleCommand::ResetProfilerCollectors,
        SimpleCommand::DumpExistingResults,
        SimpleCommand::DumpExistingResultsLive,
        SimpleCommand::PrepareDetach,
        SimpleCommand::Detach,
        SimpleCommand::TerminateTargetJvm,
        SimpleCommand::ShutdownInitiated,
        SimpleCommand::ShutdownOk,
        SimpleCommand::ShutdownCompleted,
        SimpleCommand::StillAlive,
        SimpleCommand::ResultsAvailable,
        SimpleCommand::DeactivateInjectedCode,
        SimpleCommand::GetVmProperties,
        SimpleCommand::InstrumentReflection,
    ];

    pub const fn opcode(self) -> i32 {
        self as i32
    }

    pub fn from_opcode(opcode: i32) -> Result<Self, DecodeError> {
        if opcode < 1 {
            return Err(DecodeError::InvalidOpcode { opcode });
        }
        Self::ALL.get((opcode - 1) as usize).copied().ok_or(DecodeError::InvalidOpcode { opcode })
    }

    /// Notifications are fire-and-forget; every other command is answered by exactly one
    /// response.
    pub const fn expects_response(self) -> bool {
        !matches!(
            self,
            SimpleCommand::ShutdownInitiated
                | SimpleCommand::ShutdownOk
                | SimpleCommand::ShutdownCompleted
                | SimpleCommand::StillAlive
                | SimpleCommand::ResultsAvailable
        )
    }
}

/// Kind tags of complex commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    RootClassLoaded = 1,
    ClassLoaded = 2,
    MethodInvokedFirstTime = 3,
    InstrumentMethodGroup = 4,
    InitiateProfiling = 5,
    GetMethodNamesForJMethodIds = 6,
    EventBufferDumped = 7,
    GetClassId = 8,
    SetChangeableInstrParams = 9,
    TakeHeapDump = 10,
}

impl CommandKind {
    pub(crate) fn from_tag(kind: i32) -> Result<Self, DecodeError> {
        Ok(match kind {
            1 => CommandKind::RootClassLoaded,
            2 => CommandKind::ClassLoaded,
            3 => CommandKind::MethodInvokedFirstTime,
            4 => CommandKind::InstrumentMethodGroup,
            5 => CommandKind::InitiateProfiling,
            6 => CommandKind::GetMethodNamesForJMethodIds,
            7 => CommandKind::EventBufferDumped,
            8 => CommandKind::GetClassId,
            9 => CommandKind::SetChangeableInstrParams,
            10 => CommandKind::TakeHeapDump,
            _ => return Err(DecodeError::UnknownKind { family: family::COMPLEX_COMMAND, kind }),
        })
    }
}

/// Kind tags of complex responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    InstrumentMethodGroup = 1,
    MonitoredNumbers = 2,
    MethodNames = 3,
    ClassId = 4,
    VmProperties = 5,
}

impl ResponseKind {
    pub(crate) fn from_tag(kind: i32) -> Result<Self, DecodeError> {
        Ok(match kind {
            1 => ResponseKind::InstrumentMethodGroup,
            2 => ResponseKind::MonitoredNumbers,
            3 => ResponseKind::MethodNames,
            4 => ResponseKind::ClassId,
            5 => ResponseKind::VmProperties,
            _ => return Err(DecodeError::UnknownKind { family: family::COMPLEX_RESPONSE, kind }),
        })
    }
}

/// A request or notification sent by either peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Simple(SimpleCommand),
    RootClassLoaded(RootClassLoaded),
    ClassLoaded(ClassLoaded),
    MethodInvokedFirstTime(MethodInvokedFirstTime),
    InstrumentMethodGroup(InstrumentMethodGroup),
    InitiateProfiling(InitiateProfiling),
    GetMethodNamesForJMethodIds(GetMethodNames),
    EventBufferDumped(EventBufferDumped),
    GetClassId(GetClassId),
    SetChangeableInstrParams(ChangeableInstrParams),
    TakeHeapDump(TakeHeapDump),
}

impl Command {
    /// Complex kind tag, `None` for simple commands.
    pub fn kind(&self) -> Option<CommandKind> {
        Some(match self {
            Command::Simple(_) => return None,
            Command::RootClassLoaded(_) => CommandKind::RootClassLoaded,
            Command::ClassLoaded(_) => CommandKind::ClassLoaded,
            Command::MethodInvokedFirstTime(_) => CommandKind::MethodInvokedFirstTime,
            Command::InstrumentMethodGroup(_) => CommandKind::InstrumentMethodGroup,
            Command::InitiateProfiling(_) => CommandKind::InitiateProfiling,
            Command::GetMethodNamesForJMethodIds(_) => CommandKind::GetMethodNamesForJMethodIds,
            Command::EventBufferDumped(_) => CommandKind::EventBufferDumped,
            Command::GetClassId(_) => CommandKind::GetClassId,
            Command::SetChangeableInstrParams(_) => CommandKind::SetChangeableInstrParams,
            Command::TakeHeapDump(_) => CommandKind::TakeHeapDump,
        })
    }

    pub fn expects_response(&self) -> bool {
        match self {
            Command::Simple(simple) => simple.expects_response(),
            _ => true,
        }
    }

    /// Name used in logs and error messages.
    pub fn name(&self) -> String {
        match (self, self.kind()) {
            (_, Some(kind)) => format!("{kind:?}"),
            (Command::Simple(simple), None) => format!("{simple:?}"),
            (_, None) => "Unknown".to_string(),
        }
    }
}

impl From<SimpleCommand> for Command {
    fn from(simple: SimpleCommand) -> Self {
        Command::Simple(simple)
    }
}

/// The answer to a command that expects one.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Status(StatusResponse),
    InstrumentMethodGroup(InstrumentationResult),
    MonitoredNumbers(MonitoredNumbers),
    MethodNames(MethodNames),
    ClassId(ClassIdResponse),
    VmProperties(VmProperties),
}

impl Response {
    pub fn ok() -> Self {
        Response::Status(StatusResponse::ok())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Status(StatusResponse::error(message))
    }

    /// Every complex response counts as success; a status response carries its own flag.
    pub fn is_ok(&self) -> bool {
        match self {
            Response::Status(status) => status.ok,
            _ => true,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Response::Status(status) => status.error_message.as_deref(),
            Response::InstrumentMethodGroup(result) => {
                result.errors().first().map(|e| e.message.as_str())
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Response::Status(_) => "Status",
            Response::InstrumentMethodGroup(_) => "InstrumentMethodGroup",
            Response::MonitoredNumbers(_) => "MonitoredNumbers",
            Response::MethodNames(_) => "MethodNames",
            Response::ClassId(_) => "ClassId",
            Response::VmProperties(_) => "VmProperties",
        }
    }
}

/// Anything that can travel over a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command(Command),
    Response(Response),
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Message::Command(command)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}
