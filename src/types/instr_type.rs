//! Instrumentation mode definitions

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Kind of instrumentation the agent applies to the target application.
/// The numeric codes are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentationType {
    /// No instrumentation, monitoring only
    #[default]
    None,
    /// Full CPU call graph instrumentation
    RecursiveFull,
    /// CPU call graph instrumentation with sampled timing
    RecursiveSampled,
    /// Single code region timing
    CodeRegion,
    /// Object allocation tracking
    ObjectAllocations,
    /// Object liveness tracking
    ObjectLiveness,
    /// Stack sampling without bytecode changes
    Sampling,
}

impl InstrumentationType {
    /// Wire code for this instrumentation type.
    pub const fn code(self) -> i32 {
        match self {
            InstrumentationType::None => 0,
            InstrumentationType::RecursiveFull => 1,
            InstrumentationType::RecursiveSampled => 2,
            InstrumentationType::CodeRegion => 3,
            InstrumentationType::ObjectAllocations => 4,
            InstrumentationType::ObjectLiveness => 5,
            InstrumentationType::Sampling => 6,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: i32) -> Result<Self, DecodeError> {
        Ok(match code {
            0 => InstrumentationType::None,
            1 => InstrumentationType::RecursiveFull,
            2 => InstrumentationType::RecursiveSampled,
            3 => InstrumentationType::CodeRegion,
            4 => InstrumentationType::ObjectAllocations,
            5 => InstrumentationType::ObjectLiveness,
            6 => InstrumentationType::Sampling,
            other => {
                return Err(DecodeError::malformed(
                    "instrumentation type",
                    format!("unknown code {other}"),
                ));
            }
        })
    }

    /// Whether this mode rewrites method bytecode for CPU profiling.
    pub const fn instruments_methods(self) -> bool {
        matches!(
            self,
            InstrumentationType::RecursiveFull
                | InstrumentationType::RecursiveSampled
                | InstrumentationType::CodeRegion
        )
    }
}
