use serde::{Deserialize, Serialize};

use crate::error::ProfilerError;
use crate::wire::{GENERAL_NUMBERS_SIZE, MonitoredNumbers, general_index};

/// One telemetry snapshot of the profiled VM.
///
/// Times are in milliseconds since the epoch as reported by the agent; the relative GC
/// time is in permil.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: i64,
    pub free_memory: i64,
    pub total_memory: i64,
    pub user_threads: i64,
    pub system_threads: i64,
    pub surviving_generations: i64,
    pub loaded_classes: i64,
    pub relative_gc_time: i64,
    pub last_gc_pause: i64,
    pub process_cpu_time: i64,
    #[serde(default)]
    pub gc_starts: Vec<i64>,
    #[serde(default)]
    pub gc_finishes: Vec<i64>,
}

impl TelemetrySample {
    pub fn used_memory(&self) -> i64 {
        self.total_memory - self.free_memory
    }

    pub fn has_gc_events(&self) -> bool {
        !self.gc_starts.is_empty() || !self.gc_finishes.is_empty()
    }
}

impl TryFrom<MonitoredNumbers> for TelemetrySample {
    type Error = ProfilerError;

    fn try_from(numbers: MonitoredNumbers) -> Result<Self, Self::Error> {
        let general = &numbers.general_numbers;
        if general.len() != GENERAL_NUMBERS_SIZE {
            return Err(ProfilerError::Telemetry {
                details: format!(
                    "expected {} general values, received {}",
                    GENERAL_NUMBERS_SIZE,
                    general.len()
                ),
            });
        }

        Ok(Self {
            timestamp: general[general_index::TIMESTAMP],
            free_memory: general[general_index::FREE_MEMORY],
            total_memory: general[general_index::TOTAL_MEMORY],
            user_threads: general[general_index::USER_THREADS],
            system_threads: general[general_index::SYSTEM_THREADS],
            surviving_generations: general[general_index::SURVIVING_GENERATIONS],
            loaded_classes: general[general_index::LOADED_CLASSES],
            relative_gc_time: general[general_index::GC_TIME],
            last_gc_pause: general[general_index::GC_PAUSE],
            process_cpu_time: general[general_index::PROCESS_CPU_TIME],
            gc_starts: numbers.gc_starts,
            gc_finishes: numbers.gc_finishes,
        })
    }
}
