//! GC start/finish pairing across snapshots
//!
//! The agent reports GC start and finish times as they happen, so one collection can
//! start in one snapshot and finish in a later one. The snapshot holding the unpaired
//! start is the *holder*; a later leading finish is moved into the holder's row so the
//! interval is stored in one place.

use serde::{Deserialize, Serialize};
use tracing::trace;

/// A closed GC interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcInterval {
    pub start: i64,
    pub finish: i64,
}

impl GcInterval {
    pub fn duration(&self) -> i64 {
        self.finish - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    index: usize,
    start: i64,
}

/// GC arrays of one snapshot after pairing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Paired {
    pub starts: Vec<i64>,
    pub finishes: Vec<i64>,
    /// A finish to append to the holder row at the given index.
    pub closes: Option<(usize, i64)>,
}

#[derive(Debug, Default)]
pub(crate) struct GcPairing {
    holder: Option<Pending>,
    recorded: bool,
}

impl GcPairing {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn pair(
        &mut self,
        index: usize,
        timestamp: i64,
        mut starts: Vec<i64>,
        mut finishes: Vec<i64>,
    ) -> Paired {
        let first = !self.recorded;
        self.recorded = true;
        if starts.is_empty() && finishes.is_empty() {
            return Paired::default();
        }

        // A finish before any start on the first recorded snapshot belongs to a collection
        // that began before monitoring did. Later snapshots never get a synthetic start.
        if first {
            if let Some(&first_finish) = finishes.first() {
                if starts.first().is_none_or(|&s| s > first_finish) {
                    trace!("Synthesizing GC start at {} for finish {}", timestamp, first_finish);
                    starts.insert(0, timestamp);
                }
            }
        }

        let mut closes = None;
        if let Some(pending) = self.holder {
            if starts.first().is_some_and(|&s| s <= pending.start) {
                trace!("Folding re-reported GC start {} into {}", starts[0], pending.start);
                starts.remove(0);
            }
            if let Some(&first_finish) = finishes.first() {
                if starts.first().is_none_or(|&s| first_finish < s) {
                    trace!("GC finish {} closes start {} of row {}", first_finish, pending.start, pending.index);
                    closes = Some((pending.index, first_finish));
                    finishes.remove(0);
                    self.holder = None;
                }
            }
        }

        self.holder = if starts.len() > finishes.len() {
            let used = matched_starts(&starts, &finishes);
            starts
                .iter()
                .zip(&used)
                .filter(|&(_, &used)| !used)
                .map(|(&start, _)| start)
                .max()
                .map(|start| Pending { index, start })
        } else {
            None
        };

        Paired { starts, finishes, closes }
    }

    pub fn holder(&self) -> Option<usize> {
        self.holder.map(|p| p.index)
    }
}

/// Closed intervals of one row, pairing each finish with the earliest unused start
/// not later than it.
pub(crate) fn closed_intervals(starts: &[i64], finishes: &[i64], out: &mut Vec<GcInterval>) {
    let mut used = vec![false; starts.len()];
    for &finish in finishes {
        if let Some(i) = earliest_unused(starts, &used, finish) {
            used[i] = true;
            out.push(GcInterval { start: starts[i], finish });
        }
    }
}

/// Which starts of a row are closed by one of its finishes.
fn matched_starts(starts: &[i64], finishes: &[i64]) -> Vec<bool> {
    let mut used = vec![false; starts.len()];
    for &finish in finishes {
        if let Some(i) = earliest_unused(starts, &used, finish) {
            used[i] = true;
        }
    }
    used
}

fn earliest_unused(starts: &[i64], used: &[bool], finish: i64) -> Option<usize> {
    starts
        .iter()
        .enumerate()
        .filter(|&(i, &start)| !used[i] && start <= finish)
        .min_by_key(|&(_, &start)| start)
        .map(|(i, _)| i)
}
