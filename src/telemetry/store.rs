use std::sync::{PoisonError, RwLock};

use tracing::{debug, trace};

use super::gc::{GcInterval, GcPairing, closed_intervals};
use super::TelemetrySample;

/// Default number of rows per column chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 50;

/// Append-only column stored in fixed-size chunks.
///
/// Growing never moves existing rows, so appends stay cheap for long sessions.
#[derive(Debug, Clone)]
struct Column<T> {
    chunks: Vec<Vec<T>>,
    chunk_size: usize,
    len: usize,
}

impl<T: Clone> Column<T> {
    fn new(chunk_size: usize) -> Self {
        Self { chunks: Vec::new(), chunk_size, len: 0 }
    }

    fn push(&mut self, value: T) {
        if self.len % self.chunk_size == 0 {
            self.chunks.push(Vec::with_capacity(self.chunk_size));
        }
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.push(value);
            self.len += 1;
        }
    }

    fn get(&self, index: usize) -> Option<&T> {
        self.chunks.get(index / self.chunk_size)?.get(index % self.chunk_size)
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.chunks.get_mut(index / self.chunk_size)?.get_mut(index % self.chunk_size)
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

#[derive(Debug)]
struct Columns {
    timestamp: Column<i64>,
    free_memory: Column<i64>,
    total_memory: Column<i64>,
    user_threads: Column<i64>,
    system_threads: Column<i64>,
    surviving_generations: Column<i64>,
    loaded_classes: Column<i64>,
    relative_gc_time: Column<i64>,
    last_gc_pause: Column<i64>,
    process_cpu_time: Column<i64>,
    gc_starts: Column<Vec<i64>>,
    gc_finishes: Column<Vec<i64>>,
}

impl Columns {
    fn new(chunk_size: usize) -> Self {
        Self {
            timestamp: Column::new(chunk_size),
            free_memory: Column::new(chunk_size),
            total_memory: Column::new(chunk_size),
            user_threads: Column::new(chunk_size),
            system_threads: Column::new(chunk_size),
            surviving_generations: Column::new(chunk_size),
            loaded_classes: Column::new(chunk_size),
            relative_gc_time: Column::new(chunk_size),
            last_gc_pause: Column::new(chunk_size),
            process_cpu_time: Column::new(chunk_size),
            gc_starts: Column::new(chunk_size),
            gc_finishes: Column::new(chunk_size),
        }
    }

    fn row(&self, index: usize) -> Option<TelemetrySample> {
        Some(TelemetrySample {
            timestamp: *self.timestamp.get(index)?,
            free_memory: *self.free_memory.get(index)?,
            total_memory: *self.total_memory.get(index)?,
            user_threads: *self.user_threads.get(index)?,
            system_threads: *self.system_threads.get(index)?,
            surviving_generations: *self.surviving_generations.get(index)?,
            loaded_classes: *self.loaded_classes.get(index)?,
            relative_gc_time: *self.relative_gc_time.get(index)?,
            last_gc_pause: *self.last_gc_pause.get(index)?,
            process_cpu_time: *self.process_cpu_time.get(index)?,
            gc_starts: self.gc_starts.get(index)?.clone(),
            gc_finishes: self.gc_finishes.get(index)?.clone(),
        })
    }

    fn clear(&mut self) {
        self.timestamp.clear();
        self.free_memory.clear();
        self.total_memory.clear();
        self.user_threads.clear();
        self.system_threads.clear();
        self.surviving_generations.clear();
        self.loaded_classes.clear();
        self.relative_gc_time.clear();
        self.last_gc_pause.clear();
        self.process_cpu_time.clear();
        self.gc_starts.clear();
        self.gc_finishes.clear();
    }
}

#[derive(Debug)]
struct StoreInner {
    item_count: usize,
    columns: Columns,
    gc: GcPairing,
}

/// Columnar history of telemetry samples.
///
/// All mutation happens under one write lock, so readers see a snapshot either
/// before or after an append, never half of one.
#[derive(Debug)]
pub struct TelemetryStore {
    chunk_size: usize,
    inner: RwLock<StoreInner>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// A chunk size of zero is treated as one.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            inner: RwLock::new(StoreInner {
                item_count: 0,
                columns: Columns::new(chunk_size),
                gc: GcPairing::default(),
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Appends one snapshot and returns its index.
    ///
    /// GC arrays are paired across snapshots; mismatched lengths are never rejected.
    pub fn add_snapshot(&self, sample: TelemetrySample) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let index = inner.item_count;

        let paired = inner.gc.pair(index, sample.timestamp, sample.gc_starts, sample.gc_finishes);
        if let Some((holder, finish)) = paired.closes {
            if let Some(finishes) = inner.columns.gc_finishes.get_mut(holder) {
                finishes.push(finish);
            }
        }

        let columns = &mut inner.columns;
        columns.timestamp.push(sample.timestamp);
        columns.free_memory.push(sample.free_memory);
        columns.total_memory.push(sample.total_memory);
        columns.user_threads.push(sample.user_threads);
        columns.system_threads.push(sample.system_threads);
        columns.surviving_generations.push(sample.surviving_generations);
        columns.loaded_classes.push(sample.loaded_classes);
        columns.relative_gc_time.push(sample.relative_gc_time);
        columns.last_gc_pause.push(sample.last_gc_pause);
        columns.process_cpu_time.push(sample.process_cpu_time);
        columns.gc_starts.push(paired.starts);
        columns.gc_finishes.push(paired.finishes);

        inner.item_count += 1;
        trace!("Stored telemetry snapshot {} at {}", index, sample.timestamp);
        index
    }

    /// Drops all history and pairing state.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        debug!("Resetting telemetry store ({} snapshots)", inner.item_count);
        inner.columns.clear();
        inner.gc.reset();
        inner.item_count = 0;
    }

    pub fn item_count(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).item_count
    }

    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }

    pub fn get(&self, index: usize) -> Option<TelemetrySample> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).columns.row(index)
    }

    pub fn latest(&self) -> Option<TelemetrySample> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.item_count.checked_sub(1).and_then(|last| inner.columns.row(last))
    }

    /// Copies of the last `n` snapshots, oldest first.
    pub fn window(&self, n: usize) -> Vec<TelemetrySample> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let start = inner.item_count.saturating_sub(n);
        (start..inner.item_count).filter_map(|i| inner.columns.row(i)).collect()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        (0..inner.item_count).filter_map(|i| inner.columns.timestamp.get(i).copied()).collect()
    }

    /// Every closed GC interval, in snapshot order.
    pub fn gc_intervals(&self) -> Vec<GcInterval> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut intervals = Vec::new();
        for i in 0..inner.item_count {
            if let (Some(starts), Some(finishes)) =
                (inner.columns.gc_starts.get(i), inner.columns.gc_finishes.get(i))
            {
                closed_intervals(starts, finishes, &mut intervals);
            }
        }
        intervals
    }

    /// Index of the snapshot holding an unpaired GC start.
    pub fn pending_gc_holder(&self) -> Option<usize> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).gc.holder()
    }
}
