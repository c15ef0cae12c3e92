//! Per-process telemetry: one kernel snapshot per cycle, converted into CPU
//! percentages with a pid-keyed delta cache.

use std::{
    collections::{HashMap, HashSet},
    time::Instant,
};

use serde::{Deserialize, Serialize};

use crate::Result;

pub mod decode;
pub mod kernel;

pub use decode::{ProcessRecords, RecordLayout};
pub use kernel::{KernelSnapshotSource, QueryStatus};

/// Intervals shorter than this are treated as exactly this long.
pub const MIN_INTERVAL_SECS: f64 = 0.05;

/// Kernel CPU-time ticks per second (100 ns units).
pub const TICKS_PER_SECOND: f64 = 10_000_000.0;

/// Raw per-process counters as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent_pid: u32,
    pub name: String,
    pub thread_count: u32,
    pub user_time_ticks: u64,
    pub kernel_time_ticks: u64,
    pub working_set_bytes: u64,
}

impl ProcessRecord {
    pub fn total_ticks(&self) -> u64 {
        self.user_time_ticks.saturating_add(self.kernel_time_ticks)
    }
}

/// Every process at one instant.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    records: Vec<ProcessRecord>,
    captured_at: Instant,
}

impl ProcessSnapshot {
    pub fn new(records: Vec<ProcessRecord>, captured_at: Instant) -> Self {
        Self {
            records,
            captured_at,
        }
    }

    pub fn records(&self) -> &[ProcessRecord] {
        &self.records
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// What the rest of the application sees of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedProcessInfo {
    pub pid: u32,
    pub parent_pid: u32,
    pub name: String,
    pub thread_count: u32,
    pub cpu_percent: f32,
    pub working_set_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub total_ticks: u64,
    pub seen_at: Instant,
}

/// Last-seen CPU counters per pid.
#[derive(Debug, Default, Clone)]
pub struct CpuDeltaCache {
    entries: HashMap<u32, CacheEntry>,
}

impl CpuDeltaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pid: u32) -> Option<&CacheEntry> {
        self.entries.get(&pid)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.entries.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Converts one snapshot into CPU percentages and rolls the cache forward.
///
/// A pid seen for the first time reports zero. `interval_seconds` is
/// floored at [`MIN_INTERVAL_SECS`] and `cpu_count` at one. Cache entries
/// for pids missing from `snapshot` are evicted. The idle process (pid 0)
/// is tracked but not returned.
pub fn compute_deltas(
    cache: &mut CpuDeltaCache,
    snapshot: &ProcessSnapshot,
    interval_seconds: f64,
    cpu_count: usize,
) -> Vec<DerivedProcessInfo> {
    let interval = if interval_seconds.is_finite() {
        interval_seconds.max(MIN_INTERVAL_SECS)
    } else {
        MIN_INTERVAL_SECS
    };
    let cpus = cpu_count.max(1) as f64;

    let mut seen = HashSet::with_capacity(snapshot.len());
    let mut derived = Vec::with_capacity(snapshot.len());
    for record in snapshot.records() {
        seen.insert(record.pid);
        let total = record.total_ticks();
        let cpu_percent = match cache.entries.get(&record.pid) {
            Some(prev) => {
                let busy_secs = total.saturating_sub(prev.total_ticks) as f64 / TICKS_PER_SECOND;
                (busy_secs / interval * 100.0 / cpus).clamp(0.0, 100.0)
            }
            None => 0.0,
        };

        cache.entries.insert(
            record.pid,
            CacheEntry {
                total_ticks: total,
                seen_at: snapshot.captured_at(),
            },
        );

        if record.pid == 0 {
            continue;
        }
        derived.push(DerivedProcessInfo {
            pid: record.pid,
            parent_pid: record.parent_pid,
            name: record.name.clone(),
            thread_count: record.thread_count,
            cpu_percent: cpu_percent as f32,
            working_set_bytes: record.working_set_bytes,
        });
    }

    cache.entries.retain(|pid, _| seen.contains(pid));

    derived
}

/// Where process snapshots come from.
pub trait SnapshotSource {
    fn snapshot(&mut self) -> Result<ProcessSnapshot>;
}

/// Stateful telemetry driver owned by the scheduler.
#[derive(Debug)]
pub struct ProcessTelemetry<S = KernelSnapshotSource> {
    source: S,
    cache: CpuDeltaCache,
    cpu_count: usize,
    last_capture: Option<Instant>,
}

impl<S: SnapshotSource> ProcessTelemetry<S> {
    pub fn new(source: S, cpu_count: usize) -> Self {
        Self {
            source,
            cache: CpuDeltaCache::new(),
            cpu_count: cpu_count.max(1),
            last_capture: None,
        }
    }

    /// Takes a fresh snapshot and derives CPU usage against the previous one.
    /// On error the cache is left as it was so the next cycle can retry.
    pub fn refresh(&mut self) -> Result<Vec<DerivedProcessInfo>> {
        let snapshot = self.source.snapshot()?;
        let interval = self
            .last_capture
            .map(|prev| {
                snapshot
                    .captured_at()
                    .saturating_duration_since(prev)
                    .as_secs_f64()
            })
            .unwrap_or(MIN_INTERVAL_SECS);

        let derived = compute_deltas(&mut self.cache, &snapshot, interval, self.cpu_count);
        self.last_capture = Some(snapshot.captured_at());
        tracing::trace!(processes = derived.len(), interval, "process list refreshed");
        Ok(derived)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn cache(&self) -> &CpuDeltaCache {
        &self.cache
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }
}
