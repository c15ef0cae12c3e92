//! System-wide counters from `sysinfo`.

use std::{collections::HashSet, time::Instant};

use sysinfo::{Disks, Networks, Pid, ProcessRefreshKind, System};
use wtop_core::{SystemSampler, SystemStats, Usage};

pub struct SysinfoSampler {
    sys: System,
    disks: Disks,
    networks: Networks,
    /// Processes whose disk counters already have a baseline.
    io_known: HashSet<Pid>,
    last_slow: Instant,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_processes_specifics(disk_io_only());
        let io_known = sys.processes().keys().copied().collect();
        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            io_known,
            last_slow: Instant::now(),
        }
    }

    /// Logical processors, at least one.
    pub fn cpu_count(&self) -> usize {
        match self.sys.cpus().len() {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        }
    }
}

impl SystemSampler for SysinfoSampler {
    fn sample_cpu(&mut self, stats: &mut SystemStats) {
        self.sys.refresh_cpu();
        stats.cpu_per_core = self.sys.cpus().iter().map(|cpu| cpu.cpu_usage()).collect();
        stats.cpu_total = self.sys.global_cpu_info().cpu_usage();
    }

    fn sample_slow(&mut self, stats: &mut SystemStats) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_slow).as_secs_f64().max(1e-3);
        self.last_slow = now;

        self.sys.refresh_memory();
        stats.memory = Usage::new(self.sys.used_memory(), self.sys.total_memory());
        stats.swap = Usage::new(self.sys.used_swap(), self.sys.total_swap());

        self.disks.refresh();
        let (available, total) = self
            .disks
            .iter()
            .fold((0u64, 0u64), |(available, total), disk| {
                (
                    available.saturating_add(disk.available_space()),
                    total.saturating_add(disk.total_space()),
                )
            });
        stats.disk = Usage::new(total.saturating_sub(available), total);

        // Per-process counters are the only disk I/O source sysinfo offers.
        self.sys.refresh_processes_specifics(disk_io_only());
        let (read, written) = io_since_last_refresh(
            self.sys.processes().iter().map(|(pid, process)| {
                let usage = process.disk_usage();
                (*pid, usage.read_bytes, usage.written_bytes)
            }),
            &mut self.io_known,
        );
        stats.disk_read_bytes_per_sec = read as f64 / elapsed;
        stats.disk_write_bytes_per_sec = written as f64 / elapsed;

        self.networks.refresh();
        let (rx, tx) = self
            .networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_name, data)| {
                (
                    rx.saturating_add(data.received()),
                    tx.saturating_add(data.transmitted()),
                )
            });
        stats.net_rx_bytes_per_sec = rx as f64 / elapsed;
        stats.net_tx_bytes_per_sec = tx as f64 / elapsed;

        tracing::trace!(
            memory = stats.memory.percent(),
            disk = stats.disk.percent(),
            "slow stats sampled"
        );
    }
}

fn disk_io_only() -> ProcessRefreshKind {
    ProcessRefreshKind::new().with_disk_usage()
}

/// Sums `(pid, read, written)` deltas. A pid missing from `known` reports its
/// whole lifetime on the first refresh, so it only seeds the baseline.
/// `known` is replaced by the pids seen this time.
fn io_since_last_refresh(
    usages: impl IntoIterator<Item = (Pid, u64, u64)>,
    known: &mut HashSet<Pid>,
) -> (u64, u64) {
    let mut seen = HashSet::with_capacity(known.len());
    let mut totals = (0u64, 0u64);
    for (pid, read, written) in usages {
        if known.contains(&pid) {
            totals.0 = totals.0.saturating_add(read);
            totals.1 = totals.1.saturating_add(written);
        }
        seen.insert(pid);
    }
    *known = seen;
    totals
}
