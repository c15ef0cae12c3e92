use std::{cmp::Ordering, fmt};

use crate::{config::RefreshRate, telemetry::DerivedProcessInfo};

/// Used / total pair for a capacity-style resource.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub used: u64,
    pub total: u64,
}

impl Usage {
    pub fn new(used: u64, total: u64) -> Self {
        Self { used, total }
    }

    /// Share in use, 0 when nothing is installed.
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.used as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0) as f32
        }
    }
}

/// System-wide figures written by the resource-query collaborator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemStats {
    pub cpu_total: f32,
    pub cpu_per_core: Vec<f32>,
    pub memory: Usage,
    pub swap: Usage,
    pub disk: Usage,
    pub disk_read_bytes_per_sec: f64,
    pub disk_write_bytes_per_sec: f64,
    pub net_rx_bytes_per_sec: f64,
    pub net_tx_bytes_per_sec: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    Pid,
    #[default]
    Cpu,
    Memory,
    Name,
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortKey::Pid => "pid",
            SortKey::Cpu => "cpu",
            SortKey::Memory => "mem",
            SortKey::Name => "name",
        })
    }
}

/// How the process table is ordered, narrowed and scrolled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessView {
    pub sort_key: SortKey,
    pub descending: bool,
    /// Case-insensitive substring of the process name. Empty shows all.
    pub filter: String,
    /// First row shown. Clamped against the list when drawn.
    pub offset: usize,
}

impl Default for ProcessView {
    fn default() -> Self {
        Self {
            sort_key: SortKey::Cpu,
            descending: true,
            filter: String::new(),
            offset: 0,
        }
    }
}

impl ProcessView {
    /// Picking the active key flips the direction, a new key starts
    /// descending. Either way the table scrolls back to the top.
    pub fn sort_by(&mut self, key: SortKey) {
        if self.sort_key == key {
            self.descending = !self.descending;
        } else {
            self.sort_key = key;
            self.descending = true;
        }
        self.offset = 0;
    }

    pub fn set_filter(&mut self, filter: impl Into<String>) {
        self.filter = filter.into();
        self.offset = 0;
    }

    pub fn matches(&self, process: &DerivedProcessInfo) -> bool {
        self.filter.is_empty()
            || process
                .name
                .to_lowercase()
                .contains(&self.filter.to_lowercase())
    }

    pub fn matching_count(&self, processes: &[DerivedProcessInfo]) -> usize {
        processes.iter().filter(|process| self.matches(process)).count()
    }

    /// Filtered and sorted copy of `processes`. Ties go to the lower pid.
    pub fn apply(&self, processes: &[DerivedProcessInfo]) -> Vec<DerivedProcessInfo> {
        let mut shown: Vec<DerivedProcessInfo> = processes
            .iter()
            .filter(|process| self.matches(process))
            .cloned()
            .collect();
        shown.sort_by(|a, b| {
            let order = self.compare(a, b);
            let order = if self.descending { order.reverse() } else { order };
            order.then_with(|| a.pid.cmp(&b.pid))
        });
        shown
    }

    fn compare(&self, a: &DerivedProcessInfo, b: &DerivedProcessInfo) -> Ordering {
        match self.sort_key {
            SortKey::Pid => a.pid.cmp(&b.pid),
            SortKey::Cpu => a.cpu_percent.total_cmp(&b.cpu_percent),
            SortKey::Memory => a.working_set_bytes.cmp(&b.working_set_bytes),
            SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        }
    }

    /// Moves the offset by `delta` rows within a list of `len`.
    pub fn scroll_by(&mut self, delta: i64, len: usize) {
        let last = len.saturating_sub(1) as i64;
        self.offset = (self.offset as i64 + delta).clamp(0, last) as usize;
    }

    pub fn scroll_top(&mut self) {
        self.offset = 0;
    }

    /// Jumps to the end. Drawing pulls the offset back to a full last page.
    pub fn scroll_bottom(&mut self, len: usize) {
        self.offset = len.saturating_sub(1);
    }

    pub fn describe_sort(&self) -> String {
        format!(
            "{} ({})",
            self.sort_key,
            if self.descending { "desc" } else { "asc" }
        )
    }
}

/// Everything the monitor knows between ticks.
#[derive(Debug, Clone)]
pub struct MonitorContext {
    pub stats: SystemStats,
    pub processes: Vec<DerivedProcessInfo>,
    pub rate: RefreshRate,
    /// One-line message shown under the header, e.g. a rejected toggle.
    pub status: Option<String>,
    pub view: ProcessView,
    pub running: bool,
}

impl MonitorContext {
    pub fn new(rate: RefreshRate) -> Self {
        Self {
            stats: SystemStats::default(),
            processes: Vec::new(),
            rate,
            status: None,
            view: ProcessView::default(),
            running: true,
        }
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = Some(status.into());
    }
}

impl Default for MonitorContext {
    fn default() -> Self {
        Self::new(RefreshRate::default())
    }
}
