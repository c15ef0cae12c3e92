use crate::{
    audio::BandMagnitudes,
    config::RefreshRate,
    context::{MonitorContext, ProcessView},
    scheduler::Mode,
    telemetry::DerivedProcessInfo,
    Result,
};

/// Read-only view of one frame. Built fresh every tick so renderers never
/// observe half-updated state.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSnapshot {
    pub mode: Mode,
    pub rate: RefreshRate,
    pub cpu_total: f32,
    pub cpu_per_core: Vec<f32>,
    pub memory_percent: f32,
    pub swap_percent: f32,
    pub disk_percent: f32,
    pub disk_read_bytes_per_sec: f64,
    pub disk_write_bytes_per_sec: f64,
    pub net_rx_bytes_per_sec: f64,
    pub net_tx_bytes_per_sec: f64,
    /// Filtered and sorted by `view`.
    pub processes: Vec<DerivedProcessInfo>,
    pub view: ProcessView,
    pub status: Option<String>,
}

impl RenderSnapshot {
    /// Frame backed by OS-derived figures.
    pub fn from_context(context: &MonitorContext, mode: Mode) -> Self {
        let stats = &context.stats;
        Self {
            mode,
            rate: context.rate,
            cpu_total: stats.cpu_total.clamp(0.0, 100.0),
            cpu_per_core: stats.cpu_per_core.clone(),
            memory_percent: stats.memory.percent(),
            swap_percent: stats.swap.percent(),
            disk_percent: stats.disk.percent(),
            disk_read_bytes_per_sec: stats.disk_read_bytes_per_sec,
            disk_write_bytes_per_sec: stats.disk_write_bytes_per_sec,
            net_rx_bytes_per_sec: stats.net_rx_bytes_per_sec,
            net_tx_bytes_per_sec: stats.net_tx_bytes_per_sec,
            processes: context.view.apply(&context.processes),
            view: context.view.clone(),
            status: context.status.clone(),
        }
    }

    /// Frame whose gauges are driven by audio bands instead of the OS.
    pub fn from_bands(context: &MonitorContext, bands: &BandMagnitudes) -> Self {
        Self {
            cpu_total: bands.cpu_mean(),
            cpu_per_core: bands.cpu.clone(),
            memory_percent: bands.ram,
            swap_percent: bands.swap,
            disk_percent: bands.disk,
            ..Self::from_context(context, Mode::Party)
        }
    }

    /// First row actually shown when `rows` fit on screen. The view offset
    /// is pulled back so the last page is always full.
    pub fn first_visible(&self, rows: usize) -> usize {
        self.view
            .offset
            .min(self.processes.len().saturating_sub(rows))
    }

    pub fn visible_processes(&self, rows: usize) -> &[DerivedProcessInfo] {
        let start = self.first_visible(rows);
        let end = (start + rows).min(self.processes.len());
        &self.processes[start..end]
    }
}

/// Presentation seam. Implementations own the output device.
pub trait Renderer {
    fn render(&mut self, snapshot: &RenderSnapshot) -> Result<()>;
}
