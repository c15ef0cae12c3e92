//! Core library for wtop.
//!
//! Each module owns one subsystem: kernel process telemetry, audio band
//! extraction, the sampling scheduler and the render snapshot it produces.
//! Terminal drawing, keyboard input and system-wide resource counters are
//! collaborators supplied by the application crate through the traits
//! exported here.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod context;
pub mod error;
pub mod render;
pub mod scheduler;
pub mod telemetry;

pub use analysis::{BandFrame, BandLayout, SpectrumAnalyzer};
pub use audio::{BandMagnitudes, BandSource, SpectrumExtractor};
pub use config::{AppConfig, AudioConfig, RefreshRate, TelemetryConfig};
pub use context::{MonitorContext, ProcessView, SortKey, SystemStats, Usage};
pub use error::{Result, WtopError};
pub use render::{RenderSnapshot, Renderer};
pub use scheduler::{Command, InputSource, Mode, SamplingScheduler, SystemSampler};
pub use telemetry::{
    compute_deltas, CpuDeltaCache, DerivedProcessInfo, KernelSnapshotSource, ProcessRecord,
    ProcessSnapshot, ProcessTelemetry, SnapshotSource,
};
