use std::{fmt, path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Result, WtopError};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub refresh: RefreshConfig,
    pub telemetry: TelemetryConfig,
    pub audio: AudioConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections fall back to their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.telemetry.validate()?;
        self.audio.validate()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub rate: RefreshRate,
}

/// Buffer policy for the process-table query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub initial_buffer_bytes: usize,
    pub max_buffer_bytes: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            initial_buffer_bytes: 1024 * 1024,
            max_buffer_bytes: 64 * 1024 * 1024,
        }
    }
}

impl TelemetryConfig {
    fn validate(&self) -> Result<()> {
        if self.initial_buffer_bytes == 0 {
            return Err(WtopError::Config(
                "telemetry.initial_buffer_bytes must be non-zero".into(),
            ));
        }
        if self.max_buffer_bytes < self.initial_buffer_bytes {
            return Err(WtopError::Config(format!(
                "telemetry.max_buffer_bytes ({}) is below initial_buffer_bytes ({})",
                self.max_buffer_bytes, self.initial_buffer_bytes
            )));
        }
        Ok(())
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// FFT window length in samples.
    pub block_size: usize,
    /// Weight of the previous value in exponential smoothing, in `[0, 1)`.
    pub smoothing: f32,
    /// Global multiplier applied to every band before compression.
    pub amplitude: f32,
    /// Rates tried after the device's own default rate.
    pub fallback_sample_rates: Vec<u32>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            block_size: 2048,
            smoothing: 0.3,
            amplitude: 8.0,
            fallback_sample_rates: vec![48_000, 44_100, 96_000],
        }
    }
}

impl AudioConfig {
    fn validate(&self) -> Result<()> {
        if self.block_size < 64 {
            return Err(WtopError::Config(format!(
                "audio.block_size must be at least 64, got {}",
                self.block_size
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(WtopError::Config(format!(
                "audio.smoothing must be in [0, 1), got {}",
                self.smoothing
            )));
        }
        if !self.amplitude.is_finite() || self.amplitude <= 0.0 {
            return Err(WtopError::Config(format!(
                "audio.amplitude must be positive, got {}",
                self.amplitude
            )));
        }
        Ok(())
    }
}

/// How often the monitor samples and redraws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RefreshRate {
    #[default]
    Slow,
    Medium,
    Fast,
    Superfast,
    Ultrafast,
    /// ~60 fps, used while the audio visualiser drives the display.
    Party,
    Custom(Duration),
}

impl RefreshRate {
    /// User-selectable presets, slowest first. `Party` is reserved for the
    /// visualiser and is not part of the cycle.
    pub const PRESETS: [RefreshRate; 5] = [
        RefreshRate::Slow,
        RefreshRate::Medium,
        RefreshRate::Fast,
        RefreshRate::Superfast,
        RefreshRate::Ultrafast,
    ];

    pub fn interval(self) -> Duration {
        match self {
            RefreshRate::Slow => Duration::from_secs(3),
            RefreshRate::Medium => Duration::from_secs(2),
            RefreshRate::Fast => Duration::from_secs(1),
            RefreshRate::Superfast => Duration::from_millis(500),
            RefreshRate::Ultrafast => Duration::from_millis(100),
            RefreshRate::Party => Duration::from_micros(16_700),
            RefreshRate::Custom(interval) => interval,
        }
    }

    /// Next faster preset, saturating at the fastest one.
    pub fn faster(self) -> Self {
        match Self::preset_index(self) {
            Some(index) => Self::PRESETS[(index + 1).min(Self::PRESETS.len() - 1)],
            None => self,
        }
    }

    /// Next slower preset, saturating at the slowest one.
    pub fn slower(self) -> Self {
        match Self::preset_index(self) {
            Some(index) => Self::PRESETS[index.saturating_sub(1)],
            None => self,
        }
    }

    fn preset_index(rate: Self) -> Option<usize> {
        Self::PRESETS.iter().position(|preset| *preset == rate)
    }
}

impl fmt::Display for RefreshRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshRate::Slow => f.write_str("slow"),
            RefreshRate::Medium => f.write_str("medium"),
            RefreshRate::Fast => f.write_str("fast"),
            RefreshRate::Superfast => f.write_str("superfast"),
            RefreshRate::Ultrafast => f.write_str("ultrafast"),
            RefreshRate::Party => f.write_str("party"),
            RefreshRate::Custom(interval) => write!(f, "{}ms", interval.as_millis()),
        }
    }
}

impl FromStr for RefreshRate {
    type Err = WtopError;

    /// Accepts a preset name, `<n>ms`, or a number of seconds.
    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim().to_ascii_lowercase();
        let rate = match value.as_str() {
            "slow" => RefreshRate::Slow,
            "medium" => RefreshRate::Medium,
            "fast" => RefreshRate::Fast,
            "superfast" => RefreshRate::Superfast,
            "ultrafast" => RefreshRate::Ultrafast,
            "party" => {
                return Err(WtopError::Config(
                    "`party` is entered with --party or the p key, not as a refresh rate".into(),
                ))
            }
            other => {
                let interval = match other.strip_suffix("ms") {
                    Some(millis) => millis
                        .trim()
                        .parse::<u64>()
                        .ok()
                        .map(Duration::from_millis),
                    None => other
                        .strip_suffix('s')
                        .unwrap_or(other)
                        .trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|secs| secs.is_finite() && *secs > 0.0)
                        .map(Duration::from_secs_f64),
                };
                match interval {
                    Some(interval) if !interval.is_zero() => RefreshRate::Custom(interval),
                    _ => {
                        return Err(WtopError::Config(format!(
                            "unknown refresh rate `{value}`"
                        )))
                    }
                }
            }
        };
        Ok(rate)
    }
}

impl TryFrom<String> for RefreshRate {
    type Error = WtopError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RefreshRate> for String {
    fn from(value: RefreshRate) -> Self {
        value.to_string()
    }
}
