use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{Result, WtopError};

/// Raw band averages at or below this read as silence.
pub const EPSILON: f32 = 1e-4;

const BASS: (f32, f32) = (60.0, 120.0);
const LOW_MID: (f32, f32) = (120.0, 500.0);
const HIGH_MID: (f32, f32) = (2_000.0, 6_000.0);
const CPU_RANGE: (f32, f32) = (200.0, 16_000.0);

const BASS_BOOST: f32 = 0.6;
const LOW_MID_BOOST: f32 = 1.0;
const HIGH_MID_BOOST: f32 = 2.5;
const CPU_BOOST_MIN: f32 = 1.0;
const CPU_BOOST_MAX: f32 = 4.0;

/// One frequency range and its perceptual weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandSpec {
    pub low_hz: f32,
    pub high_hz: f32,
    pub boost: f32,
}

/// The fixed bands plus one log-spaced band per logical processor.
#[derive(Debug, Clone, PartialEq)]
pub struct BandLayout {
    pub bass: BandSpec,
    pub low_mid: BandSpec,
    pub high_mid: BandSpec,
    pub cpu: Vec<BandSpec>,
}

impl BandLayout {
    pub fn new(cpu_bands: usize) -> Self {
        let edges = log_spaced_edges(CPU_RANGE.0, CPU_RANGE.1, cpu_bands);
        let span = cpu_bands.saturating_sub(1).max(1) as f32;
        let cpu = edges
            .into_iter()
            .enumerate()
            .map(|(index, (low_hz, high_hz))| BandSpec {
                low_hz,
                high_hz,
                boost: CPU_BOOST_MIN + (CPU_BOOST_MAX - CPU_BOOST_MIN) * index as f32 / span,
            })
            .collect();

        Self {
            bass: band(BASS, BASS_BOOST),
            low_mid: band(LOW_MID, LOW_MID_BOOST),
            high_mid: band(HIGH_MID, HIGH_MID_BOOST),
            cpu,
        }
    }
}

fn band((low_hz, high_hz): (f32, f32), boost: f32) -> BandSpec {
    BandSpec {
        low_hz,
        high_hz,
        boost,
    }
}

/// `count` contiguous `(low, high)` ranges, evenly spaced in log frequency.
pub fn log_spaced_edges(min_hz: f32, max_hz: f32, count: usize) -> Vec<(f32, f32)> {
    if count == 0 {
        return Vec::new();
    }
    let (log_min, log_max) = (min_hz.log10(), max_hz.log10());
    let step = (log_max - log_min) / count as f32;
    (0..count)
        .map(|i| {
            let low = 10f32.powf(log_min + step * i as f32);
            let high = 10f32.powf(log_min + step * (i + 1) as f32);
            (low, high)
        })
        .collect()
}

/// Scaled (not yet smoothed) magnitudes for one analysed block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BandFrame {
    pub ram: f32,
    pub swap: f32,
    pub disk: f32,
    pub cpu: Vec<f32>,
}

/// FFT bin index for a frequency.
pub fn freq_to_bin(freq_hz: f32, window: usize, sample_rate: u32) -> usize {
    if sample_rate == 0 {
        return 0;
    }
    (freq_hz * window as f32 / sample_rate as f32).max(0.0) as usize
}

/// Weighting and log compression: `log10(1 + 39v) / log10(40) * 100`,
/// clamped to 100, zero at or below [`EPSILON`].
pub fn scale_band(average: f32, amplitude: f32, boost: f32) -> f32 {
    let value = average * amplitude * boost;
    if !value.is_finite() || value <= EPSILON {
        return 0.0;
    }
    ((1.0 + 39.0 * value).log10() / 40f32.log10() * 100.0).min(100.0)
}

/// Exponential smoothing, `old * factor + new * (1 - factor)`.
pub fn smooth(old: f32, new: f32, factor: f32) -> f32 {
    old + (new - old) * (1.0 - factor)
}

/// Averages interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels == 0 {
        return;
    }
    let scale = 1.0 / channels as f32;
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() * scale),
    );
}

/// Collects downmixed samples into fixed-size analysis windows.
#[derive(Debug, Clone)]
pub struct MonoAccumulator {
    window: usize,
    pending: Vec<f32>,
}

impl MonoAccumulator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            pending: Vec::with_capacity(window * 2),
        }
    }

    /// Appends interleaved input and hands every completed window to
    /// `on_window`.
    pub fn push<F>(&mut self, interleaved: &[f32], channels: usize, mut on_window: F)
    where
        F: FnMut(&[f32]),
    {
        downmix(interleaved, channels, &mut self.pending);
        let mut start = 0;
        while self.pending.len() - start >= self.window {
            on_window(&self.pending[start..start + self.window]);
            start += self.window;
        }
        self.pending.drain(..start);
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Turns mono windows into band magnitudes.
pub struct SpectrumAnalyzer {
    sample_rate: u32,
    amplitude: f32,
    layout: BandLayout,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
    magnitudes: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate: u32, amplitude: f32, cpu_bands: usize) -> Self {
        Self {
            sample_rate,
            amplitude,
            layout: BandLayout::new(cpu_bands),
            fft_planner: RealFftPlanner::new(),
            fft: None,
            magnitudes: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn layout(&self) -> &BandLayout {
        &self.layout
    }

    /// Windows, transforms and bands one block of mono samples.
    pub fn process_block(&mut self, samples: &[f32]) -> Result<BandFrame> {
        if samples.len() < 2 {
            return Err(WtopError::Audio(
                "analysis requires blocks with at least two samples".into(),
            ));
        }
        if samples.iter().any(|sample| !sample.is_finite()) {
            return Err(WtopError::Audio("non-finite sample in block".into()));
        }

        self.compute_magnitudes(samples)?;
        let window = samples.len();
        let amplitude = self.amplitude;
        let level = |spec: &BandSpec| {
            let average = band_average(&self.magnitudes, spec, window, self.sample_rate);
            scale_band(average, amplitude, spec.boost)
        };

        Ok(BandFrame {
            ram: level(&self.layout.bass),
            swap: level(&self.layout.low_mid),
            disk: level(&self.layout.high_mid),
            cpu: self.layout.cpu.iter().map(level).collect(),
        })
    }

    fn compute_magnitudes(&mut self, samples: &[f32]) -> Result<()> {
        let len = samples.len();
        let fft = prepare_fft(&mut self.fft, &mut self.fft_planner, len);

        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, len);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|err| WtopError::Audio(format!("fft failed: {err}")))?;

        // Fixed divisor, not peak: a full-scale sine lands near 1.0 under
        // the Hann window.
        let divisor = len as f32 / 4.0;
        self.magnitudes.clear();
        self.magnitudes
            .extend(fft.spectrum.iter().map(|bin| bin.norm() / divisor));
        Ok(())
    }
}

fn prepare_fft<'a>(
    slot: &'a mut Option<FftResources>,
    planner: &mut RealFftPlanner<f32>,
    size: usize,
) -> &'a mut FftResources {
    if slot.as_ref().is_some_and(|fft| fft.size != size) {
        *slot = None;
    }

    slot.get_or_insert_with(|| {
        let plan = planner.plan_fft_forward(size);
        FftResources {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    })
}

/// Mean magnitude across the band's bins; DC is always excluded.
fn band_average(magnitudes: &[f32], spec: &BandSpec, window: usize, sample_rate: u32) -> f32 {
    let Some(last) = magnitudes.len().checked_sub(1) else {
        return 0.0;
    };
    let low = freq_to_bin(spec.low_hz, window, sample_rate).max(1);
    let high = freq_to_bin(spec.high_hz, window, sample_rate).min(last);
    if high <= low {
        return 0.0;
    }
    let bins = &magnitudes[low..high];
    bins.iter().sum::<f32>() / bins.len() as f32
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("sample_rate", &self.sample_rate)
            .field("amplitude", &self.amplitude)
            .field("cpu_bands", &self.layout.cpu.len())
            .field("fft", &self.fft)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
