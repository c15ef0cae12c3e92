use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    analysis::{smooth, BandFrame, MonoAccumulator, SpectrumAnalyzer},
    config::AudioConfig,
    Result, WtopError,
};

pub mod capture;
pub mod device;

pub use capture::{CaptureStream, DeviceInventory};
pub use device::{
    plan_stream_attempts, rank_devices, select_device, AudioDeviceCandidate, DeviceDescriptor,
    StreamAttempt,
};

/// Smoothed band levels on a 0–100 scale, named after the system figures
/// they stand in for while the visualiser runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BandMagnitudes {
    /// Bass, 60–120 Hz.
    pub ram: f32,
    /// Low-mid, 120–500 Hz.
    pub swap: f32,
    /// High-mid, 2–6 kHz.
    pub disk: f32,
    /// Log-spaced 200 Hz–16 kHz, one per logical processor.
    pub cpu: Vec<f32>,
}

impl BandMagnitudes {
    pub fn zeroed(cpu_bands: usize) -> Self {
        Self {
            cpu: vec![0.0; cpu_bands],
            ..Default::default()
        }
    }

    pub fn cpu_mean(&self) -> f32 {
        if self.cpu.is_empty() {
            0.0
        } else {
            self.cpu.iter().sum::<f32>() / self.cpu.len() as f32
        }
    }

    fn blend(&mut self, frame: &BandFrame, smoothing: f32) {
        let step = |old: f32, new: f32| smooth(old, new, smoothing).clamp(0.0, 100.0);
        self.ram = step(self.ram, frame.ram);
        self.swap = step(self.swap, frame.swap);
        self.disk = step(self.disk, frame.disk);
        for (value, target) in self.cpu.iter_mut().zip(&frame.cpu) {
            *value = step(*value, *target);
        }
    }

    fn reset(&mut self) {
        self.ram = 0.0;
        self.swap = 0.0;
        self.disk = 0.0;
        self.cpu.iter_mut().for_each(|value| *value = 0.0);
    }
}

/// Thread-safe handle over the band state shared with the capture thread.
#[derive(Debug, Clone)]
pub struct SharedMagnitudes {
    inner: Arc<Mutex<BandMagnitudes>>,
}

impl SharedMagnitudes {
    pub fn new(cpu_bands: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BandMagnitudes::zeroed(cpu_bands))),
        }
    }

    /// Copies the current levels out.
    pub fn snapshot(&self) -> Result<BandMagnitudes> {
        let state = self
            .inner
            .lock()
            .map_err(|_| WtopError::msg("band magnitudes have been poisoned"))?;
        Ok(state.clone())
    }

    /// Smooths `frame` into the shared state. A poisoned lock is recovered so
    /// the audio thread keeps running.
    pub fn blend(&self, frame: &BandFrame, smoothing: f32) {
        self.lock_recovering().blend(frame, smoothing);
    }

    pub fn reset(&self) {
        self.lock_recovering().reset();
    }

    fn lock_recovering(&self) -> MutexGuard<'_, BandMagnitudes> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-stream state living inside the capture callback.
#[derive(Debug)]
pub struct CaptureProcessor {
    channels: usize,
    smoothing: f32,
    accumulator: MonoAccumulator,
    analyzer: SpectrumAnalyzer,
    shared: SharedMagnitudes,
}

impl CaptureProcessor {
    pub fn new(
        config: &AudioConfig,
        sample_rate: u32,
        channels: u16,
        cpu_bands: usize,
        shared: SharedMagnitudes,
    ) -> Self {
        Self {
            channels: usize::from(channels),
            smoothing: config.smoothing,
            accumulator: MonoAccumulator::new(config.block_size),
            analyzer: SpectrumAnalyzer::new(sample_rate, config.amplitude, cpu_bands),
            shared,
        }
    }

    /// Handles one callback buffer of interleaved samples. Degenerate input
    /// leaves the published levels untouched.
    pub fn on_samples(&mut self, interleaved: &[f32]) {
        if self.channels == 0 || interleaved.is_empty() {
            return;
        }
        let analyzer = &mut self.analyzer;
        let shared = &self.shared;
        let smoothing = self.smoothing;
        self.accumulator.push(interleaved, self.channels, |window| {
            match analyzer.process_block(window) {
                Ok(frame) => shared.blend(&frame, smoothing),
                Err(err) => tracing::trace!(%err, "skipping audio block"),
            }
        });
    }
}

/// Producer of band magnitudes for Party mode.
pub trait BandSource {
    /// Starts capture. `false` means the feature is unavailable.
    fn start(&mut self) -> bool;
    /// Stops capture and zeroes the levels. Safe to call repeatedly.
    fn stop(&mut self);
    fn magnitudes(&self) -> BandMagnitudes;
    fn is_running(&self) -> bool;
}

/// Loopback capture and band extraction.
#[derive(Debug)]
pub struct SpectrumExtractor {
    config: AudioConfig,
    cpu_bands: usize,
    shared: SharedMagnitudes,
    stream: Option<CaptureStream>,
}

impl SpectrumExtractor {
    pub fn new(config: AudioConfig, cpu_bands: usize) -> Self {
        Self {
            config,
            cpu_bands,
            shared: SharedMagnitudes::new(cpu_bands),
            stream: None,
        }
    }

    /// Handle for readers that outlive a borrow of the extractor.
    pub fn shared(&self) -> SharedMagnitudes {
        self.shared.clone()
    }

    fn try_start(&mut self) -> Result<()> {
        let inventory = DeviceInventory::scan()?;
        let candidate = select_device(inventory.descriptors())
            .ok_or_else(|| WtopError::Audio("no loopback capture source found".into()))?;
        let default_rate = inventory
            .descriptors()
            .iter()
            .find(|device| device.index == candidate.device_index)
            .and_then(|device| device.default_sample_rate);

        tracing::info!(
            device = %candidate.display_name,
            rule = candidate.rule,
            loopback = candidate.requires_loopback,
            "selected audio capture source"
        );

        for attempt in plan_stream_attempts(default_rate, &self.config.fallback_sample_rates) {
            let mut processor = CaptureProcessor::new(
                &self.config,
                attempt.sample_rate,
                attempt.channels,
                self.cpu_bands,
                self.shared.clone(),
            );
            match inventory.open(
                candidate.device_index,
                &attempt,
                self.config.block_size,
                move |data| processor.on_samples(data),
            ) {
                Ok(stream) => {
                    tracing::info!(
                        sample_rate = attempt.sample_rate,
                        channels = attempt.channels,
                        fixed_block = attempt.fixed_block,
                        "audio capture started"
                    );
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => tracing::debug!(?attempt, %err, "stream attempt failed"),
            }
        }

        Err(WtopError::Audio(format!(
            "every stream configuration failed for {}",
            candidate.display_name
        )))
    }
}

impl BandSource for SpectrumExtractor {
    fn start(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        match self.try_start() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%err, "audio visualiser unavailable");
                false
            }
        }
    }

    fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("audio capture stopped");
        }
        self.shared.reset();
    }

    fn magnitudes(&self) -> BandMagnitudes {
        self.shared.snapshot().unwrap_or_else(|err| {
            tracing::warn!(%err, "reading band magnitudes failed");
            BandMagnitudes::zeroed(self.cpu_bands)
        })
    }

    fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for SpectrumExtractor {
    fn drop(&mut self) {
        self.stream.take();
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;

    fn stereo_tone(freq: f32, amplitude: f32, frames: usize, rate: u32) -> Vec<f32> {
        (0..frames)
            .flat_map(|n| {
                let v = amplitude * (2.0 * PI * freq * n as f32 / rate as f32).sin();
                [v, v]
            })
            .collect()
    }

    #[test]
    fn capture_processor_publishes_smoothed_levels() {
        let config = AudioConfig::default();
        let shared = SharedMagnitudes::new(4);
        let mut processor = CaptureProcessor::new(&config, 48_000, 2, 4, shared.clone());

        // Less than one window: nothing published yet.
        processor.on_samples(&stereo_tone(80.0, 0.5, 1_000, 48_000));
        assert_eq!(shared.snapshot().unwrap(), BandMagnitudes::zeroed(4));

        processor.on_samples(&stereo_tone(80.0, 0.5, 3_000, 48_000));
        let first = shared.snapshot().unwrap();
        assert!(first.ram > 0.0 && first.ram <= 100.0);

        processor.on_samples(&stereo_tone(80.0, 0.5, 2_048, 48_000));
        let second = shared.snapshot().unwrap();
        assert!(second.ram >= first.ram);
        assert_eq!(second.cpu.len(), 4);
    }

    #[test]
    fn degenerate_buffers_leave_state_unchanged() {
        let config = AudioConfig::default();
        let shared = SharedMagnitudes::new(2);
        let mut mono = CaptureProcessor::new(&config, 48_000, 0, 2, shared.clone());
        mono.on_samples(&[1.0; 4096]);

        let mut processor = CaptureProcessor::new(&config, 48_000, 1, 2, shared.clone());
        processor.on_samples(&[]);
        processor.on_samples(&vec![f32::NAN; 4096]);

        assert_eq!(shared.snapshot().unwrap(), BandMagnitudes::zeroed(2));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let shared = SharedMagnitudes::new(1);
        let mut copy = shared.snapshot().unwrap();
        copy.ram = 99.0;
        assert_eq!(shared.snapshot().unwrap().ram, 0.0);
    }

    #[test]
    fn blend_is_clamped_and_reset_zeroes() {
        let shared = SharedMagnitudes::new(2);
        let frame = BandFrame {
            ram: 100.0,
            swap: 50.0,
            disk: 0.0,
            cpu: vec![100.0, 100.0, 100.0],
        };
        for _ in 0..50 {
            shared.blend(&frame, 0.3);
        }
        let levels = shared.snapshot().unwrap();
        assert!(levels.ram <= 100.0 && levels.ram > 99.0);
        assert_eq!(levels.cpu.len(), 2);

        shared.reset();
        assert_eq!(shared.snapshot().unwrap(), BandMagnitudes::zeroed(2));
    }

    #[test]
    fn recovers_from_a_poisoned_lock() {
        let shared = SharedMagnitudes::new(1);
        let poisoner = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.lock().unwrap();
            panic!("poison the band lock");
        })
        .join();

        assert!(shared.snapshot().is_err());
        shared.blend(&BandFrame::default(), 0.3);
        shared.reset();
    }

    #[test]
    fn stop_is_idempotent_and_zeroes() {
        let mut extractor = SpectrumExtractor::new(AudioConfig::default(), 3);
        extractor.shared().blend(
            &BandFrame {
                ram: 80.0,
                swap: 80.0,
                disk: 80.0,
                cpu: vec![80.0; 3],
            },
            0.0,
        );
        assert_eq!(extractor.magnitudes().ram, 80.0);

        extractor.stop();
        extractor.stop();
        assert!(!extractor.is_running());
        assert_eq!(extractor.magnitudes(), BandMagnitudes::zeroed(3));
    }

    #[test]
    fn cpu_mean_of_empty_is_zero() {
        assert_eq!(BandMagnitudes::default().cpu_mean(), 0.0);
        let levels = BandMagnitudes {
            cpu: vec![10.0, 30.0],
            ..Default::default()
        };
        assert_eq!(levels.cpu_mean(), 20.0);
    }
}
