//! Backend glue: enumerate endpoints of the loopback-capable host and open
//! input streams on them. Only WASAPI offers loopback capture, so other
//! targets report no devices.

use crate::{
    audio::device::{DeviceDescriptor, StreamAttempt},
    Result,
};

/// Devices seen in one scan, index-aligned with their descriptors.
pub struct DeviceInventory {
    descriptors: Vec<DeviceDescriptor>,
    #[cfg(windows)]
    devices: Vec<cpal::Device>,
}

impl DeviceInventory {
    pub fn descriptors(&self) -> &[DeviceDescriptor] {
        &self.descriptors
    }
}

impl std::fmt::Debug for DeviceInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInventory")
            .field("descriptors", &self.descriptors)
            .finish()
    }
}

/// A running capture stream; dropping it stops capture.
pub struct CaptureStream {
    #[cfg(windows)]
    _stream: cpal::Stream,
}

impl std::fmt::Debug for CaptureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStream").finish()
    }
}

#[cfg(windows)]
mod backend {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    use super::{CaptureStream, DeviceInventory};
    use crate::{
        audio::device::{DeviceDescriptor, StreamAttempt},
        Result, WtopError,
    };

    fn audio_err(context: &str, err: impl std::fmt::Display) -> WtopError {
        WtopError::Audio(format!("{context}: {err}"))
    }

    pub(super) fn scan() -> Result<DeviceInventory> {
        let host = cpal::host_from_id(cpal::HostId::Wasapi)
            .map_err(|err| audio_err("WASAPI host unavailable", err))?;
        let default_output = host
            .default_output_device()
            .and_then(|device| device.name().ok());

        let mut descriptors = Vec::new();
        let mut devices = Vec::new();
        for (index, device) in host
            .devices()
            .map_err(|err| audio_err("device enumeration failed", err))?
            .enumerate()
        {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("device #{index}"));
            let input = device.default_input_config().ok();
            let output = device.default_output_config().ok();
            let default_sample_rate = input
                .as_ref()
                .or(output.as_ref())
                .map(|config| config.sample_rate().0);

            descriptors.push(DeviceDescriptor {
                index,
                is_default_output: default_output.as_deref() == Some(name.as_str()),
                name,
                loopback_host: true,
                input_channels: input.map(|config| config.channels()).unwrap_or(0),
                output_channels: output.map(|config| config.channels()).unwrap_or(0),
                default_sample_rate,
            });
            devices.push(device);
        }

        Ok(DeviceInventory {
            descriptors,
            devices,
        })
    }

    pub(super) fn open<F>(
        inventory: &DeviceInventory,
        index: usize,
        attempt: &StreamAttempt,
        block_size: usize,
        mut on_data: F,
    ) -> Result<CaptureStream>
    where
        F: FnMut(&[f32]) + Send + 'static,
    {
        let device = inventory
            .devices
            .get(index)
            .ok_or_else(|| WtopError::Audio(format!("no device at index {index}")))?;

        let buffer_size = if attempt.fixed_block {
            cpal::BufferSize::Fixed(block_size as u32)
        } else {
            cpal::BufferSize::Default
        };
        let config = cpal::StreamConfig {
            channels: attempt.channels,
            sample_rate: cpal::SampleRate(attempt.sample_rate),
            buffer_size,
        };

        // An input stream on a render endpoint is opened in loopback mode.
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| on_data(data),
                |err| tracing::warn!(%err, "audio capture stream error"),
                None,
            )
            .map_err(|err| audio_err("stream build failed", err))?;
        stream
            .play()
            .map_err(|err| audio_err("stream start failed", err))?;

        Ok(CaptureStream { _stream: stream })
    }
}

#[cfg(not(windows))]
mod backend {
    use super::{CaptureStream, DeviceInventory};
    use crate::{audio::device::StreamAttempt, Result, WtopError};

    pub(super) fn scan() -> Result<DeviceInventory> {
        Err(WtopError::Audio(
            "loopback capture requires the WASAPI host".into(),
        ))
    }

    pub(super) fn open<F>(
        _inventory: &DeviceInventory,
        index: usize,
        _attempt: &StreamAttempt,
        _block_size: usize,
        _on_data: F,
    ) -> Result<CaptureStream>
    where
        F: FnMut(&[f32]) + Send + 'static,
    {
        Err(WtopError::Audio(format!(
            "cannot open device {index}: no loopback host"
        )))
    }
}

impl DeviceInventory {
    /// Enumerates every endpoint of the loopback-capable host.
    pub fn scan() -> Result<Self> {
        backend::scan()
    }

    /// Opens and starts an input stream on device `index`. `on_data`
    /// receives interleaved `f32` samples on the audio thread.
    pub fn open<F>(
        &self,
        index: usize,
        attempt: &StreamAttempt,
        block_size: usize,
        on_data: F,
    ) -> Result<CaptureStream>
    where
        F: FnMut(&[f32]) + Send + 'static,
    {
        backend::open(self, index, attempt, block_size, on_data)
    }
}
