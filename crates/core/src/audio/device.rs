//! Capture-source selection and stream attempt planning.
//!
//! Both are pure functions of a device-list snapshot so the tie-break
//! order can be checked without audio hardware.

/// What the selector knows about one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub name: String,
    /// Exposed through the host API that supports loopback capture.
    pub loopback_host: bool,
    pub input_channels: u16,
    pub output_channels: u16,
    pub is_default_output: bool,
    pub default_sample_rate: Option<u32>,
}

impl DeviceDescriptor {
    fn lower_name(&self) -> String {
        self.name.to_lowercase()
    }

    fn is_capture(&self) -> bool {
        self.input_channels > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDeviceCandidate {
    pub device_index: usize,
    pub display_name: String,
    pub requires_loopback: bool,
    pub priority: i32,
    pub rule: &'static str,
}

/// One named entry of the selection table.
#[derive(Debug, Clone, Copy)]
pub struct SelectionRule {
    pub name: &'static str,
    pub priority: i32,
    pub requires_loopback: bool,
    pub matches: fn(&DeviceDescriptor) -> bool,
}

/// Evaluated top to bottom; the first matching rule scores a device.
pub const SELECTION_RULES: &[SelectionRule] = &[
    SelectionRule {
        name: "virtual-mixer-b1",
        priority: 0,
        requires_loopback: false,
        matches: is_primary_mixer_bus,
    },
    SelectionRule {
        name: "virtual-mixer-b2",
        priority: 1,
        requires_loopback: false,
        matches: |device| is_mixer_bus(device, "out b2"),
    },
    SelectionRule {
        name: "virtual-mixer-b3",
        priority: 2,
        requires_loopback: false,
        matches: |device| is_mixer_bus(device, "out b3"),
    },
    SelectionRule {
        name: "virtual-cable",
        priority: 2,
        requires_loopback: false,
        matches: |device| device.is_capture() && device.lower_name().contains("cable output"),
    },
    SelectionRule {
        name: "default-output-loopback",
        priority: 10,
        requires_loopback: true,
        matches: |device| device.is_default_output && device.output_channels > 0,
    },
];

pub const FALLBACK_RULE: &str = "fallback-default-output";
pub const FALLBACK_PRIORITY: i32 = 100;

fn is_mixer_bus(device: &DeviceDescriptor, bus: &str) -> bool {
    let name = device.lower_name();
    device.is_capture() && name.contains("voicemeeter") && name.contains(bus)
}

/// "Voicemeeter Out B1", or the unqualified "Voicemeeter Out" which is B1.
fn is_primary_mixer_bus(device: &DeviceDescriptor) -> bool {
    let name = device.lower_name();
    if !device.is_capture() || !name.contains("voicemeeter") || !name.contains("out") {
        return false;
    }
    name.contains("out b1")
        || !["out b", "out a", "aux", "vaio3"]
            .iter()
            .any(|qualifier| name.contains(qualifier))
}

/// Every device some rule accepts, best first. Devices outside the
/// loopback host are ignored, so plain microphones never appear.
pub fn rank_devices(devices: &[DeviceDescriptor]) -> Vec<AudioDeviceCandidate> {
    let mut ranked: Vec<AudioDeviceCandidate> = devices
        .iter()
        .filter(|device| device.loopback_host)
        .filter_map(|device| {
            SELECTION_RULES
                .iter()
                .find(|rule| (rule.matches)(device))
                .map(|rule| AudioDeviceCandidate {
                    device_index: device.index,
                    display_name: device.name.clone(),
                    requires_loopback: rule.requires_loopback,
                    priority: rule.priority,
                    rule: rule.name,
                })
        })
        .collect();
    ranked.sort_by_key(|candidate| (candidate.priority, candidate.device_index));
    ranked
}

/// Picks the capture source, falling back to looping back the default
/// playback device when no rule matches.
pub fn select_device(devices: &[DeviceDescriptor]) -> Option<AudioDeviceCandidate> {
    rank_devices(devices).into_iter().next().or_else(|| {
        devices
            .iter()
            .filter(|device| device.loopback_host)
            .find(|device| device.is_default_output)
            .map(|device| AudioDeviceCandidate {
                device_index: device.index,
                display_name: device.name.clone(),
                requires_loopback: true,
                priority: FALLBACK_PRIORITY,
                rule: FALLBACK_RULE,
            })
    })
}

/// One stream configuration to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamAttempt {
    pub sample_rate: u32,
    pub channels: u16,
    /// Request the analysis block size from the host instead of its default
    /// buffering.
    pub fixed_block: bool,
}

/// Device rate first, then the fallbacks; stereo before mono; fixed block
/// before host default. Rates are de-duplicated.
pub fn plan_stream_attempts(default_rate: Option<u32>, fallback_rates: &[u32]) -> Vec<StreamAttempt> {
    let mut rates: Vec<u32> = Vec::with_capacity(fallback_rates.len() + 1);
    for rate in default_rate.into_iter().chain(fallback_rates.iter().copied()) {
        if rate > 0 && !rates.contains(&rate) {
            rates.push(rate);
        }
    }

    rates
        .into_iter()
        .flat_map(|sample_rate| {
            [(2, true), (2, false), (1, true), (1, false)]
                .into_iter()
                .map(move |(channels, fixed_block)| StreamAttempt {
                    sample_rate,
                    channels,
                    fixed_block,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(index: usize, name: &str, input: u16, output: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            index,
            name: name.to_string(),
            loopback_host: true,
            input_channels: input,
            output_channels: output,
            is_default_output: false,
            default_sample_rate: Some(48_000),
        }
    }

    fn speakers(index: usize) -> DeviceDescriptor {
        DeviceDescriptor {
            is_default_output: true,
            ..device(index, "Speakers (Realtek(R) Audio)", 0, 2)
        }
    }

    #[test]
    fn primary_mixer_bus_beats_default_loopback() {
        let devices = vec![
            speakers(0),
            device(1, "Microphone (USB Audio)", 1, 0),
            device(2, "Voicemeeter Out B2 (VB-Audio Voicemeeter VAIO)", 2, 0),
            device(3, "Voicemeeter Out B1 (VB-Audio Voicemeeter VAIO)", 2, 0),
        ];

        let chosen = select_device(&devices).unwrap();
        assert_eq!(chosen.device_index, 3);
        assert_eq!(chosen.rule, "virtual-mixer-b1");
        assert!(!chosen.requires_loopback);

        for _ in 0..10 {
            assert_eq!(select_device(&devices).unwrap(), chosen);
        }
    }

    #[test]
    fn generic_mixer_output_counts_as_b1() {
        let devices = vec![
            device(0, "Voicemeeter Out A1 (VB-Audio Voicemeeter VAIO)", 2, 0),
            device(1, "Voicemeeter Output (VB-Audio Voicemeeter VAIO)", 2, 0),
        ];
        assert_eq!(select_device(&devices).unwrap().device_index, 1);
    }

    #[test]
    fn default_output_is_looped_back() {
        let devices = vec![device(0, "Microphone Array", 2, 0), speakers(1)];
        let chosen = select_device(&devices).unwrap();
        assert_eq!(chosen.device_index, 1);
        assert_eq!(chosen.priority, 10);
        assert!(chosen.requires_loopback);
    }

    #[test]
    fn secondary_buses_tie_break_on_index() {
        let devices = vec![
            device(5, "CABLE Output (VB-Audio Virtual Cable)", 2, 0),
            device(4, "Voicemeeter Out B3 (VB-Audio Voicemeeter VAIO)", 2, 0),
        ];
        let ranked = rank_devices(&devices);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].device_index, 4);
        assert_eq!(ranked[1].rule, "virtual-cable");
    }

    #[test]
    fn never_selects_a_microphone() {
        let devices = vec![device(0, "Microphone (Webcam)", 1, 0)];
        assert!(select_device(&devices).is_none());
    }

    #[test]
    fn ignores_devices_outside_the_loopback_host() {
        let mut b1 = device(0, "Voicemeeter Out B1", 2, 0);
        b1.loopback_host = false;
        let devices = vec![b1, speakers(1)];
        assert_eq!(select_device(&devices).unwrap().device_index, 1);
    }

    #[test]
    fn fallback_never_picks_a_default_output_outside_the_loopback_host() {
        let mut quiet = speakers(0);
        quiet.output_channels = 0;
        quiet.loopback_host = false;
        assert!(select_device(&[quiet]).is_none());
    }

    #[test]
    fn falls_back_to_forcing_the_default_output() {
        // Default playback endpoint that reported no output channels.
        let mut quiet = speakers(2);
        quiet.output_channels = 0;
        let chosen = select_device(&[quiet]).unwrap();
        assert_eq!(chosen.rule, FALLBACK_RULE);
        assert!(chosen.requires_loopback);
    }

    #[test]
    fn attempt_plan_orders_rates_channels_and_block_modes() {
        let attempts = plan_stream_attempts(Some(44_100), &[48_000, 44_100, 96_000]);
        let rates: Vec<u32> = attempts.iter().map(|a| a.sample_rate).collect();
        assert_eq!(attempts.len(), 12);
        assert_eq!(&rates[..4], &[44_100; 4]);
        assert_eq!(&rates[4..8], &[48_000; 4]);
        assert_eq!(&rates[8..], &[96_000; 4]);
        assert_eq!(
            attempts[..4]
                .iter()
                .map(|a| (a.channels, a.fixed_block))
                .collect::<Vec<_>>(),
            vec![(2, true), (2, false), (1, true), (1, false)]
        );
    }

    #[test]
    fn attempt_plan_without_device_rate_uses_fallbacks() {
        let attempts = plan_stream_attempts(None, &[48_000]);
        assert_eq!(attempts.len(), 4);
        assert!(attempts.iter().all(|a| a.sample_rate == 48_000));
    }
}
