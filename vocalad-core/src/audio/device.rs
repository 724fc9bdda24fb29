//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

/// Which side of the audio graph a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Heuristic flag for inputs that likely capture system/output audio.
    /// Always `false` for output devices.
    pub is_loopback_like: bool,
    /// Heuristic recommendation for the best device in this direction.
    pub is_recommended: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "speakers (",
    "headphones (",
];

const MIC_POSITIVE_KEYWORDS: &[&str] = &[
    "microphone",
    "mic",
    "array",
    "headset",
    "input",
    "usb",
    "webcam",
];

/// Best-effort heuristic for loopback/system-output capture devices. A voice
/// session fed from one of these hears its own replies.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score an input device name for likely speech microphone quality.
pub fn mic_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = if is_loopback_like_name(&lowered) { -16 } else { 8 };
    if MIC_POSITIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 6;
    }
    if lowered.contains("default") {
        score += 1;
    }
    score
}

/// Mark the best entry as recommended and sort recommended/default first.
fn rank(mut list: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    let best = list
        .iter()
        .enumerate()
        .max_by_key(|(_, d)| {
            let base = match d.direction {
                DeviceDirection::Input => mic_preference_score(&d.name),
                DeviceDirection::Output => 0,
            };
            base + if d.is_default { 2 } else { 0 }
        })
        .map(|(idx, _)| idx);
    if let Some(best) = best.and_then(|idx| list.get_mut(idx)) {
        best.is_recommended = true;
    }

    list.sort_by_key(|d| {
        (
            !d.is_recommended,
            d.is_loopback_like,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });
    list
}

/// List audio devices for one direction.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_devices(direction: DeviceDirection) -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let (default_name, devices) = match direction {
        DeviceDirection::Input => (
            host.default_input_device().and_then(|d| d.name().ok()),
            host.input_devices().map(|d| d.collect::<Vec<_>>()),
        ),
        DeviceDirection::Output => (
            host.default_output_device().and_then(|d| d.name().ok()),
            host.output_devices().map(|d| d.collect::<Vec<_>>()),
        ),
    };

    let devices = match devices {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!(?direction, "failed to enumerate devices: {e}");
            return default_name
                .map(|name| {
                    vec![DeviceInfo {
                        is_loopback_like: direction == DeviceDirection::Input
                            && is_loopback_like_name(&name),
                        name,
                        direction,
                        is_default: true,
                        is_recommended: true,
                    }]
                })
                .unwrap_or_default();
        }
    };

    let list = devices
        .iter()
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Device {}", idx + 1));
            DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                is_loopback_like: direction == DeviceDirection::Input
                    && is_loopback_like_name(&name),
                is_recommended: false,
                direction,
                name,
            }
        })
        .collect::<Vec<_>>();
    rank(list)
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices(_direction: DeviceDirection) -> Vec<DeviceInfo> {
    vec![]
}

/// Resolve a device by preferred name, falling back to the default device and
/// then to the first device the host reports.
#[cfg(feature = "audio-cpal")]
pub(crate) fn resolve_device(
    direction: DeviceDirection,
    preferred_name: Option<&str>,
) -> crate::error::Result<cpal::Device> {
    use crate::error::VocaladError;
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let mut all = match direction {
        DeviceDirection::Input => host.input_devices().map(|d| d.collect::<Vec<_>>()),
        DeviceDirection::Output => host.output_devices().map(|d| d.collect::<Vec<_>>()),
    }
    .map_err(|e| VocaladError::AudioDevice(e.to_string()))?;

    if let Some(preferred) = preferred_name {
        if let Some(pos) = all
            .iter()
            .position(|d| d.name().map(|n| n == preferred).unwrap_or(false))
        {
            return Ok(all.swap_remove(pos));
        }
        tracing::warn!(?direction, preferred, "preferred device not found, falling back");
    }

    let default = match direction {
        DeviceDirection::Input => host.default_input_device(),
        DeviceDirection::Output => host.default_output_device(),
    };
    if let Some(device) = default {
        return Ok(device);
    }

    if all.is_empty() {
        return Err(match direction {
            DeviceDirection::Input => VocaladError::NoDefaultInputDevice,
            DeviceDirection::Output => VocaladError::NoDefaultOutputDevice,
        });
    }
    tracing::warn!(?direction, "no default device, falling back to first available");
    Ok(all.swap_remove(0))
}
