//! Audio device enumeration and selection using CPAL.

use crate::config::AudioSettings;
use crate::error::{Result, TranskriboError};
use cpal::traits::{DeviceTrait, HostTrait};

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// This suppresses noisy ALSA/JACK/PipeWire messages that CPAL triggers
/// when probing audio backends. The messages are harmless but confusing to users.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2 (stderr).
/// Safe as long as no other thread is concurrently manipulating fd 2.
#[cfg(unix)]
pub fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

#[cfg(not(unix))]
pub fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}

/// An input device as reported by `--list-devices`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Position in the host's input-device enumeration. This is the value
    /// accepted by `AUDIO_DEVICE_INDEX`.
    pub index: usize,
    pub name: String,
    pub is_default: bool,
}

/// Enumerate input devices in the host's deterministic order.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let default_name = host
            .default_input_device()
            .and_then(|d| d.name().ok());
        let devices = host
            .input_devices()
            .map_err(|e| TranskriboError::AudioCapture {
                message: format!("Failed to enumerate input devices: {e}"),
            })?;

        let mut infos = Vec::new();
        for (index, device) in devices.enumerate() {
            if let Ok(name) = device.name() {
                let is_default = default_name.as_deref() == Some(name.as_str());
                infos.push(DeviceInfo {
                    index,
                    name,
                    is_default,
                });
            }
        }
        Ok(infos)
    })
}

/// Index of the system default input device within the enumeration, when the
/// host reports one.
pub fn default_input_index() -> Option<usize> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let default_name = host.default_input_device()?.name().ok()?;
        let devices = host.input_devices().ok()?;
        devices
            .enumerate()
            .find(|(_, d)| d.name().is_ok_and(|n| n == default_name))
            .map(|(index, _)| index)
    })
}

/// Resolve the preferred capture device for the current bind attempt.
///
/// Preference order: explicit index, then name substring match, then the
/// system default. Name pinning is re-resolved on every call so the index may
/// move between binds.
pub fn resolve_preferred_index(settings: &AudioSettings) -> Option<usize> {
    if settings.device_index.is_some() {
        return settings.device_index;
    }
    if let Some(fragment) = &settings.device_name {
        let fragment = fragment.to_lowercase();
        if let Ok(devices) = list_devices() {
            if let Some(info) = devices
                .iter()
                .find(|d| d.name.to_lowercase().contains(&fragment))
            {
                return Some(info.index);
            }
        }
    }
    default_input_index()
}

/// Open the device at an enumeration index.
pub fn device_at(index: usize) -> Result<(cpal::Device, String)> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| TranskriboError::AudioCapture {
                message: format!("Failed to enumerate input devices: {e}"),
            })?;
        for (position, device) in devices.enumerate() {
            if position == index {
                let name = device.name().unwrap_or_else(|_| format!("device {index}"));
                return Ok((device, name));
            }
        }
        Err(TranskriboError::AudioDeviceNotFound {
            device: format!("index {index}"),
        })
    })
}

/// Open the system default input device.
pub fn default_device() -> Result<(cpal::Device, String)> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| TranskriboError::AudioDeviceNotFound {
                device: "default".to_string(),
            })?;
        let name = device.name().unwrap_or_else(|_| "default".to_string());
        Ok((device, name))
    })
}

/// Human-readable report for `--diagnose-audio`.
pub fn diagnose_report(settings: &AudioSettings) -> Result<String> {
    let devices = list_devices()?;
    let mut report = String::new();

    report.push_str(&format!("Host: {}\n", cpal::default_host().id().name()));
    report.push_str(&format!("Input devices: {}\n", devices.len()));
    for info in &devices {
        let marker = if info.is_default { " (default)" } else { "" };
        report.push_str(&format!("{:>3}: {}{}\n", info.index, info.name, marker));
    }

    match resolve_preferred_index(settings) {
        Some(index) => {
            report.push_str(&format!("Preferred device resolves to index {index}\n"));
            match device_at(index) {
                Ok((device, name)) => {
                    report.push_str(&format!("Opening '{name}': ok\n"));
                    match device.default_input_config() {
                        Ok(config) => report.push_str(&format!(
                            "Native config: {} ch @ {} Hz ({:?})\n",
                            config.channels(),
                            config.sample_rate().0,
                            config.sample_format(),
                        )),
                        Err(e) => report.push_str(&format!("Native config query failed: {e}\n")),
                    }
                }
                Err(e) => report.push_str(&format!("Opening device failed: {e}\n")),
            }
        }
        None => {
            report.push_str("No input device could be resolved.\n");
            report.push_str("Check the loopback routing (virtual cable / monitor source).\n");
        }
    }

    report.push_str(&format!(
        "Pipeline rate: {} Hz, device rate: {} Hz, frame: {:.2}s\n",
        settings.sample_rate, settings.device_sample_rate, settings.chunk_duration_seconds,
    ));

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_explicit_index() {
        let settings = AudioSettings {
            device_index: Some(7),
            ..AudioSettings::default()
        };
        assert_eq!(resolve_preferred_index(&settings), Some(7));
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_list_devices_returns_result() {
        let devices = list_devices();
        assert!(devices.is_ok());
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_diagnose_report_mentions_rates() {
        let settings = AudioSettings::default();
        let report = diagnose_report(&settings).expect("diagnose should not fail");
        assert!(report.contains("16000"));
    }
}
