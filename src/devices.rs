//! Audio device enumeration and selection.
//!
//! Output devices are enumerated through rodio's cpal so the selected
//! device can be handed straight to an output stream; input devices go
//! through cpal directly.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub default_sample_rate: Option<u32>,
    pub is_default: bool,
}

/// Picks a device from `names` by numeric index or, failing that, by
/// case-insensitive name substring.
pub fn select_device<S: AsRef<str>>(names: &[S], query: &str) -> Option<usize> {
    let query = query.trim();
    if let Ok(index) = query.parse::<usize>() {
        return (index < names.len()).then_some(index);
    }
    let needle = query.to_lowercase();
    names
        .iter()
        .position(|n| n.as_ref().to_lowercase().contains(&needle))
}

pub fn output_devices() -> Vec<DeviceInfo> {
    use rodio::cpal::traits::{DeviceTrait, HostTrait};

    let host = rodio::cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    let Ok(devices) = host.output_devices() else {
        return Vec::new();
    };
    devices
        .enumerate()
        .map(|(index, device)| {
            let name = device.name().unwrap_or_else(|_| "Unknown".into());
            DeviceInfo {
                index,
                is_default: default_name.as_deref() == Some(name.as_str()),
                default_sample_rate: device
                    .default_output_config()
                    .ok()
                    .map(|c| c.sample_rate().0),
                name,
            }
        })
        .collect()
}

pub fn input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let Ok(devices) = host.input_devices() else {
        return Vec::new();
    };
    devices
        .enumerate()
        .map(|(index, device)| {
            let name = device.name().unwrap_or_else(|_| "Unknown".into());
            DeviceInfo {
                index,
                is_default: default_name.as_deref() == Some(name.as_str()),
                default_sample_rate: device
                    .default_input_config()
                    .ok()
                    .map(|c| c.sample_rate()),
                name,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_by_index_or_substring() {
        let names = ["HDA Intel PCH", "USB Headset", "pulse"];
        assert_eq!(select_device(&names, "1"), Some(1));
        assert_eq!(select_device(&names, "7"), None);
        assert_eq!(select_device(&names, "headset"), Some(1));
        assert_eq!(select_device(&names, " Pulse "), Some(2));
        assert_eq!(select_device(&names, "bluetooth"), None);
    }
}
