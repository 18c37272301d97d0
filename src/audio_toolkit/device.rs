use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait};
use log::debug;

pub struct CpalDeviceInfo {
    pub name: String,
    pub device: cpal::Device,
}

/// Enumerate input devices of the default host. Devices whose name cannot
/// be read are skipped.
pub fn list_input_devices() -> Result<Vec<CpalDeviceInfo>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()?
        .filter_map(|device| {
            device
                .name()
                .ok()
                .map(|name| CpalDeviceInfo { name, device })
        })
        .collect();
    Ok(devices)
}

/// Resolve the configured input device by name, falling back to the
/// default device when unset or no longer present.
pub fn find_input_device(name: Option<&str>) -> Option<cpal::Device> {
    let host = cpal::default_host();

    if let Some(name) = name {
        match list_input_devices() {
            Ok(devices) => {
                if let Some(found) = devices.into_iter().find(|d| d.name == name) {
                    return Some(found.device);
                }
                debug!("input device '{name}' not found, using default");
            }
            Err(e) => {
                debug!("failed to list input devices, using default: {e}");
            }
        }
    }

    host.default_input_device()
}
