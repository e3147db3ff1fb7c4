//! Output plugin selection and device configuration

use crate::config::{DeviceDescriptor, AUTO_OUTPUT};
use crate::driver::Driver;
use crate::driver::native::ALSA_DEVICE_KEY;
use tracing::debug;

/// One selectable output plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDetails {
    pub name: String,
    pub description: String,
    /// Icon name hint for the settings UI
    pub icon: String,
}

fn icon_for(name: &str) -> &'static str {
    match name {
        "alsa" | "oss" => "alsa",
        "jack" => "jack",
        "pulseaudio" => "pulseaudio",
        "file" => "document-new",
        _ => "soundcard",
    }
}

/// Enumerate output plugins, with the synthetic automatic entry first
pub fn outputs_list(driver: &dyn Driver) -> Vec<OutputDetails> {
    let mut outputs = vec![OutputDetails {
        name: AUTO_OUTPUT.to_string(),
        description: "Automatically detected".to_string(),
        icon: "soundcard".to_string(),
    }];
    for plugin in driver.output_plugins() {
        outputs.push(OutputDetails {
            icon: icon_for(&plugin.name).to_string(),
            name: plugin.name,
            description: plugin.description,
        });
    }
    outputs
}

/// Membership test against the plugin enumeration
pub fn valid_output(driver: &dyn Driver, name: &str) -> bool {
    outputs_list(driver).iter().any(|o| o.name == name)
}

/// Plugins that accept a custom device string
pub fn custom_device_support(name: &str) -> bool {
    matches!(name, "alsa" | "oss" | "jack" | "pulseaudio")
}

/// Plugins whose device string is an ALSA device name
pub fn alsa_device_support(name: &str) -> bool {
    name == "alsa"
}

/// Push the configured device down to the backend when one is set
pub fn apply_device(driver: &mut dyn Driver, device: &DeviceDescriptor) {
    if let Some(value) = device.as_str() {
        debug!(device = %value, "registering output device");
        driver.register_config(ALSA_DEVICE_KEY, &value);
    }
}
