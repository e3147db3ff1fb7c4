//! Engine configuration
//!
//! Settings are owned by the surrounding application and handed to the
//! engine at construction and on `reload_settings`. They load from TOML
//! with built-in defaults for every key, so an empty document is valid.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Number of equalizer bands (30 Hz .. 16 kHz, octave spaced)
pub const EQ_BANDS: usize = 10;

/// Output plugin name that selects automatic detection
pub const AUTO_OUTPUT: &str = "auto";

/// Output device descriptor
///
/// Device strings come from user settings; some frontends hand the raw
/// bytes of an ALSA device name instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DeviceDescriptor {
    #[default]
    Unset,
    Text(String),
    Bytes(Vec<u8>),
}

impl DeviceDescriptor {
    /// The descriptor as a string, if it carries a usable value
    pub fn as_str(&self) -> Option<String> {
        match self {
            DeviceDescriptor::Unset => None,
            DeviceDescriptor::Text(s) if s.is_empty() => None,
            DeviceDescriptor::Text(s) => Some(s.clone()),
            DeviceDescriptor::Bytes(b) if b.is_empty() => None,
            DeviceDescriptor::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

/// Engine settings consumed at init and on settings reload
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Output plugin name; empty or "auto" selects automatic detection
    #[serde(default = "default_output")]
    pub output: String,

    /// Output device descriptor; unset uses the backend default
    #[serde(default)]
    pub device: DeviceDescriptor,

    /// Bypass the equalizer entirely when false
    #[serde(default = "default_true")]
    pub equalizer_enabled: bool,

    /// Equalizer preamp, -100..=100
    #[serde(default)]
    pub equalizer_preamp: i32,

    /// Per-band equalizer gains, -100..=100, exactly ten entries
    #[serde(default = "default_gains")]
    pub equalizer_gains: Vec<i32>,

    /// Software volume, 0..=100
    #[serde(default = "default_volume")]
    pub volume: u32,
}

fn default_output() -> String {
    AUTO_OUTPUT.to_string()
}

fn default_true() -> bool {
    true
}

fn default_gains() -> Vec<i32> {
    vec![0; EQ_BANDS]
}

fn default_volume() -> u32 {
    100
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            output: default_output(),
            device: DeviceDescriptor::Unset,
            equalizer_enabled: true,
            equalizer_preamp: 0,
            equalizer_gains: default_gains(),
            volume: default_volume(),
        }
    }
}

impl EngineSettings {
    /// Parse settings from a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let settings: EngineSettings =
            toml::from_str(s).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Check value ranges; called by the parsers and by `Engine::new`
    pub fn validate(&self) -> Result<()> {
        if self.equalizer_gains.len() != EQ_BANDS {
            return Err(Error::Config(format!(
                "equalizer_gains must have {} entries, got {}",
                EQ_BANDS,
                self.equalizer_gains.len()
            )));
        }
        if self.volume > 100 {
            return Err(Error::Config(format!(
                "volume must be 0..=100, got {}",
                self.volume
            )));
        }
        if !(-100..=100).contains(&self.equalizer_preamp) {
            return Err(Error::Config(format!(
                "equalizer_preamp must be -100..=100, got {}",
                self.equalizer_preamp
            )));
        }
        if let Some(g) = self
            .equalizer_gains
            .iter()
            .find(|g| !(-100..=100).contains(*g))
        {
            return Err(Error::Config(format!(
                "equalizer gain out of range: {}",
                g
            )));
        }
        Ok(())
    }

    /// Output plugin name, with empty normalised to automatic
    pub fn effective_output(&self) -> &str {
        if self.output.is_empty() {
            AUTO_OUTPUT
        } else {
            &self.output
        }
    }
}
