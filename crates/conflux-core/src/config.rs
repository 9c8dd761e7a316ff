//! Mixer configuration, parsed from node creation properties.

use crate::error::{Error, Result};
use crate::node::Properties;

pub const KEY_QUANTUM_LIMIT: &str = "clock.quantum-limit";
pub const KEY_FLAVOR: &str = "mixer.flavor";

pub const DEFAULT_QUANTUM_LIMIT: u32 = 8192;

/// Which port layout the mixer runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixerFlavor {
    /// Any interleaved encoding, shared across ports.
    #[default]
    Interleaved,
    /// Mono planar f32 ports.
    Dsp,
}

impl std::str::FromStr for MixerFlavor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "interleaved" | "audiomixer" => Ok(MixerFlavor::Interleaved),
            "dsp" => Ok(MixerFlavor::Dsp),
            other => Err(Error::InvalidConfig(format!("unknown mixer flavor '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MixerConfig {
    /// Largest quantum in frames; sizes the advertised buffers.
    pub quantum_limit: u32,
    pub flavor: MixerFlavor,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            quantum_limit: DEFAULT_QUANTUM_LIMIT,
            flavor: MixerFlavor::default(),
        }
    }
}

impl MixerConfig {
    /// Reads known keys from `props`; unknown keys are ignored.
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = props.get(KEY_QUANTUM_LIMIT) {
            config.quantum_limit = v.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("{} '{}' is not an integer", KEY_QUANTUM_LIMIT, v))
            })?;
        }
        if let Some(v) = props.get(KEY_FLAVOR) {
            config.flavor = v.trim().parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(16..=65536).contains(&self.quantum_limit) {
            return Err(Error::InvalidConfig(format!(
                "quantum_limit {} out of range (16-65536 frames)",
                self.quantum_limit
            )));
        }
        Ok(())
    }
}
