//! Config loading and persistence.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::control::buffer::BufferLimits;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-connection write buffer watermarks.
    pub buffers: BufferLimits,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(Error::ConfigIo)?;
        let config = serde_json::from_str(&raw).map_err(Error::ConfigParse)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).map_err(Error::ConfigParse)?;
        fs::write(path, raw).map_err(Error::ConfigIo)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_watermarks_are_ordered() {
        let config = Config::default();
        assert!(config.buffers.low_water < config.buffers.high_water);
        assert!(config.buffers.high_water < config.buffers.hard_cap);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"buffers": {"hard_cap": 1024}}"#).unwrap();
        assert_eq!(config.buffers.hard_cap, 1024);
        assert_eq!(config.buffers.high_water, BufferLimits::default().high_water);
    }
}
