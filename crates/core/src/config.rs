//! RHI configuration.
//!
//! Settings are read from a TOML file and fall back to defaults for any
//! missing key:
//!
//! ```toml
//! width = 800
//! height = 600
//! sample_count = 4
//! validation = true
//! max_descriptor_sets_per_frame = 512
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Startup configuration consumed by the RHI context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RhiConfig {
    /// Initial swapchain width in pixels.
    pub width: u32,
    /// Initial swapchain height in pixels.
    pub height: u32,
    /// Multisample count for MSAA render targets. Must be a power of two up to 64.
    pub sample_count: u32,
    /// Enables the Khronos validation layer and debug messenger.
    pub validation: bool,
    /// Prefer FIFO presentation over mailbox/immediate.
    pub vsync: bool,
    /// Capacity of each per-frame (single-frame) descriptor pool.
    pub max_descriptor_sets_per_frame: u32,
    /// Capacity of the persistent (multi-frame) descriptor pool.
    pub max_persistent_descriptor_sets: u32,
    /// Size in bytes of each per-frame transient uniform ring buffer.
    pub uniform_ring_size: u64,
    /// Number of timestamp queries available per frame.
    pub timestamp_queries: u32,
}

impl Default for RhiConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            sample_count: 1,
            validation: cfg!(debug_assertions),
            vsync: true,
            max_descriptor_sets_per_frame: 1024,
            max_persistent_descriptor_sets: 4096,
            uniform_ring_size: 4 * 1024 * 1024,
            timestamp_queries: 64,
        }
    }
}

impl RhiConfig {
    /// Parses a configuration from TOML text and validates it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// holds out-of-range values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded RHI config from {}", path.display());
        Ok(config)
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks that every value is usable by the RHI.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "extent must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if !self.sample_count.is_power_of_two() || self.sample_count > 64 {
            return Err(Error::Config(format!(
                "sample_count must be a power of two up to 64, got {}",
                self.sample_count
            )));
        }
        if self.max_descriptor_sets_per_frame == 0 || self.max_persistent_descriptor_sets == 0 {
            return Err(Error::Config("descriptor pool capacities must be non-zero".into()));
        }
        if self.uniform_ring_size == 0 {
            return Err(Error::Config("uniform_ring_size must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RhiConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = RhiConfig::from_toml_str("width = 800\nheight = 600\nsample_count = 4\n").unwrap();
        assert_eq!(config.width, 800);
        assert_eq!(config.height, 600);
        assert_eq!(config.sample_count, 4);
        assert_eq!(
            config.max_descriptor_sets_per_frame,
            RhiConfig::default().max_descriptor_sets_per_frame
        );
    }

    #[test]
    fn test_rejects_bad_sample_count() {
        let err = RhiConfig::from_toml_str("sample_count = 3").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_zero_extent() {
        assert!(RhiConfig::from_toml_str("width = 0").is_err());
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = RhiConfig::from_toml_str("width = ").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = RhiConfig {
            validation: false,
            ..RhiConfig::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(RhiConfig::from_toml_str(&text).unwrap(), config);
    }
}
