//! Bricking settings and their JSON configuration layer

use crate::error::{BrickError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default smallest brick edge, in voxels
pub const DEFAULT_MIN_BRICK_SIZE: u32 = 1 << 6;

/// Default largest brick edge, in voxels
pub const DEFAULT_MAX_BRICK_SIZE: u32 = 1 << 9;

/// Settings used while partitioning and apportioning a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Smallest brick edge (power of two)
    pub min_brick_size: u32,

    /// Largest brick edge (power of two, >= min)
    pub max_brick_size: u32,

    /// Rescale 16-bit input to 8-bit output
    #[serde(rename = "mapTo8BPP")]
    pub map_to_8bpp: bool,

    /// Directory receiving brick files and `metadata.json`
    pub output_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_brick_size: DEFAULT_MIN_BRICK_SIZE,
            max_brick_size: DEFAULT_MAX_BRICK_SIZE,
            map_to_8bpp: false,
            output_path: PathBuf::from("."),
        }
    }
}

impl Settings {
    /// Create validated settings
    pub fn new(min_brick_size: u32, max_brick_size: u32) -> Result<Self> {
        let settings = Self {
            min_brick_size,
            max_brick_size,
            ..Self::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Set the output directory
    pub fn with_output_path(mut self, path: impl AsRef<Path>) -> Self {
        self.output_path = path.as_ref().to_path_buf();
        self
    }

    /// Enable or disable 16 to 8 bit rescaling
    pub fn with_map_to_8bpp(mut self, map: bool) -> Self {
        self.map_to_8bpp = map;
        self
    }

    /// Set the smallest brick size, rejecting non powers of two
    pub fn set_min_brick_size(&mut self, size: u32) -> Result<()> {
        check_power_of_two("minBrickSize", size)?;
        self.min_brick_size = size;
        Ok(())
    }

    /// Set the largest brick size, rejecting non powers of two
    pub fn set_max_brick_size(&mut self, size: u32) -> Result<()> {
        check_power_of_two("maxBrickSize", size)?;
        self.max_brick_size = size;
        Ok(())
    }

    /// Check brick-size bounds
    pub fn validate(&self) -> Result<()> {
        check_brick_bounds(self.min_brick_size, self.max_brick_size)
    }

    /// Bytes per sample written to brick files
    pub fn output_bytes_per_pixel(&self, volume_bytes_per_pixel: u8) -> u8 {
        if self.map_to_8bpp {
            1
        } else {
            volume_bytes_per_pixel
        }
    }

    /// Parse settings from a JSON document; missing keys take defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}

/// Both sizes are powers of two and `min <= max`
pub(crate) fn check_brick_bounds(min_brick_size: u32, max_brick_size: u32) -> Result<()> {
    check_power_of_two("minBrickSize", min_brick_size)?;
    check_power_of_two("maxBrickSize", max_brick_size)?;
    if min_brick_size > max_brick_size {
        return Err(BrickError::InvalidSettings(format!(
            "minBrickSize ({}) must not exceed maxBrickSize ({})",
            min_brick_size, max_brick_size
        )));
    }
    Ok(())
}

fn check_power_of_two(name: &str, size: u32) -> Result<()> {
    if !size.is_power_of_two() {
        return Err(BrickError::InvalidSettings(format!(
            "{} must be a power of two, got {}",
            name, size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.min_brick_size, 64);
        assert_eq!(settings.max_brick_size, 512);
        assert!(!settings.map_to_8bpp);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_bounds() {
        assert!(matches!(
            Settings::new(48, 512),
            Err(BrickError::InvalidSettings(_))
        ));
        assert!(matches!(
            Settings::new(0, 512),
            Err(BrickError::InvalidSettings(_))
        ));
        assert!(matches!(
            Settings::new(128, 64),
            Err(BrickError::InvalidSettings(_))
        ));
        assert!(Settings::new(16, 16).is_ok());
    }

    #[test]
    fn test_setters_validate() {
        let mut settings = Settings::default();
        assert!(settings.set_min_brick_size(100).is_err());
        assert_eq!(settings.min_brick_size, 64);
        settings.set_min_brick_size(32).unwrap();
        assert_eq!(settings.min_brick_size, 32);
    }

    #[test]
    fn test_output_bytes_per_pixel() {
        let settings = Settings::default();
        assert_eq!(settings.output_bytes_per_pixel(2), 2);
        assert_eq!(settings.with_map_to_8bpp(true).output_bytes_per_pixel(2), 1);
    }

    #[test]
    fn test_json_config() {
        let settings =
            Settings::from_json_str(r#"{"minBrickSize": 16, "mapTo8BPP": true}"#).unwrap();
        assert_eq!(settings.min_brick_size, 16);
        assert_eq!(settings.max_brick_size, 512);
        assert!(settings.map_to_8bpp);

        assert!(Settings::from_json_str(r#"{"minBrickSize": 1024}"#).is_err());
    }

    #[test]
    fn test_json_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"minBrickSize": 32, "maxBrickSize": 128, "outputPath": "/tmp/out"}"#,
        )
        .unwrap();

        let settings = Settings::from_json_file(&path).unwrap();
        assert_eq!(settings.min_brick_size, 32);
        assert_eq!(settings.max_brick_size, 128);
        assert_eq!(settings.output_path, PathBuf::from("/tmp/out"));
    }
}
