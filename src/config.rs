//! Engine configuration: audio geometry, matching parameters, profile defaults.
//! Loaded from a JSON file with fallback to defaults; CLI flags override fields.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::profile::ProfileSettings;

pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    /// Samples per capture chunk.
    pub chunk_size: usize,
    /// Detection window length in seconds.
    pub window_secs: f32,
    /// Shortest accepted training clip.
    pub min_training_secs: f32,
    /// Search radius of the approximate alignment used while listening.
    pub fastdtw_radius: usize,
    /// Minimum spacing between consecutive action launches.
    pub dispatch_spacing_ms: u64,
    /// Length of microphone recordings used for training and probing.
    pub record_secs: f32,
    /// Input device name; `None` selects the host default.
    pub input_device: Option<String>,
    /// Settings applied to newly trained profiles.
    pub profile_defaults: ProfileSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            window_secs: 1.0,
            min_training_secs: 0.3,
            fastdtw_radius: 1,
            dispatch_spacing_ms: 100,
            record_secs: 2.0,
            input_device: None,
            profile_defaults: ProfileSettings::default(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config IO error: {e}"),
            ConfigError::Parse(e) => write!(f, "config parse error: {e}"),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file. Missing fields take defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be > 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be > 0".into()));
        }
        if !(self.window_secs.is_finite() && self.window_secs > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "window_secs must be positive, got {}",
                self.window_secs
            )));
        }
        if !(self.min_training_secs.is_finite() && self.min_training_secs >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "min_training_secs must be non-negative, got {}",
                self.min_training_secs
            )));
        }
        if self.fastdtw_radius == 0 {
            return Err(ConfigError::Invalid("fastdtw_radius must be >= 1".into()));
        }
        if !(self.record_secs.is_finite() && self.record_secs > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "record_secs must be positive, got {}",
                self.record_secs
            )));
        }
        self.profile_defaults
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("profile_defaults: {e}")))?;
        Ok(())
    }

    /// Sliding window capacity in chunks (at least one).
    pub fn window_capacity(&self) -> usize {
        let chunks_per_sec = self.sample_rate as f32 / self.chunk_size as f32;
        ((chunks_per_sec * self.window_secs) as usize).max(1)
    }

    pub fn min_training_samples(&self) -> usize {
        (self.sample_rate as f32 * self.min_training_secs).ceil() as usize
    }

    pub fn dispatch_spacing(&self) -> Duration {
        Duration::from_millis(self.dispatch_spacing_ms)
    }

    pub fn record_chunks(&self) -> usize {
        let chunks_per_sec = self.sample_rate as f32 / self.chunk_size as f32;
        ((chunks_per_sec * self.record_secs).ceil() as usize).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_window_is_fifteen_chunks() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.window_capacity(), 15);
        assert_eq!(cfg.min_training_samples(), 4800);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{ "chunk_size": 1000, "window_secs": 1.0 }"#).unwrap();
        assert_eq!(cfg.chunk_size, 1000);
        assert_eq!(cfg.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(cfg.window_capacity(), 16);
    }

    #[test]
    fn rejects_zero_radius() {
        let cfg = EngineConfig {
            fastdtw_radius: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_negative_default_threshold() {
        let mut cfg = EngineConfig::default();
        cfg.profile_defaults.distance_threshold = -1.0;
        assert!(cfg.validate().is_err());
    }
}
