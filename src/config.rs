//! Config
//!
//! Timing and detection parameters for a game session, loadable from TOML.
//! Every key is optional and falls back to its default.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pitch::{PitchError, PitchEstimator};

/// Errors raised while loading or validating an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration text was not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value was out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Timing and detection parameters for a game session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Length of the lead-in before play starts, in seconds.
    #[serde(default = "default_countdown")]
    pub countdown_secs: f64,
    /// Time a note takes to fall from the top of the playfield to the hit line.
    #[serde(default = "default_fall_time")]
    pub fall_time_secs: f64,
    /// Half-width of the hit window around a note's scheduled time.
    #[serde(default = "default_hit_window")]
    pub hit_window_secs: f64,
    /// Semitone distance at which a sung note still counts.
    #[serde(default = "default_tolerance")]
    pub tolerance_semitones: u32,
    /// RMS level below which input is treated as silence.
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f32,
    /// Lowest detectable fundamental in Hz.
    #[serde(default = "default_min_frequency")]
    pub min_frequency: f32,
    /// Highest detectable fundamental in Hz.
    #[serde(default = "default_max_frequency")]
    pub max_frequency: f32,
    /// How far ahead of the hit line notes become visible, in seconds.
    #[serde(default = "default_visible_ahead")]
    pub visible_ahead_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            countdown_secs: default_countdown(),
            fall_time_secs: default_fall_time(),
            hit_window_secs: default_hit_window(),
            tolerance_semitones: default_tolerance(),
            silence_threshold: default_silence_threshold(),
            min_frequency: default_min_frequency(),
            max_frequency: default_max_frequency(),
            visible_ahead_secs: default_visible_ahead(),
        }
    }
}

fn default_countdown() -> f64 {
    3.0
}

fn default_fall_time() -> f64 {
    3.0
}

fn default_hit_window() -> f64 {
    0.8
}

fn default_tolerance() -> u32 {
    1
}

fn default_silence_threshold() -> f32 {
    0.015
}

fn default_min_frequency() -> f32 {
    60.0
}

fn default_max_frequency() -> f32 {
    2000.0
}

fn default_visible_ahead() -> f64 {
    5.0
}

impl EngineConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check that every duration is positive and finite.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("countdown_secs", self.countdown_secs),
            ("fall_time_secs", self.fall_time_secs),
            ("hit_window_secs", self.hit_window_secs),
            ("visible_ahead_secs", self.visible_ahead_secs),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Build the pitch estimator described by this configuration.
    pub fn estimator(&self) -> Result<PitchEstimator, PitchError> {
        PitchEstimator::builder()
            .silence_threshold(self.silence_threshold)
            .min_frequency(self.min_frequency)
            .max_frequency(self.max_frequency)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.hit_window_secs, 0.8);
        assert_eq!(config.tolerance_semitones, 1);
    }

    #[test]
    fn partial_document_overrides_some_keys() {
        let config = EngineConfig::from_toml_str(
            "hit_window_secs = 0.5\ntolerance_semitones = 0\nmax_frequency = 1200.0\n",
        )
        .unwrap();
        assert_eq!(config.hit_window_secs, 0.5);
        assert_eq!(config.tolerance_semitones, 0);
        assert_eq!(config.max_frequency, 1200.0);
        assert_eq!(config.countdown_secs, 3.0);
        assert_eq!(config.estimator().unwrap().frequency_range(), (60.0, 1200.0));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = EngineConfig::from_toml_str("fall_time_secs = 0.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = EngineConfig::from_toml_str("hit_window_secs = \"wide\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = EngineConfig::load("/nonexistent/pitch_match.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
