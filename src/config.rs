//! Pipeline configuration
//!
//! Stored as JSON at ~/.config/voxpost/config.json. A missing file means defaults.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard upper bound on a single recording
pub const MAX_RECORDING_CEILING_SECS: u32 = 60;

/// Tunables for capture, playback and visualization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Recording ceiling in seconds
    pub max_recording_secs: u32,
    /// Elapsed-time tracker period
    pub tick_interval_ms: u64,
    /// Waveform sampler period (animation-frame cadence)
    pub frame_interval_ms: u64,
    /// Bars shown while recording
    pub recording_bars: usize,
    /// Bars shown while playing
    pub playback_bars: usize,
    /// Analyser window size, bins = fft_size / 2
    pub fft_size: usize,
    /// Origin used to resolve relative clip URLs
    pub backend_origin: String,
    /// Append a `t=<millis>` query to resolved relative URLs
    pub cache_bust_relative: bool,
    /// Volume a fresh player starts with
    pub default_volume: f32,
    /// How long to wait for the microphone or for playback to start
    pub device_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_recording_secs: MAX_RECORDING_CEILING_SECS,
            tick_interval_ms: 1000,
            frame_interval_ms: 16,
            recording_bars: 40,
            playback_bars: 32,
            fft_size: 256,
            backend_origin: "http://localhost:5000".to_string(),
            cache_bust_relative: true,
            default_volume: 1.0,
            device_timeout_ms: 5000,
        }
    }
}

impl PipelineConfig {
    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxpost")
            .join("config.json")
    }

    /// Load from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load from a specific file, falling back to defaults if it does not exist
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write to a specific file, creating parent directories
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_recording_secs == 0 || self.max_recording_secs > MAX_RECORDING_CEILING_SECS {
            bail!(
                "max_recording_secs must be within 1..={}, got {}",
                MAX_RECORDING_CEILING_SECS,
                self.max_recording_secs
            );
        }
        if self.tick_interval_ms == 0 || self.frame_interval_ms == 0 {
            bail!("tick and frame intervals must be greater than zero");
        }
        if self.recording_bars == 0 || self.playback_bars == 0 {
            bail!("waveform bar counts must be greater than zero");
        }
        if !self.fft_size.is_power_of_two() || self.fft_size < 32 {
            bail!("fft_size must be a power of two >= 32, got {}", self.fft_size);
        }
        if !(0.0..=1.0).contains(&self.default_volume) {
            bail!("default_volume must be within [0, 1], got {}", self.default_volume);
        }
        if self.device_timeout_ms == 0 {
            bail!("device_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }
}
