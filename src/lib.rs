//! Voxpost - voice clip capture and playback
//!
//! The audio pipeline behind a voice-first social client: bounded microphone
//! recording, clip playback, and the live waveform bars shown for both.

pub mod audio;
pub mod cli;
pub mod collab;
pub mod config;
pub mod error;
pub mod settings;

pub use config::PipelineConfig;
pub use error::{AudioError, Result};
