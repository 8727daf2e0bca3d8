//! WAV encoding and the local clip store, using hound
//!
//! Clips are 16-bit PCM mono, which every upload target accepts and which
//! hound can write straight into memory.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use super::capture::Clip;

/// Encode mono f32 samples as a 16-bit PCM WAV file in memory
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, String> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| format!("Failed to create WAV writer: {}", e))?;
        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(value)
                .map_err(|e| format!("Failed to write sample: {}", e))?;
        }
        writer
            .finalize()
            .map_err(|e| format!("Failed to finalize WAV data: {}", e))?;
    }

    Ok(cursor.into_inner())
}

/// Duration of `sample_count` mono samples in seconds
pub fn duration_seconds(sample_count: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    sample_count as f64 / sample_rate as f64
}

/// Finished clips saved on disk
pub struct ClipStore {
    recordings_dir: PathBuf,
}

impl ClipStore {
    pub fn new() -> Self {
        let recordings_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxpost")
            .join("recordings");

        Self { recordings_dir }
    }

    pub fn with_recordings_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.recordings_dir = dir.as_ref().to_path_buf();
        self
    }

    fn ensure_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.recordings_dir)
    }

    /// Unique path for a new clip with the given extension
    fn generate_filename(&self, extension: &str) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let uuid = uuid::Uuid::new_v4().to_string()[..8].to_string();
        self.recordings_dir
            .join(format!("recording_{}_{}.{}", timestamp, uuid, extension))
    }

    /// Write the clip bytes unmodified. Returns the path written.
    pub fn save(&self, clip: &Clip, filename: Option<&Path>) -> Result<PathBuf, String> {
        let path = match filename {
            Some(p) => p.to_path_buf(),
            None => {
                self.ensure_dir()
                    .map_err(|e| format!("Failed to create recordings directory: {}", e))?;
                self.generate_filename(clip.extension())
            }
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }
        fs::write(&path, &clip.data).map_err(|e| format!("Failed to write clip: {}", e))?;

        Ok(path)
    }
}

impl Default for ClipStore {
    fn default() -> Self {
        Self::new()
    }
}
