//! PipeWire implementation of the audio capability set

mod analyser;
mod decode;
mod input;
mod output;
mod stream;

pub use analyser::{AnalysisContext, SpectrumAnalyser};
pub use decode::{decode_clip, DecodedClip};
pub use input::{PipeWireInput, WavEncoder};
pub use output::PipeWireMedia;

use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use crate::audio::backend::{AudioBackend, EncoderEvents, MediaEvents};
use crate::config::PipelineConfig;
use crate::error::{AudioError, Result};

/// Audio backend talking to the local PipeWire daemon
pub struct PipeWireBackend {
    fft_size: usize,
    device_timeout: Duration,
    http: reqwest::Client,
}

impl PipeWireBackend {
    pub fn new(fft_size: usize, device_timeout: Duration) -> Self {
        Self {
            fft_size,
            device_timeout,
            http: reqwest::Client::new(),
        }
    }
}

impl From<&PipelineConfig> for PipeWireBackend {
    fn from(config: &PipelineConfig) -> Self {
        Self::new(config.fft_size, config.device_timeout())
    }
}

#[async_trait]
impl AudioBackend for PipeWireBackend {
    type Input = PipeWireInput;
    type Encoder = WavEncoder;
    type Media = PipeWireMedia;

    async fn acquire_input(&self) -> Result<PipeWireInput> {
        debug!("Opening microphone stream");
        let analyser = AnalysisContext::shared().analyser(self.fft_size);
        PipeWireInput::open(analyser, self.device_timeout).await
    }

    fn create_encoder(&self, input: &mut PipeWireInput, events: EncoderEvents) -> Result<WavEncoder> {
        Ok(WavEncoder::attach(input, events))
    }

    fn create_media(&self, url: &str, events: MediaEvents) -> Result<PipeWireMedia> {
        let analyser = AnalysisContext::shared().analyser(self.fft_size);
        PipeWireMedia::load(self.http.clone(), url, events, analyser)
    }
}

/// Map a stream failure message onto the error a caller can act on
pub(crate) fn classify_input_error(reason: &str) -> AudioError {
    let lower = reason.to_lowercase();
    if ["permission", "access denied", "not allowed", "eacces", "eperm"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        AudioError::PermissionDenied
    } else {
        AudioError::DeviceUnavailable(reason.to_string())
    }
}
