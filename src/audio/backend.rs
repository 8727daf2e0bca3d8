//! Platform capability set
//!
//! Sessions never touch native audio APIs directly. They go through an
//! [`AudioBackend`], which the PipeWire binding implements in production and
//! a scripted fake implements in tests.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{AudioError, Result};

/// Events an encoder reports while it is running
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    /// A fragment of encoded data, appended in order
    Data(Vec<u8>),
    /// The pipeline stopped on its own
    Failed(String),
}

/// Events a playable handle reports
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// Enough of the stream was decoded to know its length
    LoadedMetadata { duration: f64 },
    /// Current playback position in seconds
    TimeUpdate(f64),
    /// Natural end of the clip
    Ended,
    /// Load, decode or output failure
    Error(String),
}

pub type EncoderEvents = mpsc::UnboundedSender<EncoderEvent>;
pub type MediaEvents = mpsc::UnboundedSender<MediaEvent>;

/// Resolves once the runtime confirms playback really started (or refused it)
pub type PlayConfirmation = oneshot::Receiver<Result<()>>;

/// Read-only frequency tap on a live signal
pub trait FrequencyAnalyser: Send + Sync {
    /// Number of frequency bins available per read
    fn frequency_bin_count(&self) -> usize;

    /// Fill `out` with current bin energies scaled to 0..=255.
    /// Extra slots beyond the bin count are zeroed.
    fn byte_frequency_data(&self, out: &mut [u8]);
}

/// Exclusively owned microphone handle
pub trait InputStream: Send + 'static {
    fn analyser(&self) -> Arc<dyn FrequencyAnalyser>;

    /// Release the hardware. Must be synchronous and idempotent.
    fn release(&mut self);

    fn is_live(&self) -> bool;
}

/// Encoder bound 1:1 to an [`InputStream`]
pub trait Encoder: Send + 'static {
    fn start(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;

    /// Finalize and return the last buffered fragment
    fn stop(&mut self) -> Result<Vec<u8>>;

    fn mime_type(&self) -> &str;
}

/// Exclusively owned decodable audio handle for one source
pub trait MediaHandle: Send + 'static {
    /// Ask the runtime to start playing
    fn play(&mut self) -> PlayConfirmation;
    fn pause(&mut self);
    fn seek(&mut self, seconds: f64);
    fn current_time(&self) -> f64;
    fn set_volume(&mut self, volume: f32);
    fn analyser(&self) -> Arc<dyn FrequencyAnalyser>;

    /// Detach listeners and free the native handle. Must be idempotent.
    fn release(&mut self);
}

#[async_trait]
pub trait AudioBackend: Send + Sync + 'static {
    type Input: InputStream;
    type Encoder: Encoder;
    type Media: MediaHandle;

    /// Request microphone access; may wait on a permission prompt
    async fn acquire_input(&self) -> Result<Self::Input>;

    fn create_encoder(&self, input: &mut Self::Input, events: EncoderEvents) -> Result<Self::Encoder>;

    fn create_media(&self, url: &str, events: MediaEvents) -> Result<Self::Media>;
}

/// A play confirmation that has already resolved
pub fn resolved_confirmation(result: Result<()>) -> PlayConfirmation {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

/// Map a dropped confirmation channel into a rejection
pub(crate) fn confirmation_lost(_: oneshot::error::RecvError) -> Result<()> {
    Err(AudioError::PlaybackRejected(
        "playback handle went away before confirming".to_string(),
    ))
}
