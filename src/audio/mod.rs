//! Voice clip audio pipeline
//!
//! This module provides:
//! - Microphone capture with a hard recording ceiling
//! - Playback of remote or local clips with seek, volume and mute
//! - Live waveform bars for both directions
//! - A PipeWire backend with an FFT spectrum analyser
//! - WAV encoding via hound

mod backend;
mod capture;
mod player;
mod playback;
pub mod pipewire;
mod recorder;
mod source;
mod task;
mod tracker;
mod wav;
mod waveform;

#[cfg(test)]
pub(crate) mod fake;

pub use backend::{
    resolved_confirmation, AudioBackend, Encoder, EncoderEvent, EncoderEvents, FrequencyAnalyser,
    InputStream, MediaEvent, MediaEvents, MediaHandle, PlayConfirmation,
};
pub use capture::{CaptureOptions, CaptureSession, CaptureStatus, Clip, RecordingState};
pub use playback::{PlaybackOptions, PlaybackSession, PlaybackState, PlaybackStatus};
pub use player::VoicePlayer;
pub use recorder::VoiceRecorder;
pub use source::resolve_source_url;
pub use task::RepeatingTask;
pub use tracker::{format_time, ElapsedTimeTracker, TrackerState, TrackerTick};
pub use wav::{encode_wav, ClipStore};
pub use waveform::{downsample, Downsample, WaveformFrame, WaveformSampler, MAX_LEVEL, MIN_LEVEL};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock shared session state. A panic in a callback must not wedge the
/// session, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
