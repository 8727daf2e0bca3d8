//! Scripted in-memory backend for session tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use super::backend::{
    resolved_confirmation, AudioBackend, Encoder, EncoderEvent, EncoderEvents, FrequencyAnalyser,
    InputStream, MediaEvent, MediaEvents, MediaHandle, PlayConfirmation,
};
use super::lock;
use crate::error::{AudioError, Result};

/// Constant-level analyser
pub struct FakeAnalyser {
    bins: usize,
    level: AtomicU8,
}

impl FakeAnalyser {
    pub fn new(bins: usize) -> Self {
        Self {
            bins,
            level: AtomicU8::new(0),
        }
    }

    pub fn set_level(&self, level: u8) {
        self.level.store(level, Ordering::SeqCst);
    }
}

impl FrequencyAnalyser for FakeAnalyser {
    fn frequency_bin_count(&self) -> usize {
        self.bins
    }

    fn byte_frequency_data(&self, out: &mut [u8]) {
        let level = self.level.load(Ordering::SeqCst);
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = if i < self.bins { level } else { 0 };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    NoDevice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayBehavior {
    Confirm,
    Reject(String),
    /// Hold the confirmation until [`FakeBackend::confirm_play`]
    Manual,
}

struct FakeState {
    permission: Permission,
    acquire_delay: Duration,
    inputs_acquired: usize,
    inputs_released: usize,
    double_releases: usize,
    encoder_calls: Vec<&'static str>,
    encoder_events: Option<EncoderEvents>,
    encoder_tail: Vec<u8>,
    encoder_start_error: Option<String>,
    media_created: usize,
    media_released: usize,
    media_urls: Vec<String>,
    media_events: Option<MediaEvents>,
    media_error: Option<String>,
    media_calls: Vec<String>,
    position: f64,
    volume: f32,
    play_behavior: PlayBehavior,
    pending_play: Option<oneshot::Sender<Result<()>>>,
}

pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
    analyser: Arc<FakeAnalyser>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                permission: Permission::Granted,
                acquire_delay: Duration::ZERO,
                inputs_acquired: 0,
                inputs_released: 0,
                double_releases: 0,
                encoder_calls: Vec::new(),
                encoder_events: None,
                encoder_tail: vec![0x52, 0x49, 0x46, 0x46],
                encoder_start_error: None,
                media_created: 0,
                media_released: 0,
                media_urls: Vec::new(),
                media_events: None,
                media_error: None,
                media_calls: Vec::new(),
                position: 0.0,
                volume: 1.0,
                play_behavior: PlayBehavior::Confirm,
                pending_play: None,
            })),
            analyser: Arc::new(FakeAnalyser::new(128)),
        }
    }

    pub fn analyser(&self) -> Arc<FakeAnalyser> {
        self.analyser.clone()
    }

    pub fn set_permission(&self, permission: Permission) {
        lock(&self.state).permission = permission;
    }

    pub fn set_acquire_delay(&self, delay: Duration) {
        lock(&self.state).acquire_delay = delay;
    }

    pub fn set_encoder_tail(&self, tail: Vec<u8>) {
        lock(&self.state).encoder_tail = tail;
    }

    pub fn fail_encoder_start(&self, reason: &str) {
        lock(&self.state).encoder_start_error = Some(reason.to_string());
    }

    pub fn fail_media_creation(&self, reason: &str) {
        lock(&self.state).media_error = Some(reason.to_string());
    }

    pub fn set_play_behavior(&self, behavior: PlayBehavior) {
        lock(&self.state).play_behavior = behavior;
    }

    /// Resolve a confirmation held by [`PlayBehavior::Manual`]
    pub fn confirm_play(&self, result: Result<()>) -> bool {
        match lock(&self.state).pending_play.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn emit_encoder(&self, event: EncoderEvent) {
        if let Some(tx) = lock(&self.state).encoder_events.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Send an event through the most recently created media handle
    pub fn emit_media(&self, event: MediaEvent) {
        let mut state = lock(&self.state);
        if let MediaEvent::TimeUpdate(t) = event {
            state.position = t;
        }
        if let Some(tx) = state.media_events.as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn live_inputs(&self) -> usize {
        let state = lock(&self.state);
        state.inputs_acquired - state.inputs_released
    }

    pub fn inputs_acquired(&self) -> usize {
        lock(&self.state).inputs_acquired
    }

    pub fn inputs_released(&self) -> usize {
        lock(&self.state).inputs_released
    }

    pub fn double_releases(&self) -> usize {
        lock(&self.state).double_releases
    }

    pub fn encoder_calls(&self) -> Vec<&'static str> {
        lock(&self.state).encoder_calls.clone()
    }

    pub fn live_media(&self) -> usize {
        let state = lock(&self.state);
        state.media_created - state.media_released
    }

    pub fn media_created(&self) -> usize {
        lock(&self.state).media_created
    }

    pub fn media_urls(&self) -> Vec<String> {
        lock(&self.state).media_urls.clone()
    }

    pub fn media_calls(&self) -> Vec<String> {
        lock(&self.state).media_calls.clone()
    }

    pub fn volume(&self) -> f32 {
        lock(&self.state).volume
    }
}

#[async_trait]
impl AudioBackend for FakeBackend {
    type Input = FakeInput;
    type Encoder = FakeEncoder;
    type Media = FakeMedia;

    async fn acquire_input(&self) -> Result<FakeInput> {
        let (permission, delay) = {
            let state = lock(&self.state);
            (state.permission, state.acquire_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match permission {
            Permission::Denied => Err(AudioError::PermissionDenied),
            Permission::NoDevice => Err(AudioError::DeviceUnavailable(
                "no capture device".to_string(),
            )),
            Permission::Granted => {
                lock(&self.state).inputs_acquired += 1;
                Ok(FakeInput {
                    state: self.state.clone(),
                    analyser: self.analyser.clone(),
                    released: false,
                })
            }
        }
    }

    fn create_encoder(&self, _input: &mut FakeInput, events: EncoderEvents) -> Result<FakeEncoder> {
        lock(&self.state).encoder_events = Some(events);
        Ok(FakeEncoder {
            state: self.state.clone(),
        })
    }

    fn create_media(&self, url: &str, events: MediaEvents) -> Result<FakeMedia> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.media_error.clone() {
            return Err(AudioError::LoadFailure(reason));
        }
        state.media_created += 1;
        state.media_urls.push(url.to_string());
        state.media_events = Some(events);
        state.position = 0.0;
        Ok(FakeMedia {
            state: self.state.clone(),
            analyser: self.analyser.clone(),
            released: false,
        })
    }
}

pub struct FakeInput {
    state: Arc<Mutex<FakeState>>,
    analyser: Arc<FakeAnalyser>,
    released: bool,
}

impl InputStream for FakeInput {
    fn analyser(&self) -> Arc<dyn FrequencyAnalyser> {
        self.analyser.clone()
    }

    fn release(&mut self) {
        let mut state = lock(&self.state);
        if self.released {
            state.double_releases += 1;
            return;
        }
        self.released = true;
        state.inputs_released += 1;
    }

    fn is_live(&self) -> bool {
        !self.released
    }
}

impl Drop for FakeInput {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}

pub struct FakeEncoder {
    state: Arc<Mutex<FakeState>>,
}

impl Encoder for FakeEncoder {
    fn start(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.encoder_start_error.clone() {
            return Err(AudioError::EncodingFailure(reason));
        }
        state.encoder_calls.push("start");
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        lock(&self.state).encoder_calls.push("pause");
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        lock(&self.state).encoder_calls.push("resume");
        Ok(())
    }

    fn stop(&mut self) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        state.encoder_calls.push("stop");
        state.encoder_events = None;
        Ok(state.encoder_tail.clone())
    }

    fn mime_type(&self) -> &str {
        "audio/wav"
    }
}

pub struct FakeMedia {
    state: Arc<Mutex<FakeState>>,
    analyser: Arc<FakeAnalyser>,
    released: bool,
}

impl MediaHandle for FakeMedia {
    fn play(&mut self) -> PlayConfirmation {
        let mut state = lock(&self.state);
        state.media_calls.push("play".to_string());
        match state.play_behavior.clone() {
            PlayBehavior::Confirm => resolved_confirmation(Ok(())),
            PlayBehavior::Reject(reason) => {
                resolved_confirmation(Err(AudioError::PlaybackRejected(reason)))
            }
            PlayBehavior::Manual => {
                let (tx, rx) = oneshot::channel();
                state.pending_play = Some(tx);
                rx
            }
        }
    }

    fn pause(&mut self) {
        lock(&self.state).media_calls.push("pause".to_string());
    }

    fn seek(&mut self, seconds: f64) {
        let mut state = lock(&self.state);
        state.media_calls.push(format!("seek {}", seconds));
        state.position = seconds;
    }

    fn current_time(&self) -> f64 {
        lock(&self.state).position
    }

    fn set_volume(&mut self, volume: f32) {
        lock(&self.state).volume = volume;
    }

    fn analyser(&self) -> Arc<dyn FrequencyAnalyser> {
        self.analyser.clone()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = lock(&self.state);
        state.media_released += 1;
        state.media_calls.push("release".to_string());
    }
}

impl Drop for FakeMedia {
    fn drop(&mut self) {
        self.release();
    }
}
