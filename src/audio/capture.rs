//! Capture session
//!
//! Owns the microphone handle, its encoder and the elapsed-time tracker for a
//! single recording attempt. Every path out of `Recording`/`Paused` (stop,
//! cancel, ceiling, encoder failure, drop) releases the microphone before
//! returning.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::backend::{AudioBackend, Encoder, EncoderEvent, FrequencyAnalyser, InputStream};
use super::lock;
use super::tracker::{ElapsedTimeTracker, TrackerTick};
use crate::config::PipelineConfig;
use crate::error::{AudioError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
    Stopped,
}

/// A finished recording, ready to hand to the upload collaborator unmodified
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub data: Bytes,
    pub mime_type: String,
    pub duration_seconds: u32,
    pub session_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

impl Clip {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// File extension matching the MIME type
    pub fn extension(&self) -> &'static str {
        match self.mime_type.split(';').next().unwrap_or_default().trim() {
            "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
            "audio/webm" => "webm",
            "audio/ogg" => "ogg",
            "audio/mpeg" => "mp3",
            _ => "bin",
        }
    }

    /// Upload file name, e.g. `post-audio-1718000000000.wav`
    pub fn file_name(&self, prefix: &str) -> String {
        format!(
            "{}-{}.{}",
            prefix,
            self.recorded_at.timestamp_millis(),
            self.extension()
        )
    }
}

/// Snapshot published to observers on every change
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureStatus {
    pub state: RecordingState,
    pub elapsed_seconds: u32,
    pub remaining_seconds: u32,
    pub error: Option<AudioError>,
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub ceiling_secs: u32,
    pub tick_interval: Duration,
}

impl From<&PipelineConfig> for CaptureOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            ceiling_secs: config.max_recording_secs,
            tick_interval: config.tick_interval(),
        }
    }
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

struct CaptureInner<B: AudioBackend> {
    state: RecordingState,
    /// Bumped whenever the live handles are torn down; callbacks carrying an
    /// older value exit without touching anything
    generation: u64,
    session_id: Option<Uuid>,
    mime_type: String,
    input: Option<B::Input>,
    encoder: Option<B::Encoder>,
    chunks: Vec<Vec<u8>>,
    tracker: ElapsedTimeTracker,
    pump: Option<JoinHandle<()>>,
    finished: Option<Clip>,
    last_error: Option<AudioError>,
    status: watch::Sender<CaptureStatus>,
}

impl<B: AudioBackend> CaptureInner<B> {
    fn publish(&self) {
        let status = CaptureStatus {
            state: self.state,
            elapsed_seconds: self.tracker.elapsed(),
            remaining_seconds: self.tracker.remaining(),
            error: self.last_error.clone(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn set_state(&mut self, state: RecordingState) {
        if self.state != state {
            debug!("Capture state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    /// Invalidate callbacks and release every native handle. Returns the
    /// encoder's final fragment, if an encoder was live.
    fn teardown(&mut self, finalize: bool) -> Option<Result<Vec<u8>>> {
        self.generation += 1;
        self.tracker.stop();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }

        let tail = self.encoder.take().map(|mut encoder| {
            if finalize {
                encoder.stop()
            } else {
                let _ = encoder.stop();
                Ok(Vec::new())
            }
        });

        if let Some(mut input) = self.input.take() {
            input.release();
            debug!("Microphone released ({:?})", self.session_id);
        }

        tail
    }

    /// Flush buffered fragments into a clip and move to `Stopped`
    fn finish(&mut self) -> Result<Clip> {
        let tail = self.teardown(true);
        match tail {
            Some(Ok(data)) if !data.is_empty() => self.chunks.push(data),
            Some(Err(e)) => {
                error!("Encoder failed to finalize: {}", e);
                if self.chunks.is_empty() {
                    return Err(self.fail(e));
                }
            }
            _ => {}
        }

        if self.chunks.is_empty() {
            return Err(self.fail(AudioError::EncodingFailure(
                "no audio was captured".to_string(),
            )));
        }

        let data = Bytes::from(self.chunks.concat());
        self.chunks.clear();
        let clip = Clip {
            data,
            mime_type: self.mime_type.clone(),
            duration_seconds: self.tracker.elapsed(),
            session_id: self.session_id.unwrap_or_else(Uuid::new_v4),
            recorded_at: Utc::now(),
        };
        info!(
            "Recording {} finished: {}s, {} bytes",
            clip.session_id,
            clip.duration_seconds,
            clip.len()
        );
        self.finished = Some(clip.clone());
        self.set_state(RecordingState::Stopped);
        Ok(clip)
    }

    /// Record an error and return to `Idle` with nothing buffered
    fn fail(&mut self, err: AudioError) -> AudioError {
        self.chunks.clear();
        self.last_error = Some(err.clone());
        self.set_state(RecordingState::Idle);
        err
    }

    /// The pipeline stopped on its own: keep what we have, if anything
    fn salvage(&mut self, reason: String) {
        error!("Capture pipeline failed mid-recording: {}", reason);
        if let Ok(clip) = self.finish() {
            warn!("Salvaged {} bytes from the failed recording", clip.len());
        }
        self.last_error = Some(AudioError::EncodingFailure(reason));
        self.publish();
    }
}

/// One logical capture attempt at a time, recreated by `start` after
/// `Stopped` or `Idle`. Failures land in `Idle` with the error kept in the
/// status.
pub struct CaptureSession<B: AudioBackend> {
    backend: Arc<B>,
    shared: Arc<Mutex<CaptureInner<B>>>,
    status: watch::Receiver<CaptureStatus>,
}

impl<B: AudioBackend> CaptureSession<B> {
    pub fn new(backend: Arc<B>, options: CaptureOptions) -> Self {
        let tracker = ElapsedTimeTracker::new(options.ceiling_secs, options.tick_interval);
        let initial = CaptureStatus {
            state: RecordingState::Idle,
            elapsed_seconds: 0,
            remaining_seconds: tracker.ceiling(),
            error: None,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        Self {
            backend,
            shared: Arc::new(Mutex::new(CaptureInner {
                state: RecordingState::Idle,
                generation: 0,
                session_id: None,
                mime_type: "audio/wav".to_string(),
                input: None,
                encoder: None,
                chunks: Vec::new(),
                tracker,
                pump: None,
                finished: None,
                last_error: None,
                status: status_tx,
            })),
            status: status_rx,
        }
    }

    /// Acquire the microphone and begin recording
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut inner = lock(&self.shared);
            match inner.state {
                RecordingState::Idle | RecordingState::Stopped => {}
                state => {
                    warn!("Ignoring start while {:?}", state);
                    return Err(AudioError::invalid_state("start recording", state));
                }
            }
            // A fresh attempt discards the previous clip
            inner.teardown(false);
            inner.finished = None;
            inner.chunks.clear();
            inner.last_error = None;
            inner.tracker.reset();
            inner.set_state(RecordingState::Idle);
        }

        let mut input = match self.backend.acquire_input().await {
            Ok(input) => input,
            Err(err) => {
                warn!("Microphone unavailable: {}", err);
                lock(&self.shared).fail(err.clone());
                return Err(err);
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut encoder = match self.backend.create_encoder(&mut input, events_tx) {
            Ok(encoder) => encoder,
            Err(err) => {
                input.release();
                let err = into_encoding_failure(err);
                error!("Could not create encoder: {}", err);
                lock(&self.shared).fail(err.clone());
                return Err(err);
            }
        };
        if let Err(err) = encoder.start() {
            let _ = encoder.stop();
            input.release();
            let err = into_encoding_failure(err);
            error!("Could not start encoder: {}", err);
            lock(&self.shared).fail(err.clone());
            return Err(err);
        }
        let session_id = Uuid::new_v4();
        let mut inner = lock(&self.shared);
        inner.mime_type = encoder.mime_type().to_string();
        inner.generation += 1;
        let generation = inner.generation;
        inner.session_id = Some(session_id);
        inner.input = Some(input);
        inner.encoder = Some(encoder);

        let weak = Arc::downgrade(&self.shared);
        inner.tracker.start(move |tick| on_tracker_tick(&weak, generation, tick));
        inner.pump = Some(tokio::spawn(pump_encoder_events(
            Arc::downgrade(&self.shared),
            generation,
            events_rx,
        )));

        info!("Recording {} started", session_id);
        inner.set_state(RecordingState::Recording);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        let mut inner = lock(&self.shared);
        if inner.state != RecordingState::Recording {
            warn!("Ignoring pause while {:?}", inner.state);
            return Err(AudioError::invalid_state("pause recording", inner.state));
        }

        if let Some(encoder) = inner.encoder.as_mut() {
            if let Err(e) = encoder.pause() {
                warn!("Encoder did not pause cleanly: {}", e);
            }
        }
        inner.tracker.pause();
        inner.set_state(RecordingState::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        let mut inner = lock(&self.shared);
        if inner.state != RecordingState::Paused {
            warn!("Ignoring resume while {:?}", inner.state);
            return Err(AudioError::invalid_state("resume recording", inner.state));
        }

        if let Some(encoder) = inner.encoder.as_mut() {
            if let Err(e) = encoder.resume() {
                warn!("Encoder did not resume cleanly: {}", e);
            }
        }
        inner.tracker.resume();
        inner.set_state(RecordingState::Recording);
        Ok(())
    }

    /// Finalize the encoder, release the microphone and return the clip
    pub fn stop(&mut self) -> Result<Clip> {
        let mut inner = lock(&self.shared);
        match inner.state {
            RecordingState::Recording | RecordingState::Paused => inner.finish(),
            state => {
                warn!("Ignoring stop while {:?}", state);
                Err(AudioError::invalid_state("stop recording", state))
            }
        }
    }

    /// Discard everything and return to `Idle`. Safe to call repeatedly and
    /// from any state.
    pub fn cancel(&mut self) {
        let mut inner = lock(&self.shared);
        if inner.state == RecordingState::Idle && inner.input.is_none() && inner.encoder.is_none()
        {
            debug!("Cancel while idle, nothing to release");
            return;
        }

        inner.teardown(false);
        inner.chunks.clear();
        inner.finished = None;
        inner.last_error = None;
        inner.tracker.reset();
        if let Some(id) = inner.session_id.take() {
            info!("Recording {} cancelled", id);
        }
        inner.set_state(RecordingState::Idle);
    }

    /// Take the clip produced by an automatic stop (ceiling or salvage)
    pub fn take_clip(&mut self) -> Option<Clip> {
        lock(&self.shared).finished.take()
    }

    pub fn state(&self) -> RecordingState {
        lock(&self.shared).state
    }

    pub fn elapsed_seconds(&self) -> u32 {
        lock(&self.shared).tracker.elapsed()
    }

    pub fn remaining_seconds(&self) -> u32 {
        lock(&self.shared).tracker.remaining()
    }

    pub fn ceiling_seconds(&self) -> u32 {
        lock(&self.shared).tracker.ceiling()
    }

    pub fn last_error(&self) -> Option<AudioError> {
        lock(&self.shared).last_error.clone()
    }

    pub fn mime_type(&self) -> String {
        lock(&self.shared).mime_type.clone()
    }

    /// Whether the microphone is currently held
    pub fn holds_input(&self) -> bool {
        lock(&self.shared).input.is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureStatus> {
        self.status.clone()
    }

    /// Frequency tap on the live input, while one exists
    pub fn analyser(&self) -> Option<Arc<dyn FrequencyAnalyser>> {
        lock(&self.shared).input.as_ref().map(|input| input.analyser())
    }

    /// A liveness check for samplers: true only while this exact recording is
    /// in the `Recording` state
    pub fn recording_probe(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.shared);
        let generation = lock(&self.shared).generation;
        move || {
            weak.upgrade().is_some_and(|shared| {
                let inner = lock(&shared);
                inner.generation == generation && inner.state == RecordingState::Recording
            })
        }
    }
}

impl<B: AudioBackend> Drop for CaptureSession<B> {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn into_encoding_failure(err: AudioError) -> AudioError {
    match err {
        AudioError::EncodingFailure(_) => err,
        other => AudioError::EncodingFailure(other.to_string()),
    }
}

fn on_tracker_tick<B: AudioBackend>(
    weak: &Weak<Mutex<CaptureInner<B>>>,
    generation: u64,
    tick: TrackerTick,
) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let mut inner = lock(&shared);
    if inner.generation != generation || inner.state != RecordingState::Recording {
        return;
    }

    match tick {
        TrackerTick::Counted(_) => inner.publish(),
        TrackerTick::LimitReached(secs) => {
            info!("Recording ceiling of {}s reached, stopping", secs);
            if let Err(e) = inner.finish() {
                error!("Automatic stop failed: {}", e);
            }
        }
    }
}

async fn pump_encoder_events<B: AudioBackend>(
    weak: Weak<Mutex<CaptureInner<B>>>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<EncoderEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = weak.upgrade() else {
            break;
        };
        let mut inner = lock(&shared);
        if inner.generation != generation {
            break;
        }

        match event {
            EncoderEvent::Data(chunk) => {
                if !chunk.is_empty() {
                    inner.chunks.push(chunk);
                }
            }
            EncoderEvent::Failed(reason) => {
                inner.salvage(reason);
                break;
            }
        }
    }
}
