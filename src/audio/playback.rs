//! Playback session
//!
//! Owns at most one decodable media handle at a time. Loading a new source
//! always tears the old handle down first, and every event coming back from
//! a handle is checked against the session generation before it is applied.

use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::backend::{confirmation_lost, AudioBackend, FrequencyAnalyser, MediaEvent, MediaHandle};
use super::lock;
use super::source::resolve_source_url;
use crate::config::PipelineConfig;
use crate::error::{AudioError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Ended,
    Error,
}

/// Snapshot published to observers on every change
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub position: f64,
    /// Unknown until metadata has loaded
    pub duration: Option<f64>,
    pub volume: f32,
    pub muted: bool,
    /// A play request is waiting for the runtime to confirm
    pub is_starting: bool,
    pub error: Option<AudioError>,
    pub source_url: Option<String>,
}

impl PlaybackStatus {
    pub fn effective_volume(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }

    /// Position as a percentage of the duration, 0 when unknown
    pub fn progress_percent(&self) -> f64 {
        match self.duration {
            Some(d) if d > 0.0 => (self.position / d * 100.0).clamp(0.0, 100.0),
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaybackOptions {
    pub backend_origin: String,
    pub cache_bust: bool,
    pub volume: f32,
    pub muted: bool,
    /// Upper bound on waiting for a play confirmation
    pub play_timeout: Duration,
}

impl From<&PipelineConfig> for PlaybackOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            backend_origin: config.backend_origin.clone(),
            cache_bust: config.cache_bust_relative,
            volume: config.default_volume,
            muted: false,
            play_timeout: config.device_timeout(),
        }
    }
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

struct PlaybackInner<B: AudioBackend> {
    state: PlaybackState,
    generation: u64,
    /// Bumped when an in-flight play request is superseded
    play_epoch: u64,
    media: Option<B::Media>,
    source: Option<String>,
    url: Option<String>,
    position: f64,
    duration: Option<f64>,
    volume: f32,
    muted: bool,
    last_audible: f32,
    is_starting: bool,
    last_error: Option<AudioError>,
    pump: Option<JoinHandle<()>>,
    status: watch::Sender<PlaybackStatus>,
}

impl<B: AudioBackend> PlaybackInner<B> {
    fn snapshot(&self) -> PlaybackStatus {
        PlaybackStatus {
            state: self.state,
            position: self.position,
            duration: self.duration,
            volume: self.volume,
            muted: self.muted,
            is_starting: self.is_starting,
            error: self.last_error.clone(),
            source_url: self.url.clone(),
        }
    }

    fn publish(&self) {
        let status = self.snapshot();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            debug!("Playback state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    fn effective_volume(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }

    fn apply_volume(&mut self) {
        let effective = self.effective_volume();
        if let Some(media) = self.media.as_mut() {
            media.set_volume(effective);
        }
        self.publish();
    }

    fn clamp_position(&self, seconds: f64) -> f64 {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        match self.duration {
            Some(d) => seconds.min(d),
            None => seconds,
        }
    }

    /// Invalidate callbacks and free the native handle
    fn release_media(&mut self) {
        self.generation += 1;
        self.play_epoch += 1;
        self.is_starting = false;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(mut media) = self.media.take() {
            if self.state == PlaybackState::Playing {
                media.pause();
            }
            media.release();
            debug!("Media handle released ({:?})", self.url);
        }
    }

    fn fail(&mut self, err: AudioError) -> AudioError {
        error!("Playback failed: {}", err);
        self.release_media();
        self.last_error = Some(err.clone());
        self.set_state(PlaybackState::Error);
        err
    }
}

pub struct PlaybackSession<B: AudioBackend> {
    backend: Arc<B>,
    shared: Arc<Mutex<PlaybackInner<B>>>,
    status: watch::Receiver<PlaybackStatus>,
    options: PlaybackOptions,
}

impl<B: AudioBackend> PlaybackSession<B> {
    pub fn new(backend: Arc<B>, options: PlaybackOptions) -> Self {
        let volume = sanitize_volume(options.volume);
        let muted = options.muted || volume == 0.0;
        let initial = PlaybackStatus {
            state: PlaybackState::Idle,
            position: 0.0,
            duration: None,
            volume,
            muted,
            is_starting: false,
            error: None,
            source_url: None,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        Self {
            backend,
            shared: Arc::new(Mutex::new(PlaybackInner {
                state: PlaybackState::Idle,
                generation: 0,
                play_epoch: 0,
                media: None,
                source: None,
                url: None,
                position: 0.0,
                duration: None,
                volume,
                muted,
                last_audible: if volume > 0.0 { volume } else { 1.0 },
                is_starting: false,
                last_error: None,
                pump: None,
                status: status_tx,
            })),
            status: status_rx,
            options,
        }
    }

    /// Tear down any current handle, then create one for `source`
    pub fn load(&mut self, source: &str) -> Result<()> {
        self.destroy();

        let mut inner = lock(&self.shared);
        inner.source = Some(source.to_string());
        inner.last_error = None;

        let url = match resolve_source_url(
            source,
            &self.options.backend_origin,
            self.options.cache_bust,
        ) {
            Ok(url) => url,
            Err(err) => return Err(inner.fail(err)),
        };
        inner.url = Some(url.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut media = match self.backend.create_media(&url, events_tx) {
            Ok(media) => media,
            Err(err) => {
                let err = match err {
                    AudioError::LoadFailure(_) => err,
                    other => AudioError::LoadFailure(other.to_string()),
                };
                return Err(inner.fail(err));
            }
        };
        media.set_volume(inner.effective_volume());

        inner.generation += 1;
        let generation = inner.generation;
        inner.media = Some(media);
        inner.pump = Some(tokio::spawn(pump_media_events(
            Arc::downgrade(&self.shared),
            generation,
            events_rx,
        )));

        info!("Loading {}", url);
        inner.set_state(PlaybackState::Loading);
        Ok(())
    }

    /// Load the last source again after a failure
    pub fn retry(&mut self) -> Result<()> {
        let source = lock(&self.shared).source.clone();
        match source {
            Some(source) => {
                info!("Retrying {}", source);
                self.load(&source)
            }
            None => {
                let state = self.state();
                warn!("Nothing to retry while {:?}", state);
                Err(AudioError::invalid_state("retry playback", state))
            }
        }
    }

    /// Start playing and wait for the runtime to confirm it actually started
    pub async fn play(&self) -> Result<()> {
        let (confirmation, generation, epoch, from) = {
            let mut inner = lock(&self.shared);
            if inner.is_starting {
                warn!("Play already in flight");
                return Err(AudioError::invalid_state("play", inner.state));
            }
            match inner.state {
                PlaybackState::Ready | PlaybackState::Paused | PlaybackState::Ended => {}
                state => {
                    warn!("Ignoring play while {:?}", state);
                    return Err(AudioError::invalid_state("play", state));
                }
            }

            if inner.state == PlaybackState::Ended {
                if let Some(media) = inner.media.as_mut() {
                    media.seek(0.0);
                }
                inner.position = 0.0;
                inner.state = PlaybackState::Paused;
            }
            let Some(confirmation) = inner.media.as_mut().map(|media| media.play()) else {
                return Err(AudioError::invalid_state("play", inner.state));
            };
            inner.is_starting = true;
            inner.last_error = None;
            inner.publish();
            (confirmation, inner.generation, inner.play_epoch, inner.state)
        };

        let outcome = match tokio::time::timeout(self.options.play_timeout, confirmation).await {
            Ok(Ok(result)) => result,
            Ok(Err(lost)) => confirmation_lost(lost),
            Err(_) => Err(AudioError::PlaybackRejected(
                "timed out waiting for playback to start".to_string(),
            )),
        };

        let mut inner = lock(&self.shared);
        if inner.generation != generation {
            return Err(inner.last_error.clone().unwrap_or_else(|| {
                AudioError::PlaybackRejected("the clip was unloaded".to_string())
            }));
        }
        if inner.play_epoch != epoch {
            return Err(AudioError::PlaybackRejected(
                "paused before playback started".to_string(),
            ));
        }
        inner.is_starting = false;

        match outcome {
            Ok(()) => {
                if inner.state == from {
                    info!("Playing {:?}", inner.url);
                    inner.set_state(PlaybackState::Playing);
                } else {
                    inner.publish();
                }
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    AudioError::PlaybackRejected(_) => err,
                    other => AudioError::PlaybackRejected(other.to_string()),
                };
                warn!("Play rejected: {}", err);
                if let Some(media) = inner.media.as_mut() {
                    media.pause();
                }
                inner.last_error = Some(err.clone());
                inner.publish();
                Err(err)
            }
        }
    }

    pub fn pause(&self) -> Result<()> {
        let mut inner = lock(&self.shared);
        if inner.is_starting {
            inner.play_epoch += 1;
            inner.is_starting = false;
            if let Some(media) = inner.media.as_mut() {
                media.pause();
            }
            inner.set_state(PlaybackState::Paused);
            return Ok(());
        }
        if inner.state != PlaybackState::Playing {
            warn!("Ignoring pause while {:?}", inner.state);
            return Err(AudioError::invalid_state("pause", inner.state));
        }

        let current = inner.media.as_mut().map(|media| {
            media.pause();
            media.current_time()
        });
        if let Some(seconds) = current {
            inner.position = inner.clamp_position(seconds);
        }
        inner.set_state(PlaybackState::Paused);
        Ok(())
    }

    /// Jump to `seconds`, clamped to the clip. Returns the applied position.
    pub fn seek(&self, seconds: f64) -> Result<f64> {
        let mut inner = lock(&self.shared);
        if inner.media.is_none() || inner.duration.is_none() {
            warn!("Ignoring seek while {:?}", inner.state);
            return Err(AudioError::invalid_state("seek", inner.state));
        }

        let target = inner.clamp_position(seconds);
        inner.position = target;
        if let Some(media) = inner.media.as_mut() {
            media.seek(target);
        }
        if inner.state == PlaybackState::Ended {
            inner.set_state(PlaybackState::Paused);
        } else {
            inner.publish();
        }
        Ok(target)
    }

    pub fn set_volume(&self, volume: f32) {
        let mut inner = lock(&self.shared);
        let volume = sanitize_volume(volume);
        inner.volume = volume;
        if volume > 0.0 {
            inner.last_audible = volume;
            inner.muted = false;
        } else {
            inner.muted = true;
        }
        inner.apply_volume();
    }

    /// Flip mute. Unmuting at zero volume restores the last audible level.
    pub fn toggle_mute(&self) -> bool {
        let mut inner = lock(&self.shared);
        if inner.muted {
            inner.muted = false;
            if inner.volume == 0.0 {
                inner.volume = if inner.last_audible > 0.0 {
                    inner.last_audible
                } else {
                    1.0
                };
            }
        } else {
            inner.muted = true;
        }
        inner.apply_volume();
        inner.muted
    }

    /// Pause, detach and release the current handle. Safe to repeat.
    pub fn destroy(&mut self) {
        let mut inner = lock(&self.shared);
        if inner.media.is_none() && inner.state == PlaybackState::Idle {
            return;
        }
        inner.release_media();
        inner.position = 0.0;
        inner.duration = None;
        inner.url = None;
        inner.last_error = None;
        inner.set_state(PlaybackState::Idle);
    }

    pub fn state(&self) -> PlaybackState {
        lock(&self.shared).state
    }

    pub fn position(&self) -> f64 {
        lock(&self.shared).position
    }

    pub fn duration(&self) -> Option<f64> {
        lock(&self.shared).duration
    }

    pub fn volume(&self) -> f32 {
        lock(&self.shared).volume
    }

    pub fn is_muted(&self) -> bool {
        lock(&self.shared).muted
    }

    pub fn effective_volume(&self) -> f32 {
        lock(&self.shared).effective_volume()
    }

    pub fn is_starting(&self) -> bool {
        lock(&self.shared).is_starting
    }

    pub fn last_error(&self) -> Option<AudioError> {
        lock(&self.shared).last_error.clone()
    }

    /// The address as given to `load`
    pub fn source(&self) -> Option<String> {
        lock(&self.shared).source.clone()
    }

    /// The resolved address of the current handle
    pub fn url(&self) -> Option<String> {
        lock(&self.shared).url.clone()
    }

    pub fn status(&self) -> PlaybackStatus {
        lock(&self.shared).snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    pub fn analyser(&self) -> Option<Arc<dyn FrequencyAnalyser>> {
        lock(&self.shared).media.as_ref().map(|media| media.analyser())
    }

    /// True only while the current handle is `Playing`
    pub fn playing_probe(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.shared);
        let generation = lock(&self.shared).generation;
        move || {
            weak.upgrade().is_some_and(|shared| {
                let inner = lock(&shared);
                inner.generation == generation && inner.state == PlaybackState::Playing
            })
        }
    }
}

impl<B: AudioBackend> Drop for PlaybackSession<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn sanitize_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

async fn pump_media_events<B: AudioBackend>(
    weak: Weak<Mutex<PlaybackInner<B>>>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<MediaEvent>,
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
            MediaEvent::LoadedMetadata { duration } => {
                inner.duration = (duration.is_finite() && duration >= 0.0).then_some(duration);
                inner.position = inner.clamp_position(inner.position);
                debug!("Metadata loaded, duration {:?}", inner.duration);
                if inner.state == PlaybackState::Loading {
                    inner.set_state(PlaybackState::Ready);
                } else {
                    inner.publish();
                }
            }
            MediaEvent::TimeUpdate(seconds) => {
                // Updates queued before a pause or seek are stale
                if inner.state != PlaybackState::Playing {
                    continue;
                }
                inner.position = inner.clamp_position(seconds);
                inner.publish();
            }
            MediaEvent::Ended => {
                info!("Playback ended");
                inner.is_starting = false;
                inner.position = 0.0;
                inner.set_state(PlaybackState::Ended);
            }
            MediaEvent::Error(reason) => {
                inner.fail(AudioError::LoadFailure(reason));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fake::{FakeBackend, PlayBehavior};
    use tokio::time::sleep;

    fn session(backend: &Arc<FakeBackend>) -> PlaybackSession<FakeBackend> {
        PlaybackSession::new(
            backend.clone(),
            PlaybackOptions {
                backend_origin: "http://localhost:5000".to_string(),
                cache_bust: false,
                volume: 1.0,
                muted: false,
                play_timeout: Duration::from_secs(5),
            },
        )
    }

    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    async fn ready(backend: &Arc<FakeBackend>, url: &str, duration: f64) -> PlaybackSession<FakeBackend> {
        let mut playback = session(backend);
        playback.load(url).unwrap();
        backend.emit_media(MediaEvent::LoadedMetadata { duration });
        settle().await;
        playback
    }

    #[tokio::test(start_paused = true)]
    async fn load_then_play_after_ready() {
        let backend = Arc::new(FakeBackend::new());
        let mut playback = session(&backend);

        playback.load("https://host/clip.mp3").unwrap();
        assert_eq!(playback.state(), PlaybackState::Loading);

        let early = playback.play().await;
        assert!(matches!(early, Err(AudioError::InvalidState { .. })));
        assert_eq!(playback.state(), PlaybackState::Loading);

        backend.emit_media(MediaEvent::LoadedMetadata { duration: 12.5 });
        settle().await;
        assert_eq!(playback.state(), PlaybackState::Ready);
        assert_eq!(playback.duration(), Some(12.5));

        playback.play().await.unwrap();
        assert_eq!(playback.state(), PlaybackState::Playing);
        assert_eq!(backend.media_urls(), vec!["https://host/clip.mp3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn relative_source_resolves_against_origin() {
        let backend = Arc::new(FakeBackend::new());
        let playback = ready(&backend, "/uploads/a.mp3", 3.0).await;
        assert_eq!(
            playback.url().as_deref(),
            Some("http://localhost:5000/uploads/a.mp3")
        );
        assert_eq!(playback.source().as_deref(), Some("/uploads/a.mp3"));
    }

    #[tokio::test(start_paused = true)]
    async fn loading_a_new_source_tears_down_the_old_handle() {
        let backend = Arc::new(FakeBackend::new());
        let mut playback = ready(&backend, "https://host/a.mp3", 10.0).await;
        playback.play().await.unwrap();

        playback.load("https://host/b.mp3").unwrap();
        assert_eq!(backend.live_media(), 1);
        assert_eq!(backend.media_created(), 2);
        let calls = backend.media_calls();
        let release = calls.iter().position(|c| c == "release").unwrap();
        assert_eq!(calls[release - 1], "pause");
        assert_eq!(playback.state(), PlaybackState::Loading);
        assert_eq!(playback.duration(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_events_are_ignored_after_reload() {
        let backend = Arc::new(FakeBackend::new());
        let mut playback = ready(&backend, "https://host/a.mp3", 10.0).await;

        // The events sender for the first handle has been replaced, so the
        // first pump only ever sees its own events.
        playback.load("https://host/b.mp3").unwrap();
        backend.emit_media(MediaEvent::LoadedMetadata { duration: 4.0 });
        settle().await;
        assert_eq!(playback.state(), PlaybackState::Ready);
        assert_eq!(playback.duration(), Some(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_play_reverts_and_reports() {
        let backend = Arc::new(FakeBackend::new());
        let playback = ready(&backend, "https://host/a.mp3", 10.0).await;
        playback.seek(4.0).unwrap();

        backend.set_play_behavior(PlayBehavior::Reject("autoplay blocked".into()));
        let err = playback.play().await.unwrap_err();
        assert!(matches!(err, AudioError::PlaybackRejected(_)));
        assert_eq!(playback.state(), PlaybackState::Ready);
        assert_eq!(playback.position(), 4.0);
        assert!(!playback.is_starting());
        assert_eq!(playback.last_error(), Some(err));

        backend.set_play_behavior(PlayBehavior::Confirm);
        playback.play().await.unwrap();
        assert_eq!(playback.state(), PlaybackState::Playing);
        assert_eq!(playback.last_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn play_waits_for_confirmation() {
        let backend = Arc::new(FakeBackend::new());
        let playback = Arc::new(ready(&backend, "https://host/a.mp3", 10.0).await);
        backend.set_play_behavior(PlayBehavior::Manual);

        let waiting = playback.clone();
        let attempt = tokio::spawn(async move { waiting.play().await });
        settle().await;
        assert!(playback.is_starting());
        assert_eq!(playback.state(), PlaybackState::Ready);

        assert!(backend.confirm_play(Ok(())));
        attempt.await.unwrap().unwrap();
        assert_eq!(playback.state(), PlaybackState::Playing);
        assert!(!playback.is_starting());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_play_times_out() {
        let backend = Arc::new(FakeBackend::new());
        let playback = ready(&backend, "https://host/a.mp3", 10.0).await;
        backend.set_play_behavior(PlayBehavior::Manual);

        let err = playback.play().await.unwrap_err();
        assert!(matches!(err, AudioError::PlaybackRejected(_)));
        assert_eq!(playback.state(), PlaybackState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_clamps_into_duration() {
        let backend = Arc::new(FakeBackend::new());
        let playback = ready(&backend, "https://host/a.mp3", 8.0).await;

        assert_eq!(playback.seek(-3.0).unwrap(), 0.0);
        assert_eq!(playback.position(), 0.0);
        assert_eq!(playback.seek(100.0).unwrap(), 8.0);
        assert_eq!(playback.position(), 8.0);
        assert_eq!(playback.seek(f64::NAN).unwrap(), 0.0);

        backend.emit_media(MediaEvent::TimeUpdate(42.0));
        settle().await;
        assert_eq!(playback.position(), 8.0);
        assert!(backend.media_calls().contains(&"seek 8".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn seek_before_metadata_is_rejected() {
        let backend = Arc::new(FakeBackend::new());
        let mut playback = session(&backend);
        playback.load("https://host/a.mp3").unwrap();
        assert!(matches!(
            playback.seek(2.0),
            Err(AudioError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn natural_end_resets_position() {
        let backend = Arc::new(FakeBackend::new());
        let playback = ready(&backend, "https://host/a.mp3", 5.0).await;
        playback.play().await.unwrap();

        backend.emit_media(MediaEvent::TimeUpdate(4.5));
        settle().await;
        assert_eq!(playback.position(), 4.5);

        backend.emit_media(MediaEvent::Ended);
        settle().await;
        assert_eq!(playback.state(), PlaybackState::Ended);
        assert_eq!(playback.position(), 0.0);

        playback.play().await.unwrap();
        assert_eq!(playback.state(), PlaybackState::Playing);
        assert!(backend.media_calls().contains(&"seek 0".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_keeps_position() {
        let backend = Arc::new(FakeBackend::new());
        let playback = ready(&backend, "https://host/a.mp3", 5.0).await;

        assert!(matches!(playback.pause(), Err(AudioError::InvalidState { .. })));
        playback.play().await.unwrap();
        backend.emit_media(MediaEvent::TimeUpdate(2.25));
        settle().await;

        playback.pause().unwrap();
        assert_eq!(playback.state(), PlaybackState::Paused);
        assert_eq!(playback.position(), 2.25);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_time_update_does_not_undo_seek_while_paused() {
        let backend = Arc::new(FakeBackend::new());
        let playback = ready(&backend, "https://host/a.mp3", 8.0).await;
        playback.play().await.unwrap();
        playback.pause().unwrap();

        backend.emit_media(MediaEvent::TimeUpdate(1.0));
        assert_eq!(playback.seek(5.0).unwrap(), 5.0);
        settle().await;

        assert_eq!(playback.state(), PlaybackState::Paused);
        assert_eq!(playback.position(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn media_error_moves_to_error_and_retry_reloads() {
        let backend = Arc::new(FakeBackend::new());
        let mut playback = ready(&backend, "https://host/a.mp3", 5.0).await;

        backend.emit_media(MediaEvent::Error("unsupported codec".into()));
        settle().await;
        assert_eq!(playback.state(), PlaybackState::Error);
        assert_eq!(backend.live_media(), 0);
        assert!(matches!(
            playback.last_error(),
            Some(AudioError::LoadFailure(_))
        ));

        playback.retry().unwrap();
        assert_eq!(playback.state(), PlaybackState::Loading);
        assert_eq!(backend.live_media(), 1);
        assert_eq!(backend.media_created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn create_failure_leaves_no_handle() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_media_creation("404");
        let mut playback = session(&backend);

        let err = playback.load("https://host/missing.mp3").unwrap_err();
        assert!(matches!(err, AudioError::LoadFailure(_)));
        assert_eq!(playback.state(), PlaybackState::Error);
        assert_eq!(backend.live_media(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn muting_at_zero_volume_restores_last_level() {
        let backend = Arc::new(FakeBackend::new());
        let playback = ready(&backend, "https://host/a.mp3", 5.0).await;

        playback.set_volume(0.6);
        playback.set_volume(0.0);
        assert!(playback.is_muted());
        assert_eq!(backend.volume(), 0.0);

        assert!(!playback.toggle_mute());
        assert_eq!(playback.volume(), 0.6);
        assert_eq!(backend.volume(), 0.6);
    }

    #[tokio::test(start_paused = true)]
    async fn unmuting_without_history_uses_full_volume() {
        let backend = Arc::new(FakeBackend::new());
        let playback = PlaybackSession::new(
            backend.clone(),
            PlaybackOptions {
                volume: 0.0,
                ..PlaybackOptions::default()
            },
        );
        assert!(playback.is_muted());
        assert!(!playback.toggle_mute());
        assert_eq!(playback.volume(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_mute_keeps_volume() {
        let backend = Arc::new(FakeBackend::new());
        let playback = ready(&backend, "https://host/a.mp3", 5.0).await;
        playback.set_volume(0.4);

        assert!(playback.toggle_mute());
        assert_eq!(playback.effective_volume(), 0.0);
        assert_eq!(playback.volume(), 0.4);
        assert!(!playback.toggle_mute());
        assert_eq!(playback.effective_volume(), 0.4);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_is_idempotent() {
        let backend = Arc::new(FakeBackend::new());
        let mut playback = ready(&backend, "https://host/a.mp3", 5.0).await;
        playback.play().await.unwrap();

        playback.destroy();
        playback.destroy();
        assert_eq!(playback.state(), PlaybackState::Idle);
        assert_eq!(backend.live_media(), 0);
        let releases = backend
            .media_calls()
            .iter()
            .filter(|c| c.as_str() == "release")
            .count();
        assert_eq!(releases, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_progress() {
        let backend = Arc::new(FakeBackend::new());
        let playback = ready(&backend, "https://host/a.mp3", 8.0).await;
        let mut rx = playback.subscribe();

        playback.seek(2.0).unwrap();
        assert!(rx.has_changed().unwrap());
        let status = rx.borrow_and_update().clone();
        assert_eq!(status.progress_percent(), 25.0);
        assert_eq!(status.state, PlaybackState::Ready);
    }
}
