//! Voice player
//!
//! Wraps a [`PlaybackSession`] with the playback waveform. Until the first
//! play the waveform shows low decorative bars.

use log::{debug, info};
use std::sync::Arc;
use tokio::sync::watch;

use super::backend::AudioBackend;
use super::playback::{PlaybackOptions, PlaybackSession, PlaybackState, PlaybackStatus};
use super::waveform::{Downsample, WaveformFrame, WaveformSampler};
use crate::config::PipelineConfig;
use crate::error::{AudioError, Result};

pub struct VoicePlayer<B: AudioBackend> {
    playback: PlaybackSession<B>,
    sampler: WaveformSampler,
    has_started: bool,
}

impl<B: AudioBackend> VoicePlayer<B> {
    pub fn new(backend: Arc<B>, config: &PipelineConfig) -> Self {
        Self::with_options(backend, config, PlaybackOptions::from(config))
    }

    pub fn with_options(backend: Arc<B>, config: &PipelineConfig, options: PlaybackOptions) -> Self {
        let mut sampler = WaveformSampler::new(
            config.playback_bars,
            Downsample::Stride,
            config.frame_interval(),
        );
        sampler.set_frame(WaveformFrame::decorative(
            config.playback_bars,
            &mut rand::thread_rng(),
        ));

        Self {
            playback: PlaybackSession::new(backend, options),
            sampler,
            has_started: false,
        }
    }

    /// Point the player at a clip. The same source again is a no-op unless
    /// the previous load failed.
    pub fn set_source(&mut self, source: &str) -> Result<()> {
        if self.playback.source().as_deref() == Some(source)
            && !matches!(
                self.playback.state(),
                PlaybackState::Error | PlaybackState::Idle
            )
        {
            debug!("Source unchanged: {}", source);
            return Ok(());
        }

        self.reset_waveform();
        self.playback.load(source)
    }

    pub async fn play(&mut self) -> Result<()> {
        self.playback.play().await?;
        if let Some(analyser) = self.playback.analyser() {
            self.sampler.start(analyser, self.playback.playing_probe());
        }
        self.has_started = true;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.playback.pause()?;
        self.sampler.freeze();
        Ok(())
    }

    /// Play/pause button
    pub async fn toggle(&mut self) -> Result<()> {
        if self.playback.state() == PlaybackState::Playing || self.playback.is_starting() {
            self.pause()
        } else {
            self.play().await
        }
    }

    pub fn seek(&self, seconds: f64) -> Result<f64> {
        self.playback.seek(seconds)
    }

    /// Seek to a point on the progress bar, `percent` in [0, 100]
    pub fn seek_percent(&self, percent: f64) -> Result<f64> {
        let duration = self
            .playback
            .duration()
            .ok_or_else(|| AudioError::invalid_state("seek", self.playback.state()))?;
        let percent = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { 0.0 };
        self.playback.seek(duration * percent / 100.0)
    }

    pub fn set_volume(&self, volume: f32) {
        self.playback.set_volume(volume);
    }

    pub fn toggle_mute(&self) -> bool {
        self.playback.toggle_mute()
    }

    /// Reload after a failure
    pub fn retry(&mut self) -> Result<()> {
        self.reset_waveform();
        self.playback.retry()
    }

    /// Wait until playback ends, fails or is torn down
    pub async fn wait_until_done(&mut self) -> PlaybackState {
        let mut status = self.playback.subscribe();
        let state = match status
            .wait_for(|s| {
                !s.is_starting
                    && matches!(
                        s.state,
                        PlaybackState::Ended | PlaybackState::Error | PlaybackState::Idle
                    )
            })
            .await
        {
            Ok(status) => status.state,
            Err(_) => self.playback.state(),
        };
        self.sampler.freeze();
        state
    }

    pub fn destroy(&mut self) {
        self.sampler.stop();
        self.playback.destroy();
        info!("Player destroyed");
    }

    pub fn frame(&self) -> WaveformFrame {
        self.sampler.frame()
    }

    pub fn has_started(&self) -> bool {
        self.has_started
    }

    pub fn status(&self) -> PlaybackStatus {
        self.playback.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.playback.subscribe()
    }

    pub fn playback(&self) -> &PlaybackSession<B> {
        &self.playback
    }

    fn reset_waveform(&mut self) {
        self.has_started = false;
        self.sampler.set_frame(WaveformFrame::decorative(
            self.sampler.bar_count(),
            &mut rand::thread_rng(),
        ));
    }
}

impl<B: AudioBackend> Drop for VoicePlayer<B> {
    fn drop(&mut self) {
        self.sampler.stop();
    }
}
