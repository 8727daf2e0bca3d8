//! Voice recorder
//!
//! Ties a [`CaptureSession`] to a recording waveform and keeps the finished
//! clip around for preview until it is sent or discarded.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;

use super::backend::AudioBackend;
use super::capture::{CaptureOptions, CaptureSession, CaptureStatus, Clip, RecordingState};
use super::waveform::{Downsample, WaveformFrame, WaveformSampler};
use crate::collab::{ClipRecord, CollabError, UploadCollaborator, UploadRequest, UploadTarget};
use crate::config::PipelineConfig;
use crate::error::{AudioError, Result};

pub struct VoiceRecorder<B: AudioBackend> {
    capture: CaptureSession<B>,
    sampler: WaveformSampler,
    preview: Option<Clip>,
}

impl<B: AudioBackend> VoiceRecorder<B> {
    pub fn new(backend: Arc<B>, config: &PipelineConfig) -> Self {
        Self {
            capture: CaptureSession::new(backend, CaptureOptions::from(config)),
            sampler: WaveformSampler::new(
                config.recording_bars,
                Downsample::Mean,
                config.frame_interval(),
            ),
            preview: None,
        }
    }

    /// Start a fresh recording, discarding any previous preview
    pub async fn start(&mut self) -> Result<()> {
        let state = self.capture.state();
        if matches!(state, RecordingState::Recording | RecordingState::Paused) {
            warn!("Ignoring start while {:?}", state);
            return Err(AudioError::invalid_state("start recording", state));
        }
        self.sampler.clear();
        self.preview = None;
        self.capture.start().await?;
        self.attach_sampler();
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.capture.pause()?;
        self.sampler.freeze();
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.capture.resume()?;
        self.attach_sampler();
        Ok(())
    }

    /// Stop and keep the clip for preview. Also returns a clip that the
    /// ceiling already finished.
    pub fn stop(&mut self) -> Result<Clip> {
        self.sampler.freeze();
        if self.capture.state() == RecordingState::Stopped {
            if let Some(clip) = self.clip() {
                return Ok(clip.clone());
            }
        }
        let clip = self.capture.stop()?;
        self.preview = Some(clip.clone());
        Ok(clip)
    }

    /// Throw away the recording in progress and any preview
    pub fn cancel(&mut self) {
        self.capture.cancel();
        self.sampler.clear();
        self.preview = None;
    }

    /// Discard and immediately start over
    pub async fn re_record(&mut self) -> Result<()> {
        info!("Re-recording");
        self.cancel();
        self.start().await
    }

    /// Wait until the recording leaves `Recording`/`Paused` by any route and
    /// return the clip it produced, if any
    pub async fn wait_until_finished(&mut self) -> Option<&Clip> {
        let mut status = self.capture.subscribe();
        let finished = status
            .wait_for(|s| !matches!(s.state, RecordingState::Recording | RecordingState::Paused))
            .await
            .is_ok();
        if !finished {
            debug!("Capture status channel closed");
        }
        self.sampler.freeze();
        self.clip()
    }

    /// The finished clip kept for preview
    pub fn clip(&mut self) -> Option<&Clip> {
        if self.preview.is_none() {
            self.preview = self.capture.take_clip();
        }
        self.preview.as_ref()
    }

    /// Hand the preview clip to the uploader. Local state is cleared only
    /// once the upload succeeded.
    pub async fn send<U>(
        &mut self,
        uploader: &U,
        target: &UploadTarget,
        description: Option<String>,
    ) -> std::result::Result<ClipRecord, CollabError>
    where
        U: UploadCollaborator + ?Sized,
    {
        let clip = self.clip().cloned().ok_or(CollabError::NothingToSend)?;
        let record = uploader
            .upload(target, UploadRequest { clip, description })
            .await?;
        info!("Recording sent as {}", record.id);
        self.cancel();
        Ok(record)
    }

    pub fn state(&self) -> RecordingState {
        self.capture.state()
    }

    pub fn elapsed(&self) -> u32 {
        self.capture.elapsed_seconds()
    }

    pub fn remaining(&self) -> u32 {
        self.capture.remaining_seconds()
    }

    /// Share of the ceiling used so far, for the countdown ring
    pub fn progress_percent(&self) -> f64 {
        let ceiling = self.capture.ceiling_seconds().max(1);
        (self.elapsed() as f64 / ceiling as f64 * 100.0).min(100.0)
    }

    pub fn frame(&self) -> WaveformFrame {
        self.sampler.frame()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureStatus> {
        self.capture.subscribe()
    }

    pub fn capture(&self) -> &CaptureSession<B> {
        &self.capture
    }

    fn attach_sampler(&mut self) {
        if let Some(analyser) = self.capture.analyser() {
            self.sampler.start(analyser, self.capture.recording_probe());
        }
    }
}

impl<B: AudioBackend> Drop for VoiceRecorder<B> {
    fn drop(&mut self) {
        self.sampler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fake::FakeBackend;
    use crate::audio::waveform::{MAX_LEVEL, MIN_LEVEL};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;

    fn config(ceiling: u32) -> PipelineConfig {
        PipelineConfig {
            max_recording_secs: ceiling,
            recording_bars: 8,
            ..PipelineConfig::default()
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        sent: Mutex<Vec<(UploadTarget, u32, Option<String>)>>,
        fail: bool,
    }

    #[async_trait]
    impl UploadCollaborator for RecordingUploader {
        async fn upload(
            &self,
            target: &UploadTarget,
            request: UploadRequest,
        ) -> std::result::Result<ClipRecord, CollabError> {
            if self.fail {
                return Err(CollabError::Status {
                    status: 500,
                    message: "storage full".into(),
                });
            }
            self.sent.lock().unwrap().push((
                target.clone(),
                request.clip.duration_seconds,
                request.description,
            ));
            Ok(ClipRecord {
                id: "p1".into(),
                audio_url: Some("/uploads/p1.wav".into()),
                audio_duration: Some(request.clip.duration_seconds as f64),
                description: None,
                username: None,
                timestamp: None,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waveform_follows_recording_and_freezes_on_pause() {
        let backend = Arc::new(FakeBackend::new());
        let analyser = backend.analyser();
        let mut recorder = VoiceRecorder::new(backend.clone(), &config(60));

        analyser.set_level(255);
        recorder.start().await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.frame().bars(), &[MAX_LEVEL; 8]);

        recorder.pause().unwrap();
        analyser.set_level(0);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.frame().bars(), &[MAX_LEVEL; 8]);

        recorder.resume().unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.frame().bars(), &[MIN_LEVEL; 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_keeps_live_waveform() {
        let backend = Arc::new(FakeBackend::new());
        let analyser = backend.analyser();
        let mut recorder = VoiceRecorder::new(backend.clone(), &config(60));

        analyser.set_level(255);
        recorder.start().await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let err = recorder.start().await.unwrap_err();
        assert!(matches!(err, AudioError::InvalidState { .. }));
        assert_eq!(recorder.state(), RecordingState::Recording);
        assert_eq!(recorder.frame().bars(), &[MAX_LEVEL; 8]);

        analyser.set_level(0);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.frame().bars(), &[MIN_LEVEL; 8]);
        assert_eq!(backend.inputs_acquired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_finishes_and_freezes_waveform() {
        let backend = Arc::new(FakeBackend::new());
        let analyser = backend.analyser();
        analyser.set_level(200);
        let mut recorder = VoiceRecorder::new(backend.clone(), &config(2));

        recorder.start().await.unwrap();
        let clip = recorder.wait_until_finished().await.cloned().unwrap();
        assert_eq!(clip.duration_seconds, 2);
        assert_eq!(recorder.state(), RecordingState::Stopped);
        assert_eq!(recorder.progress_percent(), 100.0);
        assert_eq!(backend.live_inputs(), 0);

        let frozen = recorder.frame();
        analyser.set_level(0);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.frame(), frozen);

        let again = recorder.stop().unwrap();
        assert_eq!(again, clip);
    }

    #[tokio::test(start_paused = true)]
    async fn re_record_discards_preview() {
        let backend = Arc::new(FakeBackend::new());
        let mut recorder = VoiceRecorder::new(backend.clone(), &config(60));

        recorder.start().await.unwrap();
        sleep(Duration::from_millis(2500)).await;
        recorder.stop().unwrap();
        assert!(recorder.clip().is_some());

        recorder.re_record().await.unwrap();
        assert!(recorder.clip().is_none());
        assert!(recorder.frame().is_empty());
        assert_eq!(recorder.state(), RecordingState::Recording);
        assert_eq!(recorder.elapsed(), 0);
        assert_eq!(backend.live_inputs(), 1);
        assert_eq!(backend.inputs_released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_uploads_and_clears() {
        let backend = Arc::new(FakeBackend::new());
        let mut recorder = VoiceRecorder::new(backend.clone(), &config(60));
        let uploader = RecordingUploader::default();

        recorder.start().await.unwrap();
        sleep(Duration::from_millis(3500)).await;
        recorder.stop().unwrap();

        let target = UploadTarget::Comment {
            post_id: "p9".into(),
        };
        let record = recorder
            .send(&uploader, &target, Some("hello".into()))
            .await
            .unwrap();
        assert_eq!(record.audio_duration, Some(3.0));
        assert_eq!(
            *uploader.sent.lock().unwrap(),
            vec![(target, 3, Some("hello".to_string()))]
        );
        assert!(recorder.clip().is_none());
        assert_eq!(recorder.state(), RecordingState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_keeps_clip() {
        let backend = Arc::new(FakeBackend::new());
        let mut recorder = VoiceRecorder::new(backend.clone(), &config(60));
        let uploader = RecordingUploader {
            fail: true,
            ..Default::default()
        };

        assert!(matches!(
            recorder.send(&uploader, &UploadTarget::Post, None).await,
            Err(CollabError::NothingToSend)
        ));

        recorder.start().await.unwrap();
        sleep(Duration::from_millis(1500)).await;
        recorder.stop().unwrap();

        let err = recorder
            .send(&uploader, &UploadTarget::Post, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::Status { status: 500, .. }));
        assert!(recorder.clip().is_some());
    }
}
