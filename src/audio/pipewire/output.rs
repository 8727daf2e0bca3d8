//! Clip playback over PipeWire
//!
//! A media handle fetches and decodes its clip on the tokio runtime, then
//! spawns a PipeWire output thread each time it is played. Pausing joins the
//! thread; the read position survives in an atomic frame index.

use log::{debug, error, info, warn};
use pipewire as pw;
use pw::spa;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;

use super::analyser::SpectrumAnalyser;
use super::decode::{decode_clip, extension_hint, fetch, DecodedClip};
use super::stream::{self, Command, ReadySignal};
use crate::audio::backend::{
    resolved_confirmation, FrequencyAnalyser, MediaEvent, MediaEvents, MediaHandle,
    PlayConfirmation,
};
use crate::audio::lock;
use crate::error::{AudioError, Result};

/// Seconds of audio between position reports
const TIME_UPDATE_SECS: f64 = 0.25;

struct MediaShared {
    analyser: Arc<SpectrumAnalyser>,
    clip: Mutex<Option<Arc<DecodedClip>>>,
    /// Next frame to play
    position: AtomicUsize,
    /// Output gain as f32 bits
    gain: AtomicU32,
    events: MediaEvents,
}

impl MediaShared {
    fn clip(&self) -> Option<Arc<DecodedClip>> {
        lock(&self.clip).clone()
    }

    fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }
}

struct OutputThread {
    sender: pw::channel::Sender<Command>,
    handle: JoinHandle<()>,
}

/// Decodable, playable handle for one clip URL
pub struct PipeWireMedia {
    shared: Arc<MediaShared>,
    loader: Option<tokio::task::JoinHandle<()>>,
    output: Option<OutputThread>,
    released: bool,
}

impl PipeWireMedia {
    /// Start loading `url`. Metadata or an error arrives on `events`.
    pub(super) fn load(
        client: reqwest::Client,
        url: &str,
        events: MediaEvents,
        analyser: SpectrumAnalyser,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AudioError::LoadFailure(format!("No async runtime to load on: {}", e)))?;

        let shared = Arc::new(MediaShared {
            analyser: Arc::new(analyser),
            clip: Mutex::new(None),
            position: AtomicUsize::new(0),
            gain: AtomicU32::new(1.0f32.to_bits()),
            events,
        });

        let loader_shared = shared.clone();
        let url = url.to_string();
        let loader = runtime.spawn(async move {
            match load_clip(&client, &url).await {
                Ok(clip) => {
                    let duration = clip.duration_seconds();
                    info!("Loaded {} ({:.2}s at {} Hz)", url, duration, clip.sample_rate);
                    *lock(&loader_shared.clip) = Some(Arc::new(clip));
                    let _ = loader_shared
                        .events
                        .send(MediaEvent::LoadedMetadata { duration });
                }
                Err(e) => {
                    warn!("Failed to load {}: {}", url, e);
                    let _ = loader_shared.events.send(MediaEvent::Error(e));
                }
            }
        });

        Ok(Self {
            shared,
            loader: Some(loader),
            output: None,
            released: false,
        })
    }

    fn is_running(&self) -> bool {
        self.output
            .as_ref()
            .is_some_and(|output| !output.handle.is_finished())
    }

    fn stop_output(&mut self) {
        let Some(output) = self.output.take() else {
            return;
        };
        let _ = output.sender.send(Command::Stop);
        if output.handle.join().is_err() {
            error!("Playback thread panicked");
        }
    }
}

async fn load_clip(client: &reqwest::Client, url: &str) -> std::result::Result<DecodedClip, String> {
    let data = fetch(client, url).await?;
    let hint = extension_hint(url);
    tokio::task::spawn_blocking(move || decode_clip(&data, hint.as_deref()))
        .await
        .map_err(|e| format!("Decoder task failed: {}", e))?
}

impl MediaHandle for PipeWireMedia {
    fn play(&mut self) -> PlayConfirmation {
        if self.released {
            return resolved_confirmation(Err(AudioError::PlaybackRejected(
                "media handle was released".to_string(),
            )));
        }
        if self.is_running() {
            return resolved_confirmation(Ok(()));
        }
        // A finished thread from a natural end
        self.stop_output();

        let Some(clip) = self.shared.clip() else {
            return resolved_confirmation(Err(AudioError::PlaybackRejected(
                "clip is not loaded yet".to_string(),
            )));
        };
        if self.shared.position.load(Ordering::Acquire) >= clip.samples.len() {
            self.shared.position.store(0, Ordering::Release);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let ready = Arc::new(ReadySignal::new(ready_tx));
        let (sender, receiver) = pw::channel::channel::<Command>();

        let shared = self.shared.clone();
        let thread_ready = ready.clone();
        let spawned = thread::Builder::new()
            .name("voxpost-playback".to_string())
            .spawn(move || {
                if let Err(e) = run_playback_loop(shared.clone(), clip, thread_ready.clone(), receiver) {
                    error!("Playback loop failed: {}", e);
                    if !thread_ready.notify(Err(AudioError::PlaybackRejected(e.clone()))) {
                        let _ = shared.events.send(MediaEvent::Error(e));
                    }
                }
                debug!("Playback thread exited");
            });

        match spawned {
            Ok(handle) => {
                self.output = Some(OutputThread { sender, handle });
                ready_rx
            }
            Err(e) => resolved_confirmation(Err(AudioError::PlaybackRejected(format!(
                "Failed to spawn playback thread: {}",
                e
            )))),
        }
    }

    fn pause(&mut self) {
        self.stop_output();
    }

    fn seek(&mut self, seconds: f64) {
        let Some(clip) = self.shared.clip() else {
            debug!("Seek before clip loaded ignored");
            return;
        };
        let frame = (seconds.max(0.0) * clip.sample_rate as f64) as usize;
        self.shared
            .position
            .store(frame.min(clip.samples.len()), Ordering::Release);
        self.shared.analyser.reset();
    }

    fn current_time(&self) -> f64 {
        match self.shared.clip() {
            Some(clip) => crate::audio::wav::duration_seconds(
                self.shared.position.load(Ordering::Acquire),
                clip.sample_rate,
            ),
            None => 0.0,
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared
            .gain
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn analyser(&self) -> Arc<dyn FrequencyAnalyser> {
        self.shared.analyser.clone()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stop_output();
        if let Some(loader) = self.loader.take() {
            loader.abort();
        }
        lock(&self.shared.clip).take();
        self.shared.analyser.reset();
        debug!("Media handle released");
    }
}

impl Drop for PipeWireMedia {
    fn drop(&mut self) {
        self.release();
    }
}

fn run_playback_loop(
    shared: Arc<MediaShared>,
    clip: Arc<DecodedClip>,
    ready: Arc<ReadySignal<Result<()>>>,
    receiver: pw::channel::Receiver<Command>,
) -> std::result::Result<(), String> {
    let handles = stream::open_loop()?;
    let mainloop = &handles.mainloop;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        Command::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        shared: Arc<MediaShared>,
        clip: Arc<DecodedClip>,
        ready: Arc<ReadySignal<Result<()>>>,
        last_update: usize,
        mainloop_weak: pw::main_loop::MainLoopWeak,
    }

    let sample_rate = clip.sample_rate;
    let user_data = UserData {
        format: Default::default(),
        last_update: shared.position.load(Ordering::Acquire),
        shared,
        clip,
        ready,
        mainloop_weak: mainloop.downgrade(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "Voxpost",
    };

    let stream = pw::stream::StreamBox::new(&handles.core, "voxpost-playback", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .state_changed(|_, user_data, _old, new| match new {
            pw::stream::StreamState::Streaming => {
                if user_data.ready.notify(Ok(())) {
                    debug!("Playback stream streaming");
                }
            }
            pw::stream::StreamState::Error(reason) => {
                let rejected = AudioError::PlaybackRejected(reason.clone());
                if !user_data.ready.notify(Err(rejected)) {
                    let _ = user_data.shared.events.send(MediaEvent::Error(reason));
                }
                if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                    mainloop.quit();
                }
            }
            _ => {}
        })
        .param_changed(|_, user_data, id, param| {
            stream::parse_raw_format(&mut user_data.format, id, param);
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1) as usize;
            let stride = std::mem::size_of::<f32>() * n_channels;
            let total = user_data.clip.samples.len();

            let Some(slice) = data.data() else {
                return;
            };
            let n_frames = slice.len() / stride;

            let start = user_data.shared.position.load(Ordering::Acquire).min(total);
            let end = (start + n_frames).min(total);
            let frames = &user_data.clip.samples[start..end];
            stream::write_frames(&mut slice[..n_frames * stride], frames, n_channels, user_data.shared.gain());
            user_data.shared.analyser.push_samples(frames);

            // A seek from the control thread wins over our advance
            let _ = user_data.shared.position.compare_exchange(
                start,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            );

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = (n_frames * stride) as u32;

            let rate = user_data.clip.sample_rate.max(1) as f64;
            let shared = &user_data.shared;
            if end >= total {
                let _ = shared.events.send(MediaEvent::TimeUpdate(total as f64 / rate));
                let _ = shared.events.send(MediaEvent::Ended);
                if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                    mainloop.quit();
                }
            } else if end.abs_diff(user_data.last_update) as f64 >= TIME_UPDATE_SECS * rate {
                user_data.last_update = end;
                let _ = shared.events.send(MediaEvent::TimeUpdate(end as f64 / rate));
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = stream::f32_format_pod(Some(sample_rate))?;
    let mut params = stream::format_params(&values)?;

    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    mainloop.run();

    Ok(())
}
