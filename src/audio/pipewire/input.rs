//! Microphone capture over PipeWire
//!
//! The stream runs on its own thread with its own main loop. Every buffer is
//! mixed to mono and fed to the spectrum analyser; while the encoder is
//! recording the samples are also kept for the WAV file.

use log::{debug, error, info, warn};
use pipewire as pw;
use pw::spa;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;

use super::analyser::SpectrumAnalyser;
use super::classify_input_error;
use super::stream::{self, Command, ReadySignal};
use crate::audio::backend::{Encoder, EncoderEvent, EncoderEvents, FrequencyAnalyser, InputStream};
use crate::audio::lock;
use crate::audio::wav::encode_wav;
use crate::error::{AudioError, Result};

const WAV_MIME: &str = "audio/wav";

/// State shared between the capture thread and the handles
struct InputShared {
    analyser: Arc<SpectrumAnalyser>,
    recording: AtomicBool,
    live: AtomicBool,
    sample_rate: AtomicU32,
    buffer: Mutex<Vec<f32>>,
    failure: Mutex<Option<EncoderEvents>>,
}

impl InputShared {
    fn process_samples(&self, samples: &[f32], sample_rate: u32) {
        if samples.is_empty() {
            return;
        }
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
        self.analyser.push_samples(samples);
        if self.recording.load(Ordering::Acquire) {
            lock(&self.buffer).extend_from_slice(samples);
        }
    }

    /// The stream died after it was up; tell the encoder, if any
    fn report_failure(&self, reason: String) {
        self.live.store(false, Ordering::Release);
        self.recording.store(false, Ordering::Release);
        match lock(&self.failure).as_ref() {
            Some(events) => {
                let _ = events.send(EncoderEvent::Failed(reason));
            }
            None => warn!("Capture stream failed with no encoder attached: {}", reason),
        }
    }
}

/// Exclusively owned microphone stream
pub struct PipeWireInput {
    shared: Arc<InputShared>,
    sender: Option<pw::channel::Sender<Command>>,
    thread: Option<JoinHandle<()>>,
}

impl PipeWireInput {
    /// Connect a capture stream and wait until it is actually streaming
    pub(super) async fn open(analyser: SpectrumAnalyser, timeout: Duration) -> Result<Self> {
        let shared = Arc::new(InputShared {
            analyser: Arc::new(analyser),
            recording: AtomicBool::new(false),
            live: AtomicBool::new(false),
            sample_rate: AtomicU32::new(0),
            buffer: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let ready = Arc::new(ReadySignal::new(ready_tx));
        let (sender, receiver) = pw::channel::channel::<Command>();

        let thread_shared = shared.clone();
        let thread_ready = ready.clone();
        let thread = thread::Builder::new()
            .name("voxpost-capture".to_string())
            .spawn(move || {
                if let Err(e) = run_capture_loop(thread_shared.clone(), thread_ready.clone(), receiver) {
                    error!("Capture loop failed: {}", e);
                    if !thread_ready.notify(Err(e.clone())) {
                        thread_shared.report_failure(e);
                    }
                }
                thread_shared.live.store(false, Ordering::Release);
                debug!("Capture thread exited");
            })
            .map_err(|e| AudioError::DeviceUnavailable(format!("Failed to spawn capture thread: {}", e)))?;

        // Built before waiting so a dropped future still tears the thread down
        let input = Self {
            shared,
            sender: Some(sender),
            thread: Some(thread),
        };

        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                input.shared.live.store(true, Ordering::Release);
                info!("Microphone stream ready");
                Ok(input)
            }
            Ok(Ok(Err(reason))) => Err(classify_input_error(&reason)),
            Ok(Err(_)) => Err(AudioError::DeviceUnavailable(
                "capture thread exited before the stream was ready".to_string(),
            )),
            Err(_) => {
                warn!("No capture stream after {:?}", timeout);
                Err(AudioError::DeviceUnavailable(format!(
                    "no input device became ready within {} ms",
                    timeout.as_millis()
                )))
            }
        }
    }
}

impl InputStream for PipeWireInput {
    fn analyser(&self) -> Arc<dyn FrequencyAnalyser> {
        self.shared.analyser.clone()
    }

    fn release(&mut self) {
        self.shared.recording.store(false, Ordering::Release);
        self.shared.live.store(false, Ordering::Release);
        lock(&self.shared.failure).take();

        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Command::Stop);
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
            info!("Microphone released");
        }
    }

    fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::Acquire)
    }
}

impl Drop for PipeWireInput {
    fn drop(&mut self) {
        self.release();
    }
}

/// Buffers samples from its input and writes them out as one WAV file on stop
pub struct WavEncoder {
    shared: Arc<InputShared>,
}

impl WavEncoder {
    pub(super) fn attach(input: &mut PipeWireInput, events: EncoderEvents) -> Self {
        *lock(&input.shared.failure) = Some(events);
        Self {
            shared: input.shared.clone(),
        }
    }
}

impl Encoder for WavEncoder {
    fn start(&mut self) -> Result<()> {
        if !self.shared.live.load(Ordering::Acquire) {
            return Err(AudioError::EncodingFailure(
                "microphone stream is not running".to_string(),
            ));
        }
        lock(&self.shared.buffer).clear();
        self.shared.recording.store(true, Ordering::Release);
        debug!("WAV encoder started");
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.shared.recording.store(false, Ordering::Release);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.shared.recording.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<Vec<u8>> {
        self.shared.recording.store(false, Ordering::Release);
        lock(&self.shared.failure).take();

        let samples = std::mem::take(&mut *lock(&self.shared.buffer));
        let sample_rate = self.shared.sample_rate.load(Ordering::Relaxed);
        if sample_rate == 0 {
            return Err(AudioError::EncodingFailure(
                "no audio format was negotiated".to_string(),
            ));
        }

        let data = encode_wav(&samples, sample_rate).map_err(AudioError::EncodingFailure)?;
        debug!(
            "Encoded {} samples at {} Hz into {} bytes",
            samples.len(),
            sample_rate,
            data.len()
        );
        Ok(data)
    }

    fn mime_type(&self) -> &str {
        WAV_MIME
    }
}

fn run_capture_loop(
    shared: Arc<InputShared>,
    ready: Arc<ReadySignal<std::result::Result<(), String>>>,
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
        shared: Arc<InputShared>,
        ready: Arc<ReadySignal<std::result::Result<(), String>>>,
        mainloop_weak: pw::main_loop::MainLoopWeak,
    }

    let user_data = UserData {
        format: Default::default(),
        shared,
        ready,
        mainloop_weak: mainloop.downgrade(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "Voxpost",
    };

    let stream = pw::stream::StreamBox::new(&handles.core, "voxpost-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .state_changed(|_, user_data, _old, new| match new {
            pw::stream::StreamState::Streaming => {
                if user_data.ready.notify(Ok(())) {
                    debug!("Capture stream streaming");
                }
            }
            pw::stream::StreamState::Error(reason) => {
                if !user_data.ready.notify(Err(reason.clone())) {
                    user_data.shared.report_failure(reason);
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
            let sample_rate = user_data.format.rate();
            let size = data.chunk().size() as usize;

            if let Some(raw) = data.data() {
                let raw = &raw[..size.min(raw.len())];
                let mono = stream::read_mono(raw, n_channels);
                user_data.shared.process_samples(&mono, sample_rate);
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = stream::f32_format_pod(None)?;
    let mut params = stream::format_params(&values)?;

    stream
        .connect(
            spa::utils::Direction::Input,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pipewire::AnalysisContext;

    fn shared() -> Arc<InputShared> {
        Arc::new(InputShared {
            analyser: Arc::new(AnalysisContext::shared().analyser(64)),
            recording: AtomicBool::new(false),
            live: AtomicBool::new(true),
            sample_rate: AtomicU32::new(0),
            buffer: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        })
    }

    #[test]
    fn only_keeps_samples_while_recording() {
        let shared = shared();
        shared.process_samples(&[0.1; 10], 16000);
        assert!(lock(&shared.buffer).is_empty());

        shared.recording.store(true, Ordering::Release);
        shared.process_samples(&[0.2; 10], 16000);
        assert_eq!(lock(&shared.buffer).len(), 10);
        assert_eq!(shared.sample_rate.load(Ordering::Relaxed), 16000);
    }

    #[test]
    fn failure_reaches_the_encoder() {
        let shared = shared();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        *lock(&shared.failure) = Some(tx);

        shared.report_failure("device unplugged".to_string());
        assert_eq!(
            rx.try_recv().unwrap(),
            EncoderEvent::Failed("device unplugged".to_string())
        );
        assert!(!shared.live.load(Ordering::Acquire));
    }

    #[test]
    fn encoder_writes_buffered_samples_as_wav() {
        let shared = shared();
        let mut encoder = WavEncoder {
            shared: shared.clone(),
        };

        encoder.start().unwrap();
        shared.process_samples(&[0.5; 8000], 8000);
        encoder.pause().unwrap();
        shared.process_samples(&[0.5; 8000], 8000);
        encoder.resume().unwrap();
        shared.process_samples(&[0.5; 4000], 8000);

        let data = encoder.stop().unwrap();
        assert_eq!(&data[0..4], b"RIFF");
        let reader = hound::WavReader::new(std::io::Cursor::new(data)).unwrap();
        assert_eq!(reader.duration(), 12000);
        assert_eq!(encoder.mime_type(), "audio/wav");
    }

    #[test]
    fn encoder_without_format_fails() {
        let shared = shared();
        let mut encoder = WavEncoder { shared };
        encoder.start().unwrap();
        assert!(matches!(encoder.stop(), Err(AudioError::EncodingFailure(_))));
    }
}
