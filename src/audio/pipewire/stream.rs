//! Shared PipeWire plumbing for the capture and output threads

use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::Mutex;
use tokio::sync::oneshot;

use crate::audio::lock;

/// Sent to a stream thread to make its main loop quit
pub(super) enum Command {
    Stop,
}

/// One-time readiness report from a stream thread back to the opener
pub(super) struct ReadySignal<T> {
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> ReadySignal<T> {
    pub fn new(sender: oneshot::Sender<T>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Deliver `value` if nothing was delivered yet. Returns false when the
    /// signal was already spent.
    pub fn notify(&self, value: T) -> bool {
        match lock(&self.sender).take() {
            Some(sender) => {
                let _ = sender.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_spent(&self) -> bool {
        lock(&self.sender).is_none()
    }
}

/// Main loop, context and core for one stream thread
pub(super) struct LoopHandles {
    pub mainloop: pw::main_loop::MainLoopRc,
    pub _context: pw::context::ContextRc,
    pub core: pw::core::CoreRc,
}

pub(super) fn open_loop() -> Result<LoopHandles, String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    Ok(LoopHandles {
        mainloop,
        _context: context,
        core,
    })
}

/// Serialized EnumFormat pod requesting F32LE. Without a rate the graph's
/// native rate is used; with one, PipeWire resamples for us.
pub(super) fn f32_format_pod(rate: Option<u32>) -> Result<Vec<u8>, String> {
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    if let Some(rate) = rate {
        audio_info.set_rate(rate);
    }

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner();

    Ok(values)
}

pub(super) fn format_params(values: &[u8]) -> Result<[&Pod; 1], String> {
    Pod::from_bytes(values)
        .map(|pod| [pod])
        .ok_or_else(|| "Invalid audio format pod".to_string())
}

/// Update `format` from a negotiated Format param; other params are ignored
pub(super) fn parse_raw_format(
    format: &mut spa::param::audio::AudioInfoRaw,
    id: u32,
    param: Option<&Pod>,
) {
    let Some(param) = param else { return };
    if id != spa::param::ParamType::Format.as_raw() {
        return;
    }

    let (media_type, media_subtype) = match format_utils::parse_format(param) {
        Ok(v) => v,
        Err(_) => return,
    };
    if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
        return;
    }

    if let Err(e) = format.parse(param) {
        log::warn!("Failed to parse negotiated audio format: {:?}", e);
    }
}

/// Mix interleaved little-endian f32 frames down to mono
pub(super) fn read_mono(raw: &[u8], n_channels: usize) -> Vec<f32> {
    let sample_size = std::mem::size_of::<f32>();
    let n_channels = n_channels.max(1);
    let stride = sample_size * n_channels;

    raw.chunks_exact(stride)
        .map(|frame| {
            let sum: f32 = frame
                .chunks_exact(sample_size)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .sum();
            sum / n_channels as f32
        })
        .collect()
}

/// Write mono samples into every channel of interleaved f32 frames, scaled
/// by `gain`. Returns the number of bytes written.
pub(super) fn write_frames(out: &mut [u8], samples: &[f32], n_channels: usize, gain: f32) -> usize {
    let sample_size = std::mem::size_of::<f32>();
    let n_channels = n_channels.max(1);
    let stride = sample_size * n_channels;

    let mut written = 0;
    for (frame, &sample) in out.chunks_exact_mut(stride).zip(samples) {
        let bytes = (sample * gain).to_le_bytes();
        for channel in frame.chunks_exact_mut(sample_size) {
            channel.copy_from_slice(&bytes);
        }
        written += stride;
    }
    out[written..].fill(0);
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interleave(frames: &[&[f32]]) -> Vec<u8> {
        frames
            .iter()
            .flat_map(|frame| frame.iter().flat_map(|s| s.to_le_bytes()))
            .collect()
    }

    #[test]
    fn ready_signal_fires_once() {
        let (tx, mut rx) = oneshot::channel();
        let signal = ReadySignal::new(tx);
        assert!(!signal.is_spent());
        assert!(signal.notify(1));
        assert!(!signal.notify(2));
        assert!(signal.is_spent());
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn mixes_stereo_down_to_mono() {
        let raw = interleave(&[&[1.0, 0.0], &[0.5, 0.5], &[-1.0, 1.0]]);
        assert_eq!(read_mono(&raw, 2), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn ignores_partial_trailing_frame() {
        let mut raw = interleave(&[&[0.25]]);
        raw.extend_from_slice(&[0, 0]);
        assert_eq!(read_mono(&raw, 1), vec![0.25]);
    }

    #[test]
    fn writes_gain_scaled_frames_and_silences_the_rest() {
        let mut out = vec![0xAAu8; 4 * 2 * 3];
        let written = write_frames(&mut out, &[1.0, -0.5], 2, 0.5);
        assert_eq!(written, 16);
        assert_eq!(read_mono(&out, 2), vec![0.5, -0.25, 0.0]);
        assert!(out[16..].iter().all(|&b| b == 0));
    }
}
