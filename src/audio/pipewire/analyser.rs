//! FFT spectrum analyser
//!
//! Mirrors a Web Audio `AnalyserNode` with default settings: Hann window,
//! 0.8 time smoothing, and a [-100 dB, -30 dB] range mapped onto 0..=255.
//! Samples are pushed from the PipeWire thread and read from the sampler
//! task, so the ring sits behind a mutex.

use log::{debug, info};
use realfft::num_complex::Complex32;
use realfft::{RealFftPlanner, RealToComplex};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};

use crate::audio::backend::FrequencyAnalyser;
use crate::audio::lock;

const SMOOTHING: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

static CONTEXT: Mutex<Option<Arc<AnalysisContext>>> = Mutex::new(None);

/// Process-wide FFT planner shared by every analyser
pub struct AnalysisContext {
    planner: Mutex<RealFftPlanner<f32>>,
}

impl AnalysisContext {
    /// Get the shared context, creating it on first use
    pub fn shared() -> Arc<AnalysisContext> {
        let mut slot = lock(&CONTEXT);
        slot.get_or_insert_with(|| {
            info!("Creating audio analysis context");
            Arc::new(AnalysisContext {
                planner: Mutex::new(RealFftPlanner::new()),
            })
        })
        .clone()
    }

    /// Drop the shared context. Call once on application exit.
    pub fn shutdown() {
        if lock(&CONTEXT).take().is_some() {
            info!("Audio analysis context shut down");
        }
    }

    pub fn analyser(&self, fft_size: usize) -> SpectrumAnalyser {
        let fft = lock(&self.planner).plan_fft_forward(fft_size);
        SpectrumAnalyser::new(fft_size, fft)
    }
}

struct AnalyserState {
    ring: VecDeque<f32>,
    smoothed: Vec<f32>,
    input: Vec<f32>,
    output: Vec<Complex32>,
}

pub struct SpectrumAnalyser {
    fft_size: usize,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    state: Mutex<AnalyserState>,
}

impl SpectrumAnalyser {
    fn new(fft_size: usize, fft: Arc<dyn RealToComplex<f32>>) -> Self {
        let window = (0..fft_size)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / fft_size as f32).cos()))
            .collect();
        let output = fft.make_output_vec();

        Self {
            fft_size,
            fft,
            window,
            state: Mutex::new(AnalyserState {
                ring: VecDeque::from(vec![0.0; fft_size]),
                smoothed: vec![0.0; fft_size / 2],
                input: vec![0.0; fft_size],
                output,
            }),
        }
    }

    /// Feed the latest mono samples; only the last `fft_size` are kept
    pub fn push_samples(&self, samples: &[f32]) {
        let mut state = lock(&self.state);
        let keep = samples.len().min(self.fft_size);
        let excess = (state.ring.len() + keep).saturating_sub(self.fft_size);
        state.ring.drain(..excess);
        state.ring.extend(&samples[samples.len() - keep..]);
    }

    /// Clear history, e.g. after a seek
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.ring.iter_mut().for_each(|s| *s = 0.0);
        state.smoothed.iter_mut().for_each(|s| *s = 0.0);
    }
}

impl FrequencyAnalyser for SpectrumAnalyser {
    fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    fn byte_frequency_data(&self, out: &mut [u8]) {
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        for ((slot, sample), w) in state.input.iter_mut().zip(&state.ring).zip(&self.window) {
            *slot = sample * w;
        }
        if let Err(e) = self.fft.process(&mut state.input, &mut state.output) {
            debug!("FFT failed: {}", e);
            out.fill(0);
            return;
        }

        let scale = 1.0 / self.fft_size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        for (i, slot) in out.iter_mut().enumerate() {
            let Some(smoothed) = state.smoothed.get_mut(i) else {
                *slot = 0;
                continue;
            };
            let magnitude = state.output.get(i).map(|c| c.norm() * scale).unwrap_or(0.0);
            *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * magnitude;

            let db = 20.0 * smoothed.log10();
            *slot = ((db - MIN_DECIBELS) / range * 255.0).clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(bin: usize, size: usize, count: usize) -> Vec<f32> {
        (0..count)
            .map(|n| (2.0 * PI * bin as f32 * n as f32 / size as f32).sin())
            .collect()
    }

    #[test]
    fn silence_reads_as_zero() {
        let analyser = AnalysisContext::shared().analyser(256);
        analyser.push_samples(&vec![0.0; 512]);
        let mut bins = vec![7u8; 128];
        analyser.byte_frequency_data(&mut bins);
        assert!(bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn tone_peaks_at_its_bin() {
        let analyser = AnalysisContext::shared().analyser(256);
        analyser.push_samples(&sine(16, 256, 256));

        let mut bins = vec![0u8; 128];
        analyser.byte_frequency_data(&mut bins);
        let peak = bins
            .iter()
            .enumerate()
            .max_by_key(|&(_, b)| *b)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 16);
        assert!(bins[16] > 200);
        assert!(bins[64] < bins[16]);
    }

    #[test]
    fn extra_output_slots_are_zeroed() {
        let analyser = AnalysisContext::shared().analyser(64);
        analyser.push_samples(&sine(4, 64, 64));
        let mut bins = vec![9u8; 40];
        analyser.byte_frequency_data(&mut bins);
        assert_eq!(analyser.frequency_bin_count(), 32);
        assert!(bins[32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn ring_keeps_only_latest_window() {
        let analyser = AnalysisContext::shared().analyser(8);
        analyser.push_samples(&[1.0; 5]);
        analyser.push_samples(&[2.0; 5]);
        let state = lock(&analyser.state);
        assert_eq!(state.ring.len(), 8);
        assert_eq!(
            state.ring.iter().copied().collect::<Vec<_>>(),
            vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 2.0]
        );
    }
}
