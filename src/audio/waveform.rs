//! Live waveform bars for recording and playback
//!
//! Both samplers poll a [`FrequencyAnalyser`] at animation-frame cadence,
//! downsample the bins to a fixed number of bars and map them into the
//! `[10, 100]` percent-of-height display range.

use rand::Rng;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::backend::FrequencyAnalyser;
use super::lock;
use super::task::RepeatingTask;

/// Lowest bar height, in percent
pub const MIN_LEVEL: f32 = 10.0;
/// Highest bar height, in percent
pub const MAX_LEVEL: f32 = 100.0;

/// One set of bar heights
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaveformFrame {
    bars: Vec<f32>,
}

impl WaveformFrame {
    pub fn new(bars: Vec<f32>) -> Self {
        Self {
            bars: bars
                .into_iter()
                .map(|b| b.clamp(MIN_LEVEL, MAX_LEVEL))
                .collect(),
        }
    }

    /// All bars at the minimum level
    pub fn flat(count: usize) -> Self {
        Self {
            bars: vec![MIN_LEVEL; count],
        }
    }

    /// Placeholder bars shown before anything plays, in `[10, 50)`
    pub fn decorative<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Self {
        Self {
            bars: (0..count).map(|_| rng.gen_range(10.0..50.0)).collect(),
        }
    }

    pub fn bars(&self) -> &[f32] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

/// How frequency bins are folded into bars
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Downsample {
    /// Arithmetic mean of each bucket (recording view)
    Mean,
    /// First bin of each bucket (playback view)
    Stride,
}

fn to_level(energy: f32) -> f32 {
    MIN_LEVEL + (energy / 255.0) * (MAX_LEVEL - MIN_LEVEL)
}

/// Fold `bins` into `bars` buckets
pub fn downsample(bins: &[u8], bars: usize, mode: Downsample) -> WaveformFrame {
    if bars == 0 {
        return WaveformFrame::default();
    }
    let step = (bins.len() / bars).max(1);

    let levels = (0..bars)
        .map(|i| {
            let start = i * step;
            let energy = match mode {
                Downsample::Mean => {
                    let sum: u32 = bins
                        .iter()
                        .skip(start)
                        .take(step)
                        .map(|&b| b as u32)
                        .sum();
                    sum as f32 / step as f32
                }
                Downsample::Stride => bins.get(start).copied().unwrap_or(0) as f32,
            };
            to_level(energy)
        })
        .collect();

    WaveformFrame { bars: levels }
}

struct SamplerInner {
    frame: WaveformFrame,
    generation: u64,
    active: bool,
    bins: Vec<u8>,
}

/// Polls an analyser while its owning session is producing or playing audio
pub struct WaveformSampler {
    shared: Arc<Mutex<SamplerInner>>,
    task: Option<RepeatingTask>,
    bars: usize,
    mode: Downsample,
    period: Duration,
}

impl WaveformSampler {
    pub fn new(bars: usize, mode: Downsample, period: Duration) -> Self {
        Self {
            shared: Arc::new(Mutex::new(SamplerInner {
                frame: WaveformFrame::default(),
                generation: 0,
                active: false,
                bins: Vec::new(),
            })),
            task: None,
            bars,
            mode,
            period,
        }
    }

    /// Begin ticking. `is_live` is checked on every tick; once it reports
    /// false the loop exits and the last frame stays in place.
    pub fn start<P>(&mut self, analyser: Arc<dyn FrequencyAnalyser>, is_live: P)
    where
        P: Fn() -> bool + Send + Sync + 'static,
    {
        self.cancel_task();
        let generation = {
            let mut inner = lock(&self.shared);
            inner.generation += 1;
            inner.active = true;
            inner.bins = vec![0; analyser.frequency_bin_count()];
            inner.generation
        };

        let shared = Arc::downgrade(&self.shared);
        let bars = self.bars;
        let mode = self.mode;
        self.task = Some(RepeatingTask::spawn(self.period, move || {
            if !is_live() {
                return ControlFlow::Break(());
            }
            let Some(shared) = shared.upgrade() else {
                return ControlFlow::Break(());
            };
            let mut inner = lock(&shared);
            if inner.generation != generation || !inner.active {
                return ControlFlow::Break(());
            }

            let mut bins = std::mem::take(&mut inner.bins);
            analyser.byte_frequency_data(&mut bins);
            inner.frame = downsample(&bins, bars, mode);
            inner.bins = bins;
            ControlFlow::Continue(())
        }));
    }

    /// Stop ticking and keep the last frame on screen
    pub fn freeze(&mut self) {
        {
            let mut inner = lock(&self.shared);
            inner.generation += 1;
            inner.active = false;
        }
        self.cancel_task();
    }

    /// Teardown; identical to freeze and safe to repeat
    pub fn stop(&mut self) {
        self.freeze();
    }

    /// Stop and drop all bars
    pub fn clear(&mut self) {
        self.freeze();
        lock(&self.shared).frame = WaveformFrame::default();
    }

    /// Replace the displayed frame (decorative placeholder)
    pub fn set_frame(&mut self, frame: WaveformFrame) {
        self.freeze();
        lock(&self.shared).frame = frame;
    }

    pub fn frame(&self) -> WaveformFrame {
        lock(&self.shared).frame.clone()
    }

    pub fn is_active(&self) -> bool {
        let inner = lock(&self.shared);
        inner.active && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn bar_count(&self) -> usize {
        self.bars
    }

    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel();
        }
    }
}

impl Drop for WaveformSampler {
    fn drop(&mut self) {
        self.cancel_task();
    }
}
