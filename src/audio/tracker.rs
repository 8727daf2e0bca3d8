//! Elapsed-time tracker
//!
//! A cancellable one-second counter that enforces the recording ceiling and
//! drives the countdown shown while recording. Pausing cancels the periodic
//! task, so paused time is never counted.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::lock;
use super::task::RepeatingTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Stopped,
    Running,
    Paused,
}

/// What a single tick produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerTick {
    Counted(u32),
    /// The ceiling was reached; the tracker has already stopped itself
    LimitReached(u32),
}

pub type TickCallback = Arc<dyn Fn(TrackerTick) + Send + Sync>;

struct Counter {
    state: TrackerState,
    elapsed: u32,
    ceiling: u32,
    /// Bumped on every transition so ticks from an older task are ignored
    epoch: u64,
}

pub struct ElapsedTimeTracker {
    counter: Arc<Mutex<Counter>>,
    on_tick: Option<TickCallback>,
    task: Option<RepeatingTask>,
    period: Duration,
}

impl ElapsedTimeTracker {
    pub fn new(ceiling_secs: u32, period: Duration) -> Self {
        Self {
            counter: Arc::new(Mutex::new(Counter {
                state: TrackerState::Stopped,
                elapsed: 0,
                ceiling: ceiling_secs.max(1),
                epoch: 0,
            })),
            on_tick: None,
            task: None,
            period,
        }
    }

    /// Reset to zero and begin counting. `on_tick` runs after every
    /// increment, outside the tracker's lock.
    pub fn start<F>(&mut self, on_tick: F)
    where
        F: Fn(TrackerTick) + Send + Sync + 'static,
    {
        self.cancel_task();
        {
            let mut counter = lock(&self.counter);
            counter.elapsed = 0;
            counter.state = TrackerState::Running;
            counter.epoch += 1;
        }
        self.on_tick = Some(Arc::new(on_tick));
        self.spawn();
    }

    /// Suspend counting without resetting. Returns false if not running.
    pub fn pause(&mut self) -> bool {
        {
            let mut counter = lock(&self.counter);
            if counter.state != TrackerState::Running {
                return false;
            }
            counter.state = TrackerState::Paused;
            counter.epoch += 1;
        }
        self.cancel_task();
        true
    }

    /// Continue counting from the frozen value. Returns false if not paused.
    pub fn resume(&mut self) -> bool {
        {
            let mut counter = lock(&self.counter);
            if counter.state != TrackerState::Paused {
                return false;
            }
            counter.state = TrackerState::Running;
            counter.epoch += 1;
        }
        self.spawn();
        true
    }

    /// Cancel counting; the elapsed value is kept for reporting
    pub fn stop(&mut self) {
        {
            let mut counter = lock(&self.counter);
            counter.state = TrackerState::Stopped;
            counter.epoch += 1;
        }
        self.cancel_task();
        self.on_tick = None;
    }

    /// Stop and zero the counter
    pub fn reset(&mut self) {
        self.stop();
        lock(&self.counter).elapsed = 0;
    }

    pub fn elapsed(&self) -> u32 {
        lock(&self.counter).elapsed
    }

    pub fn ceiling(&self) -> u32 {
        lock(&self.counter).ceiling
    }

    pub fn remaining(&self) -> u32 {
        let counter = lock(&self.counter);
        counter.ceiling.saturating_sub(counter.elapsed)
    }

    pub fn state(&self) -> TrackerState {
        lock(&self.counter).state
    }

    fn spawn(&mut self) {
        let counter = self.counter.clone();
        let on_tick = self.on_tick.clone();
        let epoch = lock(&self.counter).epoch;

        self.task = Some(RepeatingTask::spawn(self.period, move || {
            let tick = {
                let mut counter = lock(&counter);
                if counter.epoch != epoch || counter.state != TrackerState::Running {
                    return ControlFlow::Break(());
                }
                counter.elapsed = (counter.elapsed + 1).min(counter.ceiling);
                if counter.elapsed >= counter.ceiling {
                    counter.state = TrackerState::Stopped;
                    counter.epoch += 1;
                    TrackerTick::LimitReached(counter.elapsed)
                } else {
                    TrackerTick::Counted(counter.elapsed)
                }
            };

            if let Some(callback) = &on_tick {
                callback(tick);
            }

            match tick {
                TrackerTick::LimitReached(_) => ControlFlow::Break(()),
                TrackerTick::Counted(_) => ControlFlow::Continue(()),
            }
        }));
    }

    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel();
        }
    }
}

impl Drop for ElapsedTimeTracker {
    fn drop(&mut self) {
        self.cancel_task();
    }
}

/// Format seconds as `m:ss`; non-finite input renders as `0:00`
pub fn format_time(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "0:00".to_string();
    }
    let total = seconds.floor() as u64;
    format!("{}:{:02}", total / 60, total % 60)
}
