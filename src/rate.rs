// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Rate Estimation
//!
//! Sliding-window estimate of an incoming message rate, updated from the
//! consume loop and read from any thread.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Number of instantaneous frequencies kept in the window.
pub const RATE_WINDOW_SAMPLES: usize = 100;
/// Arrivals closer than this are treated as duplicates or clock noise.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct RateWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    last: Option<Instant>,
    hz: f64,
}

impl RateWindow {
    fn push(&mut self, at: Instant) {
        let Some(last) = self.last.replace(at) else {
            return;
        };

        let elapsed = at.saturating_duration_since(last);
        if elapsed < MIN_SAMPLE_INTERVAL {
            return;
        }

        if self.samples.len() == self.capacity {
            self.samples.pop_back();
        }
        self.samples.push_front(1.0 / elapsed.as_secs_f64());

        let (sum, count) = self
            .samples
            .iter()
            .filter(|hz| **hz != 0.0)
            .fold((0.0, 0usize), |(sum, count), hz| (sum + hz, count + 1));
        if count > 0 {
            self.hz = sum / count as f64;
        }
    }
}

/// Estimates the arrival rate, in Hz, of the last `capacity` messages.
///
/// The first arrival only establishes a baseline. Every later arrival pushes
/// `1 / Δt` into a bounded FIFO and the reported rate becomes the mean of its
/// non-zero samples. Updates and reads share a single lock.
#[derive(Debug)]
pub struct RateEstimator {
    window: Mutex<RateWindow>,
}

impl Default for RateEstimator {
    fn default() -> Self {
        RateEstimator::new(RATE_WINDOW_SAMPLES)
    }
}

impl RateEstimator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RateEstimator {
            window: Mutex::new(RateWindow {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                last: None,
                hz: 0.0,
            }),
        }
    }

    /// Records an arrival now.
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    /// Records an arrival at `at`.
    pub fn tick_at(&self, at: Instant) {
        self.lock().push(at);
    }

    /// Current rate estimate in Hz, `0.0` until two spaced arrivals were seen.
    pub fn rate(&self) -> f64 {
        self.lock().hz
    }

    pub fn samples(&self) -> usize {
        self.lock().samples.len()
    }

    fn lock(&self) -> MutexGuard<'_, RateWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
