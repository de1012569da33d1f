//! Sliding-window rate estimation over sixty one-second buckets.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use strand_api::unix_secs;

/// Number of one-second buckets in the window.
const WINDOW_SECS: u64 = 60;

#[derive(Debug)]
struct MeterInner {
    buckets: [u64; WINDOW_SECS as usize],
    /// Second of the most recent bucket write.
    last_write: u64,
    /// Index of the bucket covering `last_write`.
    idx: usize,
}

impl MeterInner {
    /// Advance the window to `now`, zeroing every bucket that fell out of it.
    fn roll_forward(&mut self, now: u64) {
        let delta = now.saturating_sub(self.last_write);
        if delta >= WINDOW_SECS {
            self.buckets = [0; WINDOW_SECS as usize];
            self.idx = (now % WINDOW_SECS) as usize;
        } else {
            for _ in 0..delta {
                self.idx = (self.idx + 1) % WINDOW_SECS as usize;
                if let Some(bucket) = self.buckets.get_mut(self.idx) {
                    *bucket = 0;
                }
            }
        }
        self.last_write = now;
    }

    fn sum(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

/// Byte-rate estimator: the sum of the last sixty one-second buckets
/// divided by the window length.
#[derive(Debug)]
pub struct RateMeter {
    inner: Mutex<MeterInner>,
    /// Second of the most recent `add`, read by idle trimming.
    last_update: AtomicU64,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateMeter {
    pub fn new() -> Self {
        let now = unix_secs();
        Self {
            inner: Mutex::new(MeterInner {
                buckets: [0; WINDOW_SECS as usize],
                last_write: now,
                idx: (now % WINDOW_SECS) as usize,
            }),
            last_update: AtomicU64::new(0),
        }
    }

    /// Account `n` bytes against the current second.
    pub fn add(&self, n: u64) {
        self.add_at(unix_secs(), n);
    }

    pub(crate) fn add_at(&self, now: u64, n: u64) {
        self.last_update.store(now, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.roll_forward(now);
        let idx = inner.idx;
        if let Some(bucket) = inner.buckets.get_mut(idx) {
            *bucket += n;
        }
    }

    /// Bytes per second over the window. Always non-negative; zero after
    /// a full window of silence.
    pub fn rate(&self) -> f64 {
        self.rate_at(unix_secs())
    }

    pub(crate) fn rate_at(&self, now: u64) -> f64 {
        let mut inner = self.inner.lock();
        inner.roll_forward(now);
        inner.sum() as f64 / WINDOW_SECS as f64
    }

    /// Zero every bucket without touching the window position.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.buckets = [0; WINDOW_SECS as usize];
    }

    /// Second of the most recent `add`; zero when never written.
    pub fn last_update(&self) -> u64 {
        self.last_update.load(Ordering::Relaxed)
    }
}
