//! Submit-driven work counters.

use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Mutex as StdMutex,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// A rolling estimator over submitted difficulty.
pub trait Counter: Send + Sync {
    fn add(&self, v: f64);
    /// Accumulated work as seen by this counter.
    fn value(&self) -> f64;
    /// Work per `interval`, e.g. `value_per(1s)` is the work rate.
    fn value_per(&self, interval: Duration) -> f64;
}

/// Arithmetic mean since the first submit. Also tracks total work and the
/// first/last submit times, all lock-free.
#[derive(Debug, Default)]
pub struct Mean {
    total_work: AtomicU64,
    first_submit_time: AtomicI64, // unix seconds, 0 = no submit yet
    last_submit_time: AtomicI64,
}

impl Mean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_work(&self) -> u64 {
        self.total_work.load(Ordering::Relaxed)
    }

    pub fn first_submit_time(&self) -> Option<SystemTime> {
        match self.first_submit_time.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(UNIX_EPOCH + Duration::from_secs(secs as u64)),
        }
    }

    pub fn last_submit_time(&self) -> Option<SystemTime> {
        match self.last_submit_time.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(UNIX_EPOCH + Duration::from_secs(secs as u64)),
        }
    }

    pub fn total_duration(&self) -> Duration {
        let first = self.first_submit_time.load(Ordering::Relaxed);
        if first == 0 {
            return Duration::ZERO;
        }
        let elapsed = unix_now() - first;
        Duration::from_secs(elapsed.max(0) as u64)
    }
}

impl Counter for Mean {
    fn add(&self, v: f64) {
        self.total_work.fetch_add(v as u64, Ordering::Relaxed);
        let now = unix_now();
        let _ = self
            .first_submit_time
            .compare_exchange(0, now, Ordering::Relaxed, Ordering::Relaxed);
        self.last_submit_time.store(now, Ordering::Relaxed);
    }

    fn value(&self) -> f64 {
        self.total_work() as f64
    }

    fn value_per(&self, interval: Duration) -> f64 {
        let total = self.total_duration();
        if total.is_zero() {
            return 0.0;
        }
        self.value() / (total.as_secs_f64() / interval.as_secs_f64())
    }
}

/// Exponential moving accumulator over a time window. Each added value decays
/// with age, so `value()` approximates the work done during the last
/// `window`, and `value_per` the corresponding rate.
#[derive(Debug)]
pub struct Ema {
    window: Duration,
    state: StdMutex<EmaState>,
}

#[derive(Debug)]
struct EmaState {
    value: f64,
    last_update: Option<Instant>,
}

impl Ema {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: StdMutex::new(EmaState {
                value: 0.0,
                last_update: None,
            }),
        }
    }

    fn decayed(&self, state: &EmaState) -> f64 {
        match state.last_update {
            None => 0.0,
            Some(at) => {
                let elapsed = at.elapsed().as_secs_f64();
                state.value * (-elapsed / self.window.as_secs_f64()).exp()
            }
        }
    }
}

impl Counter for Ema {
    fn add(&self, v: f64) {
        let mut state = self.state.lock().unwrap();
        state.value = self.decayed(&state) + v;
        state.last_update = Some(Instant::now());
    }

    fn value(&self) -> f64 {
        let state = self.state.lock().unwrap();
        self.decayed(&state)
    }

    fn value_per(&self, interval: Duration) -> f64 {
        self.value() / (self.window.as_secs_f64() / interval.as_secs_f64())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_accumulates_work() {
        let m = Mean::new();
        m.add(1000.0);
        m.add(500.0);
        assert_eq!(m.total_work(), 1500);
        assert!(m.first_submit_time().is_some());
        assert!(m.last_submit_time().is_some());
    }

    #[test]
    fn ema_accumulates_and_decays() {
        let e = Ema::new(Duration::from_secs(300));
        e.add(1000.0);
        e.add(1000.0);
        let v = e.value();
        // no meaningful time passed: close to the submitted sum
        assert!(v > 1990.0 && v <= 2000.0);
        // rate over a full window equals the accumulated value
        let per_window = e.value_per(Duration::from_secs(300));
        assert!((per_window - v).abs() < 1.0);
    }

    #[test]
    fn empty_counters_report_zero() {
        assert_eq!(Mean::new().value_per(Duration::from_secs(1)), 0.0);
        assert_eq!(Ema::new(Duration::from_secs(60)).value(), 0.0);
    }
}
