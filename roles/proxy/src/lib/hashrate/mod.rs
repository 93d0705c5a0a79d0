//! Hashrate estimation from submitted share difficulty.
//!
//! A [`Hashrate`] is a bag of named counters fed by every validated share.
//! `GHS = submitted work × 2³² / 10⁹ / elapsed seconds`.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

pub mod counter;
pub mod global;

pub use counter::{Counter, Ema, Mean};
pub use global::GlobalHashrate;

const HASHES_PER_DIFF: f64 = 4_294_967_296.0; // 2^32

/// Converts a submitted-work rate (difficulty per second) to GH/s.
pub fn job_submitted_to_ghs(job_per_second: f64) -> f64 {
    job_per_second * HASHES_PER_DIFF / 1e9
}

/// Converts GH/s to the submitted-work rate (difficulty per second) it
/// corresponds to.
pub fn ghs_to_job_submitted(ghs: f64) -> f64 {
    ghs * 1e9 / HASHES_PER_DIFF
}

pub type HashrateFactory = Arc<dyn Fn() -> Hashrate + Send + Sync>;

/// Named counters over submitted difficulty. The `"mean"` counter is always
/// present and additionally carries total work and submit times.
pub struct Hashrate {
    emas: Vec<(String, Ema)>,
    mean: Mean,
}

impl std::fmt::Debug for Hashrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hashrate")
            .field("total_work", &self.mean.total_work())
            .finish()
    }
}

impl Hashrate {
    pub fn new(windows: &[(&str, Duration)]) -> Self {
        Self {
            emas: windows
                .iter()
                .map(|(id, w)| (id.to_string(), Ema::new(*w)))
                .collect(),
            mean: Mean::new(),
        }
    }

    /// Counters used across the role: 5 and 30 minute EMAs plus the mean.
    pub fn default_factory() -> HashrateFactory {
        Arc::new(|| {
            Hashrate::new(&[
                ("ema-5m", Duration::from_secs(5 * 60)),
                ("ema-30m", Duration::from_secs(30 * 60)),
            ])
        })
    }

    pub fn on_submit(&self, diff: f64) {
        self.mean.add(diff);
        for (_, ema) in &self.emas {
            ema.add(diff);
        }
    }

    /// Average GH/s as seen by the given counter, `None` for unknown ids.
    pub fn hashrate_avg_ghs(&self, counter_id: &str) -> Option<f64> {
        if counter_id == "mean" {
            let per_second = self.mean.value_per(Duration::from_secs(1));
            return Some(job_submitted_to_ghs(per_second));
        }
        self.emas
            .iter()
            .find(|(id, _)| id == counter_id)
            .map(|(_, ema)| job_submitted_to_ghs(ema.value_per(Duration::from_secs(1))))
    }

    pub fn hashrate_avg_ghs_all(&self) -> HashMap<String, f64> {
        let mut all: HashMap<String, f64> = self
            .emas
            .iter()
            .map(|(id, ema)| {
                (
                    id.clone(),
                    job_submitted_to_ghs(ema.value_per(Duration::from_secs(1))),
                )
            })
            .collect();
        all.insert(
            "mean".to_string(),
            self.hashrate_avg_ghs("mean").unwrap_or(0.0),
        );
        all
    }

    pub fn total_work(&self) -> u64 {
        self.mean.total_work()
    }

    pub fn last_submit_time(&self) -> Option<SystemTime> {
        self.mean.last_submit_time()
    }

    pub fn first_submit_time(&self) -> Option<SystemTime> {
        self.mean.first_submit_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ghs_conversions_are_inverse() {
        let ghs = 500.0;
        let job = ghs_to_job_submitted(ghs);
        assert!((job_submitted_to_ghs(job) - ghs).abs() < 1e-9);
    }

    #[test]
    fn one_diff_per_second_is_about_4_3_ghs() {
        let ghs = job_submitted_to_ghs(1.0);
        assert!((ghs - 4.294967296).abs() < 1e-9);
    }

    #[test]
    fn unknown_counter_is_none() {
        let hr = (Hashrate::default_factory())();
        assert!(hr.hashrate_avg_ghs("ema-7d").is_none());
        assert!(hr.hashrate_avg_ghs("mean").is_some());
    }

    #[test]
    fn on_submit_feeds_every_counter() {
        let hr = (Hashrate::default_factory())();
        hr.on_submit(8000.0);
        assert_eq!(hr.total_work(), 8000);
        let all = hr.hashrate_avg_ghs_all();
        assert!(all.contains_key("ema-5m"));
        assert!(all.contains_key("ema-30m"));
        assert!(all.contains_key("mean"));
        assert!(all["ema-5m"] > 0.0);
    }
}
