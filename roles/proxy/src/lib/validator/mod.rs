//! Share validation against the proof-of-work rules.
//!
//! One validator per destination connection. Jobs announced by the pool are
//! kept in a bounded insertion-ordered cache; every submitted share is
//! checked for job existence, duplication and difficulty before the proxy
//! acknowledges it to the miner.

use std::{fmt, sync::Mutex as StdMutex};

use sv1_api::{
    client_to_server::Submit,
    server_to_client::Notify,
    utils::{HexBytes, HexU32Be},
};
use tracing::warn;

use crate::collections::BoundedStackMap;

pub mod job;
pub mod pow;

pub use job::{share_fingerprint, MiningJob, ShareFingerprint};

pub const JOB_CACHE_SIZE: usize = 30;

#[derive(Debug, PartialEq)]
pub enum ValidationError {
    JobNotFound,
    DuplicateShare,
    LowDifficulty { expected: f64, actual: u64 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::JobNotFound => write!(f, "job not found"),
            ValidationError::DuplicateShare => write!(f, "duplicate share"),
            ValidationError::LowDifficulty { expected, actual } => {
                write!(f, "low difficulty: expected {expected:.2} actual {actual}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub struct Validator {
    jobs: StdMutex<BoundedStackMap<MiningJob>>,
    version_rolling_mask: StdMutex<HexU32Be>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self {
            jobs: StdMutex::new(BoundedStackMap::new(JOB_CACHE_SIZE)),
            version_rolling_mask: StdMutex::new(HexU32Be(0)),
        }
    }

    /// Configured at version-rolling negotiation time; only bits within the
    /// mask may be altered in the block version before hashing.
    pub fn set_version_rolling_mask(&self, mask: HexU32Be) {
        *self.version_rolling_mask.lock().unwrap() = mask;
    }

    pub fn add_new_job(&self, msg: &Notify, diff: f64, xn1: HexBytes, xn2size: usize) {
        let job = MiningJob::new(msg.clone(), diff, xn1, xn2size);
        self.jobs.lock().unwrap().push(&msg.job_id, job);
    }

    pub fn has_job(&self, job_id: &str) -> bool {
        self.jobs.lock().unwrap().contains(job_id)
    }

    pub fn latest_job(&self) -> Option<MiningJob> {
        self.jobs.lock().unwrap().at(-1).cloned()
    }

    /// Authenticates one share. On success records its fingerprint and
    /// returns the difficulty the share actually met.
    pub fn validate_and_add_share(&self, msg: &Submit) -> Result<f64, ValidationError> {
        let mask = *self.version_rolling_mask.lock().unwrap();
        let mut jobs = self.jobs.lock().unwrap();

        let job = jobs
            .get_mut(&msg.job_id)
            .ok_or(ValidationError::JobNotFound)?;

        if job.check_duplicate_and_add_share(msg) {
            return Err(ValidationError::DuplicateShare);
        }

        let (actual, ok) = pow::validate_diff(job, msg, mask);
        if !ok {
            let err = ValidationError::LowDifficulty {
                expected: job.diff(),
                actual,
            };
            warn!(
                "{err}; xn={}, xnsize={}, diff={}, vrmask={}",
                String::from(job.extra_nonce1()),
                job.extra_nonce2_size(),
                job.diff() as u64,
                String::from(mask),
            );
            return Err(err);
        }

        Ok(actual as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // mainnet block 100000 expressed as a stratum job: its coinbase is
    // split around 8 scriptsig bytes standing in for extranonce1/2, the
    // merkle branch is the coinbase path over the block's 4 transactions,
    // and the real nonce yields the known hash
    // 000000000003ba27aa200b1cecaad478d2b00432346c3f1f3986da1afd33e506,
    // which meets pool difficulty 17583.
    pub(crate) fn test_job_notify() -> Notify {
        Notify {
            job_id: "100000".to_string(),
            prev_hash: "1901125004612a1701c3a621d930d31d36b607df1fccc2160002d01c00000000"
                .try_into()
                .unwrap(),
            coin_base1: "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff08"
                .try_into()
                .unwrap(),
            coin_base2: "ffffffff0100f2052a010000004341041b0e8c2567c12536aa13357b79a073dc4444acb83c4ec7a0e2f99dd7457516c5817242da796924ca4e99947d087fedf9ce467cb9f7c6287078f801df276fdf84ac00000000"
                .try_into()
                .unwrap(),
            merkle_branch: vec![
                "c40297f730dd7b5a99567eb8d27b78758f607507c52292d02d4031895b52f2ff"
                    .try_into()
                    .unwrap(),
                "49aef42d78e3e9999c9e6ec9e1dddd6cb880bf3b076a03be1318ca789089308e"
                    .try_into()
                    .unwrap(),
            ],
            version: HexU32Be(0x00000001),
            bits: HexU32Be(0x1b04864c),
            time: HexU32Be(0x4d1b2237),
            clean_jobs: false,
        }
    }

    pub(crate) const TEST_EXTRANONCE1: &str = "044c8604";
    pub(crate) const TEST_EXTRANONCE2: &str = "1b020602";
    pub(crate) const TEST_NONCE: u32 = 0x10572b0f;
    pub(crate) const TEST_SHARE_DIFF: u64 = 17583;

    pub(crate) fn test_submit(nonce: u32) -> Submit {
        Submit {
            id: 4,
            user_name: "acct.w1".into(),
            job_id: "100000".into(),
            extra_nonce2: TEST_EXTRANONCE2.try_into().unwrap(),
            time: HexU32Be(0x4d1b2237),
            nonce: HexU32Be(nonce),
            version_bits: None,
        }
    }

    fn validator_with_job(diff: f64) -> Validator {
        let v = Validator::new();
        v.add_new_job(
            &test_job_notify(),
            diff,
            TEST_EXTRANONCE1.try_into().unwrap(),
            4,
        );
        v
    }

    #[test]
    fn unknown_job_is_rejected() {
        let v = validator_with_job(1000.0);
        let mut s = test_submit(TEST_NONCE);
        s.job_id = "missing".into();
        assert_eq!(
            v.validate_and_add_share(&s).unwrap_err(),
            ValidationError::JobNotFound
        );
    }

    #[test]
    fn valid_share_is_accepted_once() {
        let v = validator_with_job(1000.0);
        let s = test_submit(TEST_NONCE);

        let diff = v.validate_and_add_share(&s).expect("share meets job diff");
        assert_eq!(diff as u64, TEST_SHARE_DIFF);

        // identical fingerprint: second submission is a duplicate
        assert_eq!(
            v.validate_and_add_share(&s).unwrap_err(),
            ValidationError::DuplicateShare
        );
    }

    #[test]
    fn share_above_job_difficulty_target_is_rejected() {
        // the share really meets 17583: one notch above must fail
        let v = validator_with_job((TEST_SHARE_DIFF + 1) as f64);
        let s = test_submit(TEST_NONCE);
        match v.validate_and_add_share(&s).unwrap_err() {
            ValidationError::LowDifficulty { expected, actual } => {
                assert_eq!(expected as u64, TEST_SHARE_DIFF + 1);
                assert_eq!(actual, TEST_SHARE_DIFF);
            }
            other => panic!("expected low difficulty, got {other:?}"),
        }

        // and exactly at the met difficulty it passes
        let v = validator_with_job(TEST_SHARE_DIFF as f64);
        assert!(v.validate_and_add_share(&test_submit(TEST_NONCE)).is_ok());
    }

    #[test]
    fn share_below_target_is_low_difficulty() {
        let v = validator_with_job(1000.0);
        // a nonce that was not mined will practically never meet the target
        let s = test_submit(TEST_NONCE.wrapping_add(1));
        match v.validate_and_add_share(&s).unwrap_err() {
            ValidationError::LowDifficulty { expected, .. } => assert_eq!(expected, 1000.0),
            other => panic!("expected low difficulty, got {other:?}"),
        }
    }

    #[test]
    fn job_cache_evicts_after_capacity() {
        let v = Validator::new();
        for i in 0..=JOB_CACHE_SIZE {
            let mut notify = test_job_notify();
            notify.job_id = format!("job-{i}");
            v.add_new_job(&notify, 1000.0, TEST_EXTRANONCE1.try_into().unwrap(), 4);
        }
        // 31 distinct jobs pushed: the first one is gone
        assert!(!v.has_job("job-0"));
        assert!(v.has_job(&format!("job-{JOB_CACHE_SIZE}")));

        let mut s = test_submit(TEST_NONCE);
        s.job_id = "job-0".into();
        assert_eq!(
            v.validate_and_add_share(&s).unwrap_err(),
            ValidationError::JobNotFound
        );
    }

    #[test]
    fn latest_job_is_last_pushed() {
        let v = Validator::new();
        for i in 0..3 {
            let mut notify = test_job_notify();
            notify.job_id = format!("job-{i}");
            v.add_new_job(&notify, 1000.0, TEST_EXTRANONCE1.try_into().unwrap(), 4);
        }
        assert_eq!(v.latest_job().unwrap().notify().job_id, "job-2");
    }
}
