//! One mining job as announced by a destination pool, together with the
//! fingerprints of every share already accepted for it.

use std::collections::HashSet;

use sv1_api::{client_to_server::Submit, server_to_client::Notify, utils::HexBytes};

/// 20-byte key built from the only fields that are unique per share within a
/// job: `extra_nonce2[0:8] ‖ ntime[0:4] ‖ nonce[0:4] ‖ version_bits[0:4]`.
pub type ShareFingerprint = [u8; 20];

pub fn share_fingerprint(msg: &Submit) -> ShareFingerprint {
    let mut fp = [0u8; 20];

    let xn2 = msg.extra_nonce2.as_bytes();
    let n = xn2.len().min(8);
    fp[..n].copy_from_slice(&xn2[..n]);

    fp[8..12].copy_from_slice(&msg.time.to_be_bytes());
    fp[12..16].copy_from_slice(&msg.nonce.to_be_bytes());
    if let Some(vbits) = msg.version_bits {
        fp[16..20].copy_from_slice(&vbits.to_be_bytes());
    }

    fp
}

#[derive(Debug, Clone)]
pub struct MiningJob {
    notify: Notify,
    diff: f64,
    extra_nonce1: HexBytes,
    extra_nonce2_size: usize,
    shares: HashSet<ShareFingerprint>,
}

impl MiningJob {
    pub fn new(notify: Notify, diff: f64, extra_nonce1: HexBytes, extra_nonce2_size: usize) -> Self {
        Self {
            notify,
            diff,
            extra_nonce1,
            extra_nonce2_size,
            shares: HashSet::with_capacity(32),
        }
    }

    /// Returns true when an identical share was already recorded; records the
    /// fingerprint otherwise.
    pub fn check_duplicate_and_add_share(&mut self, msg: &Submit) -> bool {
        !self.shares.insert(share_fingerprint(msg))
    }

    pub fn notify(&self) -> &Notify {
        &self.notify
    }

    pub fn diff(&self) -> f64 {
        self.diff
    }

    pub fn extra_nonce1(&self) -> &HexBytes {
        &self.extra_nonce1
    }

    pub fn extra_nonce2_size(&self) -> usize {
        self.extra_nonce2_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sv1_api::utils::HexU32Be;

    fn submit(xn2: &str, ntime: u32, nonce: u32, vbits: Option<u32>) -> Submit {
        Submit {
            id: 1,
            user_name: "acct.w1".into(),
            job_id: "1".into(),
            extra_nonce2: HexBytes::try_from(xn2).unwrap(),
            time: HexU32Be(ntime),
            nonce: HexU32Be(nonce),
            version_bits: vbits.map(HexU32Be),
        }
    }

    #[test]
    fn fingerprint_is_bit_exact() {
        let s = submit("0001020304050607", 0x64ab_cdef, 0xdead_beef, Some(0));
        let fp = share_fingerprint(&s);
        assert_eq!(&fp[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&fp[8..12], &[0x64, 0xab, 0xcd, 0xef]);
        assert_eq!(&fp[12..16], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&fp[16..20], &[0, 0, 0, 0]);
    }

    #[test]
    fn fingerprint_differs_on_any_field() {
        let base = share_fingerprint(&submit("0001020304050607", 1, 2, Some(3)));
        assert_ne!(
            base,
            share_fingerprint(&submit("0101020304050607", 1, 2, Some(3)))
        );
        assert_ne!(base, share_fingerprint(&submit("0001020304050607", 9, 2, Some(3))));
        assert_ne!(base, share_fingerprint(&submit("0001020304050607", 1, 9, Some(3))));
        assert_ne!(base, share_fingerprint(&submit("0001020304050607", 1, 2, Some(9))));
    }
}
