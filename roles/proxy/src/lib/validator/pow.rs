//! Proof-of-work arithmetic: reconstructing the block header a share stands
//! for and comparing its double-SHA256 against the pool difficulty target.

use bitcoin::{
    block::{Header, Version},
    hashes::{sha256d, Hash},
    BlockHash, CompactTarget, TxMerkleNode,
};
use primitive_types::U256;
use sv1_api::{client_to_server::Submit, utils::HexU32Be};

use super::job::MiningJob;

// pool difficulty 1 target, big endian:
// 0x00000000ffff0000000000000000000000000000000000000000000000000000
const DIFF1_BYTES: [u8; 32] = [
    0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];

pub fn diff1_target() -> U256 {
    U256::from_big_endian(&DIFF1_BYTES)
}

/// Target a share must stay below to count at the given pool difficulty.
pub fn difficulty_to_target(diff: u64) -> U256 {
    if diff == 0 {
        return diff1_target();
    }
    diff1_target() / U256::from(diff)
}

/// Pool difficulty the given header hash (big endian integer) actually met.
pub fn hash_to_difficulty(hash: &U256) -> u64 {
    if hash.is_zero() {
        return u64::MAX;
    }
    let diff = diff1_target() / *hash;
    if diff > U256::from(u64::MAX) {
        u64::MAX
    } else {
        diff.low_u64()
    }
}

/// Double-SHA256 of the coinbase folded through the merkle branches,
/// in internal byte order.
fn merkle_root(coinbase: &[u8], branches: &[sv1_api::utils::HexBytes]) -> [u8; 32] {
    let mut root = sha256d::Hash::hash(coinbase).to_byte_array();
    for branch in branches {
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&root);
        concat[32..].copy_from_slice(branch.as_bytes());
        root = sha256d::Hash::hash(&concat).to_byte_array();
    }
    root
}

/// Rebuilds the header for a submitted share and returns its hash as a big
/// endian integer. Version rolling only alters bits inside the negotiated
/// mask.
pub fn share_hash(job: &MiningJob, msg: &Submit, version_mask: HexU32Be) -> U256 {
    let notify = job.notify();

    let mut coinbase = Vec::with_capacity(
        notify.coin_base1.len()
            + job.extra_nonce1().len()
            + msg.extra_nonce2.len()
            + notify.coin_base2.len(),
    );
    coinbase.extend_from_slice(notify.coin_base1.as_bytes());
    coinbase.extend_from_slice(job.extra_nonce1().as_bytes());
    coinbase.extend_from_slice(msg.extra_nonce2.as_bytes());
    coinbase.extend_from_slice(notify.coin_base2.as_bytes());

    let root = merkle_root(&coinbase, &notify.merkle_branch);

    let mask = version_mask.0;
    let version_bits = msg.version_bits.map(|v| v.0).unwrap_or(0);
    let version = (notify.version.0 & !mask) | (version_bits & mask);

    let header = Header {
        version: Version::from_consensus(version as i32),
        prev_blockhash: BlockHash::from_byte_array(notify.prev_hash.0),
        merkle_root: TxMerkleNode::from_byte_array(root),
        time: msg.time.0,
        bits: CompactTarget::from_consensus(notify.bits.0),
        nonce: msg.nonce.0,
    };

    let hash = header.block_hash().to_byte_array(); // internal (little endian) order
    U256::from_little_endian(&hash)
}

/// Checks a share against the job difficulty. Returns the difficulty the
/// share actually met and whether it satisfies the job target.
pub fn validate_diff(job: &MiningJob, msg: &Submit, version_mask: HexU32Be) -> (u64, bool) {
    let hash = share_hash(job, msg, version_mask);
    let target = difficulty_to_target(job.diff() as u64);
    (hash_to_difficulty(&hash), hash <= target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff1_target_has_expected_magnitude() {
        let t = diff1_target();
        // 0xffff << 208
        assert_eq!(t, (U256::from(0xffffu64)) << 208);
    }

    #[test]
    fn target_halves_when_difficulty_doubles() {
        let t1 = difficulty_to_target(1);
        let t2 = difficulty_to_target(2);
        assert_eq!(t1 / 2, t2);
    }

    #[test]
    fn hash_to_difficulty_is_inverse_of_target() {
        for diff in [1u64, 1000, 65536, 1 << 40] {
            let target = difficulty_to_target(diff);
            // a hash exactly at the target meets exactly the difficulty
            assert_eq!(hash_to_difficulty(&target), diff);
            // one above the target is below the difficulty
            assert!(hash_to_difficulty(&(target + U256::from(1u64))) < diff || diff == 1);
        }
    }

    #[test]
    fn zero_hash_saturates() {
        assert_eq!(hash_to_difficulty(&U256::zero()), u64::MAX);
    }

    // coinbase + merkle fold + header assembly reproduce a real block hash
    #[test]
    fn reconstructs_real_block_header_hash() {
        use crate::validator::tests::{
            test_job_notify, test_submit, TEST_EXTRANONCE1, TEST_NONCE, TEST_SHARE_DIFF,
        };

        let job = MiningJob::new(
            test_job_notify(),
            1000.0,
            TEST_EXTRANONCE1.try_into().unwrap(),
            4,
        );
        let submit = test_submit(TEST_NONCE);

        let hash = share_hash(&job, &submit, HexU32Be(0));
        let expected = U256::from_str_radix(
            "000000000003ba27aa200b1cecaad478d2b00432346c3f1f3986da1afd33e506",
            16,
        )
        .unwrap();
        assert_eq!(hash, expected);

        assert_eq!(hash_to_difficulty(&hash), TEST_SHARE_DIFF);

        let (actual, ok) = validate_diff(&job, &submit, HexU32Be(0));
        assert!(ok, "the block hash is far below the job target");
        assert_eq!(actual, TEST_SHARE_DIFF);
        assert!(hash <= difficulty_to_target(1000));
    }
}
