//! Worker-name propagation towards destination pools.
//!
//! Keeping the source worker name in the destination lets the pool account
//! for each physical miner separately. Propagation must be skipped for
//! lightning-address payouts (either flavour) and for contract traffic,
//! where the username is a 20-byte hex contract address.

use alloy_primitives::Address;
use url::Url;

use crate::utils::{join_username, split_username};

/// Decides whether the destination username should carry the source worker
/// name. All of the following must hold: propagation not disabled by config,
/// the destination is not a lightning address ("@" in its username), the
/// destination host is not a pplp pool, and the source username is not a
/// contract address.
pub fn should_propagate_worker_name(
    not_propagate_worker_name: bool,
    incoming_user_name: &str,
    dest_url: &Url,
) -> bool {
    if not_propagate_worker_name {
        return false;
    }
    if has_lightning_address(dest_url) {
        return false;
    }
    if has_pplp_host(dest_url) {
        return false;
    }
    if is_contract_address(incoming_user_name) {
        return false;
    }
    true
}

/// Username to authorize with at the destination. The source worker name is
/// carried over only when propagation applies and the source username has an
/// `account.worker` shape; otherwise the destination username is used
/// verbatim.
pub fn dest_user_name(
    not_propagate_worker_name: bool,
    incoming_user_name: &str,
    dest_url: &Url,
) -> String {
    if should_propagate_worker_name(not_propagate_worker_name, incoming_user_name, dest_url) {
        let (_, worker_name, has_worker_name) = split_username(incoming_user_name);
        if has_worker_name {
            let (account_name, _, _) = split_username(dest_url.username());
            return join_username(account_name, worker_name);
        }
    }
    dest_url.username().to_string()
}

fn has_lightning_address(url: &Url) -> bool {
    percent_encoding::percent_decode_str(url.username())
        .decode_utf8_lossy()
        .contains('@')
}

/// Extra check for lightning payout pools.
fn has_pplp_host(url: &Url) -> bool {
    url.host_str()
        .map(|h| h.to_lowercase().contains("pplp"))
        .unwrap_or(false)
}

/// Contract traffic authorizes with the contract address as username; it
/// must never be rewritten.
fn is_contract_address(user_name: &str) -> bool {
    user_name.parse::<Address>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: &str = "0x731b297b728795d4d13bfe8066fd6476d21e1ab5";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn contract_address_detection_matches_hex_format() {
        assert!(is_contract_address(CONTRACT));
        assert!(is_contract_address(&CONTRACT[2..])); // without 0x
        assert!(!is_contract_address("acct.w1"));
        assert!(!is_contract_address("0x1234")); // too short
        assert!(!is_contract_address(
            "0x731b297b728795d4d13bfe8066fd6476d21e1agg" // not hex
        ));
    }

    // every combination of the five §worker-name conditions
    #[test]
    fn propagation_truth_table() {
        let sources = [("acct.w1", true), ("acctnodot", false), (CONTRACT, false)];
        let dests = [
            ("stratum+tcp://pooluser:p@pool.example.com:3333", true),
            ("stratum+tcp://user%40ln.io:p@pool.example.com:3333", false), // "@" in username
            ("stratum+tcp://pooluser:p@pplp.example.com:3333", false),     // pplp host
        ];
        for not_propagate in [false, true] {
            for (src, src_ok) in sources {
                for (dst, dst_ok) in dests {
                    let dst = url(dst);
                    let got = dest_user_name(not_propagate, src, &dst);
                    let propagated = !not_propagate && src_ok && dst_ok;
                    if propagated {
                        assert_eq!(got, "pooluser.w1", "src={src} dst={dst}");
                    } else {
                        assert_eq!(got, dst.username(), "src={src} dst={dst}");
                    }
                }
            }
        }
    }

    #[test]
    fn dest_account_with_worker_is_replaced_not_appended() {
        let dst = url("stratum+tcp://pooluser.oldworker:p@pool.example.com:3333");
        assert_eq!(dest_user_name(false, "acct.w7", &dst), "pooluser.w7");
    }
}
