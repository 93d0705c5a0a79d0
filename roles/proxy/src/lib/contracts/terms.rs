//! Hashrate contract terms as read from the chain.

use std::time::{Duration, SystemTime};

use url::Url;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockchainState {
    Available,
    Running,
}

impl std::fmt::Display for BlockchainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockchainState::Available => write!(f, "available"),
            BlockchainState::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    /// Seller contracts are not validated locally.
    NotApplicable,
    NotValidating,
    Validating,
    Finished,
}

impl std::fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationStage::NotApplicable => write!(f, "not applicable"),
            ValidationStage::NotValidating => write!(f, "not validating"),
            ValidationStage::Validating => write!(f, "validating"),
            ValidationStage::Finished => write!(f, "finished"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractState {
    Pending,
    Running,
}

impl std::fmt::Display for ContractState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractState::Pending => write!(f, "pending"),
            ContractState::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractRole {
    Seller,
    Buyer,
}

impl std::fmt::Display for ContractRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractRole::Seller => write!(f, "seller"),
            ContractRole::Buyer => write!(f, "buyer"),
        }
    }
}

/// Common contract fields; the destination comes in encrypted and only the
/// seller node can recover it.
#[derive(Debug, Clone)]
pub struct TermsBase {
    pub contract_id: String,
    pub seller: String,
    pub buyer: String,
    pub starts_at: Option<SystemTime>,
    pub duration: Duration,
    pub hashrate_ghs: f64,
    pub state: BlockchainState,
}

impl TermsBase {
    pub fn end_time(&self) -> Option<SystemTime> {
        self.starts_at.map(|t| t + self.duration)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.starts_at
            .and_then(|t| SystemTime::now().duration_since(t).ok())
    }
}

/// Terms as visible to buyers: the destination is ciphertext.
#[derive(Debug, Clone)]
pub struct EncryptedTerms {
    pub base: TermsBase,
    pub dest_encrypted: String,
}

/// Terms after local decryption with the seller's private key.
#[derive(Debug, Clone)]
pub struct Terms {
    pub base: TermsBase,
    pub dest: Option<Url>,
}

/// Recovers destination URLs from contract ciphertext. The ECIES key
/// machinery lives outside the core; only this narrow interface is consumed.
pub trait DestDecryptor: Send + Sync {
    fn decrypt_dest(&self, ciphertext: &str, priv_key: &str) -> Result<String, Error>;
}

impl EncryptedTerms {
    pub fn decrypt(
        &self,
        decryptor: &dyn DestDecryptor,
        priv_key: &str,
    ) -> Result<Terms, Error> {
        let dest = if self.dest_encrypted.is_empty() {
            None
        } else {
            let plain = decryptor.decrypt_dest(&self.dest_encrypted, priv_key)?;
            Some(Url::parse(&plain)?)
        };
        Ok(Terms {
            base: self.base.clone(),
            dest,
        })
    }
}

/// Passthrough for terms whose destination is stored in the clear (local
/// ad-hoc contracts and tests).
pub struct PlainTextDecryptor;

impl DestDecryptor for PlainTextDecryptor {
    fn decrypt_dest(&self, ciphertext: &str, _priv_key: &str) -> Result<String, Error> {
        Ok(ciphertext.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TermsBase {
        TermsBase {
            contract_id: "0x731b297b728795d4d13bfe8066fd6476d21e1ab5".into(),
            seller: "0xseller".into(),
            buyer: "0xbuyer".into(),
            starts_at: Some(SystemTime::now() - Duration::from_secs(60)),
            duration: Duration::from_secs(3600),
            hashrate_ghs: 500.0,
            state: BlockchainState::Running,
        }
    }

    #[test]
    fn end_time_is_start_plus_duration() {
        let b = base();
        let end = b.end_time().unwrap();
        assert_eq!(end, b.starts_at.unwrap() + Duration::from_secs(3600));
        assert!(b.elapsed().unwrap() >= Duration::from_secs(60));
    }

    #[test]
    fn empty_ciphertext_means_no_dest() {
        let terms = EncryptedTerms {
            base: base(),
            dest_encrypted: "".into(),
        };
        let dec = terms.decrypt(&PlainTextDecryptor, "key").unwrap();
        assert!(dec.dest.is_none());
    }

    #[test]
    fn decrypted_dest_must_be_a_url() {
        let terms = EncryptedTerms {
            base: base(),
            dest_encrypted: "stratum+tcp://0xctr:x@buyer.example.com:3333".into(),
        };
        let dec = terms.decrypt(&PlainTextDecryptor, "key").unwrap();
        assert_eq!(dec.dest.unwrap().host_str(), Some("buyer.example.com"));

        let bad = EncryptedTerms {
            base: base(),
            dest_encrypted: "not a url".into(),
        };
        assert!(bad.decrypt(&PlainTextDecryptor, "key").is_err());
    }
}
