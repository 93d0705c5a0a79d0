//! The contract store: an opaque, event-sourced view of the on-chain
//! marketplace. The core only consumes this narrow interface; the
//! Ethereum-backed implementation lives outside it.

use std::{fmt, future::Future};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::terms::EncryptedTerms;

/// Maximum consecutive reconnects of an event subscription before its
/// consumer is given up on.
pub const SUBSCRIPTION_MAX_RECONNECTS: usize = 50;

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Rpc(String),
    SubscriptionClosed,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "contract not found: {id}"),
            StoreError::Rpc(e) => write!(f, "rpc error: {e}"),
            StoreError::SubscriptionClosed => write!(f, "subscription closed"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseoutType {
    /// Buyer-side closeout on underdelivery.
    Cancel,
    /// Seller-side clean end without claiming payout.
    WithoutClaim,
    /// Seller-side end claiming payout.
    WithClaim,
}

/// Clone-factory lifecycle events; a closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneFactoryEvent {
    ContractCreated { address: String },
    ContractPurchased { address: String },
    ContractDeleteUpdated { address: String },
}

/// Per-contract events; a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractEvent {
    Purchased,
    Closed,
    CipherTextUpdated,
    PurchaseInfoUpdated,
}

/// A live event stream plus its error side-channel. Dropping or
/// unsubscribing ends the feed.
pub struct Subscription<T> {
    events: async_channel::Receiver<T>,
    errors: async_channel::Receiver<StoreError>,
    quit: CancellationToken,
}

impl<T: Send + 'static> Subscription<T> {
    pub fn events(&self) -> &async_channel::Receiver<T> {
        &self.events
    }

    pub fn errors(&self) -> &async_channel::Receiver<StoreError> {
        &self.errors
    }

    pub fn unsubscribe(&self) {
        self.quit.cancel();
    }

    /// Wraps a reconnecting watch loop around `connect`, which produces one
    /// upstream event feed per call. Consecutive failed connects count
    /// towards [`SUBSCRIPTION_MAX_RECONNECTS`]; a delivered event resets the
    /// counter.
    pub fn watch<C, F>(connect: C) -> Self
    where
        C: Fn() -> F + Send + 'static,
        F: Future<Output = Result<async_channel::Receiver<T>, StoreError>> + Send,
    {
        let (event_tx, event_rx) = async_channel::unbounded();
        let (error_tx, error_rx) = async_channel::bounded(1);
        let quit = CancellationToken::new();

        let quit_loop = quit.clone();
        tokio::spawn(async move {
            let mut attempts = 0;
            let mut last_err = StoreError::SubscriptionClosed;
            while attempts < SUBSCRIPTION_MAX_RECONNECTS {
                attempts += 1;
                let feed = tokio::select! {
                    _ = quit_loop.cancelled() => return,
                    feed = connect() => feed,
                };
                let feed = match feed {
                    Ok(feed) => feed,
                    Err(e) => {
                        last_err = e;
                        continue;
                    }
                };
                if attempts > 1 {
                    warn!("subscription reconnected due to error: {last_err}");
                }
                loop {
                    let event = tokio::select! {
                        _ = quit_loop.cancelled() => return,
                        event = feed.recv() => event,
                    };
                    match event {
                        Ok(event) => {
                            attempts = 0;
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => {
                            last_err = StoreError::SubscriptionClosed;
                            break;
                        }
                    }
                }
            }
            let _ = error_tx.send(last_err).await;
        });

        Self {
            events: event_rx,
            errors: error_rx,
            quit,
        }
    }

    /// A subscription fed directly from a channel, without reconnection.
    pub fn from_channel(events: async_channel::Receiver<T>) -> Self {
        let (_error_tx, errors) = async_channel::bounded(1);
        Self {
            events,
            errors,
            quit: CancellationToken::new(),
        }
    }
}

/// Event-sourced repository of hashrate contracts.
#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn contract_ids(&self) -> Result<Vec<String>, StoreError>;
    async fn get_terms(&self, contract_id: &str) -> Result<EncryptedTerms, StoreError>;
    async fn purchase(&self, contract_id: &str, priv_key: &str) -> Result<(), StoreError>;
    async fn close(
        &self,
        contract_id: &str,
        closeout_type: CloseoutType,
        priv_key: &str,
    ) -> Result<(), StoreError>;
    async fn subscribe_clone_factory(&self)
        -> Result<Subscription<CloneFactoryEvent>, StoreError>;
    async fn subscribe_contract(
        &self,
        contract_id: &str,
    ) -> Result<Subscription<ContractEvent>, StoreError>;
}
