//! Hashrate contracts: terms, the opaque store interface, per-role watchers
//! and the manager that tracks every contract we are party to.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    allocator::Allocator,
    error::Error,
    hashrate::{GlobalHashrate, HashrateFactory},
    scheduler::StratumProxy,
};

pub mod buyer;
pub mod manager;
pub mod seller;
pub mod store;
pub mod terms;

pub use buyer::{BuyerConfig, ContractWatcherBuyer, ControllerBuyer};
pub use manager::ContractManager;
pub use seller::{ContractWatcherSeller, ControllerSeller};
pub use store::{CloseoutType, CloneFactoryEvent, ContractEvent, ContractStore, Subscription};
pub use terms::{
    BlockchainState, ContractRole, ContractState, DestDecryptor, EncryptedTerms, Terms,
    ValidationStage,
};

/// A running fulfillment or validation loop: cancel to stop, await `done`
/// for its outcome.
pub(crate) struct WatchHandle {
    cancel: CancellationToken,
    done: oneshot::Receiver<Result<(), Error>>,
}

impl WatchHandle {
    pub(crate) fn new(cancel: CancellationToken, done: oneshot::Receiver<Result<(), Error>>) -> Self {
        Self { cancel, done }
    }

    pub(crate) async fn done(&mut self) -> Result<(), Error> {
        match (&mut self.done).await {
            Ok(res) => res,
            Err(_) => Err(Error::Cancelled),
        }
    }

    pub(crate) async fn stop(&mut self) {
        self.cancel.cancel();
        let _ = (&mut self.done).await;
    }
}

/// One tracked contract, seller or buyer side.
#[async_trait]
pub trait Contract: Send + Sync {
    fn id(&self) -> String;
    fn role(&self) -> ContractRole;
    fn state(&self) -> ContractState;
    fn blockchain_state(&self) -> BlockchainState;
    fn validation_stage(&self) -> ValidationStage;
    fn seller(&self) -> String;
    fn buyer(&self) -> String;
    fn dest(&self) -> String;
    fn hashrate_ghs(&self) -> f64;
    fn starts_at(&self) -> Option<SystemTime>;
    fn end_time(&self) -> Option<SystemTime>;
    fn duration(&self) -> Duration;
    fn fulfillment_started_at(&self) -> Option<SystemTime>;
    fn hashrate_actual_ghs(&self) -> HashMap<String, f64>;
    async fn run(&self, cancel: &CancellationToken) -> Result<(), Error>;
}

/// Builds the right controller for contract terms, depending on which side
/// of the contract this node's wallet is on.
pub type ContractFactoryFn =
    Arc<dyn Fn(EncryptedTerms) -> Result<Arc<dyn Contract>, Error> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ContractFactoryConfig {
    pub cycle_duration: Duration,
    pub validation_start_timeout: Duration,
    pub share_timeout: Duration,
    pub hr_error_threshold: f64,
    pub hashrate_error_interval: Duration,
}

/// The production factory: the local wallet address decides the role.
#[allow(clippy::too_many_arguments)]
pub fn contract_factory<P: StratumProxy + Clone + 'static>(
    owner_address: &str,
    priv_key: &str,
    config: ContractFactoryConfig,
    allocator: Arc<Allocator<P>>,
    hashrate_factory: HashrateFactory,
    global_hashrate: Arc<GlobalHashrate>,
    store: Arc<dyn ContractStore>,
    decryptor: Arc<dyn DestDecryptor>,
) -> ContractFactoryFn {
    let owner_address = owner_address.to_lowercase();
    let priv_key = priv_key.to_string();
    Arc::new(move |terms: EncryptedTerms| {
        if terms.base.seller.to_lowercase() == owner_address {
            let decrypted = terms.decrypt(decryptor.as_ref(), &priv_key)?;
            let watcher = Arc::new(ContractWatcherSeller::new(
                decrypted,
                config.cycle_duration,
                hashrate_factory.clone(),
                allocator.clone(),
            ));
            let contract: Arc<dyn Contract> = Arc::new(ControllerSeller::new(
                watcher,
                store.clone(),
                decryptor.clone(),
                &priv_key,
            ));
            return Ok(contract);
        }
        if terms.base.buyer.to_lowercase() == owner_address {
            let watcher = Arc::new(ContractWatcherBuyer::new(
                terms,
                BuyerConfig {
                    cycle_duration: config.cycle_duration,
                    validation_start_timeout: config.validation_start_timeout,
                    share_timeout: config.share_timeout,
                    hr_error_threshold: config.hr_error_threshold,
                    hashrate_error_interval: config.hashrate_error_interval,
                },
                global_hashrate.clone(),
            ));
            let contract: Arc<dyn Contract> = Arc::new(ControllerBuyer::new(
                watcher,
                store.clone(),
                &priv_key,
            ));
            return Ok(contract);
        }
        Err(Error::ConfigValidation(format!(
            "contract {} belongs to neither side of this wallet",
            terms.base.contract_id
        )))
    })
}
