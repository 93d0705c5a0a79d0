//! Buyer side of a hashrate contract: validate that the purchased hashrate
//! actually arrives at our pool, and close the contract on underdelivery.

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::Error,
    hashrate::GlobalHashrate,
    utils::relative_error,
};

use super::{
    store::{CloseoutType, ContractEvent, ContractStore},
    terms::{BlockchainState, ContractRole, ContractState, EncryptedTerms, ValidationStage},
    Contract,
};

#[derive(Debug, Clone)]
pub struct BuyerConfig {
    /// Evaluation cadence.
    pub cycle_duration: Duration,
    /// Grace period before hashrate accuracy is enforced.
    pub validation_start_timeout: Duration,
    /// Longest tolerated silence before validation starts.
    pub share_timeout: Duration,
    /// Tolerated relative error of the delivered hashrate.
    pub hr_error_threshold: f64,
    /// How long underdelivery must persist before the contract fails.
    pub hashrate_error_interval: Duration,
}

pub struct ContractWatcherBuyer {
    config: BuyerConfig,

    terms: StdMutex<EncryptedTerms>,
    state: StdMutex<ContractState>,
    validation_stage: StdMutex<ValidationStage>,
    fulfillment_started_at: StdMutex<Option<SystemTime>>,
    underdelivery_since: StdMutex<Option<SystemTime>>,

    global_hashrate: Arc<GlobalHashrate>,
}

impl ContractWatcherBuyer {
    pub fn new(
        terms: EncryptedTerms,
        config: BuyerConfig,
        global_hashrate: Arc<GlobalHashrate>,
    ) -> Self {
        Self {
            config,
            terms: StdMutex::new(terms),
            state: StdMutex::new(ContractState::Pending),
            validation_stage: StdMutex::new(ValidationStage::NotValidating),
            fulfillment_started_at: StdMutex::new(None),
            underdelivery_since: StdMutex::new(None),
            global_hashrate,
        }
    }

    pub fn set_terms(&self, terms: EncryptedTerms) {
        *self.terms.lock().unwrap() = terms;
    }

    pub fn contract_id(&self) -> String {
        self.terms.lock().unwrap().base.contract_id.clone()
    }

    /// Incoming contract hashrate is keyed by the contract id used as the
    /// worker name.
    fn worker_name(&self) -> String {
        self.contract_id()
    }

    pub fn hashrate_ghs(&self) -> f64 {
        self.terms.lock().unwrap().base.hashrate_ghs
    }

    pub fn state(&self) -> ContractState {
        *self.state.lock().unwrap()
    }

    pub fn blockchain_state(&self) -> BlockchainState {
        self.terms.lock().unwrap().base.state
    }

    pub fn validation_stage(&self) -> ValidationStage {
        *self.validation_stage.lock().unwrap()
    }

    pub fn starts_at(&self) -> Option<SystemTime> {
        self.terms.lock().unwrap().base.starts_at
    }

    pub fn duration(&self) -> Duration {
        self.terms.lock().unwrap().base.duration
    }

    pub fn end_time(&self) -> Option<SystemTime> {
        self.terms.lock().unwrap().base.end_time()
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.terms.lock().unwrap().base.elapsed()
    }

    pub fn fulfillment_started_at(&self) -> Option<SystemTime> {
        *self.fulfillment_started_at.lock().unwrap()
    }

    pub fn seller(&self) -> String {
        self.terms.lock().unwrap().base.seller.clone()
    }

    pub fn buyer(&self) -> String {
        self.terms.lock().unwrap().base.buyer.clone()
    }

    pub(crate) fn start_fulfilling(
        self: &Arc<Self>,
        parent: &CancellationToken,
    ) -> super::WatchHandle {
        info!("buyer contract {} started fulfilling", self.contract_id());
        let cancel = parent.child_token();
        let (done_tx, done_rx) = oneshot::channel();
        let watcher = self.clone();
        let run_cancel = cancel.clone();
        tokio::spawn(async move {
            *watcher.state.lock().unwrap() = ContractState::Running;
            let res = watcher.run(&run_cancel).await;
            *watcher.state.lock().unwrap() = ContractState::Pending;
            let _ = done_tx.send(res);
        });
        super::WatchHandle::new(cancel, done_rx)
    }

    async fn run(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), Error> {
        *self.fulfillment_started_at.lock().unwrap() = Some(SystemTime::now());
        *self.validation_stage.lock().unwrap() = ValidationStage::NotValidating;
        *self.underdelivery_since.lock().unwrap() = None;

        // counters restart with each fulfillment
        self.global_hashrate.reset(&self.worker_name());

        loop {
            self.proceed_to_next_stage();
            if self.validation_stage() == ValidationStage::Finished {
                return Ok(());
            }
            self.check_incoming_hashrate()?;

            let end_time = match self.end_time() {
                Some(end) => end,
                // no end time means the contract already ended
                None => return Ok(()),
            };
            let until_end = end_time
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(until_end) => return Ok(()),
                _ = tokio::time::sleep(self.config.cycle_duration) => {}
            }
        }
    }

    fn proceed_to_next_stage(&self) {
        let mut stage = self.validation_stage.lock().unwrap();

        if *stage == ValidationStage::NotValidating && self.is_validation_start_timeout() {
            *stage = ValidationStage::Validating;
            info!("new validation stage {stage}");
            return;
        }

        if self.is_contract_expired() {
            *stage = ValidationStage::Finished;
            info!("new validation stage {stage}");
        }
    }

    fn check_incoming_hashrate(&self) -> Result<(), Error> {
        let stage = self.validation_stage();
        match stage {
            ValidationStage::NotValidating => {
                // only a share-liveness check before validation kicks in
                let last_share_at = self
                    .global_hashrate
                    .last_submit_time(&self.worker_name())
                    .or_else(|| self.fulfillment_started_at())
                    .unwrap_or_else(SystemTime::now);
                let since = SystemTime::now()
                    .duration_since(last_share_at)
                    .unwrap_or(Duration::ZERO);
                if since > self.config.share_timeout {
                    return Err(Error::NoShareSubmitted);
                }
                Ok(())
            }
            ValidationStage::Validating => {
                if self
                    .global_hashrate
                    .last_submit_time(&self.worker_name())
                    .is_none()
                {
                    error!("validating stage reached without a single share");
                    return Err(Error::NoShareSubmitted);
                }
                if !self.is_receiving_acceptable_hashrate() {
                    return Err(Error::InaccurateHashrate);
                }
                Ok(())
            }
            ValidationStage::Finished => Ok(()),
            ValidationStage::NotApplicable => Ok(()),
        }
    }

    /// Checks the mean of the worker-keyed counter against the target.
    /// Overdelivery always passes; underdelivery only fails once it has
    /// persisted for the configured interval.
    fn is_receiving_acceptable_hashrate(&self) -> bool {
        let actual_hr_ghs = self
            .global_hashrate
            .hashrate_ghs(&self.worker_name(), "mean")
            .unwrap_or(0.0);
        let target_hr_ghs = self.hashrate_ghs();
        let hr_error = relative_error(target_hr_ghs, actual_hr_ghs);

        let hr_msg = format!(
            "elapsed {:?} worker {}, target GHS {:.0}, actual GHS {:.0}, error {:.0}%, threshold {:.0}%",
            self.elapsed().unwrap_or(Duration::ZERO),
            self.worker_name(),
            target_hr_ghs,
            actual_hr_ghs,
            hr_error * 100.0,
            self.config.hr_error_threshold * 100.0,
        );

        if hr_error < self.config.hr_error_threshold {
            info!("contract is delivering accurately: {hr_msg}");
            *self.underdelivery_since.lock().unwrap() = None;
            return true;
        }

        if actual_hr_ghs > target_hr_ghs {
            // overdelivery is fine for the buyer
            info!("contract is overdelivering: {hr_msg}");
            *self.underdelivery_since.lock().unwrap() = None;
            return true;
        }

        warn!("contract is underdelivering: {hr_msg}");
        let now = SystemTime::now();
        let mut since = self.underdelivery_since.lock().unwrap();
        match *since {
            None => {
                *since = Some(now);
                true
            }
            Some(started) => {
                let lasted = now.duration_since(started).unwrap_or(Duration::ZERO);
                if lasted > self.config.hashrate_error_interval {
                    warn!("contract is underdelivering longer than {:?}", self.config.hashrate_error_interval);
                    *since = None;
                    false
                } else {
                    true
                }
            }
        }
    }

    fn is_validation_start_timeout(&self) -> bool {
        match self.fulfillment_started_at() {
            None => false,
            Some(at) => {
                SystemTime::now()
                    .duration_since(at)
                    .unwrap_or(Duration::ZERO)
                    > self.config.validation_start_timeout
            }
        }
    }

    fn is_contract_expired(&self) -> bool {
        match self.end_time() {
            None => false,
            Some(end) => SystemTime::now() > end,
        }
    }
}

/// Drives the buyer watcher from contract lifecycle events; underdelivery
/// triggers a cancel closeout on chain.
pub struct ControllerBuyer {
    watcher: Arc<ContractWatcherBuyer>,
    store: Arc<dyn ContractStore>,
    priv_key: String,
}

enum BuyerLoopEvent {
    Cancelled,
    Event(ContractEvent),
    SubscriptionError(super::store::StoreError),
    FulfillmentDone(Result<(), Error>),
}

impl ControllerBuyer {
    pub fn new(
        watcher: Arc<ContractWatcherBuyer>,
        store: Arc<dyn ContractStore>,
        priv_key: &str,
    ) -> Self {
        Self {
            watcher,
            store,
            priv_key: priv_key.to_string(),
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let contract_id = self.watcher.contract_id();
        let sub = self.store.subscribe_contract(&contract_id).await?;
        info!("started watching contract as buyer, address {contract_id}");

        let mut fulfillment = Some(self.watcher.start_fulfilling(cancel));

        loop {
            let loop_event = {
                let done = async {
                    match fulfillment.as_mut() {
                        Some(handle) => BuyerLoopEvent::FulfillmentDone(handle.done().await),
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => BuyerLoopEvent::Cancelled,
                    event = sub.events().recv() => match event {
                        Ok(event) => BuyerLoopEvent::Event(event),
                        Err(e) => BuyerLoopEvent::SubscriptionError(
                            super::store::StoreError::Rpc(e.to_string()),
                        ),
                    },
                    err = sub.errors().recv() => match err {
                        Ok(err) => BuyerLoopEvent::SubscriptionError(err),
                        Err(e) => BuyerLoopEvent::SubscriptionError(
                            super::store::StoreError::Rpc(e.to_string()),
                        ),
                    },
                    event = done => event,
                }
            };

            match loop_event {
                BuyerLoopEvent::Cancelled => {
                    if let Some(mut handle) = fulfillment.take() {
                        handle.stop().await;
                        info!("buyer contract stopped fulfilling");
                    }
                    sub.unsubscribe();
                    return Ok(());
                }
                BuyerLoopEvent::SubscriptionError(err) => {
                    if let Some(mut handle) = fulfillment.take() {
                        handle.stop().await;
                    }
                    sub.unsubscribe();
                    return Err(err.into());
                }
                BuyerLoopEvent::Event(event) => match event {
                    ContractEvent::Closed => {
                        if let Some(mut handle) = fulfillment.take() {
                            handle.stop().await;
                            info!("buyer contract stopped fulfilling");
                        }
                        warn!("buyer contract ended due to closeout");
                        sub.unsubscribe();
                        return Ok(());
                    }
                    // destination cipher changes come with a new contract;
                    // purchase info updates only fire on closed contracts
                    ContractEvent::Purchased
                    | ContractEvent::CipherTextUpdated
                    | ContractEvent::PurchaseInfoUpdated => {}
                },
                BuyerLoopEvent::FulfillmentDone(res) => {
                    fulfillment = None;
                    sub.unsubscribe();
                    return match res {
                        Ok(()) => {
                            // delivery ok, the seller closes after expiry
                            info!("buyer contract ended without an error");
                            Ok(())
                        }
                        Err(e) if e.is_cancelled() || matches!(e, Error::ContractClosed) => {
                            warn!("buyer contract ended due to closeout");
                            Ok(())
                        }
                        Err(e) => {
                            warn!("buyer contract ended with error: {e}");
                            if let Err(close_err) = self
                                .store
                                .close(&contract_id, CloseoutType::Cancel, &self.priv_key)
                                .await
                            {
                                error!("error closing contract: {close_err}");
                            } else {
                                warn!("buyer contract closed, with type cancel");
                            }
                            Ok(())
                        }
                    };
                }
            }
        }
    }
}

#[async_trait]
impl Contract for ControllerBuyer {
    fn id(&self) -> String {
        self.watcher.contract_id()
    }

    fn role(&self) -> ContractRole {
        ContractRole::Buyer
    }

    fn state(&self) -> ContractState {
        self.watcher.state()
    }

    fn blockchain_state(&self) -> BlockchainState {
        self.watcher.blockchain_state()
    }

    fn validation_stage(&self) -> ValidationStage {
        self.watcher.validation_stage()
    }

    fn seller(&self) -> String {
        self.watcher.seller()
    }

    fn buyer(&self) -> String {
        self.watcher.buyer()
    }

    fn dest(&self) -> String {
        String::new()
    }

    fn hashrate_ghs(&self) -> f64 {
        self.watcher.hashrate_ghs()
    }

    fn starts_at(&self) -> Option<SystemTime> {
        self.watcher.starts_at()
    }

    fn end_time(&self) -> Option<SystemTime> {
        self.watcher.end_time()
    }

    fn duration(&self) -> Duration {
        self.watcher.duration()
    }

    fn fulfillment_started_at(&self) -> Option<SystemTime> {
        self.watcher.fulfillment_started_at()
    }

    fn hashrate_actual_ghs(&self) -> std::collections::HashMap<String, f64> {
        self.watcher
            .global_hashrate
            .hashrate_ghs_all(&self.watcher.worker_name())
            .unwrap_or_default()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        ControllerBuyer::run(self, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        contracts::store::tests::MemoryStore,
        contracts::terms::TermsBase,
        hashrate::{ghs_to_job_submitted, Hashrate},
    };

    const CONTRACT_ID: &str = "0x731b297b728795d4d13bfe8066fd6476d21e1ab5";

    fn fast_config() -> BuyerConfig {
        BuyerConfig {
            cycle_duration: Duration::from_millis(20),
            validation_start_timeout: Duration::from_millis(60),
            share_timeout: Duration::from_millis(80),
            hr_error_threshold: 0.05,
            hashrate_error_interval: Duration::from_millis(90),
        }
    }

    fn terms(target_ghs: f64, duration: Duration) -> EncryptedTerms {
        EncryptedTerms {
            base: TermsBase {
                contract_id: CONTRACT_ID.to_string(),
                seller: "0xseller".into(),
                buyer: "0xbuyer".into(),
                starts_at: Some(SystemTime::now()),
                duration,
                hashrate_ghs: target_ghs,
                state: super::super::terms::BlockchainState::Running,
            },
            dest_encrypted: String::new(),
        }
    }

    fn watcher(
        target_ghs: f64,
        duration: Duration,
        config: BuyerConfig,
    ) -> (Arc<ContractWatcherBuyer>, Arc<GlobalHashrate>) {
        let global = Arc::new(GlobalHashrate::new(Hashrate::default_factory()));
        let watcher = Arc::new(ContractWatcherBuyer::new(
            terms(target_ghs, duration),
            config,
            global.clone(),
        ));
        (watcher, global)
    }

    #[tokio::test]
    async fn fails_when_no_share_arrives_before_validation() {
        let mut config = fast_config();
        config.share_timeout = Duration::from_millis(40);
        config.validation_start_timeout = Duration::from_secs(3600);
        let (watcher, _global) = watcher(1000.0, Duration::from_secs(3600), config);

        let cancel = CancellationToken::new();
        let mut handle = watcher.start_fulfilling(&cancel);
        let res = handle.done().await;
        assert!(matches!(res, Err(Error::NoShareSubmitted)));
    }

    #[tokio::test]
    async fn sustained_underdelivery_fails_after_interval() {
        let config = fast_config();
        let (watcher, global) = watcher(1000.0, Duration::from_secs(3600), config);

        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let mut handle = watcher.start_fulfilling(&cancel);

        // a single share keeps liveness happy, but the mean hashrate stays
        // far below target once validation starts
        tokio::time::sleep(Duration::from_millis(20)).await;
        global.on_submit(CONTRACT_ID, 1.0);

        let res = handle.done().await;
        assert!(matches!(res, Err(Error::InaccurateHashrate)));
        // failed only after validation start plus the persistence interval
        assert!(started.elapsed() >= Duration::from_millis(60 + 90));
        assert_eq!(watcher.validation_stage(), ValidationStage::Validating);
    }

    #[tokio::test]
    async fn overdelivery_never_fails_and_contract_finishes() {
        // validation starts once the mean counter has a full second of
        // history; liveness stays quiet throughout
        let config = BuyerConfig {
            cycle_duration: Duration::from_millis(50),
            validation_start_timeout: Duration::from_millis(1200),
            share_timeout: Duration::from_secs(10),
            hr_error_threshold: 0.05,
            hashrate_error_interval: Duration::from_millis(90),
        };
        let (watcher, global) = watcher(1.0, Duration::from_millis(1700), config);

        let cancel = CancellationToken::new();
        let mut handle = watcher.start_fulfilling(&cancel);

        // counters reset at fulfillment start, so the work lands after it;
        // far more than 1 GHS needs for any elapsed time this test reaches
        tokio::time::sleep(Duration::from_millis(20)).await;
        global.on_submit(CONTRACT_ID, ghs_to_job_submitted(1000.0) * 10.0);

        let res = handle.done().await;
        assert!(res.is_ok(), "overdelivery must not fail: {res:?}");
    }

    #[tokio::test]
    async fn underdelivery_report_triggers_cancel_closeout() {
        let mut config = fast_config();
        config.share_timeout = Duration::from_millis(40);
        config.validation_start_timeout = Duration::from_secs(3600);
        let (watcher, _global) = watcher(1000.0, Duration::from_secs(3600), config);

        let store = MemoryStore::new();
        store.put_terms(MemoryStore::test_terms(
            CONTRACT_ID,
            "0xseller",
            "0xbuyer",
            1000.0,
        ));

        let controller = ControllerBuyer::new(watcher, store.clone(), "key");
        let cancel = CancellationToken::new();
        controller.run(&cancel).await.unwrap();

        let closeouts = store.closeouts.lock().unwrap().clone();
        assert_eq!(
            closeouts,
            vec![(CONTRACT_ID.to_string(), CloseoutType::Cancel)]
        );
    }

    #[tokio::test]
    async fn closed_event_stops_fulfilling_without_closeout() {
        let mut config = fast_config();
        // long windows: nothing but the closed event may end this contract
        config.share_timeout = Duration::from_secs(10);
        config.hashrate_error_interval = Duration::from_secs(10);
        let (watcher, global) = watcher(1.0, Duration::from_secs(3600), config);

        let store = MemoryStore::new();
        store.put_terms(MemoryStore::test_terms(
            CONTRACT_ID,
            "0xseller",
            "0xbuyer",
            1.0,
        ));

        let controller = Arc::new(ControllerBuyer::new(watcher, store.clone(), "key"));
        let cancel = CancellationToken::new();

        let run_controller = controller.clone();
        let run_cancel = cancel.clone();
        let run = tokio::spawn(async move { run_controller.run(&run_cancel).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        global.on_submit(CONTRACT_ID, ghs_to_job_submitted(1000.0));
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.contract_event(CONTRACT_ID, ContractEvent::Closed);

        let res = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("controller must exit on closed event")
            .unwrap();
        assert!(res.is_ok());
        assert!(store.closeouts.lock().unwrap().is_empty());
    }
}
