//! Seller side of a hashrate contract: allocate local miners so the
//! contract's target hashrate is delivered to the buyer's destination, and
//! reconcile under/over-delivery every cycle.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    allocator::{Allocator, MinerItem},
    error::Error,
    hashrate::{ghs_to_job_submitted, job_submitted_to_ghs, Hashrate, HashrateFactory},
    scheduler::StratumProxy,
    utils,
};

use super::{
    store::{CloseoutType, ContractEvent, ContractStore},
    terms::{BlockchainState, ContractRole, ContractState, Terms, ValidationStage},
    Contract, WatchHandle,
};

/// Pause between a clean contract end and the on-chain closeout, leaving the
/// chain time to settle the last delivered shares.
const WAIT_BEFORE_CLOSE: Duration = Duration::from_secs(10);

pub struct ContractWatcherSeller<P: StratumProxy> {
    terms: StdMutex<Terms>,
    state: StdMutex<ContractState>,
    full_miners: StdMutex<Vec<String>>,
    actual_hr: Hashrate,
    fulfillment_started_at: StdMutex<Option<SystemTime>>,
    contract_cycle_duration: Duration,

    allocator: Arc<Allocator<P>>,
}

impl<P: StratumProxy + Clone + 'static> ContractWatcherSeller<P> {
    pub fn new(
        terms: Terms,
        cycle_duration: Duration,
        hashrate_factory: HashrateFactory,
        allocator: Arc<Allocator<P>>,
    ) -> Self {
        Self {
            terms: StdMutex::new(terms),
            state: StdMutex::new(ContractState::Pending),
            full_miners: StdMutex::new(vec![]),
            actual_hr: hashrate_factory(),
            fulfillment_started_at: StdMutex::new(None),
            contract_cycle_duration: cycle_duration,
            allocator,
        }
    }

    pub fn set_terms(&self, terms: Terms) {
        *self.terms.lock().unwrap() = terms;
    }

    pub fn contract_id(&self) -> String {
        self.terms.lock().unwrap().base.contract_id.clone()
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

    pub fn actual_hashrate(&self) -> &Hashrate {
        &self.actual_hr
    }

    /// The buyer distinguishes incoming hashrate between contracts by the
    /// worker name, so the contract id is forced into the dest username.
    pub fn adjusted_dest(&self) -> Option<Url> {
        let terms = self.terms.lock().unwrap();
        terms.dest.clone().map(|mut dest| {
            utils::set_username(&mut dest, &terms.base.contract_id);
            dest
        })
    }

    /// True while the chain says the contract is purchased and not expired.
    pub fn should_be_running(&self) -> bool {
        match self.end_time() {
            None => false,
            Some(end) => {
                self.blockchain_state() == BlockchainState::Running && end > SystemTime::now()
            }
        }
    }

    pub(crate) fn start_fulfilling(self: &Arc<Self>, parent: &CancellationToken) -> WatchHandle {
        info!("contract {} started fulfilling", self.contract_id());
        *self.fulfillment_started_at.lock().unwrap() = Some(SystemTime::now());

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

        WatchHandle::new(cancel, done_rx)
    }

    pub(crate) async fn stop_fulfilling(&self, handle: &mut WatchHandle) {
        handle.stop().await;
        self.allocator.cancel_tasks(&self.contract_id());
        info!("contract {} stopped fulfilling", self.contract_id());
    }

    /// The reconciliation loop. Returns `Ok(())` when the contract ran to
    /// its end time, `Err(Cancelled)` when closed underway.
    async fn run(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), Error> {
        let contract_id = self.contract_id();
        let dest = match self.adjusted_dest() {
            Some(dest) => dest,
            None => {
                warn!("seller contract {contract_id} has no destination");
                return Ok(());
            }
        };

        let mut partial_target_ghs = self.hashrate_ghs();
        let mut global_underdelivery_ghs = 0.0;
        let this_cycle_job = Arc::new(AtomicU64::new(0));
        let job_full_miners = Arc::new(AtomicU64::new(0));
        let job_partial_miners = Arc::new(AtomicU64::new(0));

        loop {
            job_full_miners.store(0, Ordering::Relaxed);
            job_partial_miners.store(0, Ordering::Relaxed);

            debug!(
                "new contract cycle: partialDeliveryTargetGHS={:.0} elapsed {:?}",
                partial_target_ghs,
                self.elapsed()
            );

            if partial_target_ghs > 0.0 {
                let (full_miners, new_remainder_ghs) = self.allocator.allocate_full_miners(
                    &contract_id,
                    partial_target_ghs,
                    &dest,
                    self.duration(),
                    self.cycle_counter(&this_cycle_job, &job_full_miners),
                );
                if !full_miners.is_empty() {
                    partial_target_ghs = new_remainder_ghs;
                    info!(
                        "fully allocated {} miners, new partialDeliveryTargetGHS = {:.0}",
                        full_miners.len(),
                        partial_target_ghs
                    );
                    self.full_miners.lock().unwrap().extend(full_miners);
                } else {
                    debug!("no full miners were allocated for this contract");
                }

                match self.allocator.allocate_partial(
                    &contract_id,
                    partial_target_ghs,
                    &dest,
                    self.contract_cycle_duration,
                    self.cycle_counter(&this_cycle_job, &job_partial_miners),
                ) {
                    Some(miner_id) => debug!(
                        "remainderGHS: {:.0}, was allocated by partial miner {miner_id}",
                        partial_target_ghs
                    ),
                    None => warn!(
                        "remainderGHS: {:.0}, was not allocated by partial miners",
                        partial_target_ghs
                    ),
                }
            }

            if partial_target_ghs < 0.0 {
                // too much hashrate committed: release the least powerful
                // full miner and recompute
                info!("removing least powerful miner from contract");
                match self.smallest_full_miner() {
                    Some(miner) => {
                        if let Some(scheduler) = self.allocator.miners().load(&miner.id) {
                            scheduler.remove_tasks_by_id(&contract_id);
                            debug!("miner {} tasks removed", miner.id);
                            self.full_miners.lock().unwrap().retain(|id| *id != miner.id);
                            partial_target_ghs += miner.hr_ghs;
                            continue;
                        }
                    }
                    None => warn!("no miners found to be removed"),
                }
            }

            let end_time = match self.end_time() {
                Some(end) => end,
                None => return Ok(()),
            };
            let until_end = end_time
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(until_end) => {
                    self.finish(&contract_id);
                    return Ok(());
                }
                _ = tokio::time::sleep(self.contract_cycle_duration) => {}
            }

            // cycle boundary: carry the delivery error into the next target
            let cycle_secs = self.contract_cycle_duration.as_secs_f64();
            let this_cycle_actual_ghs =
                job_submitted_to_ghs(this_cycle_job.load(Ordering::Relaxed) as f64 / cycle_secs);
            let this_cycle_underdelivery_ghs = self.hashrate_ghs() - this_cycle_actual_ghs;
            global_underdelivery_ghs += this_cycle_underdelivery_ghs;

            partial_target_ghs =
                self.hashrate_ghs() - self.full_miners_hr_ghs() + global_underdelivery_ghs;

            this_cycle_job.store(0, Ordering::Relaxed);

            info!(
                "contract cycle ended thisCycleActualGHS={:.0} thisCycleUnderDeliveryGHS={:.0} globalUnderdeliveryGHS={:.0} partialDeliveryTargetGHS={:.0} jobFullMiners={} jobPartialMiners={}",
                this_cycle_actual_ghs,
                this_cycle_underdelivery_ghs,
                global_underdelivery_ghs,
                partial_target_ghs,
                job_full_miners.load(Ordering::Relaxed),
                job_partial_miners.load(Ordering::Relaxed),
            );
        }
    }

    fn cycle_counter(
        self: &Arc<Self>,
        this_cycle_job: &Arc<AtomicU64>,
        kind_counter: &Arc<AtomicU64>,
    ) -> crate::scheduler::TaskSubmitFn {
        let watcher = self.clone();
        let this_cycle_job = this_cycle_job.clone();
        let kind_counter = kind_counter.clone();
        Arc::new(move |diff, _miner_id| {
            kind_counter.fetch_add(diff as u64, Ordering::Relaxed);
            this_cycle_job.fetch_add(diff as u64, Ordering::Relaxed);
            watcher.actual_hr.on_submit(diff);
        })
    }

    fn smallest_full_miner(&self) -> Option<MinerItem> {
        let mut items: Vec<MinerItem> = self
            .full_miners
            .lock()
            .unwrap()
            .iter()
            .filter_map(|id| {
                self.allocator.miners().load(id).map(|m| MinerItem {
                    id: id.clone(),
                    hr_ghs: m.hashrate_ghs(),
                })
            })
            .collect();
        items.sort_by(|a, b| {
            a.hr_ghs
                .partial_cmp(&b.hr_ghs)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        items.into_iter().next()
    }

    fn full_miners_hr_ghs(&self) -> f64 {
        self.full_miners
            .lock()
            .unwrap()
            .iter()
            .filter_map(|id| self.allocator.miners().load(id))
            .map(|m| m.hashrate_ghs())
            .sum()
    }

    fn finish(&self, contract_id: &str) {
        let expected_job =
            ghs_to_job_submitted(self.hashrate_ghs()) * self.duration().as_secs_f64();
        let actual_job = self.actual_hr.total_work() as f64;
        let undelivered_job = expected_job - actual_job;
        let undelivered_fraction = if expected_job > 0.0 {
            undelivered_job / expected_job
        } else {
            0.0
        };

        let full_miners = std::mem::take(&mut *self.full_miners.lock().unwrap());
        for miner_id in full_miners {
            if let Some(miner) = self.allocator.miners().load(&miner_id) {
                miner.remove_tasks_by_id(contract_id);
                debug!("miner {miner_id} tasks removed");
            }
        }
        // partial miner tasks are cycle-sized and expire on their own

        info!(
            "contract ended, undelivered work {:.0}, undelivered fraction {:.2}",
            undelivered_job, undelivered_fraction
        );
    }
}

/// Drives the seller watcher from contract lifecycle events and performs the
/// on-chain closeout after a clean end.
pub struct ControllerSeller<P: StratumProxy> {
    watcher: Arc<ContractWatcherSeller<P>>,
    store: Arc<dyn ContractStore>,
    decryptor: Arc<dyn super::terms::DestDecryptor>,
    priv_key: String,
}

enum SellerLoopEvent {
    Cancelled,
    Event(ContractEvent),
    SubscriptionError(super::store::StoreError),
    FulfillmentDone(Result<(), Error>),
}

impl<P: StratumProxy + Clone + 'static> ControllerSeller<P> {
    pub fn new(
        watcher: Arc<ContractWatcherSeller<P>>,
        store: Arc<dyn ContractStore>,
        decryptor: Arc<dyn super::terms::DestDecryptor>,
        priv_key: &str,
    ) -> Self {
        Self {
            watcher,
            store,
            decryptor,
            priv_key: priv_key.to_string(),
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let contract_id = self.watcher.contract_id();
        let sub = self.store.subscribe_contract(&contract_id).await?;
        info!("started watching contract as seller, address {contract_id}");

        let mut fulfillment: Option<WatchHandle> = None;
        if self.watcher.should_be_running() {
            fulfillment = Some(self.watcher.start_fulfilling(cancel));
        }

        loop {
            let loop_event = {
                let done = async {
                    match fulfillment.as_mut() {
                        Some(handle) => SellerLoopEvent::FulfillmentDone(handle.done().await),
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => SellerLoopEvent::Cancelled,
                    event = sub.events().recv() => match event {
                        Ok(event) => SellerLoopEvent::Event(event),
                        Err(e) => SellerLoopEvent::SubscriptionError(
                            super::store::StoreError::Rpc(e.to_string()),
                        ),
                    },
                    err = sub.errors().recv() => match err {
                        Ok(err) => SellerLoopEvent::SubscriptionError(err),
                        Err(e) => SellerLoopEvent::SubscriptionError(
                            super::store::StoreError::Rpc(e.to_string()),
                        ),
                    },
                    event = done => event,
                }
            };

            match loop_event {
                SellerLoopEvent::Cancelled => {
                    if let Some(mut handle) = fulfillment.take() {
                        self.watcher.stop_fulfilling(&mut handle).await;
                    }
                    sub.unsubscribe();
                    return Ok(());
                }
                SellerLoopEvent::SubscriptionError(err) => {
                    if let Some(mut handle) = fulfillment.take() {
                        self.watcher.stop_fulfilling(&mut handle).await;
                    }
                    sub.unsubscribe();
                    return Err(err.into());
                }
                SellerLoopEvent::Event(event) => {
                    if let Err(e) = self
                        .handle_event(cancel, event, &mut fulfillment)
                        .await
                    {
                        if let Some(mut handle) = fulfillment.take() {
                            self.watcher.stop_fulfilling(&mut handle).await;
                        }
                        sub.unsubscribe();
                        return Err(e);
                    }
                }
                SellerLoopEvent::FulfillmentDone(res) => {
                    fulfillment = None;
                    match res {
                        Err(e) => {
                            // fulfillment error: the buyer will close on
                            // underdelivery
                            warn!("seller contract ended with error: {e}");
                        }
                        Ok(()) => {
                            info!("seller contract ended without error");
                            tokio::time::sleep(WAIT_BEFORE_CLOSE).await;
                            info!(
                                "closing contract id {contract_id}, startsAt {:?}, duration {:?}",
                                self.watcher.starts_at(),
                                self.watcher.duration()
                            );
                            if let Err(e) = self
                                .store
                                .close(&contract_id, CloseoutType::WithoutClaim, &self.priv_key)
                                .await
                            {
                                tracing::error!("error closing contract: {e}");
                            } else {
                                warn!("seller contract closed");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(
        &self,
        cancel: &CancellationToken,
        event: ContractEvent,
        fulfillment: &mut Option<WatchHandle>,
    ) -> Result<(), Error> {
        match event {
            ContractEvent::Purchased => {
                debug!("got purchased event for contract {}", self.watcher.contract_id());
                if self.watcher.state() == ContractState::Running {
                    return Ok(());
                }
                self.reload_terms().await?;
                *fulfillment = Some(self.watcher.start_fulfilling(cancel));
            }
            ContractEvent::Closed => {
                warn!("got closed event for contract");
                if let Some(mut handle) = fulfillment.take() {
                    self.watcher.stop_fulfilling(&mut handle).await;
                }
                self.reload_terms().await?;
            }
            ContractEvent::CipherTextUpdated => {
                let current_dest = self.watcher.adjusted_dest();
                let terms = self.terms_from_chain().await?;
                let new_dest = terms.dest.clone();
                if current_dest.map(|u| u.to_string())
                    == new_dest.as_ref().map(|u| {
                        let mut u = u.clone();
                        utils::set_username(&mut u, &terms.base.contract_id);
                        u.to_string()
                    })
                {
                    return Ok(());
                }
                if let Some(mut handle) = fulfillment.take() {
                    self.watcher.stop_fulfilling(&mut handle).await;
                }
                self.watcher.set_terms(terms);
                *fulfillment = Some(self.watcher.start_fulfilling(cancel));
            }
            ContractEvent::PurchaseInfoUpdated => {
                self.reload_terms().await?;
            }
        }
        Ok(())
    }

    async fn reload_terms(&self) -> Result<(), Error> {
        let terms = self.terms_from_chain().await?;
        self.watcher.set_terms(terms);
        Ok(())
    }

    async fn terms_from_chain(&self) -> Result<Terms, Error> {
        let encrypted = self
            .store
            .get_terms(&self.watcher.contract_id())
            .await?;
        encrypted.decrypt(self.decryptor.as_ref(), &self.priv_key)
    }
}

#[async_trait]
impl<P: StratumProxy + Clone + 'static> Contract for ControllerSeller<P> {
    fn id(&self) -> String {
        self.watcher.contract_id()
    }

    fn role(&self) -> ContractRole {
        ContractRole::Seller
    }

    fn state(&self) -> ContractState {
        self.watcher.state()
    }

    fn blockchain_state(&self) -> BlockchainState {
        self.watcher.blockchain_state()
    }

    fn validation_stage(&self) -> ValidationStage {
        ValidationStage::NotApplicable
    }

    fn seller(&self) -> String {
        self.watcher.seller()
    }

    fn buyer(&self) -> String {
        self.watcher.buyer()
    }

    fn dest(&self) -> String {
        self.watcher
            .adjusted_dest()
            .map(|u| u.to_string())
            .unwrap_or_default()
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
        self.watcher.actual_hashrate().hashrate_avg_ghs_all()
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        ControllerSeller::run(self, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collections::Collection,
        contracts::terms::TermsBase,
        scheduler::tests::{test_scheduler, MockProxy},
    };

    const CONTRACT_ID: &str = "0x731b297b728795d4d13bfe8066fd6476d21e1ab5";

    fn terms(target_ghs: f64, duration: Duration) -> Terms {
        Terms {
            base: TermsBase {
                contract_id: CONTRACT_ID.to_string(),
                seller: "0xseller".into(),
                buyer: "0xbuyer".into(),
                starts_at: Some(SystemTime::now()),
                duration,
                hashrate_ghs: target_ghs,
                state: BlockchainState::Running,
            },
            dest: Some(Url::parse("stratum+tcp://buyeracct:x@buyer.example.com:3333").unwrap()),
        }
    }

    struct Fixture {
        watcher: Arc<ContractWatcherSeller<Arc<MockProxy>>>,
        allocator: Arc<Allocator<Arc<MockProxy>>>,
        proxies: Vec<Arc<MockProxy>>,
        schedulers: Vec<Arc<crate::scheduler::Scheduler<Arc<MockProxy>>>>,
    }

    fn fixture(target_ghs: f64, duration: Duration, cycle: Duration, miners: &[(&str, f64)]) -> Fixture {
        let collection = Arc::new(Collection::new());
        let mut proxies = vec![];
        let mut schedulers = vec![];
        for (id, hr) in miners {
            let (scheduler, proxy) = test_scheduler(id, *hr, Duration::ZERO);
            collection.store(scheduler.clone());
            proxies.push(proxy);
            schedulers.push(scheduler);
        }
        let allocator = Arc::new(Allocator::new(collection));
        let watcher = Arc::new(ContractWatcherSeller::new(
            terms(target_ghs, duration),
            cycle,
            crate::hashrate::Hashrate::default_factory(),
            allocator.clone(),
        ));
        Fixture {
            watcher,
            allocator,
            proxies,
            schedulers,
        }
    }

    #[test]
    fn adjusted_dest_carries_contract_id_as_username() {
        let f = fixture(500.0, Duration::from_secs(3600), Duration::from_secs(300), &[]);
        let dest = f.watcher.adjusted_dest().unwrap();
        assert_eq!(dest.username(), CONTRACT_ID);
        assert_eq!(dest.host_str(), Some("buyer.example.com"));
    }

    #[test]
    fn should_be_running_follows_chain_state_and_expiry() {
        let f = fixture(500.0, Duration::from_secs(3600), Duration::from_secs(300), &[]);
        assert!(f.watcher.should_be_running());

        let mut expired = terms(500.0, Duration::from_secs(1));
        expired.base.starts_at = Some(SystemTime::now() - Duration::from_secs(10));
        f.watcher.set_terms(expired);
        assert!(!f.watcher.should_be_running());

        let mut available = terms(500.0, Duration::from_secs(3600));
        available.base.state = BlockchainState::Available;
        f.watcher.set_terms(available);
        assert!(!f.watcher.should_be_running());
    }

    // target 500 GHS over miners of 1000/200/200 GHS: the two small miners
    // are committed whole, the big one picks up the remainder per cycle
    #[tokio::test]
    async fn allocates_full_then_partial_and_reconciles_each_cycle() {
        let f = fixture(
            500.0,
            Duration::from_secs(3600),
            Duration::from_millis(150),
            &[("m-1000", 1000.0), ("m-200a", 200.0), ("m-200b", 200.0)],
        );

        // run the schedulers so tasks flow into the mock proxies
        let session_cancel = CancellationToken::new();
        for scheduler in &f.schedulers {
            let scheduler = scheduler.clone();
            let cancel = session_cancel.clone();
            tokio::spawn(async move {
                let _ = scheduler.run(&cancel).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancellationToken::new();
        let mut handle = f.watcher.start_fulfilling(&cancel);
        tokio::time::sleep(Duration::from_millis(80)).await;

        // both 200 GHS miners carry a full-duration task
        for id in ["m-200a", "m-200b"] {
            let miner = f.allocator.miners().load(id).unwrap();
            assert_eq!(
                miner.tasks_by_id(CONTRACT_ID).len(),
                1,
                "{id} must be fully allocated"
            );
        }
        // the 1000 GHS miner got the 100 GHS remainder for one cycle
        let partial = f.allocator.miners().load("m-1000").unwrap();
        assert_eq!(partial.tasks_by_id(CONTRACT_ID).len(), 1);

        // nothing was delivered: the next cycle carries the underdelivery
        // into a bigger partial target and schedules more work
        tokio::time::sleep(Duration::from_millis(300)).await;
        let partial_tasks = f
            .allocator
            .miners()
            .load("m-1000")
            .unwrap()
            .tasks_by_id(CONTRACT_ID)
            .len();
        assert!(
            partial_tasks >= 2,
            "underdelivery must grow the partial allocation, got {partial_tasks}"
        );

        f.watcher.stop_fulfilling(&mut handle).await;

        // stop cancelled all contract tasks; schedulers drain their queues
        tokio::time::sleep(Duration::from_millis(100)).await;
        for scheduler in &f.schedulers {
            assert!(scheduler.is_free());
        }
        session_cancel.cancel();
        let _ = f.proxies; // keep proxies alive for the whole test
    }

    // delivered work is counted through the task callbacks
    #[tokio::test]
    async fn delivered_work_feeds_actual_hashrate() {
        let f = fixture(
            200.0,
            Duration::from_secs(3600),
            Duration::from_millis(200),
            &[("m-200", 200.0)],
        );

        let session_cancel = CancellationToken::new();
        let scheduler = f.schedulers[0].clone();
        let run_cancel = session_cancel.clone();
        tokio::spawn(async move {
            let _ = scheduler.run(&run_cancel).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancellationToken::new();
        let mut handle = f.watcher.start_fulfilling(&cancel);

        // wait until the task destination is installed, then deliver shares
        for _ in 0..100 {
            if f.proxies[0].on_submit.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f.proxies[0].submit(5000.0);
        f.proxies[0].submit(3000.0);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(f.watcher.actual_hashrate().total_work(), 8000);

        f.watcher.stop_fulfilling(&mut handle).await;
        session_cancel.cancel();
    }
}
