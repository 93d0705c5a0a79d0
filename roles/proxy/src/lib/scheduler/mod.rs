//! Per-miner task queue.
//!
//! A scheduler wraps one proxied miner and switches it between a primary
//! destination and a queue of finite work tasks, each measured in submitted
//! difficulty. Contract controllers push tasks through the allocator; the
//! loop pops them as their work is delivered, cancelled or reset, and falls
//! back to the primary destination when the queue is empty.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant, SystemTime},
};

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::{
    collections::HasId,
    error::Error,
    hashrate::ghs_to_job_submitted,
    proxy::{OnSubmit, Proxy},
};

/// What the scheduler needs from a proxied miner session. The production
/// implementation is [`Proxy`]; tests substitute scripted mocks.
#[async_trait]
pub trait StratumProxy: Send + Sync {
    fn id(&self) -> String;
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), Error>;
    async fn run(&self, cancel: &CancellationToken) -> Result<(), Error>;
    async fn set_dest(
        &self,
        cancel: &CancellationToken,
        new_dest_url: &Url,
        on_submit: Option<OnSubmit>,
    ) -> Result<(), Error>;
    fn dest_url(&self) -> Url;
    fn hashrate_ghs(&self, counter_id: &str) -> f64;
    fn difficulty(&self) -> f64;
    fn source_worker_name(&self) -> String;
    fn miner_connected_at(&self) -> Instant;
    fn dest_connections(&self) -> HashMap<String, SystemTime>;
    fn stats(&self) -> HashMap<&'static str, u64>;
}

#[async_trait]
impl StratumProxy for Arc<Proxy> {
    fn id(&self) -> String {
        Proxy::id(self).to_string()
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<(), Error> {
        Proxy::connect(self, cancel).await
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        Proxy::run(self, cancel).await
    }

    async fn set_dest(
        &self,
        cancel: &CancellationToken,
        new_dest_url: &Url,
        on_submit: Option<OnSubmit>,
    ) -> Result<(), Error> {
        Proxy::set_dest(self, cancel, new_dest_url, on_submit).await
    }

    fn dest_url(&self) -> Url {
        Proxy::dest_url(self)
    }

    fn hashrate_ghs(&self, counter_id: &str) -> f64 {
        self.hashrate().hashrate_avg_ghs(counter_id).unwrap_or(0.0)
    }

    fn difficulty(&self) -> f64 {
        Proxy::difficulty(self)
    }

    fn source_worker_name(&self) -> String {
        Proxy::source_worker_name(self)
    }

    fn miner_connected_at(&self) -> Instant {
        Proxy::miner_connected_at(self)
    }

    fn dest_connections(&self) -> HashMap<String, SystemTime> {
        Proxy::dest_connections(self)
    }

    fn stats(&self) -> HashMap<&'static str, u64> {
        Proxy::stats(self)
    }
}

/// Per-share accounting callback of a task: difficulty delta and miner id.
pub type TaskSubmitFn = Arc<dyn Fn(f64, &str) + Send + Sync>;

pub struct Task {
    pub contract_id: String,
    pub dest: Url,
    remaining_job: StdMutex<f64>,
    on_submit: TaskSubmitFn,
    cancel: CancellationToken,
}

impl Task {
    pub fn remaining_job(&self) -> f64 {
        *self.remaining_job.lock().unwrap()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("contract_id", &self.contract_id)
            .field("dest", &self.dest.as_str())
            .field("remaining_job", &self.remaining_job())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerStatus {
    /// Vetting period after connect; excluded from allocation.
    Vetting,
    /// Serving the primary destination.
    Free,
    /// Fully or partially serving contract tasks.
    Busy,
}

impl std::fmt::Display for MinerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MinerStatus::Vetting => write!(f, "vetting"),
            MinerStatus::Free => write!(f, "free"),
            MinerStatus::Busy => write!(f, "busy"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DestItem {
    pub dest: String,
    pub job: f64,
}

pub struct Scheduler<P: StratumProxy> {
    // config
    hashrate_counter_id: String,
    miner_vetting_duration: Duration,
    primary_dest: StdMutex<Url>,

    // state
    total_task_job: StdMutex<f64>,
    tasks: StdMutex<VecDeque<Arc<Task>>>,
    new_task_signal: Notify,
    reset_signal: StdMutex<CancellationToken>,

    // deps
    proxy: P,
}

impl<P: StratumProxy> HasId for Scheduler<P> {
    fn id(&self) -> String {
        self.proxy.id()
    }
}

impl<P: StratumProxy + Clone + 'static> Scheduler<P> {
    pub fn new(
        proxy: P,
        hashrate_counter_id: &str,
        default_dest: Url,
        miner_vetting_duration: Duration,
    ) -> Self {
        Self {
            hashrate_counter_id: hashrate_counter_id.to_string(),
            miner_vetting_duration,
            primary_dest: StdMutex::new(default_dest),
            total_task_job: StdMutex::new(0.0),
            tasks: StdMutex::new(VecDeque::new()),
            new_task_signal: Notify::new(),
            reset_signal: StdMutex::new(CancellationToken::new()),
            proxy,
        }
    }

    pub async fn run(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), Error> {
        // handshake error ends the session before any scheduling
        self.proxy.connect(cancel).await?;

        let proxy_cancel = cancel.child_token();
        let (proxy_done_tx, mut proxy_done_rx) = oneshot::channel();
        let proxy = self.proxy.clone();
        let run_cancel = proxy_cancel.clone();
        tokio::spawn(async move {
            let res = proxy.run(&run_cancel).await;
            let _ = proxy_done_tx.send(res);
        });

        // after the handshake the proxy URL carries the propagated worker
        // name; use it as fallback from now on
        *self.primary_dest.lock().unwrap() = self.proxy.dest_url();

        loop {
            // serve queued tasks
            loop {
                let reset = self.fresh_reset_signal();
                let task = match self.tasks.lock().unwrap().front() {
                    Some(task) => task.clone(),
                    None => break,
                };
                if task.is_cancelled() {
                    debug!("task cancelled {}", task.contract_id);
                    self.pop_task();
                    continue;
                }

                let job_done = CancellationToken::new();
                debug!(
                    "start doing task for contract {}, job {:.0}",
                    task.contract_id,
                    task.remaining_job()
                );
                *self.total_task_job.lock().unwrap() -= task.remaining_job();

                let on_submit = self.task_on_submit(&task, &job_done);
                if let Err(e) = self
                    .proxy
                    .set_dest(cancel, &task.dest.clone(), Some(on_submit))
                    .await
                {
                    proxy_cancel.cancel();
                    let _ = (&mut proxy_done_rx).await;
                    return Err(e);
                }

                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = (&mut proxy_done_rx).await;
                        return Err(Error::Cancelled);
                    }
                    res = &mut proxy_done_rx => {
                        return res.unwrap_or(Err(Error::Cancelled));
                    }
                    _ = reset.cancelled() => {
                        debug!("tasks resetted");
                    }
                    _ = task.cancel.cancelled() => {
                        debug!("task cancelled {}", task.contract_id);
                    }
                    _ = job_done.cancelled() => {
                        debug!("finished doing task for contract {}", task.contract_id);
                    }
                }

                self.pop_task();
            }

            if !self.tasks.lock().unwrap().is_empty() {
                continue;
            }

            // remaining time serves the primary destination
            let primary = self.primary_dest.lock().unwrap().clone();
            if let Err(e) = self.proxy.set_dest(cancel, &primary, None).await {
                proxy_cancel.cancel();
                let _ = (&mut proxy_done_rx).await;
                return Err(e);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = (&mut proxy_done_rx).await;
                    return Err(Error::Cancelled);
                }
                res = &mut proxy_done_rx => {
                    return res.unwrap_or(Err(Error::Cancelled));
                }
                _ = self.new_task_signal.notified() => {}
            }
        }
    }

    fn task_on_submit(self: &Arc<Self>, task: &Arc<Task>, job_done: &CancellationToken) -> OnSubmit {
        let task = task.clone();
        let job_done = job_done.clone();
        let miner_id = self.id();
        Box::new(move |diff| {
            let mut remaining = task.remaining_job.lock().unwrap();
            *remaining -= diff;
            (task.on_submit)(diff, &miner_id);
            if *remaining <= 0.0 {
                // idempotent: the final overshooting delta still completes
                // the task exactly once
                job_done.cancel();
            }
        })
    }

    fn fresh_reset_signal(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.reset_signal.lock().unwrap() = token.clone();
        token
    }

    fn pop_task(&self) {
        self.tasks.lock().unwrap().pop_front();
    }

    pub fn add_task(
        &self,
        contract_id: &str,
        dest: Url,
        job_to_submit: f64,
        on_submit: TaskSubmitFn,
    ) {
        let should_signal;
        {
            let mut tasks = self.tasks.lock().unwrap();
            should_signal = tasks.is_empty();
            tasks.push_back(Arc::new(Task {
                contract_id: contract_id.to_string(),
                dest: dest.clone(),
                remaining_job: StdMutex::new(job_to_submit),
                on_submit,
                cancel: CancellationToken::new(),
            }));
            *self.total_task_job.lock().unwrap() += job_to_submit;
        }
        if should_signal {
            self.new_task_signal.notify_one();
        }
        debug!(
            "added new task, dest: {}, job: {:.0}",
            dest, job_to_submit
        );
    }

    /// Cancels every queued task of the given contract. Idempotent; a task
    /// being worked on is dropped at the next loop checkpoint.
    pub fn remove_tasks_by_id(&self, contract_id: &str) {
        let tasks = self.tasks.lock().unwrap();
        for task in tasks.iter() {
            if task.contract_id == contract_id {
                task.cancel();
            }
        }
    }

    pub fn reset_tasks(&self) {
        self.tasks.lock().unwrap().clear();
        self.reset_signal.lock().unwrap().cancel();
    }

    pub fn set_primary_dest(&self, dest: Url) {
        *self.primary_dest.lock().unwrap() = dest;
        self.new_task_signal.notify_one();
    }

    pub fn primary_dest(&self) -> Url {
        self.primary_dest.lock().unwrap().clone()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn tasks_by_id(&self, contract_id: &str) -> Vec<DestItem> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.contract_id == contract_id)
            .map(|t| DestItem {
                dest: t.dest.to_string(),
                job: t.remaining_job(),
            })
            .collect()
    }

    pub fn destinations(&self) -> Vec<DestItem> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .map(|t| DestItem {
                dest: t.dest.to_string(),
                job: t.remaining_job(),
            })
            .collect()
    }

    pub fn total_task_job(&self) -> f64 {
        *self.total_task_job.lock().unwrap()
    }

    pub fn is_free(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// True when there is vacant room for more contract work within the
    /// given interval.
    pub fn is_accepting_tasks(&self, duration: Duration) -> bool {
        let total_job: f64 = {
            let tasks = self.tasks.lock().unwrap();
            if tasks.is_empty() {
                return false;
            }
            tasks.iter().map(|t| t.remaining_job()).sum()
        };
        let max_job = ghs_to_job_submitted(self.hashrate_ghs()) * duration.as_secs_f64();
        total_job < max_job
    }

    pub fn hashrate_ghs(&self) -> f64 {
        self.proxy.hashrate_ghs(&self.hashrate_counter_id)
    }

    pub fn status(&self) -> MinerStatus {
        if self.is_vetting() {
            MinerStatus::Vetting
        } else if self.is_free() {
            MinerStatus::Free
        } else {
            MinerStatus::Busy
        }
    }

    pub fn is_vetting(&self) -> bool {
        self.uptime() < self.miner_vetting_duration
    }

    pub fn uptime(&self) -> Duration {
        self.proxy.miner_connected_at().elapsed()
    }

    pub fn current_difficulty(&self) -> f64 {
        self.proxy.difficulty()
    }

    pub fn current_dest(&self) -> Url {
        self.proxy.dest_url()
    }

    pub fn worker_name(&self) -> String {
        self.proxy.source_worker_name()
    }

    pub fn connected_at(&self) -> Instant {
        self.proxy.miner_connected_at()
    }

    pub fn stats(&self) -> HashMap<&'static str, u64> {
        self.proxy.stats()
    }

    pub fn dest_conns(&self) -> HashMap<String, SystemTime> {
        self.proxy.dest_connections()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Scripted proxy: records set_dest calls and exposes a fixed hashrate.
    pub(crate) struct MockProxy {
        pub id: String,
        pub hashrate_ghs: StdMutex<f64>,
        pub connected_at: StdMutex<Instant>,
        pub dests: StdMutex<Vec<String>>,
        pub on_submit: StdMutex<Option<OnSubmit>>,
        pub set_dest_calls: AtomicU64,
    }

    impl MockProxy {
        pub fn new(id: &str, hashrate_ghs: f64) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                hashrate_ghs: StdMutex::new(hashrate_ghs),
                connected_at: StdMutex::new(Instant::now()),
                dests: StdMutex::new(vec![]),
                on_submit: StdMutex::new(None),
                set_dest_calls: AtomicU64::new(0),
            })
        }

        /// Feeds an accepted share of the given difficulty into the
        /// installed contract callback.
        pub fn submit(&self, diff: f64) {
            if let Some(cb) = &*self.on_submit.lock().unwrap() {
                cb(diff);
            }
        }
    }

    #[async_trait]
    impl StratumProxy for Arc<MockProxy> {
        fn id(&self) -> String {
            self.id.clone()
        }

        async fn connect(&self, _cancel: &CancellationToken) -> Result<(), Error> {
            Ok(())
        }

        async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
            cancel.cancelled().await;
            Err(Error::Cancelled)
        }

        async fn set_dest(
            &self,
            _cancel: &CancellationToken,
            new_dest_url: &Url,
            on_submit: Option<OnSubmit>,
        ) -> Result<(), Error> {
            self.set_dest_calls.fetch_add(1, Ordering::SeqCst);
            self.dests.lock().unwrap().push(new_dest_url.to_string());
            *self.on_submit.lock().unwrap() = on_submit;
            Ok(())
        }

        fn dest_url(&self) -> Url {
            Url::parse("stratum+tcp://primary:x@pool.example.com:3333").unwrap()
        }

        fn hashrate_ghs(&self, _counter_id: &str) -> f64 {
            *self.hashrate_ghs.lock().unwrap()
        }

        fn difficulty(&self) -> f64 {
            10_000.0
        }

        fn source_worker_name(&self) -> String {
            format!("acct.{}", self.id)
        }

        fn miner_connected_at(&self) -> Instant {
            *self.connected_at.lock().unwrap()
        }

        fn dest_connections(&self) -> HashMap<String, SystemTime> {
            HashMap::new()
        }

        fn stats(&self) -> HashMap<&'static str, u64> {
            HashMap::new()
        }
    }

    pub(crate) fn test_scheduler(
        id: &str,
        hashrate_ghs: f64,
        vetting: Duration,
    ) -> (Arc<Scheduler<Arc<MockProxy>>>, Arc<MockProxy>) {
        let proxy = MockProxy::new(id, hashrate_ghs);
        let scheduler = Arc::new(Scheduler::new(
            proxy.clone(),
            "mean",
            Url::parse("stratum+tcp://primary:x@pool.example.com:3333").unwrap(),
            vetting,
        ));
        (scheduler, proxy)
    }

    fn task_dest() -> Url {
        Url::parse("stratum+tcp://contract:x@buyer.example.com:3333").unwrap()
    }

    #[tokio::test]
    async fn serves_task_until_job_done_then_falls_back() {
        let (scheduler, proxy) = test_scheduler("m1", 1000.0, Duration::ZERO);
        let cancel = CancellationToken::new();

        let sched = scheduler.clone();
        let cancel_run = cancel.clone();
        let run = tokio::spawn(async move { sched.run(&cancel_run).await });

        let counted = Arc::new(AtomicU64::new(0));
        let counted2 = counted.clone();
        scheduler.add_task(
            "ctr",
            task_dest(),
            1000.0,
            Arc::new(move |diff, _id| {
                counted2.fetch_add(diff as u64, Ordering::SeqCst);
            }),
        );

        // wait for the scheduler to install the task destination
        for _ in 0..100 {
            if proxy.on_submit.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            proxy.dests.lock().unwrap().last().unwrap(),
            &task_dest().to_string()
        );

        // deltas sum past the task size; overshoot still pops exactly once
        proxy.submit(600.0);
        proxy.submit(600.0);

        for _ in 0..100 {
            if scheduler.is_free() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(scheduler.is_free());
        assert_eq!(counted.load(Ordering::SeqCst), 1200);

        // fallback to the primary destination happened
        for _ in 0..100 {
            if proxy.dests.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let dests = proxy.dests.lock().unwrap().clone();
        assert!(dests.last().unwrap().contains("primary"));

        cancel.cancel();
        let _ = run.await;
    }

    #[tokio::test]
    async fn cancelled_task_is_dropped() {
        let (scheduler, proxy) = test_scheduler("m1", 1000.0, Duration::ZERO);
        let cancel = CancellationToken::new();

        let sched = scheduler.clone();
        let cancel_run = cancel.clone();
        let run = tokio::spawn(async move { sched.run(&cancel_run).await });

        scheduler.add_task("ctr", task_dest(), 1_000_000.0, Arc::new(|_, _| {}));
        for _ in 0..100 {
            if proxy.on_submit.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        scheduler.remove_tasks_by_id("ctr");
        for _ in 0..100 {
            if scheduler.is_free() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(scheduler.is_free());

        cancel.cancel();
        let _ = run.await;
    }

    #[test]
    fn vetting_follows_uptime() {
        let (scheduler, proxy) = test_scheduler("m1", 1000.0, Duration::from_secs(600));
        assert_eq!(scheduler.status(), MinerStatus::Vetting);

        // pretend the miner connected 11 minutes ago
        *proxy.connected_at.lock().unwrap() = Instant::now() - Duration::from_secs(660);
        assert_eq!(scheduler.status(), MinerStatus::Free);
    }

    #[test]
    fn accepting_tasks_needs_headroom() {
        let (scheduler, _proxy) = test_scheduler("m1", 1000.0, Duration::ZERO);
        let cycle = Duration::from_secs(300);

        // empty queue never accepts partial load
        assert!(!scheduler.is_accepting_tasks(cycle));

        // small task: plenty of headroom within a cycle
        scheduler.add_task("ctr", task_dest(), 100.0, Arc::new(|_, _| {}));
        assert!(scheduler.is_accepting_tasks(cycle));

        // schedule far beyond one cycle of work
        let cycle_job = ghs_to_job_submitted(1000.0) * cycle.as_secs_f64();
        scheduler.add_task("ctr2", task_dest(), cycle_job * 2.0, Arc::new(|_, _| {}));
        assert!(!scheduler.is_accepting_tasks(cycle));
    }
}
