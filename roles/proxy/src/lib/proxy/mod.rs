//! Bidirectional pump between one miner and its destination pools.
//!
//! Three phases: FirstConnect (deterministic handshake relay), Mining
//! (asynchronous pump with per-direction interceptors) and SetDest (live
//! destination swap that preserves miner state). The proxy exclusively owns
//! its source and active destination; replaced destinations are parked in
//! autoread mode and cached by URL for cheap switch-back.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::{Instant, SystemTime},
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::{
    collections::Collection,
    connection::{ConnDest, ConnSource, DestConnFactory},
    error::Error,
    hashrate::{GlobalHashrate, Hashrate, HashrateFactory},
    utils::WaitGroup,
};

pub mod handler_change_dest;
pub mod handler_first_connect;
pub mod handler_mining;
pub mod username;

/// Callback fed with the destination difficulty of every accepted share;
/// installed by the scheduler for contract accounting and swapped atomically
/// with the destination.
pub type OnSubmit = Box<dyn Fn(f64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
enum PumpSide {
    Source,
    Dest,
}

struct PumpState {
    source_cancel: CancellationToken,
    dest_cancel: CancellationToken,
    source_done: oneshot::Receiver<()>,
    dest_done: oneshot::Receiver<()>,
}

pub struct Proxy {
    id: String,
    not_propagate_worker_name: bool,

    dest_url: StdMutex<Url>,
    source: Arc<ConnSource>,
    dest: StdMutex<Option<Arc<ConnDest>>>,
    dest_map: Collection<ConnDest>,
    dest_factory: DestConnFactory,

    hashrate: Arc<Hashrate>,
    global_hashrate: Arc<GlobalHashrate>,
    on_submit: StdMutex<Option<OnSubmit>>,

    /// In-flight submit round-trips; drained before any destination swap.
    unanswered: WaitGroup,

    set_dest_lock: tokio::sync::Mutex<()>,
    pump: StdMutex<Option<PumpState>>,
    pump_exit_tx: mpsc::UnboundedSender<Error>,
    pump_exit_rx: StdMutex<Option<mpsc::UnboundedReceiver<Error>>>,
    /// Cancelled by the submit relay when it cannot deliver a response;
    /// stops `run`.
    run_cancel: CancellationToken,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy").field("id", &self.id).finish()
    }
}

impl Proxy {
    pub fn new(
        id: &str,
        source: Arc<ConnSource>,
        dest_factory: DestConnFactory,
        hashrate_factory: HashrateFactory,
        global_hashrate: Arc<GlobalHashrate>,
        dest_url: Url,
        not_propagate_worker_name: bool,
    ) -> Arc<Self> {
        let (pump_exit_tx, pump_exit_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: id.to_string(),
            not_propagate_worker_name,
            dest_url: StdMutex::new(dest_url),
            source,
            dest: StdMutex::new(None),
            dest_map: Collection::new(),
            dest_factory,
            hashrate: Arc::new(hashrate_factory()),
            global_hashrate,
            on_submit: StdMutex::new(None),
            unanswered: WaitGroup::new(),
            set_dest_lock: tokio::sync::Mutex::new(()),
            pump: StdMutex::new(None),
            pump_exit_tx,
            pump_exit_rx: StdMutex::new(Some(pump_exit_rx)),
            run_cancel: CancellationToken::new(),
        })
    }

    /// Runs the proxy until the handshake is done.
    pub async fn connect(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), Error> {
        let res = handler_first_connect::connect(self, cancel).await;
        if res.is_err() {
            self.close_connections();
        }
        res
    }

    /// Runs the mining-phase pump until either side fails or `cancel` fires.
    pub async fn run(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), Error> {
        let mut exit_rx = self
            .pump_exit_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::UnexpectedMessage("proxy run started twice".into()))?;

        self.start_pumps();

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.run_cancel.cancelled() => Err(Error::Cancelled),
            exit = exit_rx.recv() => match exit {
                Some(err) => Err(err),
                None => Err(Error::Cancelled),
            },
        };

        self.unanswered.wait().await;
        self.stop_pumps().await;
        self.close_connections();

        if let Err(err) = &result {
            if err.is_cancelled() {
                warn!("proxy stopped {}", self.id);
            } else if err.is_dest() {
                match err {
                    Error::Dest(inner) if matches!(**inner, Error::Eof | Error::ConnectionClosed) => {
                        warn!("destination closed the connection, source {}", self.id)
                    }
                    _ => error!("destination error, source {}: {}", self.id, err),
                }
            } else if err.is_source() {
                match err {
                    Error::Source(inner) if matches!(**inner, Error::Eof | Error::ConnectionClosed) => {
                        warn!("source closed the connection, source {}", self.id)
                    }
                    _ => error!("source connection error, source {}: {}", self.id, err),
                }
            } else {
                error!("error running proxy {}: {}", self.id, err);
            }
        }

        result
    }

    /// Switches the proxy to a new destination, preserving miner state.
    /// Serialized per proxy; a no-op when the URL is unchanged. Any failure
    /// before the final swap leaves the original destination active.
    pub async fn set_dest(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        new_dest_url: &Url,
        on_submit: Option<OnSubmit>,
    ) -> Result<(), Error> {
        handler_change_dest::set_dest(self, cancel, new_dest_url, on_submit).await
    }

    fn start_pumps(self: &Arc<Self>) {
        let mut pump = self.pump.lock().unwrap();
        if pump.is_some() {
            // both run() and a destination swap may race to (re)start; one
            // pump pair per connection is an invariant
            return;
        }

        let source_cancel = CancellationToken::new();
        let dest_cancel = CancellationToken::new();
        let (source_done_tx, source_done) = oneshot::channel();
        let (dest_done_tx, dest_done) = oneshot::channel();

        *pump = Some(PumpState {
            source_cancel: source_cancel.clone(),
            dest_cancel: dest_cancel.clone(),
            source_done,
            dest_done,
        });
        drop(pump);

        let proxy = self.clone();
        tokio::spawn(async move {
            proxy.pump_source_to_dest(source_cancel).await;
            let _ = source_done_tx.send(());
        });

        let proxy = self.clone();
        tokio::spawn(async move {
            proxy.pump_dest_to_source(dest_cancel).await;
            let _ = dest_done_tx.send(());
        });
    }

    async fn stop_pumps(&self) {
        let state = self.pump.lock().unwrap().take();
        if let Some(state) = state {
            state.dest_cancel.cancel();
            state.source_cancel.cancel();
            let _ = state.dest_done.await;
            let _ = state.source_done.await;
        }
    }

    async fn pump_source_to_dest(self: &Arc<Self>, cancel: CancellationToken) {
        loop {
            let msg = match self.source.read(&cancel).await {
                Ok(msg) => msg,
                Err(e) => {
                    self.report_pump_exit(PumpSide::Source, e, &cancel);
                    return;
                }
            };
            let forward = match handler_mining::handle_source_message(self, &cancel, msg).await {
                Ok(forward) => forward,
                Err(e) => {
                    self.report_pump_exit(PumpSide::Source, e, &cancel);
                    return;
                }
            };
            if let Some(msg) = forward {
                let dest = match self.current_dest() {
                    Some(dest) => dest,
                    None => {
                        self.report_pump_exit(PumpSide::Dest, Error::NoActiveDest, &cancel);
                        return;
                    }
                };
                if let Err(e) = dest.write(&cancel, &msg).await {
                    self.report_pump_exit(PumpSide::Dest, e, &cancel);
                    return;
                }
            }
        }
    }

    async fn pump_dest_to_source(self: &Arc<Self>, cancel: CancellationToken) {
        let dest = match self.current_dest() {
            Some(dest) => dest,
            None => {
                self.report_pump_exit(PumpSide::Dest, Error::NoActiveDest, &cancel);
                return;
            }
        };
        loop {
            let msg = match dest.read(&cancel).await {
                Ok(msg) => msg,
                Err(e) => {
                    self.report_pump_exit(PumpSide::Dest, e, &cancel);
                    return;
                }
            };
            let forward = handler_mining::handle_dest_message(self, msg);
            if let Some(msg) = forward {
                if let Err(e) = self.source.write(&cancel, &msg).await {
                    self.report_pump_exit(PumpSide::Source, e, &cancel);
                    return;
                }
            }
        }
    }

    fn report_pump_exit(&self, _side: PumpSide, err: Error, cancel: &CancellationToken) {
        // a stop requested by a destination swap is not an exit
        if cancel.is_cancelled() || err.is_cancelled() {
            return;
        }
        let _ = self.pump_exit_tx.send(err);
    }

    pub(crate) fn close_connections(&self) {
        if let Some(dest) = self.current_dest() {
            dest.close();
            self.dest_map.delete(&dest.id());
        }
        self.dest_map.range(|dest| {
            dest.close();
            true
        });
    }

    // accessors shared by the handlers

    pub(crate) fn current_dest(&self) -> Option<Arc<ConnDest>> {
        self.dest.lock().unwrap().clone()
    }

    pub(crate) fn swap_current_dest(&self, dest: Arc<ConnDest>, url: Url) {
        *self.dest.lock().unwrap() = Some(dest);
        *self.dest_url.lock().unwrap() = url;
    }

    pub(crate) fn set_on_submit(&self, on_submit: Option<OnSubmit>) {
        *self.on_submit.lock().unwrap() = on_submit;
    }

    pub(crate) fn dest_by_job_id(&self, job_id: &str) -> Option<Arc<ConnDest>> {
        let mut found = None;
        self.dest_map.range(|dest| {
            if dest.has_job(job_id) {
                found = Some(dest.clone());
                false
            } else {
                true
            }
        });
        found
    }

    pub(crate) fn source(&self) -> &Arc<ConnSource> {
        &self.source
    }

    pub(crate) fn dest_map(&self) -> &Collection<ConnDest> {
        &self.dest_map
    }

    pub(crate) fn dest_factory(&self) -> DestConnFactory {
        self.dest_factory.clone()
    }

    pub(crate) fn unanswered(&self) -> &WaitGroup {
        &self.unanswered
    }

    pub(crate) fn run_cancel_token(&self) -> &CancellationToken {
        &self.run_cancel
    }

    pub(crate) fn not_propagate_worker_name(&self) -> bool {
        self.not_propagate_worker_name
    }

    // public getters

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dest_url(&self) -> Url {
        self.dest_url.lock().unwrap().clone()
    }

    pub(crate) fn set_dest_url(&self, url: Url) {
        *self.dest_url.lock().unwrap() = url;
    }

    pub(crate) fn set_dest_serialized(&self) -> &tokio::sync::Mutex<()> {
        &self.set_dest_lock
    }

    pub fn difficulty(&self) -> f64 {
        self.current_dest().map(|d| d.diff()).unwrap_or(0.0)
    }

    pub fn hashrate(&self) -> &Arc<Hashrate> {
        &self.hashrate
    }

    pub fn global_hashrate(&self) -> &Arc<GlobalHashrate> {
        &self.global_hashrate
    }

    pub fn miner_connected_at(&self) -> Instant {
        self.source.connected_at()
    }

    pub fn source_worker_name(&self) -> String {
        self.source.user_name()
    }

    pub fn stats(&self) -> HashMap<&'static str, u64> {
        self.source.stats().snapshot()
    }

    /// Cached destination connections and the moment each would close when
    /// left idle.
    pub fn dest_connections(&self) -> HashMap<String, SystemTime> {
        let mut conns = HashMap::new();
        self.dest_map.range(|dest| {
            conns.insert(dest.id(), dest.idle_close_at());
            true
        });
        conns
    }
}

impl crate::collections::HasId for Proxy {
    fn id(&self) -> String {
        self.id.clone()
    }
}

/// Announces the handshake completion of the first destination connection;
/// used by `connect` and kept here so the first pump start sees a fully
/// initialized proxy.
pub(crate) fn log_handshake_done(proxy: &Proxy) {
    info!(
        "handshake completed, source {} dest {}",
        proxy.id(),
        proxy.dest_url()
    );
}
