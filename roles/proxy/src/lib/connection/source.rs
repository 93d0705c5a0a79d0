//! Miner side of a proxied session.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex as StdMutex,
};
use std::time::Instant;

use sv1_api::{utils::HexU32Be, Message};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

use super::framed::StratumConnection;

/// Share accounting for one miner connection.
#[derive(Debug, Default)]
pub struct SourceStats {
    we_accepted: AtomicU64,
    we_rejected: AtomicU64,
    we_accepted_they_rejected: AtomicU64,
    we_rejected_they_accepted: AtomicU64,
}

impl SourceStats {
    pub fn inc_we_accepted(&self) {
        self.we_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_we_rejected(&self) {
        self.we_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_we_accepted_they_rejected(&self) {
        self.we_accepted_they_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_we_rejected_they_accepted(&self) {
        self.we_rejected_they_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> std::collections::HashMap<&'static str, u64> {
        std::collections::HashMap::from([
            ("we_accepted", self.we_accepted.load(Ordering::Relaxed)),
            ("we_rejected", self.we_rejected.load(Ordering::Relaxed)),
            (
                "we_accepted_they_rejected",
                self.we_accepted_they_rejected.load(Ordering::Relaxed),
            ),
            (
                "we_rejected_they_accepted",
                self.we_rejected_they_accepted.load(Ordering::Relaxed),
            ),
        ])
    }
}

#[derive(Debug, Default, Clone)]
struct SourceState {
    user_name: String,
    extra_nonce1: String,
    extra_nonce2_size: usize,
    /// Mask and minimum bit count the miner asked for in mining.configure.
    version_rolling_mask: Option<HexU32Be>,
    version_rolling_min_bit_count: u64,
    /// Mask agreed with the first destination; reduced handshakes against
    /// later destinations reuse it.
    negotiated_version_rolling_mask: Option<HexU32Be>,
    /// Tracks handshake ordering per connection: authorize must not precede
    /// subscribe.
    subscribe_received: bool,
}

/// The miner connection plus the per-miner protocol state the proxy tracks.
#[derive(Debug)]
pub struct ConnSource {
    conn: Arc<StratumConnection>,
    state: StdMutex<SourceState>,
    stats: Arc<SourceStats>,
}

impl ConnSource {
    pub fn new(conn: Arc<StratumConnection>) -> Self {
        Self {
            conn,
            state: StdMutex::new(SourceState::default()),
            stats: Arc::new(SourceStats::default()),
        }
    }

    pub fn id(&self) -> &str {
        self.conn.id()
    }

    pub async fn read(&self, cancel: &CancellationToken) -> Result<Message, Error> {
        self.conn
            .read(cancel)
            .await
            .map_err(Error::source_side)
    }

    pub async fn write(&self, cancel: &CancellationToken, msg: &Message) -> Result<(), Error> {
        self.conn
            .write(cancel, msg)
            .await
            .map_err(Error::source_side)
    }

    pub fn close(&self) {
        self.conn.close();
    }

    pub fn connected_at(&self) -> Instant {
        self.conn.connected_at()
    }

    pub fn stats(&self) -> Arc<SourceStats> {
        self.stats.clone()
    }

    pub fn user_name(&self) -> String {
        self.state.lock().unwrap().user_name.clone()
    }

    pub fn set_user_name(&self, user_name: &str) {
        self.state.lock().unwrap().user_name = user_name.to_string();
    }

    pub fn extra_nonce(&self) -> (String, usize) {
        let state = self.state.lock().unwrap();
        (state.extra_nonce1.clone(), state.extra_nonce2_size)
    }

    pub fn set_extra_nonce(&self, extra_nonce1: &str, extra_nonce2_size: usize) {
        let mut state = self.state.lock().unwrap();
        state.extra_nonce1 = extra_nonce1.to_string();
        state.extra_nonce2_size = extra_nonce2_size;
    }

    pub fn set_version_rolling_request(&self, mask: Option<HexU32Be>, min_bit_count: u64) {
        let mut state = self.state.lock().unwrap();
        state.version_rolling_mask = mask;
        state.version_rolling_min_bit_count = min_bit_count;
    }

    pub fn version_rolling_request(&self) -> (Option<HexU32Be>, u64) {
        let state = self.state.lock().unwrap();
        (
            state.version_rolling_mask,
            state.version_rolling_min_bit_count,
        )
    }

    pub fn negotiated_version_rolling_mask(&self) -> Option<HexU32Be> {
        self.state.lock().unwrap().negotiated_version_rolling_mask
    }

    pub fn set_negotiated_version_rolling_mask(&self, mask: HexU32Be) {
        self.state.lock().unwrap().negotiated_version_rolling_mask = Some(mask);
    }

    pub fn subscribe_received(&self) -> bool {
        self.state.lock().unwrap().subscribe_received
    }

    pub fn set_subscribe_received(&self) {
        self.state.lock().unwrap().subscribe_received = true;
    }
}
