//! Stratum v1 mining proxy and hashrate broker.
//!
//! Miners connect to this role as if it were a pool; their work is proxied
//! to destination pools, and hashrate contracts divert a precise fraction of
//! it to contract destinations for a bounded duration while every share is
//! validated locally.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod allocator;
pub mod collections;
pub mod config;
pub mod connection;
pub mod contracts;
pub mod error;
pub mod hashrate;
pub mod proxy;
pub mod scheduler;
pub mod server;
pub mod status;
pub mod task_manager;
pub mod utils;
pub mod validator;

use allocator::Allocator;
use collections::Collection;
use config::ProxyConfig;
use connection::tcp_dest_factory;
use contracts::{ContractFactoryConfig, ContractManager, ContractStore, DestDecryptor};
use error::ProxyResult;
use hashrate::{GlobalHashrate, Hashrate};
use proxy::Proxy;
use server::{MinerSessionParams, MinerScheduler};
use status::{Sender, State, Status};
use task_manager::TaskManager;

pub type MinerAllocator = Allocator<Arc<Proxy>>;

/// External collaborators injected at startup. The Ethereum-backed store and
/// the ECIES machinery live outside this crate; without them the role runs
/// as a plain proxy.
pub struct Marketplace {
    pub store: Arc<dyn ContractStore>,
    pub decryptor: Arc<dyn DestDecryptor>,
}

pub struct ProxySv1 {
    config: ProxyConfig,
}

impl ProxySv1 {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    /// Runs the role until a fatal component failure or an interrupt.
    pub async fn start(self, marketplace: Option<Marketplace>) -> ProxyResult<()> {
        let config = self.config;
        config.validate()?;

        let root_cancel = CancellationToken::new();
        let (tx_status, rx_status) = async_channel::unbounded();
        let tasks = Arc::new(TaskManager::new());

        let hashrate_factory = Hashrate::default_factory();
        let global_hashrate = Arc::new(GlobalHashrate::new(hashrate_factory.clone()));
        let miners: Arc<Collection<MinerScheduler>> = Arc::new(Collection::new());
        let allocator = Arc::new(Allocator::new(miners.clone()));

        let params = MinerSessionParams {
            default_dest: config.pool_url()?,
            dest_factory: tcp_dest_factory(),
            hashrate_factory: hashrate_factory.clone(),
            global_hashrate: global_hashrate.clone(),
            hashrate_counter_id: config.hashrate_counter_default.clone(),
            miner_share_timeout: config.miner_share_timeout_duration()?,
            miner_vetting_duration: config.miner_vetting_duration_value()?,
            not_propagate_worker_name: config.miner_not_propagate_worker_name,
        };

        let server_cancel = root_cancel.clone();
        let server_status = Sender::TcpServer(tx_status.clone());
        let listen_addr = config.listen_addr()?;
        let server_miners = miners.clone();
        let server_tasks = tasks.clone();
        tasks.spawn(async move {
            if let Err(e) = server::run_tcp_server(
                &server_cancel,
                listen_addr,
                server_miners,
                params,
                server_tasks,
            )
            .await
            {
                status::handle_error(&server_status, "tcp-server", e).await;
            }
        });

        match (marketplace, config.marketplace_enabled()) {
            (Some(marketplace), true) => {
                let owner = config.wallet_address.clone().unwrap_or_default();
                let priv_key = config.wallet_private_key.clone().unwrap_or_default();
                let factory_config = ContractFactoryConfig {
                    cycle_duration: config.cycle_duration()?,
                    validation_start_timeout: config.validation_start_timeout()?,
                    share_timeout: config.share_timeout()?,
                    hr_error_threshold: config.hashrate_error_threshold,
                    hashrate_error_interval: config.hashrate_error_timeout()?,
                };
                let factory = contracts::contract_factory(
                    &owner,
                    &priv_key,
                    factory_config,
                    allocator.clone(),
                    hashrate_factory.clone(),
                    global_hashrate.clone(),
                    marketplace.store.clone(),
                    marketplace.decryptor,
                );
                let manager = ContractManager::new(&owner, factory, marketplace.store);
                let manager_cancel = root_cancel.clone();
                let manager_status = Sender::ContractManager(tx_status.clone());
                tasks.spawn(async move {
                    if let Err(e) = manager.run(&manager_cancel).await {
                        status::handle_error(&manager_status, "contract-manager", e).await;
                    }
                });
            }
            _ => {
                info!("contract marketplace disabled; running as plain proxy");
            }
        }

        // the central loop: status reports and interrupts
        loop {
            let status = tokio::select! {
                status = rx_status.recv() => status,
                interrupt = tokio::signal::ctrl_c() => {
                    match interrupt {
                        Ok(()) => info!("interrupt received"),
                        Err(e) => error!("unable to listen for interrupt signal: {e}"),
                    }
                    break;
                }
            };
            let status: Status = match status {
                Ok(status) => status,
                Err(_) => break,
            };
            match status.state {
                State::TcpServerShutdown(e) => {
                    error!("SHUTDOWN from tcp server: {e}");
                    break;
                }
                State::ContractManagerShutdown(e) => {
                    error!("SHUTDOWN from contract manager: {e}");
                    break;
                }
                State::MinerShutdown(id, e) => {
                    // miners come and go; they re-enter by reconnecting
                    warn!("miner session {id} ended: {e}");
                }
                State::Healthy(msg) => {
                    info!("healthy: {msg}");
                }
            }
        }

        root_cancel.cancel();

        tokio::select! {
            _ = tasks.join_all() => {
                info!("all tasks stopped, shutting down");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("second interrupt, aborting");
                tasks.abort_all();
            }
        }

        Ok(())
    }
}
