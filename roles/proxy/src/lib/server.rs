//! TCP listener for incoming Stratum miner sessions. Every connection gets
//! its own source connection, proxy and scheduler; the scheduler is
//! registered with the allocator for the lifetime of the session.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::{
    collections::Collection,
    connection::{framed, ConnSource, DestConnFactory, StratumConnection},
    error::Error,
    hashrate::{GlobalHashrate, HashrateFactory},
    proxy::Proxy,
    scheduler::Scheduler,
    task_manager::TaskManager,
};

pub type MinerScheduler = Scheduler<Arc<Proxy>>;

/// Everything a miner session needs at accept time.
#[derive(Clone)]
pub struct MinerSessionParams {
    pub default_dest: Url,
    pub dest_factory: DestConnFactory,
    pub hashrate_factory: HashrateFactory,
    pub global_hashrate: Arc<GlobalHashrate>,
    pub hashrate_counter_id: String,
    pub miner_share_timeout: Duration,
    pub miner_vetting_duration: Duration,
    pub not_propagate_worker_name: bool,
}

pub async fn run_tcp_server(
    cancel: &CancellationToken,
    listen_addr: SocketAddr,
    miners: Arc<Collection<MinerScheduler>>,
    params: MinerSessionParams,
    tasks: Arc<TaskManager>,
) -> Result<(), Error> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("stratum proxy is listening on {listen_addr}");

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        let miners = miners.clone();
        let params = params.clone();
        let session_cancel = cancel.child_token();
        tasks.spawn(async move {
            handle_miner_connection(stream, peer, miners, params, session_cancel).await;
        });
    }
}

async fn handle_miner_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    miners: Arc<Collection<MinerScheduler>>,
    params: MinerSessionParams,
    cancel: CancellationToken,
) {
    let id = peer.to_string();

    let conn = StratumConnection::new(
        stream,
        &id,
        params.miner_share_timeout,
        framed::WRITE_CLOSE_TIMEOUT,
    );
    let source = Arc::new(ConnSource::new(conn));

    let proxy = Proxy::new(
        &id,
        source,
        params.dest_factory.clone(),
        params.hashrate_factory.clone(),
        params.global_hashrate.clone(),
        params.default_dest.clone(),
        params.not_propagate_worker_name,
    );
    let scheduler = Arc::new(Scheduler::new(
        proxy,
        &params.hashrate_counter_id,
        params.default_dest.clone(),
        params.miner_vetting_duration,
    ));

    miners.store(scheduler.clone());

    if let Err(e) = scheduler.run(&cancel).await {
        warn!("proxy disconnected: {e} {id}");
    }

    miners.delete(&id);
}
