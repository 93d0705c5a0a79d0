//! Live destination swap.
//!
//! The new pool connection is fully prepared (dialed or taken from the
//! cache, handshaken, first job received) while the miner keeps working
//! against the old destination. Only then are the pumps paused, the miner
//! re-initialized on top of the new pool's latest job, and the pumps
//! restarted. Any failure before the final swap leaves the previous
//! destination active.

use std::sync::Arc;

use sv1_api::{
    client_to_server::{Authorize, Configure, Subscribe},
    server_to_client::{
        ConfigureResult, SetDifficulty, SetExtranonce, SetVersionMask, SubscribeResult,
    },
    Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{connection::ConnDest, error::Error};

use super::{OnSubmit, Proxy};

pub async fn set_dest(
    proxy: &Arc<Proxy>,
    cancel: &CancellationToken,
    new_dest_url: &Url,
    on_submit: Option<OnSubmit>,
) -> Result<(), Error> {
    let _guard = proxy.set_dest_serialized().lock().await;

    if proxy.dest_url() == *new_dest_url {
        // no reconnect needed, but the accounting callback still changes
        // hands: consecutive tasks often target the same destination
        debug!("changing destination skipped, because it is the same as current");
        proxy.set_on_submit(on_submit);
        return Ok(());
    }
    debug!("changing destination to {new_dest_url}");

    let new_dest = match proxy.dest_map().load(new_dest_url.as_str()) {
        Some(cached) => {
            debug!("reusing dest connection {new_dest_url} from cache");
            proxy.unanswered().wait().await;
            cached.auto_read_stop().await?;
            cached.reset_idle_close_timers();
            cached
        }
        None => {
            debug!("connecting to new dest {new_dest_url}");
            let dest = connect_new_dest(proxy, cancel, new_dest_url).await?;
            proxy.unanswered().wait().await;
            dest
        }
    };

    // from here on no submit is in flight and both pumps are paused
    proxy.stop_pumps().await;
    debug!("stopped source and old dest");

    if let Some(old_dest) = proxy.current_dest() {
        let old_url = old_dest.id();
        let old_for_cb = old_dest.clone();
        let map_owner = proxy.clone();
        old_dest.auto_read_start(move |err| {
            if let Some(err) = err {
                warn!("autoread exited with error {err}");
                old_for_cb.close();
            }
            map_owner.dest_map().delete(&old_url);
        })?;
        debug!("set old dest to autoread");
    }

    resend_relevant_notifications(proxy, cancel, &new_dest).await?;

    proxy.swap_current_dest(new_dest.clone(), new_dest_url.clone());
    proxy.dest_map().store(new_dest);
    proxy.set_on_submit(on_submit);

    proxy.start_pumps();

    info!("destination changed to {new_dest_url}");
    Ok(())
}

/// Dials and prepares a destination that is not in the cache: a reduced
/// handshake reusing the already negotiated version-rolling mask, then a
/// wait for the first job. The handshake reads the connection itself, so
/// pool state (extranonce, mask) is always settled before the next push is
/// processed; nothing here reaches the miner.
async fn connect_new_dest(
    proxy: &Arc<Proxy>,
    cancel: &CancellationToken,
    new_dest_url: &Url,
) -> Result<Arc<ConnDest>, Error> {
    let new_dest = (proxy.dest_factory())(new_dest_url.clone())
        .await
        .map_err(|e| Error::ChangeDest(Box::new(e)))?;
    debug!("new dest created");

    dest_handshake(proxy, cancel, &new_dest, new_dest_url).await?;

    debug!("new dest connected");
    Ok(new_dest)
}

/// Writes a request and reads the connection until its response arrives.
/// Pushes received meanwhile update the destination state inside `read` and
/// are dropped.
async fn request(
    dest: &Arc<ConnDest>,
    cancel: &CancellationToken,
    msg: Message,
) -> Result<sv1_api::json_rpc::Response, Error> {
    let id = msg
        .id()
        .ok_or_else(|| Error::UnexpectedMessage("request without an id".to_string()))?;
    dest.write(cancel, &msg)
        .await
        .map_err(|e| Error::ChangeDest(Box::new(e)))?;
    loop {
        let msg = tokio::select! {
            _ = tokio::time::sleep(crate::connection::RESPONSE_TIMEOUT) => {
                return Err(Error::ChangeDest(Box::new(Error::ResponseTimeout(id))));
            }
            msg = dest.read(cancel) => msg.map_err(|e| Error::ChangeDest(Box::new(e)))?,
        };
        if let Message::Response(res) = msg {
            if res.id == id {
                return Ok(res);
            }
        }
    }
}

/// Reduced handshake with a new pool while another destination is active.
async fn dest_handshake(
    proxy: &Arc<Proxy>,
    cancel: &CancellationToken,
    new_dest: &Arc<ConnDest>,
    url: &Url,
) -> Result<(), Error> {
    let mut msg_id: u64 = 1;

    // 1. mining.configure, only when the miner negotiated version rolling
    if let Some(mask) = proxy.source().negotiated_version_rolling_mask() {
        let (_, min_bit_count) = proxy.source().version_rolling_request();
        let cfg = Configure::new(msg_id, mask, min_bit_count);
        let res = request(new_dest, cancel, cfg.into()).await?;

        let cfg_res = ConfigureResult::try_from(&res).map_err(|e| {
            Error::ChangeDest(Box::new(Error::UnexpectedMessage(format!(
                "expected configure result: {e}"
            ))))
        })?;
        match cfg_res.negotiated_mask() {
            Some(pool_mask) if pool_mask == mask => {
                new_dest.set_version_rolling(true, pool_mask);
            }
            other => {
                return Err(Error::ChangeDest(Box::new(Error::VersionMaskMismatch {
                    ours: String::from(mask),
                    theirs: other.map(String::from).unwrap_or_default(),
                })))
            }
        }
        debug!("configure result received");
    }

    // 2. mining.subscribe
    msg_id += 1;
    let sub = Subscribe {
        id: msg_id,
        agent_signature: "stratum-proxy/1.0.0".to_string(),
        extranonce1: None,
    };
    let res = request(new_dest, cancel, sub.into()).await?;
    let sub_res = SubscribeResult::try_from(&res).map_err(|e| {
        Error::ChangeDest(Box::new(Error::UnexpectedMessage(format!(
            "expected subscribe result: {e}"
        ))))
    })?;
    new_dest.set_extra_nonce(sub_res.extra_nonce1, sub_res.extra_nonce2_size);
    debug!("subscribe result received");

    // 3. mining.authorize with the credentials of the new destination
    msg_id += 1;
    let auth = Authorize {
        id: msg_id,
        name: url.username().to_string(),
        password: url.password().unwrap_or_default().to_string(),
    };
    let res = request(new_dest, cancel, auth.into()).await?;
    if !res.is_success() {
        return Err(Error::ChangeDest(Box::new(Error::NotAuthorizedPool(
            format!("{:?}", res.error),
        ))));
    }

    // a job must be known before the miner can be switched over
    while !new_dest.first_job_signal().is_cancelled() {
        new_dest
            .read(cancel)
            .await
            .map_err(|e| Error::ChangeDest(Box::new(e)))?;
    }

    debug!("authorize success");
    Ok(())
}

/// Pushes the re-initialization burst to the miner:
/// `set_version_mask → set_extranonce → set_difficulty → notify(clean)`.
/// The pumps are stopped, so the sequence is atomic with respect to all
/// other source writes.
async fn resend_relevant_notifications(
    proxy: &Arc<Proxy>,
    cancel: &CancellationToken,
    new_dest: &Arc<ConnDest>,
) -> Result<(), Error> {
    let source = proxy.source();

    let (_, version_mask) = new_dest.version_rolling();
    let msg: Message = SetVersionMask { version_mask }.into();
    source
        .write(cancel, &msg)
        .await
        .map_err(|e| Error::ChangeDest(Box::new(e)))?;
    debug!("set version mask sent");

    let job = new_dest.latest_job().ok_or(Error::NoJobAvailable)?;

    let msg: Message = SetExtranonce {
        extra_nonce1: job.extra_nonce1().clone(),
        extra_nonce2_size: job.extra_nonce2_size(),
    }
    .into();
    source
        .write(cancel, &msg)
        .await
        .map_err(|e| Error::ChangeDest(Box::new(e)))?;
    source.set_extra_nonce(&String::from(job.extra_nonce1()), job.extra_nonce2_size());
    debug!("extranonce sent");

    let msg: Message = SetDifficulty { value: job.diff() }.into();
    source
        .write(cancel, &msg)
        .await
        .map_err(|e| Error::ChangeDest(Box::new(e)))?;
    debug!("set difficulty sent");

    let mut notify = job.notify().clone();
    notify.clean_jobs = true;
    source
        .write(cancel, &notify.into())
        .await
        .map_err(|e| Error::ChangeDest(Box::new(e)))?;
    debug!("notify sent");

    Ok(())
}
