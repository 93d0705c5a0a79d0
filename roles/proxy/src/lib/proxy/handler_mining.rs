//! Post-handshake interceptors for both pump directions.

use std::sync::Arc;

use sv1_api::{
    client_to_server::Submit, json_rpc::Response, Client2Server, Message, MethodError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{error::Error, validator::ValidationError};

use super::Proxy;

/// Handles one message from the miner. Returns the message to forward to the
/// destination, or `None` when it was fully handled here.
pub async fn handle_source_message(
    proxy: &Arc<Proxy>,
    cancel: &CancellationToken,
    msg: Message,
) -> Result<Option<Message>, Error> {
    match Client2Server::try_from(msg.clone()) {
        Ok(Client2Server::Submit(submit)) => {
            on_mining_submit(proxy, cancel, submit).await?;
            Ok(None)
        }
        Ok(Client2Server::Configure(_))
        | Ok(Client2Server::Subscribe(_))
        | Ok(Client2Server::Authorize(_)) => Err(Error::source_side(Error::UnexpectedMessage(
            "handshake message from source after handshake".to_string(),
        ))),
        Ok(Client2Server::ExtranonceSubscribe(_)) => Ok(Some(msg)),
        Err(MethodError::MethodNotFound(method)) => {
            warn!("unknown message from source: {method}");
            Ok(Some(msg))
        }
        Err(e) => {
            warn!("bad message from source: {e}");
            Ok(Some(msg))
        }
    }
}

/// Handles one message from the destination. State-bearing notifications
/// have already updated the connection inside `ConnDest::read`; everything
/// left is forwarded to the miner.
pub fn handle_dest_message(_proxy: &Arc<Proxy>, msg: Message) -> Option<Message> {
    if let Message::Notification(n) = &msg {
        match n.method.as_str() {
            "mining.notify" | "mining.set_difficulty" | "mining.set_version_mask"
            | "mining.set_extranonce" => {}
            method => warn!("unknown message from dest: {method}"),
        }
    }
    Some(msg)
}

/// Validates a submit locally, answers the miner, accounts the share and
/// relays it to the pool in a background task tracked by the proxy's
/// in-flight waitgroup.
async fn on_mining_submit(
    proxy: &Arc<Proxy>,
    cancel: &CancellationToken,
    submit: Submit,
) -> Result<(), Error> {
    proxy.unanswered().add(1);

    let mut dest = match proxy.current_dest() {
        Some(dest) => dest,
        None => {
            proxy.unanswered().done();
            return Err(Error::NoActiveDest);
        }
    };

    let mut validation = dest.validate_and_add_share(&submit);

    // stale jobs from a just-replaced pool are still honored: adopt the
    // cached destination that owns the job for this submit
    if matches!(validation, Err(ValidationError::JobNotFound)) {
        if let Some(d) = proxy.dest_by_job_id(&submit.job_id) {
            warn!("job {} found in different dest {}", submit.job_id, d.id());
            validation = d.validate_and_add_share(&submit);
            if validation.is_ok() {
                dest = d;
            }
        } else {
            warn!("job {} not found", submit.job_id);
        }
    }

    let we_accepted = validation.is_ok();
    let res = match &validation {
        Ok(actual_diff) => {
            proxy.source().stats().inc_we_accepted();

            let dest_diff = dest.diff();
            // miner hashrate
            proxy.hashrate().on_submit(dest_diff);
            // worker-keyed global hashrate
            proxy
                .global_hashrate()
                .on_submit(&proxy.source().user_name(), dest_diff);
            // contract accounting
            if let Some(on_submit) = &*proxy.on_submit.lock().unwrap() {
                on_submit(dest_diff);
            }

            let hr = proxy.hashrate().hashrate_avg_ghs("mean").unwrap_or(0.0);
            debug!("new share, diff: {actual_diff:.0}, hrGHS {hr:.0}");

            Response::success(submit.id)
        }
        Err(ValidationError::JobNotFound) => {
            proxy.source().stats().inc_we_rejected();
            Response::job_not_found(submit.id)
        }
        Err(ValidationError::DuplicateShare) => {
            proxy.source().stats().inc_we_rejected();
            warn!("duplicate share, jobID {}, msg id: {}", submit.job_id, submit.id);
            Response::duplicate_share(submit.id)
        }
        Err(ValidationError::LowDifficulty { expected, actual }) => {
            proxy.source().stats().inc_we_rejected();
            warn!(
                "low difficulty share jobID {}, msg id: {}, diff {actual} expected {expected:.0}",
                submit.job_id, submit.id
            );
            Response::low_difficulty(submit.id)
        }
    };

    // the destination round-trip must not block the pump
    let proxy = proxy.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        relay_submit(&proxy, &cancel, dest, submit, res, we_accepted).await;
        proxy.unanswered().done();
    });

    Ok(())
}

async fn relay_submit(
    proxy: &Arc<Proxy>,
    cancel: &CancellationToken,
    dest: Arc<crate::connection::ConnDest>,
    mut submit: Submit,
    res: Response,
    we_accepted: bool,
) {
    if let Err(e) = proxy.source().write(cancel, &res.into()).await {
        error!("cannot write response to miner: {e}");
        proxy.run_cancel_token().cancel();
        return;
    }

    submit.user_name = dest.user_name();
    let pool_res = match dest.write_await_res(cancel, &submit.into()).await {
        Ok(res) => res,
        Err(e) => {
            error!("cannot write submit to pool: {e}");
            proxy.run_cancel_token().cancel();
            return;
        }
    };

    if pool_res.is_success() {
        if we_accepted {
            dest.stats().inc_we_accepted_they_accepted();
        } else {
            dest.stats().inc_we_rejected_they_accepted();
            proxy.source().stats().inc_we_rejected_they_accepted();
            warn!("we rejected share, but dest accepted");
        }
    } else if we_accepted {
        proxy.source().stats().inc_we_accepted_they_rejected();
        dest.stats().inc_we_accepted_they_rejected();
        warn!(
            "we accepted share, they rejected with err {:?}",
            pool_res.error
        );
    } else {
        warn!(
            "we rejected share, and they rejected with err {:?}",
            pool_res.error
        );
    }
}
