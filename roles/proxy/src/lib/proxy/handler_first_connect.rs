//! The initial connection of a miner through the proxy to the default
//! destination.
//!
//! Unlike a destination change, where the pool connection is prepared first
//! and the miner switched onto it afterwards, the first connect couples both
//! sides so the version-rolling mask can be negotiated end to end. Every
//! request/reply pair is strictly sequential: a `set_version_mask` pushed to
//! the miner before its `configure` result would make real firmware
//! misbehave, so dest messages are only relayed at well-defined points.

use std::sync::Arc;

use sv1_api::{
    client_to_server::{Authorize, Configure, Subscribe},
    json_rpc::Response,
    server_to_client::{ConfigureResult, SubscribeResult},
    utils::HexU32Be,
    Client2Server, Message, MethodError,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{connection::ConnDest, error::Error};

use super::Proxy;

pub async fn connect(proxy: &Arc<Proxy>, cancel: &CancellationToken) -> Result<(), Error> {
    loop {
        let msg = proxy
            .source()
            .read(cancel)
            .await
            .map_err(|e| Error::HandshakeSource(Box::new(e)))?;

        match Client2Server::try_from(msg.clone()) {
            Ok(Client2Server::Configure(cfg)) => on_mining_configure(proxy, cancel, cfg).await?,
            Ok(Client2Server::Subscribe(sub)) => on_mining_subscribe(proxy, cancel, sub).await?,
            Ok(Client2Server::Authorize(auth)) => {
                on_mining_authorize(proxy, cancel, auth).await?;
                return Ok(());
            }
            Ok(Client2Server::Submit(_)) => {
                return Err(Error::HandshakeSource(Box::new(Error::UnexpectedMessage(
                    "mining.submit during handshake".to_string(),
                ))))
            }
            Ok(Client2Server::ExtranonceSubscribe(_)) | Err(MethodError::MethodNotFound(_)) => {
                // relay other requests as-is when a destination exists
                match proxy.current_dest() {
                    Some(dest) => dest
                        .write(cancel, &msg)
                        .await
                        .map_err(|e| Error::HandshakeDest(Box::new(e)))?,
                    None => warn!("dropping pre-handshake message without destination"),
                }
            }
            Err(e) => {
                return Err(Error::HandshakeSource(Box::new(Error::UnexpectedMessage(
                    e.to_string(),
                ))))
            }
        }
    }
}

/// Dials the default destination if this proxy has none yet.
async fn ensure_dest(
    proxy: &Arc<Proxy>,
    _cancel: &CancellationToken,
) -> Result<Arc<ConnDest>, Error> {
    if let Some(dest) = proxy.current_dest() {
        return Ok(dest);
    }
    let url = proxy.dest_url();
    let dest = (proxy.dest_factory())(url.clone())
        .await
        .map_err(|e| Error::HandshakeDest(Box::new(e)))?;
    proxy.swap_current_dest(dest.clone(), url);
    Ok(dest)
}

/// Reads the destination until the response with `id` arrives. Job
/// notifications received meanwhile update the destination state and are
/// relayed to the miner; extranonce and version-mask pushes are suppressed
/// because the handshake delivers those values itself.
async fn await_dest_response(
    proxy: &Arc<Proxy>,
    dest: &Arc<ConnDest>,
    cancel: &CancellationToken,
    id: u64,
) -> Result<Response, Error> {
    loop {
        let msg = tokio::select! {
            _ = tokio::time::sleep(crate::connection::RESPONSE_TIMEOUT) => {
                return Err(Error::HandshakeDest(Box::new(Error::ResponseTimeout(id))));
            }
            msg = dest.read(cancel) => msg.map_err(|e| Error::HandshakeDest(Box::new(e)))?,
        };
        match &msg {
            Message::Response(res) if res.id == id => return Ok(res.clone()),
            Message::Notification(n)
                if n.method == "mining.set_extranonce" || n.method == "mining.set_version_mask" =>
            {
                continue;
            }
            _ => {
                proxy
                    .source()
                    .write(cancel, &msg)
                    .await
                    .map_err(|e| Error::HandshakeSource(Box::new(e)))?;
            }
        }
    }
}

async fn on_mining_configure(
    proxy: &Arc<Proxy>,
    cancel: &CancellationToken,
    cfg: Configure,
) -> Result<(), Error> {
    proxy.source().set_version_rolling_request(
        cfg.version_rolling_mask(),
        cfg.version_rolling_min_bit_count().unwrap_or(0),
    );

    let dest = ensure_dest(proxy, cancel).await?;

    dest.write(cancel, &cfg.clone().into())
        .await
        .map_err(|e| Error::HandshakeDest(Box::new(e)))?;
    let res = await_dest_response(proxy, &dest, cancel, cfg.id).await?;

    let configure_result = ConfigureResult::try_from(&res).map_err(|e| {
        Error::HandshakeDest(Box::new(Error::UnexpectedMessage(format!(
            "expected configure result, got {res:?}: {e}"
        ))))
    })?;
    if let Some(mask) = configure_result.negotiated_mask() {
        dest.set_version_rolling(true, mask);
        proxy.source().set_negotiated_version_rolling_mask(mask);
    } else {
        dest.set_version_rolling(false, HexU32Be(0));
    }

    // Some pools push an extra set_version_mask right after the configure
    // result. Relaying it here confuses miners into a second subscribe, so
    // only the result itself goes back to the source.
    proxy
        .source()
        .write(cancel, &res.into())
        .await
        .map_err(|e| Error::HandshakeSource(Box::new(e)))
}

async fn on_mining_subscribe(
    proxy: &Arc<Proxy>,
    cancel: &CancellationToken,
    sub: Subscribe,
) -> Result<(), Error> {
    proxy.source().set_subscribe_received();

    let dest = ensure_dest(proxy, cancel).await?;

    dest.write(cancel, &sub.clone().into())
        .await
        .map_err(|e| Error::HandshakeDest(Box::new(e)))?;
    let res = await_dest_response(proxy, &dest, cancel, sub.id).await?;

    let subscribe_result = SubscribeResult::try_from(&res).map_err(|e| {
        Error::HandshakeDest(Box::new(Error::UnexpectedMessage(format!(
            "expected subscribe result, got {res:?}: {e}"
        ))))
    })?;

    let xn1 = subscribe_result.extra_nonce1.clone();
    let xn2size = subscribe_result.extra_nonce2_size;
    proxy
        .source()
        .set_extra_nonce(&String::from(&xn1), xn2size);
    dest.set_extra_nonce(xn1, xn2size);

    proxy
        .source()
        .write(cancel, &res.into())
        .await
        .map_err(|e| Error::HandshakeSource(Box::new(e)))
}

async fn on_mining_authorize(
    proxy: &Arc<Proxy>,
    cancel: &CancellationToken,
    auth: Authorize,
) -> Result<(), Error> {
    proxy.source().set_user_name(&auth.name);

    if !proxy.source().subscribe_received() {
        return Err(Error::HandshakeSource(Box::new(Error::UnexpectedMessage(
            "mining.authorize received before mining.subscribe".to_string(),
        ))));
    }
    let dest = proxy.current_dest().ok_or(Error::NoActiveDest)?;

    // the miner is acknowledged right away; its shares are validated locally
    proxy
        .source()
        .write(cancel, &auth.respond(true).into())
        .await
        .map_err(|e| Error::HandshakeSource(Box::new(e)))?;

    // worker name propagation: track renames on the proxy URL so cached
    // destination lookups keep matching
    let mut dest_url = proxy.dest_url();
    let user_name = super::username::dest_user_name(
        proxy.not_propagate_worker_name(),
        &auth.name,
        &dest_url,
    );
    if user_name != dest_url.username() {
        crate::utils::set_username(&mut dest_url, &user_name);
        proxy.set_dest_url(dest_url.clone());
    }
    dest.set_user_name(&user_name);

    let password = dest_url.password().unwrap_or_default().to_string();
    let dest_auth = Authorize {
        id: auth.id,
        name: user_name,
        password,
    };
    dest.write(cancel, &dest_auth.into())
        .await
        .map_err(|e| Error::HandshakeDest(Box::new(e)))?;
    let res = await_dest_response(proxy, &dest, cancel, auth.id).await?;

    if !res.is_success() {
        return Err(Error::HandshakeDest(Box::new(Error::NotAuthorizedPool(
            format!("{:?}", res.error),
        ))));
    }
    info!("connected to destination: {}", dest.id());

    proxy.dest_map().store(dest.clone());

    // subsequent handshakes rely on a job being available
    while !dest.first_job_signal().is_cancelled() {
        let msg = dest
            .read(cancel)
            .await
            .map_err(|e| Error::HandshakeDest(Box::new(e)))?;
        match &msg {
            Message::Notification(n)
                if n.method == "mining.set_extranonce" || n.method == "mining.set_version_mask" =>
            {
                continue
            }
            _ => proxy
                .source()
                .write(cancel, &msg)
                .await
                .map_err(|e| Error::HandshakeSource(Box::new(e)))?,
        }
    }

    super::log_handshake_done(proxy);
    Ok(())
}
