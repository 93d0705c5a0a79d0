mod args;

use args::Args;
use proxy_sv1::{
    config::ProxyConfig,
    error::{Error, ProxyResult},
    ProxySv1,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn process_cli_args() -> ProxyResult<ProxyConfig> {
    let args = Args::from_args().map_err(|help| {
        error!("{}", help);
        Error::BadCliArgs(help)
    })?;
    ProxyConfig::load(&args.config_path)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let proxy_config = match process_cli_args() {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    info!("Proxy Config: {:?}", &proxy_config);

    // The Ethereum-backed contract store and the ECIES key utilities are
    // wired in by the embedding deployment; standalone the role serves as a
    // plain multiplexing proxy.
    if let Err(e) = ProxySv1::new(proxy_config).start(None).await {
        error!("proxy exited with error: {}", e);
        std::process::exit(1);
    }
}
