mod config;
mod control;
mod pathmap;
mod router;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::warn;

use aether_tunnel_core::tls_carrier;
use config::MuServerConfig;
use pathmap::PathMap;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    let config = MuServerConfig::parse();
    config.validate()?;
    init_tracing(&config);

    tracing::info!(
        bind = %config.bind_addr,
        controller = %config.controller_addr,
        tls = config.tls_enabled(),
        mux = config.enable_mux,
        "aether-tunnel-mu-server starting"
    );

    let tls_server_config = if config.tls_enabled() {
        let rustls_config = match (&config.cert, &config.key) {
            (Some(cert), Some(key)) => {
                let cert_pem =
                    std::fs::read(cert).with_context(|| format!("reading certificate file {cert}"))?;
                let key_pem =
                    std::fs::read(key).with_context(|| format!("reading key file {key}"))?;
                tls_carrier::server_config_from_pem(&cert_pem, &key_pem)?
            }
            _ => {
                warn!("no certificate configured, using a self-signed certificate");
                tls_carrier::self_signed(config.server_name.as_deref())?
            }
        };
        Some(Arc::new(rustls_config))
    } else {
        None
    };

    let path_map = Arc::new(PathMap::new());

    let router = tokio::spawn(router::run(config.clone(), path_map.clone(), tls_server_config));
    let controller = tokio::spawn(control::run(config.controller_addr.clone(), path_map));

    tokio::select! {
        result = router => result.context("router task panicked")?.context("router exited"),
        result = controller => result.context("controller task panicked")?.context("controller exited"),
    }
}

fn init_tracing(config: &MuServerConfig) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
