mod config;
mod engine;

use clap::{CommandFactory, FromArgMatches};

use config::ServerConfig;
use engine::ServerEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    let argv = bootstrap_argv()?;
    let matches = ServerConfig::command().get_matches_from(argv);
    let mut config = ServerConfig::from_arg_matches(&matches)?;

    let (fast_open, _vpn) = aether_tunnel_core::sip003::fast_open_and_vpn_from_argv();
    config.enable_tfo |= fast_open;

    config.validate()?;
    init_tracing(&config);

    tracing::info!(
        bind = %config.bind_addr,
        dst = %config.dst_addr,
        wss = config.enable_wss,
        mux = config.enable_mux,
        tls = !config.disable_tls,
        "aether-tunnel-server starting"
    );

    ServerEngine::new(config)?.run().await
}

/// Mirrors the client's SIP003 bootstrap (spec §6): if the shadowsocks
/// plugin environment is present, its options are reformatted as flags and
/// prepended to argv before clap sees it. The server's address roles are
/// swapped relative to the client's: it binds on SS_REMOTE_* (where the
/// shadowsocks server expects to reach it) and dials SS_LOCAL_* (the
/// destination the shadowsocks client would otherwise connect to directly).
fn bootstrap_argv() -> anyhow::Result<Vec<String>> {
    let mut argv: Vec<String> = std::env::args().collect();

    if let Some(sip003) = aether_tunnel_core::sip003::from_env()? {
        let mut prefix = vec![
            argv.first().cloned().unwrap_or_default(),
            "--bind-addr".to_string(),
            sip003.remote_addr(),
            "--dst-addr".to_string(),
            sip003.local_addr(),
        ];
        prefix.extend(aether_tunnel_core::sip003::format_plugin_options(
            &sip003.plugin_options,
        )?);
        prefix.extend(argv.drain(1..));
        argv = prefix;
    }

    Ok(argv)
}

fn init_tracing(config: &ServerConfig) {
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
