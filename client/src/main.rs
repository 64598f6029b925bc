mod config;
mod engine;

use clap::{CommandFactory, FromArgMatches};

use config::ClientConfig;
use engine::ClientEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    let argv = bootstrap_argv()?;
    let matches = ClientConfig::command().get_matches_from(argv);
    let mut config = ClientConfig::from_arg_matches(&matches)?;

    let (fast_open, vpn_mode) = aether_tunnel_core::sip003::fast_open_and_vpn_from_argv();
    config.enable_tfo |= fast_open;
    config.vpn_mode = vpn_mode;

    config.validate()?;
    init_tracing(&config);

    tracing::info!(
        bind = %config.bind_addr,
        remote = %config.remote_addr,
        wss = config.enable_wss,
        mux = config.enable_mux,
        "aether-tunnel-client starting"
    );

    ClientEngine::new(config).run().await
}

/// Resolves the real process argv, pre-pended with SIP003 plugin options
/// reformatted as flags when the shadowsocks-style environment is present
/// (spec §6). Fatal (non-zero exit via `anyhow::Error`) on a malformed
/// SIP003 environment.
fn bootstrap_argv() -> anyhow::Result<Vec<String>> {
    let mut argv: Vec<String> = std::env::args().collect();

    if let Some(sip003) = aether_tunnel_core::sip003::from_env()? {
        let mut prefix = vec![
            argv.first().cloned().unwrap_or_default(),
            "--bind-addr".to_string(),
            sip003.local_addr(),
            "--remote-addr".to_string(),
            sip003.remote_addr(),
        ];
        prefix.extend(aether_tunnel_core::sip003::format_plugin_options(
            &sip003.plugin_options,
        )?);
        prefix.extend(argv.drain(1..));
        argv = prefix;
    }

    Ok(argv)
}

fn init_tracing(config: &ClientConfig) {
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
