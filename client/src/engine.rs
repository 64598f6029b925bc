//! ClientEngine (spec §4.6): accepts local TCP, obtains an outbound carrier
//! (raw TLS, WSS, or a mux stream) per connection, and shuttles the pair.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use aether_tunnel_core::carrier::BoxedCarrier;
use aether_tunnel_core::mux::{MuxPool, MuxSessionConfig};
use aether_tunnel_core::resolver::{resolve_addr, FallbackDns};
use aether_tunnel_core::tcp_opts::{self, PreConnectHook, TcpOptions};
use aether_tunnel_core::{shuttle, tls_carrier, ws_carrier};

use crate::config::ClientConfig;

pub struct ClientEngine {
    config: Arc<ClientConfig>,
    fallback_dns: Option<FallbackDns>,
    mux_pool: Option<Arc<MuxPool>>,
}

impl ClientEngine {
    /// Builds the engine. The fallback-DNS override (if configured) is
    /// resolved here, once, and threaded through every subsequent dial
    /// rather than mutated into a process global (spec §9).
    pub fn new(config: ClientConfig) -> Self {
        let fallback_dns = config.fallback_dns.map(FallbackDns::new);
        let config = Arc::new(config);

        let mux_pool = if config.enable_mux {
            Some(Self::build_mux_pool(config.clone(), fallback_dns))
        } else {
            None
        };

        Self {
            config,
            fallback_dns,
            mux_pool,
        }
    }

    fn build_mux_pool(config: Arc<ClientConfig>, fallback_dns: Option<FallbackDns>) -> Arc<MuxPool> {
        let mux_config = MuxSessionConfig {
            stream_ceiling: config.mux_max_stream,
            ..MuxSessionConfig::default()
        };
        let dial = Box::new(move || {
            let config = config.clone();
            Box::pin(async move { dial_outbound(&config, fallback_dns, true).await })
                as std::pin::Pin<Box<dyn std::future::Future<Output = Result<BoxedCarrier>> + Send>>
        });
        MuxPool::new(mux_config, dial)
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("binding local listener on {}", self.config.bind_addr))?;
        info!(addr = %listener.local_addr()?, "aether-tunnel-client listening");

        loop {
            let (local, peer) = listener
                .accept()
                .await
                .context("accept on local listener")?;
            local.set_nodelay(true).ok();
            debug!(peer = %peer, "local connection accepted");

            let config = self.config.clone();
            let fallback_dns = self.fallback_dns;
            let mux_pool = self.mux_pool.clone();
            tokio::spawn(async move {
                handle_connection(local, config, fallback_dns, mux_pool).await;
            });
        }
    }
}

async fn handle_connection(
    local: TcpStream,
    config: Arc<ClientConfig>,
    fallback_dns: Option<FallbackDns>,
    mux_pool: Option<Arc<MuxPool>>,
) {
    let outbound: BoxedCarrier = if let Some(pool) = mux_pool {
        match pool.open_stream().await {
            Ok(stream) => Box::new(stream),
            Err(e) => {
                warn!(error = %e, "mux openStream failed");
                return;
            }
        }
    } else {
        match dial_outbound(&config, fallback_dns, false).await {
            Ok(carrier) => carrier,
            Err(e) => {
                warn!(error = %e, "connect to remote failed");
                return;
            }
        }
    };

    if let Err(e) = shuttle(local, outbound, config.idle_timeout()).await {
        debug!(error = %e, "tunnel closed with error");
    }
}

/// Dials a fresh outbound carrier: WSS if enabled, else raw TLS. `mux_hint`
/// is the subprotocol a WSS dial should advertise (always `mux-on` when
/// called to seed a new mux session, mirroring the one-shot dial's own
/// `enable_mux` otherwise).
async fn dial_outbound(
    config: &ClientConfig,
    fallback_dns: Option<FallbackDns>,
    mux_hint: bool,
) -> Result<BoxedCarrier> {
    let addr = resolve_addr(&config.remote_addr, fallback_dns.as_ref())
        .await
        .with_context(|| format!("resolving remote address {}", config.remote_addr))?;

    let opts = TcpOptions {
        fast_open: config.enable_tfo,
    };
    let hook = tcp_opts::default_hook();
    let hook: &dyn PreConnectHook = hook.as_ref();

    if config.enable_wss {
        let ws = ws_carrier::dial_wss(
            addr,
            config.server_name(),
            &config.wss_path,
            config.insecure_skip_verify,
            mux_hint || config.enable_mux,
            &opts,
            hook,
        )
        .await?;
        Ok(Box::new(ws))
    } else {
        let tls = tls_carrier::dial_tls(
            addr,
            config.server_name(),
            config.insecure_skip_verify,
            &opts,
            hook,
        )
        .await?;
        Ok(Box::new(tls))
    }
}
