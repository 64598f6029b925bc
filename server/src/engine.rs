//! ServerEngine (spec §4.7): accepts carriers (raw TLS or WSS, optionally
//! mux-demultiplexed) and dials the fixed downstream destination for each.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use aether_tunnel_core::carrier::{BoxedCarrier, Carrier};
use aether_tunnel_core::mux::{self, MuxSessionConfig};
use aether_tunnel_core::ws_adapter::WsStreamAdapter;
use aether_tunnel_core::ws_carrier::{negotiate_mux, SUBPROTOCOL_MUX_OFF, SUBPROTOCOL_MUX_ON};
use aether_tunnel_core::{shuttle, tls_carrier};

use crate::config::ServerConfig;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, std::convert::Infallible>;

pub struct ServerEngine {
    config: Arc<ServerConfig>,
    tls_server_config: Option<Arc<rustls::ServerConfig>>,
}

impl ServerEngine {
    /// Builds the eagerly-loaded TLS server config, self-signing when
    /// neither `--cert` nor `--key` is configured (spec §4.3), unless
    /// `--disable-tls` places this server behind an external terminator.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let tls_server_config = if config.disable_tls {
            None
        } else {
            let rustls_config = match (&config.cert, &config.key) {
                (Some(cert), Some(key)) => {
                    let cert_pem = std::fs::read(cert)
                        .with_context(|| format!("reading certificate file {cert}"))?;
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
        };

        Ok(Self {
            config: Arc::new(config),
            tls_server_config,
        })
    }

    pub async fn run(self) -> Result<()> {
        if self.config.enable_wss {
            self.run_wss().await
        } else {
            self.run_raw().await
        }
    }

    async fn run_raw(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("binding listener on {}", self.config.bind_addr))?;
        info!(addr = %listener.local_addr()?, "aether-tunnel-server listening (raw TLS)");

        loop {
            let (tcp, peer) = listener.accept().await.context("accept on listener")?;
            tcp.set_nodelay(true).ok();

            let config = self.config.clone();
            let tls_server_config = self.tls_server_config.clone();
            tokio::spawn(async move {
                let carrier: BoxedCarrier = match tls_server_config {
                    Some(tls_conf) => match tls_carrier::accept_tls(tcp, tls_conf).await {
                        Ok(tls) => Box::new(tls),
                        Err(e) => {
                            error!(peer = %peer, error = %e, "tls handshake failed");
                            return;
                        }
                    },
                    None => Box::new(tcp),
                };
                serve_carrier(carrier, config).await;
            });
        }
    }

    async fn run_wss(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("binding listener on {}", self.config.bind_addr))?;
        info!(addr = %listener.local_addr()?, path = %self.config.wss_path, "aether-tunnel-server listening (WSS)");

        loop {
            let (tcp, peer) = listener.accept().await.context("accept on listener")?;
            tcp.set_nodelay(true).ok();

            let config = self.config.clone();
            let tls_server_config = self.tls_server_config.clone();
            tokio::spawn(async move {
                match tls_server_config {
                    Some(tls_conf) => match tls_carrier::accept_tls(tcp, tls_conf).await {
                        Ok(tls) => serve_http(TokioIo::new(tls), peer, config).await,
                        Err(e) => error!(peer = %peer, error = %e, "tls handshake failed"),
                    },
                    None => serve_http(TokioIo::new(tcp), peer, config).await,
                }
            });
        }
    }
}

async fn serve_http<IO>(io: IO, peer: SocketAddr, config: Arc<ServerConfig>)
where
    IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
        let config = config.clone();
        async move { Ok::<_, std::convert::Infallible>(handle_request(req, peer, config)) }
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        debug!(peer = %peer, error = %e, "http connection ended with error");
    }
}

fn handle_request(
    mut req: Request<Incoming>,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
) -> Response<BoxBody> {
    if req.uri().path() != config.wss_path {
        return not_found();
    }

    if !hyper_tungstenite::is_upgrade_request(&req) {
        return bad_request("expected a WebSocket upgrade");
    }

    let (mut response, websocket) = match hyper_tungstenite::upgrade(
        &mut req,
        Some(tungstenite_ws_config()),
    ) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(peer = %peer, error = %e, "websocket upgrade failed");
            return bad_request("upgrade failed");
        }
    };

    let requested_subprotocol = req
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Echo back whichever of the two recognized subprotocols was
    // negotiated (spec §4.4: "the server selects the subprotocol").
    if let Some(selected) = requested_subprotocol.as_deref().filter(|p| {
        *p == SUBPROTOCOL_MUX_ON || *p == SUBPROTOCOL_MUX_OFF
    }) {
        if let Ok(value) = hyper::header::HeaderValue::from_str(selected) {
            response.headers_mut().insert("sec-websocket-protocol", value);
        }
    }

    tokio::spawn(async move {
        let ws = match websocket.await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(peer = %peer, error = %e, "websocket handshake failed");
                return;
            }
        };
        let local_addr = config
            .bind_addr
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let adapter = WsStreamAdapter::new(ws, local_addr, peer);
        let mux_enabled = negotiate_mux(requested_subprotocol.as_deref(), config.enable_mux);

        if mux_enabled {
            serve_mux(adapter, config).await;
        } else {
            dial_and_shuttle(adapter, config).await;
        }
    });

    response.map(|body| body.boxed())
}

fn tungstenite_ws_config() -> tokio_tungstenite::tungstenite::protocol::WebSocketConfig {
    tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default()
}

async fn serve_carrier(carrier: BoxedCarrier, config: Arc<ServerConfig>) {
    if config.enable_mux {
        serve_mux(carrier, config).await;
    } else {
        dial_and_shuttle(carrier, config).await;
    }
}

async fn serve_mux<C: Carrier>(carrier: C, config: Arc<ServerConfig>) {
    let mux_config = MuxSessionConfig {
        stream_ceiling: config.mux_max_stream,
        ..MuxSessionConfig::default()
    };
    let ceiling = config.mux_max_stream;
    mux::serve_session(carrier, &mux_config, ceiling, move |stream| {
        let config = config.clone();
        async move { dial_and_shuttle(stream, config).await }
    })
    .await;
}

async fn dial_and_shuttle<C: Carrier>(carrier: C, config: Arc<ServerConfig>) {
    let dst = match TcpStream::connect(&config.dst_addr).await {
        Ok(dst) => dst,
        Err(e) => {
            warn!(dst = %config.dst_addr, error = %e, "dial destination failed");
            return;
        }
    };
    if let Ok(peer) = dst.peer_addr() {
        let opts = aether_tunnel_core::tcp_opts::TcpOptions {
            fast_open: config.enable_tfo,
        };
        aether_tunnel_core::tcp_opts::default_hook().on_connect(peer, &opts, &dst);
    }
    dst.set_nodelay(true).ok();

    if let Err(e) = shuttle(carrier, dst, config.idle_timeout()).await {
        debug!(error = %e, "tunnel closed with error");
    }
}

fn not_found() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Empty::new().boxed())
        .expect("building a static 404 response cannot fail")
}

fn bad_request(msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header("X-Error", msg)
        .body(Empty::new().boxed())
        .expect("building a static 400 response cannot fail")
}
