//! MURouter (spec §4.8): an HTTP(S) server that looks up the requested
//! path in [`PathMap`] and, on a hit, upgrades to WebSocket and shuttles
//! bytes to that path's destination — mux-demultiplexed or not, per the
//! negotiated subprotocol. Grounded on `multi_user_http_mux.go`'s `mux`
//! type, generalizing its fixed `smuxConfig`/`upgrader` to this crate's
//! carrier stack.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use aether_tunnel_core::carrier::Carrier;
use aether_tunnel_core::mux::{self, MuxSessionConfig};
use aether_tunnel_core::ws_adapter::WsStreamAdapter;
use aether_tunnel_core::ws_carrier::{negotiate_mux, SUBPROTOCOL_MUX_OFF, SUBPROTOCOL_MUX_ON};
use aether_tunnel_core::{shuttle, tls_carrier};

use crate::config::MuServerConfig;
use crate::pathmap::PathMap;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, std::convert::Infallible>;

struct RouterState {
    config: MuServerConfig,
    path_map: Arc<PathMap>,
}

pub async fn run(
    config: MuServerConfig,
    path_map: Arc<PathMap>,
    tls_server_config: Option<Arc<rustls::ServerConfig>>,
) -> Result<()> {
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(RouterState { config, path_map });

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding router listener on {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, tls = tls_server_config.is_some(), "multi-user router listening");

    loop {
        let (tcp, peer) = listener.accept().await.context("accept on router listener")?;
        tcp.set_nodelay(true).ok();

        let state = state.clone();
        let tls_server_config = tls_server_config.clone();
        tokio::spawn(async move {
            match tls_server_config {
                Some(tls_conf) => match tls_carrier::accept_tls(tcp, tls_conf).await {
                    Ok(tls) => serve_http(TokioIo::new(tls), peer, state).await,
                    Err(e) => warn!(peer = %peer, error = %e, "tls handshake failed"),
                },
                None => serve_http(TokioIo::new(tcp), peer, state).await,
            }
        });
    }
}

async fn serve_http<IO>(io: IO, peer: SocketAddr, state: Arc<RouterState>)
where
    IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { Ok::<_, std::convert::Infallible>(handle_request(req, peer, state)) }
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
    state: Arc<RouterState>,
) -> Response<BoxBody> {
    let path = req.uri().path().to_string();
    let Some(dst) = state.path_map.get(&path) else {
        warn!(peer = %peer, path = %path, "invalid path");
        return not_found();
    };

    if !hyper_tungstenite::is_upgrade_request(&req) {
        return bad_request("expected a WebSocket upgrade");
    }

    let (mut response, websocket) = match hyper_tungstenite::upgrade(&mut req, Some(ws_config())) {
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
        let local_addr = state
            .config
            .bind_addr
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let adapter = WsStreamAdapter::new(ws, local_addr, peer);
        let mux_enabled = negotiate_mux(requested_subprotocol.as_deref(), state.config.enable_mux);

        if mux_enabled {
            serve_mux(adapter, dst, state).await;
        } else {
            dial_and_shuttle(adapter, dst, state).await;
        }
    });

    response.map(|body| body.boxed())
}

async fn serve_mux<C: Carrier>(carrier: C, dst: String, state: Arc<RouterState>) {
    let mux_config = MuxSessionConfig {
        stream_ceiling: state.config.mux_max_stream,
        ..MuxSessionConfig::default()
    };
    let ceiling = state.config.mux_max_stream;
    mux::serve_session(carrier, &mux_config, ceiling, move |stream| {
        let dst = dst.clone();
        let state = state.clone();
        async move { dial_and_shuttle(stream, dst, state).await }
    })
    .await;
}

async fn dial_and_shuttle<C: Carrier>(carrier: C, dst: String, state: Arc<RouterState>) {
    let conn = match TcpStream::connect(&dst).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(dst = %dst, error = %e, "dial destination failed");
            return;
        }
    };
    if let Ok(peer) = conn.peer_addr() {
        let opts = aether_tunnel_core::tcp_opts::TcpOptions {
            fast_open: state.config.enable_tfo,
        };
        aether_tunnel_core::tcp_opts::default_hook().on_connect(peer, &opts, &conn);
    }
    conn.set_nodelay(true).ok();

    if let Err(e) = shuttle(carrier, conn, state.config.idle_timeout()).await {
        debug!(error = %e, "tunnel closed with error");
    }
}

fn ws_config() -> tokio_tungstenite::tungstenite::protocol::WebSocketConfig {
    tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default()
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
