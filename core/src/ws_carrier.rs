//! WSCarrier: client-side WSS dial with a dial-address override, and the
//! server-side subprotocol negotiation shared by the plain server and the
//! multi-user router.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use http::Request;
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::tcp_opts::{PreConnectHook, TcpOptions};
use crate::tls_carrier::wrap_tls_client;
use crate::ws_adapter::WsStreamAdapter;

pub const SUBPROTOCOL_MUX_ON: &str = "mux-on";
pub const SUBPROTOCOL_MUX_OFF: &str = "mux-off";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials `wss://<server_name><path>`, with the underlying TCP connection
/// made to `dial_addr` rather than to whatever `server_name` resolves to —
/// this is what lets the configured remote address and the TLS/WS server
/// name differ. `hook` is the same pre-connect hook `dial_tls` invokes.
#[allow(clippy::too_many_arguments)]
pub async fn dial_wss(
    dial_addr: SocketAddr,
    server_name: &str,
    path: &str,
    insecure_skip_verify: bool,
    mux_enabled: bool,
    opts: &TcpOptions,
    hook: &dyn PreConnectHook,
) -> Result<WsStreamAdapter<tokio_rustls::client::TlsStream<TcpStream>>> {
    let tcp = TcpStream::connect(dial_addr)
        .await
        .with_context(|| format!("dialing TCP carrier to {dial_addr}"))?;
    hook.on_connect(dial_addr, opts, &tcp);
    tcp.set_nodelay(true).ok();
    let local_addr = tcp.local_addr()?;

    let tls = wrap_tls_client(tcp, server_name, insecure_skip_verify).await?;

    let subprotocol = if mux_enabled {
        SUBPROTOCOL_MUX_ON
    } else {
        SUBPROTOCOL_MUX_OFF
    };

    let uri = format!("wss://{server_name}{path}");
    let mut request: Request<()> = uri
        .into_client_request()
        .with_context(|| format!("building WS request for {uri}"))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", subprotocol.parse()?);

    let (ws_stream, _response) = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::client_async(request, tls),
    )
    .await
    .context("WebSocket handshake timed out")?
    .context("WebSocket handshake failed")?;

    Ok(WsStreamAdapter::new(ws_stream, local_addr, dial_addr))
}

/// Resolves whether a server-accepted WS connection should run in mux mode,
/// given the client's requested subprotocol (if any) and the server's own
/// global default. Per spec: `mux-on` forces mux on, `mux-off` forces it
/// off, and a subprotocol naming neither falls back to the server default
/// (tolerant behavior, kept intentionally — see DESIGN.md).
pub fn negotiate_mux(requested_subprotocol: Option<&str>, server_default_enable_mux: bool) -> bool {
    match requested_subprotocol {
        Some(SUBPROTOCOL_MUX_ON) => true,
        Some(SUBPROTOCOL_MUX_OFF) => false,
        _ => server_default_enable_mux,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_on_forces_mux_regardless_of_default() {
        assert!(negotiate_mux(Some(SUBPROTOCOL_MUX_ON), false));
    }

    #[test]
    fn mux_off_disables_mux_regardless_of_default() {
        assert!(!negotiate_mux(Some(SUBPROTOCOL_MUX_OFF), true));
    }

    #[test]
    fn unrecognized_subprotocol_falls_back_to_server_default() {
        assert!(negotiate_mux(Some("something-else"), true));
        assert!(!negotiate_mux(None, false));
    }
}
