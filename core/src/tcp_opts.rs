//! Opaque OS-specific socket tuning, threaded through as a pre-bind/
//! pre-connect hook rather than implemented here (spec §1, §3: TCP Fast
//! Open, NODELAY, SO_SNDBUF/RCVBUF and Android VPN `protect_path` fd-passing
//! are all external collaborators).

use std::net::SocketAddr;

use tokio::net::TcpStream;

/// Socket tuning requested by configuration; consumed only as a value
/// passed to a pre-bind/pre-connect hook.
#[derive(Debug, Clone, Default)]
pub struct TcpOptions {
    pub fast_open: bool,
}

/// Invoked with a freshly connected or about-to-be-bound socket's address
/// before the engine uses it. The hook itself applies OS-specific sockopts;
/// this crate only defines the call site.
pub trait PreConnectHook: Send + Sync {
    fn on_connect(&self, addr: SocketAddr, opts: &TcpOptions, stream: &TcpStream);
}

/// A hook that does nothing, for platforms/configurations with no
/// OS-specific tuning to apply.
pub struct NoopHook;

impl PreConnectHook for NoopHook {
    fn on_connect(&self, _addr: SocketAddr, _opts: &TcpOptions, _stream: &TcpStream) {}
}

/// A `NoopHook` wrapped for the call sites in `client`/`server`/`mu-server`
/// that thread a hook through without caring which concrete implementation
/// is used; swap in a real OS-specific hook here without touching the
/// engines that call it.
pub fn default_hook() -> std::sync::Arc<dyn PreConnectHook> {
    std::sync::Arc::new(NoopHook)
}
