//! The [`Carrier`] abstraction: every layer of the stack (raw TCP, TLS,
//! WebSocket, mux stream) exposes the same read/write/close/addr capability
//! set, so upper layers compose without caring which concrete kind they hold.
//!
//! Deadlines are not modeled as a settable field on the carrier itself;
//! callers wrap individual reads/writes in `tokio::time::timeout` at the
//! point of use (see [`crate::shuttle::shuttle`]). This is the idiomatic
//! tokio translation of a per-connection `SetDeadline` call.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A reliable, ordered, bidirectional byte-stream endpoint.
///
/// Every upper layer in the stack (TLS, WebSocket, mux stream) is also a
/// `Carrier`, composed by wrapping rather than subclassing.
pub trait Carrier: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn remote_addr(&self) -> io::Result<SocketAddr>;
}

impl Carrier for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

impl Carrier for tokio_rustls::client::TlsStream<TcpStream> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.local_addr()
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.peer_addr()
    }
}

impl Carrier for tokio_rustls::server::TlsStream<TcpStream> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.local_addr()
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.peer_addr()
    }
}

/// Test-only: `tokio::io::duplex` pipes stand in for a real carrier in
/// loopback tests, where the addresses are never inspected.
#[cfg(test)]
impl Carrier for tokio::io::DuplexStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(([127, 0, 0, 1], 0).into())
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        Ok(([127, 0, 0, 1], 0).into())
    }
}

/// A type-erased carrier for call sites that need to hold either a raw TLS
/// carrier or a WSS carrier behind one handle (e.g. the client's one-shot
/// outbound dial).
pub type BoxedCarrier = Box<dyn Carrier>;

impl Carrier for BoxedCarrier {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        (**self).remote_addr()
    }
}
