//! Presents a WebSocket binary-message connection as a continuous byte
//! stream [`Carrier`].
//!
//! Generic over the underlying transport `S` so the same adapter serves the
//! client's `tokio-tungstenite` dial and the server's hyper-upgraded
//! connection alike.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::carrier::Carrier;

/// Wraps a `WebSocketStream<S>` as a byte-stream `Carrier`. All payload
/// frames are binary messages; reads transparently advance from one message
/// to the next; each write is sent as exactly one binary message.
pub struct WsStreamAdapter<S> {
    ws: WebSocketStream<S>,
    pending: BytesMut,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl<S> WsStreamAdapter<S> {
    pub fn new(ws: WebSocketStream<S>, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            ws,
            pending: BytesMut::new(),
            local_addr,
            remote_addr,
        }
    }
}

impl<S> AsyncRead for WsStreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = std::cmp::min(buf.remaining(), this.pending.len());
                let chunk = this.pending.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.ws).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    this.pending = BytesMut::from(&data[..]);
                    continue;
                }
                // Ping/Pong/Frame/Text are either handled internally by
                // tungstenite or carry no tunnel payload; skip and re-poll.
                Poll::Ready(Some(Ok(_other))) => continue,
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)))
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut ws = Pin::new(&mut this.ws);
        match ws.as_mut().poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
            Poll::Pending => return Poll::Pending,
        }
        match ws.as_mut().start_send(Message::Binary(Bytes::copy_from_slice(buf))) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.ws)
            .poll_flush(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.ws)
            .poll_close(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl<S> Carrier for WsStreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.remote_addr)
    }
}
