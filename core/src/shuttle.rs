//! Full-duplex byte copy between two [`Carrier`]s with a symmetric idle
//! timeout, coordinated teardown and first-error reporting.

use std::io;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::carrier::Carrier;

const COPY_BUFFER_SIZE: usize = 16 * 1024;
const POOL_CAP: usize = 512;

fn pool() -> &'static Mutex<Vec<Vec<u8>>> {
    static POOL: OnceLock<Mutex<Vec<Vec<u8>>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(Vec::new()))
}

/// A 16 KiB scratch buffer checked out of the process-wide pool, returned on
/// every exit path (including panic-unwind) via `Drop`.
struct PooledBuffer(Option<Vec<u8>>);

impl PooledBuffer {
    fn acquire() -> Self {
        let buf = pool()
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; COPY_BUFFER_SIZE]);
        Self(Some(buf))
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        self.0.as_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.0.take() {
            let mut guard = pool().lock().unwrap();
            if guard.len() < POOL_CAP {
                guard.push(buf);
            }
        }
    }
}

/// Copies from `reader` to `writer` until EOF, a read/write idle timeout, or
/// an I/O error. Returns `Ok(())` on clean EOF; any other outcome is `Err`.
async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    idle_timeout: Duration,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = PooledBuffer::acquire();
    loop {
        let n = match tokio::time::timeout(idle_timeout, reader.read(buf.as_mut_slice())).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "read idle timeout")),
        };
        match tokio::time::timeout(idle_timeout, writer.write_all(&buf.as_mut_slice()[..n])).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "write idle timeout"))
            }
        }
        // write_all only guarantees the data was handed to the writer, not
        // that it left the process (the WS and mux carriers buffer a frame
        // until flushed); without this the shuttle can stall forever on a
        // carrier that never gets a second write to piggyback the flush on.
        match tokio::time::timeout(idle_timeout, writer.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "write idle timeout")),
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Copies bytes in both directions between `a` and `b` simultaneously.
///
/// Each direction runs as its own task against its own `AsyncRead`/
/// `AsyncWrite` half (via `tokio::io::split`). `write_all` already loops to
/// completion or error, so there is no separate "short write" case to detect
/// the way the original's raw `Write` call required — any partial-write
/// failure surfaces as an `io::Error` from `write_all` itself.
///
/// When either direction finishes (cleanly or with an error) the other is
/// aborted, which drops its held halves and releases the underlying carrier.
/// The first non-EOF error observed is returned; clean EOF on both sides
/// yields `Ok(())`.
pub async fn shuttle<A, B>(a: A, b: B, idle_timeout: Duration) -> io::Result<()>
where
    A: Carrier,
    B: Carrier,
{
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);

    run(ar, aw, br, bw, idle_timeout).await
}

async fn run<A, B>(
    ar: ReadHalf<A>,
    aw: WriteHalf<A>,
    br: ReadHalf<B>,
    bw: WriteHalf<B>,
    idle_timeout: Duration,
) -> io::Result<()>
where
    A: Carrier,
    B: Carrier,
{
    let mut fwd = tokio::spawn(copy_direction(ar, bw, idle_timeout));
    let mut rev = tokio::spawn(copy_direction(br, aw, idle_timeout));

    let (fwd_result, rev_result) = tokio::select! {
        res = &mut fwd => {
            rev.abort();
            (res, rev.await)
        }
        res = &mut rev => {
            fwd.abort();
            (fwd.await, res)
        }
    };

    let fwd_err = fwd_result.ok().and_then(Result::err);
    let rev_err = rev_result.ok().and_then(Result::err);
    fwd_err.or(rev_err).map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn echoes_bytes_in_order() {
        let (client_a, mut server_a) = duplex(4096);
        let (client_b, mut server_b) = duplex(4096);

        let shuttle_task = tokio::spawn(shuttle(client_a, client_b, Duration::from_secs(5)));

        server_a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server_b.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        server_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(server_a);
        drop(server_b);
        let result = shuttle_task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn idle_timeout_tears_down_both_directions() {
        let (client_a, server_a) = duplex(4096);
        let (client_b, _server_b) = duplex(4096);

        let shuttle_task = tokio::spawn(shuttle(client_a, client_b, Duration::from_millis(200)));
        // Neither side writes anything; both directions should time out.
        let result = tokio::time::timeout(Duration::from_secs(2), shuttle_task)
            .await
            .expect("shuttle did not tear down within the timeout interval")
            .unwrap();
        assert!(result.is_err());
        drop(server_a);
    }
}
