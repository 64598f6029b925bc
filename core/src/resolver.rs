//! Optional fallback-DNS resolution (spec §4.6): when a client is configured
//! with a fallback DNS IP, hostname resolution for the remote address is
//! done against that server over TCP instead of the system resolver.
//!
//! The original overwrites `net.DefaultResolver` process-wide; per spec
//! §9 that global mutation is replaced here with an explicit
//! [`FallbackDns`] value threaded through [`resolve_addr`] by the caller,
//! scoped to the configuration that asked for it rather than a global.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{bail, Context, Result};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DNS_PORT: u16 = 53;

/// A DNS server to query over TCP instead of the system resolver.
#[derive(Debug, Clone, Copy)]
pub struct FallbackDns {
    server: SocketAddr,
}

impl FallbackDns {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            server: SocketAddr::new(ip, DNS_PORT),
        }
    }

    /// Resolves `host` to its first IPv4 address via a single A-record query
    /// sent to this server over TCP (RFC 1035 §4.2.2 message-length framing).
    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        let mut stream = TcpStream::connect(self.server)
            .await
            .with_context(|| format!("dialing fallback DNS server {}", self.server))?;

        let query = build_query(host)?;
        let len = u16::try_from(query.len()).context("query too large to frame")?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&query).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let resp_len = u16::from_be_bytes(len_buf) as usize;
        let mut resp = vec![0u8; resp_len];
        stream.read_exact(&mut resp).await?;

        parse_a_record(&resp)
    }
}

/// Splits `host:port` and resolves the host, consulting `fallback` first
/// when present, the system resolver otherwise. A host that is already a
/// literal IP address is returned unchanged without any lookup.
pub async fn resolve_addr(host_port: &str, fallback: Option<&FallbackDns>) -> io::Result<SocketAddr> {
    let (host, port) = host_port.rsplit_once(':').ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a host:port address: {host_port}"),
        )
    })?;
    let port: u16 = port
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port: {port}")))?;

    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    if let Some(fallback) = fallback {
        let ip = fallback
            .resolve(host)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        return Ok(SocketAddr::new(ip, port));
    }

    tokio::net::lookup_host(host_port)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host_port}")))
}

fn build_query(host: &str) -> Result<Vec<u8>> {
    let mut msg = Vec::with_capacity(32);
    let id: u16 = rand::thread_rng().gen();
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&0x0100u16.to_be_bytes()); // recursion desired
    msg.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    msg.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    msg.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    msg.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            bail!("invalid DNS label in host name: {host}");
        }
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0); // root label
    msg.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    msg.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    Ok(msg)
}

/// Walks the header, skips the (echoed) question section, then scans answer
/// records for the first A (type 1, class IN) record.
fn parse_a_record(resp: &[u8]) -> Result<IpAddr> {
    if resp.len() < 12 {
        bail!("DNS response too short");
    }
    let qdcount = u16::from_be_bytes([resp[4], resp[5]]) as usize;
    let ancount = u16::from_be_bytes([resp[6], resp[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(resp, pos)?;
        pos += 4; // QTYPE + QCLASS
    }

    for _ in 0..ancount {
        pos = skip_name(resp, pos)?;
        if pos + 10 > resp.len() {
            bail!("truncated DNS answer record");
        }
        let rtype = u16::from_be_bytes([resp[pos], resp[pos + 1]]);
        let rclass = u16::from_be_bytes([resp[pos + 2], resp[pos + 3]]);
        let rdlength = u16::from_be_bytes([resp[pos + 8], resp[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > resp.len() {
            bail!("truncated DNS answer rdata");
        }
        if rtype == 1 && rclass == 1 && rdlength == 4 {
            return Ok(IpAddr::V4(Ipv4Addr::new(
                resp[pos],
                resp[pos + 1],
                resp[pos + 2],
                resp[pos + 3],
            )));
        }
        pos += rdlength;
    }

    bail!("no A record in DNS response")
}

/// Advances past a (possibly compressed) DNS name, returning the offset of
/// the byte following it.
fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        if pos >= buf.len() {
            bail!("truncated DNS name");
        }
        let len = buf[pos] as usize;
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            // compression pointer: two bytes, no further bytes of this name
            return Ok(pos + 2);
        }
        pos += 1 + len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_well_formed_query() {
        let q = build_query("example.com").unwrap();
        assert_eq!(&q[4..6], &1u16.to_be_bytes()); // QDCOUNT = 1
        assert!(q.ends_with(&[0, 1, 0, 1])); // QTYPE=A, QCLASS=IN, big-endian u16s
    }

    #[test]
    fn rejects_overlong_label() {
        let long_label = "a".repeat(64);
        assert!(build_query(&long_label).is_err());
    }

    #[tokio::test]
    async fn resolve_addr_passes_through_literal_ip() {
        let addr = resolve_addr("127.0.0.1:8080", None).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }
}
