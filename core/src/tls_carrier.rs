//! TLS wrapping of a raw TCP [`Carrier`], client and server sides, plus the
//! self-signed-certificate helper used when no cert/key pair is configured.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::Resumption;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::tcp_opts::{PreConnectHook, TcpOptions};

const SESSION_CACHE_SIZE: usize = 16;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects a TCP carrier to `addr` and performs a TLS client handshake
/// against `server_name`. The handshake runs eagerly; a failed handshake
/// fails the whole call rather than deferring to first use. `hook` is
/// invoked on the freshly connected socket before any NODELAY/TLS work, the
/// pre-connect hook of spec §3.
pub async fn dial_tls(
    addr: SocketAddr,
    server_name: &str,
    insecure_skip_verify: bool,
    opts: &TcpOptions,
    hook: &dyn PreConnectHook,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr)
        .await
        .with_context(|| format!("dialing TCP carrier to {addr}"))?;
    hook.on_connect(addr, opts, &tcp);
    tcp.set_nodelay(true).ok();

    wrap_tls_client(tcp, server_name, insecure_skip_verify).await
}

/// Performs the TLS client handshake over an already-connected TCP carrier.
/// Used directly by [`crate::ws_carrier`] so the TCP dial address can differ
/// from the TLS/WS server name.
pub async fn wrap_tls_client(
    tcp: TcpStream,
    server_name: &str,
    insecure_skip_verify: bool,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(build_client_config(insecure_skip_verify)?));
    let name = ServerName::try_from(server_name.to_string())
        .with_context(|| format!("invalid TLS server name: {server_name}"))?;

    let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(name, tcp))
        .await
        .context("TLS client handshake timed out")?
        .context("TLS client handshake failed")?;

    Ok(stream)
}

fn build_client_config(insecure_skip_verify: bool) -> Result<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    config.resumption = Resumption::in_memory_sessions(SESSION_CACHE_SIZE);
    Ok(config)
}

/// Accepts a TCP connection and wraps it as a TLS server using a
/// preconstructed [`ServerConfig`].
pub async fn accept_tls(
    tcp: TcpStream,
    server_config: Arc<ServerConfig>,
) -> Result<tokio_rustls::server::TlsStream<TcpStream>> {
    let acceptor = TlsAcceptor::from(server_config);
    let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
        .await
        .context("TLS server handshake timed out")?
        .context("TLS server handshake failed")?;
    Ok(stream)
}

/// Builds a [`ServerConfig`] from a loaded PEM certificate chain and key.
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<ServerConfig> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<_, _>>()
        .context("parsing PEM certificate chain")?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("parsing PEM private key")?
        .context("no private key found in key file")?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config from loaded certificate")?;
    Ok(config)
}

/// Generates a self-signed ECDSA P-384 certificate for `server_name` (or a
/// random `aaa.b`-style name if none is configured). Never persisted to
/// disk; the PEM bytes are handed straight to [`server_config_from_pem`].
pub fn self_signed(server_name: Option<&str>) -> Result<ServerConfig> {
    use rcgen::{
        CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
        KeyUsagePurpose, SerialNumber,
    };
    use time::{Duration as TimeDuration, OffsetDateTime};

    let name = server_name
        .map(str::to_string)
        .unwrap_or_else(random_server_name);

    let mut params = CertificateParams::new(vec![name.clone()]).context("building cert params")?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name.clone());
    params.distinguished_name = dn;
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(365 * 10);
    params.serial_number = Some(SerialNumber::from_slice(&random_serial_128()));
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.is_ca = IsCa::ExplicitNoCa;

    let key_pair =
        KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).context("generating P-384 key")?;
    let cert = params
        .self_signed(&key_pair)
        .context("self-signing certificate")?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    server_config_from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
}

fn random_serial_128() -> [u8; 16] {
    rand::thread_rng().gen()
}

fn random_server_name() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let label: String = (0..3)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    let tld: char = ALPHABET[rng.gen_range(0..ALPHABET.len())] as char;
    format!("{label}.{tld}")
}

/// Accepts every server certificate unconditionally. Used only when the
/// client is explicitly configured with `insecure_skip_verify`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
