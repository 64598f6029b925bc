//! Server configuration: CLI flags (spec §6) plus construction-time
//! validation.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

/// Aether tunnel server: accepts TLS/WSS/mux carriers and dials a fixed
/// downstream destination.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct ServerConfig {
    /// Address to accept carriers on, e.g. 0.0.0.0:443
    #[arg(long, env = "AETHER_TUNNEL_SERVER_BIND_ADDR")]
    pub bind_addr: String,

    /// Fixed downstream destination to dial for every accepted carrier
    #[arg(long, env = "AETHER_TUNNEL_SERVER_DST_ADDR")]
    pub dst_addr: String,

    /// PEM certificate chain path; omit together with --key to self-sign
    #[arg(long, env = "AETHER_TUNNEL_SERVER_CERT")]
    pub cert: Option<String>,

    /// PEM private key path; omit together with --cert to self-sign
    #[arg(long, env = "AETHER_TUNNEL_SERVER_KEY")]
    pub key: Option<String>,

    /// CommonName/DNSName used when generating a self-signed certificate
    #[arg(long, env = "AETHER_TUNNEL_SERVER_SERVER_NAME")]
    pub server_name: Option<String>,

    /// Run without TLS, for placement behind an external TLS terminator
    #[arg(long, env = "AETHER_TUNNEL_SERVER_DISABLE_TLS")]
    pub disable_tls: bool,

    /// Accept the carrier as a WebSocket Secure upgrade instead of raw TLS
    #[arg(long, env = "AETHER_TUNNEL_SERVER_ENABLE_WSS")]
    pub enable_wss: bool,

    /// HTTP path the WSS upgrade handler is registered at
    #[arg(long, env = "AETHER_TUNNEL_SERVER_WSS_PATH", default_value = "/")]
    pub wss_path: String,

    /// Demultiplex accepted carriers as mux sessions
    #[arg(long, env = "AETHER_TUNNEL_SERVER_ENABLE_MUX")]
    pub enable_mux: bool,

    /// Per-session open-stream ceiling enforced on accepted mux sessions
    #[arg(long, env = "AETHER_TUNNEL_SERVER_MUX_MAX_STREAM", default_value_t = 16)]
    pub mux_max_stream: usize,

    /// Idle timeout in seconds applied to both directions of every tunnel
    #[arg(long, env = "AETHER_TUNNEL_SERVER_TIMEOUT", default_value_t = 60)]
    pub timeout_secs: u64,

    /// Enable TCP Fast Open on the accept listener (external sockopt hook)
    #[arg(long, env = "AETHER_TUNNEL_SERVER_ENABLE_TFO")]
    pub enable_tfo: bool,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, short = 'v', env = "AETHER_TUNNEL_SERVER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON instead of human-readable text
    #[arg(long, env = "AETHER_TUNNEL_SERVER_LOG_JSON")]
    pub log_json: bool,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.is_empty() {
            bail!("need bind address");
        }
        if self.dst_addr.is_empty() {
            bail!("need destination server address");
        }
        if self.timeout_secs < 1 {
            bail!("timeout value must be at least 1 sec");
        }
        if self.mux_max_stream < 1 || self.mux_max_stream > 16 {
            bail!("mux max stream should be between 1 and 16");
        }
        if self.cert.is_some() != self.key.is_some() {
            bail!("cert and key must be configured together, or not at all");
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServerConfig {
        ServerConfig {
            bind_addr: "0.0.0.0:443".into(),
            dst_addr: "127.0.0.1:8080".into(),
            cert: None,
            key: None,
            server_name: None,
            disable_tls: false,
            enable_wss: false,
            wss_path: "/".into(),
            enable_mux: false,
            mux_max_stream: 16,
            timeout_secs: 60,
            enable_tfo: false,
            log_level: "info".into(),
            log_json: false,
        }
    }

    #[test]
    fn rejects_mismatched_cert_key() {
        let mut cfg = base();
        cfg.cert = Some("cert.pem".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_self_signed_defaults() {
        assert!(base().validate().is_ok());
    }
}
