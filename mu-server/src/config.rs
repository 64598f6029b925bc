//! Multi-user server configuration: CLI flags (spec §6) plus
//! construction-time validation. Grounded on `mu_server.go`'s flag set.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

/// Aether tunnel multi-user server: path-routed WSS/mux router plus a
/// JSON control API.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct MuServerConfig {
    /// Address the router accepts WebSocket carriers on, e.g. 0.0.0.0:443
    #[arg(long, env = "AETHER_TUNNEL_MU_BIND_ADDR")]
    pub bind_addr: String,

    /// Address the control API listens on, separate from the router
    #[arg(long, env = "AETHER_TUNNEL_MU_CONTROLLER_ADDR")]
    pub controller_addr: String,

    /// PEM certificate chain path; omit together with --key to run plain HTTP
    #[arg(long, env = "AETHER_TUNNEL_MU_CERT")]
    pub cert: Option<String>,

    /// PEM private key path; omit together with --cert to run plain HTTP
    #[arg(long, env = "AETHER_TUNNEL_MU_KEY")]
    pub key: Option<String>,

    /// Run behind HTTPS with a self-signed certificate when no cert/key is given
    #[arg(long, env = "AETHER_TUNNEL_MU_FORCE_TLS")]
    pub force_tls: bool,

    /// CommonName/DNSName used when generating a self-signed certificate
    #[arg(long, env = "AETHER_TUNNEL_MU_SERVER_NAME")]
    pub server_name: Option<String>,

    /// Mux mode used when a connection's subprotocol names neither mux-on nor mux-off
    #[arg(long, env = "AETHER_TUNNEL_MU_ENABLE_MUX")]
    pub enable_mux: bool,

    /// Per-session open-stream ceiling enforced on accepted mux sessions
    #[arg(long, env = "AETHER_TUNNEL_MU_MUX_MAX_STREAM", default_value_t = 16)]
    pub mux_max_stream: usize,

    /// Idle timeout in seconds applied to both directions of every tunnel
    #[arg(long, env = "AETHER_TUNNEL_MU_TIMEOUT", default_value_t = 60)]
    pub timeout_secs: u64,

    /// Enable TCP Fast Open on the accept listener (external sockopt hook)
    #[arg(long, env = "AETHER_TUNNEL_MU_ENABLE_TFO")]
    pub enable_tfo: bool,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, short = 'v', env = "AETHER_TUNNEL_MU_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON instead of human-readable text
    #[arg(long, env = "AETHER_TUNNEL_MU_LOG_JSON")]
    pub log_json: bool,
}

impl MuServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.is_empty() {
            bail!("need router bind address");
        }
        if self.controller_addr.is_empty() {
            bail!("need control API bind address");
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

    /// Whether the router should terminate TLS at all: either a loaded
    /// cert/key pair, or `--force-tls` asking for a self-signed one.
    pub fn tls_enabled(&self) -> bool {
        self.cert.is_some() || self.force_tls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> MuServerConfig {
        MuServerConfig {
            bind_addr: "0.0.0.0:443".into(),
            controller_addr: "127.0.0.1:9000".into(),
            cert: None,
            key: None,
            force_tls: false,
            server_name: None,
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
        cfg.key = Some("key.pem".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_plain_http_defaults() {
        let cfg = base();
        assert!(cfg.validate().is_ok());
        assert!(!cfg.tls_enabled());
    }

    #[test]
    fn force_tls_enables_tls_without_cert() {
        let mut cfg = base();
        cfg.force_tls = true;
        assert!(cfg.tls_enabled());
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut cfg = base();
        cfg.timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
