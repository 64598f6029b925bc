//! Client configuration: CLI flags (spec §6) plus the construction-time
//! validation from spec §4.6/§8.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

/// Aether tunnel client: accepts local TCP and shuttles it through a
/// TLS/WSS/mux-wrapped carrier to an `aether-tunnel-server`.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct ClientConfig {
    /// Local address to accept plaintext TCP on, e.g. 127.0.0.1:1080
    #[arg(long, env = "AETHER_TUNNEL_CLIENT_BIND_ADDR")]
    pub bind_addr: String,

    /// Remote server address to dial, e.g. example.com:443
    #[arg(long, env = "AETHER_TUNNEL_CLIENT_REMOTE_ADDR")]
    pub remote_addr: String,

    /// Carry the tunnel as WebSocket Secure traffic instead of raw TLS
    #[arg(long, env = "AETHER_TUNNEL_CLIENT_ENABLE_WSS")]
    pub enable_wss: bool,

    /// HTTP path used for the WSS upgrade request
    #[arg(long, env = "AETHER_TUNNEL_CLIENT_WSS_PATH", default_value = "/")]
    pub wss_path: String,

    /// TLS/WSS server name; defaults to the host portion of remote-addr
    #[arg(long, env = "AETHER_TUNNEL_CLIENT_SERVER_NAME")]
    pub server_name: Option<String>,

    /// Skip verification of the server's TLS certificate
    #[arg(long, env = "AETHER_TUNNEL_CLIENT_INSECURE_SKIP_VERIFY")]
    pub insecure_skip_verify: bool,

    /// Pack local connections as logical streams over a pooled mux session
    #[arg(long, env = "AETHER_TUNNEL_CLIENT_ENABLE_MUX")]
    pub enable_mux: bool,

    /// Maximum open streams per mux session before a new one is opened (1-16)
    #[arg(long, env = "AETHER_TUNNEL_CLIENT_MUX_MAX_STREAM", default_value_t = 4)]
    pub mux_max_stream: usize,

    /// Idle timeout in seconds applied to both directions of every tunnel
    #[arg(long, env = "AETHER_TUNNEL_CLIENT_TIMEOUT", default_value_t = 60)]
    pub timeout_secs: u64,

    /// Enable TCP Fast Open on the outbound dial (external sockopt hook)
    #[arg(long, env = "AETHER_TUNNEL_CLIENT_ENABLE_TFO")]
    pub enable_tfo: bool,

    /// Running inside an Android VPN service (external fd-protect hook).
    /// Not a normal flag: set from the SIP003 `-V` argv pre-pass (see
    /// `aether_tunnel_core::sip003`), never parsed by clap directly.
    #[arg(skip)]
    pub vpn_mode: bool,

    /// IP of a DNS server to resolve remote-addr against, bypassing the
    /// system resolver
    #[arg(long, env = "AETHER_TUNNEL_CLIENT_FALLBACK_DNS")]
    pub fallback_dns: Option<IpAddr>,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, short = 'v', env = "AETHER_TUNNEL_CLIENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON instead of human-readable text
    #[arg(long, env = "AETHER_TUNNEL_CLIENT_LOG_JSON")]
    pub log_json: bool,
}

impl ClientConfig {
    /// Spec §4.6 construction-time validation: bind/remote non-empty, timeout
    /// >= 1s, mux-max-stream in [1, 16]; fills in `server_name` from
    /// `remote_addr`'s host portion when unset.
    pub fn validate(&mut self) -> Result<()> {
        if self.bind_addr.is_empty() {
            bail!("need bind address");
        }
        if self.remote_addr.is_empty() {
            bail!("need remote server address");
        }
        if self.timeout_secs < 1 {
            bail!("timeout value must be at least 1 sec");
        }
        if self.mux_max_stream < 1 || self.mux_max_stream > 16 {
            bail!("mux max stream should be between 1 and 16");
        }
        if self.server_name.is_none() {
            let (host, _) = self
                .remote_addr
                .rsplit_once(':')
                .context("cannot get the host address from the remote server address")?;
            self.server_name = Some(host.trim_start_matches('[').trim_end_matches(']').to_string());
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().expect("validate() sets server_name")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ClientConfig {
        ClientConfig {
            bind_addr: "127.0.0.1:1080".into(),
            remote_addr: "example.com:443".into(),
            enable_wss: false,
            wss_path: "/".into(),
            server_name: None,
            insecure_skip_verify: false,
            enable_mux: false,
            mux_max_stream: 4,
            timeout_secs: 60,
            enable_tfo: false,
            vpn_mode: false,
            fallback_dns: None,
            log_level: "info".into(),
            log_json: false,
        }
    }

    #[test]
    fn fills_in_server_name_from_remote_addr() {
        let mut cfg = base();
        cfg.validate().unwrap();
        assert_eq!(cfg.server_name(), "example.com");
    }

    #[test]
    fn rejects_empty_bind_addr() {
        let mut cfg = base();
        cfg.bind_addr = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut cfg = base();
        cfg.timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_mux_max_stream_out_of_range() {
        let mut cfg = base();
        cfg.mux_max_stream = 0;
        assert!(cfg.validate().is_err());
        cfg.mux_max_stream = 17;
        assert!(cfg.validate().is_err());
    }
}
