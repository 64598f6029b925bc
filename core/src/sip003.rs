//! SIP003 plugin-bootstrap environment parsing.
//!
//! Shadowsocks-style plugins are launched with their configuration in
//! environment variables rather than argv; this module resolves that
//! environment into addresses and reformats `SS_PLUGIN_OPTIONS` into argv
//! tokens a `clap::Parser` can consume, exactly matching
//! `FormatSSPluginOptions`/`GetSIP003Args` in the original's `sip003.go`.

use std::env;

use crate::error::Sip003Error;

/// The SIP003 environment, present only when a Shadowsocks-compatible
/// manager launched this process as a plugin.
#[derive(Debug, Clone)]
pub struct Sip003Args {
    pub remote_host: String,
    pub remote_port: String,
    pub local_host: String,
    pub local_port: String,
    pub plugin_options: String,
    pub fast_open: bool,
    pub vpn: bool,
}

impl Sip003Args {
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// Reads the SIP003 environment. Returns `Ok(None)` when none of the
/// relevant variables are set (normal standalone invocation). Returns
/// `Err` when some but not all of the four address variables are present.
pub fn from_env() -> Result<Option<Sip003Args>, Sip003Error> {
    let remote_host = env::var("SS_REMOTE_HOST").ok();
    let remote_port = env::var("SS_REMOTE_PORT").ok();
    let local_host = env::var("SS_LOCAL_HOST").ok();
    let local_port = env::var("SS_LOCAL_PORT").ok();
    let plugin_options = env::var("SS_PLUGIN_OPTIONS").ok();

    let any_set = remote_host.is_some()
        || remote_port.is_some()
        || local_host.is_some()
        || local_port.is_some()
        || plugin_options.is_some();

    if !any_set {
        return Ok(None);
    }

    let (Some(remote_host), Some(remote_port), Some(local_host), Some(local_port)) =
        (remote_host, remote_port, local_host, local_port)
    else {
        return Err(Sip003Error::PartialAddressSet);
    };

    let (fast_open, vpn) = fast_open_and_vpn_from_argv();

    Ok(Some(Sip003Args {
        remote_host,
        remote_port,
        local_host,
        local_port,
        plugin_options: plugin_options.unwrap_or_default(),
        fast_open,
        vpn,
    }))
}

/// A light pre-pass over the real argv for `-fast-open` and `-V`, since the
/// merged SIP003 argv and the real argv are parsed in separate passes (the
/// original reads these directly off `os.Args`, independent of
/// `SS_PLUGIN_OPTIONS`). Public so binaries can apply the same pre-pass
/// outside the SIP003 bootstrap path too.
pub fn fast_open_and_vpn_from_argv() -> (bool, bool) {
    let args: Vec<String> = env::args().collect();
    let fast_open = args.iter().any(|a| a == "-fast-open" || a == "--fast-open");
    let vpn = args.iter().any(|a| a == "-V");
    (fast_open, vpn)
}

/// Reformats a `;`-delimited `key[=value]` option string into `-key
/// [value]` argv tokens, e.g. `"obfs=http;fast-open"` becomes
/// `["-obfs", "http", "-fast-open"]`.
pub fn format_plugin_options(spo: &str) -> Result<Vec<String>, Sip003Error> {
    let mut tokens = Vec::new();
    for entry in spo.split(';') {
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        match parts.next() {
            None => tokens.push(format!("-{key}")),
            Some(value) => {
                tokens.push(format!("-{key}"));
                tokens.push(value.to_string());
            }
        }
        if entry.matches('=').count() > 1 {
            return Err(Sip003Error::MalformedOption(entry.to_string()));
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_flag_only_option() {
        assert_eq!(format_plugin_options("fast-open").unwrap(), vec!["-fast-open"]);
    }

    #[test]
    fn formats_key_value_option() {
        assert_eq!(
            format_plugin_options("obfs=http").unwrap(),
            vec!["-obfs", "http"]
        );
    }

    #[test]
    fn formats_multiple_options() {
        assert_eq!(
            format_plugin_options("obfs=http;fast-open").unwrap(),
            vec!["-obfs", "http", "-fast-open"]
        );
    }

    #[test]
    fn rejects_malformed_option() {
        assert!(format_plugin_options("a=b=c").is_err());
    }
}
