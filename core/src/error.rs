//! Library-internal error types. Binary-boundary and construction-time
//! failures use `anyhow` instead; these are for errors callers match on.

use thiserror::Error;

/// Failures opening a logical stream through a [`crate::mux::MuxPool`].
#[derive(Debug, Error)]
pub enum MuxPoolError {
    #[error("failed to dial outbound carrier for new mux session: {0}")]
    DialFailed(#[source] std::io::Error),

    #[error("mux session handshake failed: {0}")]
    SessionHandshakeFailed(#[source] std::io::Error),

    #[error("all eligible sessions rejected the stream")]
    NoEligibleSession,
}

/// Failures parsing the SIP003 plugin bootstrap environment.
#[derive(Debug, Error)]
pub enum Sip003Error {
    #[error("partial SIP003 environment: some of SS_REMOTE_HOST/SS_REMOTE_PORT/SS_LOCAL_HOST/SS_LOCAL_PORT are set but not all four")]
    PartialAddressSet,

    #[error("malformed SS_PLUGIN_OPTIONS entry: {0}")]
    MalformedOption(String),

    #[error("invalid port in SIP003 environment: {0}")]
    InvalidPort(String),
}

/// Failures handled by the control API; surfaced to the HTTP response as
/// `res = 2` with this message in `err_string`, never propagated further.
#[derive(Debug, Error)]
pub enum ControlApiError {
    #[error("request body exceeds the 2 MiB cap")]
    BodyTooLarge,

    #[error("request body could not be read")]
    BodyUnreadable,

    #[error("unknown opcode: {0}")]
    UnknownOpcode(i64),

    #[error("args_bunch must be non-empty for this opcode")]
    EmptyArgsBunch,
}
