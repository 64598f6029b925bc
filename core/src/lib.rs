//! Shared carrier-negotiation, mux-pooling and byte-shuttle primitives used
//! by every `aether-tunnel-*` binary.
//!
//! The stack composes by wrapping: a raw TCP connection can be wrapped in
//! [`tls_carrier`], which can be wrapped in [`ws_adapter`], which can carry a
//! [`mux`] session. Every layer implements [`carrier::Carrier`], so upper
//! layers never need to know which combination is underneath.

pub mod carrier;
pub mod error;
pub mod mux;
pub mod resolver;
pub mod shuttle;
pub mod sip003;
pub mod tcp_opts;
pub mod tls_carrier;
pub mod ws_adapter;
pub mod ws_carrier;

pub use carrier::Carrier;
pub use error::{ControlApiError, MuxPoolError, Sip003Error};
pub use shuttle::shuttle;
