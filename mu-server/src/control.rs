//! ControlAPI (spec §4.8): a JSON POST endpoint, on its own listener,
//! that mutates the shared [`PathMap`]. Grounded on `multi_user_server.go`'s
//! `MUServer.ServeHTTP`/`sendMURes`/`generateMURes`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use aether_tunnel_core::ControlApiError;

use crate::pathmap::{PathEntry, PathMap};

const MAX_CONTROL_BODY: usize = 2 * 1024 * 1024;

const OPT_ADD: i64 = 1;
const OPT_DEL: i64 = 2;
const OPT_RESET: i64 = 3;
const OPT_PING: i64 = 9;

const RES_OK: i64 = 1;
const RES_ERR: i64 = 2;

#[derive(Debug, Deserialize)]
struct MuCmd {
    #[serde(default)]
    opt: i64,
    #[serde(default, rename = "args_bunch")]
    args_bunch: Vec<PathEntry>,
}

#[derive(Debug, Serialize)]
struct MuRes {
    res: i64,
    err_string: String,
}

fn mu_res(res: i64, err_string: impl Into<String>) -> Response<Full<Bytes>> {
    let body = MuRes {
        res,
        err_string: err_string.into(),
    };
    let json = serde_json::to_vec(&body).unwrap_or_default();
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(json)))
        .expect("building a control response cannot fail")
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("building a static response cannot fail")
}

pub async fn run(bind_addr: String, path_map: Arc<PathMap>) -> Result<()> {
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding control API listener on {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, "control API listening");

    loop {
        let (tcp, peer) = listener.accept().await.context("accept on control API listener")?;
        tcp.set_nodelay(true).ok();
        let path_map = path_map.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(tcp);
            let service = hyper::service::service_fn(move |req| {
                let path_map = path_map.clone();
                async move { handle(req, peer, path_map).await }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                warn!(peer = %peer, error = %e, "control API connection ended with error");
            }
        });
    }
}

async fn handle(
    req: Request<Incoming>,
    peer: SocketAddr,
    path_map: Arc<PathMap>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::POST {
        warn!(peer = %peer, method = %req.method(), "control API request used non-POST method");
        return Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED));
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(peer = %peer, error = %e, "reading control API body failed");
            return Ok(empty_response(StatusCode::BAD_REQUEST));
        }
    };

    if body.len() >= MAX_CONTROL_BODY {
        warn!(peer = %peer, len = body.len(), "control API body exceeds 2 MiB cap");
        return Ok(empty_response(StatusCode::PAYLOAD_TOO_LARGE));
    }

    let cmd: MuCmd = match serde_json::from_slice(&body) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!(peer = %peer, error = %e, "unmarshal control API body failed");
            return Ok(empty_response(StatusCode::BAD_REQUEST));
        }
    };

    let response = match apply(cmd, &path_map) {
        Ok(()) => mu_res(RES_OK, ""),
        Err(e) => {
            warn!(peer = %peer, error = %e, "control API command rejected");
            mu_res(RES_ERR, e.to_string())
        }
    };

    Ok(response)
}

/// Applies a parsed command to `path_map`, or reports why it was rejected.
/// Kept separate from `handle` so the opcode dispatch is testable without a
/// live HTTP connection.
fn apply(cmd: MuCmd, path_map: &PathMap) -> Result<(), ControlApiError> {
    match cmd.opt {
        OPT_ADD => {
            if cmd.args_bunch.is_empty() {
                return Err(ControlApiError::EmptyArgsBunch);
            }
            path_map.add(&cmd.args_bunch);
            Ok(())
        }
        OPT_DEL => {
            if cmd.args_bunch.is_empty() {
                return Err(ControlApiError::EmptyArgsBunch);
            }
            path_map.del(&cmd.args_bunch);
            Ok(())
        }
        OPT_RESET => {
            path_map.reset();
            Ok(())
        }
        OPT_PING => Ok(()),
        other => Err(ControlApiError::UnknownOpcode(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_add_command() {
        let cmd: MuCmd = serde_json::from_str(
            r#"{"opt":1,"args_bunch":[{"path":"/a","dst":"127.0.0.1:1"}]}"#,
        )
        .unwrap();
        assert_eq!(cmd.opt, OPT_ADD);
        assert_eq!(cmd.args_bunch.len(), 1);
        assert_eq!(cmd.args_bunch[0].path, "/a");
    }

    #[test]
    fn deserializes_ping_with_no_args() {
        let cmd: MuCmd = serde_json::from_str(r#"{"opt":9}"#).unwrap();
        assert_eq!(cmd.opt, OPT_PING);
        assert!(cmd.args_bunch.is_empty());
    }

    #[test]
    fn apply_add_then_lookup_round_trips() {
        let map = PathMap::new();
        let cmd = MuCmd {
            opt: OPT_ADD,
            args_bunch: vec![PathEntry {
                path: "/u1".into(),
                dst: "10.0.0.2:443".into(),
            }],
        };
        apply(cmd, &map).unwrap();
        assert_eq!(map.get("/u1").as_deref(), Some("10.0.0.2:443"));
    }

    #[test]
    fn apply_add_with_empty_bunch_is_rejected() {
        let map = PathMap::new();
        let cmd = MuCmd {
            opt: OPT_ADD,
            args_bunch: vec![],
        };
        assert!(matches!(
            apply(cmd, &map),
            Err(ControlApiError::EmptyArgsBunch)
        ));
    }

    #[test]
    fn apply_reset_clears_prior_adds() {
        let map = PathMap::new();
        map.add(&[PathEntry {
            path: "/u1".into(),
            dst: "10.0.0.2:443".into(),
        }]);
        apply(MuCmd { opt: OPT_RESET, args_bunch: vec![] }, &map).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn apply_unknown_opcode_is_rejected() {
        let map = PathMap::new();
        let cmd = MuCmd { opt: 42, args_bunch: vec![] };
        assert!(matches!(apply(cmd, &map), Err(ControlApiError::UnknownOpcode(42))));
    }

    #[test]
    fn mu_res_serializes_expected_shape() {
        let res = MuRes {
            res: RES_OK,
            err_string: String::new(),
        };
        let json = serde_json::to_string(&res).unwrap();
        assert_eq!(json, r#"{"res":1,"err_string":""}"#);
    }
}
