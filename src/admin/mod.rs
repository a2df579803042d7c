//! Minimal admin HTTP listener: `/health` and `/metrics` only. The
//! teacher's admin surface also serves `/domains` and `/routes`, which
//! have no counterpart here — those routing/cluster concepts don't exist
//! in this crate (spec.md Non-goals exclude an external admin surface
//! beyond health/metrics).
//!
//! Grounded on the teacher's `server::run_admin_server` / `server::admin`:
//! a bare hyper/hyper-util connection loop with no TLS, no auth, bound to
//! a loopback address by default.

use crate::telemetry::Telemetry;
use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

fn handle(req: Request<Incoming>, telemetry: Telemetry) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/metrics" => {
            let body = telemetry.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}

/// Serve `/health` and `/metrics` on `listen` until the process exits.
pub async fn run(listen: &str, telemetry: Telemetry) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("admin: listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let telemetry = telemetry.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                let telemetry = telemetry.clone();
                async move { handle(req, telemetry) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("admin: connection error, error={}", e);
                }
            }
        });
    }
}
