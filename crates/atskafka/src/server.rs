// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP endpoint exposing pipeline metrics and the latest producer statistics.
//!
//! - `GET /metrics`: Prometheus text format
//! - `GET /stats`: last librdkafka statistics snapshot, verbatim
//! - `GET /health`: always `ok` while the process runs

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::delivery::LatestStats;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
const JSON_CONTENT_TYPE: &str = "application/json";
const TEXT_CONTENT_TYPE: &str = "text/plain";

struct ServerState {
    metrics: PrometheusHandle,
    stats: LatestStats,
}

pub struct MetricsServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    cancel_token: CancellationToken,
}

impl MetricsServer {
    pub async fn bind(
        addr: SocketAddr,
        metrics: PrometheusHandle,
        stats: LatestStats,
        cancel_token: CancellationToken,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(ServerState { metrics, stats }),
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until the cancellation token fires.
    pub async fn run(self) -> io::Result<()> {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = JoinSet::new();

        if let Ok(addr) = self.listener.local_addr() {
            info!("Serving metrics on http://{}", addr);
        }

        loop {
            let conn = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Metrics server shutting down");
                    joinset.abort_all();
                    return Ok(());
                }
                con_res = self.listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Metrics server error: {e}");
                        return Err(e);
                    }
                    Ok((conn, _)) => conn,
                },
                Some(finished) = joinset.join_next() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Connection handler panicked: {:?}", e);
                        }
                    }
                    continue;
                }
            };

            let conn = TokioIo::new(conn);
            let server = server.clone();
            let state = Arc::clone(&self.state);
            joinset.spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let state = Arc::clone(&state);
                    let method = req.method().clone();
                    let path = req.uri().path().to_string();
                    async move { Ok::<_, Infallible>(route(&state, &method, &path).await) }
                });
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Connection error: {e}");
                }
            });
        }
    }
}

async fn route(state: &ServerState, method: &Method, path: &str) -> Response<Full<Bytes>> {
    if method != Method::GET {
        return response(
            StatusCode::METHOD_NOT_ALLOWED,
            TEXT_CONTENT_TYPE,
            "method not allowed\n",
        );
    }

    match path {
        "/metrics" => response(
            StatusCode::OK,
            PROMETHEUS_CONTENT_TYPE,
            state.metrics.render(),
        ),
        "/stats" => match state.stats.get().await {
            Some(snapshot) => response(StatusCode::OK, JSON_CONTENT_TYPE, snapshot),
            None => response(
                StatusCode::NOT_FOUND,
                TEXT_CONTENT_TYPE,
                "no statistics received yet\n",
            ),
        },
        "/health" => response(StatusCode::OK, TEXT_CONTENT_TYPE, "ok\n"),
        _ => response(StatusCode::NOT_FOUND, TEXT_CONTENT_TYPE, "not found\n"),
    }
}

fn response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
