//! Readiness HTTP server (§6): plain `GET /readyz` on `0.0.0.0:8080`, 200
//! once the resource store has completed its initial cache sync, 500
//! otherwise. Also serves `/metrics` when the `metrics` feature is enabled.

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::store::ResourceStore;

#[cfg(feature = "metrics")]
use crate::metrics::ControllerMetrics;
#[cfg(feature = "metrics")]
use std::sync::Arc;

async fn handle(
    req: Request<hyper::body::Incoming>,
    store: ResourceStore,
    #[cfg(feature = "metrics")] metrics: Arc<ControllerMetrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match req.uri().path() {
        "/readyz" => {
            if store.synced() {
                Ok(Response::new(Full::new(Bytes::from_static(b"ok"))))
            } else {
                Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from_static(b"not ready")))
                    .unwrap())
            }
        }
        #[cfg(feature = "metrics")]
        "/metrics" => Ok(Response::new(Full::new(Bytes::from(metrics.render())))),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap()),
    }
}

/// Serves readiness (and, with the `metrics` feature, Prometheus scraping)
/// until `cancel` fires.
pub async fn serve(
    store: ResourceStore,
    #[cfg(feature = "metrics")] metrics: Arc<ControllerMetrics>,
    cancel: CancellationToken,
) {
    let addr: SocketAddr = ([0, 0, 0, 0], 8080).into();
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, "failed to bind readiness server");
            return;
        }
    };
    tracing::info!(%addr, "readiness server listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let io = TokioIo::new(stream);
                let store = store.clone();
                #[cfg(feature = "metrics")]
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let store = store.clone();
                        #[cfg(feature = "metrics")]
                        let metrics = metrics.clone();
                        #[cfg(feature = "metrics")]
                        { handle(req, store, metrics) }
                        #[cfg(not(feature = "metrics"))]
                        { handle(req, store) }
                    });
                    if let Err(error) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!(%error, "readiness connection error");
                    }
                });
            }
        }
    }
}
