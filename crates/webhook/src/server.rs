//! HTTP surface: `/validate`, `/health`, `/ready`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use metrics::counter;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use vigil_api::{AdmissionPipeline, TransportError};

pub fn router(pipeline: Arc<AdmissionPipeline>) -> Router {
    Router::new()
        .route("/validate", post(validate).fallback(method_not_allowed))
        .route("/health", get(ok))
        .route("/ready", get(ok))
        .with_state(pipeline)
}

async fn ok() -> &'static str { "OK" }

async fn method_not_allowed() -> (StatusCode, &'static str) {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

async fn validate(State(pipeline): State<Arc<AdmissionPipeline>>, headers: HeaderMap, body: Bytes) -> Response {
    if !is_json(&headers) {
        counter!("webhook_bad_requests_total", 1u64, "reason" => "content_type");
        return (StatusCode::BAD_REQUEST, TransportError::ContentType.to_string()).into_response();
    }
    let t0 = Instant::now();
    // Detached so a client hang-up does not abandon a half-recorded decision.
    let task = tokio::spawn(async move { pipeline.handle(&body).await });
    match task.await {
        Ok(Ok(review)) => {
            debug!(took_ms = %t0.elapsed().as_millis(), "validate: answered");
            Json(review).into_response()
        }
        Ok(Err(e)) => {
            counter!("webhook_bad_requests_total", 1u64, "reason" => "decode");
            warn!(error = %e, "validate: rejected body");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e) => {
            error!(error = %e, "validate: admission task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "admission task failed").into_response()
        }
    }
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Serve `app` on `addr` until `shutdown` flips to true. TLS when an
/// acceptor is given, plain HTTP otherwise.
pub async fn serve(app: Router, addr: SocketAddr, tls: Option<TlsAcceptor>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
    match tls {
        None => {
            info!(%addr, "server: listening (plain HTTP)");
            axum::serve(listener, app).with_graceful_shutdown(wait_for(shutdown)).await.context("serve")?;
        }
        Some(acceptor) => {
            info!(%addr, "server: listening (TLS)");
            serve_tls(listener, app, acceptor, shutdown).await;
        }
    }
    info!("server: stopped accepting");
    Ok(())
}

async fn serve_tls(listener: TcpListener, app: Router, acceptor: TlsAcceptor, shutdown: watch::Receiver<bool>) {
    let stop = wait_for(shutdown);
    tokio::pin!(stop);
    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "server: accept failed");
                    continue;
                }
            },
            _ = &mut stop => break,
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(%peer, error = %e, "server: tls handshake failed");
                    return;
                }
            };
            let service = TowerToHyperService::new(app);
            if let Err(e) = auto::Builder::new(TokioExecutor::new()).serve_connection(TokioIo::new(stream), service).await {
                debug!(%peer, error = %e, "server: connection closed with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use vigil_api::{MockBackend, MockEvaluator, PipelineConfig, RecordingReporter};
    use vigil_kubehub::{ClusterFactsProvider, LeaderState};
    use vigil_telemetry::{AggregatorConfig, NullSink, TelemetryAggregator};

    fn app() -> Router {
        let pipeline = AdmissionPipeline::new(
            PipelineConfig { enforce: true, ..Default::default() },
            Arc::new(MockBackend::with_default_policy("Starter")),
            Arc::new(MockEvaluator::failing("replicas below minimum")),
            Arc::new(ClusterFactsProvider::new(None, LeaderState::new(true))),
            Arc::new(TelemetryAggregator::new(Arc::new(NullSink), AggregatorConfig::default())),
            Arc::new(RecordingReporter::default()),
        );
        router(Arc::new(pipeline))
    }

    fn review() -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "u-1",
                "kind": { "group": "apps", "version": "v1", "kind": "Deployment" },
                "resource": { "group": "apps", "version": "v1", "resource": "deployments" },
                "name": "web",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": { "username": "alice" },
                "object": {
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": {
                        "name": "web",
                        "namespace": "default",
                        "managedFields": [{ "manager": "kubectl-client-side-apply" }]
                    }
                }
            }
        })
    }

    async fn send(req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let res = app().oneshot(req).await.unwrap();
        let status = res.status();
        (status, to_bytes(res.into_body(), usize::MAX).await.unwrap().to_vec())
    }

    #[tokio::test]
    async fn health_endpoints_answer_ok() {
        for path in ["/health", "/ready"] {
            let (status, body) = send(Request::get(path).body(Body::empty()).unwrap()).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, b"OK");
        }
    }

    #[tokio::test]
    async fn validate_rejects_other_methods() {
        let (status, body) = send(Request::builder().method(Method::GET).uri("/validate").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, b"Method not allowed");
    }

    #[tokio::test]
    async fn validate_requires_json_content_type() {
        let req = Request::post("/validate").header("content-type", "text/plain").body(Body::from(review().to_string())).unwrap();
        let (status, body) = send(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(String::from_utf8(body).unwrap(), "Content-Type header is not application/json");
    }

    #[tokio::test]
    async fn undecodable_body_is_bad_request() {
        let req = Request::post("/validate").header("content-type", "application/json").body(Body::empty()).unwrap();
        let (status, _) = send(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failing_policy_is_denied_in_review() {
        let req = Request::post("/validate")
            .header("content-type", "application/json; charset=utf-8")
            .body(Body::from(review().to_string()))
            .unwrap();
        let (status, body) = send(req).await;
        assert_eq!(status, StatusCode::OK);
        let review: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(review["response"]["uid"], "u-1");
        assert_eq!(review["response"]["allowed"], false);
        assert!(review["response"]["status"]["message"].as_str().unwrap().contains("replicas below minimum"));
    }
}
