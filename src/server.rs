use crate::aggregator::LatencyRequest;
use crate::dataset::Dataset;
use crate::error::TelemetryResult;
use crate::{
    COMPUTE_DURATION_HISTOGRAM, DATASET_LOAD_FAILURES_COUNTER, DATASET_RECORDS_GAUGE,
    DATASET_REGIONS_GAUGE, REGIONS_MATCHED_COUNTER, REQUESTS_COUNTER,
};
use hyper::body::{Bytes, HttpBody};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot::Sender;
use tokio::task;
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

const ALLOW_ORIGIN: &str = "access-control-allow-origin";
const ALLOW_CREDENTIALS: &str = "access-control-allow-credentials";
const ALLOW_METHODS: &str = "access-control-allow-methods";
const ALLOW_HEADERS: &str = "access-control-allow-headers";
const REQUEST_HEADERS: &str = "access-control-request-headers";

pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Export the size of the loaded table, or count the failed load.
pub fn publish_dataset_metrics(dataset: &Dataset) {
    if !dataset.is_available() {
        DATASET_LOAD_FAILURES_COUNTER.inc();
    }
    DATASET_RECORDS_GAUGE.set(dataset.record_count() as i64);
    DATASET_REGIONS_GAUGE.set(dataset.region_count() as i64);
}

/// HTTP front for the aggregator, stopped when dropped.
pub struct LatencyServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<Sender<()>>,
    server_thread: Option<JoinHandle<()>>,
}

impl LatencyServer {
    /// Bind and start serving. The dataset must already be loaded; handlers
    /// only ever see it through a shared read-only reference.
    pub fn start(
        addr: SocketAddr,
        dataset: Arc<Dataset>,
    ) -> TelemetryResult<Self> {
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let make_svc = make_service_fn(move |_conn| {
            let dataset = dataset.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let dataset = dataset.clone();
                    async move { Ok::<_, Infallible>(handle(req, dataset).await) }
                }))
            }
        });

        let server = Server::try_bind(&addr)?.serve(make_svc);
        let local_addr = server.local_addr();
        let graceful = server.with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        });
        info!("Listening on http://{}", local_addr);

        let server_thread = task::spawn(async move {
            if let Err(e) = graceful.await {
                error!("server error: {}", e);
            }
        });

        Ok(LatencyServer {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            server_thread: Some(server_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal shutdown and wait for in-flight requests to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.server_thread.take() {
            if let Err(e) = thread.await {
                warn!("server task ended abnormally: {}", e);
            }
        }
        info!("Latency server shutdown");
    }
}

impl Drop for LatencyServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            info!("Latency server shutdown");
        }
        if let Some(thread) = self.server_thread.take() {
            drop(thread);
        }
    }
}

#[derive(Serialize)]
struct ErrorDetail {
    detail: String,
}

pub async fn handle(
    req: Request<Body>,
    dataset: Arc<Dataset>,
) -> Response<Body> {
    let origin = req.headers().get(hyper::header::ORIGIN).cloned();
    let mut response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/") => latency_handler(req, &dataset).await,
        (&Method::OPTIONS, _) => preflight_handler(&req),
        (&Method::GET, "/metrics") => metrics_handler(),
        (_, "/") => empty(StatusCode::METHOD_NOT_ALLOWED),
        _ => empty(StatusCode::NOT_FOUND),
    };
    apply_cors(&mut response, origin);
    response
}

async fn latency_handler(
    req: Request<Body>,
    dataset: &Dataset,
) -> Response<Body> {
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(BodyError::TooLarge) => {
            warn!("Rejected request body larger than {} bytes", MAX_BODY_BYTES);
            REQUESTS_COUNTER.with_label_values(&["invalid"]).inc();
            return json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &ErrorDetail {
                    detail: format!("request body exceeds {} bytes", MAX_BODY_BYTES),
                },
            );
        }
        Err(BodyError::Hyper(e)) => {
            warn!("Failed reading request body: {}", e);
            REQUESTS_COUNTER.with_label_values(&["invalid"]).inc();
            return json_response(
                StatusCode::BAD_REQUEST,
                &ErrorDetail {
                    detail: e.to_string(),
                },
            );
        }
    };

    let request: LatencyRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            trace!("Rejected latency request: {}", e);
            REQUESTS_COUNTER.with_label_values(&["invalid"]).inc();
            return json_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                &ErrorDetail {
                    detail: e.to_string(),
                },
            );
        }
    };

    let start = Instant::now();
    let outcome = request.compute(dataset);
    COMPUTE_DURATION_HISTOGRAM.observe(start.elapsed().as_secs_f64());
    let label = match outcome.stats() {
        Some(stats) => {
            REGIONS_MATCHED_COUNTER.inc_by(stats.len() as u64);
            "ok"
        }
        None => "unavailable",
    };
    REQUESTS_COUNTER.with_label_values(&[label]).inc();
    json_response(StatusCode::OK, &outcome)
}

enum BodyError {
    TooLarge,
    Hyper(hyper::Error),
}

/// Collect the body, giving up as soon as it grows past [`MAX_BODY_BYTES`].
async fn read_body(req: Request<Body>) -> Result<Bytes, BodyError> {
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|len| len > MAX_BODY_BYTES) {
        return Err(BodyError::TooLarge);
    }

    let mut body = req.into_body();
    let mut buffer = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(BodyError::Hyper)?;
        if buffer.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(BodyError::TooLarge);
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buffer))
}

fn preflight_handler(req: &Request<Body>) -> Response<Body> {
    let allow_headers = req
        .headers()
        .get(REQUEST_HEADERS)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    let mut response = empty(StatusCode::OK);
    let headers = response.headers_mut();
    headers.insert(ALLOW_METHODS, HeaderValue::from_static("POST"));
    headers.insert(ALLOW_HEADERS, allow_headers);
    response
}

fn metrics_handler() -> Response<Body> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed encoding metrics: {}", e);
        return empty(StatusCode::INTERNAL_SERVER_ERROR);
    }
    trace!("Metrics request received");
    let mut response = Response::new(Body::from(buffer));
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

fn apply_cors(
    response: &mut Response<Body>,
    origin: Option<HeaderValue>,
) {
    let headers = response.headers_mut();
    headers.insert(
        ALLOW_ORIGIN,
        origin.unwrap_or_else(|| HeaderValue::from_static("*")),
    );
    headers.insert(ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
}

fn json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed serializing response: {}", e);
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TelemetryRecord;
    use serde_json::{json, Value};
    use serial_test::serial;

    fn dataset() -> Arc<Dataset> {
        Arc::new(Dataset::from_records(vec![
            TelemetryRecord {
                region: "us-east".to_string(),
                latency_ms: 100.0,
                uptime_pct: 99.9,
            },
            TelemetryRecord {
                region: "us-east".to_string(),
                latency_ms: 300.0,
                uptime_pct: 98.0,
            },
        ]))
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response<Body>) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    #[serial(metrics)]
    async fn post_returns_region_stats() {
        let response = handle(
            post(r#"{"regions": ["us-east", "eu-west"], "threshold_ms": 150}"#),
            dataset(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ALLOW_ORIGIN], "*");
        assert_eq!(
            body_json(response).await,
            json!({
                "us-east": {
                    "avg_latency": 200.0,
                    "p95_latency": 290.0,
                    "avg_uptime": 98.95,
                    "breaches": 1
                }
            })
        );
    }

    #[tokio::test]
    #[serial(metrics)]
    async fn post_against_unavailable_dataset() {
        let response = handle(
            post(r#"{"regions": ["us-east"], "threshold_ms": 150}"#),
            Arc::new(Dataset::Unavailable),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"error": "Telemetry data not available."})
        );
    }

    #[tokio::test]
    async fn malformed_body_is_unprocessable() {
        let response = handle(post(r#"{"regions": "us-east"}"#), dataset()).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(response).await["detail"].is_string());
    }

    #[tokio::test]
    async fn preflight_allows_post() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/")
            .header(hyper::header::ORIGIN, "https://dashboard.example")
            .header(REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();
        let response = handle(request, dataset()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ALLOW_ORIGIN], "https://dashboard.example");
        assert_eq!(response.headers()[ALLOW_METHODS], "POST");
        assert_eq!(response.headers()[ALLOW_HEADERS], "content-type");
        assert_eq!(response.headers()[ALLOW_CREDENTIALS], "true");
    }

    #[tokio::test]
    async fn get_root_is_not_allowed() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let response = handle(request, dataset()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    #[serial(metrics)]
    async fn post_records_query_metrics() {
        let matched = REGIONS_MATCHED_COUNTER.get();
        let samples = COMPUTE_DURATION_HISTOGRAM.get_sample_count();
        let ok = REQUESTS_COUNTER.with_label_values(&["ok"]).get();

        let response = handle(
            post(r#"{"regions": ["us-east", "us-east", "eu-west"], "threshold_ms": 150}"#),
            dataset(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(REGIONS_MATCHED_COUNTER.get(), matched + 1);
        assert_eq!(COMPUTE_DURATION_HISTOGRAM.get_sample_count(), samples + 1);
        assert_eq!(REQUESTS_COUNTER.with_label_values(&["ok"]).get(), ok + 1);
    }

    #[test]
    #[serial(metrics)]
    fn dataset_metrics_follow_load_result() {
        publish_dataset_metrics(&dataset());
        assert_eq!(DATASET_RECORDS_GAUGE.get(), 2);
        assert_eq!(DATASET_REGIONS_GAUGE.get(), 1);

        let failures = DATASET_LOAD_FAILURES_COUNTER.get();
        publish_dataset_metrics(&Dataset::Unavailable);
        assert_eq!(DATASET_LOAD_FAILURES_COUNTER.get(), failures + 1);
        assert_eq!(DATASET_RECORDS_GAUGE.get(), 0);
        assert_eq!(DATASET_REGIONS_GAUGE.get(), 0);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let regions = vec!["r".repeat(64); MAX_BODY_BYTES / 64];
        let body = json!({"regions": regions, "threshold_ms": 1}).to_string();
        assert!(body.len() > MAX_BODY_BYTES);

        let response = handle(post(&body), dataset()).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(CONTENT_LENGTH, (MAX_BODY_BYTES + 1).to_string())
            .body(Body::from(r#"{"regions": [], "threshold_ms": 1}"#))
            .unwrap();
        let response = handle(request, dataset()).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/latency")
            .body(Body::empty())
            .unwrap();
        let response = handle(request, dataset()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    #[serial(metrics)]
    async fn metrics_are_exposed() {
        let _ = handle(
            post(r#"{"regions": ["us-east"], "threshold_ms": 1}"#),
            dataset(),
        )
        .await;
        let request = Request::builder()
            .method(Method::GET)
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = handle(request, dataset()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("latency_requests_total"));
    }

    #[tokio::test]
    async fn serves_over_tcp_until_stopped() {
        let server = LatencyServer::start(([127, 0, 0, 1], 0).into(), dataset()).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        server.stop().await;
    }
}
