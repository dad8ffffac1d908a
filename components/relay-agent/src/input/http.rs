// Local crates
use crate::buffer::buffer::EventBuffer;
use crate::helpers::health::Health;
use crate::helpers::log_processing::EventProcessor;
use crate::input::Input;
use crate::input::ratelimit::RateLimiter;
use crate::model::event::{FieldValue, LogEvent, normalize_level};

// External crates
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::http::{Method, Request, Response, StatusCode};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperServerBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn default_rate_limit() -> f64 {
    1000.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpInputConfig {
    /// Listen address, e.g. `0.0.0.0:8088`.
    pub addr: String,
    /// Accepted API keys. Empty disables authentication.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Sustained requests per second allowed per remote address.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: f64,
}

/// Counters surfaced on the input's own `/metrics` endpoint.
#[derive(Debug, Default)]
pub struct HttpCounters {
    pub requests_total: AtomicU64,
    pub events_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub auth_failures: AtomicU64,
    pub rate_limit_hits: AtomicU64,
}

impl HttpCounters {
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests_total": self.requests_total.load(Ordering::Relaxed),
            "events_total": self.events_total.load(Ordering::Relaxed),
            "errors_total": self.errors_total.load(Ordering::Relaxed),
            "auth_failures": self.auth_failures.load(Ordering::Relaxed),
            "rate_limit_hits": self.rate_limit_hits.load(Ordering::Relaxed),
        })
    }
}

/// Shared state each connection handler clones into itself.
struct HttpState {
    buffer: Arc<EventBuffer>,
    processor: Arc<EventProcessor>,
    limiter: RateLimiter,
    api_keys: Vec<String>,
    counters: HttpCounters,
    health: Arc<Health>,
}

/// HTTP ingestion API: `POST /log`, `POST /logs`, `GET /health`,
/// `GET /metrics`, keyed auth, per-address rate limiting.
pub struct HttpInput {
    config: HttpInputConfig,
    state: Arc<HttpState>,
    cancel: CancellationToken,
    healthy: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for HttpInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpInput")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpInput {
    pub fn new(
        config: HttpInputConfig,
        buffer: Arc<EventBuffer>,
        processor: Arc<EventProcessor>,
        health: Arc<Health>,
        cancel: CancellationToken,
    ) -> Self {
        let state = Arc::new(HttpState {
            buffer,
            processor,
            limiter: RateLimiter::new(config.rate_limit, None),
            api_keys: config.api_keys.clone(),
            counters: HttpCounters::default(),
            health,
        });
        Self {
            config,
            state,
            cancel,
            healthy: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn counters(&self) -> &HttpCounters {
        &self.state.counters
    }
}

#[async_trait::async_trait]
impl Input for HttpInput {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn start(&self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .addr
            .parse()
            .with_context(|| format!("invalid http input address {:?}", self.config.addr))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding http input listener on {addr}"))?;
        tracing::info!(%addr, "HTTP ingestion listener bound");

        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let accept_loop = tokio::spawn(async move {
            loop {
                let (stream, remote) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::error!(error = %e, "HTTP input accept failed");
                            continue;
                        }
                    },
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);
                let service = service_fn(move |req: Request<Incoming>| {
                    let state = Arc::clone(&state);
                    async move { handle_request(&state, remote, req).await }
                });
                tokio::spawn(async move {
                    if let Err(e) = HyperServerBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        tracing::debug!(error = %e, "HTTP input connection error");
                    }
                });
            }
        });

        self.tasks.lock().await.push(accept_loop);
        self.healthy.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        self.healthy.store(false, Ordering::Release);
        tracing::info!("HTTP input stopped");
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

/// Key comparison that does not leak match position through timing. Length
/// is checked against every configured key either way.
fn key_matches(keys: &[String], candidate: &str) -> bool {
    let mut matched = false;
    for key in keys {
        matched |= constant_time_eq(key.as_bytes(), candidate.as_bytes());
    }
    matched
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn presented_key<B>(req: &Request<B>) -> Option<&str> {
    if let Some(key) = req.headers().get("x-api-key") {
        return key.to_str().ok();
    }
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let bytes = Bytes::from(body.to_string());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(bytes.clone()))
        .unwrap_or_else(|_| Response::new(Full::new(bytes)))
}

/// Build an event from one ingested JSON object. Well-known keys populate
/// the envelope; everything else lands in `fields`.
fn event_from_json(source: &str, raw: &str, object: serde_json::Map<String, serde_json::Value>) -> LogEvent {
    let mut event = LogEvent::from_line(source, raw);
    event.message = String::new();
    for (key, value) in object {
        match key.as_str() {
            "message" | "msg" => {
                event.message = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
            }
            "level" | "severity" => {
                if let serde_json::Value::String(s) = &value {
                    event.level = Some(normalize_level(s));
                }
            }
            "timestamp" | "time" | "ts" => {
                if let serde_json::Value::String(s) = &value {
                    if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(s) {
                        event.timestamp = ts.with_timezone(&chrono::Utc);
                        continue;
                    }
                }
                event.fields.insert(key, FieldValue::from_json(value));
            }
            _ => {
                event.fields.insert(key, FieldValue::from_json(value));
            }
        }
    }
    event
}

async fn ingest_one(state: &HttpState, source: &str, value: serde_json::Value, raw: &str) -> bool {
    let event = match value {
        serde_json::Value::Object(object) => event_from_json(source, raw, object),
        serde_json::Value::String(text) => LogEvent::from_line(source, &text),
        other => LogEvent::from_line(source, &other.to_string()),
    };
    let event = state.processor.process_event(event);
    state.buffer.send(event).await.is_ok()
}

/// Route one request. Generic over the body so tests can drive it with
/// pre-baked payloads.
async fn handle_request<B>(
    state: &HttpState,
    remote: SocketAddr,
    req: Request<B>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    state.counters.requests_total.fetch_add(1, Ordering::Relaxed);

    if !state.limiter.allow(remote.ip()) {
        state.counters.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        return Ok(json_response(
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({"error": "rate limit exceeded"}),
        ));
    }

    if !state.api_keys.is_empty() {
        let authorized = presented_key(&req).is_some_and(|key| key_matches(&state.api_keys, key));
        if !authorized {
            state.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
            return Ok(json_response(
                StatusCode::UNAUTHORIZED,
                serde_json::json!({"error": "invalid or missing api key"}),
            ));
        }
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (method, path.as_str()) {
        (Method::POST, "/log") => {
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    state.counters.errors_total.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(error = %e, "Failed to read /log body");
                    return Ok(json_response(
                        StatusCode::BAD_REQUEST,
                        serde_json::json!({"error": "unreadable body"}),
                    ));
                }
            };
            let text = String::from_utf8_lossy(&body);
            let source = remote.to_string();
            let accepted = match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(value) => ingest_one(state, &source, value, &text).await,
                // Not JSON: ingest the body as one plain-text event.
                Err(_) => {
                    let event = state
                        .processor
                        .process_event(LogEvent::from_line(&source, text.trim_end()));
                    state.buffer.send(event).await.is_ok()
                }
            };
            if accepted {
                state.counters.events_total.fetch_add(1, Ordering::Relaxed);
                Ok(json_response(
                    StatusCode::ACCEPTED,
                    serde_json::json!({"status": "accepted"}),
                ))
            } else {
                state.counters.errors_total.fetch_add(1, Ordering::Relaxed);
                Ok(json_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    serde_json::json!({"error": "pipeline unavailable"}),
                ))
            }
        }
        (Method::POST, "/logs") => {
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    state.counters.errors_total.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(error = %e, "Failed to read /logs body");
                    return Ok(json_response(
                        StatusCode::BAD_REQUEST,
                        serde_json::json!({"error": "unreadable body"}),
                    ));
                }
            };
            let values: Vec<serde_json::Value> = match serde_json::from_slice(&body) {
                Ok(values) => values,
                Err(_) => {
                    state.counters.errors_total.fetch_add(1, Ordering::Relaxed);
                    return Ok(json_response(
                        StatusCode::BAD_REQUEST,
                        serde_json::json!({"error": "body must be a json array"}),
                    ));
                }
            };
            let source = remote.to_string();
            let total = values.len();
            let mut accepted = 0u64;
            for value in values {
                let raw = value.to_string();
                if ingest_one(state, &source, value, &raw).await {
                    accepted += 1;
                }
            }
            state.counters.events_total.fetch_add(accepted, Ordering::Relaxed);
            Ok(json_response(
                StatusCode::ACCEPTED,
                serde_json::json!({"status": "accepted", "accepted": accepted, "total": total}),
            ))
        }
        (Method::GET, "/health") => {
            let (healthy, snapshot) = state.health.snapshot();
            let status = if healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            Ok(json_response(status, snapshot))
        }
        (Method::GET, "/metrics") => Ok(json_response(StatusCode::OK, state.counters.to_json())),
        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({"error": "not found"}),
        )),
    }
}
