//! Tunnel agent: outbound duplex connection from the NAT'd machine to the relay.
//!
//! Maintains a persistent WebSocket to the relay with fixed-delay reconnect and
//! a heartbeat, and answers proxied `request` envelopes by calling the local
//! application over HTTP. Every reconnect is a full restart: heartbeat and
//! in-flight request tasks are aborted and the cookie jar is cleared.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use futures_util::{Sink, SinkExt, StreamExt};
use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, HOST, SET_COOKIE};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::codec::{encode_response_body, method_allows_body, Body};
use super::envelope::{Envelope, EnvelopeKind};
use crate::config::AgentConfig;
use crate::cookies::CookieJar;
use crate::state::{AgentStats, SessionEventType, SessionState};

/// Type alias for the WS sink to reduce verbosity.
type WsSink = Arc<
    Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            Message,
        >,
    >,
>;

type SessionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Request headers never passed on to the local application.
const SKIPPED_LOCAL_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "accept-encoding",
    "connection",
    "cookie",
];

/// Failure of a local call. Always converted into a `502` response envelope.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid method {0:?}")]
    InvalidMethod(String),

    #[error("local request failed: {0}")]
    Local(#[from] reqwest::Error),
}

impl AgentError {
    /// Synthetic bad-gateway response carrying a diagnostic text body.
    pub fn into_envelope(self, correlation_id: &str) -> Envelope {
        let mut envelope = Envelope::response(correlation_id, 502);
        envelope.set_header("content-type", "text/plain; charset=utf-8");
        envelope.set_body(Body::Text(format!("Tunnel error: {self}")));
        envelope
    }
}

/// Issues HTTP calls against the local application.
pub struct LocalExecutor {
    client: reqwest::Client,
    base_url: String,
    preserve_host: bool,
}

impl LocalExecutor {
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.local_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.local_url.trim_end_matches('/').to_string(),
            preserve_host: config.preserve_host,
        })
    }

    /// `{base}{path}?{query}`; the query is re-encoded from the envelope map.
    fn url_for(&self, path: &str, query: &IndexMap<String, String>) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        match serde_urlencoded::to_string(query) {
            Ok(q) if !q.is_empty() => format!("{}{path}?{q}", self.base_url),
            _ => format!("{}{path}", self.base_url),
        }
    }

    fn local_headers(&self, request: &Envelope, cookie: Option<String>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            if SKIPPED_LOCAL_HEADERS.contains(&name.as_str()) || name.starts_with("sec-fetch-") {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!(header = %name, "Skipping invalid request header"),
            }
        }
        if self.preserve_host {
            if let Some(host) = request
                .header("x-forwarded-host")
                .and_then(|h| HeaderValue::from_str(h).ok())
            {
                headers.insert(HOST, host);
            }
        }
        if let Some(cookie) = cookie.and_then(|c| HeaderValue::from_str(&c).ok()) {
            headers.insert(COOKIE, cookie);
        }
        headers
    }

    /// Perform the call described by a `request` envelope and build the
    /// matching `response` envelope. Cookies set by the local app go into `jar`.
    pub async fn execute(
        &self,
        request: &Envelope,
        jar: &Mutex<CookieJar>,
    ) -> Result<Envelope, AgentError> {
        let correlation_id = request.correlation_id.as_deref().unwrap_or_default();
        let method_name = request.method.as_deref().unwrap_or("GET");
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| AgentError::InvalidMethod(method_name.to_string()))?;
        let url = self.url_for(request.path.as_deref().unwrap_or("/"), &request.query);

        let cookie = jar.lock().await.cookie_header(request.header("cookie"));
        let mut builder = self
            .client
            .request(method, &url)
            .headers(self.local_headers(request, cookie));
        if method_allows_body(method_name) {
            let body = request.body();
            if !body.is_empty() {
                builder = builder.body(body.to_bytes());
            }
        }

        debug!(correlation_id, method = method_name, url = %url, "Calling local app");
        let response = builder.send().await?;
        let mut envelope = Envelope::response(correlation_id, response.status().as_u16());

        for name in response.headers().keys() {
            let joined = response
                .headers()
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(", ");
            envelope.set_header(name.as_str(), joined);
        }
        {
            let mut jar = jar.lock().await;
            for value in response.headers().get_all(SET_COOKIE) {
                if let Ok(value) = value.to_str() {
                    envelope.cookies.extend(jar.absorb(value));
                }
            }
        }

        let content_type = envelope.header("content-type").map(ToString::to_string);
        let bytes = response.bytes().await?;
        envelope.set_body(encode_response_body(content_type.as_deref(), &bytes));
        Ok(envelope)
    }
}

/// Spawn the agent session task. Returns a `JoinHandle` that runs until aborted.
pub fn spawn(config: AgentConfig, stats: Arc<AgentStats>) -> JoinHandle<()> {
    tokio::spawn(session_loop(config, stats))
}

/// Main loop: connect, serve requests, wait a fixed delay, start over.
async fn session_loop(config: AgentConfig, stats: Arc<AgentStats>) {
    let executor = match LocalExecutor::new(&config) {
        Ok(executor) => Arc::new(executor),
        Err(e) => {
            error!(error = %e, "Failed to build local HTTP client");
            return;
        }
    };
    let jar = Arc::new(Mutex::new(CookieJar::new()));
    let delay = Duration::from_secs(config.reconnect_delay_secs);

    loop {
        stats.set_state(SessionState::Connecting);
        info!(relay = %config.relay_url, "Connecting to relay");
        match connect_and_run(&config, &executor, &jar, &stats).await {
            Ok(()) => info!("Relay closed the connection"),
            Err(e) => warn!(error = %e, "Tunnel connection error"),
        }

        // A fresh connection starts an unauthenticated session.
        jar.lock().await.clear();
        stats.jar_size.store(0, Ordering::Relaxed);
        *stats.registered_id.lock().await = None;
        stats
            .push_event(SessionEventType::Disconnected, config.relay_url.clone())
            .await;

        stats.set_state(SessionState::Reconnecting);
        let attempt = stats.reconnects.fetch_add(1, Ordering::Relaxed) + 1;
        info!(attempt, "Reconnecting in {}s", delay.as_secs());
        tokio::time::sleep(delay).await;
        stats
            .push_event(SessionEventType::ReconnectAttempt, format!("attempt {attempt}"))
            .await;
    }
}

async fn send_envelope<S>(sink: &Arc<Mutex<S>>, envelope: &Envelope) -> SessionResult
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = envelope.to_text()?;
    sink.lock().await.send(Message::Text(text.into())).await?;
    Ok(())
}

/// A single connection attempt: connect, register, serve until disconnect.
/// Everything spawned here is torn down before returning.
async fn connect_and_run(
    config: &AgentConfig,
    executor: &Arc<LocalExecutor>,
    jar: &Arc<Mutex<CookieJar>>,
    stats: &Arc<AgentStats>,
) -> SessionResult {
    let (ws_stream, _response) =
        tokio_tungstenite::connect_async(config.relay_url.as_str()).await?;
    let (ws_sink, mut ws_stream) = ws_stream.split();
    let ws_sink: WsSink = Arc::new(Mutex::new(ws_sink));
    stats
        .push_event(SessionEventType::Connected, config.relay_url.clone())
        .await;

    let mut agent_id = uuid::Uuid::new_v4().simple().to_string();
    agent_id.truncate(8);
    info!(agent_id = %agent_id, "Connected to relay, registering...");
    send_envelope(&ws_sink, &Envelope::register(format!("laptop-{agent_id}"))).await?;

    let (heartbeat_failed_tx, mut heartbeat_failed_rx) = mpsc::channel::<()>(1);
    // Both sets abort their tasks when dropped, so aborting the session
    // future also cancels the heartbeat and in-flight requests.
    let mut heartbeat: JoinSet<()> = JoinSet::new();
    let mut requests: JoinSet<()> = JoinSet::new();

    let result: SessionResult = loop {
        tokio::select! {
            msg = ws_stream.next() => {
                let msg = match msg {
                    None => break Ok(()),
                    Some(Err(e)) => break Err(e.into()),
                    Some(Ok(msg)) => msg,
                };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break Ok(()),
                    _ => continue,
                };
                let envelope = match Envelope::parse(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Malformed envelope from relay (dropped)");
                        continue;
                    }
                };
                match envelope.kind {
                    EnvelopeKind::Registered => {
                        let id = envelope.id.unwrap_or_default();
                        info!(registered_id = %id, "Registered with relay");
                        *stats.registered_id.lock().await = Some(id.clone());
                        stats.push_event(SessionEventType::Registered, id).await;
                        stats.set_state(SessionState::Registered);
                        if heartbeat.is_empty() {
                            heartbeat.spawn(heartbeat_loop(
                                ws_sink.clone(),
                                Duration::from_secs(config.heartbeat_interval_secs.max(1)),
                                heartbeat_failed_tx.clone(),
                            ));
                        }
                    }
                    EnvelopeKind::Welcome => {
                        info!(server = envelope.server.as_deref().unwrap_or(""), "Relay welcome");
                    }
                    EnvelopeKind::Ping => {
                        let pong = Envelope::new(EnvelopeKind::Pong);
                        if let Err(e) = send_envelope(&ws_sink, &pong).await {
                            break Err(e);
                        }
                    }
                    EnvelopeKind::Request => {
                        requests.spawn(handle_request(
                            executor.clone(),
                            jar.clone(),
                            ws_sink.clone(),
                            stats.clone(),
                            envelope,
                        ));
                    }
                    EnvelopeKind::Pong | EnvelopeKind::Heartbeat | EnvelopeKind::Signal => {
                        debug!(kind = ?envelope.kind, "Control envelope");
                    }
                    EnvelopeKind::Register
                    | EnvelopeKind::RegisterBrowser
                    | EnvelopeKind::Response => {
                        warn!(kind = ?envelope.kind, "Unexpected envelope from relay (ignored)");
                    }
                }
            }
            Some(()) = heartbeat_failed_rx.recv() => {
                stats
                    .push_event(SessionEventType::HeartbeatFailed, String::new())
                    .await;
                break Err("heartbeat send failed".into());
            }
            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "Request task panicked");
                    }
                }
            }
        }
    };

    // Cleanup
    heartbeat.abort_all();
    requests.abort_all();
    result
}

/// Periodic heartbeat; reports the first failed send and stops.
async fn heartbeat_loop<S>(sink: Arc<Mutex<S>>, interval: Duration, failed: mpsc::Sender<()>)
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = send_envelope(&sink, &Envelope::new(EnvelopeKind::Heartbeat)).await {
            warn!(error = %e, "Heartbeat send failed");
            let _ = failed.send(()).await;
            break;
        }
    }
}

/// Answer one `request` envelope. Local failures become a `502` envelope.
async fn handle_request(
    executor: Arc<LocalExecutor>,
    jar: Arc<Mutex<CookieJar>>,
    ws_sink: WsSink,
    stats: Arc<AgentStats>,
    request: Envelope,
) {
    let correlation_id = request.correlation_id.clone().unwrap_or_default();
    let response = match executor.execute(&request, &jar).await {
        Ok(response) => response,
        Err(e) => {
            warn!(correlation_id = %correlation_id, error = %e, "Local call failed");
            stats.local_failures.fetch_add(1, Ordering::Relaxed);
            e.into_envelope(&correlation_id)
        }
    };
    stats.jar_size.store(jar.lock().await.len(), Ordering::Relaxed);
    stats.requests_handled.fetch_add(1, Ordering::Relaxed);

    info!(
        correlation_id = %correlation_id,
        status = response.status.unwrap_or_default(),
        "Response to relay"
    );
    if let Err(e) = send_envelope(&ws_sink, &response).await {
        warn!(correlation_id = %correlation_id, error = %e, "Failed to send response");
    }
}

// ─── Liveness ────────────────────────────────────────────────────────────────

/// Router for the optional agent liveness endpoint.
pub fn health_router(stats: Arc<AgentStats>) -> Router {
    Router::new()
        .route("/health", get(agent_health))
        .with_state(stats)
}

/// `GET /health`: `200` while registered, `503` otherwise.
async fn agent_health(State(stats): State<Arc<AgentStats>>) -> (StatusCode, Json<Value>) {
    let state = stats.state();
    let status = if state == SessionState::Registered {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let registered_id = stats.registered_id.lock().await.clone();
    let recent_events: Vec<Value> = stats
        .events
        .lock()
        .await
        .iter()
        .rev()
        .take(10)
        .map(|e| {
            json!({
                "agoSecs": e.timestamp.elapsed().as_secs(),
                "event": e.event_type.as_str(),
                "detail": e.detail,
            })
        })
        .collect();
    (
        status,
        Json(json!({
            "state": state,
            "registeredId": registered_id,
            "reconnects": stats.reconnects(),
            "requestsHandled": stats.requests_handled.load(Ordering::Relaxed),
            "localFailures": stats.local_failures.load(Ordering::Relaxed),
            "jarSize": stats.jar_size.load(Ordering::Relaxed),
            "recentEvents": recent_events,
        })),
    )
}
