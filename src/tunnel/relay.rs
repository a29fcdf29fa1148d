//! Tunnel relay: public HTTP surface and the duplex endpoint agents dial.
//!
//! The relay:
//! 1. Accepts duplex connections at `/ws` and tracks them in the [`Registry`]
//! 2. Forwards every method under `{prefix}/*` through the [`Multiplexer`]
//! 3. Redirects unprefixed paths into the prefixed space
//! 4. Serves `/health` and, optionally, the static status pages

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{Request, Uri},
    response::{Redirect, Response},
    routing::{any, get},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Instrument};

use super::envelope::{Envelope, EnvelopeKind};
use super::multiplexer::{InboundRequest, Multiplexer, ResponseContext};
use super::registry::{new_connection_id, Registry, Role};
use crate::config::RelayConfig;
use crate::error::TunnelError;

/// Outbound queue depth per duplex connection.
const OUTBOUND_QUEUE: usize = 256;

/// State shared across all relay handlers.
#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<RelayConfig>,
    pub registry: Registry,
    pub multiplexer: Multiplexer,
    pub start_time: Instant,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Registry::new();
        let multiplexer = Multiplexer::new(
            registry.clone(),
            Duration::from_secs(config.request_timeout_secs),
        );
        Self {
            config: Arc::new(config),
            registry,
            multiplexer,
            start_time: Instant::now(),
        }
    }

    /// Close every duplex connection and fail whatever is still pending.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
        self.multiplexer.drain();
    }
}

/// Build the relay router with all tunnel endpoints.
pub fn relay_router(state: RelayState) -> Router {
    let prefix = state.config.prefix.clone();
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ws", get(duplex_ws))
        .route(&prefix, any(proxy))
        .route(&format!("{prefix}/"), any(proxy))
        .route(&format!("{prefix}/{{*path}}"), any(proxy));

    if let Some(dir) = &state.config.static_dir {
        let dir = Path::new(dir);
        router = router
            .route_service("/", ServeFile::new(dir.join("index.html")))
            .route_service("/status", ServeFile::new(dir.join("status.html")))
            .nest_service("/assets", ServeDir::new(dir));
    }

    router
        .fallback(redirect_to_prefix)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the periodic dead-agent sweep. `None` when eviction is disabled.
pub fn spawn_sweeper(state: &RelayState) -> Option<JoinHandle<()>> {
    let timeout_secs = state.config.agent_timeout_secs;
    if timeout_secs == 0 {
        return None;
    }
    let registry = state.registry.clone();
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs((timeout_secs / 3).max(1)));
        loop {
            interval.tick().await;
            let evicted = registry.sweep_dead_agents(timeout_secs).await;
            if !evicted.is_empty() {
                info!(count = evicted.len(), "Swept dead agents");
            }
        }
    }))
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// `GET /health`: relay status consumed by the status page.
async fn health(State(state): State<RelayState>) -> Json<Value> {
    let (laptops, browsers) = state.registry.counts().await;
    let active_agent = state.registry.active_agent().await.map(|agent| {
        json!({
            "id": agent.id,
            "connectedSecs": agent.connected_since.elapsed().as_secs(),
        })
    });
    #[allow(clippy::cast_possible_truncation)]
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);
    Json(json!({
        "status": "ok",
        "laptops": laptops,
        "browsers": browsers,
        "activeAgent": active_agent,
        "server": state.config.server_name,
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "pendingRequests": state.multiplexer.pending_count(),
        "timestamp": timestamp,
    }))
}

/// Any unmatched path goes to the same path under the tunnel prefix, query intact.
async fn redirect_to_prefix(State(state): State<RelayState>, uri: Uri) -> Redirect {
    let target = match uri.query() {
        Some(q) => format!("{}{}?{q}", state.config.prefix, uri.path()),
        None => format!("{}{}", state.config.prefix, uri.path()),
    };
    debug!(from = %uri, to = %target, "Redirecting into tunnel prefix");
    Redirect::temporary(&target)
}

// ─── Proxy ───────────────────────────────────────────────────────────────────

/// Path below the prefix; the bare prefix maps to `/`.
fn strip_prefix(path: &str, prefix: &str) -> String {
    match path.strip_prefix(prefix) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => "/".to_string(),
    }
}

/// `ANY {prefix}/*`: forward to the active agent.
async fn proxy(
    State(state): State<RelayState>,
    request: Request<Body>,
) -> Result<Response, TunnelError> {
    // Fail before buffering a body nobody can receive.
    if !state.registry.has_agent().await {
        return Err(TunnelError::NoAgentConnected);
    }

    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|e| TunnelError::BodyRead(e.to_string()))?;

    let inbound = InboundRequest {
        method: parts.method.as_str().to_string(),
        path: strip_prefix(parts.uri.path(), &state.config.prefix),
        query: parts.uri.query().map(ToString::to_string),
        headers: parts.headers,
        body: body.to_vec(),
        remote_addr,
    };
    info!(method = %inbound.method, path = %inbound.path, "Proxying request");

    let ctx = ResponseContext {
        prefix: state.config.prefix.clone(),
        cookie_domain: state.config.public_host.clone(),
        secure: inbound.is_secure(),
        ajax: inbound.is_ajax(),
    };
    state.multiplexer.forward(&inbound, &ctx).await
}

// ─── Duplex endpoint ─────────────────────────────────────────────────────────

/// `GET /ws`: upgrade to the envelope channel used by agents and observers.
async fn duplex_ws(State(state): State<RelayState>, ws: WebSocketUpgrade) -> Response {
    let conn_id = new_connection_id();
    info!(conn_id = %conn_id, "Duplex connection accepted");
    ws.on_upgrade(move |socket| {
        let span = info_span!("tunnel_conn", conn_id = %conn_id);
        handle_connection(socket, state, conn_id).instrument(span)
    })
}

/// Drive one duplex connection until it closes or the relay drops it.
async fn handle_connection(socket: WebSocket, state: RelayState, conn_id: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    // Forward queued envelopes to the WS sink
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match envelope.to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize envelope (dropped)");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx
        .send(Envelope::welcome(state.config.server_name.clone()))
        .await;

    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                msg
            }
            _ = shutdown_rx.changed() => {
                info!(conn_id = %conn_id, "Connection closed by relay");
                break;
            }
        };
        match msg {
            Message::Text(text) => match Envelope::parse(&text) {
                Ok(envelope) => dispatch(&state, &conn_id, &tx, &shutdown_tx, envelope).await,
                Err(e) => warn!(conn_id = %conn_id, error = %e, "Malformed envelope (dropped)"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    let roles = state.registry.remove(&conn_id).await;
    if roles.contains(&Role::Agent) {
        warn!(conn_id = %conn_id, "Agent disconnected");
    } else {
        info!(conn_id = %conn_id, "Connection closed");
    }
    send_task.abort();
}

/// Handle one envelope received on connection `conn_id`.
async fn dispatch(
    state: &RelayState,
    conn_id: &str,
    tx: &mpsc::Sender<Envelope>,
    shutdown: &Arc<watch::Sender<bool>>,
    envelope: Envelope,
) {
    // Any traffic from an agent counts as liveness.
    state.registry.touch(conn_id).await;

    match envelope.kind {
        EnvelopeKind::Register => {
            info!(
                conn_id,
                claimed_id = envelope.id.as_deref().unwrap_or(""),
                "Agent registering"
            );
            state
                .registry
                .register_agent(conn_id, tx.clone(), shutdown.clone())
                .await;
            let _ = tx.send(Envelope::registered(conn_id)).await;
        }
        EnvelopeKind::RegisterBrowser => {
            state
                .registry
                .register_observer(conn_id, tx.clone(), shutdown.clone())
                .await;
        }
        EnvelopeKind::Ping => {
            let _ = tx.send(Envelope::new(EnvelopeKind::Pong)).await;
        }
        EnvelopeKind::Heartbeat | EnvelopeKind::Pong => {
            debug!(conn_id, "Heartbeat");
        }
        EnvelopeKind::Response => {
            state.multiplexer.complete(conn_id, envelope).await;
        }
        EnvelopeKind::Signal => {
            let delivered = state.registry.broadcast_except(conn_id, &envelope).await;
            debug!(conn_id, delivered, "Forwarded signal");
        }
        EnvelopeKind::Registered | EnvelopeKind::Welcome | EnvelopeKind::Request => {
            warn!(conn_id, kind = ?envelope.kind, "Unexpected envelope from peer (ignored)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, StatusCode};
    use tower::ServiceExt;

    fn state() -> RelayState {
        RelayState::new(RelayConfig {
            request_timeout_secs: 2,
            ..RelayConfig::default()
        })
    }

    async fn fake_agent(state: &RelayState) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(16);
        let (shutdown, _) = watch::channel(false);
        state
            .registry
            .register_agent("agent-1", tx, Arc::new(shutdown))
            .await;
        rx
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_prefix("/proxy", "/proxy"), "/");
        assert_eq!(strip_prefix("/proxy/", "/proxy"), "/");
        assert_eq!(strip_prefix("/proxy/a/b", "/proxy"), "/a/b");
        assert_eq!(strip_prefix("/proxyish", "/proxy"), "/");
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let state = state();
        let _rx = fake_agent(&state).await;
        let response = relay_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["laptops"], 1);
        assert_eq!(body["browsers"], 0);
        assert_eq!(body["activeAgent"]["id"], "agent-1");
        assert_eq!(body["activeAgent"]["connectedSecs"], 0);
        assert_eq!(body["server"], "webtunnel");
        assert!(body["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_offline_page_without_agent() {
        let response = relay_router(state())
            .oneshot(
                Request::post("/proxy/api/items")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_string(response).await.contains("Tunnel Offline"));
    }

    #[tokio::test]
    async fn test_redirects_unprefixed_paths() {
        let response = relay_router(state())
            .oneshot(
                Request::get("/dashboard?tab=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/proxy/dashboard?tab=2"
        );
    }

    #[tokio::test]
    async fn test_proxy_round_trip_through_router() {
        let state = state();
        let mut agent_rx = fake_agent(&state).await;
        let mux = state.multiplexer.clone();

        let agent = tokio::spawn(async move {
            let request = agent_rx.recv().await.unwrap();
            assert_eq!(request.kind, EnvelopeKind::Request);
            assert_eq!(request.method.as_deref(), Some("GET"));
            assert_eq!(request.path.as_deref(), Some("/api/items"));
            assert_eq!(request.query.get("page").map(String::as_str), Some("2"));

            let mut response = Envelope::response(request.correlation_id.unwrap(), 200);
            response.set_header("content-type", "application/json");
            response.set_body(crate::tunnel::codec::Body::Json(json!({"items": [1, 2]})));
            assert!(mux.complete("agent-1", response).await);
        });

        let response = relay_router(state)
            .oneshot(
                Request::get("/proxy/api/items?page=2")
                    .header("host", "tunnel.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        agent.await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body, json!({"items": [1, 2]}));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let state = RelayState::new(RelayConfig {
            max_body_bytes: 8,
            ..RelayConfig::default()
        });
        let _rx = fake_agent(&state).await;
        let response = relay_router(state)
            .oneshot(
                Request::post("/proxy/upload")
                    .body(Body::from("way more than eight bytes"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dispatch_register_replies_with_assigned_id() {
        let state = state();
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);

        dispatch(&state, "abc123xyz", &tx, &shutdown, Envelope::register("laptop-1")).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Registered);
        assert_eq!(reply.id.as_deref(), Some("abc123xyz"));
        assert!(state.registry.has_agent().await);

        dispatch(&state, "abc123xyz", &tx, &shutdown, Envelope::new(EnvelopeKind::Ping)).await;
        assert_eq!(rx.recv().await.unwrap().kind, EnvelopeKind::Pong);
    }

    #[tokio::test]
    async fn test_dispatch_signal_reaches_other_peers() {
        let state = state();
        let mut agent_rx = fake_agent(&state).await;
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        dispatch(
            &state,
            "browser",
            &tx,
            &shutdown,
            Envelope::new(EnvelopeKind::RegisterBrowser),
        )
        .await;

        let mut signal = Envelope::new(EnvelopeKind::Signal);
        signal.payload = Some(json!({"sdp": "offer"}));
        dispatch(&state, "browser", &tx, &shutdown, signal.clone()).await;

        assert_eq!(agent_rx.recv().await.unwrap(), signal);
        assert!(rx.try_recv().is_err());
    }
}
