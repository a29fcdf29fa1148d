//! Request multiplexer: bridges inbound HTTP calls to envelope round trips.
//!
//! Each call gets a fresh correlation id and a slot in the pending table. The
//! slot is removed by exactly one of two paths: the agent's matching
//! `response` envelope ([`Multiplexer::complete`]) or the timeout in
//! [`Multiplexer::round_trip`]. Whoever removes it first owns the outcome, so
//! a call is never completed twice. A single deadline covers both queueing the
//! envelope for the agent and waiting for its answer, and a dropped caller
//! releases its slot.
//!
//! The pending table belongs to the multiplexer rather than to an agent
//! record: if an agent drops mid-flight its requests simply run into the
//! timeout.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::body::Body as HttpBody;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use indexmap::IndexMap;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::codec::{encode_request_body, Body};
use super::envelope::Envelope;
use super::registry::Registry;
use crate::cookies::{rewrite_record, rewrite_set_cookie, split_set_cookie, CookieRecord};
use crate::error::TunnelError;
use crate::rewrite::{rewrite, ContentKind};

/// Inbound headers never forwarded to the agent.
const STRIPPED_REQUEST_HEADERS: &[&str] =
    &["host", "content-length", "accept-encoding", "referer"];

/// Agent response headers the HTTP layer recomputes or that are hop-by-hop.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

/// A relay-side record of a request awaiting its response envelope.
struct PendingRequest {
    agent_id: String,
    created_at: Instant,
    tx: oneshot::Sender<Envelope>,
}

type PendingTable = Mutex<HashMap<String, PendingRequest>>;

fn lock_table(table: &PendingTable) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases a pending slot when its call ends, however it ends.
struct SlotGuard<'a> {
    table: &'a PendingTable,
    correlation_id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if lock_table(self.table).remove(self.correlation_id).is_some() {
            debug!(correlation_id = self.correlation_id, "Released pending slot");
        }
    }
}

/// An inbound HTTP call, already split from its transport.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    /// Path with the tunnel prefix stripped; always starts with `/`.
    pub path: String,
    /// Raw query string without `?`.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub remote_addr: Option<SocketAddr>,
}

impl InboundRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the caller reached the relay over TLS (directly or via a
    /// terminating proxy that sets `x-forwarded-proto`).
    pub fn is_secure(&self) -> bool {
        self.header("x-forwarded-proto")
            .and_then(|p| p.split(',').next())
            .is_some_and(|p| p.trim().eq_ignore_ascii_case("https"))
    }

    /// AJAX calls are identified by `x-requested-with`.
    pub fn is_ajax(&self) -> bool {
        self.headers.contains_key("x-requested-with")
    }

    /// Public hostname the caller used, without port.
    pub fn host(&self) -> Option<&str> {
        let host = self
            .header("x-forwarded-host")
            .or_else(|| self.header("host"))?;
        let host = host.split(',').next().unwrap_or(host).trim();
        Some(strip_port(host))
    }

    fn client_ip(&self) -> Option<String> {
        if let Some(ip) = self.header("x-real-ip") {
            return Some(ip.trim().to_string());
        }
        if let Some(xff) = self.header("x-forwarded-for") {
            if let Some(first) = xff.split(',').next() {
                return Some(first.trim().to_string());
            }
        }
        self.remote_addr.map(|a| a.ip().to_string())
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal: keep the brackets, drop `:port` after them.
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(host, |(h, _)| h)
}

/// How a response envelope is turned back into an HTTP response.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    /// Tunnel prefix used for content rewriting.
    pub prefix: String,
    /// Domain for rewritten cookies; `None` makes them host-only.
    pub cookie_domain: Option<String>,
    /// Keep `Secure` on cookies.
    pub secure: bool,
    /// Skip HTML/CSS rewriting.
    pub ajax: bool,
}

/// Correlates inbound HTTP calls with agent responses.
#[derive(Clone)]
pub struct Multiplexer {
    registry: Registry,
    pending: Arc<PendingTable>,
    timeout: Duration,
}

impl Multiplexer {
    pub fn new(registry: Registry, timeout: Duration) -> Self {
        Self {
            registry,
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pending_count(&self) -> usize {
        self.slots().len()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        lock_table(&self.pending)
    }

    /// Build the `request` envelope for an inbound call.
    pub fn build_request(&self, inbound: &InboundRequest) -> Envelope {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let mut envelope = Envelope::request(correlation_id, &inbound.method, &inbound.path);
        envelope.query = parse_query(inbound.query.as_deref());

        for name in inbound.headers.keys() {
            let key = name.as_str();
            if STRIPPED_REQUEST_HEADERS.contains(&key) {
                continue;
            }
            let separator = if key == "cookie" { "; " } else { ", " };
            let joined = inbound
                .headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(separator);
            envelope.set_header(key, joined);
        }
        envelope.set_header("accept", "*/*");
        envelope.set_header("connection", "close");

        if let Some(host) = inbound.host() {
            envelope.set_header("x-forwarded-host", host);
        }
        envelope.set_header(
            "x-forwarded-proto",
            if inbound.is_secure() { "https" } else { "http" },
        );
        if let Some(ip) = inbound.client_ip() {
            envelope.set_header("x-real-ip", ip);
        }

        let body = encode_request_body(
            &inbound.method,
            inbound.header("content-type"),
            &inbound.body,
        );
        if let Some(content_type) = body.forced_content_type() {
            envelope.set_header("content-type", content_type);
        }
        envelope.set_body(body);
        envelope
    }

    /// Send `envelope` to the active agent and wait for the matching response.
    pub async fn round_trip(&self, envelope: Envelope) -> Result<Envelope, TunnelError> {
        let agent = self
            .registry
            .active_agent()
            .await
            .ok_or(TunnelError::NoAgentConnected)?;
        let correlation_id = envelope.correlation_id.clone().unwrap_or_default();

        let deadline = tokio::time::Instant::now() + self.timeout;

        let (tx, mut rx) = oneshot::channel();
        self.slots().insert(
            correlation_id.clone(),
            PendingRequest {
                agent_id: agent.id.clone(),
                created_at: Instant::now(),
                tx,
            },
        );
        let _slot = SlotGuard {
            table: &self.pending,
            correlation_id: &correlation_id,
        };

        debug!(correlation_id, agent = %agent.id, "Forwarding request to agent");
        match tokio::time::timeout_at(deadline, agent.tx.send(envelope)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                warn!(correlation_id, agent = %agent.id, "Agent connection closed before send");
                return Err(TunnelError::TransportSendFailure);
            }
            Err(_) => {
                warn!(correlation_id, agent = %agent.id, "Agent queue stalled, request timed out");
                return Err(TunnelError::RequestTimeout(self.timeout.as_secs()));
            }
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped without a response: the table was drained.
            Ok(Err(_)) => Err(TunnelError::TransportSendFailure),
            Err(_) => {
                if self.slots().remove(&correlation_id).is_some() {
                    warn!(correlation_id, "Request timed out");
                    Err(TunnelError::RequestTimeout(self.timeout.as_secs()))
                } else {
                    // The response won the race for the slot and is already in `rx`.
                    rx.await.map_err(|_| TunnelError::TransportSendFailure)
                }
            }
        }
    }

    /// Hand a `response` envelope from connection `from` to its waiting call.
    /// Returns `false` for late, unknown, or foreign responses (dropped).
    pub async fn complete(&self, from: &str, envelope: Envelope) -> bool {
        let Some(correlation_id) = envelope.correlation_id.clone() else {
            warn!(conn_id = %from, "Response without correlation id (dropped)");
            return false;
        };
        let slot = {
            let mut pending = self.slots();
            match pending.get(&correlation_id) {
                Some(p) if p.agent_id == from => pending.remove(&correlation_id),
                Some(_) => {
                    warn!(
                        conn_id = %from,
                        correlation_id,
                        "Response from a different agent (dropped)"
                    );
                    None
                }
                None => {
                    warn!(
                        conn_id = %from,
                        correlation_id,
                        "Response arrived for timed-out or unknown request (dropped)"
                    );
                    None
                }
            }
        };
        let Some(slot) = slot else {
            return false;
        };
        info!(
            correlation_id,
            status = envelope.status.unwrap_or(200),
            elapsed_ms = slot.created_at.elapsed().as_millis() as u64,
            "Response from agent"
        );
        slot.tx.send(envelope).is_ok()
    }

    /// Drop every pending slot; their callers fail with a bad-gateway status.
    pub fn drain(&self) {
        let mut pending = self.slots();
        let count = pending.len();
        pending.clear();
        if count > 0 {
            info!(count, "Drained pending requests");
        }
    }

    /// Full inbound → outbound path for one HTTP call.
    pub async fn forward(
        &self,
        inbound: &InboundRequest,
        ctx: &ResponseContext,
    ) -> Result<Response, TunnelError> {
        if !self.registry.has_agent().await {
            return Err(TunnelError::NoAgentConnected);
        }
        let envelope = self.build_request(inbound);
        let response = self.round_trip(envelope).await?;
        into_http_response(response, ctx)
    }
}

/// Parse a raw query string into an ordered map (last duplicate wins).
pub fn parse_query(query: Option<&str>) -> IndexMap<String, String> {
    query
        .and_then(|q| serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok())
        .map(|pairs| pairs.into_iter().collect())
        .unwrap_or_default()
}

fn append_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.append(name, value);
        }
        _ => debug!(header = name, "Skipping invalid response header"),
    }
}

/// Turn a `response` envelope into the HTTP response for the original caller.
pub fn into_http_response(
    envelope: Envelope,
    ctx: &ResponseContext,
) -> Result<Response, TunnelError> {
    let status = StatusCode::from_u16(envelope.status.unwrap_or(200))
        .map_err(|e| TunnelError::InvalidResponse(e.to_string()))?;

    let mut headers = HeaderMap::new();
    let mut cookie_names: HashSet<String> = HashSet::new();
    for (name, value) in &envelope.headers {
        let name = name.as_str();
        if STRIPPED_RESPONSE_HEADERS.contains(&name) {
            continue;
        }
        if name == "set-cookie" {
            for cookie in split_set_cookie(value) {
                if let Some(record) = CookieRecord::parse(&cookie) {
                    cookie_names.insert(record.name);
                }
                let rewritten =
                    rewrite_set_cookie(&cookie, ctx.cookie_domain.as_deref(), ctx.secure);
                append_header(&mut headers, "set-cookie", &rewritten);
            }
            continue;
        }
        append_header(&mut headers, name, value);
    }

    for record in &envelope.cookies {
        if !cookie_names.insert(record.name.clone()) {
            continue;
        }
        let mut record = record.clone();
        rewrite_record(&mut record, ctx.cookie_domain.as_deref(), ctx.secure);
        append_header(&mut headers, "set-cookie", &record.to_set_cookie());
    }

    let body = envelope.body();
    if matches!(body, Body::Json(_)) && !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }

    let mut bytes = body.to_bytes();
    let kind = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(ContentKind::from_content_type);
    if let (Some(kind), false) = (kind, ctx.ajax) {
        match String::from_utf8(bytes) {
            Ok(text) => bytes = rewrite(&text, &ctx.prefix, kind).into_bytes(),
            Err(e) => bytes = e.into_bytes(),
        }
    }

    let mut response = Response::new(HttpBody::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::codec::BodyEncoding;
    use crate::tunnel::envelope::EnvelopeKind;
    use tokio::sync::{mpsc, watch};

    fn ctx() -> ResponseContext {
        ResponseContext {
            prefix: "/proxy".into(),
            cookie_domain: None,
            secure: false,
            ajax: false,
        }
    }

    fn inbound(method: &str, path: &str, query: Option<&str>) -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("tunnel.example.com:443"));
        headers.insert("accept-encoding", HeaderValue::from_static("gzip"));
        headers.insert("referer", HeaderValue::from_static("https://x/"));
        headers.insert("user-agent", HeaderValue::from_static("test"));
        InboundRequest {
            method: method.into(),
            path: path.into(),
            query: query.map(ToString::to_string),
            headers,
            body: Vec::new(),
            remote_addr: Some("203.0.113.7:5555".parse().unwrap()),
        }
    }

    async fn with_agent(timeout: Duration) -> (Multiplexer, mpsc::Receiver<Envelope>) {
        let registry = Registry::new();
        let (tx, rx) = mpsc::channel(64);
        let (shutdown, _) = watch::channel(false);
        registry
            .register_agent("agent-1", tx, Arc::new(shutdown))
            .await;
        (Multiplexer::new(registry, timeout), rx)
    }

    #[test]
    fn test_build_request_sanitizes_headers() {
        let mux = Multiplexer::new(Registry::new(), Duration::from_secs(30));
        let env = mux.build_request(&inbound("GET", "/widgets", Some("x=1&y=two")));
        assert_eq!(env.kind, EnvelopeKind::Request);
        assert!(env.correlation_id.is_some());
        assert_eq!(env.path.as_deref(), Some("/widgets"));
        assert_eq!(env.query.get("x").map(String::as_str), Some("1"));
        assert_eq!(env.query.get("y").map(String::as_str), Some("two"));
        assert!(env.header("host").is_none());
        assert!(env.header("accept-encoding").is_none());
        assert!(env.header("referer").is_none());
        assert_eq!(env.header("accept"), Some("*/*"));
        assert_eq!(env.header("connection"), Some("close"));
        assert_eq!(env.header("user-agent"), Some("test"));
        assert_eq!(env.header("x-forwarded-host"), Some("tunnel.example.com"));
        assert_eq!(env.header("x-forwarded-proto"), Some("http"));
        assert_eq!(env.header("x-real-ip"), Some("203.0.113.7"));
        assert_eq!(env.body_encoding, BodyEncoding::None);
    }

    #[test]
    fn test_build_request_get_drops_body() {
        let mux = Multiplexer::new(Registry::new(), Duration::from_secs(30));
        let mut req = inbound("GET", "/", None);
        req.body = b"sneaky".to_vec();
        let env = mux.build_request(&req);
        assert!(env.body.is_none());
    }

    #[test]
    fn test_build_request_form_forces_content_type() {
        let mux = Multiplexer::new(Registry::new(), Duration::from_secs(30));
        let mut req = inbound("POST", "/login", None);
        req.headers.insert(
            "content-type",
            HeaderValue::from_static("application/x-www-form-urlencoded; charset=UTF-8"),
        );
        req.body = b"user=a&pass=b%20c".to_vec();
        let env = mux.build_request(&req);
        assert_eq!(env.body_encoding, BodyEncoding::UrlencodedForm);
        assert_eq!(
            env.header("content-type"),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:3000"), "[::1]");
    }

    #[tokio::test]
    async fn test_no_agent_fails_fast() {
        let mux = Multiplexer::new(Registry::new(), Duration::from_secs(30));
        let err = mux
            .forward(&inbound("GET", "/", None), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::NoAgentConnected));
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_matches_correlation_id() {
        let (mux, mut agent_rx) = with_agent(Duration::from_secs(5)).await;
        let request = mux.build_request(&inbound("GET", "/widgets", Some("x=1")));
        let id = request.correlation_id.clone().unwrap();

        let mux2 = mux.clone();
        let responder = tokio::spawn(async move {
            let req = agent_rx.recv().await.unwrap();
            let mut resp = Envelope::response(req.correlation_id.clone().unwrap(), 200);
            resp.set_header("content-type", "application/json");
            resp.set_body(Body::Json(serde_json::json!({"ok": true})));
            assert!(mux2.complete("agent-1", resp).await);
        });

        let resp = mux.round_trip(request).await.unwrap();
        responder.await.unwrap();
        assert_eq!(resp.correlation_id.as_deref(), Some(id.as_str()));
        assert_eq!(resp.status, Some(200));
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reverse_order_responses_are_not_swapped() {
        let (mux, mut agent_rx) = with_agent(Duration::from_secs(5)).await;
        const N: usize = 8;

        let mut calls = Vec::new();
        for i in 0..N {
            let mux = mux.clone();
            calls.push(tokio::spawn(async move {
                let req = mux.build_request(&inbound("GET", &format!("/item/{i}"), None));
                let resp = mux.round_trip(req).await.unwrap();
                (i, resp)
            }));
        }

        let mut received = Vec::new();
        for _ in 0..N {
            received.push(agent_rx.recv().await.unwrap());
        }
        for req in received.into_iter().rev() {
            let path = req.path.clone().unwrap();
            let n: u16 = path.trim_start_matches("/item/").parse().unwrap();
            let mut resp = Envelope::response(req.correlation_id.clone().unwrap(), 200 + n);
            resp.set_body(Body::Text(path));
            assert!(mux.complete("agent-1", resp).await);
        }

        for call in calls {
            let (i, resp) = call.await.unwrap();
            assert_eq!(resp.status, Some(200 + i as u16));
            assert_eq!(resp.body(), Body::Text(format!("/item/{i}")));
        }
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_discarded() {
        let (mux, mut agent_rx) = with_agent(Duration::from_millis(200)).await;
        let request = mux.build_request(&inbound("GET", "/slow", None));

        let started = Instant::now();
        let err = mux.round_trip(request).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(matches!(err, TunnelError::RequestTimeout(_)));
        assert_eq!(mux.pending_count(), 0);

        let sent = agent_rx.recv().await.unwrap();
        let late = Envelope::response(sent.correlation_id.unwrap(), 200);
        assert!(!mux.complete("agent-1", late).await);
    }

    #[tokio::test]
    async fn test_response_from_other_connection_is_ignored() {
        let (mux, mut agent_rx) = with_agent(Duration::from_millis(300)).await;
        let request = mux.build_request(&inbound("GET", "/", None));
        let mux2 = mux.clone();
        let call = tokio::spawn(async move { mux2.round_trip(request).await });

        let sent = agent_rx.recv().await.unwrap();
        let forged = Envelope::response(sent.correlation_id.unwrap(), 200);
        assert!(!mux.complete("intruder", forged).await);
        assert!(matches!(
            call.await.unwrap(),
            Err(TunnelError::RequestTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_drain_fails_in_flight_with_bad_gateway() {
        let (mux, mut agent_rx) = with_agent(Duration::from_secs(5)).await;
        let request = mux.build_request(&inbound("GET", "/", None));
        let mux2 = mux.clone();
        let call = tokio::spawn(async move { mux2.round_trip(request).await });

        agent_rx.recv().await.unwrap();
        mux.drain();
        assert!(matches!(
            call.await.unwrap(),
            Err(TunnelError::TransportSendFailure)
        ));
    }

    #[tokio::test]
    async fn test_stalled_agent_queue_still_times_out() {
        let registry = Registry::new();
        let (tx, _agent_rx) = mpsc::channel(1);
        tx.send(Envelope::new(EnvelopeKind::Ping)).await.unwrap();
        let (shutdown, _) = watch::channel(false);
        registry
            .register_agent("agent-1", tx, Arc::new(shutdown))
            .await;
        let mux = Multiplexer::new(registry, Duration::from_millis(200));

        let request = mux.build_request(&inbound("GET", "/", None));
        let outcome = tokio::time::timeout(Duration::from_secs(2), mux.round_trip(request))
            .await
            .expect("round trip ignored its deadline");
        assert!(matches!(outcome, Err(TunnelError::RequestTimeout(_))));
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_caller_releases_slot() {
        let (mux, mut agent_rx) = with_agent(Duration::from_secs(30)).await;
        let request = mux.build_request(&inbound("GET", "/", None));
        let mux2 = mux.clone();
        let call = tokio::spawn(async move { mux2.round_trip(request).await });

        agent_rx.recv().await.unwrap();
        assert_eq!(mux.pending_count(), 1);

        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert_eq!(mux.pending_count(), 0);
    }

    #[test]
    fn test_response_cookie_rewrite_and_merge() {
        let mut env = Envelope::response("1", 200);
        env.set_header("set-cookie", "sessionid=abc123; Domain=localhost; Secure");
        env.cookies = vec![
            CookieRecord::parse("sessionid=abc123; Domain=localhost").unwrap(),
            CookieRecord::parse("csrftoken=t1; Path=/").unwrap(),
        ];
        let resp = into_http_response(env, &ctx()).unwrap();
        let cookies: Vec<&str> = resp
            .headers()
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(
            cookies,
            vec![
                "sessionid=abc123; SameSite=Lax",
                "csrftoken=t1; Path=/; SameSite=Lax"
            ]
        );
    }

    #[test]
    fn test_response_strips_content_length() {
        let mut env = Envelope::response("1", 201);
        env.set_header("content-length", "999");
        env.set_header("x-custom", "yes");
        let resp = into_http_response(env, &ctx()).unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(resp.headers().get("content-length").is_none());
        assert_eq!(resp.headers()["x-custom"], "yes");
    }

    #[tokio::test]
    async fn test_response_html_rewritten_unless_ajax() {
        let html = r#"<html><head></head><body><a href="/x">x</a></body></html>"#;
        let mut env = Envelope::response("1", 200);
        env.set_header("content-type", "text/html; charset=utf-8");
        env.set_body(Body::Text(html.into()));

        let rewritten = into_http_response(env.clone(), &ctx()).unwrap();
        let ajax = into_http_response(
            env,
            &ResponseContext {
                ajax: true,
                ..ctx()
            },
        )
        .unwrap();

        let rewritten = axum::body::to_bytes(rewritten.into_body(), usize::MAX)
            .await
            .unwrap();
        let ajax = axum::body::to_bytes(ajax.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(std::str::from_utf8(&rewritten)
            .unwrap()
            .contains(r#"href="/proxy/x""#));
        assert_eq!(&ajax[..], html.as_bytes());
    }

    #[test]
    fn test_invalid_status_is_rejected() {
        let env = Envelope::response("1", 1000);
        assert!(matches!(
            into_http_response(env, &ctx()),
            Err(TunnelError::InvalidResponse(_))
        ));
    }
}
