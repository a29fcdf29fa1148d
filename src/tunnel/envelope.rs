//! Envelope: the JSON message unit exchanged over the duplex connection.
//!
//! One flat struct covers every kind; fields that a kind does not use are
//! omitted on the wire. Header keys are always stored lowercase so lookups are
//! case-insensitive.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::codec::{Body, BodyEncoding};
use crate::cookies::CookieRecord;

/// Discriminant carried in the `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    /// Agent → relay: announce this connection as an agent.
    Register,
    /// Status observer → relay: announce this connection as an observer.
    RegisterBrowser,
    /// Relay → agent: registration accepted, carries the assigned id.
    Registered,
    /// Relay → any: sent once on accept.
    Welcome,
    /// Agent → relay: periodic liveness.
    Heartbeat,
    Ping,
    Pong,
    /// Relay → agent: proxied HTTP request.
    Request,
    /// Agent → relay: result of a proxied request.
    Response,
    /// Opaque peer signaling, forwarded but never interpreted.
    Signal,
}

/// A single tunnel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub query: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "BodyEncoding::is_none")]
    pub body_encoding: BodyEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<CookieRecord>,
    /// Free-form content of `signal` envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            id: None,
            server: None,
            correlation_id: None,
            method: None,
            path: None,
            query: IndexMap::new(),
            headers: IndexMap::new(),
            body_encoding: BodyEncoding::None,
            body: None,
            status: None,
            cookies: Vec::new(),
            payload: None,
        }
    }

    pub fn register(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(EnvelopeKind::Register)
        }
    }

    pub fn registered(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(EnvelopeKind::Registered)
        }
    }

    pub fn welcome(server: impl Into<String>) -> Self {
        Self {
            server: Some(server.into()),
            ..Self::new(EnvelopeKind::Welcome)
        }
    }

    pub fn request(
        correlation_id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            method: Some(method.into()),
            path: Some(path.into()),
            ..Self::new(EnvelopeKind::Request)
        }
    }

    pub fn response(correlation_id: impl Into<String>, status: u16) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            status: Some(status),
            ..Self::new(EnvelopeKind::Response)
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Insert a header, normalizing the key to lowercase. Replaces any prior value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Typed view of `bodyEncoding` + `body`.
    pub fn body(&self) -> Body {
        Body::from_parts(self.body_encoding, self.body.as_ref())
    }

    /// Replace `bodyEncoding` + `body` from a typed body.
    pub fn set_body(&mut self, body: Body) {
        let (encoding, value) = body.into_parts();
        self.body_encoding = encoding;
        self.body = value;
    }

    /// Serialize to the wire format.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one wire message. Header keys are lowercased on the way in.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let mut envelope: Self = serde_json::from_str(text)?;
        if envelope
            .headers
            .keys()
            .any(|k| k.bytes().any(|b| b.is_ascii_uppercase()))
        {
            envelope.headers = envelope
                .headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect();
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_wire_shape() {
        let text = Envelope::register("laptop-1").to_text().unwrap();
        assert_eq!(text, r#"{"kind":"register","id":"laptop-1"}"#);
    }

    #[test]
    fn test_request_uses_camel_case_fields() {
        let mut env = Envelope::request("abc", "POST", "/login");
        env.set_body(Body::Text("hi".into()));
        let value: Value = serde_json::from_str(&env.to_text().unwrap()).unwrap();
        assert_eq!(value["kind"], "request");
        assert_eq!(value["correlationId"], "abc");
        assert_eq!(value["bodyEncoding"], "utf8");
        assert_eq!(value["body"], "hi");
        assert!(value.get("status").is_none());
    }

    #[test]
    fn test_parse_register_browser() {
        let env = Envelope::parse(r#"{"kind":"register-browser"}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::RegisterBrowser);
    }

    #[test]
    fn test_parse_unknown_kind_fails() {
        assert!(Envelope::parse(r#"{"kind":"http-request"}"#).is_err());
        assert!(Envelope::parse("not json").is_err());
    }

    #[test]
    fn test_headers_case_insensitive() {
        let env = Envelope::parse(
            r#"{"kind":"response","correlationId":"1","status":200,"headers":{"Content-Type":"text/html"}}"#,
        )
        .unwrap();
        assert_eq!(env.header("content-type"), Some("text/html"));
        assert_eq!(env.header("CONTENT-TYPE"), Some("text/html"));
    }

    #[test]
    fn test_query_order_preserved() {
        let mut env = Envelope::request("1", "GET", "/search");
        env.query.insert("z".into(), "1".into());
        env.query.insert("a".into(), "2".into());
        let parsed = Envelope::parse(&env.to_text().unwrap()).unwrap();
        let keys: Vec<&str> = parsed.query.keys().map(String::as_str).collect();
        assert_eq!(keys, ["z", "a"]);
    }
}
