//! Body encoding rules for carrying HTTP payloads through text envelopes.
//!
//! Selection is driven by the declared `content-type`; byte-shape sniffing is
//! only a fallback when no content type is present, or when a declared text
//! type turns out not to be valid UTF-8 (so nothing is ever lost).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Wire value of the `bodyEncoding` field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BodyEncoding {
    #[default]
    None,
    Utf8,
    JsonObject,
    UrlencodedForm,
    RawMultipart,
    Base64Binary,
}

impl BodyEncoding {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Decoded body as carried by an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Text(String),
    Json(Value),
    /// Canonical `application/x-www-form-urlencoded` string.
    Form(String),
    /// Text-only multipart payload, verbatim.
    Multipart(String),
    Binary(Vec<u8>),
}

impl Body {
    /// Build from wire fields. Tolerates a missing encoding (raw string or
    /// JSON body) and base64 that fails to decode (kept as text).
    pub fn from_parts(encoding: BodyEncoding, body: Option<&Value>) -> Self {
        let Some(body) = body else {
            return Self::Empty;
        };
        match encoding {
            BodyEncoding::None => match body {
                Value::Null => Self::Empty,
                Value::String(s) => Self::Text(s.clone()),
                other => Self::Json(other.clone()),
            },
            BodyEncoding::Utf8 => Self::Text(value_as_text(body)),
            BodyEncoding::JsonObject => Self::Json(body.clone()),
            BodyEncoding::UrlencodedForm => Self::Form(value_as_text(body)),
            BodyEncoding::RawMultipart => Self::Multipart(value_as_text(body)),
            BodyEncoding::Base64Binary => {
                let text = value_as_text(body);
                match BASE64.decode(text.as_bytes()) {
                    Ok(bytes) => Self::Binary(bytes),
                    Err(e) => {
                        debug!("base64 body failed to decode ({e}), keeping raw text");
                        Self::Text(text)
                    }
                }
            }
        }
    }

    /// Split into wire fields.
    pub fn into_parts(self) -> (BodyEncoding, Option<Value>) {
        match self {
            Self::Empty => (BodyEncoding::None, None),
            Self::Text(s) => (BodyEncoding::Utf8, Some(Value::String(s))),
            Self::Json(v) => (BodyEncoding::JsonObject, Some(v)),
            Self::Form(s) => (BodyEncoding::UrlencodedForm, Some(Value::String(s))),
            Self::Multipart(s) => (BodyEncoding::RawMultipart, Some(Value::String(s))),
            Self::Binary(bytes) => (
                BodyEncoding::Base64Binary,
                Some(Value::String(BASE64.encode(bytes))),
            ),
        }
    }

    /// Raw bytes to put on the HTTP wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Empty => Vec::new(),
            Self::Text(s) | Self::Form(s) | Self::Multipart(s) => s.as_bytes().to_vec(),
            Self::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
            Self::Binary(b) => b.clone(),
        }
    }

    /// Content type forced on the outbound hop, if this encoding fixes one.
    /// Multipart and binary keep the original header (with its boundary).
    pub fn forced_content_type(&self) -> Option<&'static str> {
        match self {
            Self::Json(_) => Some("application/json"),
            Self::Form(_) => Some("application/x-www-form-urlencoded"),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Lowercased media type without parameters: `Text/HTML; charset=x` → `text/html`.
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// `GET` and `HEAD` never carry a body.
pub fn method_allows_body(method: &str) -> bool {
    !(method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD"))
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn text_or_binary(bytes: &[u8]) -> Body {
    match std::str::from_utf8(bytes) {
        Ok(s) => Body::Text(s.to_string()),
        Err(_) => Body::Binary(bytes.to_vec()),
    }
}

fn is_json_type(media: &str) -> bool {
    media == "application/json" || media.ends_with("+json")
}

/// Choose the encoding for a request body travelling towards the local app.
pub fn encode_request_body(method: &str, content_type: Option<&str>, bytes: &[u8]) -> Body {
    if !method_allows_body(method) || bytes.is_empty() {
        return Body::Empty;
    }
    let Some(content_type) = content_type else {
        return text_or_binary(bytes);
    };
    let media = media_type(content_type);

    if media == "multipart/form-data" {
        if !contains_subslice(bytes, b"filename=") {
            if let Ok(s) = std::str::from_utf8(bytes) {
                return Body::Multipart(s.to_string());
            }
        }
        return Body::Binary(bytes.to_vec());
    }

    if media == "application/x-www-form-urlencoded" {
        let canonical = serde_urlencoded::from_bytes::<Vec<(String, String)>>(bytes)
            .ok()
            .and_then(|fields| serde_urlencoded::to_string(&fields).ok());
        return match canonical {
            Some(form) => Body::Form(form),
            None => {
                debug!("urlencoded body did not parse, forwarding raw");
                text_or_binary(bytes)
            }
        };
    }

    if is_json_type(&media) {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            return Body::Json(value);
        }
    }

    text_or_binary(bytes)
}

fn is_binary_type(media: &str, content_type: &str) -> bool {
    media.starts_with("image/")
        || media.starts_with("font/")
        || media == "application/octet-stream"
        || content_type.to_ascii_lowercase().contains("binary")
}

/// Choose the encoding for a response body travelling back to the relay.
pub fn encode_response_body(content_type: Option<&str>, bytes: &[u8]) -> Body {
    if bytes.is_empty() {
        return Body::Empty;
    }
    let Some(content_type) = content_type else {
        return text_or_binary(bytes);
    };
    let media = media_type(content_type);

    if is_binary_type(&media, content_type) {
        return Body::Binary(bytes.to_vec());
    }
    if is_json_type(&media) {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            return Body::Json(value);
        }
    }
    text_or_binary(bytes)
}
