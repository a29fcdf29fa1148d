//! Cookie handling on both ends of the tunnel.
//!
//! - [`CookieJar`] lives in the agent and keeps the local application's
//!   session alive across proxied requests. It is cleared whenever the
//!   duplex connection is lost.
//! - [`rewrite_set_cookie`] runs in the relay and re-scopes cookies issued by
//!   the local application to the relay's own origin.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Attributes recognised on a `Set-Cookie` line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
}

/// One parsed `Set-Cookie` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    /// Everything after the first `;`, verbatim and trimmed.
    #[serde(default)]
    pub raw_attributes: String,
    #[serde(default)]
    pub attributes: CookieAttributes,
}

impl CookieRecord {
    /// Parse a single `Set-Cookie` value. Returns `None` when there is no
    /// `name=value` pair before the first `;`.
    pub fn parse(set_cookie: &str) -> Option<Self> {
        let (pair, raw_attributes) = match set_cookie.split_once(';') {
            Some((pair, rest)) => (pair, rest.trim()),
            None => (set_cookie, ""),
        };
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut attributes = CookieAttributes::default();
        for attr in raw_attributes.split(';') {
            let attr = attr.trim();
            if attr.is_empty() {
                continue;
            }
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim().to_string())),
                None => (attr, None),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" => attributes.domain = val,
                "path" => attributes.path = val,
                "secure" => attributes.secure = true,
                "httponly" => attributes.http_only = true,
                "samesite" => attributes.same_site = val,
                "max-age" => attributes.max_age = val,
                "expires" => attributes.expires = val,
                _ => {}
            }
        }

        Some(Self {
            name: name.to_string(),
            value: value.trim().to_string(),
            raw_attributes: raw_attributes.to_string(),
            attributes,
        })
    }

    /// Reassemble as a `Set-Cookie` value from the parsed attributes.
    pub fn to_set_cookie(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        let a = &self.attributes;
        if let Some(ref domain) = a.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(ref path) = a.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(ref expires) = a.expires {
            out.push_str("; Expires=");
            out.push_str(expires);
        }
        if let Some(ref max_age) = a.max_age {
            out.push_str("; Max-Age=");
            out.push_str(max_age);
        }
        if a.http_only {
            out.push_str("; HttpOnly");
        }
        if a.secure {
            out.push_str("; Secure");
        }
        if let Some(ref same_site) = a.same_site {
            out.push_str("; SameSite=");
            out.push_str(same_site);
        }
        out
    }
}

/// True if `rest` (text following a comma) starts a new `name=` pair rather
/// than continuing an attribute value such as an `Expires` date.
fn starts_new_cookie(rest: &str) -> bool {
    let rest = rest.trim_start();
    match rest.find(['=', ';', ',']) {
        Some(pos) if rest.as_bytes()[pos] == b'=' => {
            let name = &rest[..pos];
            !name.is_empty() && !name.contains(char::is_whitespace)
        }
        _ => false,
    }
}

/// Split a combined `Set-Cookie` header (several cookies joined with `,`)
/// into individual cookie strings. Commas inside quotes or inside attribute
/// values like `Expires=Wed, 21 Oct 2015 07:28:00 GMT` do not split.
pub fn split_set_cookie(header: &str) -> Vec<String> {
    let mut cookies = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in header.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes && starts_new_cookie(&header[i + 1..]) => {
                let part = header[start..i].trim();
                if !part.is_empty() {
                    cookies.push(part.to_string());
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = header[start..].trim();
    if !tail.is_empty() {
        cookies.push(tail.to_string());
    }
    cookies
}

/// Agent-side session cookie cache: name → value, last write wins.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    entries: IndexMap<String, String>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every cookie from a (possibly comma-joined) `Set-Cookie` value.
    /// Returns the parsed records.
    pub fn absorb(&mut self, set_cookie: &str) -> Vec<CookieRecord> {
        let records: Vec<CookieRecord> = split_set_cookie(set_cookie)
            .iter()
            .filter_map(|c| CookieRecord::parse(c))
            .collect();
        for record in &records {
            self.entries
                .insert(record.name.clone(), record.value.clone());
        }
        records
    }

    /// Build the outbound `Cookie` header: jar entries first, then the
    /// caller's own header appended verbatim.
    pub fn cookie_header(&self, incoming: Option<&str>) -> Option<String> {
        let mut parts: Vec<String> = self
            .entries
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        if let Some(incoming) = incoming.map(str::trim).filter(|s| !s.is_empty()) {
            parts.push(incoming.to_string());
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Re-scope one `Set-Cookie` value to the relay's origin.
///
/// - `Domain` becomes `relay_domain`, or is dropped (host-only cookie on the
///   relay) when no public host is configured.
/// - `Secure` survives only if the inbound call arrived over TLS.
/// - `Path`, `Expires`, `Max-Age`, `HttpOnly`, `SameSite` are kept; a missing
///   `SameSite` defaults to `Lax`. Anything else is dropped.
///
/// Unparseable input is returned unchanged.
pub fn rewrite_set_cookie(set_cookie: &str, relay_domain: Option<&str>, secure: bool) -> String {
    let Some(mut record) = CookieRecord::parse(set_cookie) else {
        return set_cookie.to_string();
    };
    rewrite_record(&mut record, relay_domain, secure);
    record.to_set_cookie()
}

/// In-place variant of [`rewrite_set_cookie`] for already-parsed records.
pub fn rewrite_record(record: &mut CookieRecord, relay_domain: Option<&str>, secure: bool) {
    let a = &mut record.attributes;
    a.domain = relay_domain.map(ToString::to_string);
    a.secure = a.secure && secure;
    if a.same_site.is_none() {
        a.same_site = Some("Lax".to_string());
    }
}
