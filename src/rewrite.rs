//! Best-effort rewriting of root-relative references in proxied HTML and CSS.
//!
//! The local application believes it is served from `/`; the browser sees it
//! under the tunnel prefix. Each [`Rule`] finds one kind of root-relative
//! reference (`/x`, never `//host/x`) and prefixes it. Rules run in a fixed
//! order and are individually idempotent: a path that already carries the
//! prefix is left alone.
//!
//! This is pattern matching, not parsing. Obfuscated or adversarial markup
//! will slip through.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::tunnel::codec::media_type;

/// What kind of document a response body is, for rewriting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Css,
}

impl ContentKind {
    /// Classify by declared content type; `None` means "do not rewrite".
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match media_type(content_type).as_str() {
            "text/html" => Some(Self::Html),
            "text/css" => Some(Self::Css),
            _ => None,
        }
    }
}

/// A single rewrite pattern. `lead` is kept verbatim, `path` gets the prefix.
struct Rule {
    name: &'static str,
    pattern: Regex,
}

impl Rule {
    fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern)
                .unwrap_or_else(|e| panic!("rewrite rule {name} does not compile: {e}")),
        }
    }

    fn apply(&self, input: &str, prefix: &str) -> String {
        self.pattern
            .replace_all(input, |caps: &Captures| {
                let path = &caps["path"];
                if needs_prefix(path, prefix) {
                    format!("{}{prefix}{path}", &caps["lead"])
                } else {
                    caps[0].to_string()
                }
            })
            .into_owned()
    }
}

static CSS_URL: LazyLock<Rule> = LazyLock::new(|| {
    Rule::new(
        "css-url",
        r#"(?i)(?P<lead>url\(\s*["']?)(?P<path>/[^"'\s)]*)"#,
    )
});

/// HTML rules, in application order. CSS `url()` runs as part of this list too,
/// covering inline `style` attributes and `<style>` blocks.
static HTML_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule::new(
            "attribute",
            r#"(?i)(?P<lead>\b(?:href|src|action)\s*=\s*["']?)(?P<path>/[^"'\s>]*)"#,
        ),
        Rule::new(
            "css-url",
            r#"(?i)(?P<lead>url\(\s*["']?)(?P<path>/[^"'\s)]*)"#,
        ),
        Rule::new(
            "location-assign",
            r#"(?P<lead>\b(?:window\.|document\.)?location(?:\.href)?\s*=\s*["'`])(?P<path>/[^"'`]*)"#,
        ),
        Rule::new(
            "location-call",
            r#"(?P<lead>\blocation\.(?:assign|replace)\(\s*["'`])(?P<path>/[^"'`]*)"#,
        ),
        Rule::new(
            "fetch",
            r#"(?P<lead>\bfetch\(\s*["'`])(?P<path>/[^"'`]*)"#,
        ),
        Rule::new(
            "jquery",
            r#"(?P<lead>[$\w]\.(?:get|post|getJSON|load|ajax)\(\s*["'])(?P<path>/[^"']*)"#,
        ),
        Rule::new(
            "ajax-url-option",
            r#"(?P<lead>\burl\s*:\s*["'])(?P<path>/[^"']*)"#,
        ),
        Rule::new(
            "xhr-open",
            r#"(?P<lead>\.open\(\s*["'][A-Za-z]+["']\s*,\s*["'])(?P<path>/[^"']*)"#,
        ),
        Rule::new(
            "history",
            r#"(?P<lead>\bhistory\.(?:pushState|replaceState)\([^,()]*,[^,()]*,\s*["'])(?P<path>/[^"']*)"#,
        ),
    ]
});

static BASE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<base\b").unwrap_or_else(|e| panic!("base regex: {e}")));
static HEAD_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<head\b[^>]*>").unwrap_or_else(|e| panic!("head regex: {e}"))
});

/// True for root-relative paths that do not already live under `prefix`.
fn needs_prefix(path: &str, prefix: &str) -> bool {
    if !path.starts_with('/') || path.starts_with("//") {
        return false;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => !(rest.is_empty() || rest.starts_with(['/', '?', '#'])),
        None => true,
    }
}

/// Rewrite a body of the given kind.
pub fn rewrite(body: &str, prefix: &str, kind: ContentKind) -> String {
    match kind {
        ContentKind::Html => rewrite_html(body, prefix),
        ContentKind::Css => rewrite_css(body, prefix),
    }
}

/// Apply every HTML rule in order, then make sure a `<base>` element exists.
pub fn rewrite_html(html: &str, prefix: &str) -> String {
    let mut out = html.to_string();
    for rule in HTML_RULES.iter() {
        let next = rule.apply(&out, prefix);
        if next != out {
            tracing::trace!(rule = rule.name, "rewrite rule matched");
        }
        out = next;
    }
    insert_base(&out, prefix)
}

/// Stylesheets only carry `url()` references.
pub fn rewrite_css(css: &str, prefix: &str) -> String {
    CSS_URL.apply(css, prefix)
}

/// Insert `<base href="{prefix}/" target="_top">` right after `<head>` unless a
/// `<base>` element is already present. Documents without `<head>` are untouched.
pub fn insert_base(html: &str, prefix: &str) -> String {
    if BASE_TAG.is_match(html) {
        return html.to_string();
    }
    let Some(head) = HEAD_OPEN.find(html) else {
        return html.to_string();
    };
    let mut out = String::with_capacity(html.len() + prefix.len() + 32);
    out.push_str(&html[..head.end()]);
    out.push_str(&format!(r#"<base href="{prefix}/" target="_top">"#));
    out.push_str(&html[head.end()..]);
    out
}
