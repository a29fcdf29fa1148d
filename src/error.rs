//! Relay-side failure taxonomy and its HTTP mapping.
//!
//! Every variant is surfaced to the original HTTP caller as a status code;
//! nothing here terminates the process or the duplex connection.

use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use thiserror::Error;

/// Page served while no agent is registered.
const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Tunnel Offline</title>
  <style>body { font-family: Arial, sans-serif; margin: 50px; text-align: center; }</style>
</head>
<body>
  <h2>Tunnel Offline</h2>
  <p>No agent connected. Please start the agent on your local machine.</p>
  <p><a href="/status">Check status</a></p>
</body>
</html>
"#;

/// Failures of a single proxied round trip.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No registered agent; nothing was sent.
    #[error("no agent connected")]
    NoAgentConnected,

    /// The agent did not answer within the deadline.
    #[error("agent did not respond within {0}s")]
    RequestTimeout(u64),

    /// The envelope could not be handed to the agent's connection.
    #[error("failed to send request to agent")]
    TransportSendFailure,

    /// The inbound request body could not be read (too large or aborted).
    #[error("failed to read request body: {0}")]
    BodyRead(String),

    /// The agent's response envelope could not be turned into an HTTP response.
    #[error("invalid response from agent: {0}")]
    InvalidResponse(String),
}

impl TunnelError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NoAgentConnected => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::TransportSendFailure | Self::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            Self::BodyRead(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            Self::NoAgentConnected => (status, Html(OFFLINE_PAGE)).into_response(),
            Self::RequestTimeout(_) => (status, "Request timeout").into_response(),
            Self::TransportSendFailure => (status, "Tunnel send error").into_response(),
            other => (
                status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                other.to_string(),
            )
                .into_response(),
        }
    }
}
