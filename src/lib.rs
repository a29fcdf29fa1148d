#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! webtunnel library: the relay and agent halves of a reverse HTTP tunnel.
//!
//! - `tunnel`: envelope protocol, relay router, multiplexer, agent session
//! - `cookies`: cookie records, agent cookie jar, relay cookie rewriting
//! - `rewrite`: HTML/CSS reference rewriting under the tunnel prefix
//! - `config`: configuration loading
//! - `error`: relay-side failures and their HTTP mapping
//! - `state`: agent session statistics

pub mod config;
pub mod cookies;
pub mod error;
pub mod rewrite;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::TunnelError;
pub use state::AgentStats;
pub use tunnel::envelope::{Envelope, EnvelopeKind};
pub use tunnel::relay::RelayState;
