//! Reverse HTTP tunnel over a single duplex connection.
//!
//! Provides two roles:
//!
//! - **Relay**: public HTTP server. Accepts agent registrations over WS and
//!   forwards every request under the tunnel prefix to the active agent.
//! - **Agent**: connects outbound to a relay and answers forwarded requests
//!   by calling the local web application.
//!
//! Both sides exchange JSON [`envelope::Envelope`]s; bodies are carried using
//! the encodings in [`codec`].

pub mod agent;
pub mod codec;
pub mod envelope;
pub mod multiplexer;
pub mod registry;
pub mod relay;
