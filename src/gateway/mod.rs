//! SSH terminal multiplexing gateway.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Request parameters and serializable snapshots
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy and connect-failure classification
//! - `auth`: Authentication strategies tried in order per connection
//! - `session`: russh client handler
//! - `client`: russh-backed connector and transport
//! - `transport`: Transport traits the core is written against
//! - `fingerprint`: Connection identity digests
//! - `connection`: One shared SSH connection and its leases
//! - `storage`: Connection registry and terminal store
//! - `fanout`: Publisher/consumer queues between a terminal and its clients
//! - `terminal`: Shared PTY sessions with per-client permissions
//! - `adapter`: Client endpoint trait and the pumps bridging it to a consumer
//! - `forward`: SSH hop chaining through a parent connection (feature-gated)
//! - `otp`: One-time-password collaborator seam
//! - `protocol`: Front-end request addressing
//! - `commands`: The `Gateway` facade

pub mod adapter;
pub(crate) mod auth;
pub mod client;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod fingerprint;
#[cfg(feature = "tunnel")]
pub mod forward;
pub mod otp;
pub mod protocol;
pub(crate) mod session;
pub mod storage;
pub mod terminal;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;
pub mod types;

pub use adapter::{EndpointError, MessageEndpoint};
pub use commands::{Gateway, Reply};
pub use config::{CredentialPolicy, GatewayConfig};
pub use error::{GatewayError, GatewayResult};
