//! russh client handler for gateway connections.
//!
//! `GatewayClientHandler` accepts every server host key (similar to
//! `StrictHostKeyChecking=no` in OpenSSH) and records the key's SHA-256
//! fingerprint at debug level so operators can audit which keys were seen.

use russh::{client, keys};
use tracing::debug;

/// Client handler for russh that accepts all host keys.
pub struct GatewayClientHandler {
    target: String,
}

impl GatewayClientHandler {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl client::Handler for GatewayClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Accepting host key for {}: {}",
            self.target,
            server_public_key.fingerprint(keys::HashAlg::Sha256)
        );
        Ok(true)
    }
}
