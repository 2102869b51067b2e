//! Private key SSH authentication.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::gateway::session::GatewayClientHandler;
use crate::gateway::types::SecretBytes;

use super::traits::AuthStrategy;

/// Where the private key comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Key file on the gateway host.
    File(PathBuf),
    /// Key material already in memory, e.g. fetched from a tunnel parent.
    Memory(SecretBytes),
}

/// Private key authentication strategy.
///
/// Supports passphrase-less keys only.
pub struct KeyAuth {
    source: KeySource,
}

impl KeyAuth {
    pub fn from_file(key_path: impl Into<PathBuf>) -> Self {
        Self {
            source: KeySource::File(key_path.into()),
        }
    }

    pub fn from_memory(key: SecretBytes) -> Self {
        Self {
            source: KeySource::Memory(key),
        }
    }

    fn load(&self) -> Result<keys::PrivateKey, String> {
        match &self.source {
            KeySource::File(path) => keys::load_secret_key(path, None)
                .map_err(|e| format!("Failed to load private key from {:?}: {}", path, e)),
            KeySource::Memory(bytes) => {
                let pem = std::str::from_utf8(bytes.expose())
                    .map_err(|_| "Private key is not valid UTF-8".to_string())?;
                // Never include key material in the error text
                keys::decode_secret_key(pem.trim(), None)
                    .map_err(|e| format!("Failed to decode private key: {}", e))
            }
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<GatewayClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let key_pair = self.load()?;

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        match self.source {
            KeySource::File(_) => "key",
            KeySource::Memory(_) => "private-key",
        }
    }
}
