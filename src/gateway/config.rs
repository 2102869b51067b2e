//! Configuration resolution for the SSH gateway.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GATEWAY_PORT` | 8080 | Front-end listen port |
//! | `GATEWAY_BIND` | 0.0.0.0 | Front-end bind address |
//! | `SSH_CONNECT_TIMEOUT` | 30s | Dial and handshake timeout in seconds |
//! | `SSH_COMPRESSION` | true | Enable zlib compression |
//! | `SSH_KEEPALIVE_INTERVAL` | 30s | Transport keepalive interval in seconds |
//! | `GATEWAY_QUEUE_CAPACITY` | 1024 | Per-consumer message queue bound |
//! | `GATEWAY_ALLOW_AGENT` | false | Let requests without credentials use the gateway's SSH agent |
//! | `GATEWAY_KEY_DIR` | unset | Directory client-named key files must live in; unset disables key files |

use std::env;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use super::error::{GatewayError, GatewayResult};

/// Default front-end listen port
pub(crate) const DEFAULT_PORT: u16 = 8080;

/// Default front-end bind address
pub(crate) const DEFAULT_BIND: &str = "0.0.0.0";

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default keepalive interval in seconds
pub(crate) const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// Default bound of each consumer queue
pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub(crate) const PORT_ENV_VAR: &str = "GATEWAY_PORT";
pub(crate) const BIND_ENV_VAR: &str = "GATEWAY_BIND";
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";
pub(crate) const KEEPALIVE_ENV_VAR: &str = "SSH_KEEPALIVE_INTERVAL";
pub(crate) const QUEUE_CAPACITY_ENV_VAR: &str = "GATEWAY_QUEUE_CAPACITY";
pub(crate) const ALLOW_AGENT_ENV_VAR: &str = "GATEWAY_ALLOW_AGENT";
pub(crate) const KEY_DIR_ENV_VAR: &str = "GATEWAY_KEY_DIR";

/// Read and parse an environment variable, ignoring unparsable values.
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Resolve the listen port with priority: parameter -> env var -> default
pub(crate) fn resolve_port(port_param: Option<u16>) -> u16 {
    port_param
        .or_else(|| env_parse(PORT_ENV_VAR))
        .unwrap_or(DEFAULT_PORT)
}

/// Resolve the bind address with priority: parameter -> env var -> default
pub(crate) fn resolve_bind(bind_param: Option<&str>) -> String {
    if let Some(bind) = bind_param {
        return bind.to_string();
    }

    match env::var(BIND_ENV_VAR) {
        Ok(bind) if !bind.trim().is_empty() => bind.trim().to_string(),
        _ => DEFAULT_BIND.to_string(),
    }
}

/// Resolve the connection timeout value with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> u64 {
    timeout_param
        .or_else(|| env_parse(CONNECT_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS)
}

/// Resolve the keepalive interval with priority: parameter -> env var -> default
pub(crate) fn resolve_keepalive(keepalive_param: Option<u64>) -> u64 {
    keepalive_param
        .or_else(|| env_parse(KEEPALIVE_ENV_VAR))
        .unwrap_or(DEFAULT_KEEPALIVE_SECS)
}

/// Resolve the consumer queue capacity with priority: parameter -> env var -> default.
///
/// Zero is rejected at every tier since a bounded queue needs room for one message.
pub(crate) fn resolve_queue_capacity(capacity_param: Option<usize>) -> usize {
    capacity_param
        .filter(|c| *c > 0)
        .or_else(|| env_parse::<usize>(QUEUE_CAPACITY_ENV_VAR).filter(|c| *c > 0))
        .unwrap_or(DEFAULT_QUEUE_CAPACITY)
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

/// Resolve the agent fallback with priority: parameter -> env var -> default (false)
pub(crate) fn resolve_allow_agent(allow_param: Option<bool>) -> bool {
    if let Some(allow) = allow_param {
        return allow;
    }

    match env::var(ALLOW_AGENT_ENV_VAR) {
        Ok(value) => value.eq_ignore_ascii_case("true") || value == "1",
        Err(_) => false,
    }
}

/// Resolve the key file directory with priority: parameter -> env var -> none
pub(crate) fn resolve_key_dir(dir_param: Option<&str>) -> Option<PathBuf> {
    dir_param
        .map(str::to_string)
        .or_else(|| env::var(KEY_DIR_ENV_VAR).ok())
        .map(|dir| dir.trim().to_string())
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
}

/// Gateway-host credentials a client request may draw on.
///
/// Both are off by default, so a request must carry its own password, OTP
/// identity, challenge answers or tunnel-fetched key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialPolicy {
    /// Use the gateway's SSH agent when a request names no credential.
    pub allow_agent: bool,
    /// Directory key files must resolve inside. `None` disables key files.
    pub key_dir: Option<PathBuf>,
}

impl CredentialPolicy {
    pub fn from_env() -> Self {
        Self {
            allow_agent: resolve_allow_agent(None),
            key_dir: resolve_key_dir(None),
        }
    }

    /// Resolve a client-named key file against the allowed directory.
    ///
    /// Relative paths are taken relative to the directory. Paths with `..`
    /// components or outside the directory are refused.
    pub fn key_file(&self, requested: &str) -> GatewayResult<PathBuf> {
        let Some(dir) = self.key_dir.as_ref() else {
            return Err(GatewayError::InvalidRequest(
                "Key files are not enabled on this gateway".to_string(),
            ));
        };

        let path = Path::new(requested);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            dir.join(path)
        };

        if resolved
            .components()
            .any(|c| matches!(c, Component::ParentDir))
            || !resolved.starts_with(dir)
        {
            return Err(GatewayError::InvalidRequest(format!(
                "Key file {} is outside the allowed directory",
                requested
            )));
        }

        Ok(resolved)
    }
}

/// Resolved settings for one gateway instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub compression: bool,
    pub keepalive_interval: Duration,
    pub queue_capacity: usize,
    pub credentials: CredentialPolicy,
}

impl GatewayConfig {
    /// Resolve every setting from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind: resolve_bind(None),
            port: resolve_port(None),
            connect_timeout: Duration::from_secs(resolve_connect_timeout(None)),
            compression: resolve_compression(None),
            keepalive_interval: Duration::from_secs(resolve_keepalive(None)),
            queue_capacity: resolve_queue_capacity(None),
            credentials: CredentialPolicy::from_env(),
        }
    }

    /// Socket address string for the front-end listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            compression: true,
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            credentials: CredentialPolicy::default(),
        }
    }
}
