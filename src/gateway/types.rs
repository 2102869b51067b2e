//! Request parameters and serializable snapshots.
//!
//! Request types mirror the JSON payloads browser clients send (PascalCase
//! field names). Credential-bearing types implement `Debug` by hand so that
//! secrets never reach the logs.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::config::CredentialPolicy;
use super::error::{GatewayError, GatewayResult};

/// Default SSH port when a request omits it
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default terminal rows when a request omits them
pub const DEFAULT_ROWS: u32 = 24;

/// Default terminal columns when a request omits them
pub const DEFAULT_COLS: u32 = 80;

/// Build the registry key for a target: `user:host:port`.
pub fn connection_key(user: &str, host: &str, port: u16) -> String {
    format!("{}:{}:{}", user, host, port)
}

/// Byte buffer holding sensitive material such as a private key.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes(<{} bytes redacted>)", self.0.len())
    }
}

/// One SSH authentication method, tried in list order.
#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    /// Answers keyboard-interactive prompts by matching prompt text.
    KeyboardInteractive {
        challenges: Vec<(String, String)>,
        /// Answer for prompts no challenge matches.
        fallback: Option<String>,
    },
    /// In-memory private key (OpenSSH or PEM encoding).
    PrivateKey(SecretBytes),
    /// Private key file on the gateway host.
    KeyFile(PathBuf),
    /// One-time password minted from a named identity.
    Otp { identity: String, code: String },
    Agent,
}

impl AuthMethod {
    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
            AuthMethod::PrivateKey(_) => "private-key",
            AuthMethod::KeyFile(_) => "key",
            AuthMethod::Otp { .. } => "otp",
            AuthMethod::Agent => "agent",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            AuthMethod::Otp { identity, .. } => f
                .debug_struct("Otp")
                .field("identity", identity)
                .finish_non_exhaustive(),
            AuthMethod::KeyboardInteractive { challenges, .. } => f
                .debug_struct("KeyboardInteractive")
                .field("prompts", &challenges.len())
                .finish_non_exhaustive(),
            other => f.write_str(other.name()),
        }
    }
}

/// Ordered authentication methods for one target.
#[derive(Debug, Clone, Default)]
pub struct AuthSpec {
    pub methods: Vec<AuthMethod>,
}

impl AuthSpec {
    pub fn new(methods: Vec<AuthMethod>) -> Self {
        Self { methods }
    }

    pub fn password(password: impl Into<String>) -> Self {
        Self::new(vec![AuthMethod::Password(password.into())])
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl ConnectTarget {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }

    /// Registry key `user:host:port`.
    pub fn key(&self) -> String {
        connection_key(&self.username, &self.host, self.port)
    }
}

/// How the registry treats an occupied key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolvePolicy {
    /// Return the live connection when the fingerprint matches.
    #[default]
    Reuse,
    /// Always dial and take over the key.
    Replace,
}

/// PTY size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub rows: u32,
    pub cols: u32,
}

impl Dimensions {
    /// Zero values fall back to 24x80.
    pub fn new(rows: u32, cols: u32) -> Self {
        Self {
            rows: if rows == 0 { DEFAULT_ROWS } else { rows },
            cols: if cols == 0 { DEFAULT_COLS } else { cols },
        }
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::new(DEFAULT_ROWS, DEFAULT_COLS)
    }
}

/// Connect request payload.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConnectParams {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub pass: Option<String>,
    /// Name of an OTP identity whose current code is used as the password.
    pub otp: Option<String>,
    pub challenges: Vec<String>,
    pub challenge_passwords: Vec<String>,
    /// Private key path on the tunnel parent host (route requests only).
    pub private_key_path: Option<String>,
    /// Private key path on the gateway host.
    pub key_file: Option<String>,
    pub rows: u32,
    pub cols: u32,
    pub reuse: Option<bool>,
}

impl ConnectParams {
    pub fn target(&self) -> ConnectTarget {
        ConnectTarget::new(
            self.host.clone(),
            self.port.unwrap_or(DEFAULT_SSH_PORT),
            self.user.clone(),
        )
    }

    pub fn key(&self) -> String {
        self.target().key()
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.rows, self.cols)
    }

    pub fn policy(&self) -> ResolvePolicy {
        if self.reuse.unwrap_or(true) {
            ResolvePolicy::Reuse
        } else {
            ResolvePolicy::Replace
        }
    }

    /// Build the ordered auth methods.
    ///
    /// Order: keyboard-interactive challenges, password, OTP, fetched key,
    /// key file. Key files and the agent fallback are gateway-host
    /// credentials and are only used as far as `credentials` permits. A
    /// request that ends up with no method is refused.
    pub fn auth_spec(
        &self,
        credentials: &CredentialPolicy,
        otp_code: Option<String>,
        fetched_key: Option<SecretBytes>,
    ) -> GatewayResult<AuthSpec> {
        let mut methods = Vec::new();

        if !self.challenges.is_empty() {
            let challenges = self
                .challenges
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let answer = self.challenge_passwords.get(i).cloned().unwrap_or_default();
                    (c.clone(), answer)
                })
                .collect();
            methods.push(AuthMethod::KeyboardInteractive {
                challenges,
                fallback: otp_code.clone(),
            });
        }

        if let Some(pass) = self.pass.as_ref().filter(|p| !p.is_empty()) {
            methods.push(AuthMethod::Password(pass.clone()));
        }

        if let (Some(identity), Some(code)) = (self.otp.as_ref(), otp_code) {
            methods.push(AuthMethod::Otp {
                identity: identity.clone(),
                code,
            });
        }

        if let Some(key) = fetched_key.filter(|k| !k.is_empty()) {
            methods.push(AuthMethod::PrivateKey(key));
        }

        if let Some(path) = self.key_file.as_deref().filter(|p| !p.is_empty()) {
            methods.push(AuthMethod::KeyFile(credentials.key_file(path)?));
        }

        if methods.is_empty() {
            if !credentials.allow_agent {
                return Err(GatewayError::InvalidRequest(format!(
                    "No credentials supplied for {}",
                    self.key()
                )));
            }
            methods.push(AuthMethod::Agent);
        }

        Ok(AuthSpec::new(methods))
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("otp", &self.otp)
            .field("challenges", &self.challenges)
            .field("private_key_path", &self.private_key_path)
            .field("key_file", &self.key_file)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("reuse", &self.reuse)
            .finish_non_exhaustive()
    }
}

/// Route request payload: connect to `target` through `parent`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RouteParams {
    pub parent: ConnectParams,
    pub target: ConnectParams,
}

/// Share grant payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShareParams {
    #[serde(rename = "ID", alias = "Id")]
    pub id: String,
    #[serde(rename = "Write")]
    pub write: bool,
}

/// Resize payload.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ResizeParams {
    pub rows: u32,
    pub cols: u32,
}

/// One-shot command payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecParams {
    /// Connection key; defaults to the requesting session's terminal connection.
    pub key: Option<String>,
    pub command: String,
}

/// Terminal snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalInfo {
    pub id: String,
    pub connection_key: String,
    pub dimensions: Dimensions,
    pub consumers: Vec<String>,
    pub readers: Vec<String>,
    pub writers: Vec<String>,
}

/// Connection snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub key: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub fingerprint: String,
    pub leases: usize,
    pub sub_sessions: Vec<String>,
    pub connected_at: String,
    /// Parent connection key when this connection runs through a route.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routed_via: Option<String>,
}
