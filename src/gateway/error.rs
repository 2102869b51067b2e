//! Error taxonomy for the gateway.
//!
//! Setup failures (dial, handshake, PTY allocation, tunnel prerequisites) are
//! returned synchronously to the caller. Failures inside background pump
//! tasks are never surfaced through this type; they tear down the owning
//! terminal or bridge instead.
//!
//! # Connect failure classification
//!
//! russh reports most dial and handshake problems as free-form text. The
//! [`ConnectFailure`] kind is derived from that text so a front end can tell
//! a user "wrong password" apart from "host unreachable":
//!
//! 1. **Authentication**: credential or permission problems. Checked first, so
//!    "timeout during authentication failed" is an authentication failure.
//! 2. **Timeout**: the dial or handshake exceeded the connect timeout.
//! 3. **Network**: everything else.

use serde::Serialize;
use thiserror::Error;

/// Authentication error patterns.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "authentication rejected",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "keyboard-interactive",
];

/// Timeout error patterns.
const TIMEOUT_ERRORS: &[&str] = &["timed out", "timeout"];

/// Why a dial or handshake failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailure {
    Network,
    Authentication,
    Timeout,
}

impl ConnectFailure {
    /// Classify a failure message.
    pub fn classify(reason: &str) -> Self {
        let lower = reason.to_lowercase();

        if AUTH_ERRORS.iter().any(|p| lower.contains(p)) {
            return ConnectFailure::Authentication;
        }

        if TIMEOUT_ERRORS.iter().any(|p| lower.contains(p)) {
            return ConnectFailure::Timeout;
        }

        ConnectFailure::Network
    }
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectFailure::Network => "network",
            ConnectFailure::Authentication => "authentication",
            ConnectFailure::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

/// Errors returned by gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Dial or SSH handshake failure.
    #[error("Failed to connect to {target} ({kind}): {reason}")]
    Connect {
        target: String,
        reason: String,
        kind: ConnectFailure,
    },

    /// PTY or sub-session creation failure.
    #[error("Session error: {0}")]
    Session(String),

    /// Client id is not in the terminal's allow lists.
    #[error("Client {client} is not allowed on terminal {terminal}")]
    PermissionDenied { terminal: String, client: String },

    /// Operation addressed to a connection or terminal that does not exist.
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    /// Route requested without a resolved parent connection.
    #[error("Tunnel parent {0} is not connected")]
    TunnelPrerequisiteMissing(String),

    /// Byte bridge failure inside a tunnel.
    #[error("Forwarding error: {0}")]
    Forward(String),

    /// A live connection at this key was created with different credentials.
    #[error("Connection {0} exists with a different identity")]
    IdentityMismatch(String),

    /// A terminal with this id is already open.
    #[error("Terminal {0} already exists")]
    TerminalExists(String),

    /// The one-time-password collaborator failed.
    #[error("OTP error: {0}")]
    Otp(String),

    /// Malformed request from the front end.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Build a [`GatewayError::Connect`] with a classified failure kind.
    pub fn connect(target: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        GatewayError::Connect {
            target: target.into(),
            kind: ConnectFailure::classify(&reason),
            reason,
        }
    }

    /// Short machine-readable code for front ends.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Connect { .. } => "connect_error",
            GatewayError::Session(_) => "session_error",
            GatewayError::PermissionDenied { .. } => "permission_denied",
            GatewayError::UnknownKey(_) => "unknown_key",
            GatewayError::TunnelPrerequisiteMissing(_) => "tunnel_prerequisite_missing",
            GatewayError::Forward(_) => "forward_error",
            GatewayError::IdentityMismatch(_) => "identity_mismatch",
            GatewayError::TerminalExists(_) => "terminal_exists",
            GatewayError::Otp(_) => "otp_error",
            GatewayError::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<russh::Error> for GatewayError {
    fn from(err: russh::Error) -> Self {
        GatewayError::Session(err.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
