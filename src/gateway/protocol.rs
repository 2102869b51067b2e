//! Request addressing used by the front end.
//!
//! A client opens `/ws/{sessionName}/{command}/{action}/{params}` where
//! `command` is `ssh`, `action` names a gateway operation and `params` is
//! a JSON object with PascalCase field names.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;

use super::error::{GatewayError, GatewayResult};

/// Only command family served by the gateway.
pub const SSH_COMMAND: &str = "ssh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Init,
    Exec,
    Route,
    AllowShareSession,
    ShareSession,
    Resize,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Init => "init",
            Action::Exec => "exec",
            Action::Route => "route",
            Action::AllowShareSession => "allow-share-session",
            Action::ShareSession => "share-session",
            Action::Resize => "resize",
        }
    }
}

impl FromStr for Action {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" | "ssh" => Ok(Action::Init),
            "exec" => Ok(Action::Exec),
            "route" => Ok(Action::Route),
            "allow-share-session" => Ok(Action::AllowShareSession),
            "share-session" => Ok(Action::ShareSession),
            "resize" => Ok(Action::Resize),
            other => Err(GatewayError::InvalidRequest(format!(
                "Unknown action: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed front-end request.
#[derive(Debug, Clone)]
pub struct Request {
    pub session_name: String,
    pub action: Action,
    params: String,
}

impl Request {
    pub fn parse(
        session_name: &str,
        command: &str,
        action: &str,
        params: &str,
    ) -> GatewayResult<Self> {
        if session_name.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "Session name is required".to_string(),
            ));
        }
        if command != SSH_COMMAND {
            return Err(GatewayError::InvalidRequest(format!(
                "Unknown command: {}",
                command
            )));
        }

        Ok(Self {
            session_name: session_name.to_string(),
            action: action.parse()?,
            params: params.to_string(),
        })
    }

    /// Decode the JSON payload. An empty payload yields the defaults.
    pub fn params<T: DeserializeOwned + Default>(&self) -> GatewayResult<T> {
        let raw = self.params.trim();
        if raw.is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(raw).map_err(|e| {
            GatewayError::InvalidRequest(format!("Malformed {} params: {}", self.action, e))
        })
    }
}
