//! Password-based SSH authentication.

use async_trait::async_trait;
use russh::client;

use crate::gateway::session::GatewayClientHandler;

use super::traits::AuthStrategy;

/// Password authentication strategy.
///
/// Also carries one-time codes minted by the OTP collaborator, in which case
/// it reports itself as `otp` in logs.
pub struct PasswordAuth {
    password: String,
    label: &'static str,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            label: "password",
        }
    }

    /// Password strategy for a one-time code.
    pub fn otp(code: impl Into<String>) -> Self {
        Self {
            password: code.into(),
            label: "otp",
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<GatewayClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| format!("Password authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        self.label
    }
}
