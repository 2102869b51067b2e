//! Authentication chain for trying multiple strategies.

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::gateway::session::GatewayClientHandler;
use crate::gateway::types::{AuthMethod, AuthSpec};

use super::traits::AuthStrategy;
use super::{AgentAuth, KeyAuth, KeyboardInteractiveAuth, PasswordAuth};

/// Authentication chain that tries strategies in the order they were added.
///
/// The first success stops the chain. When every strategy fails, the last
/// failure is reported.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Build a chain from the ordered methods of a connect request.
    ///
    /// An OTP method is offered both as a password and as the answer to
    /// every keyboard-interactive prompt, since servers differ in which one
    /// they ask the code through.
    pub fn from_spec(spec: &AuthSpec) -> Self {
        let mut chain = Self::new();

        for method in &spec.methods {
            chain = match method {
                AuthMethod::Password(password) => chain.with(PasswordAuth::new(password.clone())),
                AuthMethod::KeyboardInteractive {
                    challenges,
                    fallback,
                } => chain.with(KeyboardInteractiveAuth::new(
                    challenges.clone(),
                    fallback.clone(),
                )),
                AuthMethod::PrivateKey(key) => chain.with(KeyAuth::from_memory(key.clone())),
                AuthMethod::KeyFile(path) => chain.with(KeyAuth::from_file(path.clone())),
                AuthMethod::Otp { code, .. } => chain
                    .with(PasswordAuth::otp(code.clone()))
                    .with(KeyboardInteractiveAuth::new(Vec::new(), Some(code.clone()))),
                AuthMethod::Agent => chain.with(AgentAuth::new()),
            };
        }

        chain
    }

    /// Append a strategy.
    pub fn with(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    #[cfg(test)]
    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<GatewayClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No authentication strategies configured".to_string());
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!(
                        "Authentication succeeded with strategy: {}",
                        strategy.name()
                    );
                    return Ok(true);
                }
                Ok(false) => {
                    debug!("Authentication failed with strategy: {}", strategy.name());
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => {
                    debug!(
                        "Authentication error with strategy {}: {}",
                        strategy.name(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "All authentication methods failed".to_string()))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
