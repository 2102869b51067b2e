//! Keyboard-interactive SSH authentication.
//!
//! The server sends rounds of prompts; each prompt is answered from the
//! configured challenge list by prompt text. Servers commonly decorate
//! prompts with trailing whitespace, so a trimmed comparison is tried after
//! the exact one. Prompts nothing matches get the fallback answer (an OTP
//! code, when one was minted) or the empty string.

use async_trait::async_trait;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use tracing::debug;

use crate::gateway::session::GatewayClientHandler;

use super::traits::AuthStrategy;

/// Upper bound on info-request rounds before giving up.
const MAX_ROUNDS: usize = 8;

pub struct KeyboardInteractiveAuth {
    challenges: Vec<(String, String)>,
    fallback: Option<String>,
}

impl KeyboardInteractiveAuth {
    pub fn new(challenges: Vec<(String, String)>, fallback: Option<String>) -> Self {
        Self {
            challenges,
            fallback,
        }
    }

    /// Pick the answer for one prompt.
    pub(crate) fn answer(&self, prompt: &str) -> String {
        if let Some((_, answer)) = self.challenges.iter().find(|(c, _)| c == prompt) {
            return answer.clone();
        }

        let trimmed = prompt.trim();
        if let Some((_, answer)) = self.challenges.iter().find(|(c, _)| c.trim() == trimmed) {
            return answer.clone();
        }

        self.fallback.clone().unwrap_or_default()
    }
}

#[async_trait]
impl AuthStrategy for KeyboardInteractiveAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<GatewayClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await
            .map_err(|e| format!("Keyboard-interactive start failed: {}", e))?;

        for round in 0..MAX_ROUNDS {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    debug!(
                        "Keyboard-interactive round {} with {} prompt(s)",
                        round + 1,
                        prompts.len()
                    );

                    let answers: Vec<String> =
                        prompts.iter().map(|p| self.answer(&p.prompt)).collect();

                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(|e| format!("Keyboard-interactive respond failed: {}", e))?;
                }
            }
        }

        Err(format!(
            "Keyboard-interactive authentication exceeded {} rounds",
            MAX_ROUNDS
        ))
    }

    fn name(&self) -> &'static str {
        "keyboard-interactive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> KeyboardInteractiveAuth {
        KeyboardInteractiveAuth::new(
            vec![
                ("Password: ".to_string(), "pw1".to_string()),
                ("Verification code:".to_string(), "424242".to_string()),
            ],
            None,
        )
    }

    #[test]
    fn test_exact_prompt_match() {
        assert_eq!(auth().answer("Password: "), "pw1");
    }

    #[test]
    fn test_trimmed_prompt_match() {
        assert_eq!(auth().answer("Verification code: "), "424242");
        assert_eq!(auth().answer("Password:"), "pw1");
    }

    #[test]
    fn test_unknown_prompt_without_fallback_is_empty() {
        assert_eq!(auth().answer("Favourite colour?"), "");
    }

    #[test]
    fn test_unknown_prompt_uses_fallback() {
        let auth = KeyboardInteractiveAuth::new(Vec::new(), Some("999000".to_string()));
        assert_eq!(auth.answer("Token: "), "999000");
    }

    #[test]
    fn test_name() {
        assert_eq!(auth().name(), "keyboard-interactive");
    }
}
