//! Authentication strategies for SSH connections.
//!
//! Each auth method a connect request names maps to one [`AuthStrategy`];
//! an [`AuthChain`] tries them in request order and stops at the first
//! success.
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: Password (also used for OTP codes)
//! - [`KeyboardInteractiveAuth`]: Challenge/answer prompts
//! - [`KeyAuth`]: Private key from a file or from memory
//! - [`AgentAuth`]: SSH agent identities
//!
//! # Example
//!
//! ```ignore
//! use crate::gateway::auth::AuthChain;
//!
//! let chain = AuthChain::from_spec(&params.auth_spec(&config.credentials, None, None)?);
//! let ok = chain.authenticate(&mut handle, "username").await?;
//! ```

mod agent;
mod chain;
mod key;
mod keyboard;
mod password;
mod traits;

pub use agent::AgentAuth;
pub use chain::AuthChain;
pub use key::{KeyAuth, KeySource};
pub use keyboard::KeyboardInteractiveAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
