//! Connection identity fingerprints.
//!
//! A fingerprint digests the target (host, port, username) and every auth
//! method in order. Two requests reuse one connection only when their
//! fingerprints are equal. OTP methods contribute the identity name rather
//! than the short-lived code.

use std::fmt;

use sha2::{Digest, Sha256};

use super::types::{AuthMethod, AuthSpec, ConnectTarget};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest a target and its ordered auth methods.
    pub fn compute(target: &ConnectTarget, auth: &AuthSpec) -> Self {
        let mut hasher = Sha256::new();

        component(&mut hasher, b"HOST", target.host.as_bytes());
        component(&mut hasher, b"PORT", &target.port.to_be_bytes());
        component(&mut hasher, b"USER", target.username.as_bytes());

        for method in &auth.methods {
            match method {
                AuthMethod::Password(password) => {
                    component(&mut hasher, b"PASS", password.as_bytes())
                }
                AuthMethod::KeyboardInteractive { challenges, .. } => {
                    for (challenge, answer) in challenges {
                        component(&mut hasher, b"KBI", challenge.as_bytes());
                        component(&mut hasher, b"KBI-ANSWER", answer.as_bytes());
                    }
                }
                AuthMethod::PrivateKey(key) => component(&mut hasher, b"KEY", key.expose()),
                AuthMethod::KeyFile(path) => {
                    component(&mut hasher, b"KEYFILE", path.to_string_lossy().as_bytes())
                }
                AuthMethod::Otp { identity, .. } => {
                    component(&mut hasher, b"OTP", identity.as_bytes())
                }
                AuthMethod::Agent => component(&mut hasher, b"AGENT", &[]),
            }
        }

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// First 12 hex digits, enough to tell identities apart in logs.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

fn component(hasher: &mut Sha256, tag: &[u8], value: &[u8]) {
    hasher.update((tag.len() as u32).to_be_bytes());
    hasher.update(tag);
    hasher.update((value.len() as u32).to_be_bytes());
    hasher.update(value);
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}
