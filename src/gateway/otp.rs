//! One-time-password collaborator seam.
//!
//! The OTP subsystem lives outside the gateway; connect requests that name
//! an OTP identity call through this trait to obtain the current code.

use async_trait::async_trait;

use super::error::{GatewayError, GatewayResult};

#[async_trait]
pub trait OtpProvider: Send + Sync {
    /// Current code for the named identity.
    async fn generate_code_from_name(&self, name: &str) -> GatewayResult<String>;
}

/// Provider used when no OTP backend is configured.
pub struct NoOtp;

#[async_trait]
impl OtpProvider for NoOtp {
    async fn generate_code_from_name(&self, name: &str) -> GatewayResult<String> {
        Err(GatewayError::Otp(format!(
            "No OTP provider configured for identity {}",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_otp_rejects() {
        let err = NoOtp.generate_code_from_name("ops").await.unwrap_err();
        assert!(matches!(err, GatewayError::Otp(_)));
        assert!(err.to_string().contains("ops"));
    }
}
