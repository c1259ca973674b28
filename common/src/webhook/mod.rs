// Webhook delivery subsystem: payload signing, delivery with retry, and
// tenant webhook registrations.

pub mod delivery;
pub mod service;

pub use delivery::{
    deliver_with_retry, DeliveryGuard, DeliveryReceipt, DeliveryReport, DeliveryTarget,
    WebhookDeliverer,
};
pub use service::{WebhookService, WebhookTestResult};

use crate::errors::ValidationError;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// Headers callers may never set on a signed delivery
pub const RESERVED_HEADERS: [&str; 6] = [
    "content-type",
    "user-agent",
    "x-webhook-signature",
    "x-webhook-event",
    "x-webhook-timestamp",
    "x-webhook-attempt",
];

/// Generate a secure secret key for webhook signatures
///
/// 32 random bytes, hex encoded.
pub fn generate_webhook_secret() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: [u8; 32] = rng.gen();
    hex::encode(random_bytes)
}

/// Compute the hex-encoded HMAC-SHA256 of a serialized payload
///
/// # Arguments
/// * `payload` - The exact body bytes that will be sent
/// * `secret` - The webhook secret key
pub fn sign_payload(payload: &[u8], secret: &str) -> Result<String, ValidationError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
        ValidationError::InvalidFieldValue {
            field: "secret".to_string(),
            reason: format!("Invalid secret key: {}", e),
        }
    })?;

    mac.update(payload);

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Validate an HMAC-SHA256 signature for a webhook body
///
/// # Returns
/// * `Ok(true)` if signature is valid
/// * `Ok(false)` if signature is invalid
/// * `Err` if the secret cannot be used as a key
pub fn verify_signature(
    payload: &[u8],
    signature: &str,
    secret: &str,
) -> Result<bool, ValidationError> {
    let expected_hex = sign_payload(payload, secret)?;
    let provided = signature.trim().to_ascii_lowercase();

    // Constant-time comparison
    Ok(expected_hex.as_bytes().ct_eq(provided.as_bytes()).into())
}

pub fn is_reserved_header(name: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_webhook_secret() {
        let secret1 = generate_webhook_secret();
        let secret2 = generate_webhook_secret();

        assert_ne!(secret1, secret2);
        assert_eq!(secret1.len(), 64);
        assert!(hex::decode(&secret1).is_ok());
    }

    #[test]
    fn test_sign_matches_reference_hmac() {
        let payload = b"test payload";
        let secret = "test_secret_key";

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        let reference = hex::encode(mac.finalize().into_bytes());

        assert_eq!(sign_payload(payload, secret).unwrap(), reference);
    }

    #[test]
    fn test_verify_signature_valid() {
        let payload = br#"{"event":"job.completed"}"#;
        let signature = sign_payload(payload, "s3cret").unwrap();
        assert!(verify_signature(payload, &signature, "s3cret").unwrap());
        assert!(verify_signature(payload, &signature.to_uppercase(), "s3cret").unwrap());
    }

    #[test]
    fn test_verify_signature_invalid() {
        let payload = b"test payload";
        let wrong_signature = "0000000000000000000000000000000000000000000000000000000000000000";
        assert!(!verify_signature(payload, wrong_signature, "test_secret_key").unwrap());
        assert!(!verify_signature(payload, "short", "test_secret_key").unwrap());
    }

    #[test]
    fn test_verify_signature_different_secret() {
        let payload = b"test payload";
        let signature = sign_payload(payload, "secret-a").unwrap();
        assert!(!verify_signature(payload, &signature, "secret-b").unwrap());
    }

    #[test]
    fn test_reserved_headers_case_insensitive() {
        assert!(is_reserved_header("x-webhook-signature"));
        assert!(is_reserved_header("User-Agent"));
        assert!(!is_reserved_header("X-Request-Id"));
    }
}
