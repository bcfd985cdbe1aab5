//! Webhook payload signature verification.
//!
//! The identity provider signs each delivery with HMAC-SHA256 over
//! `"{id}.{timestamp}.{body}"` using a base64 secret carried behind a
//! `whsec_` prefix. The signature header holds a space-separated list of
//! `v1,<base64>` entries; verification succeeds if any entry matches.
//! Verification is mandatory before any event dispatch.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::IdentityError;

/// Maximum accepted skew between the delivery timestamp and local time,
/// in seconds. Rejects replayed deliveries with stale signatures.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// The signature scheme version this verifier understands.
const SIGNATURE_VERSION: &str = "v1";

/// The three signature headers required on every webhook delivery.
#[derive(Debug, Clone)]
pub struct SignatureHeaders<'a> {
    /// Unique delivery id, also used for de-duplication upstream.
    pub id: &'a str,
    /// Unix-seconds timestamp of the delivery.
    pub timestamp: &'a str,
    /// Space-separated `v1,<base64>` signature list.
    pub signature: &'a str,
}

/// Verifies a raw webhook payload against its signature headers.
///
/// # Errors
///
/// `IdentityError::StaleTimestamp` when the delivery timestamp is outside
/// the tolerance window, `IdentityError::MalformedSecret` when the signing
/// secret cannot be decoded, `IdentityError::InvalidSignature` when no
/// header entry matches the computed signature.
pub fn verify_webhook_signature(
    secret: &str,
    headers: &SignatureHeaders<'_>,
    payload: &[u8],
) -> Result<(), IdentityError> {
    verify_at(secret, headers, payload, chrono::Utc::now().timestamp())
}

/// As [`verify_webhook_signature`], with an explicit "now" for tests.
pub fn verify_at(
    secret: &str,
    headers: &SignatureHeaders<'_>,
    payload: &[u8],
    now_unix_secs: i64,
) -> Result<(), IdentityError> {
    let timestamp: i64 = headers
        .timestamp
        .parse()
        .map_err(|_| IdentityError::StaleTimestamp)?;
    if (now_unix_secs - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
        return Err(IdentityError::StaleTimestamp);
    }

    let expected = sign(secret, headers.id, headers.timestamp, payload)?;

    for entry in headers.signature.split(' ') {
        let Some((version, candidate)) = entry.split_once(',') else {
            continue;
        };
        if version == SIGNATURE_VERSION && candidate == expected {
            return Ok(());
        }
    }

    Err(IdentityError::InvalidSignature)
}

/// Computes the base64 signature for a delivery. Exposed so tests (and a
/// local delivery simulator) can produce valid headers.
pub fn sign(
    secret: &str,
    id: &str,
    timestamp: &str,
    payload: &[u8],
) -> Result<String, IdentityError> {
    let encoded_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let key = base64::engine::general_purpose::STANDARD
        .decode(encoded_key)
        .map_err(|e| IdentityError::MalformedSecret(e.to_string()))?;

    let mut mac = Hmac::<Sha256>::new_from_slice(&key)
        .map_err(|e| IdentityError::MalformedSecret(e.to_string()))?;
    mac.update(id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);

    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_dGVzdC1zaWduaW5nLXNlY3JldA=="; // "test-signing-secret"

    fn signed_headers<'a>(
        id: &'a str,
        timestamp: &'a str,
        payload: &[u8],
        signature: &'a mut String,
    ) -> SignatureHeaders<'a> {
        *signature = format!(
            "{SIGNATURE_VERSION},{}",
            sign(SECRET, id, timestamp, payload).expect("sign should succeed")
        );
        SignatureHeaders {
            id,
            timestamp,
            signature,
        }
    }

    #[test]
    fn valid_signature_verifies() {
        let payload = br#"{"type":"user.created"}"#;
        let mut sig = String::new();
        let headers = signed_headers("msg_1", "1700000000", payload, &mut sig);
        verify_at(SECRET, &headers, payload, 1_700_000_010).expect("should verify");
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = br#"{"type":"user.created"}"#;
        let mut sig = String::new();
        let headers = signed_headers("msg_1", "1700000000", payload, &mut sig);
        let err = verify_at(SECRET, &headers, br#"{"type":"user.deleted"}"#, 1_700_000_010)
            .expect_err("tampered payload must fail");
        assert!(matches!(err, IdentityError::InvalidSignature));
    }

    #[test]
    fn signature_list_with_one_valid_entry_verifies() {
        let payload = b"body";
        let valid = sign(SECRET, "msg_2", "1700000000", payload).expect("sign");
        let list = format!("v1,AAAAinvalid v1,{valid}");
        let headers = SignatureHeaders {
            id: "msg_2",
            timestamp: "1700000000",
            signature: &list,
        };
        verify_at(SECRET, &headers, payload, 1_700_000_000).expect("should verify");
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = b"body";
        let mut sig = String::new();
        let headers = signed_headers("msg_3", "1700000000", payload, &mut sig);
        let err = verify_at(SECRET, &headers, payload, 1_700_000_000 + 301)
            .expect_err("stale delivery must fail");
        assert!(matches!(err, IdentityError::StaleTimestamp));
    }

    #[test]
    fn unknown_signature_version_is_ignored() {
        let payload = b"body";
        let valid = sign(SECRET, "msg_4", "1700000000", payload).expect("sign");
        let list = format!("v2,{valid}");
        let headers = SignatureHeaders {
            id: "msg_4",
            timestamp: "1700000000",
            signature: &list,
        };
        let err = verify_at(SECRET, &headers, payload, 1_700_000_000)
            .expect_err("v2-only signature must fail");
        assert!(matches!(err, IdentityError::InvalidSignature));
    }
}
