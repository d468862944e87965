//! HMAC-SHA256 payload signing for webhook delivery.
//!
//! Signatures are computed over the exact serialized payload bytes and sent
//! as `X-Webhook-Signature: sha256=<hex>`. Receivers recompute the HMAC with
//! the shared secret and compare in constant time; [`verify`] does the same
//! for round-trip tests and embedded receivers.
//!
//! # Example
//!
//! ```
//! use courier_signature::{sign, verify};
//!
//! let body = br#"{"event":{"id":"evt-1"}}"#;
//! let signature = sign("my-secret", body);
//! assert!(signature.starts_with("sha256="));
//! assert!(verify("my-secret", body, &signature));
//! assert!(!verify("other-secret", body, &signature));
//! ```

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Scheme prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute `"sha256=" + hex(HMAC-SHA256(secret, body))`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature produced by [`sign`].
///
/// The comparison runs in constant time via the `Mac` trait; malformed
/// signatures (wrong prefix, bad hex) are rejected outright.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_part) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_has_scheme_prefix_and_sha256_length() {
        let sig = sign("k", b"body");
        assert!(sig.starts_with(SIGNATURE_PREFIX));
        // 32 bytes of SHA-256 output = 64 hex characters.
        assert_eq!(sig.len(), SIGNATURE_PREFIX.len() + 64);
    }

    #[test]
    fn signing_is_deterministic() {
        let a = sign("k", b"payload bytes");
        let b = sign("k", b"payload bytes");
        assert_eq!(a, b);
    }

    #[test]
    fn verify_accepts_matching_signature() {
        let body = br#"{"event":{"id":"evt-1","type":"issue.created"}}"#;
        let sig = sign("webhook-secret", body);
        assert!(verify("webhook-secret", body, &sig));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let body = b"payload";
        let sig = sign("key-a", body);
        assert!(!verify("key-b", body, &sig));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let sig = sign("k", b"original");
        assert!(!verify("k", b"tampered", &sig));
    }

    #[test]
    fn verify_rejects_malformed_signatures() {
        let body = b"payload";
        assert!(!verify("k", body, ""));
        assert!(!verify("k", body, "sha256="));
        assert!(!verify("k", body, "sha256=not-hex"));
        assert!(!verify("k", body, "sha1=abcd"));
        // Valid hex but wrong digest.
        assert!(!verify("k", body, &format!("{}{}", SIGNATURE_PREFIX, "ab".repeat(32))));
    }

    #[test]
    fn signature_is_not_a_naive_hash_of_body_and_secret() {
        use sha2::Digest;

        let body = b"payload";
        let secret = "k";
        let sig = sign(secret, body);

        let mut hasher = Sha256::new();
        hasher.update(body);
        hasher.update(secret.as_bytes());
        let naive = format!("{}{}", SIGNATURE_PREFIX, hex::encode(hasher.finalize()));
        assert_ne!(sig, naive);
    }

    proptest::proptest! {
        #[test]
        fn roundtrip_holds_for_arbitrary_inputs(
            secret in "[a-zA-Z0-9]{1,32}",
            body in proptest::collection::vec(proptest::num::u8::ANY, 0..512),
        ) {
            let sig = sign(&secret, &body);
            proptest::prop_assert!(verify(&secret, &body, &sig));
        }

        #[test]
        fn cross_key_verification_fails(
            secret_a in "[a-z]{1,16}",
            secret_b in "[A-Z]{1,16}",
            body in proptest::collection::vec(proptest::num::u8::ANY, 0..256),
        ) {
            // Disjoint alphabets guarantee the keys differ.
            let sig = sign(&secret_a, &body);
            proptest::prop_assert!(!verify(&secret_b, &body, &sig));
        }
    }
}
