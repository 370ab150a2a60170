//! HMAC-SHA256 payload signatures
//!
//! Signatures take the form `sha256=<hex>` and are sent in the
//! `X-Signature` header. Verification compares MAC bytes in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix carried by every signature value
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute `sha256=<hex(HMAC-SHA256(secret, payload))>`
pub fn sign(payload: &[u8], secret: &str) -> String {
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac(payload, secret).finalize().into_bytes()))
}

/// Check a signature produced by [`sign`]
///
/// Malformed prefixes, non-hex digests, and digests of the wrong length
/// all return `false`.
pub fn verify(payload: &[u8], signature: &str, secret: &str) -> bool {
    let Some(digest_hex) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(digest) = hex::decode(digest_hex) else {
        return false;
    };
    // verify_slice is constant-time over the MAC bytes
    mac(payload, secret).verify_slice(&digest).is_ok()
}

fn mac(payload: &[u8], secret: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA256 accepts keys of any length");
    mac.update(payload);
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let payload = br#"{"id":"evt-1","type":"doc.processed"}"#;
        let signature = sign(payload, "test-secret");
        assert!(verify(payload, &signature, "test-secret"));
    }

    #[test]
    fn test_signature_format() {
        let signature = sign(b"test", "secret");
        let digest = signature.strip_prefix("sha256=").unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let signature = sign(b"what do ya want for nothing?", "Jefe");
        assert_eq!(
            signature,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_fails_with_wrong_secret() {
        let payload = b"payload";
        let signature = sign(payload, "secret1");
        assert!(!verify(payload, &signature, "secret2"));
    }

    #[test]
    fn test_verify_fails_with_modified_payload() {
        let signature = sign(br#"{"amount":100}"#, "secret");
        assert!(!verify(br#"{"amount":999}"#, &signature, "secret"));
    }

    #[test]
    fn test_verify_rejects_malformed_signatures() {
        let payload = b"payload";
        let signature = sign(payload, "secret");
        let digest = signature.strip_prefix("sha256=").unwrap();

        assert!(!verify(payload, digest, "secret"));
        assert!(!verify(payload, &format!("md5={}", digest), "secret"));
        assert!(!verify(payload, "sha256=not-hex", "secret"));
        assert!(!verify(payload, &signature[..signature.len() - 2], "secret"));
        assert!(!verify(payload, &format!("{}00", signature), "secret"));
        assert!(!verify(payload, "", "secret"));
    }

    #[test]
    fn test_empty_payload_and_secret() {
        let signature = sign(b"", "");
        assert!(verify(b"", &signature, ""));
        assert!(!verify(b"x", &signature, ""));
    }

    #[test]
    fn test_keys_longer_than_block_size() {
        let secret = "k".repeat(300);
        let signature = sign(b"payload", &secret);
        assert!(verify(b"payload", &signature, &secret));
        assert!(!verify(b"payload", &signature, &secret[..299]));
    }
}
