//! Handshake Password Digest
//!
//! A joiner never sends its password: the HANDSHAKE payload carries
//! `pwd=` followed by the lowercase hex SHA-256 of the UTF-8 password.
//! The payload bytes themselves are not encrypted.

use sha2::{Digest, Sha256};

/// Prefix of the HANDSHAKE payload.
pub const HANDSHAKE_PREFIX: &str = "pwd=";

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 of the password.
pub fn password_digest(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the HANDSHAKE payload for a password.
///
/// An empty password still produces a digest (of the empty string); rooms
/// without a password ignore it.
pub fn handshake_payload(password: &str) -> Vec<u8> {
    format!("{}{}", HANDSHAKE_PREFIX, password_digest(password)).into_bytes()
}

/// Extract the digest from a HANDSHAKE payload.
///
/// Returns `None` unless the payload is `pwd=` followed by exactly 64 hex
/// characters.
pub fn parse_handshake(payload: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(payload).ok()?;
    let digest = text.strip_prefix(HANDSHAKE_PREFIX)?;
    if digest.len() != DIGEST_HEX_LEN || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(digest)
}

/// Check a HANDSHAKE payload against the digest the host expects.
pub fn verify_handshake(payload: &[u8], expected_digest: &str) -> bool {
    parse_handshake(payload)
        .map(|digest| digest.eq_ignore_ascii_case(expected_digest))
        .unwrap_or(false)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ABC_DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_known_digest() {
        assert_eq!(password_digest("abc"), ABC_DIGEST);
        assert_eq!(
            password_digest(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_handshake_payload_format() {
        let payload = handshake_payload("abc");
        let text = String::from_utf8(payload).unwrap();
        assert_eq!(text, format!("pwd={}", ABC_DIGEST));
        assert_eq!(text.len(), 4 + DIGEST_HEX_LEN);
    }

    #[test]
    fn test_parse_handshake() {
        let payload = handshake_payload("hunter2");
        assert_eq!(parse_handshake(&payload), Some(password_digest("hunter2").as_str()));

        assert_eq!(parse_handshake(b"pwd=abc"), None);
        assert_eq!(parse_handshake(b"password=whatever"), None);
        assert_eq!(parse_handshake(&[0xff, 0xfe]), None);
        let not_hex = format!("pwd={}", "z".repeat(DIGEST_HEX_LEN));
        assert_eq!(parse_handshake(not_hex.as_bytes()), None);
    }

    #[test]
    fn test_verify_handshake() {
        let expected = password_digest("secret");
        assert!(verify_handshake(&handshake_payload("secret"), &expected));
        assert!(!verify_handshake(&handshake_payload("Secret"), &expected));
        assert!(!verify_handshake(b"", &expected));
    }
}
