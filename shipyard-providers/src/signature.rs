//! Webhook authenticity checks
//!
//! All comparisons are constant-time and operate on the raw request bytes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Lowercase hex HMAC-SHA256 of `payload` under `secret`
pub fn hmac_sha256_hex(secret: &[u8], payload: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a lowercase hex HMAC-SHA256 signature.
///
/// Uppercase or otherwise non-canonical hex is rejected so that exactly one
/// signature string is valid for a payload.
pub fn verify_hmac_sha256_hex(secret: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    if secret.is_empty() || !is_lower_hex(signature_hex) {
        return false;
    }

    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time equality for shared webhook tokens
pub fn tokens_equal(presented: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    presented.as_bytes().ct_eq(secret.as_bytes()).into()
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
