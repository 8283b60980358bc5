//! HMAC-SHA256 webhook signature checks shared by all adapters.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureEncoding {
    Base64,
    Hex,
}

/// Computes the HMAC of `payload` in the requested encoding.
pub fn sign(payload: &[u8], secret: &str, encoding: SignatureEncoding) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    Some(match encoding {
        SignatureEncoding::Base64 => STANDARD.encode(digest),
        SignatureEncoding::Hex => hex::encode(digest),
    })
}

/// Verifies `provided` against the HMAC of `payload` with a constant-time comparison.
/// A `sha256=` prefix on hex signatures is accepted.
pub fn verify_hmac_sha256(
    payload: &[u8],
    secret: &str,
    provided: &str,
    encoding: SignatureEncoding,
) -> bool {
    if secret.is_empty() || provided.is_empty() {
        return false;
    }

    let trimmed = provided.trim();
    let provided_bytes = match encoding {
        SignatureEncoding::Base64 => STANDARD.decode(trimmed).ok(),
        SignatureEncoding::Hex => {
            hex::decode(trimmed.strip_prefix("sha256=").unwrap_or(trimmed)).ok()
        }
    };
    let Some(provided_bytes) = provided_bytes else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    expected.as_slice().ct_eq(provided_bytes.as_slice()).into()
}
