//! WebSub content-delivery signature verification.
//!
//! Hubs sign each delivery with `X-Hub-Signature: sha1=<hex>`, an HMAC-SHA1
//! of the raw request body keyed with the subscription secret.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

/// Header carrying the delivery signature.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature format is not like sha1=signature")]
    Format,
    #[error("unsupported signature algorithm {0:?}, only sha1 is accepted")]
    Algorithm(String),
    /// Display omits the computed digest; it signs the sender's body.
    #[error("signature does not match body")]
    Mismatch { computed: String, received: String },
}

/// Verify `header` against `body` signed with `secret`.
///
/// Succeeds iff `header == "sha1=" + hex(HMAC-SHA1(secret, body))`.  The
/// digest comparison runs in constant time.
pub fn verify_signature(header: &str, body: &[u8], secret: &str) -> Result<(), SignatureError> {
    let (algorithm, received) = split_header(header)?;
    if algorithm != "sha1" {
        return Err(SignatureError::Algorithm(algorithm.to_string()));
    }

    let computed = sign(body, secret);
    if bool::from(computed.as_bytes().ct_eq(received.as_bytes())) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch {
            computed,
            received: received.to_string(),
        })
    }
}

/// Lowercase hex HMAC-SHA1 of `body` keyed with `secret`.
pub fn sign(body: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC takes keys of any size"));
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Split `<algorithm>=<digest>` into exactly two parts.
fn split_header(header: &str) -> Result<(&str, &str), SignatureError> {
    let mut parts = header.split('=');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(algorithm), Some(digest), None) => Ok((algorithm, digest)),
        _ => Err(SignatureError::Format),
    }
}
