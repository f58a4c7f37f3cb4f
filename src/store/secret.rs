//! Text encoding of association secrets.
//!
//! Secrets are raw bytes everywhere in the crate. They are turned into text
//! only when written to a column (or received from a provider as `mac_key`),
//! always as standard padded base64.

use base64ct::{Base64, Encoding};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SecretError {
    #[error("association secret is empty")]
    Empty,
    #[error("association secret is not valid base64")]
    Base64,
}

/// Encode secret bytes for persistence.
#[must_use]
pub fn encode_secret(secret: &[u8]) -> String {
    Base64::encode_string(secret)
}

/// Decode a persisted or provider-supplied secret back to bytes.
///
/// Rows written by older deployments may carry line-wrapped base64 with a
/// trailing newline, or the text of a byte literal such as `b'c2VjcmV0\n'`.
/// Both are reduced to the bare base64 payload before decoding.
///
/// # Errors
/// Returns `SecretError::Empty` if nothing is left after normalization and
/// `SecretError::Base64` if the payload is not valid base64.
pub fn decode_secret(text: &str) -> Result<Vec<u8>, SecretError> {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return Err(SecretError::Empty);
    }
    Base64::decode_vec(&normalized).map_err(|_| SecretError::Base64)
}

fn normalize(text: &str) -> String {
    let trimmed = text.trim();
    let unwrapped = trimmed
        .strip_prefix("b'")
        .and_then(|rest| rest.strip_suffix('\''))
        .or_else(|| {
            trimmed
                .strip_prefix("b\"")
                .and_then(|rest| rest.strip_suffix('"'))
        })
        .unwrap_or(trimmed);

    // Escaped newlines survive inside a byte-literal repr as a backslash and `n`.
    unwrapped
        .replace("\\n", "")
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect()
}
