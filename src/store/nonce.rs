use chrono::{DateTime, NaiveDateTime};
use thiserror::Error;

/// Default tolerance, in seconds, between our clock and the provider's.
pub const DEFAULT_SKEW_SECONDS: i64 = 5 * 60;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const TIMESTAMP_LEN: usize = 20;

/// A consumed `response_nonce`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nonce {
    pub endpoint: String,
    pub timestamp: i64,
    pub salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NonceError {
    #[error("response nonce is too short")]
    TooShort,
    #[error("response nonce timestamp is malformed")]
    Timestamp,
}

#[must_use]
pub fn within_skew(timestamp: i64, now: i64, skew: i64) -> bool {
    timestamp.abs_diff(now) <= skew.unsigned_abs()
}

/// Oldest timestamp still inside the window; anything older can be purged.
#[must_use]
pub fn stale_before(now: i64, skew: i64) -> i64 {
    now.saturating_sub(skew)
}

/// Split an `openid.response_nonce` into its UTC timestamp and salt.
///
/// The value starts with `YYYY-MM-DDTHH:MM:SSZ`; whatever follows is the salt
/// and may be empty.
///
/// # Errors
/// Returns `NonceError` when the timestamp prefix is missing or malformed.
pub fn split_response_nonce(value: &str) -> Result<(i64, String), NonceError> {
    let (stamp, salt) = match (value.get(..TIMESTAMP_LEN), value.get(TIMESTAMP_LEN..)) {
        (Some(stamp), Some(salt)) => (stamp, salt),
        _ => return Err(NonceError::TooShort),
    };

    let parsed =
        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).map_err(|_| NonceError::Timestamp)?;

    Ok((parsed.and_utc().timestamp(), salt.to_string()))
}

/// Format a `response_nonce` the way providers do.
#[must_use]
pub fn make_response_nonce(timestamp: i64, salt: &str) -> String {
    let stamp = DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_default();
    format!("{stamp}{salt}")
}
