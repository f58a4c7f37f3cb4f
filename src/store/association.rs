use super::secret::{decode_secret, SecretError};
use secrecy::{ExposeSecret, SecretSlice};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// MAC algorithm bound to an association.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum AssocType {
    HmacSha1,
    HmacSha256,
}

impl AssocType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HmacSha1 => "HMAC-SHA1",
            Self::HmacSha256 => "HMAC-SHA256",
        }
    }
}

impl fmt::Display for AssocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedAssocType(pub String);

impl fmt::Display for UnsupportedAssocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported association type: {}", self.0)
    }
}

impl std::error::Error for UnsupportedAssocType {}

impl FromStr for AssocType {
    type Err = UnsupportedAssocType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "HMAC-SHA1" => Ok(Self::HmacSha1),
            "HMAC-SHA256" => Ok(Self::HmacSha256),
            other => Err(UnsupportedAssocType(other.to_string())),
        }
    }
}

impl TryFrom<String> for AssocType {
    type Error = UnsupportedAssocType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Shared secret negotiated with a provider endpoint.
#[derive(Debug)]
pub struct Association {
    pub handle: String,
    pub secret: SecretSlice<u8>,
    /// Seconds since the Unix epoch.
    pub issued: i64,
    /// Seconds.
    pub lifetime: i64,
    pub assoc_type: AssocType,
}

impl Association {
    #[must_use]
    pub fn new(
        handle: impl Into<String>,
        secret: Vec<u8>,
        issued: i64,
        lifetime: i64,
        assoc_type: AssocType,
    ) -> Self {
        Self {
            handle: handle.into(),
            secret: SecretSlice::from(secret),
            issued,
            lifetime,
            assoc_type,
        }
    }

    /// Build an association from a base64 secret, as providers send `mac_key`.
    ///
    /// # Errors
    /// Returns `SecretError` if the secret text does not decode.
    pub fn from_encoded_secret(
        handle: impl Into<String>,
        secret: &str,
        issued: i64,
        lifetime: i64,
        assoc_type: AssocType,
    ) -> Result<Self, SecretError> {
        Ok(Self::new(
            handle,
            decode_secret(secret)?,
            issued,
            lifetime,
            assoc_type,
        ))
    }

    #[must_use]
    pub fn secret_bytes(&self) -> &[u8] {
        self.secret.expose_secret()
    }

    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.issued.saturating_add(self.lifetime)
    }

    /// An association whose expiry equals `now` is already expired.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at() <= now
    }

    #[must_use]
    pub fn expires_in(&self, now: i64) -> i64 {
        (self.expires_at() - now).max(0)
    }
}

impl Clone for Association {
    fn clone(&self) -> Self {
        Self::new(
            self.handle.clone(),
            self.secret_bytes().to_vec(),
            self.issued,
            self.lifetime,
            self.assoc_type,
        )
    }
}

impl PartialEq for Association {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
            && self.secret_bytes() == other.secret_bytes()
            && self.issued == other.issued
            && self.lifetime == other.lifetime
            && self.assoc_type == other.assoc_type
    }
}

impl Eq for Association {}
