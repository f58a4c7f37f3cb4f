//! The OpenID 2.0 request/response exchange.
//!
//! [`RelyingParty::begin`] produces the `checkid_setup` request and a
//! [`Transaction`] the caller stores in its session. [`RelyingParty::complete`]
//! checks the provider's answer against it:
//!
//! ```text
//! INITIATED -> (redirect to provider) -> RESPONSE_RECEIVED
//!     -> Success | Cancelled | Failed | SetupNeeded | Declined | IdentityConflict
//! ```

mod driver;
mod message;
mod provider;
mod return_to;
pub mod signature;

pub use driver::RelyingParty;
pub use message::{key_value_form, parse_key_value_form, Message};
pub use provider::{
    grant_from_reply, normalize_identifier, AssociationGrant, DirectVerification, Discovery,
    HttpProvider, Provider, StaticDiscovery, MAX_ASSOCIATION_LIFETIME,
};
pub use return_to::verify_return_to;

use crate::identity::LocalUser;
use crate::profile::Profile;
use crate::store::NonceError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const OPENID2_NS: &str = "http://specs.openid.net/auth/2.0";
pub const IDENTIFIER_SELECT: &str = "http://specs.openid.net/auth/2.0/identifier_select";

/// Provider endpoint found by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub server_url: String,
    /// `None` for an OP identifier, where the provider selects the identity.
    pub claimed_id: Option<String>,
    pub local_id: Option<String>,
    pub prefers_redirect: bool,
}

impl ServiceEndpoint {
    /// Endpoint reached through an OP identifier (identifier select).
    #[must_use]
    pub fn op_identifier(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            claimed_id: None,
            local_id: None,
            prefers_redirect: true,
        }
    }

    /// Endpoint for a user-supplied identifier.
    #[must_use]
    pub fn claimed(server_url: impl Into<String>, claimed_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            claimed_id: Some(claimed_id.into()),
            local_id: None,
            prefers_redirect: true,
        }
    }

    #[must_use]
    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    #[must_use]
    pub fn with_prefers_redirect(mut self, prefers_redirect: bool) -> Self {
        self.prefers_redirect = prefers_redirect;
        self
    }

    /// The identifier the provider is asked to authenticate.
    #[must_use]
    pub fn op_local_id(&self) -> Option<&str> {
        self.local_id.as_deref().or(self.claimed_id.as_deref())
    }
}

/// State carried from `begin` to `complete` in the caller's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub endpoint: ServiceEndpoint,
    pub return_to: String,
    pub assoc_handle: Option<String>,
    pub started_at: i64,
}

/// How to send the user agent to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Redirect(Url),
    /// Fields for an auto-submitting form posted to `action`.
    FormPost {
        action: Url,
        fields: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    Started {
        request: AuthRequest,
        transaction: Transaction,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success {
        user: LocalUser,
        claimed_id: String,
        display_id: String,
        profile: Profile,
    },
    Cancelled,
    Failed {
        reason: String,
    },
    SetupNeeded {
        setup_url: Option<String>,
    },
    /// Verified, but local policy refuses the login.
    Declined {
        reason: String,
    },
    IdentityConflict {
        claimed_id: String,
    },
}

/// Reasons a positive assertion is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("missing required field {0}")]
    MissingField(String),
    #[error("field {0} is not covered by the signature")]
    UnsignedField(String),
    #[error("unsupported protocol namespace {0}")]
    Namespace(String),
    #[error("return_to mismatch: {0}")]
    ReturnTo(String),
    #[error("invalid signature")]
    BadSignature,
    #[error("the provider did not confirm the assertion")]
    NotVerified,
    #[error("response nonce was already used or is outside the allowed window")]
    Replay,
    #[error(transparent)]
    Nonce(#[from] NonceError),
    #[error("claimed identifier {0} is not served by the asserting provider")]
    ClaimedId(String),
    #[error("XRI identifiers are not accepted")]
    XriNotAllowed,
    #[error("could not reach the provider: {0}")]
    Transport(String),
}

/// `xri://` identifiers and the XRI global context symbols.
#[must_use]
pub fn is_xri(identifier: &str) -> bool {
    let identifier = identifier.trim();
    identifier.starts_with("xri://")
        || identifier
            .chars()
            .next()
            .is_some_and(|c| matches!(c, '=' | '@' | '+' | '$' | '!' | '('))
}

/// Strip a URL fragment, the form shown to users.
#[must_use]
pub fn display_identifier(claimed_id: &str) -> &str {
    claimed_id
        .split_once('#')
        .map_or(claimed_id, |(head, _)| head)
}
