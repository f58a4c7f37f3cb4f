//! # openid-rp (OpenID 2.0 relying party core)
//!
//! `openid-rp` verifies positive assertions issued by an external OpenID 2.0
//! provider, binds the asserted identity to a local account and refuses
//! replayed assertions.
//!
//! ## Persistent state
//!
//! - **Associations:** shared HMAC secrets negotiated with a provider, keyed by
//!   `(endpoint, handle)`. Lookups without a handle return the most recently
//!   issued association that has not expired; expired rows are purged as they
//!   are observed.
//! - **Nonces:** every accepted `response_nonce` is recorded as
//!   `(endpoint, timestamp, salt)` and can be used once. Timestamps outside the
//!   skew window are refused without being recorded.
//! - **Identity bindings:** a claimed identifier belongs to at most one local
//!   user. Attempts to attach it to a second account are reported as an identity
//!   conflict, never silently reassigned.
//!
//! ## Sign-in flow
//!
//! [`protocol::RelyingParty::begin`] discovers the provider endpoint, reuses or
//! negotiates an association and returns a redirect (or auto-submit form)
//! together with a serializable [`protocol::Transaction`] the caller keeps in
//! its session. [`protocol::RelyingParty::complete`] verifies the provider's
//! response against that transaction and returns a typed
//! [`protocol::Outcome`]; cancellations, failures and policy declines are
//! ordinary outcomes, not errors.

pub mod cli;
pub mod clock;
pub mod config;
pub mod identity;
pub mod profile;
pub mod protocol;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
