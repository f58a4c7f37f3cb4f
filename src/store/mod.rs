//! Persistence for associations and nonces.
//!
//! [`OpenIdStore`] is the backend contract an OpenID consumer needs:
//! store/get/remove associations and single-use nonces, plus the sweeps that
//! purge expired rows. Two backends implement it, [`PgStore`] for production
//! and [`MemoryStore`] for tests and single-process embedders. Both also
//! implement [`crate::identity::BindingStore`].

mod association;
mod memory;
mod nonce;
mod postgres;
mod secret;

pub use association::{AssocType, Association, UnsupportedAssocType};
pub use memory::MemoryStore;
pub use nonce::{
    make_response_nonce, split_response_nonce, stale_before, within_skew, Nonce, NonceError,
    DEFAULT_SKEW_SECONDS,
};
pub use postgres::PgStore;
pub use secret::{decode_secret, encode_secret, SecretError};

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

/// Rows removed by a full sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub nonces: u64,
    pub associations: u64,
}

#[async_trait]
pub trait OpenIdStore: Send + Sync {
    /// Insert the association, or replace secret, issue time, lifetime and type
    /// of the row already stored under `(endpoint, association.handle)`.
    async fn store_association(&self, endpoint: &str, association: &Association) -> Result<()>;

    /// With a handle, return exactly that association. Without one, return the
    /// unexpired association with the latest `issued` time; rows whose secret
    /// cannot be decoded are skipped with a warning.
    ///
    /// Expired rows seen while answering are deleted without being decoded.
    async fn get_association(
        &self,
        endpoint: &str,
        handle: Option<&str>,
    ) -> Result<Option<Association>>;

    /// Delete an association. Returns whether a row existed.
    async fn remove_association(&self, endpoint: &str, handle: &str) -> Result<bool>;

    /// Consume a nonce. Returns `false` for replays and for timestamps outside
    /// the skew window; in the latter case nothing is recorded.
    async fn use_nonce(&self, endpoint: &str, timestamp: i64, salt: &str) -> Result<bool>;

    /// Delete nonces older than the skew window relative to `now` (defaults to
    /// the store clock). Returns the number of rows removed.
    async fn cleanup_nonces(&self, now: Option<i64>) -> Result<u64>;

    /// Delete associations whose `issued + lifetime` lies in the past. Returns
    /// the number of rows removed.
    async fn cleanup_associations(&self) -> Result<u64>;

    async fn cleanup(&self) -> Result<CleanupReport> {
        let nonces = self.cleanup_nonces(None).await?;
        let associations = self.cleanup_associations().await?;
        Ok(CleanupReport {
            nonces,
            associations,
        })
    }
}

/// Rows matched by an association lookup, split by expiry.
#[derive(Default)]
struct LookupRows {
    live: Vec<Association>,
    expired: Vec<String>,
}

impl LookupRows {
    /// Sort one row. `decode` only runs for unexpired rows; a decode failure
    /// is an error when `requested` names a handle and a skipped row otherwise.
    fn push(
        &mut self,
        handle: &str,
        expires_at: i64,
        now: i64,
        requested: Option<&str>,
        decode: impl FnOnce() -> Result<Association>,
    ) -> Result<()> {
        if expires_at <= now {
            self.expired.push(handle.to_string());
            return Ok(());
        }
        match decode() {
            Ok(association) => self.live.push(association),
            Err(err) if requested.is_none() => {
                warn!(%handle, "skipping unreadable association: {err:#}");
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn newest(self) -> Option<Association> {
        newest(self.live)
    }
}

/// Pick the association a provider request should use.
fn newest(associations: impl IntoIterator<Item = Association>) -> Option<Association> {
    associations.into_iter().max_by(|a, b| {
        a.issued
            .cmp(&b.issued)
            .then_with(|| a.handle.cmp(&b.handle))
    })
}
