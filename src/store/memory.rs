//! In-process backend, one lock around every table.

use super::{
    decode_secret, encode_secret, stale_before, within_skew, AssocType, Association, LookupRows,
    Nonce, OpenIdStore, DEFAULT_SKEW_SECONDS,
};
use crate::clock::{Clock, SystemClock};
use crate::identity::{BindingInsert, BindingStore, IdentityBinding};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Association row as persisted: the secret is kept in its stored text form.
struct AssociationRow {
    secret: String,
    issued: i64,
    lifetime: i64,
    assoc_type: AssocType,
}

impl AssociationRow {
    fn expires_at(&self) -> i64 {
        self.issued.saturating_add(self.lifetime)
    }
}

#[derive(Default)]
struct Tables {
    associations: HashMap<(String, String), AssociationRow>,
    nonces: HashSet<Nonce>,
    bindings: HashMap<String, IdentityBinding>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    clock: Arc<dyn Clock>,
    skew: i64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            clock: Arc::new(SystemClock),
            skew: DEFAULT_SKEW_SECONDS,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_skew_seconds(mut self, skew: i64) -> Self {
        self.skew = skew;
        self
    }

    /// Store a row with an already-encoded secret, as an older deployment
    /// might have written it.
    pub async fn insert_raw_association(
        &self,
        endpoint: &str,
        handle: &str,
        secret: &str,
        issued: i64,
        lifetime: i64,
        assoc_type: AssocType,
    ) {
        self.tables.lock().await.associations.insert(
            (endpoint.to_string(), handle.to_string()),
            AssociationRow {
                secret: secret.to_string(),
                issued,
                lifetime,
                assoc_type,
            },
        );
    }

    pub async fn nonce_count(&self) -> usize {
        self.tables.lock().await.nonces.len()
    }

    pub async fn association_count(&self) -> usize {
        self.tables.lock().await.associations.len()
    }
}

fn load(handle: &str, row: &AssociationRow) -> Result<Association> {
    let secret = decode_secret(&row.secret)
        .with_context(|| format!("stored secret for association {handle} is corrupt"))?;
    Ok(Association::new(
        handle,
        secret,
        row.issued,
        row.lifetime,
        row.assoc_type,
    ))
}

#[async_trait]
impl OpenIdStore for MemoryStore {
    async fn store_association(&self, endpoint: &str, association: &Association) -> Result<()> {
        self.tables.lock().await.associations.insert(
            (endpoint.to_string(), association.handle.clone()),
            AssociationRow {
                secret: encode_secret(association.secret_bytes()),
                issued: association.issued,
                lifetime: association.lifetime,
                assoc_type: association.assoc_type,
            },
        );
        Ok(())
    }

    async fn get_association(
        &self,
        endpoint: &str,
        handle: Option<&str>,
    ) -> Result<Option<Association>> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;

        let mut rows = LookupRows::default();
        for ((row_endpoint, row_handle), row) in &tables.associations {
            if row_endpoint != endpoint || handle.is_some_and(|h| h != row_handle) {
                continue;
            }
            rows.push(row_handle, row.expires_at(), now, handle, || load(row_handle, row))?;
        }

        for row_handle in &rows.expired {
            tables
                .associations
                .remove(&(endpoint.to_string(), row_handle.clone()));
        }

        Ok(rows.newest())
    }

    async fn remove_association(&self, endpoint: &str, handle: &str) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .associations
            .remove(&(endpoint.to_string(), handle.to_string()))
            .is_some())
    }

    async fn use_nonce(&self, endpoint: &str, timestamp: i64, salt: &str) -> Result<bool> {
        if !within_skew(timestamp, self.clock.now(), self.skew) {
            return Ok(false);
        }
        Ok(self.tables.lock().await.nonces.insert(Nonce {
            endpoint: endpoint.to_string(),
            timestamp,
            salt: salt.to_string(),
        }))
    }

    async fn cleanup_nonces(&self, now: Option<i64>) -> Result<u64> {
        let cutoff = stale_before(now.unwrap_or_else(|| self.clock.now()), self.skew);
        let mut tables = self.tables.lock().await;
        let before = tables.nonces.len();
        tables.nonces.retain(|nonce| nonce.timestamp >= cutoff);
        Ok(u64::try_from(before - tables.nonces.len())?)
    }

    async fn cleanup_associations(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        let before = tables.associations.len();
        tables
            .associations
            .retain(|_, row| row.expires_at() >= now);
        Ok(u64::try_from(before - tables.associations.len())?)
    }
}

#[async_trait]
impl BindingStore for MemoryStore {
    async fn lookup_by_claimed_id(&self, claimed_id: &str) -> Result<Option<IdentityBinding>> {
        Ok(self.tables.lock().await.bindings.get(claimed_id).cloned())
    }

    async fn insert_binding(&self, binding: &IdentityBinding) -> Result<BindingInsert> {
        let mut tables = self.tables.lock().await;
        if tables.bindings.contains_key(&binding.claimed_id) {
            return Ok(BindingInsert::Conflict);
        }
        tables
            .bindings
            .insert(binding.claimed_id.clone(), binding.clone());
        Ok(BindingInsert::Created)
    }

    async fn update_display_id(&self, claimed_id: &str, display_id: &str) -> Result<()> {
        if let Some(binding) = self.tables.lock().await.bindings.get_mut(claimed_id) {
            binding.display_id = display_id.to_string();
        }
        Ok(())
    }

    async fn bindings_for_user(&self, user_id: Uuid) -> Result<Vec<IdentityBinding>> {
        let tables = self.tables.lock().await;
        let mut bindings: Vec<IdentityBinding> = tables
            .bindings
            .values()
            .filter(|binding| binding.user_id == user_id)
            .cloned()
            .collect();
        bindings.sort_by(|a, b| a.claimed_id.cmp(&b.claimed_id));
        Ok(bindings)
    }
}
