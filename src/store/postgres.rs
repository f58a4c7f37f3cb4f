//! PostgreSQL backend.

use super::{
    decode_secret, encode_secret, stale_before, within_skew, AssocType, Association, LookupRows,
    OpenIdStore, DEFAULT_SKEW_SECONDS,
};
use crate::clock::{Clock, SystemClock};
use crate::identity::{BindingInsert, BindingStore, IdentityBinding};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../sql/schema.sql");

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    skew: i64,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
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

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist yet.
    ///
    /// # Errors
    /// Returns an error if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "CREATE",
            db.statement = "sql/schema.sql"
        );
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to apply schema")?;
        Ok(())
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn association_from_row(row: &PgRow) -> Result<Association> {
    let handle: String = row.get("handle");
    let secret: String = row.get("secret");
    let assoc_type: String = row.get("assoc_type");

    let assoc_type: AssocType = assoc_type
        .parse()
        .with_context(|| format!("association {handle} has an unknown type"))?;
    let secret = decode_secret(&secret)
        .with_context(|| format!("stored secret for association {handle} is corrupt"))?;

    Ok(Association::new(
        handle,
        secret,
        row.get("issued"),
        row.get("lifetime"),
        assoc_type,
    ))
}

#[async_trait]
impl OpenIdStore for PgStore {
    async fn store_association(&self, endpoint: &str, association: &Association) -> Result<()> {
        let query = r"
            INSERT INTO openid_associations
                (server_url, handle, secret, issued, lifetime, assoc_type)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (server_url, handle) DO UPDATE SET
                secret = EXCLUDED.secret,
                issued = EXCLUDED.issued,
                lifetime = EXCLUDED.lifetime,
                assoc_type = EXCLUDED.assoc_type
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(endpoint)
            .bind(&association.handle)
            .bind(encode_secret(association.secret_bytes()))
            .bind(association.issued)
            .bind(association.lifetime)
            .bind(association.assoc_type.as_str())
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to store association")?;
        Ok(())
    }

    async fn get_association(
        &self,
        endpoint: &str,
        handle: Option<&str>,
    ) -> Result<Option<Association>> {
        let query = r"
            SELECT handle, secret, issued, lifetime, assoc_type
            FROM openid_associations
            WHERE server_url = $1 AND ($2::TEXT IS NULL OR handle = $2)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(endpoint)
            .bind(handle)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to load associations")?;

        let now = self.clock.now();
        let mut lookup = LookupRows::default();
        for row in &rows {
            let row_handle: String = row.get("handle");
            let issued: i64 = row.get("issued");
            let lifetime: i64 = row.get("lifetime");
            lookup.push(
                &row_handle,
                issued.saturating_add(lifetime),
                now,
                handle,
                || association_from_row(row),
            )?;
        }

        if !lookup.expired.is_empty() {
            let query = r"
                DELETE FROM openid_associations
                WHERE server_url = $1 AND handle = ANY($2) AND issued + lifetime <= $3
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(endpoint)
                .bind(&lookup.expired)
                .bind(now)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to delete expired associations")?;
        }

        Ok(lookup.newest())
    }

    async fn remove_association(&self, endpoint: &str, handle: &str) -> Result<bool> {
        let query = "DELETE FROM openid_associations WHERE server_url = $1 AND handle = $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(endpoint)
            .bind(handle)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to remove association")?;
        Ok(result.rows_affected() > 0)
    }

    async fn use_nonce(&self, endpoint: &str, timestamp: i64, salt: &str) -> Result<bool> {
        if !within_skew(timestamp, self.clock.now(), self.skew) {
            return Ok(false);
        }

        let query = r"
            INSERT INTO openid_nonces (server_url, timestamp, salt)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(endpoint)
            .bind(timestamp)
            .bind(salt)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to record nonce")?;
        Ok(result.rows_affected() == 1)
    }

    async fn cleanup_nonces(&self, now: Option<i64>) -> Result<u64> {
        let cutoff = stale_before(now.unwrap_or_else(|| self.clock.now()), self.skew);
        let query = "DELETE FROM openid_nonces WHERE timestamp < $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(cutoff)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to clean up nonces")?;
        Ok(result.rows_affected())
    }

    async fn cleanup_associations(&self) -> Result<u64> {
        let query = "DELETE FROM openid_associations WHERE issued + lifetime < $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(self.clock.now())
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to clean up associations")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BindingStore for PgStore {
    async fn lookup_by_claimed_id(&self, claimed_id: &str) -> Result<Option<IdentityBinding>> {
        let query =
            "SELECT user_id, claimed_id, display_id FROM openid_identities WHERE claimed_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(claimed_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup identity binding")?;

        Ok(row.map(|row| IdentityBinding {
            user_id: row.get("user_id"),
            claimed_id: row.get("claimed_id"),
            display_id: row.get("display_id"),
        }))
    }

    async fn insert_binding(&self, binding: &IdentityBinding) -> Result<BindingInsert> {
        let query = r"
            INSERT INTO openid_identities (user_id, claimed_id, display_id)
            VALUES ($1, $2, $3)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(binding.user_id)
            .bind(&binding.claimed_id)
            .bind(&binding.display_id)
            .execute(&self.pool)
            .instrument(span)
            .await;

        match result {
            Ok(_) => Ok(BindingInsert::Created),
            Err(err) if is_unique_violation(&err) => Ok(BindingInsert::Conflict),
            Err(err) => Err(err).context("failed to insert identity binding"),
        }
    }

    async fn update_display_id(&self, claimed_id: &str, display_id: &str) -> Result<()> {
        let query = "UPDATE openid_identities SET display_id = $2 WHERE claimed_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(claimed_id)
            .bind(display_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to update display identifier")?;
        Ok(())
    }

    async fn bindings_for_user(&self, user_id: Uuid) -> Result<Vec<IdentityBinding>> {
        let query = r"
            SELECT user_id, claimed_id, display_id
            FROM openid_identities
            WHERE user_id = $1
            ORDER BY claimed_id
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list identity bindings")?;

        Ok(rows
            .into_iter()
            .map(|row| IdentityBinding {
                user_id: row.get("user_id"),
                claimed_id: row.get("claimed_id"),
                display_id: row.get("display_id"),
            })
            .collect())
    }
}
