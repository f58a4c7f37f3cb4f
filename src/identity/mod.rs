//! Binding verified OpenID identities to local accounts.
//!
//! A claimed identifier maps to at most one local user. [`IdentityBinder`]
//! enforces that rule on top of two collaborators: a [`BindingStore`] that
//! persists `(user, claimed_id, display_id)` rows with a unique constraint on
//! `claimed_id`, and a [`UserDirectory`] owning the accounts and groups.

mod binder;
mod directory;
mod groups;
mod username;

pub use binder::IdentityBinder;
pub use directory::MemoryDirectory;
pub use groups::{group_requirement_met, mapped_groups};
pub use username::{preferred_username, DEFAULT_USERNAME};

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityBinding {
    pub user_id: Uuid,
    pub claimed_id: String,
    pub display_id: String,
}

/// Outcome of inserting a binding row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingInsert {
    Created,
    /// Another row already owns the claimed identifier.
    Conflict,
}

#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn lookup_by_claimed_id(&self, claimed_id: &str) -> Result<Option<IdentityBinding>>;

    /// Insert a new binding. A unique-constraint hit is reported as
    /// [`BindingInsert::Conflict`], not as an error.
    async fn insert_binding(&self, binding: &IdentityBinding) -> Result<BindingInsert>;

    async fn update_display_id(&self, claimed_id: &str, display_id: &str) -> Result<()>;

    async fn bindings_for_user(&self, user_id: Uuid) -> Result<Vec<IdentityBinding>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    /// Whether the provider last reported the account as verified.
    pub account_verified: bool,
}

/// Profile fields the relying party is allowed to overwrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDetails {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCreation {
    Created(LocalUser),
    UsernameTaken,
}

/// External account and group directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, id: Uuid) -> Result<Option<LocalUser>>;

    /// Consulted before each username candidate is tried. `create_user` still
    /// reports a taken name when a concurrent insert wins.
    async fn get_user_by_username(&self, username: &str) -> Result<Option<LocalUser>>;

    /// Create an account without a usable password.
    async fn create_user(&self, username: &str, email: &str) -> Result<UserCreation>;

    /// Remove an account created by a login that lost a binding race.
    async fn delete_user(&self, id: Uuid) -> Result<()>;

    async fn update_details(&self, id: Uuid, details: &UserDetails) -> Result<()>;

    async fn set_account_verified(&self, id: Uuid, verified: bool) -> Result<()>;

    async fn group_exists(&self, name: &str) -> Result<bool>;

    async fn user_groups(&self, id: Uuid) -> Result<BTreeSet<String>>;

    async fn add_to_group(&self, id: Uuid, group: &str) -> Result<()>;

    async fn remove_from_group(&self, id: Uuid, group: &str) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("the identity {claimed_id} has already been claimed")]
    AlreadyClaimed { claimed_id: String },
    #[error("no local account is bound to {claimed_id}")]
    NoSuchUser { claimed_id: String },
    #[error("could not find a free username for {base}")]
    UsernameExhausted { base: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
