//! In-process user directory.

use super::{LocalUser, UserCreation, UserDetails, UserDirectory};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct DirectoryState {
    users: HashMap<Uuid, LocalUser>,
    groups: BTreeSet<String>,
    memberships: HashMap<Uuid, BTreeSet<String>>,
}

/// [`UserDirectory`] kept in memory. Username uniqueness is checked under the
/// same lock as the insert.
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_group(&self, name: &str) {
        self.state.lock().await.groups.insert(name.to_string());
    }

    pub async fn user_count(&self) -> usize {
        self.state.lock().await.users.len()
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn get_user(&self, id: Uuid) -> Result<Option<LocalUser>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<LocalUser>> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .find(|user| user.username == username)
            .cloned())
    }

    async fn create_user(&self, username: &str, email: &str) -> Result<UserCreation> {
        let mut state = self.state.lock().await;
        if state.users.values().any(|user| user.username == username) {
            return Ok(UserCreation::UsernameTaken);
        }

        let user = LocalUser {
            id: Uuid::now_v7(),
            username: username.to_string(),
            email: email.to_string(),
            first_name: String::new(),
            last_name: String::new(),
            account_verified: false,
        };
        state.users.insert(user.id, user.clone());
        Ok(UserCreation::Created(user))
    }

    async fn delete_user(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        state.users.remove(&id);
        state.memberships.remove(&id);
        Ok(())
    }

    async fn update_details(&self, id: Uuid, details: &UserDetails) -> Result<()> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown user {id}"))?;
        user.first_name.clone_from(&details.first_name);
        user.last_name.clone_from(&details.last_name);
        user.email.clone_from(&details.email);
        Ok(())
    }

    async fn set_account_verified(&self, id: Uuid, verified: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown user {id}"))?;
        user.account_verified = verified;
        Ok(())
    }

    async fn group_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().await.groups.contains(name))
    }

    async fn user_groups(&self, id: Uuid) -> Result<BTreeSet<String>> {
        Ok(self
            .state
            .lock()
            .await
            .memberships
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_to_group(&self, id: Uuid, group: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.groups.contains(group) {
            return Err(anyhow!("unknown group {group}"));
        }
        if !state.users.contains_key(&id) {
            return Err(anyhow!("unknown user {id}"));
        }
        state
            .memberships
            .entry(id)
            .or_default()
            .insert(group.to_string());
        Ok(())
    }

    async fn remove_from_group(&self, id: Uuid, group: &str) -> Result<()> {
        if let Some(groups) = self.state.lock().await.memberships.get_mut(&id) {
            groups.remove(group);
        }
        Ok(())
    }
}
