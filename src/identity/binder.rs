use super::{
    groups::mapped_groups,
    username::{candidate, preferred_username},
    BindingInsert, BindingStore, IdentityBinding, IdentityError, LocalUser, UserCreation,
    UserDetails, UserDirectory,
};
use crate::{config::RelyingPartyConfig, profile::Profile};
use anyhow::{anyhow, Context};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

const MAX_USERNAME_ATTEMPTS: u32 = 1000;

/// Binds claimed identifiers to local accounts.
#[derive(Clone)]
pub struct IdentityBinder {
    bindings: Arc<dyn BindingStore>,
    directory: Arc<dyn UserDirectory>,
}

impl IdentityBinder {
    #[must_use]
    pub fn new(bindings: Arc<dyn BindingStore>, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            bindings,
            directory,
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<dyn UserDirectory> {
        &self.directory
    }

    /// # Errors
    /// Returns an error if the binding store is unavailable.
    pub async fn lookup_by_claimed_id(
        &self,
        claimed_id: &str,
    ) -> Result<Option<IdentityBinding>, IdentityError> {
        Ok(self.bindings.lookup_by_claimed_id(claimed_id).await?)
    }

    /// Bind `claimed_id` to `user_id`.
    ///
    /// Binding an identifier the user already owns refreshes its display form.
    ///
    /// # Errors
    /// [`IdentityError::AlreadyClaimed`] when another user owns the identifier.
    #[instrument(skip(self), err(Display))]
    pub async fn bind(
        &self,
        user_id: Uuid,
        claimed_id: &str,
        display_id: &str,
    ) -> Result<IdentityBinding, IdentityError> {
        if let Some(existing) = self.bindings.lookup_by_claimed_id(claimed_id).await? {
            return self.reconcile(existing, user_id, display_id).await;
        }

        let binding = IdentityBinding {
            user_id,
            claimed_id: claimed_id.to_string(),
            display_id: display_id.to_string(),
        };
        match self.bindings.insert_binding(&binding).await? {
            BindingInsert::Created => {
                info!(%user_id, "bound new identity");
                Ok(binding)
            }
            BindingInsert::Conflict => {
                // Lost a race with a concurrent first login.
                let existing = self
                    .bindings
                    .lookup_by_claimed_id(claimed_id)
                    .await?
                    .ok_or_else(|| anyhow!("binding for {claimed_id} vanished after conflict"))?;
                self.reconcile(existing, user_id, display_id).await
            }
        }
    }

    async fn reconcile(
        &self,
        existing: IdentityBinding,
        user_id: Uuid,
        display_id: &str,
    ) -> Result<IdentityBinding, IdentityError> {
        if existing.user_id != user_id {
            return Err(IdentityError::AlreadyClaimed {
                claimed_id: existing.claimed_id,
            });
        }
        if existing.display_id == display_id {
            return Ok(existing);
        }
        self.bindings
            .update_display_id(&existing.claimed_id, display_id)
            .await?;
        Ok(IdentityBinding {
            display_id: display_id.to_string(),
            ..existing
        })
    }

    /// Resolve the local account for a verified identity, creating one when
    /// the configuration allows it.
    ///
    /// # Errors
    /// [`IdentityError::NoSuchUser`] when no binding exists and accounts are
    /// not created automatically.
    #[instrument(skip(self, profile, config), err(Display))]
    pub async fn find_or_create_user(
        &self,
        claimed_id: &str,
        display_id: &str,
        profile: &Profile,
        config: &RelyingPartyConfig,
    ) -> Result<LocalUser, IdentityError> {
        if let Some(binding) = self.bindings.lookup_by_claimed_id(claimed_id).await? {
            if binding.display_id != display_id {
                self.bindings
                    .update_display_id(claimed_id, display_id)
                    .await?;
            }
            return self.user_for(&binding).await;
        }

        if !config.create_users() {
            return Err(IdentityError::NoSuchUser {
                claimed_id: claimed_id.to_string(),
            });
        }

        let user = self.create_user(profile, config).await?;
        match self.bind(user.id, claimed_id, display_id).await {
            Ok(_) => {}
            Err(IdentityError::AlreadyClaimed { .. }) => {
                // Another login bound the identifier first; use its account.
                self.directory.delete_user(user.id).await?;
                let binding = self
                    .bindings
                    .lookup_by_claimed_id(claimed_id)
                    .await?
                    .ok_or_else(|| anyhow!("binding for {claimed_id} vanished after conflict"))?;
                debug!(user_id = %binding.user_id, "concurrent login created the account");
                return self.user_for(&binding).await;
            }
            Err(err) => return Err(err),
        }

        self.update_user_details(&user, profile, config).await?;
        Ok(self.directory.get_user(user.id).await?.unwrap_or(user))
    }

    async fn user_for(&self, binding: &IdentityBinding) -> Result<LocalUser, IdentityError> {
        self.directory
            .get_user(binding.user_id)
            .await?
            .ok_or_else(|| IdentityError::NoSuchUser {
                claimed_id: binding.claimed_id.clone(),
            })
    }

    async fn create_user(
        &self,
        profile: &Profile,
        config: &RelyingPartyConfig,
    ) -> Result<LocalUser, IdentityError> {
        let base = preferred_username(
            Some(profile.nickname.as_str()),
            Some(profile.email.as_str()),
            config.use_email_for_username(),
        );

        for attempt in 1..=MAX_USERNAME_ATTEMPTS {
            let username = candidate(&base, attempt);
            if self.directory.get_user_by_username(&username).await?.is_some() {
                continue;
            }
            match self.directory.create_user(&username, &profile.email).await? {
                UserCreation::Created(user) => {
                    info!(user_id = %user.id, username = %user.username, "created local account");
                    return Ok(user);
                }
                UserCreation::UsernameTaken => continue,
            }
        }

        Err(IdentityError::UsernameExhausted { base })
    }

    /// Copy the provider's profile onto the account. Names are cut to the
    /// configured length and empty profile fields keep the stored value. The
    /// verification flag follows the profile's reported scheme.
    ///
    /// # Errors
    /// Returns an error if the directory rejects the update.
    pub async fn update_user_details(
        &self,
        user: &LocalUser,
        profile: &Profile,
        config: &RelyingPartyConfig,
    ) -> Result<(), IdentityError> {
        let fresh = profile.details(config.name_max_chars());
        let details = UserDetails {
            first_name: non_empty_or(fresh.first_name, &user.first_name),
            last_name: non_empty_or(fresh.last_name, &user.last_name),
            email: non_empty_or(fresh.email, &user.email),
        };
        self.directory
            .update_details(user.id, &details)
            .await
            .with_context(|| format!("failed to update details for {}", user.id))?;

        let verified = profile.account_verified(config.valid_verification_schemes());
        if verified != user.account_verified {
            debug!(user_id = %user.id, verified, "account verification changed");
            self.directory
                .set_account_verified(user.id, verified)
                .await
                .with_context(|| format!("failed to update verification for {}", user.id))?;
        }
        Ok(())
    }

    /// Reconcile the user's managed groups with the provider's report.
    ///
    /// Managed groups are the mapping targets, or with automatic mapping every
    /// local group. Groups the user belongs to outside the managed set are left
    /// alone.
    ///
    /// # Errors
    /// Returns an error if the directory is unavailable.
    #[instrument(skip(self, reported, config), err(Display))]
    pub async fn sync_groups(
        &self,
        user_id: Uuid,
        reported: &BTreeSet<String>,
        config: &RelyingPartyConfig,
    ) -> Result<(), IdentityError> {
        let current = self.directory.user_groups(user_id).await?;

        let (managed, granted) = if config.map_groups_automatically() {
            let mut granted = BTreeSet::new();
            for group in reported {
                if self.directory.group_exists(group).await? {
                    granted.insert(group.clone());
                }
            }
            (current.union(&granted).cloned().collect(), granted)
        } else {
            let managed: BTreeSet<String> = config.group_mapping().values().cloned().collect();
            (managed, mapped_groups(reported, config.group_mapping()))
        };

        for group in current.intersection(&managed) {
            if !granted.contains(group) {
                debug!(%group, "removing group membership");
                self.directory.remove_from_group(user_id, group).await?;
            }
        }

        for group in granted.difference(&current) {
            if self.directory.group_exists(group).await? {
                debug!(%group, "adding group membership");
                self.directory.add_to_group(user_id, group).await?;
            }
        }

        Ok(())
    }
}

fn non_empty_or(value: String, stored: &str) -> String {
    if value.is_empty() {
        stored.to_string()
    } else {
        value
    }
}
