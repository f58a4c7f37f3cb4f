//! Relying-party configuration.

use crate::store::{AssocType, DEFAULT_SKEW_SECONDS};
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const DEFAULT_NAME_MAX_CHARS: usize = 30;
const DEFAULT_VERIFICATION_SCHEME: &str = "token_via_email";

/// Immutable settings handed to [`crate::protocol::RelyingParty`].
///
/// Construct with [`RelyingPartyConfig::new`] and the `with_*` builders, or
/// deserialize from JSON; missing keys take the defaults below.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelyingPartyConfig {
    realm: String,
    return_to: String,
    create_users: bool,
    update_details_from_provider: bool,
    sso_endpoint: Option<String>,
    use_email_for_username: bool,
    disallow_xri: bool,
    required_groups: BTreeSet<String>,
    group_mapping: BTreeMap<String, String>,
    map_groups_automatically: bool,
    email_allowlist: Vec<String>,
    nonce_skew_seconds: i64,
    preferred_assoc_type: AssocType,
    name_max_chars: usize,
    valid_verification_schemes: BTreeSet<String>,
}

impl Default for RelyingPartyConfig {
    fn default() -> Self {
        Self {
            realm: String::new(),
            return_to: String::new(),
            create_users: false,
            update_details_from_provider: false,
            sso_endpoint: None,
            use_email_for_username: false,
            disallow_xri: false,
            required_groups: BTreeSet::new(),
            group_mapping: BTreeMap::new(),
            map_groups_automatically: false,
            email_allowlist: Vec::new(),
            nonce_skew_seconds: DEFAULT_SKEW_SECONDS,
            preferred_assoc_type: AssocType::HmacSha256,
            name_max_chars: DEFAULT_NAME_MAX_CHARS,
            valid_verification_schemes: BTreeSet::from([DEFAULT_VERIFICATION_SCHEME.to_string()]),
        }
    }
}

impl RelyingPartyConfig {
    #[must_use]
    pub fn new(realm: impl Into<String>, return_to: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            return_to: return_to.into(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or does not match the schema.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    #[must_use]
    pub fn with_create_users(mut self, enabled: bool) -> Self {
        self.create_users = enabled;
        self
    }

    #[must_use]
    pub fn with_update_details_from_provider(mut self, enabled: bool) -> Self {
        self.update_details_from_provider = enabled;
        self
    }

    #[must_use]
    pub fn with_sso_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.sso_endpoint = endpoint;
        self
    }

    #[must_use]
    pub fn with_use_email_for_username(mut self, enabled: bool) -> Self {
        self.use_email_for_username = enabled;
        self
    }

    #[must_use]
    pub fn with_disallow_xri(mut self, enabled: bool) -> Self {
        self.disallow_xri = enabled;
        self
    }

    #[must_use]
    pub fn with_required_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_group_mapping<I, K, V>(mut self, mapping: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.group_mapping = mapping
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    #[must_use]
    pub fn with_map_groups_automatically(mut self, enabled: bool) -> Self {
        self.map_groups_automatically = enabled;
        self
    }

    #[must_use]
    pub fn with_email_allowlist<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.email_allowlist = patterns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_nonce_skew_seconds(mut self, seconds: i64) -> Self {
        self.nonce_skew_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_preferred_assoc_type(mut self, assoc_type: AssocType) -> Self {
        self.preferred_assoc_type = assoc_type;
        self
    }

    #[must_use]
    pub fn with_name_max_chars(mut self, max: usize) -> Self {
        self.name_max_chars = max;
        self
    }

    /// Verification schemes that mark an account as verified.
    #[must_use]
    pub fn with_valid_verification_schemes<I, S>(mut self, schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.valid_verification_schemes = schemes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn realm(&self) -> &str {
        &self.realm
    }

    #[must_use]
    pub fn return_to(&self) -> &str {
        &self.return_to
    }

    #[must_use]
    pub fn create_users(&self) -> bool {
        self.create_users
    }

    #[must_use]
    pub fn update_details_from_provider(&self) -> bool {
        self.update_details_from_provider
    }

    #[must_use]
    pub fn sso_endpoint(&self) -> Option<&str> {
        self.sso_endpoint.as_deref()
    }

    #[must_use]
    pub fn use_email_for_username(&self) -> bool {
        self.use_email_for_username
    }

    #[must_use]
    pub fn disallow_xri(&self) -> bool {
        self.disallow_xri
    }

    #[must_use]
    pub fn required_groups(&self) -> &BTreeSet<String> {
        &self.required_groups
    }

    #[must_use]
    pub fn group_mapping(&self) -> &BTreeMap<String, String> {
        &self.group_mapping
    }

    #[must_use]
    pub fn map_groups_automatically(&self) -> bool {
        self.map_groups_automatically
    }

    #[must_use]
    pub fn email_allowlist(&self) -> &[String] {
        &self.email_allowlist
    }

    #[must_use]
    pub fn nonce_skew_seconds(&self) -> i64 {
        self.nonce_skew_seconds
    }

    #[must_use]
    pub fn preferred_assoc_type(&self) -> AssocType {
        self.preferred_assoc_type
    }

    #[must_use]
    pub fn name_max_chars(&self) -> usize {
        self.name_max_chars
    }

    #[must_use]
    pub fn valid_verification_schemes(&self) -> &BTreeSet<String> {
        &self.valid_verification_schemes
    }

    /// Group names the provider should report membership for.
    #[must_use]
    pub fn queried_groups(&self) -> BTreeSet<String> {
        self.group_mapping
            .keys()
            .chain(self.required_groups.iter())
            .cloned()
            .collect()
    }

    /// Compile the allow-list; each pattern must match the whole address.
    ///
    /// # Errors
    /// Returns an error naming the first pattern that is not a valid regex.
    pub fn compile_email_allowlist(&self) -> Result<Vec<Regex>> {
        self.email_allowlist
            .iter()
            .map(|pattern| {
                Regex::new(&format!("^(?:{pattern})$"))
                    .with_context(|| format!("invalid email allow-list pattern: {pattern}"))
            })
            .collect()
    }
}
