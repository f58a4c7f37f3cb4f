use super::{
    display_identifier, is_xri, signature, verify_return_to, AssociationGrant, AuthRequest,
    BeginOutcome, Discovery, Message, Outcome, ProtocolError, Provider, ServiceEndpoint,
    Transaction, IDENTIFIER_SELECT, OPENID2_NS,
};
use crate::clock::{Clock, SystemClock};
use crate::config::RelyingPartyConfig;
use crate::identity::{
    group_requirement_met, BindingStore, IdentityBinder, IdentityError, UserDirectory,
};
use crate::profile::{add_extension_requests, reported_groups, Profile, ProfileSource, TEAMS_NS};
use crate::store::{split_response_nonce, within_skew, Association, NonceError, OpenIdStore};
use anyhow::Result;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

/// Longest redirect URL before falling back to a form post.
const MAX_REDIRECT_URL_LEN: usize = 2047;

/// Fields a positive assertion must carry.
const REQUIRED_FIELDS: [&str; 6] = [
    "return_to",
    "op_endpoint",
    "response_nonce",
    "assoc_handle",
    "signed",
    "sig",
];

/// Fields the signature must cover.
const SIGNED_FIELDS: [&str; 6] = [
    "return_to",
    "op_endpoint",
    "response_nonce",
    "assoc_handle",
    "claimed_id",
    "identity",
];

/// Why an assertion was not accepted: a protocol problem becomes a `Failed`
/// outcome, a storage problem is returned as an error.
enum Rejection {
    Protocol(ProtocolError),
    Fatal(anyhow::Error),
}

impl From<ProtocolError> for Rejection {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<NonceError> for Rejection {
    fn from(err: NonceError) -> Self {
        Self::Protocol(err.into())
    }
}

impl From<anyhow::Error> for Rejection {
    fn from(err: anyhow::Error) -> Self {
        Self::Fatal(err)
    }
}

/// Drives sign-in against an OpenID 2.0 provider.
pub struct RelyingParty {
    config: RelyingPartyConfig,
    allowlist: Vec<Regex>,
    store: Arc<dyn OpenIdStore>,
    binder: IdentityBinder,
    discovery: Arc<dyn Discovery>,
    provider: Arc<dyn Provider>,
    clock: Arc<dyn Clock>,
}

impl RelyingParty {
    /// # Errors
    /// Returns an error if an email allow-list pattern does not compile.
    pub fn new(
        config: RelyingPartyConfig,
        store: Arc<dyn OpenIdStore>,
        bindings: Arc<dyn BindingStore>,
        directory: Arc<dyn UserDirectory>,
        discovery: Arc<dyn Discovery>,
        provider: Arc<dyn Provider>,
    ) -> Result<Self> {
        let allowlist = config.compile_email_allowlist()?;
        Ok(Self {
            config,
            allowlist,
            store,
            binder: IdentityBinder::new(bindings, directory),
            discovery,
            provider,
            clock: Arc::new(SystemClock),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RelyingPartyConfig {
        &self.config
    }

    #[must_use]
    pub fn binder(&self) -> &IdentityBinder {
        &self.binder
    }

    /// Start a sign-in.
    ///
    /// With an SSO endpoint configured the supplied identifier is ignored.
    /// Discovery problems are reported as [`BeginOutcome::Failed`].
    ///
    /// # Errors
    /// Returns an error only if the association store is unavailable.
    #[instrument(skip(self))]
    pub async fn begin(&self, identifier: Option<&str>) -> Result<BeginOutcome> {
        let identifier = match (self.config.sso_endpoint(), identifier.map(str::trim)) {
            (Some(sso), _) => sso.to_string(),
            (None, Some(identifier)) if !identifier.is_empty() => identifier.to_string(),
            _ => return Ok(begin_failed("an OpenID identifier is required")),
        };

        if self.config.disallow_xri() && is_xri(&identifier) {
            return Ok(begin_failed(ProtocolError::XriNotAllowed));
        }

        let endpoint = match self.discovery.discover(&identifier).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(%identifier, "discovery failed: {err:#}");
                return Ok(begin_failed(format!("OpenID discovery error: {err}")));
            }
        };

        let association = self.association_for(&endpoint.server_url).await?;

        let transaction = Transaction {
            id: Uuid::new_v4(),
            endpoint,
            return_to: self.config.return_to().to_string(),
            assoc_handle: association.map(|association| association.handle),
            started_at: self.clock.now(),
        };

        let message = self.checkid_setup(&transaction);
        let request = match auth_request(&transaction.endpoint, &message) {
            Ok(request) => request,
            Err(err) => {
                warn!(server_url = %transaction.endpoint.server_url, "invalid endpoint: {err}");
                return Ok(begin_failed(format!("invalid provider endpoint: {err}")));
            }
        };

        debug!(transaction = %transaction.id, stateless = transaction.assoc_handle.is_none(), "sign-in started");
        Ok(BeginOutcome::Started {
            request,
            transaction,
        })
    }

    /// Reuse the newest live association or negotiate one. Negotiation
    /// failures leave the transaction stateless.
    async fn association_for(&self, server_url: &str) -> Result<Option<Association>> {
        if let Some(association) = self.store.get_association(server_url, None).await? {
            return Ok(Some(association));
        }

        let grant = match self
            .provider
            .associate(server_url, self.config.preferred_assoc_type())
            .await
        {
            Ok(grant) => grant,
            Err(err) => {
                warn!(%server_url, "association failed, continuing stateless: {err:#}");
                return Ok(None);
            }
        };

        match self.association_from_grant(grant) {
            Ok(association) => {
                self.store
                    .store_association(server_url, &association)
                    .await?;
                Ok(Some(association))
            }
            Err(err) => {
                warn!(%server_url, "unusable association, continuing stateless: {err}");
                Ok(None)
            }
        }
    }

    fn association_from_grant(
        &self,
        grant: AssociationGrant,
    ) -> Result<Association, crate::store::SecretError> {
        Association::from_encoded_secret(
            grant.handle,
            &grant.mac_key,
            self.clock.now(),
            grant.expires_in,
            grant.assoc_type,
        )
    }

    fn checkid_setup(&self, transaction: &Transaction) -> Message {
        let mut message = Message::new();
        message.set("ns", OPENID2_NS);
        message.set("mode", "checkid_setup");
        message.set("return_to", transaction.return_to.as_str());
        message.set("realm", self.config.realm());

        match (&transaction.endpoint.claimed_id, transaction.endpoint.op_local_id()) {
            (Some(claimed_id), Some(local_id)) => {
                message.set("claimed_id", claimed_id.as_str());
                message.set("identity", local_id);
            }
            _ => {
                message.set("claimed_id", IDENTIFIER_SELECT);
                message.set("identity", IDENTIFIER_SELECT);
            }
        }

        if let Some(handle) = &transaction.assoc_handle {
            message.set("assoc_handle", handle.as_str());
        }

        add_extension_requests(&mut message, &self.config.queried_groups());
        message
    }

    /// Finish a sign-in from the parameters the provider sent back.
    ///
    /// `request_url` is the full URL the response arrived on; `params` are the
    /// decoded query or form parameters.
    ///
    /// # Errors
    /// Returns an error only when storage is unavailable. Every protocol or
    /// policy problem is an [`Outcome`].
    #[instrument(skip(self, transaction, params), fields(transaction = %transaction.id))]
    pub async fn complete<I, K, V>(
        &self,
        transaction: &Transaction,
        request_url: &str,
        params: I,
    ) -> Result<Outcome>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let params: Vec<(String, String)> = params
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        let message = Message::from_params(params.iter().map(|(k, v)| (k.as_str(), v.clone())));

        match message.get("mode") {
            Some("cancel") => {
                info!("sign-in cancelled by the user");
                Ok(Outcome::Cancelled)
            }
            Some("error") => {
                let reason = message.get("error").unwrap_or("the provider reported an error");
                warn!(%reason, "provider returned an error");
                Ok(Outcome::Failed {
                    reason: reason.to_string(),
                })
            }
            Some("setup_needed") => Ok(Outcome::SetupNeeded {
                setup_url: message.get("user_setup_url").map(ToString::to_string),
            }),
            Some("id_res") => {
                self.complete_assertion(transaction, request_url, &params, &message)
                    .await
            }
            Some(other) => {
                warn!(mode = %other, "unexpected response mode");
                Ok(Outcome::Failed {
                    reason: format!("unexpected mode {other}"),
                })
            }
            None => Ok(Outcome::Failed {
                reason: "no mode set in the response".to_string(),
            }),
        }
    }

    async fn complete_assertion(
        &self,
        transaction: &Transaction,
        request_url: &str,
        params: &[(String, String)],
        message: &Message,
    ) -> Result<Outcome> {
        let claimed_id = match self
            .verify_assertion(transaction, request_url, params, message)
            .await
        {
            Ok(claimed_id) => claimed_id,
            Err(Rejection::Protocol(err)) => {
                warn!(reason = %err, "rejected assertion");
                return Ok(Outcome::Failed {
                    reason: err.to_string(),
                });
            }
            Err(Rejection::Fatal(err)) => return Err(err),
        };

        let display_id = display_identifier(&claimed_id).to_string();
        let sources = ProfileSource::from_response(message);
        let profile = Profile::from_sources(&sources);
        let reported = reported_groups(message);

        if !group_requirement_met(
            self.config.required_groups(),
            &reported,
            &profile.email,
            &self.allowlist,
        ) {
            info!(%claimed_id, "required group membership missing");
            return Ok(Outcome::Declined {
                reason: "required group membership missing".to_string(),
            });
        }

        let user = match self
            .binder
            .find_or_create_user(&claimed_id, &display_id, &profile, &self.config)
            .await
        {
            Ok(user) => user,
            Err(IdentityError::AlreadyClaimed { claimed_id }) => {
                warn!(%claimed_id, "identity already bound to another account");
                return Ok(Outcome::IdentityConflict { claimed_id });
            }
            Err(err @ (IdentityError::NoSuchUser { .. } | IdentityError::UsernameExhausted { .. })) => {
                info!(reason = %err, "login declined");
                return Ok(Outcome::Declined {
                    reason: err.to_string(),
                });
            }
            Err(IdentityError::Storage(err)) => return Err(err),
        };

        let mut user = user;
        // Without a signed profile extension there is nothing to refresh from.
        if self.config.update_details_from_provider() && !sources.is_empty() {
            self.binder
                .update_user_details(&user, &profile, &self.config)
                .await?;
            if let Some(updated) = self.binder.directory().get_user(user.id).await? {
                user = updated;
            }
        }

        let manages_groups =
            self.config.map_groups_automatically() || !self.config.group_mapping().is_empty();
        if manages_groups && message.signed_extension_args(TEAMS_NS).is_some() {
            self.binder
                .sync_groups(user.id, &reported, &self.config)
                .await?;
        }

        info!(user_id = %user.id, %claimed_id, "sign-in succeeded");
        Ok(Outcome::Success {
            user,
            claimed_id,
            display_id,
            profile,
        })
    }

    /// Check a positive assertion and return its claimed identifier.
    async fn verify_assertion(
        &self,
        transaction: &Transaction,
        request_url: &str,
        params: &[(String, String)],
        message: &Message,
    ) -> Result<String, Rejection> {
        match message.get("ns") {
            Some(ns) if ns == OPENID2_NS => {}
            other => {
                return Err(ProtocolError::Namespace(other.unwrap_or("(none)").to_string()).into())
            }
        }

        let field = |name: &str| {
            message
                .get(name)
                .ok_or_else(|| ProtocolError::MissingField(name.to_string()))
        };
        for name in REQUIRED_FIELDS {
            field(name)?;
        }
        let claimed_id = field("claimed_id")?;
        let identity = field("identity")?;
        let op_endpoint = field("op_endpoint")?;

        for name in SIGNED_FIELDS {
            if !message.is_signed(name) {
                return Err(ProtocolError::UnsignedField(name.to_string()).into());
            }
        }

        verify_return_to(field("return_to")?, request_url, params)?;

        if self.config.disallow_xri() && is_xri(claimed_id) {
            return Err(ProtocolError::XriNotAllowed.into());
        }

        self.verify_discovery(&transaction.endpoint, op_endpoint, claimed_id, identity)
            .await?;

        self.verify_signature(op_endpoint, field("assoc_handle")?, message)
            .await?;

        let (timestamp, salt) = split_response_nonce(field("response_nonce")?)?;
        if !within_skew(timestamp, self.clock.now(), self.config.nonce_skew_seconds())
            || !self.store.use_nonce(op_endpoint, timestamp, &salt).await?
        {
            return Err(ProtocolError::Replay.into());
        }

        Ok(claimed_id.to_string())
    }

    /// The asserted identifier must belong to the asserting endpoint. When it
    /// differs from what was discovered at `begin`, discover it again.
    async fn verify_discovery(
        &self,
        started: &ServiceEndpoint,
        op_endpoint: &str,
        claimed_id: &str,
        identity: &str,
    ) -> Result<(), Rejection> {
        let bare_claimed_id = display_identifier(claimed_id);
        let matches_transaction = started.server_url == op_endpoint
            && started.claimed_id.as_deref().map(display_identifier) == Some(bare_claimed_id)
            && started.op_local_id() == Some(identity);
        if matches_transaction {
            return Ok(());
        }

        debug!(%claimed_id, "asserted identifier differs from the transaction, rediscovering");
        let mismatch = || ProtocolError::ClaimedId(claimed_id.to_string());
        let discovered = self
            .discovery
            .discover(bare_claimed_id)
            .await
            .map_err(|_| mismatch())?;

        let identity_ok = match discovered.local_id.as_deref() {
            Some(local_id) => identity == local_id,
            None => identity == claimed_id || identity == bare_claimed_id,
        };
        if discovered.server_url != op_endpoint || !identity_ok {
            return Err(mismatch().into());
        }
        Ok(())
    }

    /// Verify with the stored association, or ask the provider directly when
    /// the handle is unknown or expired.
    async fn verify_signature(
        &self,
        op_endpoint: &str,
        handle: &str,
        message: &Message,
    ) -> Result<(), Rejection> {
        if let Some(association) = self.store.get_association(op_endpoint, Some(handle)).await? {
            return if signature::verify(&association, message)? {
                Ok(())
            } else {
                Err(ProtocolError::BadSignature.into())
            };
        }

        debug!(%handle, "no usable association, verifying directly");
        let verification = self
            .provider
            .check_authentication(op_endpoint, message)
            .await
            .map_err(|err| ProtocolError::Transport(err.to_string()))?;

        if !verification.is_valid {
            return Err(ProtocolError::NotVerified.into());
        }

        let stale = verification
            .invalidate_handle
            .as_deref()
            .or_else(|| message.get("invalidate_handle"));
        if let Some(stale) = stale {
            if self.store.remove_association(op_endpoint, stale).await? {
                info!(handle = %stale, "removed invalidated association");
            }
        }
        Ok(())
    }
}

fn begin_failed(reason: impl ToString) -> BeginOutcome {
    BeginOutcome::Failed {
        reason: reason.to_string(),
    }
}

fn auth_request(endpoint: &ServiceEndpoint, message: &Message) -> Result<AuthRequest, url::ParseError> {
    let action = Url::parse(&endpoint.server_url)?;
    let fields = message.to_params();

    if endpoint.prefers_redirect {
        let mut url = action.clone();
        url.query_pairs_mut().extend_pairs(fields.iter());
        if url.as_str().len() <= MAX_REDIRECT_URL_LEN {
            return Ok(AuthRequest::Redirect(url));
        }
    }

    Ok(AuthRequest::FormPost { action, fields })
}
