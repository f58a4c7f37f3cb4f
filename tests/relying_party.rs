use anyhow::{anyhow, bail, ensure, Result};
use async_trait::async_trait;
use openid_rp::{
    clock::FixedClock,
    config::RelyingPartyConfig,
    identity::{BindingStore, IdentityError, MemoryDirectory, UserCreation, UserDirectory},
    profile::{SREG_NS_1_1, TEAMS_NS},
    protocol::{
        signature, AssociationGrant, AuthRequest, BeginOutcome, DirectVerification, Message,
        Outcome, Provider, ProtocolError, RelyingParty, ServiceEndpoint, StaticDiscovery,
        Transaction, OPENID2_NS,
    },
    store::{make_response_nonce, AssocType, Association, MemoryStore, OpenIdStore},
};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

const NOW: i64 = 1_700_000_000;
const SSO: &str = "https://login.example/";
const OP_ENDPOINT: &str = "https://login.example/+openid";
const CLAIMED_ID: &str = "https://login.example/+id/abc";
const REALM: &str = "https://rp.example/";
const RETURN_TO: &str = "https://rp.example/openid/complete/";

/// Grants `h1` with the secret `s3cr3t` and answers direct verification with a
/// canned reply.
#[derive(Default)]
struct FakeProvider {
    refuse_association: AtomicBool,
    reject_direct: AtomicBool,
    invalidate_handle: Option<String>,
    associations: AtomicUsize,
    direct_checks: AtomicUsize,
}

#[async_trait]
impl Provider for FakeProvider {
    async fn associate(&self, _server_url: &str, assoc_type: AssocType) -> Result<AssociationGrant> {
        self.associations.fetch_add(1, Ordering::SeqCst);
        if self.refuse_association.load(Ordering::SeqCst) {
            bail!("association refused: unsupported-type");
        }
        Ok(AssociationGrant {
            handle: "h1".to_string(),
            mac_key: "czNjcjN0".to_string(),
            expires_in: 600,
            assoc_type,
        })
    }

    async fn check_authentication(
        &self,
        _server_url: &str,
        response: &Message,
    ) -> Result<DirectVerification> {
        self.direct_checks.fetch_add(1, Ordering::SeqCst);
        ensure!(response.get("sig").is_some(), "unsigned verification request");
        Ok(DirectVerification {
            is_valid: !self.reject_direct.load(Ordering::SeqCst),
            invalidate_handle: self.invalidate_handle.clone(),
        })
    }
}

struct Harness {
    clock: Arc<FixedClock>,
    store: Arc<MemoryStore>,
    directory: Arc<MemoryDirectory>,
    provider: Arc<FakeProvider>,
    rp: RelyingParty,
}

fn base_config() -> RelyingPartyConfig {
    RelyingPartyConfig::new(REALM, RETURN_TO)
        .with_sso_endpoint(Some(SSO.to_string()))
        .with_create_users(true)
        .with_preferred_assoc_type(AssocType::HmacSha1)
}

fn discovery(claimed_ids: &[&str]) -> StaticDiscovery {
    claimed_ids.iter().fold(
        StaticDiscovery::new().with_endpoint(SSO, ServiceEndpoint::op_identifier(OP_ENDPOINT)),
        |discovery, claimed_id| {
            discovery.with_endpoint(claimed_id, ServiceEndpoint::claimed(OP_ENDPOINT, *claimed_id))
        },
    )
}

fn harness_with(config: RelyingPartyConfig, provider: FakeProvider) -> Result<Harness> {
    let clock = Arc::new(FixedClock::new(NOW));
    let store = Arc::new(MemoryStore::new().with_clock(clock.clone()));
    let directory = Arc::new(MemoryDirectory::new());
    let provider = Arc::new(provider);

    let rp = RelyingParty::new(
        config,
        store.clone(),
        store.clone(),
        directory.clone(),
        Arc::new(discovery(&[
            CLAIMED_ID,
            "https://login.example/+id/def",
            "https://login.example/+id/ghi",
        ])),
        provider.clone(),
    )?
    .with_clock(clock.clone());

    Ok(Harness {
        clock,
        store,
        directory,
        provider,
        rp,
    })
}

fn harness(config: RelyingPartyConfig) -> Result<Harness> {
    harness_with(config, FakeProvider::default())
}

fn shared_association() -> Association {
    Association::new("h1", b"s3cr3t".to_vec(), NOW, 600, AssocType::HmacSha1)
}

/// A positive assertion for `claimed_id`, signed over the core fields plus
/// every extension field in `extra`.
struct Assertion<'a> {
    claimed_id: &'a str,
    handle: &'a str,
    nonce: String,
    extra: Vec<(&'a str, &'a str)>,
    unsigned: Vec<&'a str>,
}

impl<'a> Assertion<'a> {
    fn new(claimed_id: &'a str) -> Self {
        Self {
            claimed_id,
            handle: "h1",
            nonce: make_response_nonce(NOW, "salt1"),
            extra: Vec::new(),
            unsigned: Vec::new(),
        }
    }

    fn with_sreg(mut self, nickname: &'a str, email: &'a str, fullname: &'a str) -> Self {
        self.extra.extend([
            ("ns.sreg", SREG_NS_1_1),
            ("sreg.nickname", nickname),
            ("sreg.email", email),
            ("sreg.fullname", fullname),
        ]);
        self
    }

    fn with_teams(mut self, members: &'a str) -> Self {
        self.extra
            .extend([("ns.lp", TEAMS_NS), ("lp.is_member", members)]);
        self
    }

    fn params(&self, association: &Association) -> Result<Vec<(String, String)>> {
        let mut fields = vec![
            ("ns", OPENID2_NS),
            ("mode", "id_res"),
            ("op_endpoint", OP_ENDPOINT),
            ("claimed_id", self.claimed_id),
            ("identity", self.claimed_id),
            ("return_to", RETURN_TO),
            ("response_nonce", self.nonce.as_str()),
            ("assoc_handle", self.handle),
        ];
        fields.extend(self.extra.iter().copied());

        let signed: Vec<&str> = fields
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| !matches!(*key, "ns" | "mode") && !self.unsigned.contains(key))
            .collect();

        let mut params: Vec<(String, String)> = fields
            .iter()
            .map(|(key, value)| (format!("openid.{key}"), (*value).to_string()))
            .collect();
        params.push(("openid.signed".to_string(), signed.join(",")));

        let message = Message::from_params(params.iter().map(|(k, v)| (k.as_str(), v.clone())));
        let sig = signature::sign(association, &message, &signed)?;
        params.push(("openid.sig".to_string(), sig));
        Ok(params)
    }
}

async fn begin(rp: &RelyingParty) -> Result<(AuthRequest, Transaction)> {
    match rp.begin(None).await? {
        BeginOutcome::Started {
            request,
            transaction,
        } => Ok((request, transaction)),
        BeginOutcome::Failed { reason } => Err(anyhow!("begin failed: {reason}")),
    }
}

fn failure(outcome: Outcome) -> Result<String> {
    match outcome {
        Outcome::Failed { reason } => Ok(reason),
        other => Err(anyhow!("expected a failure, got {other:?}")),
    }
}

#[tokio::test]
async fn sign_in_creates_account_from_profile() -> Result<()> {
    let h = harness(base_config())?;
    let (request, transaction) = begin(&h.rp).await?;

    let AuthRequest::Redirect(url) = request else {
        bail!("expected a redirect");
    };
    let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let has = |key: &str, value: &str| query.iter().any(|(k, v)| k == key && v == value);
    assert!(url.as_str().starts_with(OP_ENDPOINT));
    assert!(has("openid.mode", "checkid_setup"));
    assert!(has("openid.assoc_handle", "h1"));
    assert!(has("openid.realm", REALM));
    assert!(has(
        "openid.claimed_id",
        "http://specs.openid.net/auth/2.0/identifier_select"
    ));
    assert!(has("openid.sreg.optional", "email,fullname,nickname"));
    assert_eq!(transaction.assoc_handle.as_deref(), Some("h1"));

    let params = Assertion::new(CLAIMED_ID)
        .with_sreg("alice", "alice@example.com", "Alice Liddell")
        .params(&shared_association())?;
    let outcome = h.rp.complete(&transaction, RETURN_TO, params).await?;

    let Outcome::Success {
        user,
        claimed_id,
        display_id,
        profile,
    } = outcome
    else {
        bail!("expected success, got {outcome:?}");
    };
    assert_eq!(user.username, "alice");
    assert_eq!(user.email, "alice@example.com");
    assert_eq!(user.first_name, "Alice");
    assert_eq!(user.last_name, "Liddell");
    assert_eq!(claimed_id, CLAIMED_ID);
    assert_eq!(display_id, CLAIMED_ID);
    assert_eq!(profile.nickname, "alice");

    assert_eq!(h.provider.associations.load(Ordering::SeqCst), 1);
    assert_eq!(h.provider.direct_checks.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.nonce_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn second_sign_in_reuses_association_and_account() -> Result<()> {
    let h = harness(base_config())?;

    let (_, first) = begin(&h.rp).await?;
    let params = Assertion::new(CLAIMED_ID)
        .with_sreg("alice", "alice@example.com", "Alice Liddell")
        .params(&shared_association())?;
    let Outcome::Success { user: created, .. } = h.rp.complete(&first, RETURN_TO, params).await?
    else {
        bail!("first sign-in failed");
    };

    h.clock.advance(60);
    let (_, second) = begin(&h.rp).await?;
    let mut assertion = Assertion::new(CLAIMED_ID).with_sreg("alice", "alice@example.com", "Alice Liddell");
    assertion.nonce = make_response_nonce(NOW + 60, "salt2");
    let params = assertion.params(&shared_association())?;
    let Outcome::Success { user, .. } = h.rp.complete(&second, RETURN_TO, params).await? else {
        bail!("second sign-in failed");
    };

    assert_eq!(user.id, created.id);
    assert_eq!(h.provider.associations.load(Ordering::SeqCst), 1);
    assert_eq!(h.directory.user_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn sign_in_without_profile_keeps_stored_names() -> Result<()> {
    let h = harness(base_config().with_update_details_from_provider(true))?;

    let (_, first) = begin(&h.rp).await?;
    let params = Assertion::new(CLAIMED_ID)
        .with_sreg("alice", "alice@example.com", "Alice Liddell")
        .params(&shared_association())?;
    let Outcome::Success { user: created, .. } = h.rp.complete(&first, RETURN_TO, params).await?
    else {
        bail!("first sign-in failed");
    };
    assert_eq!(created.first_name, "Alice");

    h.clock.advance(60);
    let (_, second) = begin(&h.rp).await?;
    let mut assertion = Assertion::new(CLAIMED_ID);
    assertion.nonce = make_response_nonce(NOW + 60, "salt2");
    let params = assertion.params(&shared_association())?;
    let Outcome::Success { user, .. } = h.rp.complete(&second, RETURN_TO, params).await? else {
        bail!("second sign-in failed");
    };

    assert_eq!(user.id, created.id);
    assert_eq!(user.first_name, "Alice");
    assert_eq!(user.last_name, "Liddell");
    assert_eq!(user.email, "alice@example.com");
    let stored = h
        .directory
        .get_user(created.id)
        .await?
        .ok_or_else(|| anyhow!("account vanished"))?;
    assert_eq!((stored.first_name, stored.last_name), ("Alice".to_string(), "Liddell".to_string()));
    Ok(())
}

#[tokio::test]
async fn replayed_response_is_rejected() -> Result<()> {
    let h = harness(base_config())?;
    let (_, transaction) = begin(&h.rp).await?;
    let params = Assertion::new(CLAIMED_ID).params(&shared_association())?;

    let first = h.rp.complete(&transaction, RETURN_TO, params.clone()).await?;
    assert!(matches!(first, Outcome::Success { .. }), "{first:?}");

    let replay = h.rp.complete(&transaction, RETURN_TO, params).await?;
    assert_eq!(failure(replay)?, ProtocolError::Replay.to_string());
    Ok(())
}

#[tokio::test]
async fn tampered_signed_field_is_rejected() -> Result<()> {
    let h = harness(base_config())?;
    let (_, transaction) = begin(&h.rp).await?;
    let mut params = Assertion::new(CLAIMED_ID)
        .with_sreg("alice", "alice@example.com", "Alice Liddell")
        .params(&shared_association())?;
    for (key, value) in &mut params {
        if key == "openid.sreg.email" {
            *value = "mallory@example.com".to_string();
        }
    }

    let outcome = h.rp.complete(&transaction, RETURN_TO, params).await?;
    assert_eq!(failure(outcome)?, ProtocolError::BadSignature.to_string());
    assert_eq!(h.store.nonce_count().await, 0);
    assert_eq!(h.directory.user_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn core_fields_must_be_signed() -> Result<()> {
    let h = harness(base_config())?;
    let (_, transaction) = begin(&h.rp).await?;
    let mut assertion = Assertion::new(CLAIMED_ID);
    assertion.unsigned.push("return_to");
    let params = assertion.params(&shared_association())?;

    let outcome = h.rp.complete(&transaction, RETURN_TO, params).await?;
    assert_eq!(
        failure(outcome)?,
        ProtocolError::UnsignedField("return_to".to_string()).to_string()
    );
    Ok(())
}

#[tokio::test]
async fn response_on_another_url_is_rejected() -> Result<()> {
    let h = harness(base_config())?;
    let (_, transaction) = begin(&h.rp).await?;
    let params = Assertion::new(CLAIMED_ID).params(&shared_association())?;

    let outcome = h
        .rp
        .complete(&transaction, "https://evil.example/openid/complete/", params)
        .await?;
    assert!(failure(outcome)?.starts_with("return_to mismatch"));
    Ok(())
}

#[tokio::test]
async fn identifier_from_another_provider_is_rejected() -> Result<()> {
    let h = harness(base_config())?;
    let (_, transaction) = begin(&h.rp).await?;
    let params = Assertion::new("https://other.example/+id/abc").params(&shared_association())?;

    let outcome = h.rp.complete(&transaction, RETURN_TO, params).await?;
    assert_eq!(
        failure(outcome)?,
        ProtocolError::ClaimedId("https://other.example/+id/abc".to_string()).to_string()
    );
    Ok(())
}

#[tokio::test]
async fn negative_responses_map_to_outcomes() -> Result<()> {
    let h = harness(base_config())?;
    let (_, transaction) = begin(&h.rp).await?;

    let cancel = vec![("openid.ns", OPENID2_NS), ("openid.mode", "cancel")];
    assert_eq!(
        h.rp.complete(&transaction, RETURN_TO, cancel).await?,
        Outcome::Cancelled
    );

    let error = vec![
        ("openid.ns", OPENID2_NS),
        ("openid.mode", "error"),
        ("openid.error", "server is down"),
    ];
    assert_eq!(failure(h.rp.complete(&transaction, RETURN_TO, error).await?)?, "server is down");

    let setup = vec![
        ("openid.ns", OPENID2_NS),
        ("openid.mode", "setup_needed"),
        ("openid.user_setup_url", "https://login.example/setup"),
    ];
    assert_eq!(
        h.rp.complete(&transaction, RETURN_TO, setup).await?,
        Outcome::SetupNeeded {
            setup_url: Some("https://login.example/setup".to_string())
        }
    );

    let unknown = vec![("openid.ns", OPENID2_NS), ("openid.mode", "bogus")];
    assert_eq!(
        failure(h.rp.complete(&transaction, RETURN_TO, unknown).await?)?,
        "unexpected mode bogus"
    );

    let empty: Vec<(String, String)> = Vec::new();
    assert_eq!(
        failure(h.rp.complete(&transaction, RETURN_TO, empty).await?)?,
        "no mode set in the response"
    );
    Ok(())
}

#[tokio::test]
async fn unknown_handle_falls_back_to_direct_verification() -> Result<()> {
    let provider = FakeProvider {
        invalidate_handle: Some("h-old".to_string()),
        ..FakeProvider::default()
    };
    let h = harness_with(base_config(), provider)?;
    let (_, transaction) = begin(&h.rp).await?;

    let stale = Association::new("h-old", b"stale".to_vec(), NOW, 600, AssocType::HmacSha1);
    h.store.store_association(OP_ENDPOINT, &stale).await?;

    // Signed with a key the relying party never saw.
    let private = Association::new("private", b"op-only".to_vec(), NOW, 600, AssocType::HmacSha1);
    let mut assertion = Assertion::new(CLAIMED_ID);
    assertion.handle = "private";
    let params = assertion.params(&private)?;

    let outcome = h.rp.complete(&transaction, RETURN_TO, params).await?;
    assert!(matches!(outcome, Outcome::Success { .. }), "{outcome:?}");
    assert_eq!(h.provider.direct_checks.load(Ordering::SeqCst), 1);
    assert!(h
        .store
        .get_association(OP_ENDPOINT, Some("h-old"))
        .await?
        .is_none());
    assert!(h.store.get_association(OP_ENDPOINT, Some("h1")).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn stateless_mode_when_association_is_refused() -> Result<()> {
    let provider = FakeProvider::default();
    provider.refuse_association.store(true, Ordering::SeqCst);
    provider.reject_direct.store(true, Ordering::SeqCst);
    let h = harness_with(base_config(), provider)?;

    let (request, transaction) = begin(&h.rp).await?;
    assert!(transaction.assoc_handle.is_none());
    let AuthRequest::Redirect(url) = request else {
        bail!("expected a redirect");
    };
    assert!(!url.query_pairs().any(|(k, _)| k == "openid.assoc_handle"));

    let params = Assertion::new(CLAIMED_ID).params(&shared_association())?;
    let outcome = h.rp.complete(&transaction, RETURN_TO, params).await?;
    assert_eq!(failure(outcome)?, ProtocolError::NotVerified.to_string());
    assert_eq!(h.store.association_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn nonce_skew_boundary() -> Result<()> {
    let h = harness(base_config())?;
    let (_, transaction) = begin(&h.rp).await?;

    let mut edge = Assertion::new(CLAIMED_ID);
    edge.nonce = make_response_nonce(NOW - 300, "edge");
    let outcome = h
        .rp
        .complete(&transaction, RETURN_TO, edge.params(&shared_association())?)
        .await?;
    assert!(matches!(outcome, Outcome::Success { .. }), "{outcome:?}");

    let mut stale = Assertion::new(CLAIMED_ID);
    stale.nonce = make_response_nonce(NOW - 301, "stale");
    let outcome = h
        .rp
        .complete(&transaction, RETURN_TO, stale.params(&shared_association())?)
        .await?;
    assert_eq!(failure(outcome)?, ProtocolError::Replay.to_string());

    let mut future = Assertion::new(CLAIMED_ID);
    future.nonce = make_response_nonce(NOW + 301, "future");
    let outcome = h
        .rp
        .complete(&transaction, RETURN_TO, future.params(&shared_association())?)
        .await?;
    assert_eq!(failure(outcome)?, ProtocolError::Replay.to_string());
    assert_eq!(h.store.nonce_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn colliding_nicknames_get_suffixes() -> Result<()> {
    let h = harness(base_config())?;
    let mut usernames = Vec::new();

    for (i, claimed_id) in [
        CLAIMED_ID,
        "https://login.example/+id/def",
        "https://login.example/+id/ghi",
    ]
    .into_iter()
    .enumerate()
    {
        let (_, transaction) = begin(&h.rp).await?;
        let mut assertion = Assertion::new(claimed_id).with_sreg("alice", "", "");
        assertion.nonce = make_response_nonce(NOW, &format!("salt{i}"));
        let outcome = h
            .rp
            .complete(&transaction, RETURN_TO, assertion.params(&shared_association())?)
            .await?;
        let Outcome::Success { user, .. } = outcome else {
            bail!("sign-in {i} failed: {outcome:?}");
        };
        usernames.push(user.username);
    }

    assert_eq!(usernames, ["alice", "alice2", "alice3"]);
    Ok(())
}

#[tokio::test]
async fn unknown_identity_without_account_creation_is_declined() -> Result<()> {
    let h = harness(base_config().with_create_users(false))?;
    let (_, transaction) = begin(&h.rp).await?;
    let params = Assertion::new(CLAIMED_ID).params(&shared_association())?;

    let outcome = h.rp.complete(&transaction, RETURN_TO, params).await?;
    assert!(matches!(outcome, Outcome::Declined { .. }), "{outcome:?}");
    assert_eq!(h.directory.user_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn bound_identity_cannot_be_linked_to_another_account() -> Result<()> {
    let h = harness(base_config())?;
    let (_, transaction) = begin(&h.rp).await?;
    let params = Assertion::new(CLAIMED_ID)
        .with_sreg("alice", "", "")
        .params(&shared_association())?;
    let Outcome::Success { user: alice, .. } = h.rp.complete(&transaction, RETURN_TO, params).await?
    else {
        bail!("sign-in failed");
    };

    let UserCreation::Created(bob) = h.directory.create_user("bob", "bob@example.com").await? else {
        bail!("could not create bob");
    };
    let err = h.rp.binder().bind(bob.id, CLAIMED_ID, CLAIMED_ID).await;
    assert!(matches!(err, Err(IdentityError::AlreadyClaimed { .. })), "{err:?}");

    let binding = h
        .store
        .lookup_by_claimed_id(CLAIMED_ID)
        .await?
        .ok_or_else(|| anyhow!("binding vanished"))?;
    assert_eq!(binding.user_id, alice.id);
    Ok(())
}

#[tokio::test]
async fn required_groups_gate_sign_in() -> Result<()> {
    let config = base_config().with_required_groups(["staff"]);
    let h = harness(config)?;

    let (request, transaction) = begin(&h.rp).await?;
    let AuthRequest::Redirect(url) = request else {
        bail!("expected a redirect");
    };
    assert!(url
        .query_pairs()
        .any(|(k, v)| k == "openid.lp.query_membership" && v == "staff"));

    let mut outsider = Assertion::new(CLAIMED_ID).with_teams("contractors");
    outsider.nonce = make_response_nonce(NOW, "outsider");
    let outcome = h
        .rp
        .complete(&transaction, RETURN_TO, outsider.params(&shared_association())?)
        .await?;
    assert!(matches!(outcome, Outcome::Declined { .. }), "{outcome:?}");
    assert_eq!(h.directory.user_count().await, 0);

    let mut member = Assertion::new(CLAIMED_ID).with_teams("contractors,staff");
    member.nonce = make_response_nonce(NOW, "member");
    let outcome = h
        .rp
        .complete(&transaction, RETURN_TO, member.params(&shared_association())?)
        .await?;
    assert!(matches!(outcome, Outcome::Success { .. }), "{outcome:?}");
    Ok(())
}

#[tokio::test]
async fn allow_listed_email_bypasses_group_requirement() -> Result<()> {
    let config = base_config()
        .with_required_groups(["staff"])
        .with_email_allowlist([r".*@example\.com"]);
    let h = harness(config)?;
    let (_, transaction) = begin(&h.rp).await?;

    let mut listed = Assertion::new(CLAIMED_ID).with_sreg("alice", "alice@example.com", "");
    listed.nonce = make_response_nonce(NOW, "listed");
    let outcome = h
        .rp
        .complete(&transaction, RETURN_TO, listed.params(&shared_association())?)
        .await?;
    assert!(matches!(outcome, Outcome::Success { .. }), "{outcome:?}");

    // Full-match only.
    let mut suffixed = Assertion::new("https://login.example/+id/def")
        .with_sreg("eve", "eve@example.com.evil.test", "");
    suffixed.nonce = make_response_nonce(NOW, "suffixed");
    let outcome = h
        .rp
        .complete(&transaction, RETURN_TO, suffixed.params(&shared_association())?)
        .await?;
    assert!(matches!(outcome, Outcome::Declined { .. }), "{outcome:?}");
    Ok(())
}

#[tokio::test]
async fn mapped_groups_follow_provider_membership() -> Result<()> {
    let config = base_config().with_group_mapping([("staff", "local-staff")]);
    let h = harness(config)?;
    h.directory.create_group("local-staff").await;

    let (_, transaction) = begin(&h.rp).await?;
    let mut member = Assertion::new(CLAIMED_ID).with_teams("staff");
    member.nonce = make_response_nonce(NOW, "member");
    let Outcome::Success { user, .. } = h
        .rp
        .complete(&transaction, RETURN_TO, member.params(&shared_association())?)
        .await?
    else {
        bail!("sign-in failed");
    };
    assert!(h.directory.user_groups(user.id).await?.contains("local-staff"));

    let mut former = Assertion::new(CLAIMED_ID).with_teams("alumni");
    former.nonce = make_response_nonce(NOW, "former");
    let outcome = h
        .rp
        .complete(&transaction, RETURN_TO, former.params(&shared_association())?)
        .await?;
    assert!(matches!(outcome, Outcome::Success { .. }), "{outcome:?}");
    assert!(h.directory.user_groups(user.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn xri_identifiers_can_be_refused() -> Result<()> {
    let config = RelyingPartyConfig::new(REALM, RETURN_TO).with_disallow_xri(true);
    let h = harness(config)?;

    let outcome = h.rp.begin(Some("=example")).await?;
    assert_eq!(
        outcome,
        BeginOutcome::Failed {
            reason: ProtocolError::XriNotAllowed.to_string()
        }
    );
    assert_eq!(h.provider.associations.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn discovery_failure_is_reported() -> Result<()> {
    let h = harness(RelyingPartyConfig::new(REALM, RETURN_TO))?;

    let BeginOutcome::Failed { reason } = h.rp.begin(Some("nobody.example")).await? else {
        bail!("expected discovery to fail");
    };
    assert!(reason.starts_with("OpenID discovery error:"), "{reason}");

    let BeginOutcome::Failed { reason } = h.rp.begin(None).await? else {
        bail!("expected a missing identifier to fail");
    };
    assert_eq!(reason, "an OpenID identifier is required");
    Ok(())
}
