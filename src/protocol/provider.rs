//! Collaborators that talk to the identity provider.

use super::{parse_key_value_form, Message, ServiceEndpoint, OPENID2_NS};
use crate::store::AssocType;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves a user-supplied identifier to a provider endpoint.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self, identifier: &str) -> Result<ServiceEndpoint>;
}

/// Longest association lifetime accepted from a provider, in seconds.
pub const MAX_ASSOCIATION_LIFETIME: i64 = 14 * 24 * 60 * 60;

/// A freshly negotiated association, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationGrant {
    pub handle: String,
    /// Base64 MAC key exactly as the provider sent it.
    pub mac_key: String,
    pub expires_in: i64,
    pub assoc_type: AssocType,
}

/// Result of direct verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectVerification {
    pub is_valid: bool,
    /// Handle the provider no longer honours.
    pub invalidate_handle: Option<String>,
}

/// Direct (server-to-server) requests to a provider endpoint.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn associate(&self, server_url: &str, assoc_type: AssocType) -> Result<AssociationGrant>;

    async fn check_authentication(
        &self,
        server_url: &str,
        response: &Message,
    ) -> Result<DirectVerification>;
}

/// Normalize an identifier the way it is looked up: trimmed, fragment
/// removed, `http://` assumed when no scheme is given.
#[must_use]
pub fn normalize_identifier(identifier: &str) -> Option<String> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return None;
    }
    let candidate = if identifier.starts_with("http://") || identifier.starts_with("https://") {
        identifier.to_string()
    } else {
        format!("http://{identifier}")
    };
    let mut url = Url::parse(&candidate).ok()?;
    url.set_fragment(None);
    Some(url.to_string())
}

/// Discovery backed by a fixed table, for deployments with a known provider
/// and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    endpoints: HashMap<String, ServiceEndpoint>,
}

impl StaticDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_endpoint(mut self, identifier: &str, endpoint: ServiceEndpoint) -> Self {
        let key = normalize_identifier(identifier).unwrap_or_else(|| identifier.to_string());
        self.endpoints.insert(key, endpoint);
        self
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self, identifier: &str) -> Result<ServiceEndpoint> {
        let key = normalize_identifier(identifier)
            .ok_or_else(|| anyhow!("invalid identifier {identifier:?}"))?;
        self.endpoints
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow!("no OpenID service found for {key}"))
    }
}

/// [`Provider`] over HTTPS using `reqwest`.
#[derive(Clone)]
pub struct HttpProvider {
    client: Client,
}

impl HttpProvider {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn post_key_value(
        &self,
        server_url: &str,
        form: &[(String, String)],
    ) -> Result<BTreeMap<String, String>> {
        let response = self
            .client
            .post(server_url)
            .form(form)
            .send()
            .await
            .with_context(|| format!("request to {server_url} failed"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read response from {server_url}"))?;
        let reply = parse_key_value_form(&body);

        // Protocol errors come back as 400 with a key-value body.
        if !status.is_success() && !reply.contains_key("error") {
            bail!("{server_url} - {status}");
        }
        Ok(reply)
    }
}

/// Interpret an `associate` reply for a no-encryption session.
///
/// # Errors
/// Returns an error when the provider refused or the reply is incomplete.
pub fn grant_from_reply(
    reply: &BTreeMap<String, String>,
    requested: AssocType,
) -> Result<AssociationGrant> {
    if let Some(error) = reply.get("error") {
        let code = reply.get("error_code").map_or("", String::as_str);
        bail!("association refused: {error} {code}");
    }

    let field = |name: &str| {
        reply
            .get(name)
            .ok_or_else(|| anyhow!("association reply is missing {name}"))
    };

    let assoc_type: AssocType = field("assoc_type")?.parse()?;
    if assoc_type != requested {
        bail!("provider answered with {assoc_type}, requested {requested}");
    }
    let session_type = reply.get("session_type").map_or("", String::as_str);
    if !session_type.is_empty() && session_type != "no-encryption" {
        bail!("unexpected session type {session_type}");
    }
    let expires_in = field("expires_in")?
        .parse::<i64>()
        .context("association reply has a malformed expires_in")?;
    if expires_in <= 0 {
        bail!("association reply has a non-positive expires_in {expires_in}");
    }

    Ok(AssociationGrant {
        handle: field("assoc_handle")?.clone(),
        mac_key: field("mac_key")?.clone(),
        expires_in: expires_in.min(MAX_ASSOCIATION_LIFETIME),
        assoc_type,
    })
}

#[async_trait]
impl Provider for HttpProvider {
    #[instrument(skip(self))]
    async fn associate(&self, server_url: &str, assoc_type: AssocType) -> Result<AssociationGrant> {
        let url = Url::parse(server_url).with_context(|| format!("invalid endpoint {server_url}"))?;
        if url.scheme() != "https" {
            bail!("refusing an unencrypted association session over {}", url.scheme());
        }

        let form = vec![
            ("openid.ns".to_string(), OPENID2_NS.to_string()),
            ("openid.mode".to_string(), "associate".to_string()),
            ("openid.assoc_type".to_string(), assoc_type.to_string()),
            ("openid.session_type".to_string(), "no-encryption".to_string()),
        ];
        let reply = self.post_key_value(server_url, &form).await?;
        let grant = grant_from_reply(&reply, assoc_type)?;
        debug!(handle = %grant.handle, expires_in = grant.expires_in, "association granted");
        Ok(grant)
    }

    #[instrument(skip(self, response))]
    async fn check_authentication(
        &self,
        server_url: &str,
        response: &Message,
    ) -> Result<DirectVerification> {
        let mut request = response.clone();
        request.set("mode", "check_authentication");
        let reply = self.post_key_value(server_url, &request.to_params()).await?;
        if let Some(error) = reply.get("error") {
            bail!("direct verification failed: {error}");
        }
        Ok(DirectVerification {
            is_valid: reply.get("is_valid").map(String::as_str) == Some("true"),
            invalidate_handle: reply.get("invalidate_handle").cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn normalize_identifier_cases() {
        assert_eq!(normalize_identifier("example.com").as_deref(), Some("http://example.com/"));
        assert_eq!(
            normalize_identifier(" https://example.com/id#frag ").as_deref(),
            Some("https://example.com/id")
        );
        assert_eq!(normalize_identifier("   "), None);
    }

    #[tokio::test]
    async fn static_discovery_matches_normalized_identifiers() -> Result<()> {
        let discovery = StaticDiscovery::new().with_endpoint(
            "http://example.com/",
            ServiceEndpoint::claimed("https://op.example/server", "http://example.com/"),
        );
        let endpoint = discovery.discover("example.com").await?;
        assert_eq!(endpoint.server_url, "https://op.example/server");
        assert!(discovery.discover("other.example").await.is_err());
        Ok(())
    }

    #[test]
    fn grant_from_complete_reply() -> Result<()> {
        let grant = grant_from_reply(
            &reply(&[
                ("ns", OPENID2_NS),
                ("assoc_handle", "h1"),
                ("assoc_type", "HMAC-SHA1"),
                ("session_type", "no-encryption"),
                ("mac_key", "czNjcjN0"),
                ("expires_in", "600"),
            ]),
            AssocType::HmacSha1,
        )?;
        assert_eq!(grant.handle, "h1");
        assert_eq!(grant.expires_in, 600);
        assert_eq!(grant.mac_key, "czNjcjN0");
        Ok(())
    }

    fn reply_expiring_in(expires_in: &str) -> BTreeMap<String, String> {
        reply(&[
            ("assoc_handle", "h1"),
            ("assoc_type", "HMAC-SHA1"),
            ("mac_key", "czNjcjN0"),
            ("expires_in", expires_in),
        ])
    }

    #[test]
    fn grant_rejects_non_positive_lifetime() {
        for expires_in in ["-600", "0"] {
            let err = grant_from_reply(&reply_expiring_in(expires_in), AssocType::HmacSha1)
                .err()
                .map(|e| e.to_string());
            assert_eq!(
                err,
                Some(format!("association reply has a non-positive expires_in {expires_in}"))
            );
        }
        assert!(grant_from_reply(&reply_expiring_in("soon"), AssocType::HmacSha1).is_err());
    }

    #[test]
    fn grant_lifetime_is_capped() -> Result<()> {
        let huge = i64::MAX.to_string();
        let grant = grant_from_reply(&reply_expiring_in(&huge), AssocType::HmacSha1)?;
        assert_eq!(grant.expires_in, MAX_ASSOCIATION_LIFETIME);

        let week = grant_from_reply(&reply_expiring_in("604800"), AssocType::HmacSha1)?;
        assert_eq!(week.expires_in, 604_800);
        Ok(())
    }

    #[test]
    fn grant_rejects_errors_and_mismatches() {
        let refused = reply(&[("error", "unsupported"), ("error_code", "unsupported-type")]);
        assert!(grant_from_reply(&refused, AssocType::HmacSha256).is_err());

        let wrong_type = reply(&[
            ("assoc_handle", "h1"),
            ("assoc_type", "HMAC-SHA1"),
            ("mac_key", "czNjcjN0"),
            ("expires_in", "600"),
        ]);
        assert!(grant_from_reply(&wrong_type, AssocType::HmacSha256).is_err());

        let missing = reply(&[("assoc_type", "HMAC-SHA1"), ("expires_in", "600")]);
        assert!(grant_from_reply(&missing, AssocType::HmacSha1).is_err());
    }

    #[tokio::test]
    async fn plain_http_association_is_refused() -> Result<()> {
        let provider = HttpProvider::new()?;
        let err = provider
            .associate("http://op.example/server", AssocType::HmacSha256)
            .await
            .err()
            .map(|e| e.to_string());
        assert_eq!(
            err.as_deref(),
            Some("refusing an unencrypted association session over http")
        );
        Ok(())
    }
}
