//! `openid.*` argument handling and key-value form encoding.

use std::collections::BTreeMap;

const PREFIX: &str = "openid.";

/// The `openid.`-prefixed arguments of a request or response, stored without
/// the prefix (`mode`, `ns.sreg`, `sreg.email`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    args: BTreeMap<String, String>,
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect the OpenID arguments from decoded query or form parameters.
    /// Everything without the `openid.` prefix is ignored.
    pub fn from_params<I, K, V>(params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let args = params
            .into_iter()
            .filter_map(|(key, value)| {
                key.as_ref()
                    .strip_prefix(PREFIX)
                    .map(|key| (key.to_string(), value.into()))
            })
            .collect();
        Self { args }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.args.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.args.contains_key(key)
    }

    /// Arguments with the `openid.` prefix restored, ready to be encoded.
    #[must_use]
    pub fn to_params(&self) -> Vec<(String, String)> {
        self.args
            .iter()
            .map(|(key, value)| (format!("{PREFIX}{key}"), value.clone()))
            .collect()
    }

    /// Alias under which an extension namespace is declared (`ns.<alias>`).
    #[must_use]
    pub fn alias_for(&self, namespace: &str) -> Option<&str> {
        self.args.iter().find_map(|(key, value)| {
            key.strip_prefix("ns.")
                .filter(|alias| !alias.contains('.') && value == namespace)
        })
    }

    /// Names listed in `openid.signed`.
    #[must_use]
    pub fn signed_fields(&self) -> Vec<&str> {
        self.get("signed")
            .map(|signed| {
                signed
                    .split(',')
                    .map(str::trim)
                    .filter(|field| !field.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_signed(&self, field: &str) -> bool {
        self.signed_fields().contains(&field)
    }

    /// Arguments of an extension namespace, keyed without the alias.
    ///
    /// Returns `None` when the namespace is absent, empty, or when any of its
    /// arguments is not covered by the signature.
    #[must_use]
    pub fn signed_extension_args(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        let alias = self.alias_for(namespace)?;
        let prefix = format!("{alias}.");
        let signed = self.signed_fields();

        let mut out = BTreeMap::new();
        for (key, value) in &self.args {
            let Some(name) = key.strip_prefix(&prefix) else {
                continue;
            };
            if !signed.contains(&key.as_str()) {
                return None;
            }
            out.insert(name.to_string(), value.clone());
        }

        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

/// Encode pairs in OpenID key-value form (`key:value\n` per pair).
#[must_use]
pub fn key_value_form<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}:{value}\n"))
        .collect()
}

/// Parse a key-value form body. Lines without a colon are skipped.
#[must_use]
pub fn parse_key_value_form(body: &str) -> BTreeMap<String, String> {
    body.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}
