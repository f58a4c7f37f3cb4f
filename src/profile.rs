//! Profile attributes carried by the simple-registration, attribute-exchange
//! and team-membership extensions.

use crate::identity::UserDetails;
use crate::protocol::Message;
use std::collections::{BTreeMap, BTreeSet};

pub const SREG_NS_1_0: &str = "http://openid.net/sreg/1.0";
pub const SREG_NS_1_1: &str = "http://openid.net/extensions/sreg/1.1";
pub const AX_NS: &str = "http://openid.net/srv/ax/1.0";
pub const TEAMS_NS: &str = "http://ns.launchpad.net/2007/openid-teams";
/// Attribute-exchange type carrying the provider's account verification scheme.
pub const VERIFICATION_NS: &str = "http://ns.login.ubuntu.com/2013/validation/account";

const AX_SCHEMAS: [&str; 2] = ["http://axschema.org/", "http://schema.openid.net/"];

const AX_FIELDS: [&str; 5] = [
    "namePerson/friendly",
    "contact/email",
    "namePerson",
    "namePerson/first",
    "namePerson/last",
];

const SREG_REQUESTED: &str = "email,fullname,nickname";

/// Attribute-exchange aliases requested at sign-in and their schema paths.
const AX_REQUESTED: [(&str, &str); 5] = [
    ("email", "contact/email"),
    ("fullname", "namePerson"),
    ("nickname", "namePerson/friendly"),
    ("first", "namePerson/first"),
    ("last", "namePerson/last"),
];

/// Signed attributes as delivered by one extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSource {
    /// Simple registration fields keyed by name (`nickname`, `email`, ...).
    SimpleRegistration(BTreeMap<String, String>),
    /// Attribute exchange values keyed by type URI.
    AttributeExchange(BTreeMap<String, Vec<String>>),
}

impl ProfileSource {
    /// Extract every signed profile extension from a positive assertion,
    /// simple registration first so attribute exchange can override it.
    #[must_use]
    pub fn from_response(message: &Message) -> Vec<Self> {
        let mut sources = Vec::new();

        let sreg = [SREG_NS_1_1, SREG_NS_1_0]
            .into_iter()
            .find_map(|ns| message.signed_extension_args(ns));
        if let Some(fields) = sreg {
            sources.push(Self::SimpleRegistration(fields));
        }

        if let Some(args) = message.signed_extension_args(AX_NS) {
            if args.get("mode").map(String::as_str) == Some("fetch_response") {
                sources.push(Self::AttributeExchange(ax_values(&args)));
            }
        }

        sources
    }

    fn merge_into(&self, raw: &mut RawFields) {
        match self {
            Self::SimpleRegistration(fields) => {
                for (name, value) in fields {
                    match name.as_str() {
                        "nickname" => raw.nickname = Some(value.clone()),
                        "email" => raw.email = Some(value.clone()),
                        "fullname" => raw.fullname = Some(value.clone()),
                        _ => {
                            raw.extra.insert(name.clone(), value.clone());
                        }
                    }
                }
            }
            Self::AttributeExchange(values) => {
                // The first schema prefix to supply a field wins.
                let mut applied = BTreeSet::new();
                for (type_uri, values) in values {
                    let Some(value) = values.first() else {
                        continue;
                    };
                    if type_uri == VERIFICATION_NS {
                        raw.verification_scheme = Some(value.clone());
                        continue;
                    }
                    let Some(path) = schema_path(type_uri).filter(|p| AX_FIELDS.contains(p))
                    else {
                        raw.extra.insert(type_uri.clone(), value.clone());
                        continue;
                    };
                    if !applied.insert(path) {
                        continue;
                    }
                    let slot = match path {
                        "namePerson/friendly" => &mut raw.nickname,
                        "contact/email" => &mut raw.email,
                        "namePerson" => &mut raw.fullname,
                        "namePerson/first" => &mut raw.first_name,
                        _ => &mut raw.last_name,
                    };
                    *slot = Some(value.clone());
                }
            }
        }
    }
}

/// Canonical profile after reducing every [`ProfileSource`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub nickname: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    /// Scheme the provider used to verify the account, if it reported one.
    pub verification_scheme: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl Profile {
    #[must_use]
    pub fn from_sources(sources: &[ProfileSource]) -> Self {
        let mut raw = RawFields::default();
        for source in sources {
            source.merge_into(&mut raw);
        }

        let first = raw.first_name.unwrap_or_default();
        let last = raw.last_name.unwrap_or_default();
        let (first_name, last_name) = if first.is_empty() && last.is_empty() {
            split_full_name(raw.fullname.as_deref().unwrap_or_default())
        } else {
            (first, last)
        };

        Self {
            nickname: raw.nickname.unwrap_or_default(),
            first_name,
            last_name,
            email: raw.email.unwrap_or_default(),
            verification_scheme: raw.verification_scheme,
            extra: raw.extra,
        }
    }

    #[must_use]
    pub fn from_response(message: &Message) -> Self {
        Self::from_sources(&ProfileSource::from_response(message))
    }

    /// Details to persist, with names cut to `max_chars` characters.
    #[must_use]
    pub fn details(&self, max_chars: usize) -> UserDetails {
        UserDetails {
            first_name: truncate_chars(&self.first_name, max_chars),
            last_name: truncate_chars(&self.last_name, max_chars),
            email: self.email.clone(),
        }
    }

    /// Whether the provider vouched for the account with one of `valid_schemes`.
    #[must_use]
    pub fn account_verified(&self, valid_schemes: &BTreeSet<String>) -> bool {
        self.verification_scheme
            .as_ref()
            .is_some_and(|scheme| valid_schemes.contains(scheme))
    }
}

#[derive(Default)]
struct RawFields {
    nickname: Option<String>,
    fullname: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    verification_scheme: Option<String>,
    extra: BTreeMap<String, String>,
}

fn schema_path(type_uri: &str) -> Option<&str> {
    AX_SCHEMAS
        .iter()
        .find_map(|schema| type_uri.strip_prefix(schema))
}

fn ax_values(args: &BTreeMap<String, String>) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for (key, type_uri) in args {
        let Some(alias) = key.strip_prefix("type.") else {
            continue;
        };
        let values = match args.get(&format!("count.{alias}")) {
            Some(count) => {
                let count = count.parse::<usize>().unwrap_or(0);
                (1..=count)
                    .filter_map(|i| args.get(&format!("value.{alias}.{i}")).cloned())
                    .collect()
            }
            None => args
                .get(&format!("value.{alias}"))
                .cloned()
                .into_iter()
                .collect(),
        };
        out.insert(type_uri.clone(), values);
    }
    out
}

/// Split a full name at its last whitespace run. A single token is treated as
/// the last name.
#[must_use]
pub fn split_full_name(fullname: &str) -> (String, String) {
    let fullname = fullname.trim();
    match fullname.rfind(char::is_whitespace) {
        Some(idx) => {
            let (head, tail) = fullname.split_at(idx);
            (head.trim_end().to_string(), tail.trim_start().to_string())
        }
        None => (String::new(), fullname.to_string()),
    }
}

/// Cut `value` to at most `max_chars` characters.
#[must_use]
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Team names from a signed team-membership response.
#[must_use]
pub fn reported_groups(message: &Message) -> BTreeSet<String> {
    message
        .signed_extension_args(TEAMS_NS)
        .and_then(|args| args.get("is_member").cloned())
        .map(|members| {
            members
                .split(',')
                .map(str::trim)
                .filter(|team| !team.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Add the profile and team-membership requests to a `checkid_setup` message.
pub fn add_extension_requests(message: &mut Message, queried_groups: &BTreeSet<String>) {
    message.set("ns.sreg", SREG_NS_1_1);
    message.set("sreg.optional", SREG_REQUESTED);

    message.set("ns.ax", AX_NS);
    message.set("ax.mode", "fetch_request");
    for (alias, path) in AX_REQUESTED {
        message.set(format!("ax.type.{alias}"), format!("{}{path}", AX_SCHEMAS[0]));
    }
    message.set("ax.type.account_verified", VERIFICATION_NS);
    let mut aliases: Vec<&str> = AX_REQUESTED.iter().map(|(alias, _)| *alias).collect();
    aliases.push("account_verified");
    message.set("ax.if_available", aliases.join(","));

    if !queried_groups.is_empty() {
        let teams: Vec<&str> = queried_groups.iter().map(String::as_str).collect();
        message.set("ns.lp", TEAMS_NS);
        message.set("lp.query_membership", teams.join(","));
    }
}
