//! Group membership claims reported by the provider.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// Whether a login may proceed under the required-group policy.
///
/// With no required groups every login passes. Otherwise the provider must
/// report membership in at least one of them, unless the user's email matches
/// an allow-list pattern.
#[must_use]
pub fn group_requirement_met(
    required: &BTreeSet<String>,
    reported: &BTreeSet<String>,
    email: &str,
    allowlist: &[Regex],
) -> bool {
    if required.is_empty() {
        return true;
    }
    if !email.is_empty() && allowlist.iter().any(|re| re.is_match(email)) {
        return true;
    }
    !required.is_disjoint(reported)
}

/// Translate provider group tokens into local group names.
#[must_use]
pub fn mapped_groups(
    reported: &BTreeSet<String>,
    mapping: &BTreeMap<String, String>,
) -> BTreeSet<String> {
    reported
        .iter()
        .filter_map(|token| mapping.get(token))
        .cloned()
        .collect()
}
