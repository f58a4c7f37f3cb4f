//! Username selection for auto-provisioned accounts.

/// Fallback when neither nickname nor email yields anything usable.
pub const DEFAULT_USERNAME: &str = "openiduser";

/// Pick the base username for a new account.
///
/// The nickname wins when present. Otherwise, if `use_email` is set, the
/// local part of the email with every non-ASCII-alphanumeric character
/// removed. Anything still empty falls back to [`DEFAULT_USERNAME`].
#[must_use]
pub fn preferred_username(nickname: Option<&str>, email: Option<&str>, use_email: bool) -> String {
    if let Some(nickname) = nickname.filter(|n| !n.trim().is_empty()) {
        return nickname.to_string();
    }

    if use_email {
        let local_part = email
            .and_then(|email| email.split('@').next())
            .unwrap_or_default();
        let suggestion: String = local_part
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        if !suggestion.is_empty() {
            return suggestion;
        }
    }

    DEFAULT_USERNAME.to_string()
}

/// The `attempt`-th candidate for `base`: `base`, `base2`, `base3`, ...
pub(super) fn candidate(base: &str, attempt: u32) -> String {
    if attempt <= 1 {
        base.to_string()
    } else {
        format!("{base}{attempt}")
    }
}
