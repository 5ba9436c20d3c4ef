//! Recipient token normalization and validation.
//!
//! Queue files hold one token per line. Ingestion writes `@handle` when the
//! sender has a public username and falls back to a message permalink or a
//! numeric id otherwise; only handles are sendable.

use std::sync::OnceLock;

use regex_lite::Regex;

const TG_LINK_PREFIX: &str = "https://t.me/";

fn bare_username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{5,}$").expect("static regex"))
}

fn handle_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^@[A-Za-z0-9_]{3,32}$").expect("static regex"))
}

/// Normalize a raw queue token to `@username` where possible.
///
/// Accepts `@username`, `username` and `https://t.me/username`. Anything
/// else is returned trimmed and unchanged, and will fail [`is_valid_handle`].
pub fn normalize_recipient(raw: &str) -> String {
    let mut s = raw.trim();
    if s.is_empty() {
        return String::new();
    }

    if let Some(rest) = s.strip_prefix(TG_LINK_PREFIX) {
        s = rest.trim().trim_matches('/');
    }

    if s.starts_with('@') {
        return s.to_string();
    }

    if bare_username_re().is_match(s) {
        return format!("@{}", s);
    }

    s.to_string()
}

/// Strict handle check: `@` followed by 3-32 letters, digits or underscores.
/// Short legacy handles such as `@bob` are accepted here even though a bare
/// `bob` is not promoted to a handle by [`normalize_recipient`].
pub fn is_valid_handle(s: &str) -> bool {
    handle_re().is_match(s)
}

/// Permalink to a message, used as the recipient token for senders without
/// a public username.
pub fn build_message_link(
    chat_username: Option<&str>,
    chat_id: i64,
    message_id: i64,
) -> Option<String> {
    if let Some(name) = chat_username.map(str::trim).filter(|n| !n.is_empty()) {
        return Some(format!("{}{}/{}", TG_LINK_PREFIX, name, message_id));
    }
    if chat_id == 0 {
        return None;
    }

    // Supergroup ids look like -100XXXXXXXXXX; private links drop the 100.
    let abs_id = chat_id.unsigned_abs();
    let digits = abs_id.to_string();
    let internal = match digits.strip_prefix("100") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => digits,
    };
    Some(format!("{}c/{}/{}", TG_LINK_PREFIX, internal, message_id))
}

/// Queue token for an inbound sender: `@handle` when a username exists,
/// otherwise the message link (or the numeric id) unless those are excluded.
pub fn recipient_token(
    username: Option<&str>,
    fallback_link: Option<&str>,
    sender_id: i64,
    exclude_no_username: bool,
) -> Option<String> {
    match username.map(str::trim).filter(|u| !u.is_empty()) {
        Some(name) if name.starts_with('@') => Some(name.to_string()),
        Some(name) => Some(format!("@{}", name)),
        None if exclude_no_username => None,
        None => Some(
            fallback_link
                .map(str::to_string)
                .unwrap_or_else(|| sender_id.to_string()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_and_linked_usernames() {
        assert_eq!(normalize_recipient("alice"), "@alice");
        assert_eq!(normalize_recipient("  @bob_smith "), "@bob_smith");
        assert_eq!(normalize_recipient("https://t.me/carol_x/"), "@carol_x");
        assert_eq!(normalize_recipient(""), "");
    }

    #[test]
    fn leaves_unrecognized_tokens_alone() {
        assert_eq!(normalize_recipient("not-a-name!"), "not-a-name!");
        assert_eq!(normalize_recipient("abc"), "abc");
        assert_eq!(
            normalize_recipient("https://t.me/c/123/45"),
            "c/123/45"
        );
    }

    #[test]
    fn strict_handle_validation() {
        assert!(is_valid_handle("@alice"));
        assert!(is_valid_handle("@a_b_c_1"));
        assert!(is_valid_handle("@bob"));
        assert!(!is_valid_handle("@ab"));
        assert!(!is_valid_handle("alice"));
        assert!(!is_valid_handle("@not-a-name"));
        assert!(!is_valid_handle(&format!("@{}", "x".repeat(33))));
    }

    #[test]
    fn message_links_for_public_and_private_chats() {
        assert_eq!(
            build_message_link(Some("somegroup"), -1001234, 7).as_deref(),
            Some("https://t.me/somegroup/7")
        );
        assert_eq!(
            build_message_link(None, -1001234567890, 9).as_deref(),
            Some("https://t.me/c/1234567890/9")
        );
        assert_eq!(build_message_link(None, 0, 9), None);
    }

    #[test]
    fn recipient_token_respects_username_exclusion() {
        assert_eq!(
            recipient_token(Some("dave_d"), None, 1, true).as_deref(),
            Some("@dave_d")
        );
        assert_eq!(recipient_token(None, Some("https://t.me/g/1"), 1, true), None);
        assert_eq!(
            recipient_token(None, Some("https://t.me/g/1"), 1, false).as_deref(),
            Some("https://t.me/g/1")
        );
        assert_eq!(recipient_token(None, None, 42, false).as_deref(), Some("42"));
    }
}
