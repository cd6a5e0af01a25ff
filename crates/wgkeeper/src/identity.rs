//! Peer identity resolution from the comment block preceding a `[Peer]`.
//!
//! Configurations are edited by hand, so names show up in several forms:
//!
//! ```text
//! # 客户端: alice
//! # Client: bob
//! # carol
//! ```
//!
//! Each form is a separate pure matcher, tried in order. When none matches,
//! the identity falls back to a suffix of the public key.

/// Labels accepted in `# <label>: <name>` headers.
pub const CLIENT_LABELS: &[&str] = &["客户端", "Client", "client"];

/// Words that document a field rather than name a peer.
const RESERVED_WORDS: &[&str] = &[
    "Peer",
    "PublicKey",
    "AllowedIPs",
    "Endpoint",
    "PersistentKeepalive",
];

/// Prefix of synthesized names.
pub const FALLBACK_PREFIX: &str = "Unknown-";

const FALLBACK_SUFFIX_LEN: usize = 8;

/// A matcher inspects one comment line and returns the captured name.
pub type NameMatcher = fn(&str) -> Option<&str>;

/// Matchers in priority order.
pub const NAME_MATCHERS: &[(&str, NameMatcher)] = &[("label", match_label), ("bare", match_bare)];

/// Label written into headers of peers this crate adds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderLabel {
    #[default]
    Chinese,
    English,
}

impl HeaderLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            HeaderLabel::Chinese => CLIENT_LABELS[0],
            HeaderLabel::English => CLIENT_LABELS[1],
        }
    }

    /// `# <label>: <name>`
    pub fn header_line(self, name: &str) -> String {
        format!("# {}: {}", self.as_str(), name)
    }
}

fn comment_body(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('#') {
        return None;
    }
    Some(trimmed.trim_start_matches('#').trim_start())
}

/// Split `# <label>: <token> <rest>` into `(token, rest)`.
fn split_label(line: &str) -> Option<(&str, &str)> {
    let body = comment_body(line)?;
    let after_label = CLIENT_LABELS
        .iter()
        .find_map(|label| body.strip_prefix(*label))?
        .trim_start();
    let after_colon = after_label
        .strip_prefix(':')
        .or_else(|| after_label.strip_prefix('：'))?
        .trim_start();
    let end = after_colon
        .find(char::is_whitespace)
        .unwrap_or(after_colon.len());
    if end == 0 {
        return None;
    }
    Some(after_colon.split_at(end))
}

/// `# 客户端: alice`, `# Client：alice` -> `alice`
pub fn match_label(line: &str) -> Option<&str> {
    split_label(line).map(|(token, _)| token)
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// The whole comment is a single `[A-Za-z0-9_-]+` token.
fn bare_token(line: &str) -> Option<&str> {
    let token = comment_body(line)?.trim_end();
    if token.is_empty() || !token.chars().all(is_name_char) {
        return None;
    }
    Some(token)
}

/// `# alice` -> `alice`, but not `# PublicKey` or single characters.
pub fn match_bare(line: &str) -> Option<&str> {
    let token = bare_token(line)?;
    if token.len() <= 1
        || RESERVED_WORDS
            .iter()
            .any(|word| word.eq_ignore_ascii_case(token))
    {
        return None;
    }
    Some(token)
}

/// True when a comment line announces a peer rather than documenting one.
pub fn is_peer_header(line: &str) -> bool {
    NAME_MATCHERS.iter().any(|(_, matcher)| matcher(line).is_some())
}

/// First capture of the first matcher that hits any line.
pub fn match_name<S: AsRef<str>>(comment_lines: &[S]) -> Option<&str> {
    NAME_MATCHERS.iter().find_map(|(_, matcher)| {
        comment_lines
            .iter()
            .find_map(|line| matcher(line.as_ref()))
    })
}

/// Last eight characters of the key after dropping `+`, `=` and `/`.
pub fn fallback_suffix(public_key: &str) -> String {
    let safe: Vec<char> = public_key
        .chars()
        .filter(|c| !matches!(c, '+' | '=' | '/'))
        .collect();
    let start = safe.len().saturating_sub(FALLBACK_SUFFIX_LEN);
    safe[start..].iter().collect()
}

pub fn fallback_name(public_key: &str) -> String {
    format!("{}{}", FALLBACK_PREFIX, fallback_suffix(public_key))
}

/// Display name for a peer. Depends only on its arguments, since both the
/// client list and traffic records are keyed by it.
pub fn resolve_name<S: AsRef<str>>(comment_lines: &[S], public_key: &str) -> String {
    match match_name(comment_lines) {
        Some(name) => name.to_string(),
        None => fallback_name(public_key),
    }
}

/// The key suffix of an `Unknown-<suffix>` target, if it is one.
pub fn fallback_target(target: &str) -> Option<&str> {
    target
        .strip_prefix(FALLBACK_PREFIX)
        .filter(|suffix| !suffix.is_empty())
}

/// Whether a comment block names `target` exactly, as the last token of a
/// label line or as a bare comment. Reserved words are not filtered here: a
/// delete request is explicit.
pub fn names_peer<S: AsRef<str>>(comment_lines: &[S], target: &str) -> bool {
    comment_lines.iter().any(|line| {
        let line = line.as_ref();
        let labelled = split_label(line)
            .map(|(token, rest)| token == target && rest.trim().is_empty())
            .unwrap_or(false);
        labelled || bare_token(line) == Some(target)
    })
}

/// Keep only `[A-Za-z0-9_-]`.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars().filter(|c| is_name_char(*c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "aB+c/dEfGh1jK2lM3nO4pQ5rS6tU7vW8xY9z0A/b+C=";

    #[test]
    fn test_label_forms() {
        assert_eq!(match_label("# 客户端: alice"), Some("alice"));
        assert_eq!(match_label("#客户端：alice"), Some("alice"));
        assert_eq!(match_label("# Client: bob"), Some("bob"));
        assert_eq!(match_label("  # client : bob-2 laptop"), Some("bob-2"));
        assert_eq!(match_label("# Client:"), None);
        assert_eq!(match_label("# Clients: x"), None);
        assert_eq!(match_label("Client: bob"), None);
    }

    #[test]
    fn test_bare_form_rejects_reserved_and_short() {
        assert_eq!(match_bare("# carol"), Some("carol"));
        assert_eq!(match_bare("## phone_2 "), Some("phone_2"));
        assert_eq!(match_bare("# x"), None);
        assert_eq!(match_bare("# PublicKey"), None);
        assert_eq!(match_bare("# allowedips"), None);
        assert_eq!(match_bare("# PEER"), None);
        assert_eq!(match_bare("# two words"), None);
        assert_eq!(match_bare("# 客户端"), None);
    }

    #[test]
    fn test_label_beats_bare() {
        let lines = ["# laptop", "# Client: dave"];
        assert_eq!(resolve_name(&lines, KEY), "dave");
    }

    #[test]
    fn test_first_matching_line_wins() {
        let lines = ["# x", "# PublicKey", "# eve", "# frank"];
        assert_eq!(resolve_name(&lines, KEY), "eve");
    }

    #[test]
    fn test_fallback_identity_is_stable() {
        let empty: [&str; 0] = [];
        let first = resolve_name(&empty, KEY);
        let second = resolve_name(&empty, KEY);
        assert_eq!(first, second);
        assert_eq!(first, "Unknown-xY9z0AbC");
        assert_eq!(fallback_suffix("ab+="), "ab");
    }

    #[test]
    fn test_fallback_ignores_blank_and_prose_comments() {
        let lines = ["", "# added on 2024-01-01 by admin"];
        assert_eq!(resolve_name(&lines, KEY), fallback_name(KEY));
    }

    #[test]
    fn test_fallback_target() {
        assert_eq!(fallback_target("Unknown-8xY9z0Ab"), Some("8xY9z0Ab"));
        assert_eq!(fallback_target("Unknown-"), None);
        assert_eq!(fallback_target("alice"), None);
    }

    #[test]
    fn test_names_peer_requires_exact_token() {
        let lines = ["# 客户端: alice"];
        assert!(names_peer(&lines, "alice"));
        assert!(!names_peer(&lines, "ali"));
        assert!(!names_peer(&["# Client: alice extra"], "alice"));
        assert!(names_peer(&["# bob"], "bob"));
        assert!(!names_peer(&["# bobby"], "bob"));
    }

    #[test]
    fn test_is_peer_header() {
        assert!(is_peer_header("# Client: alice"));
        assert!(is_peer_header("# alice"));
        assert!(!is_peer_header("# DNS for the office"));
        assert!(!is_peer_header("PublicKey = abc"));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("al ice!"), "alice");
        assert_eq!(sanitize_name("bob_2-phone"), "bob_2-phone");
        assert_eq!(sanitize_name("../../etc"), "etc");
        assert_eq!(sanitize_name("客户"), "");
    }

    #[test]
    fn test_header_line() {
        assert_eq!(HeaderLabel::Chinese.header_line("a1"), "# 客户端: a1");
        assert_eq!(HeaderLabel::English.header_line("a1"), "# Client: a1");
    }
}
