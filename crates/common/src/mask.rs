//! Credential fingerprints for logs and notifications

/// Number of leading characters kept in a fingerprint.
const VISIBLE_CHARS: usize = 8;

/// Shorten a credential to its first characters followed by `...`.
///
/// Secrets shorter than the visible prefix are fully hidden so a short test
/// key never leaks verbatim.
pub fn mask(secret: &str) -> String {
    if secret.chars().count() <= VISIBLE_CHARS {
        return "...".to_string();
    }
    let prefix: String = secret.chars().take(VISIBLE_CHARS).collect();
    format!("{prefix}...")
}
