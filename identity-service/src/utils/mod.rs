pub mod password;
pub mod validation;

/// Canonical email form used for lookups and provider matching: trimmed and
/// lowercased. Stored emails are normalized on the way in, so lookups by
/// normalized email are exact.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
