use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wraps an email address (or any player identifier) so that log macros like
/// `tracing::info!("{}", Masked(&email))` never print the full value.
///
/// Emails keep their first character and domain: `a***@example.com`.
/// Anything without an `@` collapses to `********`.
#[derive(Clone, Deserialize)]
pub struct Masked<T>(pub T);

impl<T: AsRef<str>> Masked<T> {
    fn render(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = self.0.as_ref().trim();
        match raw.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
                let first = local.chars().next().unwrap_or('*');
                write!(f, "{}***@{}", first, domain)
            }
            _ => write!(f, "********"),
        }
    }
}

impl<T: AsRef<str>> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f)
    }
}

impl<T: AsRef<str>> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f)
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Payloads sent to collaborators need the real address; only formatting is masked.
        self.0.serialize(serializer)
    }
}

impl<T> Masked<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_is_masked_in_logs() {
        let masked = Masked("alice@example.com");
        assert_eq!(format!("{}", masked), "a***@example.com");
        assert_eq!(format!("{:?}", masked), "a***@example.com");
    }

    #[test]
    fn test_non_email_is_fully_masked() {
        assert_eq!(format!("{}", Masked("not-an-email")), "********");
        assert_eq!(format!("{}", Masked(String::from("@nobody"))), "********");
    }

    #[test]
    fn test_serialization_keeps_value() {
        let json = serde_json::to_string(&Masked("bob@example.com")).unwrap();
        assert_eq!(json, "\"bob@example.com\"");
    }
}
