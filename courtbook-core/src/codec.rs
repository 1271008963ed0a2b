//! Codec for the legacy composite booking string stored in `bookings.json`:
//!
//! ```text
//! {time} - {title} ({name}) ({email})
//! ```
//!
//! The raw string never travels past this module; everything else works with
//! [`BookingEntry`].

use std::fmt;
use std::str::FromStr;

const SEPARATOR: &str = " - ";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Booking string has no trailing (email) group: {0}")]
    MissingEmail(String),

    #[error("Booking string has no (name) group: {0}")]
    MissingName(String),

    #[error("Booking string has no ' - ' between time and title: {0}")]
    MissingSeparator(String),

    #[error("Field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("Field `{field}` cannot be encoded: {value}")]
    Unencodable { field: &'static str, value: String },
}

/// One decoded seat occupancy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookingEntry {
    pub time: String,
    pub title: String,
    pub name: String,
    pub email: String,
}

impl BookingEntry {
    /// Build an entry from user input. Fields are trimmed and checked so
    /// that `parse(entry.to_string())` gives the same entry back.
    pub fn new(
        time: impl AsRef<str>,
        title: impl AsRef<str>,
        name: impl AsRef<str>,
        email: impl AsRef<str>,
    ) -> Result<Self, CodecError> {
        let time = time.as_ref().trim();
        let title = title.as_ref().trim();
        let name = name.as_ref().trim();
        let email = email.as_ref().trim();

        validate_slot_identity(time, title)?;
        if name.is_empty() {
            return Err(CodecError::EmptyField("name"));
        }
        if email.is_empty() {
            return Err(CodecError::EmptyField("email"));
        }
        if email.contains(['(', ')']) {
            return Err(CodecError::Unencodable { field: "email", value: email.to_string() });
        }
        if !balanced(name) {
            return Err(CodecError::Unencodable { field: "name", value: name.to_string() });
        }

        Ok(Self {
            time: time.to_string(),
            title: title.to_string(),
            name: name.to_string(),
            email: email.to_string(),
        })
    }

    /// Decode a stored booking string.
    ///
    /// The last two parenthesized groups are always `(name)(email)`; what is
    /// left is split on the first `" - "` into time and title, so titles may
    /// carry their own parentheses or hyphens.
    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        let (rest, email) =
            split_trailing_group(raw).ok_or_else(|| CodecError::MissingEmail(raw.to_string()))?;
        let (rest, name) =
            split_trailing_group(rest).ok_or_else(|| CodecError::MissingName(raw.to_string()))?;
        let (time, title) = rest
            .trim()
            .split_once(SEPARATOR)
            .ok_or_else(|| CodecError::MissingSeparator(raw.to_string()))?;

        let entry = Self {
            time: time.trim().to_string(),
            title: title.trim().to_string(),
            name: name.trim().to_string(),
            email: email.trim().to_string(),
        };
        for (field, value) in [
            ("time", &entry.time),
            ("title", &entry.title),
            ("name", &entry.name),
            ("email", &entry.email),
        ] {
            if value.is_empty() {
                return Err(CodecError::EmptyField(field));
            }
        }
        Ok(entry)
    }

    /// Whole-field slot match on trimmed time and title, ignoring case.
    pub fn matches_slot(&self, time: &str, title: &str) -> bool {
        self.time.eq_ignore_ascii_case(time.trim()) && self.title.eq_ignore_ascii_case(title.trim())
    }

    /// Same seat holder in the same slot. Email comparison ignores case.
    pub fn same_booking(&self, other: &BookingEntry) -> bool {
        self.matches_slot(&other.time, &other.title) && self.has_email(&other.email)
    }

    pub fn has_email(&self, email: &str) -> bool {
        self.email.eq_ignore_ascii_case(email.trim())
    }

    /// Lower-cased email used for de-duplication
    pub fn email_key(&self) -> String {
        self.email.to_lowercase()
    }

    /// Same holder, different slot identity. Used when a session is renamed.
    pub fn retitled(&self, time: &str, title: &str) -> Self {
        Self {
            time: time.trim().to_string(),
            title: title.trim().to_string(),
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

impl fmt::Display for BookingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{} ({}) ({})", self.time, SEPARATOR, self.title, self.name, self.email)
    }
}

impl FromStr for BookingEntry {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Checks a slot's time/title pair can be embedded in a booking string.
pub fn validate_slot_identity(time: &str, title: &str) -> Result<(), CodecError> {
    let time = time.trim();
    let title = title.trim();
    if time.is_empty() {
        return Err(CodecError::EmptyField("time"));
    }
    if title.is_empty() {
        return Err(CodecError::EmptyField("title"));
    }
    // The first " - " is the time/title boundary.
    if time.contains(SEPARATOR) {
        return Err(CodecError::Unencodable { field: "time", value: time.to_string() });
    }
    Ok(())
}

/// Splits `"... (inner)"` into `("...", "inner")`, honouring nested parens
/// inside the group.
fn split_trailing_group(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_end();
    if !s.ends_with(')') {
        return None;
    }
    let mut depth = 0usize;
    for (idx, ch) in s.char_indices().rev() {
        match ch {
            ')' => depth += 1,
            '(' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&s[..idx], &s[idx + 1..s.len() - 1]));
                }
            }
            _ => {}
        }
    }
    None
}

fn balanced(s: &str) -> bool {
    let mut depth = 0i32;
    for ch in s.chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_booking() {
        let entry = BookingEntry::parse("18:00 - Open Run (Bob Smith) (bob@example.com)").unwrap();
        assert_eq!(entry.time, "18:00");
        assert_eq!(entry.title, "Open Run");
        assert_eq!(entry.name, "Bob Smith");
        assert_eq!(entry.email, "bob@example.com");
    }

    #[test]
    fn test_title_with_parentheses_and_hyphens() {
        let entry =
            BookingEntry::parse("10:00 - Drop-in - Training (U16) (Ann) (ann@example.com)").unwrap();
        assert_eq!(entry.time, "10:00");
        assert_eq!(entry.title, "Drop-in - Training (U16)");
        assert_eq!(entry.name, "Ann");
    }

    #[test]
    fn test_name_with_nested_parentheses() {
        let entry = BookingEntry::new("19:00", "Scrimmage", "Joe (Jr)", "joe@example.com").unwrap();
        let raw = entry.to_string();
        assert_eq!(raw, "19:00 - Scrimmage (Joe (Jr)) (joe@example.com)");
        assert_eq!(BookingEntry::parse(&raw).unwrap(), entry);
    }

    #[test]
    fn test_malformed_strings_are_rejected() {
        assert!(matches!(
            BookingEntry::parse("18:00 - Open Run (Bob)"),
            Err(CodecError::MissingName(_))
        ));
        assert!(matches!(BookingEntry::parse("just text"), Err(CodecError::MissingEmail(_))));
        assert!(matches!(
            BookingEntry::parse("18:00 Open Run (Bob) (bob@example.com)"),
            Err(CodecError::MissingSeparator(_))
        ));
        assert!(matches!(
            BookingEntry::parse("18:00 - Open Run () (bob@example.com)"),
            Err(CodecError::EmptyField("name"))
        ));
    }

    #[test]
    fn test_exact_match_not_prefix() {
        let entry = BookingEntry::parse("18:00 - Training Advanced (Bob) (bob@example.com)").unwrap();
        assert!(!entry.matches_slot("18:00", "Training"));
        assert!(entry.matches_slot(" 18:00 ", "Training Advanced "));
    }

    #[test]
    fn test_slot_match_ignores_case() {
        let entry = BookingEntry::parse("18:00 - Open Run (Bob) (bob@example.com)").unwrap();
        assert!(entry.matches_slot("18:00", "open run"));
        assert!(entry.matches_slot("18:00", "OPEN RUN "));
        assert!(!entry.matches_slot("18:00", "open run plus"));

        let lower = BookingEntry::new("18:00", "open run", "Robert", "BOB@example.com").unwrap();
        assert!(entry.same_booking(&lower));
    }

    #[test]
    fn test_slot_identity_is_checked_before_encoding() {
        assert!(crate::validate_slot_identity("18:00", "Open Run").is_ok());
        assert!(matches!(crate::validate_slot_identity(" ", "Open Run"), Err(CodecError::EmptyField("time"))));
        assert!(matches!(
            crate::validate_slot_identity("18:00 - 19:00", "Open Run"),
            Err(CodecError::Unencodable { field: "time", .. })
        ));
    }

    #[test]
    fn test_same_booking_ignores_email_case() {
        let a = BookingEntry::new("18:00", "Open Run", "Bob", "Bob@Example.com").unwrap();
        let b = BookingEntry::new("18:00", "Open Run", "Robert", "bob@example.com").unwrap();
        assert!(a.same_booking(&b));
        assert_eq!(a.email_key(), "bob@example.com");
    }

    #[test]
    fn test_new_rejects_unencodable_input() {
        assert!(matches!(
            BookingEntry::new("18:00", "Open", "Bob", "bob(at)example.com"),
            Err(CodecError::Unencodable { field: "email", .. })
        ));
        assert!(matches!(
            BookingEntry::new("18:00", "Open", "Bob (", "bob@example.com"),
            Err(CodecError::Unencodable { field: "name", .. })
        ));
        assert!(matches!(
            BookingEntry::new("18:00 - 19:00", "Open", "Bob", "bob@example.com"),
            Err(CodecError::Unencodable { field: "time", .. })
        ));
        assert!(matches!(
            BookingEntry::new("18:00", "  ", "Bob", "bob@example.com"),
            Err(CodecError::EmptyField("title"))
        ));
    }
}
