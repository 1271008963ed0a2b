use chrono::{DateTime, Utc};
use courtbook_core::{BookingEntry, CodecError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// `availableSlots.json`: date → slots offered that day
pub type SlotsTable = BTreeMap<String, Vec<Slot>>;
/// `bookings.json`: date → encoded booking strings (the source of truth)
pub type BookingsTable = BTreeMap<String, Vec<String>>;
/// `bookingMappings.json`: bookingId → mapping
pub type MappingsTable = BTreeMap<String, BookingMapping>;
/// `waitlist.json`: date (first date for blocks) → entries
pub type WaitlistTable = BTreeMap<String, Vec<WaitlistEntry>>;
/// `offers.json`: token → offer
pub type OffersTable = BTreeMap<String, Offer>;
/// `cancellations.json`: bookingId → record
pub type CancellationLedger = BTreeMap<String, CancellationRecord>;

/// One offered session occurrence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub time: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_count")]
    pub number_of_spots: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_count")]
    pub capacity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_dates: Vec<String>,
    /// Derived by the bridge engine, never edited by hand
    #[serde(default)]
    pub bridge_state: bool,
    /// Cache of the holders parsed from `bookings.json`
    #[serde(default)]
    pub booked_users: Vec<BookedUser>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Slot {
    pub fn new(time: &str, title: &str, capacity: u32) -> Self {
        Self {
            time: time.to_string(),
            title: title.to_string(),
            number_of_spots: Some(capacity),
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Turn this slot into one date of a recurring block
    pub fn in_block(mut self, block_id: &str, dates: &[&str]) -> Self {
        self.block_id = Some(block_id.to_string());
        self.block_dates = dates.iter().map(|d| d.to_string()).collect();
        self
    }

    /// `numberOfSpots`, falling back to `capacity`, else 0
    pub fn capacity(&self) -> u32 {
        self.number_of_spots.or(self.capacity).unwrap_or(0)
    }

    pub fn set_capacity(&mut self, capacity: u32) {
        self.number_of_spots = Some(capacity);
        self.capacity = Some(capacity);
    }

    pub fn block_key(&self) -> Option<&str> {
        self.block_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    /// Block-wide slots carry both a block id and the block's dates
    pub fn is_block(&self) -> bool {
        self.block_key().is_some() && !self.block_dates.is_empty()
    }

    pub fn matches_identity(&self, time: &str, title: &str) -> bool {
        self.time.trim() == time.trim() && self.title.trim() == title.trim()
    }

    /// Same block instance on another date
    pub fn is_block_sibling(&self, block_id: &str, time: &str, title: &str) -> bool {
        self.block_key() == Some(block_id) && self.matches_identity(time, title)
    }
}

/// Entry of a slot's `bookedUsers` cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "BookedUserRepr")]
pub struct BookedUser {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub email: String,
}

impl BookedUser {
    pub fn new(name: &str, email: &str) -> Self {
        Self { name: Some(name.to_string()), email: email.to_string() }
    }

    pub fn email_key(&self) -> String {
        self.email.trim().to_lowercase()
    }
}

impl From<&BookingEntry> for BookedUser {
    fn from(entry: &BookingEntry) -> Self {
        Self { name: Some(entry.name.clone()), email: entry.email_key() }
    }
}

/// Old data files hold either `{name, email}` objects or whole booking strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum BookedUserRepr {
    Record {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        email: Option<String>,
    },
    Legacy(String),
}

impl From<BookedUserRepr> for BookedUser {
    fn from(repr: BookedUserRepr) -> Self {
        match repr {
            BookedUserRepr::Record { name, email } => Self { name, email: email.unwrap_or_default() },
            BookedUserRepr::Legacy(raw) => match BookingEntry::parse(&raw) {
                Ok(entry) => BookedUser::from(&entry),
                Err(_) if raw.contains('@') => Self { name: None, email: raw.trim().to_string() },
                Err(_) => Self { name: None, email: String::new() },
            },
        }
    }
}

/// Reservation status carried by a booking mapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MappingStatus {
    #[serde(alias = "pending", alias = "PENDING")]
    Pending,
    #[serde(alias = "reserved", alias = "RESERVED")]
    Reserved,
    #[serde(alias = "confirmed", alias = "CONFIRMED")]
    Confirmed,
}

/// Handle on one logical reservation, possibly spanning a whole block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingMapping {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub date: String,
    #[serde(rename = "slot")]
    pub time: String,
    pub title: String,
    #[serde(default)]
    pub is_block: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_dates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub status: MappingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flexible_time::option")]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now", deserialize_with = "flexible_time::required")]
    pub created_at: DateTime<Utc>,
    /// Unix seconds
    #[serde(default)]
    pub reservation_timestamp: i64,
    /// Unix seconds
    #[serde(default)]
    pub expiry_timestamp: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BookingMapping {
    /// Every date this reservation occupies
    pub fn dates(&self) -> Vec<String> {
        if self.is_block && !self.block_dates.is_empty() {
            self.block_dates.clone()
        } else if self.date.is_empty() {
            self.block_dates.first().cloned().into_iter().collect()
        } else {
            vec![self.date.clone()]
        }
    }

    /// `date`, or the first block date when `date` is blank
    pub fn primary_date(&self) -> String {
        if self.date.is_empty() {
            self.block_dates.first().cloned().unwrap_or_default()
        } else {
            self.date.clone()
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == MappingStatus::Confirmed || self.confirmed_at.is_some()
    }

    /// Only pending reservations time out
    pub fn is_expired_at(&self, now_ts: i64) -> bool {
        self.status == MappingStatus::Pending && !self.is_confirmed() && now_ts > self.expiry_timestamp
    }

    pub fn entry(&self) -> Result<BookingEntry, CodecError> {
        BookingEntry::new(&self.time, &self.title, &self.name, &self.email)
    }

    pub fn slot_ref(&self) -> SlotRef {
        SlotRef {
            date: self.primary_date(),
            time: self.time.clone(),
            title: self.title.clone(),
            block_id: self.block_id.clone().filter(|_| self.is_block),
            session_key: None,
        }
    }
}

/// Someone waiting for a seat. Block-wide entries live under the block's first date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistEntry {
    pub time: String,
    pub title: String,
    #[serde(default = "default_session_type")]
    pub session_type: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_dates: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_block: bool,
    #[serde(default = "Utc::now", deserialize_with = "flexible_time::required")]
    pub joined_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_session_type() -> String {
    "unknown".to_string()
}

impl WaitlistEntry {
    pub fn matches_slot(&self, time: &str, title: &str) -> bool {
        self.time.trim() == time.trim() && self.title.trim() == title.trim()
    }

    pub fn has_email(&self, email: &str) -> bool {
        self.email.trim().eq_ignore_ascii_case(email.trim())
    }

    pub fn block_key(&self) -> Option<&str> {
        self.block_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    /// `(lower(email), time, title, blockId)`: at most one entry per key per date
    pub fn dedupe_key(&self) -> (String, String, String, String) {
        (
            self.email.trim().to_lowercase(),
            self.time.trim().to_string(),
            self.title.trim().to_string(),
            self.block_key().unwrap_or_default().to_string(),
        )
    }

    /// Same time, title and block as `other`
    pub fn same_slot_as(&self, other: &WaitlistEntry) -> bool {
        self.matches_slot(&other.time, &other.title) && self.block_key() == other.block_key()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    Pending,
    Reserved,
    Confirmed,
    Declined,
    Expired,
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OfferStatus::Pending => "pending",
            OfferStatus::Reserved => "reserved",
            OfferStatus::Confirmed => "confirmed",
            OfferStatus::Declined => "declined",
            OfferStatus::Expired => "expired",
        };
        f.write_str(label)
    }
}

/// Token-addressed seat offer sent to a waitlisted player
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub date: String,
    pub time: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_dates: Vec<String>,
    #[serde(deserialize_with = "flexible_time::required")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "flexible_time::required")]
    pub expires_at: DateTime<Utc>,
    pub status: OfferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flexible_time::option")]
    pub reserved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flexible_time::option")]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flexible_time::option")]
    pub declined_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flexible_time::option")]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Offer {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Pending and not yet past its deadline
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == OfferStatus::Pending && !self.is_expired_at(now)
    }

    pub fn block_key(&self) -> Option<&str> {
        self.block_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    /// Dates the offer covers; legacy offers may carry only `date`
    pub fn dates(&self) -> Vec<String> {
        if self.block_dates.is_empty() {
            vec![self.date.clone()]
        } else {
            self.block_dates.clone()
        }
    }

    pub fn slot_ref(&self) -> SlotRef {
        SlotRef {
            date: self.date.clone(),
            time: self.time.clone(),
            title: self.title.clone(),
            block_id: self.block_key().map(str::to_string),
            session_key: self.session_key.clone().filter(|k| !k.trim().is_empty()),
        }
    }

    /// Stamp the timestamp that goes with a status change
    pub fn mark(&mut self, status: OfferStatus, at: DateTime<Utc>) {
        self.status = status;
        match status {
            OfferStatus::Reserved => self.reserved_at = Some(at),
            OfferStatus::Confirmed => self.confirmed_at = Some(at),
            OfferStatus::Declined => self.declined_at = Some(at),
            OfferStatus::Expired => self.expired_at = Some(at),
            OfferStatus::Pending => {
                self.reserved_at = None;
                self.confirmed_at = None;
                self.declined_at = None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CancellationOutcome {
    Cancelled,
    Expired,
}

/// Ledger row written exactly once per cancelled bookingId
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancellationRecord {
    pub booking_id: String,
    pub name: String,
    pub email: String,
    pub date: String,
    #[serde(rename = "slot")]
    pub time: String,
    pub title: String,
    #[serde(default)]
    pub is_block: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_dates: Vec<String>,
    pub cancellation_reason: String,
    #[serde(default = "default_outcome")]
    pub outcome: CancellationOutcome,
    #[serde(deserialize_with = "flexible_time::required")]
    pub cancelled_at: DateTime<Utc>,
    /// Unix seconds
    #[serde(default)]
    pub timestamp: i64,
}

fn default_outcome() -> CancellationOutcome {
    CancellationOutcome::Cancelled
}

impl CancellationRecord {
    pub fn from_mapping(
        booking_id: &str,
        mapping: &BookingMapping,
        reason: &str,
        outcome: CancellationOutcome,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            booking_id: booking_id.to_string(),
            name: mapping.name.clone(),
            email: mapping.email.clone(),
            date: mapping.primary_date(),
            time: mapping.time.clone(),
            title: mapping.title.clone(),
            is_block: mapping.is_block,
            block_dates: mapping.block_dates.clone(),
            cancellation_reason: reason.to_string(),
            outcome,
            cancelled_at: at,
            timestamp: at.timestamp(),
        }
    }
}

/// Points at a slot: `sessionKey` when known, otherwise `(date, time, title)`
/// narrowed by `blockId`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SlotRef {
    pub date: String,
    pub time: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

impl SlotRef {
    pub fn new(date: &str, time: &str, title: &str) -> Self {
        Self {
            date: date.trim().to_string(),
            time: time.trim().to_string(),
            title: title.trim().to_string(),
            block_id: None,
            session_key: None,
        }
    }

    pub fn with_block(mut self, block_id: &str) -> Self {
        self.block_id = Some(block_id.to_string()).filter(|id| !id.trim().is_empty());
        self
    }

    pub fn with_session_key(mut self, key: &str) -> Self {
        self.session_key = Some(key.to_string()).filter(|k| !k.trim().is_empty());
        self
    }

    /// Identity match on time and title, narrowed by block when one is set.
    /// `sessionKey` is only consulted by [`SlotRef::locate`].
    pub fn matches(&self, slot: &Slot) -> bool {
        let block_ok = match self.block_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => slot.block_key() == Some(id),
            _ => true,
        };
        block_ok && slot.matches_identity(&self.time, &self.title)
    }

    /// Index and slot on `self.date`, preferring a `sessionKey` match
    pub fn locate<'a>(&self, slots: &'a SlotsTable) -> Option<(usize, &'a Slot)> {
        let day = slots.get(&self.date)?;
        if let Some(key) = self.session_key.as_deref() {
            if let Some(found) = day
                .iter()
                .enumerate()
                .find(|(_, slot)| slot.session_key.as_deref().map(str::trim) == Some(key.trim()))
            {
                return Some(found);
            }
        }
        day.iter().enumerate().find(|(_, slot)| self.matches(slot))
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} on {}", self.time, self.title, self.date)
    }
}

fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(|n| n.min(u64::from(u32::MAX)) as u32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Accepts RFC 3339, the legacy `YYYY-MM-DD HH:MM:SS` form, or unix seconds.
pub(crate) mod flexible_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok().map(|n| n.and_utc()))
    }

    fn from_value(value: &Value) -> Option<DateTime<Utc>> {
        match value {
            Value::String(s) => parse(s),
            Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
            _ => None,
        }
    }

    pub fn required<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        from_value(&value).ok_or_else(|| D::Error::custom(format!("unrecognised timestamp: {}", value)))
    }

    pub fn option<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(from_value(&value))
    }
}
