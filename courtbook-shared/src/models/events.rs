use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Email templates the mail collaborator knows how to render.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    BookingConfirmation,
    TemporaryReservation,
    Cancellation,
    WaitlistConfirmation,
    OfferAvailable,
    SessionEdited,
    SessionCancelled,
}

impl EmailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailKind::BookingConfirmation => "booking_confirmation",
            EmailKind::TemporaryReservation => "temporary_reservation",
            EmailKind::Cancellation => "cancellation",
            EmailKind::WaitlistConfirmation => "waitlist_confirmation",
            EmailKind::OfferAvailable => "offer_available",
            EmailKind::SessionEdited => "session_edited",
            EmailKind::SessionCancelled => "session_cancelled",
        }
    }
}

impl std::fmt::Display for EmailKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for the mail collaborator. Serializes to the flat body the
/// legacy `sendEmail` endpoint accepts: `{type, email, name, ...fields}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailRequest {
    #[serde(rename = "type")]
    pub kind: EmailKind,
    #[serde(rename = "email")]
    pub recipient: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EmailRequest {
    pub fn new(kind: EmailKind, recipient: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            recipient: recipient.into(),
            name: name.into(),
            fields: Map::new(),
        }
    }

    /// Attach a template field
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// One row of the admin activity feed (`activityLog.json`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEntry {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub title: String,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Value>,
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub seen: bool,
}

impl ActivityEntry {
    pub fn new(
        kind: impl Into<String>,
        action: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            action: action.into(),
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
            player: None,
            session: None,
            meta: Value::Object(Map::new()),
            seen: false,
        }
    }

    pub fn with_player(mut self, name: &str, email: &str) -> Self {
        self.player = Some(serde_json::json!({ "name": name, "email": email }));
        self
    }

    pub fn with_session(mut self, date: &str, time: &str, title: &str) -> Self {
        self.session = Some(serde_json::json!({ "date": date, "time": time, "title": title }));
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }
}
