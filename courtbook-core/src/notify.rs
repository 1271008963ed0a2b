use async_trait::async_trait;
use courtbook_shared::{ActivityEntry, EmailRequest, Masked};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Email delivery failed: {0}")]
    Delivery(String),

    #[error("Email delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Activity log write failed: {0}")]
    Activity(String),
}

/// Outbound mail collaborator
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, request: &EmailRequest) -> Result<(), NotificationError>;
}

/// Admin activity feed. Best effort only.
#[async_trait]
pub trait ActivityLogger: Send + Sync {
    async fn log(&self, entry: ActivityEntry) -> Result<(), NotificationError>;
}

#[derive(Debug, Clone)]
pub enum Outbound {
    Email(EmailRequest),
    Activity(ActivityEntry),
}

/// Fire-and-forget handle the booking core uses to request notifications.
///
/// Enqueueing never blocks and never fails the caller; delivery happens on
/// whatever task drains the paired [`OutboxReceiver`].
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug)]
pub struct OutboxReceiver {
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Outbox {
    pub fn channel() -> (Outbox, OutboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Outbox { tx }, OutboxReceiver { rx })
    }

    /// An outbox nobody listens to. Every message is logged and dropped.
    pub fn disconnected() -> Self {
        let (outbox, _rx) = Self::channel();
        outbox
    }

    pub fn email(&self, request: EmailRequest) {
        let kind = request.kind;
        let recipient = Masked(request.recipient.clone());
        if self.tx.send(Outbound::Email(request)).is_err() {
            warn!(%kind, %recipient, "Notification outbox closed, dropping email");
        }
    }

    pub fn activity(&self, entry: ActivityEntry) {
        if let Err(e) = self.tx.send(Outbound::Activity(entry)) {
            if let Outbound::Activity(entry) = e.0 {
                warn!(action = %entry.action, "Notification outbox closed, dropping activity entry");
            }
        }
    }
}

impl OutboxReceiver {
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// Everything queued right now, without waiting
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut drained = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            drained.push(message);
        }
        drained
    }

    /// Queued email requests only, activity entries are discarded
    pub fn drain_emails(&mut self) -> Vec<EmailRequest> {
        self.drain()
            .into_iter()
            .filter_map(|message| match message {
                Outbound::Email(request) => Some(request),
                Outbound::Activity(_) => None,
            })
            .collect()
    }
}

/// Email sender that records requests instead of delivering them.
/// Can be told to fail every send.
#[derive(Debug, Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<EmailRequest>>,
    fail: bool,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { sent: Mutex::new(Vec::new()), fail: true }
    }

    pub fn sent(&self) -> Vec<EmailRequest> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, request: &EmailRequest) -> Result<(), NotificationError> {
        if self.fail {
            return Err(NotificationError::Delivery("relay unavailable".to_string()));
        }
        match self.sent.lock() {
            Ok(mut sent) => sent.push(request.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.clone()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtbook_shared::EmailKind;

    #[test]
    fn test_outbox_queues_in_order() {
        let (outbox, mut rx) = Outbox::channel();
        outbox.email(EmailRequest::new(EmailKind::Cancellation, "a@example.com", "A"));
        outbox.activity(ActivityEntry::new("booking", "Cancelled", "Open Run", ""));
        outbox.email(EmailRequest::new(EmailKind::OfferAvailable, "b@example.com", "B"));

        let drained = rx.drain();
        assert_eq!(drained.len(), 3);
        assert!(matches!(&drained[0], Outbound::Email(r) if r.recipient == "a@example.com"));
        assert!(matches!(&drained[1], Outbound::Activity(_)));
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn test_disconnected_outbox_does_not_panic() {
        let outbox = Outbox::disconnected();
        outbox.email(EmailRequest::new(EmailKind::Cancellation, "a@example.com", "A"));
        outbox.activity(ActivityEntry::new("booking", "Cancelled", "Open Run", ""));
    }

    #[tokio::test]
    async fn test_recording_sender() {
        let sender = RecordingEmailSender::new();
        let request = EmailRequest::new(EmailKind::SessionEdited, "c@example.com", "C");
        sender.send(&request).await.unwrap();
        assert_eq!(sender.sent(), vec![request.clone()]);

        let failing = RecordingEmailSender::failing();
        assert!(failing.send(&request).await.is_err());
        assert!(failing.sent().is_empty());
    }
}
