use courtbook_core::{ActivityLogger, EmailSender, NotificationError, Outbound, OutboxReceiver};
use courtbook_shared::Masked;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers queued notifications until every `Outbox` handle is dropped.
/// Failures are logged and counted; they never reach the booking path.
pub async fn run_dispatcher(
    mut rx: OutboxReceiver,
    email: Arc<dyn EmailSender>,
    activity: Arc<dyn ActivityLogger>,
    send_timeout: Duration,
) -> DispatchStats {
    info!("Notification dispatcher started");
    let mut stats = DispatchStats::default();
    while let Some(message) = rx.recv().await {
        record(&mut stats, deliver(message, email.as_ref(), activity.as_ref(), send_timeout).await);
    }
    info!("Notification dispatcher stopped ({} delivered, {} failed)", stats.delivered, stats.failed);
    stats
}

/// Deliver whatever is queued right now, then return
pub async fn flush(
    rx: &mut OutboxReceiver,
    email: &dyn EmailSender,
    activity: &dyn ActivityLogger,
    send_timeout: Duration,
) -> DispatchStats {
    let mut stats = DispatchStats::default();
    for message in rx.drain() {
        record(&mut stats, deliver(message, email, activity, send_timeout).await);
    }
    stats
}

fn record(stats: &mut DispatchStats, outcome: Result<(), NotificationError>) {
    match outcome {
        Ok(()) => stats.delivered += 1,
        Err(_) => stats.failed += 1,
    }
}

async fn deliver(
    message: Outbound,
    email: &dyn EmailSender,
    activity: &dyn ActivityLogger,
    send_timeout: Duration,
) -> Result<(), NotificationError> {
    match message {
        Outbound::Email(request) => {
            let outcome = match timeout(send_timeout, email.send(&request)).await {
                Ok(result) => result,
                Err(_) => Err(NotificationError::Timeout(send_timeout)),
            };
            match &outcome {
                Ok(()) => debug!("Delivered {} email to {}", request.kind, Masked(&request.recipient)),
                Err(e) => error!("Failed to send {} email to {}: {}", request.kind, Masked(&request.recipient), e),
            }
            outcome
        }
        Outbound::Activity(entry) => {
            let action = entry.action.clone();
            let outcome = activity.log(entry).await;
            if let Err(e) = &outcome {
                warn!("Dropped activity entry '{}': {}", action, e);
            }
            outcome
        }
    }
}
