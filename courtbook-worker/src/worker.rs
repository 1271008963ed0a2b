use courtbook_booking::{BookingError, BookingManager, ExpirySweep, OfferCleanup};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

#[derive(Debug, Default, Serialize)]
pub struct SweepSummary {
    pub bookings: ExpirySweep,
    pub offers: OfferCleanup,
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Booking(#[from] BookingError),

    #[error("Sweep task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One expiry pass: lapsed pending bookings, then lapsed offers.
/// The booking core is blocking file I/O, so it runs off the async threads.
pub async fn sweep_once(manager: Arc<BookingManager>) -> Result<SweepSummary, SweepError> {
    let summary = tokio::task::spawn_blocking(move || -> Result<SweepSummary, BookingError> {
        let bookings = manager.expire_pending_bookings()?;
        let offers = manager.cleanup_expired_offers()?;
        Ok(SweepSummary { bookings, offers })
    })
    .await??;
    Ok(summary)
}

/// Runs [`sweep_once`] every `every` until the task is dropped
pub async fn start_expiry_worker(manager: Arc<BookingManager>, every: Duration) {
    info!("Expiry worker started, sweeping every {:?}", every);
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match sweep_once(manager.clone()).await {
            Ok(summary) => {
                let expired = summary.bookings.expired.len();
                let offers = summary.offers.expired.len();
                if expired > 0 || offers > 0 || !summary.bookings.failed.is_empty() {
                    info!(
                        "Sweep: {} booking(s) expired, {} skipped, {} failed, {} offer(s) expired",
                        expired,
                        summary.bookings.skipped.len(),
                        summary.bookings.failed.len(),
                        offers
                    );
                }
            }
            Err(e) => error!("Expiry sweep failed: {}", e),
        }
    }
}
