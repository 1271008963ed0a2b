//! Runtime expiry overrides kept in `settings.json`.

use crate::error::{BookingError, BookingResult};
use crate::manager::BookingManager;
use crate::models::{MappingStatus, MappingsTable, OfferStatus, OffersTable};
use crate::tables;
use chrono::Duration;
use courtbook_core::{Table, WriteMode};
use courtbook_shared::ActivityEntry;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

/// Upper bound for any booking, offer or payment lifetime: one year.
pub const MAX_EXPIRY_SECONDS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_expiry_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_expiry_seconds: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BookingManager {
    pub fn expiry_overrides(&self) -> BookingResult<ExpiryOverrides> {
        tables::load(self.store(), Table::Settings)
    }

    /// Override from `settings.json`, else the configured default. Values
    /// outside `1..=MAX_EXPIRY_SECONDS` are ignored or clamped.
    pub fn booking_expiry_seconds(&self) -> BookingResult<i64> {
        let overrides = self.expiry_overrides()?;
        Ok(effective_expiry("booking", overrides.booking_expiry_seconds, self.rules.booking_expiry_seconds))
    }

    pub fn offer_expiry_seconds(&self) -> BookingResult<i64> {
        let overrides = self.expiry_overrides()?;
        Ok(effective_expiry("offer", overrides.offer_expiry_seconds, self.rules.offer_expiry_seconds))
    }

    /// Persist a new pending-booking lifetime and re-time every pending
    /// mapping from its reservation timestamp. Returns how many moved.
    pub fn set_booking_expiry(&self, seconds: i64) -> BookingResult<usize> {
        validate_expiry(seconds)?;

        tables::update(self.store(), Table::Settings, WriteMode::Replace, |s: &mut ExpiryOverrides| {
            s.booking_expiry_seconds = Some(seconds);
            Ok(())
        })?;

        let retimed = tables::update(self.store(), Table::BookingMappings, WriteMode::Replace, |mappings: &mut MappingsTable| {
            let mut retimed = 0;
            for mapping in mappings
                .values_mut()
                .filter(|m| m.status == MappingStatus::Pending && !m.is_confirmed())
            {
                let expiry = mapping.reservation_timestamp.checked_add(seconds).ok_or_else(|| {
                    BookingError::Validation(format!("Expiry of {}s overflows a reservation timestamp", seconds))
                })?;
                if mapping.expiry_timestamp != expiry {
                    mapping.expiry_timestamp = expiry;
                    retimed += 1;
                }
            }
            Ok(retimed)
        })?;

        self.refresh_derived_state(None)?;
        info!("Booking expiry set to {}s, {} pending booking(s) re-timed", seconds, retimed);
        self.record(
            ActivityEntry::new("settings", "Booking expiry updated", "Booking expiry", format!("{} seconds", seconds))
                .with_meta(json!({ "seconds": seconds, "retimed": retimed })),
        );
        Ok(retimed)
    }

    /// Persist a new offer lifetime and re-time every pending offer from its
    /// creation time.
    pub fn set_offer_expiry(&self, seconds: i64) -> BookingResult<usize> {
        let lifetime = expiry_lifetime(seconds)?;

        tables::update(self.store(), Table::Settings, WriteMode::Replace, |s: &mut ExpiryOverrides| {
            s.offer_expiry_seconds = Some(seconds);
            Ok(())
        })?;

        let retimed = tables::update(self.store(), Table::Offers, WriteMode::Replace, |offers: &mut OffersTable| {
            let mut retimed = 0;
            for offer in offers.values_mut().filter(|o| o.status == OfferStatus::Pending) {
                let expires_at = offer.created_at.checked_add_signed(lifetime).ok_or_else(|| {
                    BookingError::Validation(format!("Expiry of {}s overflows an offer's creation time", seconds))
                })?;
                if offer.expires_at != expires_at {
                    offer.expires_at = expires_at;
                    retimed += 1;
                }
            }
            Ok(retimed)
        })?;

        self.refresh_derived_state(None)?;
        info!("Offer expiry set to {}s, {} pending offer(s) re-timed", seconds, retimed);
        self.record(
            ActivityEntry::new("settings", "Offer expiry updated", "Offer expiry", format!("{} seconds", seconds))
                .with_meta(json!({ "seconds": seconds, "retimed": retimed })),
        );
        Ok(retimed)
    }
}

fn validate_expiry(seconds: i64) -> BookingResult<()> {
    if (1..=MAX_EXPIRY_SECONDS).contains(&seconds) {
        Ok(())
    } else {
        Err(BookingError::Validation(format!(
            "Expiry must be between 1 and {} seconds, got {}",
            MAX_EXPIRY_SECONDS, seconds
        )))
    }
}

/// Checked conversion of a lifetime in seconds
pub(crate) fn expiry_lifetime(seconds: i64) -> BookingResult<Duration> {
    validate_expiry(seconds)?;
    Duration::try_seconds(seconds)
        .ok_or_else(|| BookingError::Validation(format!("Expiry of {}s is out of range", seconds)))
}

fn effective_expiry(kind: &str, stored: Option<i64>, configured: i64) -> i64 {
    match stored {
        Some(seconds) if (1..=MAX_EXPIRY_SECONDS).contains(&seconds) => seconds,
        Some(seconds) => {
            warn!("Ignoring out-of-range {} expiry override of {}s", kind, seconds);
            configured.clamp(1, MAX_EXPIRY_SECONDS)
        }
        None => configured.clamp(1, MAX_EXPIRY_SECONDS),
    }
}
