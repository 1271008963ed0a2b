//! Seat offers for waitlisted players.
//!
//! The token is the only capability needed to act on an offer, so it is
//! drawn from the OS CSPRNG and every action first claims the offer under the
//! offers lock. A claim that cannot be fulfilled is handed back as pending.

use crate::error::{BookingError, BookingResult};
use crate::manager::{generate_booking_id, validate_email, BookingManager, BookingMutation, ResolvedSlot};
use crate::models::{
    BookingMapping, BookingsTable, MappingStatus, MappingsTable, Offer, OfferStatus, OffersTable, SlotRef, WaitlistEntry,
};
use crate::reconciler::parse_day;
use crate::settings::{expiry_lifetime, MAX_EXPIRY_SECONDS};
use crate::tables;
use crate::waitlist::{remove_entries, update_waitlist};
use chrono::{DateTime, Duration, Utc};
use courtbook_core::{BookingEntry, Table, WriteMode};
use courtbook_shared::{ActivityEntry, EmailKind, EmailRequest, Masked};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Map};
use std::collections::BTreeSet;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct OfferRequest {
    pub name: String,
    pub email: String,
    pub slot: SlotRef,
    pub block_dates: Vec<String>,
}

impl OfferRequest {
    /// Offer the seat to the player behind a waitlist entry stored under `date`
    pub fn from_waitlist(date: &str, entry: &WaitlistEntry) -> Self {
        let mut slot = SlotRef::new(date, &entry.time, &entry.title);
        if let Some(block) = entry.block_key() {
            slot = slot.with_block(block);
        }
        Self {
            name: entry.name.clone(),
            email: entry.email.clone(),
            slot,
            block_dates: entry.block_dates.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedOffer {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub reserve_url: String,
    pub confirm_url: String,
    pub decline_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acceptance {
    Reserve,
    Confirm,
}

impl Acceptance {
    fn offer_status(self) -> OfferStatus {
        match self {
            Acceptance::Reserve => OfferStatus::Reserved,
            Acceptance::Confirm => OfferStatus::Confirmed,
        }
    }

    fn mapping_status(self) -> MappingStatus {
        match self {
            Acceptance::Reserve => MappingStatus::Reserved,
            Acceptance::Confirm => MappingStatus::Confirmed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferAcceptance {
    pub booking_id: String,
    pub status: MappingStatus,
    pub dates: Vec<String>,
    /// The requester already held the seat, e.g. a retried request
    pub already_booked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OfferCleanup {
    /// Tokens moved from pending to expired
    pub expired: Vec<String>,
    pub waitlist_removed: usize,
}

enum Claim {
    Claimed(Offer),
    Lapsed(Offer),
}

impl BookingManager {
    pub fn create_offer(&self, request: OfferRequest) -> BookingResult<IssuedOffer> {
        validate_email(&request.email)?;
        let target = self.resolve_target(&request.slot, &request.block_dates)?;

        let now = Utc::now();
        let expires_at = now + expiry_lifetime(self.offer_expiry_seconds()?)?;
        let token = generate_offer_token();
        let offer = Offer {
            email: request.email.trim().to_string(),
            name: request.name.trim().to_string(),
            date: target.slot_ref.date.clone(),
            time: target.slot.time.clone(),
            title: target.slot.title.clone(),
            session_key: target.slot_ref.session_key.clone(),
            block_id: target.block_id.clone(),
            block_dates: if target.is_block() { target.dates.clone() } else { Vec::new() },
            created_at: now,
            expires_at,
            status: OfferStatus::Pending,
            reserved_at: None,
            confirmed_at: None,
            declined_at: None,
            expired_at: None,
            booking_id: None,
            extra: Map::new(),
        };

        tables::update(self.store(), Table::Offers, WriteMode::Replace, |offers: &mut OffersTable| {
            offers.insert(token.clone(), offer.clone());
            Ok(())
        })?;

        let issued = IssuedOffer {
            reserve_url: self.offer_link("reserveOffer", &token),
            confirm_url: self.offer_link("confirmOffer", &token),
            decline_url: self.offer_link("declineOffer", &token),
            token,
            expires_at,
        };
        info!("Offered {} to {} until {}", target.slot_ref, Masked(&offer.email), expires_at.to_rfc3339());

        self.notify(
            EmailRequest::new(EmailKind::OfferAvailable, &offer.email, &offer.name)
                .field("date", offer.date.as_str())
                .field("time", offer.time.as_str())
                .field("title", offer.title.as_str())
                .field("isBlock", target.is_block())
                .field("blockDates", json!(offer.block_dates))
                .field("expiresAt", expires_at.to_rfc3339())
                .field("confirmUrl", issued.reserve_url.as_str())
                .field("declineUrl", issued.decline_url.as_str()),
        );
        self.record(
            ActivityEntry::new("offer", "Offer sent", &offer.title, format!("Seat offered to {}", offer.name))
                .with_player(&offer.name, &offer.email)
                .with_session(&offer.date, &offer.time, &offer.title)
                .with_meta(json!({ "expiresAt": expires_at })),
        );
        Ok(issued)
    }

    /// Offer → confirmed booking
    pub fn confirm_offer(&self, token: &str) -> BookingResult<OfferAcceptance> {
        self.accept_offer(token, Acceptance::Confirm)
    }

    /// Offer → reserved booking awaiting payment
    pub fn reserve_offer(&self, token: &str) -> BookingResult<OfferAcceptance> {
        self.accept_offer(token, Acceptance::Reserve)
    }

    pub fn decline_offer(&self, token: &str) -> BookingResult<Offer> {
        let offer = self.claim_offer(token, OfferStatus::Declined)?;

        if let Err(e) = self.retire_waitlist_entries(std::slice::from_ref(&offer)) {
            self.release_offer_claim(token, OfferStatus::Declined);
            return Err(e);
        }
        self.refresh_derived_state(Some(&offer.slot_ref()))?;

        info!("Offer for {} declined by {}", offer.slot_ref(), Masked(&offer.email));
        self.record(
            ActivityEntry::new("offer", "Offer declined", &offer.title, format!("{} declined the offer", offer.name))
                .with_player(&offer.name, &offer.email)
                .with_session(&offer.date, &offer.time, &offer.title),
        );
        Ok(offer)
    }

    /// Expire lapsed pending offers and drop their waitlist entries
    pub fn cleanup_expired_offers(&self) -> BookingResult<OfferCleanup> {
        let now = Utc::now();
        let lapsed = tables::update(self.store(), Table::Offers, WriteMode::Replace, |offers: &mut OffersTable| {
            let mut lapsed = Vec::new();
            for (token, offer) in offers.iter_mut() {
                if offer.status == OfferStatus::Pending && offer.is_expired_at(now) {
                    offer.mark(OfferStatus::Expired, now);
                    lapsed.push((token.clone(), offer.clone()));
                }
            }
            Ok(lapsed)
        })?;

        let offers: Vec<Offer> = lapsed.iter().map(|(_, offer)| offer.clone()).collect();
        let waitlist_removed = self.retire_waitlist_entries(&offers)?;
        // Also resets flags left behind once waitlist and bookings are empty.
        self.refresh_derived_state(None)?;

        for offer in &offers {
            self.record(
                ActivityEntry::new("offer", "Offer expired", &offer.title, format!("Offer to {} expired", offer.name))
                    .with_player(&offer.name, &offer.email)
                    .with_session(&offer.date, &offer.time, &offer.title),
            );
        }
        if !lapsed.is_empty() {
            info!("Expired {} offer(s), removed {} waitlist entr(ies)", lapsed.len(), waitlist_removed);
        }
        Ok(OfferCleanup { expired: lapsed.into_iter().map(|(token, _)| token).collect(), waitlist_removed })
    }

    fn accept_offer(&self, token: &str, mode: Acceptance) -> BookingResult<OfferAcceptance> {
        let status = mode.offer_status();
        let offer = self.claim_offer(token, status)?;

        match self.fulfil_offer(token, &offer, mode) {
            Ok(acceptance) => Ok(acceptance),
            Err(e) => {
                warn!("Offer for {} could not be {}: {}", offer.slot_ref(), status, e);
                self.release_offer_claim(token, status);
                Err(e)
            }
        }
    }

    /// Atomically move a pending offer to `status`. A lapsed offer is marked
    /// expired instead and reported as such.
    fn claim_offer(&self, token: &str, status: OfferStatus) -> BookingResult<Offer> {
        let token = token.trim();
        if token.is_empty() {
            return Err(BookingError::Validation("Offer token is required".into()));
        }

        let now = Utc::now();
        let claim = tables::update(self.store(), Table::Offers, WriteMode::Replace, |offers: &mut OffersTable| {
            let offer = offers.get_mut(token).ok_or_else(|| BookingError::NotFound("Offer not found".into()))?;
            if offer.status != OfferStatus::Pending {
                return Err(BookingError::AlreadyProcessed(format!("This offer has already been {}", offer.status)));
            }
            if offer.is_expired_at(now) {
                offer.mark(OfferStatus::Expired, now);
                return Ok(Claim::Lapsed(offer.clone()));
            }
            offer.mark(status, now);
            Ok(Claim::Claimed(offer.clone()))
        })?;

        match claim {
            Claim::Claimed(offer) => Ok(offer),
            Claim::Lapsed(offer) => {
                self.retire_waitlist_entries(std::slice::from_ref(&offer))?;
                self.refresh_derived_state(Some(&offer.slot_ref()))?;
                Err(BookingError::Expired("This offer has expired".into()))
            }
        }
    }

    fn release_offer_claim(&self, token: &str, status: OfferStatus) {
        let released = tables::update(self.store(), Table::Offers, WriteMode::Replace, |offers: &mut OffersTable| {
            if let Some(offer) = offers.get_mut(token).filter(|o| o.status == status) {
                offer.mark(OfferStatus::Pending, Utc::now());
            }
            Ok(())
        });
        if let Err(e) = released {
            error!("Failed to release claim on offer: {}", e);
        }
    }

    fn fulfil_offer(&self, token: &str, offer: &Offer, mode: Acceptance) -> BookingResult<OfferAcceptance> {
        // Legacy offers lack block data; the slot supplies it.
        let target = self.resolve_target(&offer.slot_ref(), &offer.block_dates)?;
        let name = if offer.name.trim().is_empty() { offer.email.clone() } else { offer.name.clone() };
        let entry = BookingEntry::new(&target.slot.time, &target.slot.title, &name, &offer.email)?;

        let now = Utc::now();
        let mappings: MappingsTable = tables::load(self.store(), Table::BookingMappings)?;
        let existing = mappings
            .iter()
            .find(|(_, m)| {
                m.email.eq_ignore_ascii_case(&entry.email)
                    && entry.matches_slot(&m.time, &m.title)
                    && m.dates().iter().any(|d| target.dates.contains(d))
            })
            .map(|(id, _)| id.clone());
        let booking_id = existing.unwrap_or_else(|| generate_booking_id(now));

        let (payment_reference, payment_deadline) = match mode {
            Acceptance::Reserve => (
                Some(generate_payment_reference(now)),
                Some(now + Duration::seconds(self.rules.payment_window_seconds.clamp(1, MAX_EXPIRY_SECONDS))),
            ),
            Acceptance::Confirm => (None, None),
        };

        let status = mode.mapping_status();
        let mapping = BookingMapping {
            name: entry.name.clone(),
            email: entry.email.clone(),
            date: target.slot_ref.date.clone(),
            time: entry.time.clone(),
            title: entry.title.clone(),
            is_block: target.is_block(),
            block_id: target.block_id.clone(),
            block_dates: if target.is_block() { target.dates.clone() } else { Vec::new() },
            price: target.slot.price.clone(),
            location: target.slot.location.clone(),
            status,
            confirmed_at: (mode == Acceptance::Confirm).then_some(now),
            created_at: now,
            reservation_timestamp: now.timestamp(),
            expiry_timestamp: payment_deadline.unwrap_or(now).timestamp(),
            extra: payment_reference
                .iter()
                .map(|r| ("paymentReference".to_string(), json!(r)))
                .collect(),
        };

        let mutation = BookingMutation::Add { entry: entry.clone(), dates: target.dates.clone() };
        let mut already_booked = false;
        let seat_check = |bookings: &BookingsTable| -> BookingResult<()> {
            already_booked = check_capacity(&target, &entry, bookings)?;
            Ok(())
        };
        self.apply_guarded_mutation(&mutation, &target.slot_ref, seat_check, |_| {
            update_waitlist(self.store(), |waitlist| {
                Ok(remove_entries(waitlist, &target.dates, |w| {
                    w.has_email(&entry.email) && w.matches_slot(&entry.time, &entry.title)
                }))
            })?;
            tables::update(self.store(), Table::BookingMappings, WriteMode::Replace, |mappings: &mut MappingsTable| {
                match mappings.get_mut(&booking_id) {
                    // A retry must not downgrade a confirmed booking.
                    Some(current) if current.is_confirmed() => {}
                    Some(current) => {
                        current.status = status;
                        current.confirmed_at = mapping.confirmed_at;
                        current.expiry_timestamp = mapping.expiry_timestamp;
                        current.extra.extend(mapping.extra.clone());
                    }
                    None => {
                        mappings.insert(booking_id.clone(), mapping.clone());
                    }
                }
                Ok(())
            })
        })?;

        tables::update(self.store(), Table::Offers, WriteMode::Replace, |offers: &mut OffersTable| {
            if let Some(stored) = offers.get_mut(token) {
                stored.booking_id = Some(booking_id.clone());
            }
            Ok(())
        })?;

        info!("Offer for {} {} by {} as {}", target.slot_ref, mode.offer_status(), Masked(&entry.email), booking_id);

        let email = match mode {
            Acceptance::Reserve => EmailRequest::new(EmailKind::TemporaryReservation, &entry.email, &entry.name)
                .field("paymentReference", payment_reference.clone().unwrap_or_default())
                .field("paymentDeadline", payment_deadline.map(|d| d.to_rfc3339()).unwrap_or_default()),
            Acceptance::Confirm => EmailRequest::new(EmailKind::BookingConfirmation, &entry.email, &entry.name),
        };
        self.notify(
            email
                .field("bookingId", booking_id.as_str())
                .field("date", target.slot_ref.date.as_str())
                .field("time", entry.time.as_str())
                .field("title", entry.title.as_str())
                .field("isBlock", target.is_block())
                .field("blockDates", json!(mapping.block_dates))
                .field("price", target.slot.price.clone().unwrap_or_default())
                .field("location", target.slot.location.clone().unwrap_or_default()),
        );
        let action = match mode {
            Acceptance::Reserve => "Offer reserved",
            Acceptance::Confirm => "Offer confirmed",
        };
        self.record(
            ActivityEntry::new("offer", action, &entry.title, format!("{} took the offered seat", entry.name))
                .with_player(&entry.name, &entry.email)
                .with_session(&target.slot_ref.date, &entry.time, &entry.title)
                .with_meta(json!({ "bookingId": booking_id, "alreadyBooked": already_booked })),
        );

        Ok(OfferAcceptance {
            booking_id,
            status,
            dates: target.dates,
            already_booked,
            payment_reference,
            payment_deadline,
        })
    }

    /// Drop the waitlist entries behind settled offers
    fn retire_waitlist_entries(&self, offers: &[Offer]) -> BookingResult<usize> {
        if offers.is_empty() {
            return Ok(0);
        }
        update_waitlist(self.store(), |waitlist| {
            let mut removed = 0;
            for offer in offers {
                let mut dates = offer.dates();
                if !dates.contains(&offer.date) {
                    dates.push(offer.date.clone());
                }
                removed += remove_entries(waitlist, &dates, |w| {
                    w.has_email(&offer.email) && w.matches_slot(&offer.time, &offer.title)
                })
                .len();
            }
            Ok(removed)
        })
    }

    fn offer_link(&self, action: &str, token: &str) -> String {
        format!("{}/{}.php?token={}", self.rules.offer_link_base.trim_end_matches('/'), action, token)
    }
}

/// Count holders from the bookings table, never the slot cache. Returns
/// whether the requester already holds the seat. Runs under the bookings lock.
fn check_capacity(target: &ResolvedSlot, entry: &BookingEntry, bookings: &BookingsTable) -> BookingResult<bool> {
    let holders: BTreeSet<String> = target
        .dates
        .iter()
        .flat_map(|d| parse_day(d, bookings.get(d).map(Vec::as_slice).unwrap_or_default()))
        .filter(|e| e.matches_slot(&target.slot.time, &target.slot.title))
        .map(|e| e.email_key())
        .collect();

    if holders.contains(&entry.email_key()) {
        return Ok(true);
    }
    let capacity = target.slot.capacity();
    if holders.len() >= capacity as usize {
        return Err(BookingError::CapacityExceeded {
            date: target.slot_ref.date.clone(),
            time: target.slot.time.clone(),
            title: target.slot.title.clone(),
            booked: holders.len(),
            capacity,
        });
    }
    Ok(false)
}

/// 256-bit bearer token, hex-encoded
pub(crate) fn generate_offer_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `HT-{YYYYMMDD}-{6 upper hex}`
pub(crate) fn generate_payment_reference(now: DateTime<Utc>) -> String {
    let mut bytes = [0u8; 3];
    OsRng.fill_bytes(&mut bytes);
    format!("HT-{}-{}", now.format("%Y%m%d"), hex::encode_upper(bytes))
}
