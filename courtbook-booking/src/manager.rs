use crate::bridge::{self, BridgeOutcome};
use crate::error::{BookingError, BookingResult};
use crate::models::{
    BookedUser, BookingMapping, BookingsTable, CancellationLedger, CancellationOutcome, CancellationRecord,
    MappingStatus, MappingsTable, Slot, SlotRef, SlotsTable,
};
use crate::reconciler::{self, parse_day, ReconcileReport};
use crate::tables;
use chrono::{DateTime, Duration, Utc};
use courtbook_core::{BookingEntry, Outbox, Table, TableStore, WriteMode};
use courtbook_shared::{ActivityEntry, EmailKind, EmailRequest, Masked};
use courtbook_store::app_config::BookingRules;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Map};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const EXPIRED_REASON: &str = "Expired pending booking";
pub const DEFAULT_CANCEL_REASON: &str = "Cancelled by user";

/// A change to the canonical bookings table
#[derive(Debug, Clone)]
pub enum BookingMutation {
    /// Add the entry on every date where it is not already present
    Add { entry: BookingEntry, dates: Vec<String> },
    /// Remove every string matching the entry on these dates
    Remove { entry: BookingEntry, dates: Vec<String> },
}

impl BookingMutation {
    pub fn entry(&self) -> &BookingEntry {
        match self {
            BookingMutation::Add { entry, .. } | BookingMutation::Remove { entry, .. } => entry,
        }
    }

    pub fn dates(&self) -> &[String] {
        match self {
            BookingMutation::Add { dates, .. } | BookingMutation::Remove { dates, .. } => dates,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DerivedState {
    /// Slots whose cache had to be rebuilt
    pub reconciled: usize,
    pub bridge: Option<BridgeOutcome>,
}

#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// Dates whose booking list actually changed
    pub changed_dates: Vec<String>,
    pub derived: DerivedState,
}

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub name: String,
    pub email: String,
    pub slot: SlotRef,
    /// Empty for single sessions; inferred from the slot for blocks
    pub block_dates: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingReceipt {
    pub booking_id: String,
    pub status: MappingStatus,
    pub dates: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CancelTarget {
    BookingId(String),
    Explicit { name: String, email: String, slot: SlotRef, block_dates: Vec<String> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationReceipt {
    pub booking_id: Option<String>,
    pub dates: Vec<String>,
    pub removed_from: Vec<String>,
    pub outcome: CancellationOutcome,
}

#[derive(Debug, Clone)]
pub enum BookingLookup {
    Active { booking_id: String, mapping: BookingMapping },
    Cancelled(CancellationRecord),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpirySweep {
    pub expired: Vec<String>,
    /// Already cancelled or confirmed by someone else in the meantime
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

/// A located slot plus every date a booking on it fans out to
#[derive(Debug, Clone)]
pub(crate) struct ResolvedSlot {
    pub slot: Slot,
    /// Points at the slot's current time/title on the requested date
    pub slot_ref: SlotRef,
    pub dates: Vec<String>,
    /// Set only for block-wide sessions
    pub block_id: Option<String>,
}

impl ResolvedSlot {
    pub fn is_block(&self) -> bool {
        self.block_id.is_some()
    }
}

/// Manages reservation lifecycle across the booking tables.
///
/// Tables are only ever locked one at a time. Every mutating entry point
/// goes through [`BookingManager::apply_booking_mutation`] or
/// [`BookingManager::refresh_derived_state`], so the reconciler and bridge
/// engine always run before an operation reports success.
pub struct BookingManager {
    pub(crate) store: Arc<dyn TableStore>,
    pub(crate) outbox: Outbox,
    pub(crate) rules: BookingRules,
}

impl BookingManager {
    pub fn new(store: Arc<dyn TableStore>, outbox: Outbox, rules: BookingRules) -> Self {
        Self { store, outbox, rules }
    }

    pub fn store(&self) -> &dyn TableStore {
        self.store.as_ref()
    }

    pub fn rules(&self) -> &BookingRules {
        &self.rules
    }

    /// The one write path for bookings: bookings → slot cache → caller's
    /// follow-up (mapping/waitlist/offer) → reconcile → bridge.
    pub fn apply_booking_mutation<F>(
        &self,
        mutation: &BookingMutation,
        slot: &SlotRef,
        follow_up: F,
    ) -> BookingResult<MutationOutcome>
    where
        F: FnOnce(&[String]) -> BookingResult<()>,
    {
        self.apply_guarded_mutation(mutation, slot, |_| Ok(()), follow_up)
    }

    /// Like [`BookingManager::apply_booking_mutation`], but `guard` sees the
    /// bookings table under its lock first. A guard error aborts before
    /// anything is written.
    pub fn apply_guarded_mutation<G, F>(
        &self,
        mutation: &BookingMutation,
        slot: &SlotRef,
        guard: G,
        follow_up: F,
    ) -> BookingResult<MutationOutcome>
    where
        G: FnOnce(&BookingsTable) -> BookingResult<()>,
        F: FnOnce(&[String]) -> BookingResult<()>,
    {
        let changed_dates = tables::update(self.store(), Table::Bookings, WriteMode::Replace, |bookings: &mut BookingsTable| {
            guard(bookings)?;
            Ok(apply_to_bookings(mutation, bookings))
        })?;

        tables::update(self.store(), Table::AvailableSlots, WriteMode::Replace, |slots: &mut SlotsTable| {
            patch_slot_cache(mutation, slot, slots);
            Ok(())
        })?;

        follow_up(&changed_dates)?;

        let derived = self.refresh_derived_state(Some(slot))?;
        Ok(MutationOutcome { changed_dates, derived })
    }

    /// Reconcile pass, then a bridge pass for `slot` (or every slot).
    pub fn refresh_derived_state(&self, slot: Option<&SlotRef>) -> BookingResult<DerivedState> {
        let report = reconciler::run(self.store(), true)?;
        let bridge = match slot {
            Some(slot) => bridge::refresh(self.store(), slot)?,
            None => {
                bridge::refresh_all(self.store())?;
                None
            }
        };
        Ok(DerivedState { reconciled: report.changes.len(), bridge })
    }

    /// Admin reconcile, optionally as a dry run
    pub fn reconcile(&self, apply: bool) -> BookingResult<ReconcileReport> {
        let report = reconciler::run(self.store(), apply)?;
        if apply {
            bridge::refresh_all(self.store())?;
        }
        Ok(report)
    }

    /// Transition: None → Pending
    pub fn create_booking(&self, request: BookingRequest) -> BookingResult<BookingReceipt> {
        validate_email(&request.email)?;
        let target = self.resolve_target(&request.slot, &request.block_dates)?;
        let entry = BookingEntry::new(&target.slot.time, &target.slot.title, &request.name, &request.email)?;

        let now = Utc::now();
        let expiry_seconds = self.booking_expiry_seconds()?;
        let booking_id = generate_booking_id(now);
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
            status: MappingStatus::Pending,
            confirmed_at: None,
            created_at: now,
            reservation_timestamp: now.timestamp(),
            expiry_timestamp: now.timestamp() + expiry_seconds,
            extra: Map::new(),
        };

        let mutation = BookingMutation::Add { entry: entry.clone(), dates: target.dates.clone() };
        // The duplicate check runs under the bookings lock, so two racing
        // requests cannot both insert a mapping for one booking string.
        let already_booked = |bookings: &BookingsTable| {
            if target.dates.iter().all(|d| day_contains(bookings, d, &entry)) {
                return Err(BookingError::AlreadyProcessed(format!("Already booked into {}", target.slot_ref)));
            }
            Ok(())
        };
        self.apply_guarded_mutation(&mutation, &target.slot_ref, already_booked, |_| {
            tables::update(self.store(), Table::BookingMappings, WriteMode::Replace, |mappings: &mut MappingsTable| {
                mappings.insert(booking_id.clone(), mapping.clone());
                Ok(())
            })
        })?;

        info!("Created booking {} for {} ({} date(s))", booking_id, Masked(&entry.email), target.dates.len());

        let expires_at = now + Duration::seconds(expiry_seconds);
        self.notify(
            booking_email(EmailKind::TemporaryReservation, &mapping)
                .field("bookingId", booking_id.as_str())
                .field("expiresAt", expires_at.to_rfc3339()),
        );
        self.record(
            ActivityEntry::new("booking", "Booking created", &entry.title, format!("{} booked {}", entry.name, target.slot_ref))
                .with_player(&entry.name, &entry.email)
                .with_session(&target.slot_ref.date, &entry.time, &entry.title)
                .with_meta(json!({ "bookingId": booking_id, "dates": target.dates })),
        );

        Ok(BookingReceipt { booking_id, status: MappingStatus::Pending, dates: target.dates, expires_at })
    }

    /// Transition: Pending | Reserved | Confirmed → Cancelled
    pub fn cancel_booking(&self, target: CancelTarget, reason: &str) -> BookingResult<CancellationReceipt> {
        let reason = if reason.trim().is_empty() { DEFAULT_CANCEL_REASON } else { reason.trim() };
        match target {
            CancelTarget::BookingId(booking_id) => {
                let mappings: MappingsTable = tables::load(self.store(), Table::BookingMappings)?;
                match mappings.get(&booking_id) {
                    Some(mapping) => {
                        // An expired-but-unswept booking is cancelled normally.
                        self.cancel_mapping(&booking_id, mapping.clone(), reason, CancellationOutcome::Cancelled)
                    }
                    None => {
                        let ledger: CancellationLedger = tables::load(self.store(), Table::Cancellations)?;
                        if ledger.contains_key(&booking_id) {
                            Err(BookingError::AlreadyProcessed(format!("Booking {} has already been cancelled", booking_id)))
                        } else {
                            Err(BookingError::NotFound(format!("Booking {}", booking_id)))
                        }
                    }
                }
            }
            CancelTarget::Explicit { name, email, slot, block_dates } => {
                self.cancel_explicit(&name, &email, &slot, &block_dates, reason)
            }
        }
    }

    /// Look a booking up by id. A pending booking past its deadline is
    /// released on the spot and reported as expired.
    pub fn lookup_booking(&self, booking_id: &str) -> BookingResult<BookingLookup> {
        let ledger: CancellationLedger = tables::load(self.store(), Table::Cancellations)?;
        if let Some(record) = ledger.get(booking_id) {
            return Ok(BookingLookup::Cancelled(record.clone()));
        }

        let mappings: MappingsTable = tables::load(self.store(), Table::BookingMappings)?;
        let mapping = mappings
            .get(booking_id)
            .cloned()
            .ok_or_else(|| BookingError::NotFound(format!("Booking {}", booking_id)))?;

        if mapping.is_expired_at(Utc::now().timestamp()) {
            self.release_expired(booking_id)?;
            return Err(BookingError::Expired(format!("Booking {} expired and was released", booking_id)));
        }
        Ok(BookingLookup::Active { booking_id: booking_id.to_string(), mapping })
    }

    /// Transition: Pending | Reserved → Confirmed (manual payment confirmation)
    pub fn confirm_booking(&self, booking_id: &str) -> BookingResult<BookingMapping> {
        enum Step {
            Confirmed(BookingMapping),
            Lapsed,
        }

        let now = Utc::now();
        let step = tables::update(self.store(), Table::BookingMappings, WriteMode::Replace, |mappings: &mut MappingsTable| {
            let mapping = mappings
                .get_mut(booking_id)
                .ok_or_else(|| BookingError::NotFound(format!("Booking {}", booking_id)))?;
            if mapping.is_confirmed() {
                return Err(BookingError::AlreadyProcessed(format!("Booking {} is already confirmed", booking_id)));
            }
            if mapping.is_expired_at(now.timestamp()) {
                return Ok(Step::Lapsed);
            }
            mapping.status = MappingStatus::Confirmed;
            mapping.confirmed_at = Some(now);
            Ok(Step::Confirmed(mapping.clone()))
        })?;

        let mapping = match step {
            Step::Confirmed(mapping) => mapping,
            Step::Lapsed => {
                self.release_expired(booking_id)?;
                return Err(BookingError::Expired(format!("Booking {} expired before confirmation", booking_id)));
            }
        };

        self.refresh_derived_state(Some(&mapping.slot_ref()))?;
        info!("Confirmed booking {}", booking_id);

        self.notify(booking_email(EmailKind::BookingConfirmation, &mapping).field("bookingId", booking_id));
        self.record(
            ActivityEntry::new("booking", "Booking confirmed", &mapping.title, format!("{} confirmed", mapping.name))
                .with_player(&mapping.name, &mapping.email)
                .with_session(&mapping.primary_date(), &mapping.time, &mapping.title)
                .with_meta(json!({ "bookingId": booking_id })),
        );
        Ok(mapping)
    }

    /// Sweep: Pending → Expired for every mapping past its deadline.
    /// Safe to run concurrently with itself and with live cancellations.
    pub fn expire_pending_bookings(&self) -> BookingResult<ExpirySweep> {
        let now = Utc::now().timestamp();
        let mappings: MappingsTable = tables::load(self.store(), Table::BookingMappings)?;
        let due: Vec<String> = mappings
            .iter()
            .filter(|(_, mapping)| mapping.is_expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut sweep = ExpirySweep::default();
        for booking_id in due {
            match self.release_expired(&booking_id) {
                Ok(_) => sweep.expired.push(booking_id),
                Err(BookingError::AlreadyProcessed(_)) | Err(BookingError::NotFound(_)) => sweep.skipped.push(booking_id),
                Err(e) => {
                    error!("Failed to expire booking {}: {}", booking_id, e);
                    sweep.failed.push(booking_id);
                }
            }
        }

        if !sweep.expired.is_empty() {
            info!("Expired {} pending booking(s)", sweep.expired.len());
        }
        Ok(sweep)
    }

    /// Drop mappings whose booking strings are gone from every date they cover
    pub fn prune_orphaned_mappings(&self) -> BookingResult<Vec<String>> {
        let bookings: BookingsTable = tables::load(self.store(), Table::Bookings)?;
        let pruned = tables::update(self.store(), Table::BookingMappings, WriteMode::Replace, |mappings: &mut MappingsTable| {
            let orphans: Vec<String> = mappings
                .iter()
                .filter(|(_, mapping)| !mapping_has_booking(&bookings, mapping))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &orphans {
                mappings.remove(id);
            }
            Ok(orphans)
        })?;

        if !pruned.is_empty() {
            warn!("Pruned {} orphaned booking mapping(s)", pruned.len());
        }
        self.refresh_derived_state(None)?;
        Ok(pruned)
    }

    /// Re-check under current state that a mapping is still lapsed, then
    /// cancel it as expired.
    fn release_expired(&self, booking_id: &str) -> BookingResult<CancellationReceipt> {
        let mappings: MappingsTable = tables::load(self.store(), Table::BookingMappings)?;
        let mapping = match mappings.get(booking_id) {
            Some(mapping) if mapping.is_expired_at(Utc::now().timestamp()) => mapping.clone(),
            Some(_) => {
                return Err(BookingError::AlreadyProcessed(format!("Booking {} is no longer pending", booking_id)))
            }
            None => return Err(BookingError::NotFound(format!("Booking {}", booking_id))),
        };
        self.cancel_mapping(booking_id, mapping, EXPIRED_REASON, CancellationOutcome::Expired)
    }

    fn cancel_mapping(
        &self,
        booking_id: &str,
        mapping: BookingMapping,
        reason: &str,
        outcome: CancellationOutcome,
    ) -> BookingResult<CancellationReceipt> {
        let entry = mapping.entry()?;
        let record = CancellationRecord::from_mapping(booking_id, &mapping, reason, outcome, Utc::now());

        // The ledger claim is the exactly-once gate for this bookingId.
        tables::update(self.store(), Table::Cancellations, WriteMode::Replace, |ledger: &mut CancellationLedger| {
            if ledger.contains_key(booking_id) {
                return Err(BookingError::AlreadyProcessed(format!("Booking {} has already been cancelled", booking_id)));
            }
            ledger.insert(booking_id.to_string(), record.clone());
            Ok(())
        })?;

        let dates = mapping.dates();
        let mutation = BookingMutation::Remove { entry, dates: dates.clone() };
        let mut mapping_deleted = false;
        let result = self.apply_booking_mutation(&mutation, &mapping.slot_ref(), |_| {
            tables::update(self.store(), Table::BookingMappings, WriteMode::Replace, |mappings: &mut MappingsTable| {
                mappings.remove(booking_id);
                Ok(())
            })?;
            mapping_deleted = true;
            Ok(())
        });

        let applied = match result {
            Ok(applied) => applied,
            Err(e) => {
                if !mapping_deleted {
                    self.release_cancellation_claim(booking_id);
                }
                return Err(e);
            }
        };

        let action = match outcome {
            CancellationOutcome::Cancelled => "Booking cancelled",
            CancellationOutcome::Expired => "Booking expired",
        };
        info!("{} {} for {}", action, booking_id, Masked(&mapping.email));

        self.notify(
            booking_email(EmailKind::Cancellation, &mapping)
                .field("bookingId", booking_id)
                .field("reason", reason),
        );
        self.record(
            ActivityEntry::new("cancellation", action, &mapping.title, format!("{}: {}", mapping.name, reason))
                .with_player(&mapping.name, &mapping.email)
                .with_session(&mapping.primary_date(), &mapping.time, &mapping.title)
                .with_meta(json!({ "bookingId": booking_id, "dates": dates })),
        );

        Ok(CancellationReceipt {
            booking_id: Some(booking_id.to_string()),
            dates,
            removed_from: applied.changed_dates,
            outcome,
        })
    }

    fn release_cancellation_claim(&self, booking_id: &str) {
        let released = tables::update(self.store(), Table::Cancellations, WriteMode::Replace, |ledger: &mut CancellationLedger| {
            ledger.remove(booking_id);
            Ok(())
        });
        if let Err(e) = released {
            error!("Failed to release cancellation claim for {}: {}", booking_id, e);
        }
    }

    fn cancel_explicit(
        &self,
        name: &str,
        email: &str,
        slot: &SlotRef,
        block_dates: &[String],
        reason: &str,
    ) -> BookingResult<CancellationReceipt> {
        let slot = &self.stored_slot_ref(slot)?;
        let entry = BookingEntry::new(&slot.time, &slot.title, name, email)?;
        let dates = if block_dates.is_empty() { vec![slot.date.clone()] } else { block_dates.to_vec() };

        let bookings: BookingsTable = tables::load(self.store(), Table::Bookings)?;
        if !dates.iter().any(|d| day_contains(&bookings, d, &entry)) {
            return Err(BookingError::NotFound(format!("No booking for {} in {}", Masked(email), slot)));
        }

        let mutation = BookingMutation::Remove { entry: entry.clone(), dates: dates.clone() };
        let applied = self.apply_booking_mutation(&mutation, slot, |_| {
            tables::update(self.store(), Table::BookingMappings, WriteMode::Replace, |mappings: &mut MappingsTable| {
                mappings.retain(|_, m| {
                    !(m.email.eq_ignore_ascii_case(&entry.email)
                        && entry.matches_slot(&m.time, &m.title)
                        && m.dates().iter().any(|d| dates.contains(d)))
                });
                Ok(())
            })
        })?;

        info!("Cancelled booking for {} in {}", Masked(&entry.email), slot);
        self.notify(
            EmailRequest::new(EmailKind::Cancellation, &entry.email, &entry.name)
                .field("date", slot.date.as_str())
                .field("time", entry.time.as_str())
                .field("title", entry.title.as_str())
                .field("blockDates", json!(block_dates))
                .field("reason", reason),
        );
        self.record(
            ActivityEntry::new("cancellation", "Booking cancelled", &entry.title, format!("{}: {}", entry.name, reason))
                .with_player(&entry.name, &entry.email)
                .with_session(&slot.date, &entry.time, &entry.title),
        );

        Ok(CancellationReceipt {
            booking_id: None,
            dates,
            removed_from: applied.changed_dates,
            outcome: CancellationOutcome::Cancelled,
        })
    }

    /// The slot's stored time/title for a reference typed with different case.
    /// Falls back to the reference itself when nothing matches.
    fn stored_slot_ref(&self, slot_ref: &SlotRef) -> BookingResult<SlotRef> {
        let slots: SlotsTable = tables::load(self.store(), Table::AvailableSlots)?;
        let found = slots.get(&slot_ref.date).and_then(|day| {
            day.iter().find(|s| {
                s.time.trim().eq_ignore_ascii_case(slot_ref.time.trim())
                    && s.title.trim().eq_ignore_ascii_case(slot_ref.title.trim())
                    && slot_ref.block_id.as_deref().map_or(true, |id| s.block_key() == Some(id.trim()))
            })
        });
        Ok(match found {
            Some(stored) => SlotRef { time: stored.time.clone(), title: stored.title.clone(), ..slot_ref.clone() },
            None => slot_ref.clone(),
        })
    }

    /// Locate the slot and work out its fan-out dates. For blocks every date
    /// must carry the same block instance.
    pub(crate) fn resolve_target(&self, slot_ref: &SlotRef, requested_dates: &[String]) -> BookingResult<ResolvedSlot> {
        let slots: SlotsTable = tables::load(self.store(), Table::AvailableSlots)?;
        let (_, slot) = slot_ref
            .locate(&slots)
            .ok_or_else(|| BookingError::NotFound(format!("Slot {}", slot_ref)))?;

        let mut requested: Vec<String> = Vec::new();
        for date in requested_dates.iter().map(|d| d.trim()).filter(|d| !d.is_empty()) {
            if !requested.iter().any(|seen| seen == date) {
                requested.push(date.to_string());
            }
        }

        let dates = if !requested.is_empty() {
            requested
        } else if slot.is_block() {
            slot.block_dates.clone()
        } else {
            vec![slot_ref.date.clone()]
        };

        let block_id = if slot.is_block() || dates.len() > 1 {
            let id = slot.block_key().ok_or_else(|| {
                BookingError::Validation(format!("{} is not part of a block but several dates were given", slot_ref))
            })?;
            for date in &dates {
                let present = slots
                    .get(date)
                    .is_some_and(|day| day.iter().any(|s| s.is_block_sibling(id, &slot.time, &slot.title)));
                if !present {
                    return Err(BookingError::NotFound(format!(
                        "Block {} has no {} {} on {}",
                        id, slot.time, slot.title, date
                    )));
                }
            }
            Some(id.to_string())
        } else {
            None
        };

        if !dates.contains(&slot_ref.date) {
            return Err(BookingError::Validation(format!("{} is not one of the requested dates", slot_ref.date)));
        }

        let resolved_ref = SlotRef {
            date: slot_ref.date.clone(),
            time: slot.time.clone(),
            title: slot.title.clone(),
            block_id: block_id.clone(),
            session_key: slot.session_key.clone().filter(|k| !k.trim().is_empty()),
        };
        Ok(ResolvedSlot { slot: slot.clone(), slot_ref: resolved_ref, dates, block_id })
    }

    pub(crate) fn notify(&self, request: EmailRequest) {
        self.outbox.email(request);
    }

    pub(crate) fn record(&self, entry: ActivityEntry) {
        self.outbox.activity(entry);
    }
}

fn apply_to_bookings(mutation: &BookingMutation, bookings: &mut BookingsTable) -> Vec<String> {
    let mut changed = Vec::new();
    match mutation {
        BookingMutation::Add { entry, dates } => {
            for date in dates {
                if day_contains(bookings, date, entry) {
                    continue;
                }
                bookings.entry(date.clone()).or_default().push(entry.to_string());
                changed.push(date.clone());
            }
        }
        BookingMutation::Remove { entry, dates } => {
            for date in dates {
                let Some(day) = bookings.get_mut(date) else { continue };
                let before = day.len();
                day.retain(|raw| !BookingEntry::parse(raw).is_ok_and(|e| e.same_booking(entry)));
                if day.len() < before {
                    changed.push(date.clone());
                }
                if day.is_empty() {
                    bookings.remove(date);
                }
            }
        }
    }
    changed
}

/// Pre-reconcile touch-up of `bookedUsers`, so the reconcile pass that
/// follows normally finds nothing to rewrite.
fn patch_slot_cache(mutation: &BookingMutation, slot_ref: &SlotRef, slots: &mut SlotsTable) {
    let entry = mutation.entry();
    for date in mutation.dates() {
        let Some(day) = slots.get_mut(date) else { continue };
        for slot in day.iter_mut().filter(|s| s.matches_identity(&entry.time, &entry.title)) {
            if let Some(block) = slot_ref.block_id.as_deref() {
                if slot.block_key() != Some(block) {
                    continue;
                }
            }
            match mutation {
                BookingMutation::Add { .. } => {
                    if !slot.booked_users.iter().any(|u| entry.has_email(&u.email)) {
                        slot.booked_users.push(BookedUser::from(entry));
                    }
                }
                BookingMutation::Remove { .. } => slot.booked_users.retain(|u| !entry.has_email(&u.email)),
            }
        }
    }
}

pub(crate) fn day_contains(bookings: &BookingsTable, date: &str, entry: &BookingEntry) -> bool {
    bookings
        .get(date)
        .is_some_and(|day| day.iter().any(|raw| BookingEntry::parse(raw).is_ok_and(|e| e.same_booking(entry))))
}

fn mapping_has_booking(bookings: &BookingsTable, mapping: &BookingMapping) -> bool {
    mapping.dates().iter().any(|date| {
        parse_day(date, bookings.get(date).map(Vec::as_slice).unwrap_or_default())
            .iter()
            .any(|e| e.matches_slot(&mapping.time, &mapping.title) && e.has_email(&mapping.email))
    })
}

fn booking_email(kind: EmailKind, mapping: &BookingMapping) -> EmailRequest {
    EmailRequest::new(kind, &mapping.email, &mapping.name)
        .field("date", mapping.primary_date())
        .field("time", mapping.time.as_str())
        .field("title", mapping.title.as_str())
        .field("isBlock", mapping.is_block)
        .field("blockDates", json!(mapping.block_dates))
        .field("price", mapping.price.clone().unwrap_or_default())
        .field("location", mapping.location.clone().unwrap_or_default())
}

/// `BK-{unix}-{8 upper hex}`
pub(crate) fn generate_booking_id(now: DateTime<Utc>) -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    format!("BK-{}-{}", now.timestamp(), hex::encode_upper(bytes))
}

pub(crate) fn validate_email(email: &str) -> BookingResult<()> {
    let email = email.trim();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(BookingError::Validation(format!("Invalid email address: {}", email)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{booking_strings, fixture, slot_json, D1, D2, D3};
    use chrono::Duration;
    use courtbook_shared::EmailKind;
    use serde_json::json;

    fn request(name: &str, email: &str, slot: SlotRef) -> BookingRequest {
        BookingRequest { name: name.into(), email: email.into(), slot, block_dates: vec![] }
    }

    #[test]
    fn test_booking_lifecycle() {
        let (manager, store, mut rx) = fixture(json!({ D1: [slot_json("18:00", "Open Run", 2)] }));

        // None → Pending
        let receipt = manager.create_booking(request("Bob", "bob@example.com", SlotRef::new(D1, "18:00", "Open Run"))).unwrap();
        assert!(receipt.booking_id.starts_with("BK-"));
        assert_eq!(receipt.status, MappingStatus::Pending);
        assert_eq!(booking_strings(&store, D1), vec!["18:00 - Open Run (Bob) (bob@example.com)"]);

        // Pending → Confirmed
        let confirmed = manager.confirm_booking(&receipt.booking_id).unwrap();
        assert_eq!(confirmed.status, MappingStatus::Confirmed);
        assert!(matches!(manager.confirm_booking(&receipt.booking_id), Err(BookingError::AlreadyProcessed(_))));

        // Confirmed → Cancelled
        let cancelled = manager.cancel_booking(CancelTarget::BookingId(receipt.booking_id.clone()), "").unwrap();
        assert_eq!(cancelled.removed_from, vec![D1.to_string()]);
        assert!(booking_strings(&store, D1).is_empty());

        let lookup = manager.lookup_booking(&receipt.booking_id).unwrap();
        assert!(matches!(lookup, BookingLookup::Cancelled(record) if record.cancellation_reason == DEFAULT_CANCEL_REASON));

        let kinds: Vec<EmailKind> = rx.drain_emails().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EmailKind::TemporaryReservation, EmailKind::BookingConfirmation, EmailKind::Cancellation]);
    }

    #[test]
    fn test_create_rejects_bad_input_before_writing() {
        let (manager, store, _rx) = fixture(json!({ D1: [slot_json("18:00", "Open Run", 2)] }));

        let bad_email = manager.create_booking(request("Bob", "bob-at-example", SlotRef::new(D1, "18:00", "Open Run")));
        assert!(matches!(bad_email, Err(BookingError::Validation(_))));

        let bad_name = manager.create_booking(request("Bob (", "bob@example.com", SlotRef::new(D1, "18:00", "Open Run")));
        assert!(matches!(bad_name, Err(BookingError::Validation(_))));

        let missing = manager.create_booking(request("Bob", "bob@example.com", SlotRef::new(D1, "18:00", "Closed Run")));
        assert!(matches!(missing, Err(BookingError::NotFound(_))));

        assert_eq!(store.read(Table::Bookings).unwrap(), json!({}));
        assert_eq!(store.read(Table::BookingMappings).unwrap(), json!({}));
    }

    #[test]
    fn test_duplicate_booking_is_not_appended() {
        let (manager, store, _rx) = fixture(json!({ D1: [slot_json("18:00", "Open Run", 2)] }));
        let slot = SlotRef::new(D1, "18:00", "Open Run");

        manager.create_booking(request("Bob", "bob@example.com", slot.clone())).unwrap();
        let again = manager.create_booking(request("Bob", "BOB@example.com", slot));
        assert!(matches!(again, Err(BookingError::AlreadyProcessed(_))));

        assert_eq!(booking_strings(&store, D1).len(), 1);
        let mappings: MappingsTable = tables::load(store.as_ref(), Table::BookingMappings).unwrap();
        assert_eq!(mappings.len(), 1);
    }

    #[test]
    fn test_racing_duplicate_creates_leave_one_mapping() {
        for _ in 0..25 {
            let (manager, store, _rx) = fixture(json!({ D1: [slot_json("18:00", "Open Run", 4)] }));
            let slot = SlotRef::new(D1, "18:00", "Open Run");

            let (manager, slot) = (&manager, &slot);
            let results: Vec<BookingResult<BookingReceipt>> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..8)
                    .map(|_| scope.spawn(move || manager.create_booking(request("Bob", "bob@example.com", slot.clone()))))
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(results
                .iter()
                .filter(|r| r.is_err())
                .all(|r| matches!(r, Err(BookingError::AlreadyProcessed(_)))));
            assert_eq!(booking_strings(&store, D1).len(), 1);
            let mappings: MappingsTable = tables::load(store.as_ref(), Table::BookingMappings).unwrap();
            assert_eq!(mappings.len(), 1);
        }
    }

    #[test]
    fn test_block_booking_fans_out_to_every_date() {
        let block = json!({"time": "19:00", "title": "League", "numberOfSpots": 8, "blockId": "blk-7", "blockDates": [D1, D2, D3]});
        let (manager, store, _rx) = fixture(json!({ D1: [block.clone()], D2: [block.clone()], D3: [block] }));

        let receipt = manager
            .create_booking(request("Ann", "ann@example.com", SlotRef::new(D1, "19:00", "League")))
            .unwrap();
        assert_eq!(receipt.dates, vec![D1.to_string(), D2.to_string(), D3.to_string()]);

        for date in [D1, D2, D3] {
            assert_eq!(booking_strings(&store, date), vec!["19:00 - League (Ann) (ann@example.com)"]);
        }
        let mappings: MappingsTable = tables::load(store.as_ref(), Table::BookingMappings).unwrap();
        assert_eq!(mappings.len(), 1);
        let mapping = &mappings[&receipt.booking_id];
        assert!(mapping.is_block);
        assert_eq!(mapping.block_dates.len(), 3);

        let slots: SlotsTable = tables::load(store.as_ref(), Table::AvailableSlots).unwrap();
        for date in [D1, D2, D3] {
            assert_eq!(slots[date][0].booked_users, vec![BookedUser::new("Ann", "ann@example.com")]);
        }
    }

    #[test]
    fn test_block_booking_requires_every_instance() {
        let block = json!({"time": "19:00", "title": "League", "numberOfSpots": 8, "blockId": "blk-7", "blockDates": [D1, D2]});
        let (manager, store, _rx) = fixture(json!({ D1: [block] }));

        let result = manager.create_booking(request("Ann", "ann@example.com", SlotRef::new(D1, "19:00", "League")));
        assert!(matches!(result, Err(BookingError::NotFound(_))));
        assert_eq!(store.read(Table::Bookings).unwrap(), json!({}));
    }

    #[test]
    fn test_cancel_twice_is_already_processed() {
        let (manager, store, _rx) = fixture(json!({ D1: [slot_json("18:00", "Open Run", 2)] }));
        let receipt = manager.create_booking(request("Bob", "bob@example.com", SlotRef::new(D1, "18:00", "Open Run"))).unwrap();

        manager.cancel_booking(CancelTarget::BookingId(receipt.booking_id.clone()), "changed plans").unwrap();
        let second = manager.cancel_booking(CancelTarget::BookingId(receipt.booking_id.clone()), "changed plans");
        assert!(matches!(second, Err(BookingError::AlreadyProcessed(_))));

        let unknown = manager.cancel_booking(CancelTarget::BookingId("BK-0-DEADBEEF".into()), "");
        assert!(matches!(unknown, Err(BookingError::NotFound(_))));

        let ledger: CancellationLedger = tables::load(store.as_ref(), Table::Cancellations).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[&receipt.booking_id].cancellation_reason, "changed plans");
    }

    #[test]
    fn test_ledger_claim_blocks_reprocessing() {
        let (manager, store, _rx) = fixture(json!({ D1: [slot_json("18:00", "Open Run", 2)] }));
        let receipt = manager.create_booking(request("Bob", "bob@example.com", SlotRef::new(D1, "18:00", "Open Run"))).unwrap();

        // Another worker already claimed this id.
        let mappings: MappingsTable = tables::load(store.as_ref(), Table::BookingMappings).unwrap();
        let record = CancellationRecord::from_mapping(
            &receipt.booking_id,
            &mappings[&receipt.booking_id],
            "elsewhere",
            CancellationOutcome::Cancelled,
            Utc::now(),
        );
        store
            .write(Table::Cancellations, &json!({ receipt.booking_id.clone(): record }))
            .unwrap();

        let result = manager.cancel_booking(CancelTarget::BookingId(receipt.booking_id), "");
        assert!(matches!(result, Err(BookingError::AlreadyProcessed(_))));
        assert_eq!(booking_strings(&store, D1).len(), 1);
    }

    #[test]
    fn test_explicit_cancellation_matches_exactly() {
        let (manager, store, _rx) = fixture(json!({
            D1: [slot_json("18:00", "Training", 4), slot_json("18:00", "Training Advanced", 4)]
        }));
        manager.create_booking(request("Bob", "bob@example.com", SlotRef::new(D1, "18:00", "Training"))).unwrap();
        manager.create_booking(request("Bob", "bob@example.com", SlotRef::new(D1, "18:00", "Training Advanced"))).unwrap();

        manager
            .cancel_booking(
                CancelTarget::Explicit {
                    name: "Bob".into(),
                    email: "BOB@example.com".into(),
                    slot: SlotRef::new(D1, "18:00", "Training"),
                    block_dates: vec![],
                },
                "",
            )
            .unwrap();

        assert_eq!(booking_strings(&store, D1), vec!["18:00 - Training Advanced (Bob) (bob@example.com)"]);
        let mappings: MappingsTable = tables::load(store.as_ref(), Table::BookingMappings).unwrap();
        assert_eq!(mappings.len(), 1);
        assert!(mappings.values().all(|m| m.title == "Training Advanced"));

        let slots: SlotsTable = tables::load(store.as_ref(), Table::AvailableSlots).unwrap();
        assert!(slots[D1][0].booked_users.is_empty());
        assert_eq!(slots[D1][1].booked_users.len(), 1);
    }

    #[test]
    fn test_explicit_cancellation_ignores_slot_case() {
        let (manager, store, mut rx) = fixture(json!({ D1: [slot_json("18:00", "Open Run", 1)] }));
        let receipt = manager.create_booking(request("Bob", "bob@example.com", SlotRef::new(D1, "18:00", "Open Run"))).unwrap();

        let cancelled = manager
            .cancel_booking(
                CancelTarget::Explicit {
                    name: "Bob".into(),
                    email: "bob@example.com".into(),
                    slot: SlotRef::new(D1, "18:00", "open run"),
                    block_dates: vec![],
                },
                "",
            )
            .unwrap();

        assert_eq!(cancelled.removed_from, vec![D1.to_string()]);
        assert!(booking_strings(&store, D1).is_empty());
        let mappings: MappingsTable = tables::load(store.as_ref(), Table::BookingMappings).unwrap();
        assert!(!mappings.contains_key(&receipt.booking_id));
        let slots: SlotsTable = tables::load(store.as_ref(), Table::AvailableSlots).unwrap();
        assert!(slots[D1][0].booked_users.is_empty());

        let emails = rx.drain_emails();
        let cancellation = emails.iter().find(|e| e.kind == EmailKind::Cancellation).unwrap();
        assert_eq!(cancellation.fields["title"], json!("Open Run"));
    }

    #[test]
    fn test_expiry_sweep_releases_only_lapsed_pending() {
        let (manager, store, mut rx) = fixture(json!({ D1: [slot_json("18:00", "Open Run", 4)] }));
        let slot = SlotRef::new(D1, "18:00", "Open Run");
        let lapsed = manager.create_booking(request("Old", "old@example.com", slot.clone())).unwrap();
        let fresh = manager.create_booking(request("New", "new@example.com", slot.clone())).unwrap();
        let paid = manager.create_booking(request("Paid", "paid@example.com", slot)).unwrap();
        manager.confirm_booking(&paid.booking_id).unwrap();

        // Push two deadlines into the past.
        tables::update(store.as_ref(), Table::BookingMappings, WriteMode::Replace, |m: &mut MappingsTable| {
            let past = (Utc::now() - Duration::minutes(5)).timestamp();
            m.get_mut(&lapsed.booking_id).unwrap().expiry_timestamp = past;
            m.get_mut(&paid.booking_id).unwrap().expiry_timestamp = past;
            Ok(())
        })
        .unwrap();
        rx.drain();

        let sweep = manager.expire_pending_bookings().unwrap();
        assert_eq!(sweep.expired, vec![lapsed.booking_id.clone()]);
        assert!(sweep.failed.is_empty());

        let strings = booking_strings(&store, D1);
        assert_eq!(strings.len(), 2);
        assert!(strings.iter().all(|s| !s.contains("old@example.com")));

        let ledger: CancellationLedger = tables::load(store.as_ref(), Table::Cancellations).unwrap();
        assert_eq!(ledger[&lapsed.booking_id].outcome, CancellationOutcome::Expired);
        assert_eq!(ledger[&lapsed.booking_id].cancellation_reason, EXPIRED_REASON);

        // Running again finds nothing new.
        assert!(manager.expire_pending_bookings().unwrap().expired.is_empty());
        assert!(matches!(manager.lookup_booking(&fresh.booking_id), Ok(BookingLookup::Active { .. })));

        let emails = rx.drain_emails();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].kind, EmailKind::Cancellation);
        assert_eq!(emails[0].recipient, "old@example.com");
    }

    #[test]
    fn test_lookup_lazily_expires() {
        let (manager, store, _rx) = fixture(json!({ D1: [slot_json("18:00", "Open Run", 4)] }));
        let receipt = manager.create_booking(request("Bob", "bob@example.com", SlotRef::new(D1, "18:00", "Open Run"))).unwrap();
        tables::update(store.as_ref(), Table::BookingMappings, WriteMode::Replace, |m: &mut MappingsTable| {
            m.get_mut(&receipt.booking_id).unwrap().expiry_timestamp = 0;
            Ok(())
        })
        .unwrap();

        assert!(matches!(manager.lookup_booking(&receipt.booking_id), Err(BookingError::Expired(_))));
        assert!(booking_strings(&store, D1).is_empty());
        assert!(matches!(manager.lookup_booking(&receipt.booking_id), Ok(BookingLookup::Cancelled(_))));
        assert!(matches!(manager.confirm_booking(&receipt.booking_id), Err(BookingError::NotFound(_))));
    }

    #[test]
    fn test_prune_orphaned_mappings() {
        let (manager, store, _rx) = fixture(json!({ D1: [slot_json("18:00", "Open Run", 4)] }));
        let kept = manager.create_booking(request("Bob", "bob@example.com", SlotRef::new(D1, "18:00", "Open Run"))).unwrap();
        let orphan = manager.create_booking(request("Ann", "ann@example.com", SlotRef::new(D1, "18:00", "Open Run"))).unwrap();

        // Bulk replace of bookings.json dropped Ann.
        store
            .write(Table::Bookings, &json!({ D1: ["18:00 - Open Run (Bob) (bob@example.com)"] }))
            .unwrap();

        let pruned = manager.prune_orphaned_mappings().unwrap();
        assert_eq!(pruned, vec![orphan.booking_id]);
        let mappings: MappingsTable = tables::load(store.as_ref(), Table::BookingMappings).unwrap();
        assert!(mappings.contains_key(&kept.booking_id));

        let slots: SlotsTable = tables::load(store.as_ref(), Table::AvailableSlots).unwrap();
        assert_eq!(slots[D1][0].booked_users, vec![BookedUser::new("Bob", "bob@example.com")]);
    }

    #[test]
    fn test_booking_id_format() {
        let id = generate_booking_id(Utc::now());
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts[0], "BK");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_email_validation() {
        assert!(validate_email("a.b@club.example").is_ok());
        assert!(validate_email(" bob@x.io ").is_ok());
        for bad in ["", "bob", "@x.io", "bob@", "bob@x", "bob@.io", "bo b@x.io", "a@b@c.io"] {
            assert!(validate_email(bad).is_err(), "{} should be rejected", bad);
        }
    }
}
