//! Admin edits and cancellations of a whole session.
//!
//! Slot identity (time + title) is copied into bookings, mappings, waitlist
//! entries and offers. Each table is walked with the old identity as the key
//! and patched with the new one, one table lock at a time.

use crate::error::{BookingError, BookingResult};
use crate::manager::{BookingManager, ResolvedSlot};
use crate::models::{
    BookingsTable, MappingsTable, OfferStatus, OffersTable, Slot, SlotRef, SlotsTable, WaitlistEntry,
};
use crate::reconciler::parse_day;
use crate::tables;
use crate::waitlist::{remove_entries, update_waitlist};
use chrono::Utc;
use courtbook_core::{validate_slot_identity, BookingEntry, Table, WriteMode};
use courtbook_shared::{ActivityEntry, EmailKind, EmailRequest};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;

/// Fields to change; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct SessionEdit {
    pub time: Option<String>,
    pub title: Option<String>,
    pub price: Option<Value>,
    pub location: Option<String>,
    pub capacity: Option<u32>,
    pub session_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEditReport {
    pub dates: Vec<String>,
    pub slots_updated: usize,
    pub bookings_rewritten: usize,
    pub mappings_updated: usize,
    pub waitlist_updated: usize,
    pub offers_updated: usize,
    pub notified: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCancellation {
    pub dates: Vec<String>,
    pub bookings_removed: usize,
    pub mappings_removed: usize,
    pub waitlist_removed: usize,
    pub offers_withdrawn: usize,
    pub notified: usize,
}

impl BookingManager {
    pub fn edit_session(&self, original: &SlotRef, edit: SessionEdit) -> BookingResult<SessionEditReport> {
        let target = self.resolve_target(original, &[])?;
        let old_time = target.slot.time.clone();
        let old_title = target.slot.title.clone();

        let new_time = non_blank(edit.time.as_deref()).unwrap_or(&old_time).to_string();
        let new_title = non_blank(edit.title.as_deref()).unwrap_or(&old_title).to_string();
        validate_slot_identity(&new_time, &new_title)?;
        let renamed = new_time != old_time || new_title != old_title;
        let session_type = non_blank(edit.session_type.as_deref()).map(str::to_string);
        let location = edit.location.as_deref().map(|l| l.trim().to_string());

        let mut report = SessionEditReport { dates: target.dates.clone(), ..SessionEditReport::default() };

        report.slots_updated = tables::update(self.store(), Table::AvailableSlots, WriteMode::Replace, |slots: &mut SlotsTable| {
            if renamed {
                check_collision(slots, &target, &new_time, &new_title)?;
            }
            let mut updated = 0;
            for slot in target_instances(slots, &target) {
                slot.time = new_time.clone();
                slot.title = new_title.clone();
                if let Some(price) = &edit.price {
                    slot.price = Some(price.clone());
                }
                if let Some(location) = &location {
                    slot.location = Some(location.clone());
                }
                if let Some(capacity) = edit.capacity {
                    slot.set_capacity(capacity);
                }
                if let Some(session_type) = &session_type {
                    slot.session_type = Some(session_type.clone());
                }
                updated += 1;
            }
            Ok(updated)
        })?;

        if renamed {
            report.bookings_rewritten = tables::update(self.store(), Table::Bookings, WriteMode::Replace, |bookings: &mut BookingsTable| {
                let mut rewritten = 0;
                for date in &target.dates {
                    for raw in bookings.get_mut(date).into_iter().flatten() {
                        let Ok(entry) = BookingEntry::parse(raw) else { continue };
                        if entry.matches_slot(&old_time, &old_title) {
                            *raw = entry.retitled(&new_time, &new_title).to_string();
                            rewritten += 1;
                        }
                    }
                }
                Ok(rewritten)
            })?;
        }

        report.mappings_updated = tables::update(self.store(), Table::BookingMappings, WriteMode::Replace, |mappings: &mut MappingsTable| {
            let mut updated = 0;
            for mapping in mappings.values_mut().filter(|m| {
                m.time.trim() == old_time.trim()
                    && m.title.trim() == old_title.trim()
                    && m.dates().iter().any(|d| target.dates.contains(d))
            }) {
                mapping.time = new_time.clone();
                mapping.title = new_title.clone();
                if let Some(price) = &edit.price {
                    mapping.price = Some(price.clone());
                }
                if let Some(location) = &location {
                    mapping.location = Some(location.clone());
                }
                updated += 1;
            }
            Ok(updated)
        })?;

        report.waitlist_updated = update_waitlist(self.store(), |waitlist| {
            let mut updated = 0;
            for date in &target.dates {
                for entry in waitlist.get_mut(date).into_iter().flatten() {
                    if !entry.matches_slot(&old_time, &old_title) {
                        continue;
                    }
                    entry.time = new_time.clone();
                    entry.title = new_title.clone();
                    if let Some(session_type) = &session_type {
                        entry.session_type = session_type.clone();
                    }
                    updated += 1;
                }
            }
            Ok(updated)
        })?;

        report.offers_updated = tables::update(self.store(), Table::Offers, WriteMode::Replace, |offers: &mut OffersTable| {
            let mut updated = 0;
            for offer in offers.values_mut().filter(|o| {
                o.status == OfferStatus::Pending
                    && o.time.trim() == old_time.trim()
                    && o.title.trim() == old_title.trim()
                    && target.dates.contains(&o.date)
            }) {
                offer.time = new_time.clone();
                offer.title = new_title.clone();
                updated += 1;
            }
            Ok(updated)
        })?;

        let new_ref = SlotRef { time: new_time.clone(), title: new_title.clone(), ..target.slot_ref.clone() };
        self.refresh_derived_state(Some(&new_ref))?;

        let holders = self.holders(&target.dates, &new_time, &new_title)?;
        for (email, name) in &holders {
            self.notify(
                EmailRequest::new(EmailKind::SessionEdited, email, name)
                    .field("date", target.slot_ref.date.as_str())
                    .field("oldTime", old_time.as_str())
                    .field("oldTitle", old_title.as_str())
                    .field("time", new_time.as_str())
                    .field("title", new_title.as_str())
                    .field("isBlock", target.is_block())
                    .field("blockDates", json!(target.dates))
                    .field("price", edit.price.clone().or_else(|| target.slot.price.clone()).unwrap_or_default())
                    .field("location", location.clone().or_else(|| target.slot.location.clone()).unwrap_or_default()),
            );
        }
        report.notified = holders.len();

        info!(
            "Edited {} on {} date(s): {} booking(s), {} mapping(s), {} waitlist, {} offer(s)",
            original, report.dates.len(), report.bookings_rewritten, report.mappings_updated, report.waitlist_updated, report.offers_updated
        );
        self.record(
            ActivityEntry::new("session", "Session edited", &new_title, format!("{} {} is now {} {}", old_time, old_title, new_time, new_title))
                .with_session(&target.slot_ref.date, &new_time, &new_title)
                .with_meta(json!(report)),
        );
        Ok(report)
    }

    /// Remove a session (every block instance when block-wide) together with
    /// its bookings, mappings and waitlist, then tell everyone involved.
    pub fn cancel_session(&self, slot: &SlotRef, reason: &str) -> BookingResult<SessionCancellation> {
        let target = self.resolve_target(slot, &[])?;
        let time = target.slot.time.clone();
        let title = target.slot.title.clone();
        let mut report = SessionCancellation { dates: target.dates.clone(), ..SessionCancellation::default() };

        let mut recipients = self.holders(&target.dates, &time, &title)?;

        report.bookings_removed = tables::update(self.store(), Table::Bookings, WriteMode::Replace, |bookings: &mut BookingsTable| {
            let mut removed = 0;
            for date in &target.dates {
                let Some(day) = bookings.get_mut(date) else { continue };
                let before = day.len();
                day.retain(|raw| !BookingEntry::parse(raw).is_ok_and(|e| e.matches_slot(&time, &title)));
                removed += before - day.len();
                if day.is_empty() {
                    bookings.remove(date);
                }
            }
            Ok(removed)
        })?;

        tables::update(self.store(), Table::AvailableSlots, WriteMode::Backup, |slots: &mut SlotsTable| {
            let single_index = target.slot_ref.locate(slots).map(|(index, _)| index);
            for date in &target.dates {
                let Some(day) = slots.get_mut(date) else { continue };
                match (target.block_id.as_deref(), single_index) {
                    (Some(block), _) => day.retain(|s| !s.is_block_sibling(block, &time, &title)),
                    (None, Some(index)) if index < day.len() => {
                        day.remove(index);
                    }
                    (None, _) => {}
                }
                if day.is_empty() {
                    slots.remove(date);
                }
            }
            Ok(())
        })?;

        report.mappings_removed = tables::update(self.store(), Table::BookingMappings, WriteMode::Replace, |mappings: &mut MappingsTable| {
            let before = mappings.len();
            mappings.retain(|_, m| {
                !(m.time.trim() == time.trim() && m.title.trim() == title.trim() && m.dates().iter().any(|d| target.dates.contains(d)))
            });
            Ok(before - mappings.len())
        })?;

        let waiting: Vec<WaitlistEntry> = update_waitlist(self.store(), |waitlist| {
            Ok(remove_entries(waitlist, &target.dates, |e| e.matches_slot(&time, &title)))
        })?;
        report.waitlist_removed = waiting.len();
        for entry in &waiting {
            recipients.entry(entry.email.trim().to_lowercase()).or_insert_with(|| entry.name.clone());
        }

        let now = Utc::now();
        report.offers_withdrawn = tables::update(self.store(), Table::Offers, WriteMode::Replace, |offers: &mut OffersTable| {
            let mut withdrawn = 0;
            for offer in offers.values_mut().filter(|o| {
                o.status == OfferStatus::Pending
                    && o.time.trim() == time.trim()
                    && o.title.trim() == title.trim()
                    && target.dates.contains(&o.date)
            }) {
                offer.mark(OfferStatus::Expired, now);
                withdrawn += 1;
            }
            Ok(withdrawn)
        })?;

        self.refresh_derived_state(None)?;

        let reason = reason.trim();
        for (email, name) in &recipients {
            self.notify(
                EmailRequest::new(EmailKind::SessionCancelled, email, name)
                    .field("date", target.slot_ref.date.as_str())
                    .field("time", time.as_str())
                    .field("title", title.as_str())
                    .field("isBlock", target.is_block())
                    .field("blockDates", json!(target.dates))
                    .field("reason", reason),
            );
        }
        report.notified = recipients.len();

        info!("Cancelled session {} ({} booking(s), {} waiting)", target.slot_ref, report.bookings_removed, report.waitlist_removed);
        self.record(
            ActivityEntry::new("session", "Session cancelled", &title, if reason.is_empty() { "Session cancelled".to_string() } else { reason.to_string() })
                .with_session(&target.slot_ref.date, &time, &title)
                .with_meta(json!(report)),
        );
        Ok(report)
    }

    /// Distinct holders of `(time, title)` across `dates`: lower-cased email → name
    fn holders(&self, dates: &[String], time: &str, title: &str) -> BookingResult<BTreeMap<String, String>> {
        let bookings: BookingsTable = tables::load(self.store(), Table::Bookings)?;
        let mut holders = BTreeMap::new();
        for date in dates {
            for entry in parse_day(date, bookings.get(date).map(Vec::as_slice).unwrap_or_default()) {
                if entry.matches_slot(time, title) {
                    holders.entry(entry.email_key()).or_insert(entry.name);
                }
            }
        }
        Ok(holders)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Mutable handles on every instance of the target session
fn target_instances<'a>(slots: &'a mut SlotsTable, target: &ResolvedSlot) -> Vec<&'a mut Slot> {
    let (time, title) = (target.slot.time.as_str(), target.slot.title.as_str());
    let single_index = target.slot_ref.locate(slots).map(|(index, _)| index);

    slots
        .iter_mut()
        .filter(|(date, _)| target.dates.contains(date))
        .flat_map(|(date, day)| {
            let is_primary = *date == target.slot_ref.date;
            day.iter_mut().enumerate().filter_map(move |(index, slot)| {
                let hit = match target.block_id.as_deref() {
                    Some(block) => slot.is_block_sibling(block, time, title),
                    None => is_primary && Some(index) == single_index,
                };
                hit.then_some(slot)
            })
        })
        .collect()
}

fn check_collision(slots: &SlotsTable, target: &ResolvedSlot, new_time: &str, new_title: &str) -> BookingResult<()> {
    for date in &target.dates {
        let clash = slots
            .get(date)
            .is_some_and(|day| day.iter().any(|s| s.matches_identity(new_time, new_title)));
        if clash {
            return Err(BookingError::Validation(format!(
                "A session {} {} already exists on {}",
                new_time, new_title, date
            )));
        }
    }
    Ok(())
}
