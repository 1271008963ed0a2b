//! Bridge state: a slot that still has free seats while people are waiting
//! is flagged so the next seat goes to the waitlist, not to a walk-up booking.

use crate::error::BookingResult;
use crate::models::{BookingsTable, Slot, SlotRef, SlotsTable, WaitlistEntry, WaitlistTable};
use crate::reconciler::parse_day;
use crate::tables;
use courtbook_core::{Table, TableStore, WriteMode};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOutcome {
    pub bridged: bool,
    pub booked: usize,
    pub waitlisted: usize,
    pub capacity: u32,
    /// Dates whose slot instance carries the flag
    pub dates: Vec<String>,
}

/// `booked_count < capacity` and somebody is waiting
pub fn should_bridge(slot: &Slot, waitlisted: &[&WaitlistEntry], booked_count: usize) -> bool {
    booked_count < slot.capacity() as usize && !waitlisted.is_empty()
}

/// Recompute the flag for one slot and write it onto every date of its block.
/// Returns `None` when the date or slot does not exist.
pub fn update_bridge_state(
    slots: &mut SlotsTable,
    date: &str,
    time: &str,
    title: &str,
    bookings: &BookingsTable,
    waitlist: &WaitlistTable,
    block_id: Option<&str>,
) -> Option<BridgeOutcome> {
    let mut target = SlotRef::new(date, time, title);
    if let Some(id) = block_id {
        target = target.with_block(id);
    }
    let (index, slot) = target.locate(slots)?;
    let slot = slot.clone();

    let dates = if slot.is_block() { slot.block_dates.clone() } else { vec![date.to_string()] };

    let booked: BTreeSet<String> = dates
        .iter()
        .flat_map(|d| parse_day(d, bookings.get(d).map(Vec::as_slice).unwrap_or_default()))
        .filter(|entry| entry.matches_slot(&slot.time, &slot.title))
        .map(|entry| entry.email_key())
        .collect();

    let mut waiting: BTreeMap<String, &WaitlistEntry> = BTreeMap::new();
    for entry in dates
        .iter()
        .filter_map(|d| waitlist.get(d))
        .flatten()
        .filter(|e| e.matches_slot(&slot.time, &slot.title))
    {
        waiting.entry(entry.email.trim().to_lowercase()).or_insert(entry);
    }
    let waiting: Vec<&WaitlistEntry> = waiting.into_values().collect();

    let bridged = should_bridge(&slot, &waiting, booked.len());

    match slot.block_key().filter(|_| slot.is_block()) {
        Some(block) => {
            for d in &dates {
                for instance in slots.get_mut(d).into_iter().flatten() {
                    if instance.is_block_sibling(block, &slot.time, &slot.title) {
                        instance.bridge_state = bridged;
                    }
                }
            }
        }
        None => {
            if let Some(instance) = slots.get_mut(date).and_then(|day| day.get_mut(index)) {
                instance.bridge_state = bridged;
            }
        }
    }

    Some(BridgeOutcome {
        bridged,
        booked: booked.len(),
        waitlisted: waiting.len(),
        capacity: slot.capacity(),
        dates,
    })
}

/// Bridge pass for one slot against the stored tables.
pub fn refresh(store: &dyn TableStore, slot: &SlotRef) -> BookingResult<Option<BridgeOutcome>> {
    let bookings: BookingsTable = tables::load(store, Table::Bookings)?;
    let waitlist: WaitlistTable = tables::load(store, Table::Waitlist)?;

    let outcome = tables::update(store, Table::AvailableSlots, WriteMode::Replace, |slots: &mut SlotsTable| {
        // A session key may point at a slot whose time/title were edited.
        let (time, title) = match slot.locate(slots) {
            Some((_, found)) => (found.time.clone(), found.title.clone()),
            None => (slot.time.clone(), slot.title.clone()),
        };
        Ok(update_bridge_state(slots, &slot.date, &time, &title, &bookings, &waitlist, slot.block_id.as_deref()))
    })?;

    match &outcome {
        Some(o) => debug!("Bridge for {}: {} ({}/{} booked, {} waiting)", slot, o.bridged, o.booked, o.capacity, o.waitlisted),
        None => debug!("Bridge skipped, no slot {}", slot),
    }
    Ok(outcome)
}

/// Recompute the flag on every slot. Returns how many slots flipped.
pub fn refresh_all(store: &dyn TableStore) -> BookingResult<usize> {
    let bookings: BookingsTable = tables::load(store, Table::Bookings)?;
    let waitlist: WaitlistTable = tables::load(store, Table::Waitlist)?;

    tables::update(store, Table::AvailableSlots, WriteMode::Replace, |slots: &mut SlotsTable| {
        let before: Vec<bool> = slots.values().flatten().map(|s| s.bridge_state).collect();
        let targets: Vec<(String, String, String, Option<String>)> = slots
            .iter()
            .flat_map(|(date, day)| {
                day.iter().map(move |s| (date.clone(), s.time.clone(), s.title.clone(), s.block_key().map(str::to_string)))
            })
            .collect();
        for (date, time, title, block) in targets {
            update_bridge_state(slots, &date, &time, &title, &bookings, &waitlist, block.as_deref());
        }
        let after = slots.values().flatten().map(|s| s.bridge_state);
        Ok(before.into_iter().zip(after).filter(|(b, a)| b != a).count())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;

    const D1: &str = "2025-03-01";
    const D2: &str = "2025-03-08";

    fn waiting(email: &str, time: &str, title: &str) -> WaitlistEntry {
        WaitlistEntry {
            time: time.into(),
            title: title.into(),
            session_type: "open".into(),
            name: "W".into(),
            email: email.into(),
            block_id: None,
            block_dates: vec![],
            is_block: false,
            joined_at: Utc::now(),
            extra: Map::new(),
        }
    }

    fn booking(time: &str, title: &str, email: &str) -> String {
        format!("{} - {} (P) ({})", time, title, email)
    }

    #[test]
    fn test_should_bridge_truth_table() {
        let slot = Slot::new("18:00", "Open", 2);
        let entry = waiting("a@x.io", "18:00", "Open");
        let some = [&entry];

        assert!(should_bridge(&slot, &some, 1));
        assert!(!should_bridge(&slot, &some, 2));
        assert!(!should_bridge(&slot, &[], 1));
        assert!(!should_bridge(&slot, &[], 2));
    }

    #[test]
    fn test_single_slot_flag() {
        let mut slots = SlotsTable::new();
        slots.insert(D1.into(), vec![Slot::new("18:00", "Open", 2), Slot::new("20:00", "Open", 2)]);
        let mut bookings = BookingsTable::new();
        bookings.insert(D1.into(), vec![booking("18:00", "Open", "bob@x.io")]);
        let mut waitlist = WaitlistTable::new();
        waitlist.insert(D1.into(), vec![waiting("alice@x.io", "18:00", "Open")]);

        let outcome = update_bridge_state(&mut slots, D1, "18:00", "Open", &bookings, &waitlist, None).unwrap();
        assert!(outcome.bridged);
        assert_eq!((outcome.booked, outcome.waitlisted, outcome.capacity), (1, 1, 2));
        assert!(slots[D1][0].bridge_state);
        assert!(!slots[D1][1].bridge_state);
    }

    #[test]
    fn test_block_flag_is_written_to_every_date() {
        let block = Slot::new("19:00", "League", 2).in_block("blk", &[D1, D2]);
        let mut slots = SlotsTable::new();
        slots.insert(D1.into(), vec![block.clone()]);
        slots.insert(D2.into(), vec![block]);

        // Same person booked on both dates counts once.
        let mut bookings = BookingsTable::new();
        bookings.insert(D1.into(), vec![booking("19:00", "League", "bob@x.io")]);
        bookings.insert(D2.into(), vec![booking("19:00", "League", "BOB@x.io")]);

        // Block waitlist entries live under the first date only.
        let mut waitlist = WaitlistTable::new();
        waitlist.insert(D1.into(), vec![waiting("alice@x.io", "19:00", "League")]);

        let outcome = update_bridge_state(&mut slots, D2, "19:00", "League", &bookings, &waitlist, Some("blk")).unwrap();
        assert_eq!(outcome.booked, 1);
        assert!(outcome.bridged);
        assert!(slots[D1][0].bridge_state && slots[D2][0].bridge_state);

        bookings.get_mut(D1).unwrap().push(booking("19:00", "League", "cy@x.io"));
        let outcome = update_bridge_state(&mut slots, D1, "19:00", "League", &bookings, &waitlist, Some("blk")).unwrap();
        assert!(!outcome.bridged);
        assert!(!slots[D1][0].bridge_state && !slots[D2][0].bridge_state);
    }

    #[test]
    fn test_missing_slot_is_a_no_op() {
        let mut slots = SlotsTable::new();
        slots.insert(D1.into(), vec![Slot::new("18:00", "Open", 2)]);
        let before = slots.clone();
        assert!(update_bridge_state(&mut slots, D2, "18:00", "Open", &BookingsTable::new(), &WaitlistTable::new(), None).is_none());
        assert!(update_bridge_state(&mut slots, D1, "18:00", "Closed", &BookingsTable::new(), &WaitlistTable::new(), None).is_none());
        assert_eq!(slots, before);
    }
}
