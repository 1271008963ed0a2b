//! Rebuilds every slot's `bookedUsers` cache from `bookings.json`.
//!
//! Bookings are authoritative. Any write path that touches them runs a
//! reconcile pass before returning, which is also what heals a crash between
//! the bookings write and the slots write.

use crate::error::BookingResult;
use crate::models::{BookedUser, BookingsTable, SlotsTable};
use crate::tables;
use courtbook_core::{BookingEntry, Table, TableStore, WriteMode};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// One slot whose cache disagreed with the bookings table
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlotChange {
    pub date: String,
    pub slot_index: usize,
    pub time: String,
    pub title: String,
    pub expected: Vec<BookedUser>,
    pub current: Vec<BookedUser>,
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub slots: SlotsTable,
    pub changes: Vec<SlotChange>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    /// True when changes were found and written back
    pub applied: bool,
    pub changes: Vec<SlotChange>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Pure reconciliation: returns the corrected slots plus what changed.
pub fn reconcile(bookings: &BookingsTable, slots: &SlotsTable) -> Reconciliation {
    let mut updated = slots.clone();
    let changes = reconcile_in_place(bookings, &mut updated);
    Reconciliation { slots: updated, changes }
}

pub(crate) fn reconcile_in_place(bookings: &BookingsTable, slots: &mut SlotsTable) -> Vec<SlotChange> {
    let mut changes = Vec::new();

    for (date, day) in slots.iter_mut() {
        let entries = parse_day(date, bookings.get(date).map(Vec::as_slice).unwrap_or_default());

        for (slot_index, slot) in day.iter_mut().enumerate() {
            let expected = expected_users(&entries, &slot.time, &slot.title);
            if email_set(&expected) == email_set(&slot.booked_users) {
                continue;
            }
            changes.push(SlotChange {
                date: date.clone(),
                slot_index,
                time: slot.time.clone(),
                title: slot.title.clone(),
                expected: expected.clone(),
                current: std::mem::take(&mut slot.booked_users),
            });
            slot.booked_users = expected;
        }
    }

    changes
}

/// Reconcile the stored tables. With `apply = false` this is a dry run.
pub fn run(store: &dyn TableStore, apply: bool) -> BookingResult<ReconcileReport> {
    let bookings: BookingsTable = tables::load(store, Table::Bookings)?;

    if !apply {
        let slots: SlotsTable = tables::load(store, Table::AvailableSlots)?;
        let Reconciliation { changes, .. } = reconcile(&bookings, &slots);
        return Ok(ReconcileReport { applied: false, changes });
    }

    let changes = tables::update(store, Table::AvailableSlots, WriteMode::Backup, |slots: &mut SlotsTable| {
        Ok(reconcile_in_place(&bookings, slots))
    })?;
    if !changes.is_empty() {
        info!("Reconciled {} slot(s) against bookings", changes.len());
    }
    Ok(ReconcileReport { applied: !changes.is_empty(), changes })
}

/// Decoded bookings for one date; unreadable strings count as nobody.
pub(crate) fn parse_day(date: &str, raw: &[String]) -> Vec<BookingEntry> {
    raw.iter()
        .filter_map(|s| match BookingEntry::parse(s) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unreadable booking on {}: {}", date, e);
                None
            }
        })
        .collect()
}

/// Holders of `(time, title)`, one per lower-cased email, sorted by email.
pub(crate) fn expected_users(entries: &[BookingEntry], time: &str, title: &str) -> Vec<BookedUser> {
    let mut by_email: BTreeMap<String, BookedUser> = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.matches_slot(time, title)) {
        by_email.entry(entry.email_key()).or_insert_with(|| BookedUser::from(entry));
    }
    by_email.into_values().collect()
}

fn email_set(users: &[BookedUser]) -> BTreeSet<String> {
    users.iter().map(BookedUser::email_key).filter(|e| !e.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Slot;
    use courtbook_store::MemoryTableStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn bookings(entries: &[(&str, &str)]) -> BookingsTable {
        let mut table = BookingsTable::new();
        for (date, raw) in entries {
            table.entry(date.to_string()).or_default().push(raw.to_string());
        }
        table
    }

    fn slots(date: &str, day: Vec<Slot>) -> SlotsTable {
        let mut table = SlotsTable::new();
        table.insert(date.to_string(), day);
        table
    }

    #[test]
    fn test_drift_is_repaired() {
        let b = bookings(&[("2025-03-01", "18:00 - Open Run (Bob) (Bob@Example.com)")]);
        let mut stale = Slot::new("18:00", "Open Run", 10);
        stale.booked_users = vec![BookedUser::new("Ghost", "ghost@example.com")];
        let s = slots("2025-03-01", vec![stale]);

        let result = reconcile(&b, &s);
        assert_eq!(result.changes.len(), 1);
        let change = &result.changes[0];
        assert_eq!(change.slot_index, 0);
        assert_eq!(change.current, vec![BookedUser::new("Ghost", "ghost@example.com")]);
        assert_eq!(result.slots["2025-03-01"][0].booked_users, vec![BookedUser::new("Bob", "bob@example.com")]);
    }

    #[test]
    fn test_prefix_titles_do_not_cross_match() {
        let b = bookings(&[("2025-03-01", "18:00 - Training Advanced (Ann) (ann@example.com)")]);
        let s = slots("2025-03-01", vec![Slot::new("18:00", "Training", 10), Slot::new("18:00", "Training Advanced", 10)]);

        let result = reconcile(&b, &s);
        assert!(result.slots["2025-03-01"][0].booked_users.is_empty());
        assert_eq!(result.slots["2025-03-01"][1].booked_users.len(), 1);
    }

    #[test]
    fn test_email_case_and_order_are_not_drift() {
        let b = bookings(&[
            ("2025-03-01", "18:00 - Open Run (Bob) (bob@example.com)"),
            ("2025-03-01", "18:00 - Open Run (Ann) (ann@example.com)"),
        ]);
        let mut slot = Slot::new("18:00", "Open Run", 10);
        slot.booked_users = vec![BookedUser::new("Bob", "BOB@example.com"), BookedUser::new("Ann", "ann@example.com")];
        assert!(reconcile(&b, &slots("2025-03-01", vec![slot])).changes.is_empty());
    }

    #[test]
    fn test_duplicate_strings_count_once() {
        let b = bookings(&[
            ("2025-03-01", "18:00 - Open Run (Bob) (bob@example.com)"),
            ("2025-03-01", "18:00 - Open Run (Bobby) (BOB@example.com)"),
            ("2025-03-01", "not a booking"),
        ]);
        let result = reconcile(&b, &slots("2025-03-01", vec![Slot::new("18:00", "Open Run", 10)]));
        assert_eq!(result.slots["2025-03-01"][0].booked_users, vec![BookedUser::new("Bob", "bob@example.com")]);
    }

    #[test]
    fn test_dry_run_writes_nothing_and_apply_backs_up() {
        let store = MemoryTableStore::new()
            .with_table(Table::Bookings, json!({"2025-03-01": ["18:00 - Open Run (Bob) (bob@example.com)"]}))
            .with_table(Table::AvailableSlots, json!({"2025-03-01": [{"time": "18:00", "title": "Open Run", "numberOfSpots": 4}]}));

        let dry = run(&store, false).unwrap();
        assert!(!dry.applied);
        assert_eq!(dry.changes.len(), 1);
        assert!(store.backups(Table::AvailableSlots).is_empty());

        let applied = run(&store, true).unwrap();
        assert!(applied.applied);
        assert_eq!(store.backups(Table::AvailableSlots).len(), 1);
        let stored = store.read(Table::AvailableSlots).unwrap();
        assert_eq!(stored["2025-03-01"][0]["bookedUsers"][0]["email"], "bob@example.com");

        let again = run(&store, true).unwrap();
        assert!(again.is_clean());
        assert_eq!(store.backups(Table::AvailableSlots).len(), 1);
    }

    fn arb_booking() -> impl Strategy<Value = String> {
        let entry = (
            prop::sample::select(vec!["18:00", "19:30"]),
            prop::sample::select(vec!["Open", "Open Advanced", "League (U16)"]),
            prop::sample::select(vec!["Ann", "Bob", "Cy (Jr)"]),
            prop::sample::select(vec!["ann@x.io", "bob@x.io", "BOB@x.io", "cy@x.io"]),
        )
            .prop_map(|(time, title, name, email)| format!("{} - {} ({}) ({})", time, title, name, email));
        prop_oneof![4 => entry, 1 => Just("garbage".to_string())]
    }

    fn arb_slot() -> impl Strategy<Value = Slot> {
        (
            prop::sample::select(vec!["18:00", "19:30"]),
            prop::sample::select(vec!["Open", "Open Advanced", "League (U16)"]),
            prop::collection::vec(prop::sample::select(vec!["ann@x.io", "Bob@x.io", "zed@x.io"]), 0..3),
        )
            .prop_map(|(time, title, emails)| {
                let mut slot = Slot::new(time, title, 4);
                slot.booked_users = emails.into_iter().map(|e| BookedUser::new("X", e)).collect();
                slot
            })
    }

    proptest! {
        #[test]
        fn prop_reconcile_is_idempotent(
            b in prop::collection::btree_map(prop::sample::select(vec!["d1".to_string(), "d2".to_string()]), prop::collection::vec(arb_booking(), 0..6), 0..3),
            s in prop::collection::btree_map(prop::sample::select(vec!["d1".to_string(), "d2".to_string(), "d3".to_string()]), prop::collection::vec(arb_slot(), 0..4), 0..3),
        ) {
            let first = reconcile(&b, &s);
            let second = reconcile(&b, &first.slots);
            prop_assert!(second.changes.is_empty());
            prop_assert_eq!(&second.slots, &first.slots);
        }
    }
}
