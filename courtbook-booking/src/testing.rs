//! Shared fixtures for the unit tests in this crate.

use crate::manager::BookingManager;
use crate::models::BookingsTable;
use crate::tables;
use courtbook_core::{Outbox, OutboxReceiver, Table};
use courtbook_store::app_config::BookingRules;
use courtbook_store::MemoryTableStore;
use serde_json::{json, Value};
use std::sync::Arc;

pub const D1: &str = "2025-03-01";
pub const D2: &str = "2025-03-08";
pub const D3: &str = "2025-03-15";

pub fn rules() -> BookingRules {
    BookingRules { offer_link_base: "https://club.example/php".into(), ..BookingRules::default() }
}

/// Manager over an in-memory store seeded with `slots`
pub fn fixture(slots: Value) -> (BookingManager, Arc<MemoryTableStore>, OutboxReceiver) {
    let store = Arc::new(MemoryTableStore::new().with_table(Table::AvailableSlots, slots));
    let (outbox, rx) = Outbox::channel();
    let manager = BookingManager::new(store.clone(), outbox, rules());
    (manager, store, rx)
}

pub fn slot_json(time: &str, title: &str, capacity: u32) -> Value {
    json!({ "time": time, "title": title, "numberOfSpots": capacity })
}

pub fn booking_strings(store: &Arc<MemoryTableStore>, date: &str) -> Vec<String> {
    let bookings: BookingsTable = tables::load(store.as_ref(), Table::Bookings).unwrap_or_default();
    bookings.get(date).cloned().unwrap_or_default()
}
