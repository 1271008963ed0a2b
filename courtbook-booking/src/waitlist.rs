use crate::bridge::BridgeOutcome;
use crate::error::{BookingError, BookingResult};
use crate::manager::{validate_email, BookingManager};
use crate::models::{SlotRef, WaitlistEntry, WaitlistTable};
use crate::tables;
use chrono::Utc;
use courtbook_core::{Table, TableStore, WriteMode};
use courtbook_shared::{ActivityEntry, EmailKind, EmailRequest, Masked};
use serde::Serialize;
use serde_json::{json, Map};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct WaitlistRequest {
    pub name: String,
    pub email: String,
    pub slot: SlotRef,
    /// Falls back to the slot's own session type
    pub session_type: Option<String>,
    pub block_dates: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistPlacement {
    /// 1-based, in join order among entries for the same slot
    pub position: usize,
    /// Date the entry is stored under
    pub date: String,
    #[serde(skip)]
    pub bridge: Option<BridgeOutcome>,
}

impl BookingManager {
    pub fn join_waitlist(&self, request: WaitlistRequest) -> BookingResult<WaitlistPlacement> {
        validate_email(&request.email)?;
        let name = request.name.trim();
        if name.is_empty() {
            return Err(BookingError::Validation("Name is required".into()));
        }

        let target = self.resolve_target(&request.slot, &request.block_dates)?;
        let storage_date = if target.is_block() { target.dates[0].clone() } else { target.slot_ref.date.clone() };
        let session_type = request
            .session_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or(target.slot.session_type.as_deref())
            .unwrap_or("unknown")
            .to_string();

        let entry = WaitlistEntry {
            time: target.slot.time.clone(),
            title: target.slot.title.clone(),
            session_type,
            name: name.to_string(),
            email: request.email.trim().to_string(),
            block_id: target.block_id.clone(),
            block_dates: if target.is_block() { target.dates.clone() } else { Vec::new() },
            is_block: target.is_block(),
            joined_at: Utc::now(),
            extra: Map::new(),
        };

        let position = update_waitlist(self.store(), |waitlist| {
            let day = waitlist.entry(storage_date.clone()).or_default();
            if day.iter().any(|existing| existing.dedupe_key() == entry.dedupe_key()) {
                return Err(BookingError::AlreadyProcessed("Already on waitlist".into()));
            }
            day.push(entry.clone());
            Ok(day.iter().filter(|e| e.same_slot_as(&entry)).count())
        })?;

        let derived = self.refresh_derived_state(Some(&target.slot_ref))?;
        info!("{} joined the waitlist for {} at position {}", Masked(&entry.email), target.slot_ref, position);

        self.notify(
            EmailRequest::new(EmailKind::WaitlistConfirmation, &entry.email, &entry.name)
                .field("date", storage_date.as_str())
                .field("time", entry.time.as_str())
                .field("title", entry.title.as_str())
                .field("position", position)
                .field("isBlock", entry.is_block)
                .field("blockDates", json!(entry.block_dates)),
        );
        self.record(
            ActivityEntry::new("waitlist", "Joined waitlist", &entry.title, format!("{} is #{} on the waitlist", entry.name, position))
                .with_player(&entry.name, &entry.email)
                .with_session(&storage_date, &entry.time, &entry.title)
                .with_meta(json!({ "position": position, "isBlock": entry.is_block })),
        );

        Ok(WaitlistPlacement { position, date: storage_date, bridge: derived.bridge })
    }

    /// Remove `email` from the slot's waitlist. Returns the number of entries
    /// removed, legacy duplicates included.
    pub fn leave_waitlist(&self, email: &str, slot: &SlotRef) -> BookingResult<usize> {
        let email = email.trim();
        if email.is_empty() {
            return Err(BookingError::Validation("Email is required".into()));
        }

        // A slot that no longer exists can still have stale entries.
        let (slot_ref, dates) = match self.resolve_target(slot, &[]) {
            Ok(target) => (target.slot_ref, target.dates),
            Err(BookingError::NotFound(_)) => (slot.clone(), vec![slot.date.clone()]),
            Err(e) => return Err(e),
        };

        let removed = update_waitlist(self.store(), |waitlist| {
            Ok(remove_entries(waitlist, &dates, |e| {
                e.has_email(email) && waitlist_entry_for(e, &slot_ref)
            }))
        })?;

        if removed.is_empty() {
            return Err(BookingError::NotFound(format!("{} is not on the waitlist for {}", Masked(email), slot_ref)));
        }

        self.refresh_derived_state(Some(&slot_ref))?;
        info!("Removed {} waitlist entr(ies) for {} from {}", removed.len(), Masked(email), slot_ref);

        let name = removed[0].name.clone();
        self.record(
            ActivityEntry::new("waitlist", "Left waitlist", &slot_ref.title, format!("{} left the waitlist", name))
                .with_player(&name, email)
                .with_session(&slot_ref.date, &slot_ref.time, &slot_ref.title),
        );
        Ok(removed.len())
    }
}

/// Does this entry wait for the referenced slot?
pub(crate) fn waitlist_entry_for(entry: &WaitlistEntry, slot: &SlotRef) -> bool {
    let block_ok = match slot.block_id.as_deref() {
        Some(id) => entry.block_key() == Some(id) || entry.block_key().is_none(),
        None => true,
    };
    block_ok && entry.matches_slot(&slot.time, &slot.title)
}

/// Remove every entry on `dates` accepted by `predicate`
pub(crate) fn remove_entries<P>(waitlist: &mut WaitlistTable, dates: &[String], predicate: P) -> Vec<WaitlistEntry>
where
    P: Fn(&WaitlistEntry) -> bool,
{
    let mut removed = Vec::new();
    for date in dates {
        let Some(day) = waitlist.get_mut(date) else { continue };
        let (gone, kept): (Vec<_>, Vec<_>) = day.drain(..).partition(|e| predicate(e));
        *day = kept;
        removed.extend(gone);
        if day.is_empty() {
            waitlist.remove(date);
        }
    }
    removed
}

/// Read-modify-write of `waitlist.json` with normalization applied before
/// and after the change.
pub(crate) fn update_waitlist<R, F>(store: &dyn TableStore, f: F) -> BookingResult<R>
where
    F: FnOnce(&mut WaitlistTable) -> BookingResult<R>,
{
    tables::update(store, Table::Waitlist, WriteMode::Replace, |waitlist: &mut WaitlistTable| {
        normalize(waitlist);
        let out = f(waitlist)?;
        normalize(waitlist);
        Ok(out)
    })
}

/// Move block entries to the block's first date, then drop duplicates of
/// `(email, time, title, blockId)` within a date, keeping the earliest.
pub(crate) fn normalize(waitlist: &mut WaitlistTable) -> usize {
    let mut changed = 0;

    let mut moved: Vec<(String, WaitlistEntry)> = Vec::new();
    for (date, day) in waitlist.iter_mut() {
        let (stay, go): (Vec<_>, Vec<_>) = day.drain(..).partition(|e| {
            !e.is_block || e.block_dates.first().map_or(true, |first| first == date)
        });
        *day = stay;
        for entry in go {
            if let Some(first) = entry.block_dates.first() {
                moved.push((first.clone(), entry));
            }
        }
    }
    for (first, entry) in moved {
        debug!("Moving block waitlist entry for {} to {}", Masked(&entry.email), first);
        waitlist.entry(first).or_default().push(entry);
        changed += 1;
    }

    for day in waitlist.values_mut() {
        day.sort_by_key(|e| e.joined_at);
        let mut seen = HashSet::new();
        let before = day.len();
        day.retain(|e| seen.insert(e.dedupe_key()));
        changed += before - day.len();
    }
    waitlist.retain(|_, day| !day.is_empty());

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, slot_json, D1, D2};
    use chrono::Duration;

    fn request(email: &str, slot: SlotRef) -> WaitlistRequest {
        WaitlistRequest { name: "Alice".into(), email: email.into(), slot, session_type: None, block_dates: vec![] }
    }

    fn entry(email: &str, minutes_ago: i64) -> WaitlistEntry {
        WaitlistEntry {
            time: "19:00".into(),
            title: "League".into(),
            session_type: "league".into(),
            name: "P".into(),
            email: email.into(),
            block_id: Some("blk".into()),
            block_dates: vec![D1.into(), D2.into()],
            is_block: true,
            joined_at: Utc::now() - Duration::minutes(minutes_ago),
            extra: Map::new(),
        }
    }

    #[test]
    fn test_join_assigns_positions_and_dedupes() {
        let mut slot = slot_json("18:00", "Open Run", 0);
        slot["sessionType"] = json!("open");
        let (manager, store, mut rx) = fixture(json!({ D1: [slot, slot_json("20:00", "Open Run", 0)] }));
        let target = SlotRef::new(D1, "18:00", "Open Run");

        let first = manager.join_waitlist(request("alice@x.io", target.clone())).unwrap();
        assert_eq!(first.position, 1);
        assert_eq!(first.date, D1);

        // Another slot on the same date does not count toward the position.
        manager.join_waitlist(request("zed@x.io", SlotRef::new(D1, "20:00", "Open Run"))).unwrap();
        let second = manager.join_waitlist(request("bob@x.io", target.clone())).unwrap();
        assert_eq!(second.position, 2);

        let again = manager.join_waitlist(request("ALICE@x.io", target));
        assert!(matches!(again, Err(BookingError::AlreadyProcessed(msg)) if msg == "Already on waitlist"));

        let waitlist: WaitlistTable = tables::load(store.as_ref(), Table::Waitlist).unwrap();
        assert_eq!(waitlist[D1].len(), 3);
        assert_eq!(waitlist[D1][0].session_type, "open");
        assert_eq!(waitlist[D1][1].session_type, "unknown");

        let emails = rx.drain_emails();
        assert_eq!(emails.len(), 3);
        assert!(emails.iter().all(|e| e.kind == EmailKind::WaitlistConfirmation));
        assert_eq!(emails[2].fields["position"], 2);
    }

    #[test]
    fn test_join_bridges_slot_with_free_seats() {
        let (manager, store, _rx) = fixture(json!({ D1: [slot_json("18:00", "Open Run", 2)] }));
        let placement = manager.join_waitlist(request("alice@x.io", SlotRef::new(D1, "18:00", "Open Run"))).unwrap();
        // Free seats plus a waiting player bridges the slot.
        assert!(placement.bridge.is_some_and(|b| b.bridged));
        assert_eq!(store.read(Table::AvailableSlots).unwrap()[D1][0]["bridgeState"], true);
    }

    #[test]
    fn test_block_entry_lives_under_first_date() {
        let block = json!({"time": "19:00", "title": "League", "numberOfSpots": 4, "blockId": "blk", "blockDates": [D1, D2]});
        let (manager, store, _rx) = fixture(json!({ D1: [block.clone()], D2: [block] }));

        let placement = manager.join_waitlist(request("alice@x.io", SlotRef::new(D2, "19:00", "League"))).unwrap();
        assert_eq!(placement.date, D1);

        let waitlist: WaitlistTable = tables::load(store.as_ref(), Table::Waitlist).unwrap();
        assert!(waitlist.get(D2).is_none());
        assert!(waitlist[D1][0].is_block);
        assert_eq!(waitlist[D1][0].block_dates, vec![D1.to_string(), D2.to_string()]);

        let slots = store.read(Table::AvailableSlots).unwrap();
        assert_eq!(slots[D1][0]["bridgeState"], true);
        assert_eq!(slots[D2][0]["bridgeState"], true);
    }

    #[test]
    fn test_leave_waitlist() {
        let (manager, store, _rx) = fixture(json!({ D1: [slot_json("18:00", "Open Run", 2)] }));
        let target = SlotRef::new(D1, "18:00", "Open Run");
        manager.join_waitlist(request("alice@x.io", target.clone())).unwrap();

        assert_eq!(manager.leave_waitlist("Alice@X.io", &target).unwrap(), 1);
        assert!(matches!(manager.leave_waitlist("alice@x.io", &target), Err(BookingError::NotFound(_))));
        assert_eq!(store.read(Table::Waitlist).unwrap(), json!({}));
        assert_eq!(store.read(Table::AvailableSlots).unwrap()[D1][0]["bridgeState"], false);
    }

    #[test]
    fn test_normalize_moves_and_dedupes() {
        let mut waitlist = WaitlistTable::new();
        waitlist.insert(D2.into(), vec![entry("a@x.io", 10)]);
        waitlist.insert(D1.into(), vec![entry("A@x.io", 5), entry("b@x.io", 1)]);

        assert_eq!(normalize(&mut waitlist), 2);
        assert!(waitlist.get(D2).is_none());
        let day = &waitlist[D1];
        assert_eq!(day.len(), 2);
        // Earliest join wins.
        assert_eq!(day[0].email, "a@x.io");
        assert_eq!(day[1].email, "b@x.io");

        assert_eq!(normalize(&mut waitlist), 0);
    }
}
