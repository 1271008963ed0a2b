//! Typed access to the JSON tables.
//!
//! `update` holds exactly one table lock for the whole read-modify-write and
//! only writes when the closure succeeds and actually changed something.

use crate::error::BookingResult;
use courtbook_core::{StoreError, Table, TableStore, WriteMode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub fn load<T>(store: &dyn TableStore, table: Table) -> BookingResult<T>
where
    T: DeserializeOwned + Default,
{
    Ok(decode(table, store.read(table)?)?)
}

pub fn update<T, R, F>(store: &dyn TableStore, table: Table, mode: WriteMode, f: F) -> BookingResult<R>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(&mut T) -> BookingResult<R>,
{
    let mut guard = store.lock(table)?;
    let before = guard.read()?;
    let mut data: T = decode(table, before.clone())?;

    let out = f(&mut data)?;

    let after = serde_json::to_value(&data).map_err(|source| StoreError::Encode { table, source })?;
    if after != before {
        guard.write(&after, mode)?;
    }
    Ok(out)
}

fn decode<T>(table: Table, value: Value) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    match value {
        Value::Null => Ok(T::default()),
        // Older writers stored empty tables as `[]`.
        Value::Array(items) if items.is_empty() => Ok(T::default()),
        other => serde_json::from_value(other).map_err(|source| StoreError::Corrupt { table, source }),
    }
}
