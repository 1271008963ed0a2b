use courtbook_core::{StoreError, StoreResult, Table, TableGuard, TableStore, WriteMode};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// In-process table store with one mutex per table. Used by tests and by
/// tooling that works on a scratch copy of the data.
#[derive(Debug)]
pub struct MemoryTableStore {
    tables: HashMap<Table, Mutex<Value>>,
    backups: Mutex<Vec<(Table, Value)>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        let tables = Table::ALL
            .iter()
            .map(|table| (*table, Mutex::new(Value::Object(Map::new()))))
            .collect();
        Self { tables, backups: Mutex::new(Vec::new()) }
    }

    /// Seed a table, e.g. with a fixture
    pub fn with_table(self, table: Table, value: Value) -> Self {
        if let Some(slot) = self.tables.get(&table) {
            match slot.lock() {
                Ok(mut current) => *current = value,
                Err(poisoned) => *poisoned.into_inner() = value,
            }
        }
        self
    }

    /// Snapshots taken by `WriteMode::Backup` writes, oldest first
    pub fn backups(&self, table: Table) -> Vec<Value> {
        match self.backups.lock() {
            Ok(backups) => backups.iter().filter(|(t, _)| *t == table).map(|(_, v)| v.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn slot(&self, table: Table) -> StoreResult<MutexGuard<'_, Value>> {
        self.tables
            .get(&table)
            .ok_or(StoreError::Poisoned(table))?
            .lock()
            .map_err(|_| StoreError::Poisoned(table))
    }
}

impl Default for MemoryTableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStore for MemoryTableStore {
    fn read(&self, table: Table) -> StoreResult<Value> {
        Ok(self.slot(table)?.clone())
    }

    fn lock(&self, table: Table) -> StoreResult<Box<dyn TableGuard + '_>> {
        let value = self.slot(table)?;
        Ok(Box::new(MemoryGuard { table, value, backups: &self.backups }))
    }
}

struct MemoryGuard<'a> {
    table: Table,
    value: MutexGuard<'a, Value>,
    backups: &'a Mutex<Vec<(Table, Value)>>,
}

impl TableGuard for MemoryGuard<'_> {
    fn table(&self) -> Table {
        self.table
    }

    fn read(&self) -> StoreResult<Value> {
        Ok(self.value.clone())
    }

    fn write(&mut self, value: &Value, mode: WriteMode) -> StoreResult<()> {
        if mode == WriteMode::Backup {
            let mut backups = self.backups.lock().map_err(|_| StoreError::Poisoned(self.table))?;
            backups.push((self.table, self.value.clone()));
        }
        *self.value = value.clone();
        Ok(())
    }
}
