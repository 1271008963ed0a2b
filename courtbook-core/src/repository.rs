use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

/// Every flat JSON document the booking core persists. Each one is its own
/// lock domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    AvailableSlots,
    Bookings,
    BookingMappings,
    Waitlist,
    Offers,
    Cancellations,
    ActivityLog,
    Settings,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::AvailableSlots,
        Table::Bookings,
        Table::BookingMappings,
        Table::Waitlist,
        Table::Offers,
        Table::Cancellations,
        Table::ActivityLog,
        Table::Settings,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Table::AvailableSlots => "availableSlots.json",
            Table::Bookings => "bookings.json",
            Table::BookingMappings => "bookingMappings.json",
            Table::Waitlist => "waitlist.json",
            Table::Offers => "offers.json",
            Table::Cancellations => "cancellations.json",
            Table::ActivityLog => "activityLog.json",
            Table::Settings => "settings.json",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// How a locked write treats the previous version of the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Replace,
    /// Snapshot the current contents to a timestamped backup first
    Backup,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to lock {table}: {source}")]
    Lock {
        table: Table,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {waited_ms}ms waiting for the lock on {table}")]
    LockTimeout { table: Table, waited_ms: u64 },

    #[error("I/O error on {table}: {source}")]
    Io {
        table: Table,
        #[source]
        source: std::io::Error,
    },

    #[error("{table} does not contain valid JSON: {source}")]
    Corrupt {
        table: Table,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {table}: {source}")]
    Encode {
        table: Table,
        #[source]
        source: serde_json::Error,
    },

    #[error("Lock on {0} is poisoned")]
    Poisoned(Table),

    #[error("Store root {path:?} is unusable: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Exclusive hold on one table. The lock is released when the guard drops.
pub trait TableGuard {
    fn table(&self) -> Table;

    /// Current contents, read under the lock
    fn read(&self) -> StoreResult<Value>;

    /// Atomically replace the table. Readers see either the old or the new
    /// document, never a partial one.
    fn write(&mut self, value: &Value, mode: WriteMode) -> StoreResult<()>;
}

/// Storage contract for the booking tables.
///
/// Implementations must serialize writers per table and must never expose a
/// partially written document.
pub trait TableStore: Send + Sync {
    /// Lock-free snapshot. A missing table reads as an empty object.
    fn read(&self, table: Table) -> StoreResult<Value>;

    /// Acquire the table's exclusive lock
    fn lock(&self, table: Table) -> StoreResult<Box<dyn TableGuard + '_>>;

    fn write(&self, table: Table, value: &Value) -> StoreResult<()> {
        let mut guard = self.lock(table)?;
        guard.write(value, WriteMode::Replace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_file_names_are_unique() {
        let mut names: Vec<_> = Table::ALL.iter().map(|t| t.file_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Table::ALL.len());
        assert_eq!(Table::AvailableSlots.to_string(), "availableSlots.json");
    }
}
