use async_trait::async_trait;
use courtbook_core::{ActivityLogger, NotificationError, StoreError, Table, TableStore, WriteMode};
use courtbook_shared::ActivityEntry;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Appends activity entries to `activityLog.json` (a JSON array).
#[derive(Clone)]
pub struct JsonActivityLog {
    store: Arc<dyn TableStore>,
}

impl JsonActivityLog {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    fn append(store: &dyn TableStore, entry: &ActivityEntry) -> Result<(), StoreError> {
        let table = Table::ActivityLog;
        let encoded = serde_json::to_value(entry).map_err(|source| StoreError::Encode { table, source })?;

        let mut guard = store.lock(table)?;
        let mut entries = match guard.read()? {
            Value::Array(entries) => entries,
            // A missing log reads as `{}`.
            _ => Vec::new(),
        };
        entries.push(encoded);
        guard.write(&Value::Array(entries), WriteMode::Replace)
    }
}

#[async_trait]
impl ActivityLogger for JsonActivityLog {
    async fn log(&self, entry: ActivityEntry) -> Result<(), NotificationError> {
        if entry.action.trim().is_empty() || entry.title.trim().is_empty() {
            return Err(NotificationError::Activity("Missing required fields: action, title".to_string()));
        }

        let store = Arc::clone(&self.store);
        let action = entry.action.clone();
        tokio::task::spawn_blocking(move || Self::append(store.as_ref(), &entry))
            .await
            .map_err(|e| NotificationError::Activity(e.to_string()))?
            .map_err(|e| NotificationError::Activity(e.to_string()))?;

        debug!("Logged activity: {}", action);
        Ok(())
    }
}
