use anyhow::{bail, Context};
use courtbook_booking::BookingManager;
use courtbook_core::{ActivityLogger, EmailSender, Outbox, OutboxReceiver, TableStore};
use courtbook_store::app_config::{Config, EmailMode};
use courtbook_store::{FileTableStore, HttpEmailSender, JsonActivityLog, LogEmailSender};
use std::sync::Arc;
use std::time::Duration;

/// Everything the worker needs, wired from configuration
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TableStore>,
    pub manager: Arc<BookingManager>,
    pub email: Arc<dyn EmailSender>,
    pub activity: Arc<dyn ActivityLogger>,
    pub config: Config,
}

impl AppState {
    /// Build the state plus the receiving end of the manager's outbox
    pub fn from_config(config: Config) -> anyhow::Result<(Self, OutboxReceiver)> {
        let store = FileTableStore::open(&config.storage.data_dir)
            .with_context(|| format!("Failed to open data dir {}", config.storage.data_dir))?
            .with_lock_timeout(Duration::from_millis(config.storage.lock_timeout_ms))
            .with_backups(config.storage.backups);
        let store: Arc<dyn TableStore> = Arc::new(store);

        let email: Arc<dyn EmailSender> = match (config.email.mode, config.email.endpoint.as_deref()) {
            (EmailMode::Log, _) => Arc::new(LogEmailSender),
            (EmailMode::Http, Some(endpoint)) if !endpoint.trim().is_empty() => Arc::new(
                HttpEmailSender::new(endpoint, Duration::from_secs(config.email.timeout_seconds))
                    .context("Failed to build HTTP mail client")?,
            ),
            (EmailMode::Http, _) => bail!("email.mode = \"http\" requires email.endpoint"),
        };
        let activity: Arc<dyn ActivityLogger> = Arc::new(JsonActivityLog::new(store.clone()));

        let (outbox, rx) = Outbox::channel();
        let manager = Arc::new(BookingManager::new(store.clone(), outbox, config.booking_rules.clone()));

        Ok((Self { store, manager, email, activity, config }, rx))
    }

    pub fn email_timeout(&self) -> Duration {
        Duration::from_secs(self.config.email.timeout_seconds)
    }
}
