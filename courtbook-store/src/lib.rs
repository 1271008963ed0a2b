pub mod activity_log;
pub mod app_config;
pub mod json_store;
pub mod mailer;
pub mod memory_store;

pub use activity_log::JsonActivityLog;
pub use json_store::FileTableStore;
pub use mailer::{HttpEmailSender, LogEmailSender};
pub use memory_store::MemoryTableStore;
