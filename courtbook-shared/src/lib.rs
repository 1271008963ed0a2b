pub mod models;
pub mod pii;

pub use models::events::{ActivityEntry, EmailKind, EmailRequest};
pub use pii::Masked;
