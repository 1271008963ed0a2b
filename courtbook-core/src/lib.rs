pub mod codec;
pub mod notify;
pub mod repository;

pub use codec::{validate_slot_identity, BookingEntry, CodecError};
pub use notify::{
    ActivityLogger, EmailSender, NotificationError, Outbound, Outbox, OutboxReceiver, RecordingEmailSender,
};
pub use repository::{StoreError, StoreResult, Table, TableGuard, TableStore, WriteMode};
