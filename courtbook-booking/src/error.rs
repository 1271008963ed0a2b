use courtbook_core::{CodecError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    /// Missing or malformed input, rejected before any write
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate cancellation, repeat action on a settled offer, duplicate waitlist entry
    #[error("Already processed: {0}")]
    AlreadyProcessed(String),

    #[error("Expired: {0}")]
    Expired(String),

    #[error("No spots available for {title} at {time} on {date} ({booked}/{capacity} booked)")]
    CapacityExceeded {
        date: String,
        time: String,
        title: String,
        booked: usize,
        capacity: u32,
    },

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl From<CodecError> for BookingError {
    fn from(e: CodecError) -> Self {
        BookingError::Validation(e.to_string())
    }
}

pub type BookingResult<T> = Result<T, BookingError>;
