pub mod bridge;
pub mod error;
pub mod manager;
pub mod models;
pub mod offers;
pub mod reconciler;
pub mod sessions;
pub mod settings;
pub mod tables;
pub mod waitlist;

#[cfg(test)]
mod testing;

pub use bridge::BridgeOutcome;
pub use error::{BookingError, BookingResult};
pub use manager::{
    BookingLookup, BookingManager, BookingReceipt, BookingRequest, CancelTarget, CancellationReceipt, ExpirySweep,
};
pub use models::{BookingMapping, MappingStatus, Offer, OfferStatus, Slot, SlotRef, WaitlistEntry};
pub use offers::{IssuedOffer, OfferAcceptance, OfferCleanup, OfferRequest};
pub use reconciler::ReconcileReport;
pub use sessions::{SessionCancellation, SessionEdit, SessionEditReport};
pub use settings::{ExpiryOverrides, MAX_EXPIRY_SECONDS};
pub use waitlist::{WaitlistPlacement, WaitlistRequest};
