pub mod user;
pub mod event;
pub mod seat;
pub mod booking;
pub mod notification;

pub use booking::{Booking, BookingSeat, BookingStatus, BookingView, NewBooking};
pub use event::Event;
pub use notification::{LifecycleEvent, LifecyclePayload};
pub use seat::{NewSeat, Seat, SeatQuery, SeatStatus};
pub use user::User;

/// Raised when a stored status string is outside the known vocabulary.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} status '{value}'")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}
