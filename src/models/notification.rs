//! Lifecycle notifications published after commit.
//!
//! Consumers must treat delivery as at-least-once and deduplicate on `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: Uuid,
    /// Booking id, also used as the partition key.
    pub aggregate_id: String,
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: LifecyclePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LifecyclePayload {
    #[serde(rename = "booking.created")]
    BookingCreated { booking_id: i64, event_id: i64, user_id: i32, total_amount: i64 },
    #[serde(rename = "seat.selected")]
    SeatSelected { booking_id: i64, seat_id: i64, user_id: i32 },
    #[serde(rename = "seat.released")]
    SeatReleased { booking_id: i64, seat_id: i64, user_id: i32 },
    #[serde(rename = "booking.cancelled")]
    BookingCancelled { booking_id: i64, user_id: i32, reason: String },
    #[serde(rename = "payment.initiated")]
    PaymentInitiated { booking_id: i64, user_id: i32, total_amount: i64 },
    /// The gateway refused to open a payment; the booking is PENDING again.
    #[serde(rename = "payment.failed")]
    PaymentFailed { booking_id: i64, user_id: i32, reason: String },
    #[serde(rename = "booking.confirmed")]
    BookingConfirmed { booking_id: i64, user_id: i32, total_amount: i64 },
}

impl LifecyclePayload {
    pub fn booking_id(&self) -> i64 {
        match self {
            LifecyclePayload::BookingCreated { booking_id, .. }
            | LifecyclePayload::SeatSelected { booking_id, .. }
            | LifecyclePayload::SeatReleased { booking_id, .. }
            | LifecyclePayload::BookingCancelled { booking_id, .. }
            | LifecyclePayload::PaymentInitiated { booking_id, .. }
            | LifecyclePayload::PaymentFailed { booking_id, .. }
            | LifecyclePayload::BookingConfirmed { booking_id, .. } => *booking_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LifecyclePayload::BookingCreated { .. } => "booking.created",
            LifecyclePayload::SeatSelected { .. } => "seat.selected",
            LifecyclePayload::SeatReleased { .. } => "seat.released",
            LifecyclePayload::BookingCancelled { .. } => "booking.cancelled",
            LifecyclePayload::PaymentInitiated { .. } => "payment.initiated",
            LifecyclePayload::PaymentFailed { .. } => "payment.failed",
            LifecyclePayload::BookingConfirmed { .. } => "booking.confirmed",
        }
    }
}

impl LifecycleEvent {
    pub fn new(payload: LifecyclePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id: payload.booking_id().to_string(),
            version: 1,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_type_and_data_side_by_side() {
        let event = LifecycleEvent::new(LifecyclePayload::SeatSelected { booking_id: 12, seat_id: 40, user_id: 3 });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "seat.selected");
        assert_eq!(json["aggregate_id"], "12");
        assert_eq!(json["version"], 1);
        assert_eq!(json["data"]["seat_id"], 40);
    }
}
