//! Seat, booking and booking-seat stores plus the unit of work that scopes them.
//!
//! Every mutation of seat or booking rows happens through a [`UnitOfWork`] handed
//! out by a [`TransactionCoordinator`]. `get_for_update` is a database row lock
//! held until that unit of work commits or rolls back; it is the only primitive
//! that serializes competing requests, across processes as well as tasks.

pub mod postgres;

#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, warn};

use crate::error::{EngineError, EngineResult, StoreResult};
use crate::models::{Booking, BookingSeat, NewBooking, NewSeat, Seat, SeatQuery, SeatStatus};

#[async_trait]
pub trait SeatStore: Send {
    /// Locks the seat row until the enclosing unit of work ends.
    async fn get_for_update(&mut self, seat_id: i64) -> StoreResult<Option<Seat>>;

    async fn get_by_ids(&mut self, seat_ids: &[i64]) -> StoreResult<Vec<Seat>>;

    async fn get_by_event(&mut self, event_id: i64, query: &SeatQuery) -> StoreResult<Vec<Seat>>;

    /// Writes the status and bumps `version`.
    async fn set_status(&mut self, seat_id: i64, status: SeatStatus) -> StoreResult<()>;

    async fn bulk_import(&mut self, event_id: i64, seats: &[NewSeat]) -> StoreResult<u64>;

    /// Returns every held seat to FREE.
    async fn bulk_reset(&mut self) -> StoreResult<u64>;
}

#[async_trait]
pub trait BookingStore: Send {
    async fn create(&mut self, booking: NewBooking) -> StoreResult<Booking>;

    async fn get_for_update(&mut self, booking_id: i64) -> StoreResult<Option<Booking>>;

    async fn get(&mut self, booking_id: i64) -> StoreResult<Option<Booking>>;

    async fn get_by_owner(&mut self, user_id: i32) -> StoreResult<Vec<Booking>>;

    async fn get_by_order_reference(&mut self, reference: &str) -> StoreResult<Option<Booking>>;

    async fn get_by_payment_reference(&mut self, reference: &str) -> StoreResult<Option<Booking>>;

    /// Rewrites status, amount and references in full and refreshes `updated_at`.
    async fn update(&mut self, booking: &mut Booking) -> StoreResult<()>;

    async fn delete_all(&mut self) -> StoreResult<u64>;
}

#[async_trait]
pub trait BookingSeatStore: Send {
    async fn create(&mut self, booking_id: i64, seat_id: i64) -> StoreResult<BookingSeat>;

    async fn get_by_seat(&mut self, seat_id: i64) -> StoreResult<Vec<BookingSeat>>;

    async fn get_by_booking(&mut self, booking_id: i64) -> StoreResult<Vec<BookingSeat>>;

    /// One round trip for a whole page of bookings.
    async fn get_by_bookings(&mut self, booking_ids: &[i64]) -> StoreResult<Vec<BookingSeat>>;

    async fn delete(&mut self, booking_seat_id: i64) -> StoreResult<()>;

    async fn delete_all(&mut self) -> StoreResult<u64>;
}

/// One open database transaction and the store handles bound to it.
///
/// Dropping a unit of work without committing rolls it back, so a panic or a
/// cancelled future never leaves partial effects behind.
#[async_trait]
pub trait UnitOfWork: SeatStore + BookingStore + BookingSeatStore + Sized {
    fn seats(&mut self) -> &mut dyn SeatStore {
        self
    }

    fn bookings(&mut self) -> &mut dyn BookingStore {
        self
    }

    fn booking_seats(&mut self) -> &mut dyn BookingSeatStore {
        self
    }

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

#[async_trait]
pub trait TransactionCoordinator: Send + Sync + 'static {
    type Tx: UnitOfWork + 'static;

    async fn begin(&self) -> StoreResult<Self::Tx>;
}

/// Runs `work` inside a single unit of work.
///
/// Commits when `work` succeeds and rolls back on any error. The deadline covers
/// opening the transaction and every lock wait inside `work`; once it passes the
/// work future is dropped, which rolls the transaction back. Calls must not nest.
pub async fn with_transaction<C, T, F>(coordinator: &C, deadline: Duration, work: F) -> EngineResult<T>
where
    C: TransactionCoordinator,
    T: Send,
    F: for<'t> FnOnce(&'t mut C::Tx) -> BoxFuture<'t, EngineResult<T>> + Send,
{
    let expires = Instant::now() + deadline;

    let mut tx = match timeout_at(expires, coordinator.begin()).await {
        Ok(tx) => tx?,
        Err(_) => return Err(deadline_exceeded(deadline)),
    };

    let outcome = timeout_at(expires, work(&mut tx)).await;

    match outcome {
        Ok(Ok(value)) => {
            tx.commit().await.map_err(|e| {
                error!("commit failed: {}", e);
                EngineError::TransactionFailure(format!("commit failed: {}", e))
            })?;
            Ok(value)
        }
        Ok(Err(err)) => {
            debug!("rolling back: {}", err);
            if let Err(rollback_err) = tx.rollback().await {
                warn!("rollback failed after '{}': {}", err, rollback_err);
            }
            Err(err)
        }
        Err(_) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("rollback after deadline failed: {}", rollback_err);
            }
            Err(deadline_exceeded(deadline))
        }
    }
}

fn deadline_exceeded(deadline: Duration) -> EngineError {
    warn!("operation exceeded its {:?} deadline", deadline);
    EngineError::TransactionFailure(format!("deadline of {}ms exceeded", deadline.as_millis()))
}
