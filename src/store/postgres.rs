use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use tracing::debug;

use super::{BookingSeatStore, BookingStore, SeatStore, TransactionCoordinator, UnitOfWork};
use crate::error::StoreResult;
use crate::models::{Booking, BookingSeat, NewBooking, NewSeat, Seat, SeatQuery, SeatStatus};

const SEAT_COLUMNS: &str =
    "id, event_id, row_number, seat_number, status, price, version, created_at, updated_at";

const BOOKING_COLUMNS: &str =
    "id, event_id, user_id, status, total_amount, payment_id, order_id, created_at, updated_at";

const BOOKING_SEAT_COLUMNS: &str = "id, booking_id, seat_id, created_at";

/// Opens Postgres transactions for the engine.
#[derive(Clone)]
pub struct PgCoordinator {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PgCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, lock_timeout: None }
    }

    /// Caps every row-lock wait on the database side.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = Some(lock_timeout);
        self
    }
}

#[async_trait]
impl TransactionCoordinator for PgCoordinator {
    type Tx = PgUnitOfWork;

    async fn begin(&self) -> StoreResult<PgUnitOfWork> {
        let mut tx = self.pool.begin().await?;

        if let Some(lock_timeout) = self.lock_timeout {
            // SET does not accept bind parameters
            sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", lock_timeout.as_millis()))
                .execute(&mut *tx)
                .await?;
        }

        Ok(PgUnitOfWork { tx })
    }
}

/// Handles bound to one open Postgres transaction. Dropping it rolls back.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl SeatStore for PgUnitOfWork {
    async fn get_for_update(&mut self, seat_id: i64) -> StoreResult<Option<Seat>> {
        let seat = sqlx::query_as::<_, Seat>(&format!(
            "SELECT {SEAT_COLUMNS} FROM seats WHERE id = $1 FOR UPDATE"
        ))
        .bind(seat_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(seat)
    }

    async fn get_by_ids(&mut self, seat_ids: &[i64]) -> StoreResult<Vec<Seat>> {
        if seat_ids.is_empty() {
            return Ok(Vec::new());
        }

        let seats = sqlx::query_as::<_, Seat>(&format!(
            "SELECT {SEAT_COLUMNS} FROM seats WHERE id = ANY($1) ORDER BY id"
        ))
        .bind(seat_ids)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(seats)
    }

    async fn get_by_event(&mut self, event_id: i64, query: &SeatQuery) -> StoreResult<Vec<Seat>> {
        let mut q = QueryBuilder::<Postgres>::new(format!("SELECT {SEAT_COLUMNS} FROM seats WHERE event_id = "));
        q.push_bind(event_id);
        if let Some(row) = query.row {
            q.push(" AND row_number = ").push_bind(row);
        }
        if let Some(status) = query.status {
            q.push(" AND status = ").push_bind(status.as_str());
        }
        q.push(" ORDER BY row_number, seat_number");
        if let Some(limit) = query.limit {
            q.push(" LIMIT ").push_bind(limit);
        }
        if query.offset > 0 {
            q.push(" OFFSET ").push_bind(query.offset);
        }

        let seats = q.build_query_as::<Seat>().fetch_all(&mut *self.tx).await?;
        Ok(seats)
    }

    async fn set_status(&mut self, seat_id: i64, status: SeatStatus) -> StoreResult<()> {
        sqlx::query(
            "UPDATE seats SET status = $1, version = version + 1, updated_at = NOW() WHERE id = $2",
        )
        .bind(status.as_str())
        .bind(seat_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn bulk_import(&mut self, event_id: i64, seats: &[NewSeat]) -> StoreResult<u64> {
        if seats.is_empty() {
            return Ok(0);
        }

        let rows: Vec<i32> = seats.iter().map(|s| s.row_number).collect();
        let numbers: Vec<i32> = seats.iter().map(|s| s.seat_number).collect();
        let prices: Vec<i64> = seats.iter().map(|s| s.price).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO seats (event_id, row_number, seat_number, price, status)
            SELECT $1, r, n, p, 'FREE'
            FROM UNNEST($2::INT[], $3::INT[], $4::BIGINT[]) AS t(r, n, p)
            ON CONFLICT (event_id, row_number, seat_number) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(&rows)
        .bind(&numbers)
        .bind(&prices)
        .execute(&mut *self.tx)
        .await?;

        debug!("imported {} seats for event {}", result.rows_affected(), event_id);
        Ok(result.rows_affected())
    }

    async fn bulk_reset(&mut self) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE seats SET status = 'FREE', version = version + 1, updated_at = NOW() WHERE status <> 'FREE'",
        )
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BookingStore for PgUnitOfWork {
    async fn create(&mut self, booking: NewBooking) -> StoreResult<Booking> {
        let created = sqlx::query_as::<_, Booking>(&format!(
            "INSERT INTO bookings (event_id, user_id, status, total_amount, order_id)
             VALUES ($1, $2, 'PENDING', 0, $3)
             RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(booking.event_id)
        .bind(booking.user_id)
        .bind(&booking.order_reference)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(created)
    }

    async fn get_for_update(&mut self, booking_id: i64) -> StoreResult<Option<Booking>> {
        let booking = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 FOR UPDATE"
        ))
        .bind(booking_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(booking)
    }

    async fn get(&mut self, booking_id: i64) -> StoreResult<Option<Booking>> {
        let booking = sqlx::query_as::<_, Booking>(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"))
            .bind(booking_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(booking)
    }

    async fn get_by_owner(&mut self, user_id: i32) -> StoreResult<Vec<Booking>> {
        let bookings = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE user_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(bookings)
    }

    async fn get_by_order_reference(&mut self, reference: &str) -> StoreResult<Option<Booking>> {
        let booking = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE order_id = $1"
        ))
        .bind(reference)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(booking)
    }

    async fn get_by_payment_reference(&mut self, reference: &str) -> StoreResult<Option<Booking>> {
        let booking = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE payment_id = $1"
        ))
        .bind(reference)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(booking)
    }

    async fn update(&mut self, booking: &mut Booking) -> StoreResult<()> {
        let updated_at = sqlx::query_scalar::<_, chrono::DateTime<chrono::Utc>>(
            r#"
            UPDATE bookings
            SET status = $1, total_amount = $2, payment_id = $3, order_id = $4, updated_at = NOW()
            WHERE id = $5
            RETURNING updated_at
            "#,
        )
        .bind(booking.status.as_str())
        .bind(booking.total_amount)
        .bind(&booking.payment_reference)
        .bind(&booking.order_reference)
        .bind(booking.id)
        .fetch_one(&mut *self.tx)
        .await?;

        booking.updated_at = updated_at;
        Ok(())
    }

    async fn delete_all(&mut self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM bookings").execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BookingSeatStore for PgUnitOfWork {
    async fn create(&mut self, booking_id: i64, seat_id: i64) -> StoreResult<BookingSeat> {
        let created = sqlx::query_as::<_, BookingSeat>(&format!(
            "INSERT INTO booking_seats (booking_id, seat_id) VALUES ($1, $2) RETURNING {BOOKING_SEAT_COLUMNS}"
        ))
        .bind(booking_id)
        .bind(seat_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(created)
    }

    async fn get_by_seat(&mut self, seat_id: i64) -> StoreResult<Vec<BookingSeat>> {
        let rows = sqlx::query_as::<_, BookingSeat>(&format!(
            "SELECT {BOOKING_SEAT_COLUMNS} FROM booking_seats WHERE seat_id = $1"
        ))
        .bind(seat_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn get_by_booking(&mut self, booking_id: i64) -> StoreResult<Vec<BookingSeat>> {
        let rows = sqlx::query_as::<_, BookingSeat>(&format!(
            "SELECT {BOOKING_SEAT_COLUMNS} FROM booking_seats WHERE booking_id = $1 ORDER BY seat_id"
        ))
        .bind(booking_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn get_by_bookings(&mut self, booking_ids: &[i64]) -> StoreResult<Vec<BookingSeat>> {
        if booking_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, BookingSeat>(&format!(
            "SELECT {BOOKING_SEAT_COLUMNS} FROM booking_seats WHERE booking_id = ANY($1) ORDER BY booking_id, seat_id"
        ))
        .bind(booking_ids)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn delete(&mut self, booking_seat_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM booking_seats WHERE id = $1")
            .bind(booking_seat_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_all(&mut self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM booking_seats").execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }
}
