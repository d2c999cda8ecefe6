//! Reservation engine: seat selection, booking lifecycle and payment outcomes.
//!
//! Each operation runs as one unit of work. Seats are the contended resource and
//! are always taken with a row lock before they are read or written. Operations
//! scoped to a booking lock the booking first and then its linked seats in
//! ascending id order. Selecting locks the FREE seat and then the booking; a FREE
//! seat is linked to no booking, so no booking-scoped operation can be waiting on
//! it and lock waits cannot form a cycle. Releasing locks only the seat.
//!
//! Notifications are built inside the unit of work but handed to the notifier
//! only after it commits.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::EventCatalog;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Booking, BookingStatus, BookingView, LifecycleEvent, LifecyclePayload, NewBooking, NewSeat, Seat, SeatQuery,
    SeatStatus,
};
use crate::services::notifier::LifecycleNotifier;
use crate::services::payment::{PaymentGateway, PaymentRequest};
use crate::services::users::UserLookup;
use crate::store::{with_transaction, TransactionCoordinator, UnitOfWork};


const CANCELLED_BY_USER: &str = "cancelled_by_user";
const PAYMENT_REJECTED: &str = "payment_rejected";

/// How a gateway status applies to a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Confirmed,
    Rejected,
    /// Intermediate or unknown; a later callback decides.
    Pending,
}

impl GatewayStatus {
    pub fn classify(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "CONFIRMED" | "COMPLETED" => GatewayStatus::Confirmed,
            "FAILED" | "CANCELLED" | "REJECTED" | "EXPIRED" | "REFUNDED" => GatewayStatus::Rejected,
            _ => GatewayStatus::Pending,
        }
    }
}

/// A payment notification as delivered by the gateway.
#[derive(Debug, Clone, Default)]
pub struct PaymentCallback {
    pub payment_reference: Option<String>,
    pub order_reference: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Confirmed,
    Cancelled,
    /// Nothing was written.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct ResetSummary {
    pub bookings: u64,
    pub booking_seats: u64,
    pub seats: u64,
}

pub struct ReservationEngine<C: TransactionCoordinator> {
    coordinator: C,
    catalog: Arc<dyn EventCatalog>,
    users: Arc<dyn UserLookup>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: LifecycleNotifier,
    deadline: Duration,
    currency: String,
}

impl<C: TransactionCoordinator> ReservationEngine<C> {
    pub fn new(
        coordinator: C,
        catalog: Arc<dyn EventCatalog>,
        users: Arc<dyn UserLookup>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: LifecycleNotifier,
        config: &EngineConfig,
    ) -> Self {
        Self {
            coordinator,
            catalog,
            users,
            gateway,
            notifier,
            deadline: Duration::from_millis(config.operation_deadline_ms),
            currency: config.currency.clone(),
        }
    }

    pub async fn create_booking(&self, event_id: i64, owner: i32) -> EngineResult<Booking> {
        require_id("event_id", event_id)?;
        require_owner(owner)?;

        if self.catalog.get_event(event_id).await?.is_none() {
            return Err(EngineError::not_found(format!("event {}", event_id)));
        }

        let booking = with_transaction(&self.coordinator, self.deadline, move |tx| {
            Box::pin(async move {
                let booking = tx
                    .bookings()
                    .create(NewBooking { event_id, user_id: owner, order_reference: Uuid::new_v4().to_string() })
                    .await?;
                Ok::<_, EngineError>(booking)
            })
        })
        .await?;

        info!("booking {} created for user {} on event {}", booking.id, owner, event_id);
        self.notifier.notify(vec![LifecycleEvent::new(LifecyclePayload::BookingCreated {
            booking_id: booking.id,
            event_id,
            user_id: owner,
            total_amount: booking.total_amount,
        })]);
        Ok(booking)
    }

    pub async fn select_seat(&self, booking_id: i64, seat_id: i64, owner: i32) -> EngineResult<()> {
        require_id("booking_id", booking_id)?;
        require_id("seat_id", seat_id)?;
        require_owner(owner)?;

        let events = with_transaction(&self.coordinator, self.deadline, move |tx| {
            Box::pin(select_seat_in(tx, booking_id, seat_id, owner))
        })
        .await?;

        info!("seat {} reserved for booking {}", seat_id, booking_id);
        self.notifier.notify(events);
        Ok(())
    }

    pub async fn release_seat(&self, seat_id: i64, owner: i32) -> EngineResult<()> {
        require_id("seat_id", seat_id)?;
        require_owner(owner)?;

        let events = with_transaction(&self.coordinator, self.deadline, move |tx| {
            Box::pin(release_seat_in(tx, seat_id, owner))
        })
        .await?;

        info!("seat {} released by user {}", seat_id, owner);
        self.notifier.notify(events);
        Ok(())
    }

    pub async fn cancel_booking(&self, booking_id: i64, owner: i32) -> EngineResult<()> {
        require_id("booking_id", booking_id)?;
        require_owner(owner)?;

        let events = with_transaction(&self.coordinator, self.deadline, move |tx| {
            Box::pin(async move {
                let mut booking = lock_booking(tx, booking_id).await?;
                if !booking.is_owned_by(owner) {
                    return Err(EngineError::Unauthorized(format!("booking {} belongs to another user", booking_id)));
                }
                if booking.status.is_terminal() {
                    return Err(EngineError::Conflict(format!("booking {} is already {}", booking_id, booking.status)));
                }
                cancel_locked(tx, &mut booking, CANCELLED_BY_USER).await
            })
        })
        .await?;

        info!("booking {} cancelled by user {}", booking_id, owner);
        self.notifier.notify(events);
        Ok(())
    }

    /// Freezes the booking's seat set, prices it and opens a payment on the gateway.
    /// Returns the URL the buyer should be redirected to.
    pub async fn initiate_payment(&self, booking_id: i64, owner: i32) -> EngineResult<String> {
        require_id("booking_id", booking_id)?;
        require_owner(owner)?;

        let (booking, events) = with_transaction(&self.coordinator, self.deadline, move |tx| {
            Box::pin(begin_payment_in(tx, booking_id, owner))
        })
        .await?;
        self.notifier.notify(events);

        let email = match self.users.get_user(owner).await {
            Ok(user) => user.map(|u| u.email),
            Err(e) => {
                warn!("user lookup for {} failed, paying without e-mail: {}", owner, e);
                None
            }
        };

        let request = PaymentRequest {
            order_reference: booking.order_reference.clone().unwrap_or_else(|| booking.id.to_string()),
            amount: booking.total_amount,
            currency: self.currency.clone(),
            description: format!("Booking {}", booking.id),
            email,
        };

        match self.gateway.create_payment(request).await {
            Ok(session) => {
                let reference = session.payment_reference.clone();
                with_transaction(&self.coordinator, self.deadline, move |tx| {
                    Box::pin(attach_payment_in(tx, booking_id, reference))
                })
                .await?;

                info!(
                    "payment {} opened for booking {} ({} {})",
                    session.payment_reference, booking_id, booking.total_amount, self.currency
                );
                Ok(session.redirect_url)
            }
            Err(e) => {
                warn!("payment for booking {} could not be opened: {}", booking_id, e);
                let reason = e.to_string();
                let reverted = with_transaction(&self.coordinator, self.deadline, move |tx| {
                    Box::pin(revert_payment_in(tx, booking_id, reason))
                })
                .await;
                match reverted {
                    Ok(events) => self.notifier.notify(events),
                    Err(revert_err) => warn!("booking {} left in PAYMENT_PENDING: {}", booking_id, revert_err),
                }
                Err(EngineError::PaymentGateway(e.to_string()))
            }
        }
    }

    /// Applies a gateway notification. Repeating a notification is harmless.
    pub async fn apply_payment_status(&self, callback: PaymentCallback) -> EngineResult<PaymentOutcome> {
        let payment_reference = non_empty(callback.payment_reference);
        let order_reference = non_empty(callback.order_reference);
        if payment_reference.is_none() && order_reference.is_none() {
            return Err(EngineError::Validation("payment or order reference is required".to_string()));
        }

        let status = GatewayStatus::classify(&callback.status);
        let (outcome, events) = with_transaction(&self.coordinator, self.deadline, move |tx| {
            Box::pin(apply_payment_in(tx, payment_reference, order_reference, status))
        })
        .await?;

        if outcome == PaymentOutcome::Unchanged {
            info!("payment status '{}' left the booking unchanged", callback.status);
        }
        self.notifier.notify(events);
        Ok(outcome)
    }

    pub async fn list_seats(&self, event_id: i64, query: SeatQuery) -> EngineResult<Vec<Seat>> {
        require_id("event_id", event_id)?;

        with_transaction(&self.coordinator, self.deadline, move |tx| {
            Box::pin(async move { Ok::<_, EngineError>(tx.seats().get_by_event(event_id, &query).await?) })
        })
        .await
    }

    pub async fn list_bookings(&self, owner: i32) -> EngineResult<Vec<BookingView>> {
        require_owner(owner)?;

        with_transaction(&self.coordinator, self.deadline, move |tx| {
            Box::pin(async move {
                let bookings = tx.bookings().get_by_owner(owner).await?;
                let ids: Vec<i64> = bookings.iter().map(|b| b.id).collect();
                let links = tx.booking_seats().get_by_bookings(&ids).await?;

                Ok::<Vec<BookingView>, EngineError>(bookings
                    .into_iter()
                    .map(|booking| {
                        let seat_ids = links.iter().filter(|l| l.booking_id == booking.id).map(|l| l.seat_id).collect();
                        BookingView { booking, seat_ids }
                    })
                    .collect())
            })
        })
        .await
    }

    /// Catalog load. Seats already present at the same row and number are kept.
    pub async fn import_seats(&self, event_id: i64, seats: Vec<NewSeat>) -> EngineResult<u64> {
        require_id("event_id", event_id)?;
        if let Some(bad) = seats.iter().find(|s| s.row_number <= 0 || s.seat_number <= 0 || s.price < 0) {
            return Err(EngineError::Validation(format!(
                "invalid seat row {} number {} price {}",
                bad.row_number, bad.seat_number, bad.price
            )));
        }
        if self.catalog.get_event(event_id).await?.is_none() {
            return Err(EngineError::not_found(format!("event {}", event_id)));
        }

        let imported = with_transaction(&self.coordinator, self.deadline, move |tx| {
            Box::pin(async move { Ok::<_, EngineError>(tx.seats().bulk_import(event_id, &seats).await?) })
        })
        .await?;

        info!("imported {} seats for event {}", imported, event_id);
        Ok(imported)
    }

    /// Deletes every booking and returns every seat to FREE.
    pub async fn reset(&self) -> EngineResult<ResetSummary> {
        let summary = with_transaction(&self.coordinator, self.deadline, |tx| {
            Box::pin(async move {
                let booking_seats = tx.booking_seats().delete_all().await?;
                let bookings = tx.bookings().delete_all().await?;
                let seats = tx.seats().bulk_reset().await?;
                Ok::<_, EngineError>(ResetSummary { bookings, booking_seats, seats })
            })
        })
        .await?;

        warn!(
            "reset: {} bookings, {} seat holds removed, {} seats freed",
            summary.bookings, summary.booking_seats, summary.seats
        );
        Ok(summary)
    }
}

fn require_id(name: &str, value: i64) -> EngineResult<()> {
    if value <= 0 {
        return Err(EngineError::Validation(format!("{} must be > 0", name)));
    }
    Ok(())
}

fn require_owner(owner: i32) -> EngineResult<()> {
    require_id("user_id", i64::from(owner))
}

fn non_empty(reference: Option<String>) -> Option<String> {
    reference.filter(|r| !r.trim().is_empty())
}

async fn lock_seat<T: UnitOfWork>(tx: &mut T, seat_id: i64) -> EngineResult<Seat> {
    tx.seats()
        .get_for_update(seat_id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("seat {}", seat_id)))
}

async fn lock_booking<T: UnitOfWork>(tx: &mut T, booking_id: i64) -> EngineResult<Booking> {
    tx.bookings()
        .get_for_update(booking_id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("booking {}", booking_id)))
}

fn sum_prices(booking_id: i64, seats: &[Seat]) -> EngineResult<i64> {
    seats.iter().try_fold(0i64, |total, seat| {
        total
            .checked_add(seat.price)
            .ok_or_else(|| EngineError::Validation(format!("total of booking {} overflows", booking_id)))
    })
}

async fn select_seat_in<T: UnitOfWork>(
    tx: &mut T,
    booking_id: i64,
    seat_id: i64,
    owner: i32,
) -> EngineResult<Vec<LifecycleEvent>> {
    let seat = lock_seat(tx, seat_id).await?;
    if seat.status != SeatStatus::Free {
        return Err(EngineError::SeatUnavailable { seat_id });
    }

    // a cancel holding the booking must commit before the link is written
    let booking = lock_booking(tx, booking_id).await?;
    if !booking.is_owned_by(owner) {
        return Err(EngineError::Unauthorized(format!("booking {} belongs to another user", booking_id)));
    }
    if booking.status != BookingStatus::Pending {
        return Err(EngineError::Conflict(format!("booking {} is {}", booking_id, booking.status)));
    }
    if booking.event_id != seat.event_id {
        return Err(EngineError::Validation(format!(
            "seat {} does not belong to event {}",
            seat_id, booking.event_id
        )));
    }

    tx.seats().set_status(seat_id, SeatStatus::Reserved).await?;
    tx.booking_seats().create(booking_id, seat_id).await?;

    Ok(vec![LifecycleEvent::new(LifecyclePayload::SeatSelected { booking_id, seat_id, user_id: owner })])
}

async fn release_seat_in<T: UnitOfWork>(tx: &mut T, seat_id: i64, owner: i32) -> EngineResult<Vec<LifecycleEvent>> {
    let seat = lock_seat(tx, seat_id).await?;
    if seat.status != SeatStatus::Reserved {
        return Err(EngineError::SeatUnavailable { seat_id });
    }

    let links = tx.booking_seats().get_by_seat(seat_id).await?;
    for link in &links {
        let booking = tx
            .bookings()
            .get(link.booking_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("booking {}", link.booking_id)))?;
        if !booking.is_owned_by(owner) {
            return Err(EngineError::Unauthorized(format!("seat {} is held by another user", seat_id)));
        }
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::Conflict(format!("booking {} is {}", booking.id, booking.status)));
        }
    }
    if links.is_empty() {
        warn!("seat {} was RESERVED without a holder", seat_id);
    }

    tx.seats().set_status(seat_id, SeatStatus::Free).await?;

    let mut events = Vec::with_capacity(links.len());
    for link in links {
        tx.booking_seats().delete(link.id).await?;
        events.push(LifecycleEvent::new(LifecyclePayload::SeatReleased {
            booking_id: link.booking_id,
            seat_id,
            user_id: owner,
        }));
    }
    Ok(events)
}

/// Cancels a booking whose row lock is already held and frees its seats.
async fn cancel_locked<T: UnitOfWork>(
    tx: &mut T,
    booking: &mut Booking,
    reason: &str,
) -> EngineResult<Vec<LifecycleEvent>> {
    booking.status = BookingStatus::Cancelled;
    tx.bookings().update(booking).await?;

    let links = tx.booking_seats().get_by_booking(booking.id).await?;
    let mut events = Vec::with_capacity(links.len() + 1);
    for link in links {
        // a release of the same seat may be in flight
        lock_seat(tx, link.seat_id).await?;
        tx.booking_seats().delete(link.id).await?;
        tx.seats().set_status(link.seat_id, SeatStatus::Free).await?;
        events.push(LifecycleEvent::new(LifecyclePayload::SeatReleased {
            booking_id: booking.id,
            seat_id: link.seat_id,
            user_id: booking.user_id,
        }));
    }

    events.push(LifecycleEvent::new(LifecyclePayload::BookingCancelled {
        booking_id: booking.id,
        user_id: booking.user_id,
        reason: reason.to_string(),
    }));
    Ok(events)
}

async fn begin_payment_in<T: UnitOfWork>(
    tx: &mut T,
    booking_id: i64,
    owner: i32,
) -> EngineResult<(Booking, Vec<LifecycleEvent>)> {
    let mut booking = lock_booking(tx, booking_id).await?;
    if !booking.is_owned_by(owner) {
        return Err(EngineError::Unauthorized(format!("booking {} belongs to another user", booking_id)));
    }
    if booking.status != BookingStatus::Pending {
        return Err(EngineError::Conflict(format!("booking {} is {}", booking_id, booking.status)));
    }

    let seat_ids: Vec<i64> = tx.booking_seats().get_by_booking(booking_id).await?.into_iter().map(|l| l.seat_id).collect();
    if seat_ids.is_empty() {
        return Err(EngineError::Validation(format!("booking {} has no seats", booking_id)));
    }
    let seats = tx.seats().get_by_ids(&seat_ids).await?;

    booking.total_amount = sum_prices(booking_id, &seats)?;
    booking.status = BookingStatus::PaymentPending;
    tx.bookings().update(&mut booking).await?;

    let event = LifecycleEvent::new(LifecyclePayload::PaymentInitiated {
        booking_id,
        user_id: owner,
        total_amount: booking.total_amount,
    });
    Ok((booking, vec![event]))
}

async fn attach_payment_in<T: UnitOfWork>(tx: &mut T, booking_id: i64, reference: String) -> EngineResult<()> {
    let mut booking = lock_booking(tx, booking_id).await?;
    if booking.payment_reference.is_none() && !booking.status.is_terminal() {
        booking.payment_reference = Some(reference);
        tx.bookings().update(&mut booking).await?;
    }
    Ok(())
}

async fn revert_payment_in<T: UnitOfWork>(
    tx: &mut T,
    booking_id: i64,
    reason: String,
) -> EngineResult<Vec<LifecycleEvent>> {
    let mut booking = lock_booking(tx, booking_id).await?;
    if booking.status != BookingStatus::PaymentPending || booking.payment_reference.is_some() {
        return Ok(Vec::new());
    }

    booking.status = BookingStatus::Pending;
    tx.bookings().update(&mut booking).await?;
    Ok(vec![LifecycleEvent::new(LifecyclePayload::PaymentFailed {
        booking_id,
        user_id: booking.user_id,
        reason,
    })])
}

async fn apply_payment_in<T: UnitOfWork>(
    tx: &mut T,
    payment_reference: Option<String>,
    order_reference: Option<String>,
    status: GatewayStatus,
) -> EngineResult<(PaymentOutcome, Vec<LifecycleEvent>)> {
    let mut found = None;
    if let Some(reference) = &payment_reference {
        found = tx.bookings().get_by_payment_reference(reference).await?;
    }
    if found.is_none() {
        if let Some(reference) = &order_reference {
            found = tx.bookings().get_by_order_reference(reference).await?;
        }
    }
    let Some(found) = found else {
        return Err(EngineError::not_found(format!(
            "booking for payment {:?} / order {:?}",
            payment_reference, order_reference
        )));
    };

    if status == GatewayStatus::Pending {
        return Ok((PaymentOutcome::Unchanged, Vec::new()));
    }

    let mut booking = lock_booking(tx, found.id).await?;
    match (status, booking.status) {
        (GatewayStatus::Confirmed, BookingStatus::Confirmed) | (GatewayStatus::Rejected, BookingStatus::Cancelled) => {
            Ok((PaymentOutcome::Unchanged, Vec::new()))
        }
        (GatewayStatus::Confirmed, BookingStatus::PaymentPending) => {
            let events = confirm_locked(tx, &mut booking, payment_reference).await?;
            Ok((PaymentOutcome::Confirmed, events))
        }
        (GatewayStatus::Rejected, BookingStatus::Pending | BookingStatus::PaymentPending) => {
            let events = cancel_locked(tx, &mut booking, PAYMENT_REJECTED).await?;
            Ok((PaymentOutcome::Cancelled, events))
        }
        (_, current) => Err(EngineError::Conflict(format!(
            "booking {} is {}, cannot apply {:?}",
            booking.id, current, status
        ))),
    }
}

/// Confirms a booking whose row lock is already held and sells its seats.
async fn confirm_locked<T: UnitOfWork>(
    tx: &mut T,
    booking: &mut Booking,
    payment_reference: Option<String>,
) -> EngineResult<Vec<LifecycleEvent>> {
    let links = tx.booking_seats().get_by_booking(booking.id).await?;
    let mut seats = Vec::with_capacity(links.len());
    for link in &links {
        let seat = lock_seat(tx, link.seat_id).await?;
        if seat.status != SeatStatus::Sold {
            tx.seats().set_status(seat.id, SeatStatus::Sold).await?;
        }
        seats.push(seat);
    }

    booking.total_amount = sum_prices(booking.id, &seats)?;
    if booking.payment_reference.is_none() {
        booking.payment_reference = payment_reference;
    }
    booking.status = BookingStatus::Confirmed;
    tx.bookings().update(booking).await?;

    info!("booking {} confirmed, {} seats sold", booking.id, seats.len());
    Ok(vec![LifecycleEvent::new(LifecyclePayload::BookingConfirmed {
        booking_id: booking.id,
        user_id: booking.user_id,
        total_amount: booking.total_amount,
    })])
}
