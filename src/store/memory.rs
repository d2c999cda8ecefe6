//! In-process store with row-lock semantics, used by the engine tests.
//!
//! Locked reads take a per-row async mutex owned by the unit of work, writes are
//! staged in an overlay and become visible to other units only on commit.
//! Unlocked reads see the last committed state, like READ COMMITTED.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use super::{BookingSeatStore, BookingStore, SeatStore, TransactionCoordinator, UnitOfWork};
use crate::catalog::EventCatalog;
use crate::error::{StoreError, StoreResult};
use crate::models::{Booking, BookingSeat, BookingStatus, Event, NewBooking, NewSeat, Seat, SeatQuery, SeatStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Seat(i64),
    Booking(i64),
}

#[derive(Debug, Default, Clone)]
pub(crate) struct MemoryDb {
    pub seats: BTreeMap<i64, Seat>,
    pub bookings: BTreeMap<i64, Booking>,
    pub booking_seats: BTreeMap<i64, BookingSeat>,
}

type LockTable = Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>;

#[derive(Clone, Default)]
pub(crate) struct MemoryCoordinator {
    db: Arc<Mutex<MemoryDb>>,
    locks: Arc<LockTable>,
    ids: Arc<AtomicI64>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> i64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Seeds a FREE seat directly into committed state.
    pub fn insert_seat(&self, event_id: i64, row_number: i32, seat_number: i32, price: i64) -> i64 {
        let id = self.next_id();
        let now = Utc::now();
        self.db.lock().seats.insert(
            id,
            Seat {
                id,
                event_id,
                row_number,
                seat_number,
                status: SeatStatus::Free,
                price,
                version: 0,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// Committed state as other units of work see it.
    pub fn snapshot(&self) -> MemoryDb {
        self.db.lock().clone()
    }

    pub fn seat(&self, seat_id: i64) -> Option<Seat> {
        self.db.lock().seats.get(&seat_id).cloned()
    }

    pub fn booking(&self, booking_id: i64) -> Option<Booking> {
        self.db.lock().bookings.get(&booking_id).cloned()
    }

    fn row_lock(&self, key: RowKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(key).or_default().clone()
    }
}

#[async_trait]
impl TransactionCoordinator for MemoryCoordinator {
    type Tx = MemoryUnitOfWork;

    async fn begin(&self) -> StoreResult<MemoryUnitOfWork> {
        Ok(MemoryUnitOfWork {
            owner: self.clone(),
            held: HashMap::new(),
            overlay: Overlay::default(),
        })
    }
}

#[derive(Default)]
struct Overlay {
    seats: HashMap<i64, Seat>,
    bookings: HashMap<i64, Booking>,
    links_added: BTreeMap<i64, BookingSeat>,
    links_removed: HashSet<i64>,
    clear_bookings: bool,
    clear_links: bool,
}

pub(crate) struct MemoryUnitOfWork {
    owner: MemoryCoordinator,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    overlay: Overlay,
}

impl MemoryUnitOfWork {
    async fn lock_row(&mut self, key: RowKey) {
        // FOR UPDATE is re-entrant within one transaction
        if self.held.contains_key(&key) {
            return;
        }
        let lock = self.owner.row_lock(key);
        let guard = lock.lock_owned().await;
        self.held.insert(key, guard);
    }

    fn visible_seat(&self, seat_id: i64) -> Option<Seat> {
        if let Some(seat) = self.overlay.seats.get(&seat_id) {
            return Some(seat.clone());
        }
        self.owner.db.lock().seats.get(&seat_id).cloned()
    }

    fn visible_seats(&self) -> Vec<Seat> {
        let mut merged: BTreeMap<i64, Seat> = {
            let db = self.owner.db.lock();
            db.seats.iter().map(|(id, s)| (*id, s.clone())).collect()
        };
        merged.extend(self.overlay.seats.iter().map(|(id, s)| (*id, s.clone())));
        merged.into_values().collect()
    }

    fn visible_booking(&self, booking_id: i64) -> Option<Booking> {
        if let Some(booking) = self.overlay.bookings.get(&booking_id) {
            return Some(booking.clone());
        }
        if self.overlay.clear_bookings {
            return None;
        }
        self.owner.db.lock().bookings.get(&booking_id).cloned()
    }

    fn visible_bookings(&self) -> Vec<Booking> {
        let mut merged: BTreeMap<i64, Booking> = BTreeMap::new();
        if !self.overlay.clear_bookings {
            let db = self.owner.db.lock();
            merged.extend(db.bookings.iter().map(|(id, b)| (*id, b.clone())));
        }
        merged.extend(self.overlay.bookings.iter().map(|(id, b)| (*id, b.clone())));
        merged.into_values().collect()
    }

    fn visible_links(&self) -> Vec<BookingSeat> {
        let mut links = Vec::new();
        if !self.overlay.clear_links {
            let db = self.owner.db.lock();
            links.extend(
                db.booking_seats
                    .values()
                    .filter(|link| !self.overlay.links_removed.contains(&link.id))
                    .cloned(),
            );
        }
        links.extend(self.overlay.links_added.values().cloned());
        links
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn commit(self) -> StoreResult<()> {
        let overlay = self.overlay;
        {
            let mut db = self.owner.db.lock();
            if overlay.clear_links {
                db.booking_seats.clear();
            }
            if overlay.clear_bookings {
                db.bookings.clear();
            }
            for id in &overlay.links_removed {
                db.booking_seats.remove(id);
            }
            db.booking_seats.extend(overlay.links_added);
            db.seats.extend(overlay.seats);
            db.bookings.extend(overlay.bookings);
        }
        // row locks are released only once the writes are visible
        drop(self.held);
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl SeatStore for MemoryUnitOfWork {
    async fn get_for_update(&mut self, seat_id: i64) -> StoreResult<Option<Seat>> {
        self.lock_row(RowKey::Seat(seat_id)).await;
        Ok(self.visible_seat(seat_id))
    }

    async fn get_by_ids(&mut self, seat_ids: &[i64]) -> StoreResult<Vec<Seat>> {
        let mut seats: Vec<Seat> = seat_ids.iter().filter_map(|id| self.visible_seat(*id)).collect();
        seats.sort_by_key(|s| s.id);
        seats.dedup_by_key(|s| s.id);
        Ok(seats)
    }

    async fn get_by_event(&mut self, event_id: i64, query: &SeatQuery) -> StoreResult<Vec<Seat>> {
        let mut seats: Vec<Seat> = self
            .visible_seats()
            .into_iter()
            .filter(|s| s.event_id == event_id && query.matches(s))
            .collect();
        seats.sort_by_key(|s| (s.row_number, s.seat_number));

        let offset = query.offset.max(0) as usize;
        let limit = query.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(seats.into_iter().skip(offset).take(limit).collect())
    }

    async fn set_status(&mut self, seat_id: i64, status: SeatStatus) -> StoreResult<()> {
        let mut seat = self
            .visible_seat(seat_id)
            .ok_or_else(|| StoreError::Backend(format!("seat {} does not exist", seat_id)))?;
        seat.status = status;
        seat.version += 1;
        seat.updated_at = Utc::now();
        self.overlay.seats.insert(seat_id, seat);
        Ok(())
    }

    async fn bulk_import(&mut self, event_id: i64, seats: &[NewSeat]) -> StoreResult<u64> {
        let existing: HashSet<(i32, i32)> = self
            .visible_seats()
            .into_iter()
            .filter(|s| s.event_id == event_id)
            .map(|s| (s.row_number, s.seat_number))
            .collect();

        let mut imported = 0;
        let now = Utc::now();
        for new in seats {
            if existing.contains(&(new.row_number, new.seat_number)) {
                continue;
            }
            let id = self.owner.next_id();
            self.overlay.seats.insert(
                id,
                Seat {
                    id,
                    event_id,
                    row_number: new.row_number,
                    seat_number: new.seat_number,
                    status: SeatStatus::Free,
                    price: new.price,
                    version: 0,
                    created_at: now,
                    updated_at: now,
                },
            );
            imported += 1;
        }
        Ok(imported)
    }

    async fn bulk_reset(&mut self) -> StoreResult<u64> {
        let held: Vec<i64> = self
            .visible_seats()
            .into_iter()
            .filter(|s| s.status != SeatStatus::Free)
            .map(|s| s.id)
            .collect();
        for seat_id in &held {
            self.set_status(*seat_id, SeatStatus::Free).await?;
        }
        Ok(held.len() as u64)
    }
}

#[async_trait]
impl BookingStore for MemoryUnitOfWork {
    async fn create(&mut self, booking: NewBooking) -> StoreResult<Booking> {
        let taken = self
            .visible_bookings()
            .iter()
            .any(|b| b.order_reference.as_deref() == Some(booking.order_reference.as_str()));
        if taken {
            return Err(StoreError::Backend(format!(
                "duplicate order reference {}",
                booking.order_reference
            )));
        }

        let now = Utc::now();
        let created = Booking {
            id: self.owner.next_id(),
            event_id: booking.event_id,
            user_id: booking.user_id,
            status: BookingStatus::Pending,
            total_amount: 0,
            payment_reference: None,
            order_reference: Some(booking.order_reference),
            created_at: now,
            updated_at: now,
        };
        self.overlay.bookings.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_for_update(&mut self, booking_id: i64) -> StoreResult<Option<Booking>> {
        self.lock_row(RowKey::Booking(booking_id)).await;
        Ok(self.visible_booking(booking_id))
    }

    async fn get(&mut self, booking_id: i64) -> StoreResult<Option<Booking>> {
        Ok(self.visible_booking(booking_id))
    }

    async fn get_by_owner(&mut self, user_id: i32) -> StoreResult<Vec<Booking>> {
        let mut bookings: Vec<Booking> = self
            .visible_bookings()
            .into_iter()
            .filter(|b| b.user_id == user_id)
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(bookings)
    }

    async fn get_by_order_reference(&mut self, reference: &str) -> StoreResult<Option<Booking>> {
        Ok(self
            .visible_bookings()
            .into_iter()
            .find(|b| b.order_reference.as_deref() == Some(reference)))
    }

    async fn get_by_payment_reference(&mut self, reference: &str) -> StoreResult<Option<Booking>> {
        Ok(self
            .visible_bookings()
            .into_iter()
            .find(|b| b.payment_reference.as_deref() == Some(reference)))
    }

    async fn update(&mut self, booking: &mut Booking) -> StoreResult<()> {
        if self.visible_booking(booking.id).is_none() {
            return Err(StoreError::Backend(format!("booking {} does not exist", booking.id)));
        }
        booking.updated_at = Utc::now();
        self.overlay.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn delete_all(&mut self) -> StoreResult<u64> {
        let count = self.visible_bookings().len() as u64;
        self.overlay.bookings.clear();
        self.overlay.clear_bookings = true;
        Ok(count)
    }
}

#[async_trait]
impl BookingSeatStore for MemoryUnitOfWork {
    async fn create(&mut self, booking_id: i64, seat_id: i64) -> StoreResult<BookingSeat> {
        // UNIQUE (seat_id)
        if self.visible_links().iter().any(|link| link.seat_id == seat_id) {
            return Err(StoreError::Backend(format!("seat {} already has a holder", seat_id)));
        }

        let link = BookingSeat {
            id: self.owner.next_id(),
            booking_id,
            seat_id,
            created_at: Utc::now(),
        };
        self.overlay.links_added.insert(link.id, link.clone());
        Ok(link)
    }

    async fn get_by_seat(&mut self, seat_id: i64) -> StoreResult<Vec<BookingSeat>> {
        Ok(self.visible_links().into_iter().filter(|l| l.seat_id == seat_id).collect())
    }

    async fn get_by_booking(&mut self, booking_id: i64) -> StoreResult<Vec<BookingSeat>> {
        let mut links: Vec<BookingSeat> =
            self.visible_links().into_iter().filter(|l| l.booking_id == booking_id).collect();
        links.sort_by_key(|l| l.seat_id);
        Ok(links)
    }

    async fn get_by_bookings(&mut self, booking_ids: &[i64]) -> StoreResult<Vec<BookingSeat>> {
        let wanted: HashSet<i64> = booking_ids.iter().copied().collect();
        let mut links: Vec<BookingSeat> = self
            .visible_links()
            .into_iter()
            .filter(|l| wanted.contains(&l.booking_id))
            .collect();
        links.sort_by_key(|l| (l.booking_id, l.seat_id));
        Ok(links)
    }

    async fn delete(&mut self, booking_seat_id: i64) -> StoreResult<()> {
        if self.overlay.links_added.remove(&booking_seat_id).is_none() {
            self.overlay.links_removed.insert(booking_seat_id);
        }
        Ok(())
    }

    async fn delete_all(&mut self) -> StoreResult<u64> {
        let count = self.visible_links().len() as u64;
        self.overlay.links_added.clear();
        self.overlay.links_removed.clear();
        self.overlay.clear_links = true;
        Ok(count)
    }
}

/// Event catalog backed by a fixed set of events.
#[derive(Default)]
pub(crate) struct MemoryCatalog {
    events: Mutex<HashMap<i64, Event>>,
}

impl MemoryCatalog {
    pub fn with_event(event_id: i64) -> Self {
        let catalog = Self::default();
        catalog.events.lock().insert(
            event_id,
            Event {
                id: event_id,
                title: format!("Event {}", event_id),
                description: None,
                event_type: "concert".to_string(),
                datetime_start: Utc::now(),
                provider: "test".to_string(),
            },
        );
        catalog
    }
}

#[async_trait]
impl EventCatalog for MemoryCatalog {
    async fn get_event(&self, event_id: i64) -> StoreResult<Option<Event>> {
        Ok(self.events.lock().get(&event_id).cloned())
    }
}
