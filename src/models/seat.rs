use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use super::UnknownStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    Free,
    Reserved,
    Sold,
}

impl SeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatStatus::Free => "FREE",
            SeatStatus::Reserved => "RESERVED",
            SeatStatus::Sold => "SOLD",
        }
    }

    /// RESERVED and SOLD seats are held by exactly one booking.
    pub fn is_held(&self) -> bool {
        !matches!(self, SeatStatus::Free)
    }
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeatStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FREE" => Ok(SeatStatus::Free),
            "RESERVED" => Ok(SeatStatus::Reserved),
            "SOLD" => Ok(SeatStatus::Sold),
            other => Err(UnknownStatus { kind: "seat", value: other.to_string() }),
        }
    }
}

impl TryFrom<String> for SeatStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Seat {
    pub id: i64,
    pub event_id: i64,
    pub row_number: i32,
    pub seat_number: i32,
    #[sqlx(try_from = "String")]
    pub status: SeatStatus,
    /// Minor currency units.
    pub price: i64,
    /// Bumped on every status write. Audit only, row locks are the concurrency guard.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Catalog import row.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSeat {
    pub row_number: i32,
    pub seat_number: i32,
    pub price: i64,
}

/// Filter and paging for the seat listing.
#[derive(Debug, Clone, Default)]
pub struct SeatQuery {
    pub row: Option<i32>,
    pub status: Option<SeatStatus>,
    pub limit: Option<i64>,
    pub offset: i64,
}

impl SeatQuery {
    pub fn page(page: u32, page_size: u32) -> Self {
        let page = page.max(1);
        Self {
            limit: Some(page_size as i64),
            offset: ((page - 1) as i64) * page_size as i64,
            ..Default::default()
        }
    }

    pub fn matches(&self, seat: &Seat) -> bool {
        self.row.map_or(true, |r| seat.row_number == r) && self.status.map_or(true, |s| seat.status == s)
    }
}
