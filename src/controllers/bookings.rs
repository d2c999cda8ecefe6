use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use validator::Validate;

use super::validated;
use crate::error::EngineError;
use crate::middleware::AuthUser;
use crate::models::{SeatQuery, SeatStatus};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/seats", get(get_seats))
        .route("/seats/select", patch(select_seat))
        .route("/seats/release", patch(release_seat))
        .route("/bookings", get(get_user_bookings).post(create_booking))
        .route("/bookings/initiatePayment", patch(initiate_payment))
        .route("/bookings/cancel", patch(cancel_booking))
}

pub fn reset_route() -> Router<Arc<AppState>> {
    Router::new().route("/reset", post(reset_all))
}

/* ---------- BOOKINGS ---------- */

// POST /api/bookings
#[derive(Debug, Deserialize, Validate)]
struct CreateBookingRequest {
    #[validate(range(min = 1))]
    event_id: i64,
}

#[derive(Debug, Serialize)]
struct CreateBookingResponse {
    id: i64,
}

async fn create_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateBookingRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let req = validated(req)?;
    let booking = state.engine.create_booking(req.event_id, user.user_id).await?;
    Ok((StatusCode::CREATED, Json(CreateBookingResponse { id: booking.id })))
}

// GET /api/bookings
#[derive(Debug, Serialize)]
struct BookingSeat {
    id: i64,
}

#[derive(Debug, Serialize)]
struct BookingResponse {
    id: i64,
    event_id: i64,
    status: String,
    total_amount: i64,
    seats: Vec<BookingSeat>,
}

async fn get_user_bookings(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<impl IntoResponse, EngineError> {
    let views = state.engine.list_bookings(user.user_id).await?;

    let resp: Vec<BookingResponse> = views
        .into_iter()
        .map(|view| BookingResponse {
            id: view.booking.id,
            event_id: view.booking.event_id,
            status: view.booking.status.to_string(),
            total_amount: view.booking.total_amount,
            seats: view.seat_ids.into_iter().map(|id| BookingSeat { id }).collect(),
        })
        .collect();

    Ok(Json(resp))
}

#[derive(Debug, Deserialize, Validate)]
struct BookingIdRequest {
    #[validate(range(min = 1))]
    booking_id: i64,
}

// PATCH /api/bookings/initiatePayment
async fn initiate_payment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<BookingIdRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let req = validated(req)?;
    let redirect_url = state.engine.initiate_payment(req.booking_id, user.user_id).await?;
    Ok((StatusCode::FOUND, [(header::LOCATION, redirect_url)]))
}

// PATCH /api/bookings/cancel
async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<BookingIdRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let req = validated(req)?;
    state.engine.cancel_booking(req.booking_id, user.user_id).await?;
    Ok(Json(json!({"message": "Booking cancelled"})))
}

/* ---------- SEATS ---------- */

#[derive(Debug, Deserialize, Validate)]
struct SeatsQuery {
    #[validate(range(min = 1))]
    event_id: i64,
    #[validate(range(min = 1))]
    page: Option<u32>,
    #[serde(rename = "pageSize")]
    #[validate(range(min = 1, max = 20))]
    page_size: Option<u32>,
    #[validate(range(min = 1))]
    row: Option<i32>,
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct SeatResponse {
    id: i64,
    row: i32,
    number: i32,
    status: SeatStatus,
    price: i64,
}

// GET /api/seats
async fn get_seats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeatsQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let params = validated(params)?;

    let status = params
        .status
        .as_deref()
        .map(str::parse::<SeatStatus>)
        .transpose()
        .map_err(|e| EngineError::Validation(e.to_string()))?;

    let query = SeatQuery {
        row: params.row,
        status,
        ..SeatQuery::page(params.page.unwrap_or(1), params.page_size.unwrap_or(20))
    };

    let seats = state.engine.list_seats(params.event_id, query).await?;
    let resp: Vec<SeatResponse> = seats
        .into_iter()
        .map(|s| SeatResponse { id: s.id, row: s.row_number, number: s.seat_number, status: s.status, price: s.price })
        .collect();

    Ok(Json(resp))
}

// PATCH /api/seats/select
#[derive(Debug, Deserialize, Validate)]
struct SelectSeatRequest {
    #[validate(range(min = 1))]
    booking_id: i64,
    #[validate(range(min = 1))]
    seat_id: i64,
}

async fn select_seat(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<SelectSeatRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let req = validated(req)?;
    state.engine.select_seat(req.booking_id, req.seat_id, user.user_id).await?;
    Ok(Json(json!({"message": "Seat added to booking"})))
}

// PATCH /api/seats/release
#[derive(Debug, Deserialize, Validate)]
struct ReleaseSeatRequest {
    #[validate(range(min = 1))]
    seat_id: i64,
}

async fn release_seat(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<ReleaseSeatRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let req = validated(req)?;
    state.engine.release_seat(req.seat_id, user.user_id).await?;
    Ok(Json(json!({"message": "Seat released"})))
}

/* ---------- RESET ---------- */

// POST /api/reset
async fn reset_all(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, EngineError> {
    let summary = state.engine.reset().await?;
    Ok(Json(json!({"message": "All bookings removed", "summary": summary})))
}
