pub mod bookings;
pub mod payment;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use validator::Validate;

use crate::error::{EngineError, ErrorClass};

pub fn routes() -> Router<Arc<crate::AppState>> {
    Router::new()
        .merge(bookings::routes())
        .merge(bookings::reset_route())
        .merge(payment::routes())
}

#[derive(Serialize)]
struct ApiError {
    success: bool,
    message: String,
}

fn status_419() -> StatusCode {
    StatusCode::from_u16(419).unwrap_or(StatusCode::CONFLICT)
}

pub(crate) fn status_for(err: &EngineError) -> StatusCode {
    match err {
        // the load-test client expects 419 for a lost seat race
        EngineError::SeatUnavailable { .. } => status_419(),
        _ => match err.class() {
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::BadRequest => StatusCode::BAD_REQUEST,
            ErrorClass::Forbidden => StatusCode::FORBIDDEN,
            ErrorClass::ConflictRetry => StatusCode::CONFLICT,
            ErrorClass::BadGateway => StatusCode::BAD_GATEWAY,
            ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        (status, Json(ApiError { success: false, message: self.to_string() })).into_response()
    }
}

pub(crate) fn validated<T: Validate>(req: T) -> Result<T, EngineError> {
    req.validate().map_err(|e| EngineError::Validation(e.to_string()))?;
    Ok(req)
}
