use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::services::reservation::{PaymentCallback, PaymentOutcome};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/payments/notifications", post(payment_notification))
        .route("/payments/success", get(payment_success))
        .route("/payments/fail", get(payment_fail))
}

#[derive(Debug, Default, Deserialize)]
struct NotificationData {
    #[serde(rename = "orderId")]
    order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentNotification {
    #[serde(rename = "paymentId")]
    payment_id: Option<String>,
    #[serde(rename = "orderId")]
    order_id: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    data: Option<NotificationData>,
}

impl From<PaymentNotification> for PaymentCallback {
    fn from(n: PaymentNotification) -> Self {
        let nested_order = n.data.and_then(|d| d.order_id);
        PaymentCallback {
            payment_reference: n.payment_id,
            order_reference: n.order_id.or(nested_order),
            status: n.status,
        }
    }
}

/// Only faults that a redelivery can repair answer with an error, so the
/// gateway retries exactly the notifications that were not applied.
fn notification_status(result: &EngineResult<PaymentOutcome>, has_order_reference: bool) -> StatusCode {
    match result {
        Ok(_) => StatusCode::OK,
        Err(EngineError::TransactionFailure(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        // the payment reference is stored only after the gateway call returns
        Err(EngineError::NotFound(_)) if !has_order_reference => StatusCode::SERVICE_UNAVAILABLE,
        Err(_) => StatusCode::OK,
    }
}

/// POST /api/payments/notifications
async fn payment_notification(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PaymentNotification>,
) -> impl IntoResponse {
    tracing::info!("Webhook: payment_id={:?}, status={}", payload.payment_id, payload.status);

    let callback = PaymentCallback::from(payload);
    let has_order_reference = callback.order_reference.as_deref().is_some_and(|r| !r.trim().is_empty());
    let result = state.engine.apply_payment_status(callback).await;
    let status = notification_status(&result, has_order_reference);

    match &result {
        Ok(outcome) => tracing::debug!("payment notification applied: {:?}", outcome),
        Err(err) if status.is_success() => tracing::warn!("payment notification ignored: {}", err),
        Err(err) => tracing::error!("payment notification not applied, awaiting redelivery: {}", err),
    }
    (status, Json(json!({"received": status.is_success()})))
}

#[derive(Debug, Deserialize)]
struct RedirectQuery {
    #[serde(rename = "orderId")]
    order_id: Option<String>,
}

/// GET /api/payments/success
async fn payment_success(Query(q): Query<RedirectQuery>) -> impl IntoResponse {
    Json(json!({"message": "Payment accepted, awaiting confirmation", "order_id": q.order_id}))
}

/// GET /api/payments/fail
async fn payment_fail(Query(q): Query<RedirectQuery>) -> impl IntoResponse {
    Json(json!({"message": "Payment failed", "order_id": q.order_id}))
}
