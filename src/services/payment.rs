//! Client for the external payment gateway.
//!
//! Every outbound call goes through a consecutive-failures circuit breaker; while
//! it is open calls are refused without touching the network.

use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as _;
use failsafe::{backoff, failure_policy, StateMachine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{CircuitBreakerConfig, PaymentConfig};

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("payment gateway declined: {0}")]
    Declined(String),

    #[error("circuit breaker is open, payment gateway temporarily unavailable")]
    CircuitOpen,
}

/// What the engine asks the gateway to charge.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub order_reference: String,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub email: Option<String>,
}

/// A payment opened on the gateway side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSession {
    pub payment_reference: String,
    pub redirect_url: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(&self, request: PaymentRequest) -> Result<PaymentSession, PaymentError>;
}

#[derive(Debug, Serialize)]
struct PaymentInitRequest<'a> {
    #[serde(rename = "teamSlug")]
    team_slug: &'a str,
    token: String,
    amount: i64,
    #[serde(rename = "orderId")]
    order_id: &'a str,
    currency: &'a str,
    description: &'a str,
    #[serde(rename = "successURL")]
    success_url: String,
    #[serde(rename = "failURL")]
    fail_url: String,
    #[serde(rename = "notificationURL")]
    notification_url: &'a str,
    #[serde(rename = "paymentExpiry")]
    payment_expiry: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct PaymentInitResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(rename = "paymentId")]
    payment_id: Option<String>,
    #[serde(rename = "paymentURL")]
    payment_url: Option<String>,
    message: Option<String>,
}

type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::Constant>, ()>;

pub struct PaymentGatewayClient {
    team_slug: String,
    password: String,
    base_url: String,
    success_url: String,
    fail_url: String,
    notification_url: String,
    language: String,
    payment_expiry_secs: u64,
    http_client: reqwest::Client,
    circuit_breaker: Breaker,
}

impl PaymentGatewayClient {
    pub fn from_config(config: &PaymentConfig, breaker: &CircuitBreakerConfig) -> Result<Self, PaymentError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let circuit_breaker = failsafe::Config::new()
            .failure_policy(failure_policy::consecutive_failures(
                breaker.failure_threshold,
                backoff::constant(Duration::from_secs(breaker.timeout_seconds)),
            ))
            .build();

        Ok(Self {
            team_slug: config.team_slug.clone(),
            password: config.password.clone(),
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            success_url: config.success_url.clone(),
            fail_url: config.fail_url.clone(),
            notification_url: config.notification_url.clone(),
            language: config.language.clone(),
            payment_expiry_secs: config.payment_expiry_secs,
            http_client,
            circuit_breaker,
        })
    }

    /// SHA-256 over the signed parameter values in key order, followed by the password.
    fn generate_token(&self, params: &BTreeMap<&str, String>) -> String {
        let mut token_string: String = params.values().map(String::as_str).collect();
        token_string.push_str(&self.password);

        let mut hasher = Sha256::new();
        hasher.update(token_string.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn init_token(&self, amount: i64, currency: &str, order_id: &str) -> String {
        let params = BTreeMap::from([
            ("amount", amount.to_string()),
            ("currency", currency.to_string()),
            ("orderId", order_id.to_string()),
            ("teamSlug", self.team_slug.clone()),
        ]);
        self.generate_token(&params)
    }

    async fn send_init(&self, body: &PaymentInitRequest<'_>) -> Result<PaymentInitResponse, reqwest::Error> {
        self.http_client
            .post(format!("{}/PaymentInit/init", self.base_url))
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json::<PaymentInitResponse>()
            .await
    }
}

#[async_trait]
impl PaymentGateway for PaymentGatewayClient {
    async fn create_payment(&self, request: PaymentRequest) -> Result<PaymentSession, PaymentError> {
        let token = self.init_token(request.amount, &request.currency, &request.order_reference);

        let body = PaymentInitRequest {
            team_slug: &self.team_slug,
            token,
            amount: request.amount,
            order_id: &request.order_reference,
            currency: &request.currency,
            description: &request.description,
            success_url: format!("{}?orderId={}", self.success_url, request.order_reference),
            fail_url: format!("{}?orderId={}", self.fail_url, request.order_reference),
            notification_url: &self.notification_url,
            payment_expiry: self.payment_expiry_secs,
            email: request.email.as_deref(),
            language: &self.language,
        };

        info!(
            "Creating payment: order_id={}, amount={}, currency={}",
            request.order_reference, request.amount, request.currency
        );

        let response = match self.circuit_breaker.call(self.send_init(&body)).await {
            Ok(response) => response,
            Err(failsafe::Error::Rejected) => {
                warn!("Circuit breaker is OPEN - blocking payment gateway request");
                return Err(PaymentError::CircuitOpen);
            }
            Err(failsafe::Error::Inner(e)) => {
                error!("Payment gateway request failed: {:?}", e);
                return Err(PaymentError::Http(e));
            }
        };

        if response.success == Some(false) {
            let message = response.message.unwrap_or_else(|| "no reason given".to_string());
            return Err(PaymentError::Declined(message));
        }

        match (response.payment_id, response.payment_url) {
            (Some(payment_reference), Some(redirect_url)) => {
                info!("Payment created: payment_id={}", payment_reference);
                Ok(PaymentSession { payment_reference, redirect_url })
            }
            _ => Err(PaymentError::Declined("response is missing paymentId or paymentURL".to_string())),
        }
    }
}
