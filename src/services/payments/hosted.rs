//! Hosted-redirect payments (PayPal REST). Two phases: an intent is created
//! for a server-computed amount, the shopper approves it on the provider's
//! page, and the capture call collects the funds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::header::CONTENT_TYPE;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{gateway_amount, PaymentAdapter, PaymentContext, PaymentOutcome, PaymentRequest};
use crate::{
    config::PaypalSettings,
    entities::{order::PaymentMethod, user_account::MembershipPlan},
    errors::ServiceError,
    services::checkout::CheckoutOptions,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayIntent {
    pub intent_id: String,
    pub status: String,
    pub approve_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCapture {
    pub status: String,
    pub capture_ref: Option<String>,
}

impl GatewayCapture {
    /// Only these provider statuses mean the funds were collected.
    pub fn is_success(&self) -> bool {
        matches!(self.status.as_str(), "COMPLETED" | "APPROVED")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub refund_id: Option<String>,
    pub status: String,
}

/// Provider operations. Amounts are decimal strings with two fraction digits.
#[async_trait]
pub trait HostedPaymentGateway: Send + Sync {
    async fn create_intent(&self, amount: &str) -> Result<GatewayIntent, ServiceError>;
    async fn capture_intent(&self, intent_id: &str) -> Result<GatewayCapture, ServiceError>;
    async fn refund_capture(
        &self,
        capture_ref: &str,
        amount: &str,
    ) -> Result<GatewayRefund, ServiceError>;
}

/// PayPal Orders v2 client using client-credentials OAuth.
#[derive(Clone)]
pub struct PaypalClient {
    client: reqwest::Client,
    settings: PaypalSettings,
    currency: String,
}

impl PaypalClient {
    pub fn new(settings: PaypalSettings, currency: impl Into<String>) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            settings,
            currency: currency.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, ServiceError> {
        if self.settings.client_id.is_empty() || self.settings.client_secret.is_empty() {
            return Err(ServiceError::ExternalServiceError(
                "PayPal credentials are not configured".to_string(),
            ));
        }

        let response = self
            .client
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.settings.client_id, Some(&self.settings.client_secret))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
            .send()
            .await
            .map_err(gateway_error("token request"))?;
        let body = checked_json(response, "token request").await?;

        body.get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceError::ExternalServiceError("PayPal token response had no access_token".into())
            })
    }

    async fn post_json(
        &self,
        path: &str,
        payload: Value,
        op: &'static str,
    ) -> Result<Value, ServiceError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(gateway_error(op))?;
        checked_json(response, op).await
    }
}

fn gateway_error(op: &'static str) -> impl Fn(reqwest::Error) -> ServiceError {
    move |e| {
        error!(error = %e, op, "PayPal request failed");
        ServiceError::ExternalServiceError(format!("PayPal {} failed: {}", op, e))
    }
}

async fn checked_json(response: reqwest::Response, op: &str) -> Result<Value, ServiceError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!(%status, body = %body, op, "PayPal returned an error");
        return Err(ServiceError::ExternalServiceError(format!(
            "PayPal {} failed: {}",
            op, status
        )));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| ServiceError::ExternalServiceError(format!("PayPal {} body: {}", op, e)))
}

/// Capture id from `purchase_units[0].payments.captures[0].id`, falling back
/// to the order id.
fn capture_ref(body: &Value) -> Option<String> {
    body.pointer("/purchase_units/0/payments/captures/0/id")
        .or_else(|| body.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl HostedPaymentGateway for PaypalClient {
    #[instrument(skip(self))]
    async fn create_intent(&self, amount: &str) -> Result<GatewayIntent, ServiceError> {
        let payload = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "amount": { "currency_code": self.currency, "value": amount }
            }]
        });
        let body = self.post_json("/v2/checkout/orders", payload, "create order").await?;

        let intent_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::ExternalServiceError("PayPal order had no id".into()))?
            .to_string();
        let approve_url = body
            .get("links")
            .and_then(Value::as_array)
            .and_then(|links| {
                links
                    .iter()
                    .find(|l| l.get("rel").and_then(Value::as_str) == Some("approve"))
            })
            .and_then(|l| l.get("href"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(GatewayIntent {
            intent_id,
            status: body
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("CREATED")
                .to_string(),
            approve_url,
        })
    }

    #[instrument(skip(self))]
    async fn capture_intent(&self, intent_id: &str) -> Result<GatewayCapture, ServiceError> {
        let path = format!("/v2/checkout/orders/{}/capture", intent_id);
        let body = self.post_json(&path, json!({}), "capture order").await?;
        Ok(GatewayCapture {
            status: body
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            capture_ref: capture_ref(&body),
        })
    }

    #[instrument(skip(self))]
    async fn refund_capture(
        &self,
        capture_ref: &str,
        amount: &str,
    ) -> Result<GatewayRefund, ServiceError> {
        let path = format!("/v2/payments/captures/{}/refund", capture_ref);
        let payload = json!({
            "amount": { "currency_code": self.currency, "value": amount }
        });
        let body = self.post_json(&path, payload, "refund").await?;
        Ok(GatewayRefund {
            refund_id: body.get("id").and_then(Value::as_str).map(str::to_string),
            status: body
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// What a hosted intent pays for.
#[derive(Debug, Clone)]
pub enum HostedPurpose {
    Checkout(CheckoutOptions),
    Membership(MembershipPlan),
    WalletTopUp,
}

impl HostedPurpose {
    fn label(&self) -> &'static str {
        match self {
            Self::Checkout(_) => "checkout",
            Self::Membership(_) => "membership",
            Self::WalletTopUp => "wallet top-up",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingIntent {
    pub intent_id: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub purpose: HostedPurpose,
    pub created_at: DateTime<Utc>,
}

/// Returned to the client so it can send the shopper to the provider.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HostedIntentView {
    pub intent_id: String,
    #[schema(value_type = String, example = "6.36")]
    pub amount: Decimal,
    pub approve_url: Option<String>,
}

/// Open intents older than this can no longer be captured.
const INTENT_TTL_HOURS: i64 = 3;

/// Hosted-redirect adapter plus the server-side record of open intents.
/// Abandoned intents are dropped once they outlive the intent TTL.
#[derive(Clone)]
pub struct HostedAdapter {
    gateway: Arc<dyn HostedPaymentGateway>,
    intents: Arc<DashMap<String, PendingIntent>>,
    intent_ttl: chrono::Duration,
}

impl HostedAdapter {
    pub fn new(gateway: Arc<dyn HostedPaymentGateway>) -> Self {
        Self {
            gateway,
            intents: Arc::new(DashMap::new()),
            intent_ttl: chrono::Duration::hours(INTENT_TTL_HOURS),
        }
    }

    pub fn with_intent_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.intent_ttl = ttl;
        self
    }

    fn is_stale(&self, intent: &PendingIntent, now: DateTime<Utc>) -> bool {
        now - intent.created_at >= self.intent_ttl
    }

    fn prune(&self) {
        let now = Utc::now();
        let before = self.intents.len();
        self.intents.retain(|_, intent| !self.is_stale(intent, now));
        let pruned = before.saturating_sub(self.intents.len());
        if pruned > 0 {
            debug!(pruned, "stale hosted intents dropped");
        }
    }

    #[instrument(skip(self, purpose), fields(purpose = purpose.label()))]
    pub async fn begin(
        &self,
        user_id: Uuid,
        amount: Decimal,
        purpose: HostedPurpose,
    ) -> Result<HostedIntentView, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Nothing to pay for this order.".to_string(),
            ));
        }
        self.prune();
        let intent = self.gateway.create_intent(&gateway_amount(amount)).await?;
        self.intents.insert(
            intent.intent_id.clone(),
            PendingIntent {
                intent_id: intent.intent_id.clone(),
                user_id,
                amount,
                purpose,
                created_at: Utc::now(),
            },
        );
        info!(intent_id = %intent.intent_id, "hosted intent created");
        Ok(HostedIntentView {
            intent_id: intent.intent_id,
            amount,
            approve_url: intent.approve_url,
        })
    }

    /// Looks up an open intent owned by `user_id`.
    pub fn pending(&self, intent_id: &str, user_id: Uuid) -> Result<PendingIntent, ServiceError> {
        let now = Utc::now();
        if self
            .intents
            .remove_if(intent_id, |_, intent| self.is_stale(intent, now))
            .is_some()
        {
            info!(intent_id, "hosted intent expired before capture");
        }
        let intent = self
            .intents
            .get(intent_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ServiceError::NotFound("Payment session not found.".to_string()))?;
        if intent.user_id != user_id {
            return Err(ServiceError::Forbidden(
                "Payment session belongs to another user.".to_string(),
            ));
        }
        Ok(intent)
    }

    /// Claims the intent and captures it. Each intent is captured at most once.
    #[instrument(skip(self))]
    pub async fn capture(
        &self,
        intent_id: &str,
        user_id: Uuid,
    ) -> Result<PaymentOutcome, ServiceError> {
        self.pending(intent_id, user_id)?;
        let Some((_, intent)) = self.intents.remove(intent_id) else {
            return Err(ServiceError::Conflict(
                "Payment is already being processed.".to_string(),
            ));
        };

        let capture = self.gateway.capture_intent(&intent.intent_id).await?;
        if !capture.is_success() {
            warn!(intent_id, status = %capture.status, "hosted capture not completed");
            return Ok(PaymentOutcome::declined("Payment not completed."));
        }
        info!(intent_id, capture_ref = ?capture.capture_ref, "hosted payment captured");
        Ok(PaymentOutcome::approved(capture.capture_ref))
    }

    #[instrument(skip(self))]
    pub async fn refund(
        &self,
        capture_ref: &str,
        amount: Decimal,
    ) -> Result<GatewayRefund, ServiceError> {
        let refund = self
            .gateway
            .refund_capture(capture_ref, &gateway_amount(amount))
            .await?;
        info!(capture_ref, refund_id = ?refund.refund_id, status = %refund.status, "capture refunded");
        Ok(refund)
    }
}

#[async_trait]
impl PaymentAdapter for HostedAdapter {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Paypal
    }

    async fn validate(&self, user_id: Uuid, request: &PaymentRequest) -> Result<(), ServiceError> {
        let PaymentRequest::Paypal { intent_id } = request else {
            return Err(super::wrong_request(self.method()));
        };
        let intent = self.pending(intent_id, user_id)?;
        if !matches!(intent.purpose, HostedPurpose::Checkout(_)) {
            return Err(ServiceError::InvalidInput(
                "Payment session was not started for a checkout.".to_string(),
            ));
        }
        Ok(())
    }

    /// Refuses to capture when the recomputed total differs from the amount
    /// the shopper approved.
    async fn authorize(
        &self,
        ctx: &PaymentContext,
        request: &PaymentRequest,
    ) -> Result<PaymentOutcome, ServiceError> {
        let PaymentRequest::Paypal { intent_id } = request else {
            return Err(super::wrong_request(self.method()));
        };
        let intent = self.pending(intent_id, ctx.user_id)?;
        if intent.amount != ctx.amount {
            return Err(ServiceError::PaymentFailed(
                "Your cart changed after the payment was started. Please try again.".to_string(),
            ));
        }
        self.capture(intent_id, ctx.user_id).await
    }

    async fn compensate(
        &self,
        ctx: &PaymentContext,
        outcome: &PaymentOutcome,
    ) -> Result<(), ServiceError> {
        let capture_ref = outcome.external_ref.as_deref().ok_or_else(|| {
            ServiceError::InternalError("hosted capture has no reference".to_string())
        })?;
        self.refund(capture_ref, ctx.amount).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use rust_decimal_macros::dec;

    mock! {
        pub Gateway {}

        #[async_trait]
        impl HostedPaymentGateway for Gateway {
            async fn create_intent(&self, amount: &str) -> Result<GatewayIntent, ServiceError>;
            async fn capture_intent(&self, intent_id: &str) -> Result<GatewayCapture, ServiceError>;
            async fn refund_capture(
                &self,
                capture_ref: &str,
                amount: &str,
            ) -> Result<GatewayRefund, ServiceError>;
        }
    }

    fn created(gateway: &mut MockGateway, intent_id: &'static str) {
        gateway
            .expect_create_intent()
            .withf(|amount: &str| amount == "6.36")
            .times(1)
            .returning(move |_| {
                Ok(GatewayIntent {
                    intent_id: intent_id.to_string(),
                    status: "CREATED".to_string(),
                    approve_url: Some(format!("https://pay.test/approve/{intent_id}")),
                })
            });
    }

    fn checkout() -> HostedPurpose {
        HostedPurpose::Checkout(CheckoutOptions::default())
    }

    #[tokio::test]
    async fn intents_are_captured_once() {
        let mut gateway = MockGateway::new();
        created(&mut gateway, "INT-1");
        gateway
            .expect_capture_intent()
            .withf(|id: &str| id == "INT-1")
            .times(1)
            .returning(|_| {
                Ok(GatewayCapture {
                    status: "COMPLETED".to_string(),
                    capture_ref: Some("CAP-1".to_string()),
                })
            });
        let adapter = HostedAdapter::new(Arc::new(gateway));
        let user = Uuid::new_v4();

        let view = adapter.begin(user, dec!(6.36), checkout()).await.unwrap();
        assert_eq!(view.approve_url.as_deref(), Some("https://pay.test/approve/INT-1"));

        let outcome = adapter.capture("INT-1", user).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.external_ref.as_deref(), Some("CAP-1"));

        let again = adapter.capture("INT-1", user).await.unwrap_err();
        assert!(matches!(again, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn changed_totals_are_not_captured() {
        let mut gateway = MockGateway::new();
        created(&mut gateway, "INT-2");
        gateway.expect_capture_intent().times(0);
        let adapter = HostedAdapter::new(Arc::new(gateway));
        let user = Uuid::new_v4();
        adapter.begin(user, dec!(6.36), checkout()).await.unwrap();

        let request = PaymentRequest::Paypal {
            intent_id: "INT-2".to_string(),
        };
        adapter.validate(user, &request).await.unwrap();
        let err = adapter
            .authorize(&PaymentContext::new(user, dec!(7.40)), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::PaymentFailed(_)));
    }

    #[tokio::test]
    async fn pending_captures_are_declined() {
        let mut gateway = MockGateway::new();
        created(&mut gateway, "INT-3");
        gateway.expect_capture_intent().returning(|_| {
            Ok(GatewayCapture {
                status: "PENDING".to_string(),
                capture_ref: None,
            })
        });
        let adapter = HostedAdapter::new(Arc::new(gateway));
        let user = Uuid::new_v4();
        adapter.begin(user, dec!(6.36), checkout()).await.unwrap();

        let outcome = adapter.capture("INT-3", user).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("Payment not completed."));
    }

    #[tokio::test]
    async fn other_users_cannot_use_an_intent() {
        let mut gateway = MockGateway::new();
        created(&mut gateway, "INT-4");
        let adapter = HostedAdapter::new(Arc::new(gateway));
        adapter
            .begin(Uuid::new_v4(), dec!(6.36), HostedPurpose::WalletTopUp)
            .await
            .unwrap();

        let err = adapter.pending("INT-4", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn zero_amounts_never_reach_the_gateway() {
        let adapter = HostedAdapter::new(Arc::new(MockGateway::new()));
        let err = adapter
            .begin(Uuid::new_v4(), Decimal::ZERO, checkout())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }

    #[tokio::test]
    async fn stale_intents_are_dropped() {
        let mut gateway = MockGateway::new();
        let mut seq = 0;
        gateway.expect_create_intent().times(2).returning(move |_| {
            seq += 1;
            Ok(GatewayIntent {
                intent_id: format!("INT-OLD-{seq}"),
                status: "CREATED".to_string(),
                approve_url: None,
            })
        });
        gateway.expect_capture_intent().times(0);
        let adapter =
            HostedAdapter::new(Arc::new(gateway)).with_intent_ttl(chrono::Duration::zero());
        let user = Uuid::new_v4();

        adapter.begin(user, dec!(6.36), checkout()).await.unwrap();
        let err = adapter.capture("INT-OLD-1", user).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        adapter.begin(user, dec!(6.36), checkout()).await.unwrap();
        assert_eq!(adapter.intents.len(), 1);
    }

    #[test]
    fn capture_ref_prefers_the_capture_id() {
        let body = json!({
            "id": "ORDER-1",
            "status": "COMPLETED",
            "purchase_units": [{ "payments": { "captures": [{ "id": "CAP-9" }] } }]
        });
        assert_eq!(capture_ref(&body).as_deref(), Some("CAP-9"));

        let bare = json!({ "id": "ORDER-2", "status": "COMPLETED" });
        assert_eq!(capture_ref(&bare).as_deref(), Some("ORDER-2"));
    }

    #[test]
    fn only_completed_or_approved_counts() {
        for (status, ok) in [
            ("COMPLETED", true),
            ("APPROVED", true),
            ("PENDING", false),
            ("VOIDED", false),
            ("", false),
        ] {
            let capture = GatewayCapture {
                status: status.to_string(),
                capture_ref: None,
            };
            assert_eq!(capture.is_success(), ok, "{}", status);
        }
    }
}
