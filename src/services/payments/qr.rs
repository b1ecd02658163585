//! QR payments (NETS). A code is generated for a server-computed amount and
//! the shopper pays from their banking app. Confirmation arrives later, pushed
//! by the gateway or pulled by polling, and drives a per-code state machine:
//!
//! ```text
//! Pending ──▶ Confirmed ──▶ Settled
//!    │
//!    ├──────▶ Failed
//!    └──────▶ TimedOut
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use strum::Display;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{gateway_amount, PaymentAdapter, PaymentContext, PaymentOutcome, PaymentRequest};
use crate::{
    config::NetsSettings,
    entities::{order::PaymentMethod, transaction_log::TransactionAction},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        accounts::BalanceChange,
        checkout::CheckoutOptions,
        transaction_log::{NewLogEntry, TransactionLogService},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, ToSchema)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QrState {
    Pending,
    Confirmed,
    Failed,
    TimedOut,
    Settled,
}

/// A gateway status reading, reduced to what the state machine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrSignal {
    Paid,
    Declined,
    Waiting,
}

impl QrState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::Settled)
    }

    /// Next state for a gateway signal; `None` when the signal does not apply.
    pub fn on_signal(self, signal: QrSignal) -> Option<Self> {
        match (self, signal) {
            (Self::Pending, QrSignal::Paid) => Some(Self::Confirmed),
            (Self::Pending, QrSignal::Declined) => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Reads NETS `response_code`/`txn_status` pairs. `"00"` with status 1 is a
/// completed payment; status 2 or a non-success response code is a decline;
/// anything else (including `"09"`, in progress) keeps waiting.
pub fn interpret_status(response_code: Option<&str>, txn_status: Option<i64>) -> QrSignal {
    match (response_code.map(str::trim), txn_status) {
        (Some("00"), Some(1)) => QrSignal::Paid,
        (_, Some(2)) => QrSignal::Declined,
        (Some(code), _) if !code.is_empty() && code != "00" && code != "09" => QrSignal::Declined,
        _ => QrSignal::Waiting,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayQrCode {
    /// Base64 PNG
    pub qr_code: String,
    pub retrieval_ref: String,
}

/// Status payload pushed by the gateway (or returned by a status query).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QrStatusReport {
    #[serde(alias = "txn_retrieval_ref")]
    pub retrieval_ref: String,
    #[serde(default)]
    pub response_code: Option<String>,
    #[serde(default)]
    pub txn_status: Option<i64>,
}

impl QrStatusReport {
    pub fn signal(&self) -> QrSignal {
        interpret_status(self.response_code.as_deref(), self.txn_status)
    }
}

#[async_trait]
pub trait QrPaymentGateway: Send + Sync {
    async fn request_code(&self, amount: &str, txn_id: &str)
        -> Result<GatewayQrCode, ServiceError>;
    async fn query_status(&self, retrieval_ref: &str) -> Result<QrStatusReport, ServiceError>;
}

/// NETS QR sandbox client.
#[derive(Clone)]
pub struct NetsClient {
    client: reqwest::Client,
    settings: NetsSettings,
}

impl NetsClient {
    pub fn new(settings: NetsSettings) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;
        Ok(Self { client, settings })
    }

    async fn post(&self, path: &str, payload: Value) -> Result<Value, ServiceError> {
        let url = format!("{}{}", self.settings.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .header("api-key", &self.settings.api_key)
            .header("project-id", &self.settings.project_id)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, path, "NETS request failed");
                ServiceError::ExternalServiceError(format!("NETS request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, body = %body, path, "NETS returned an error");
            return Err(ServiceError::ExternalServiceError(format!(
                "NETS returned {}",
                status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("NETS body: {}", e)))?;
        body.pointer("/result/data").cloned().ok_or_else(|| {
            ServiceError::ExternalServiceError("NETS response had no result.data".to_string())
        })
    }
}

#[async_trait]
impl QrPaymentGateway for NetsClient {
    #[instrument(skip(self))]
    async fn request_code(
        &self,
        amount: &str,
        txn_id: &str,
    ) -> Result<GatewayQrCode, ServiceError> {
        let data = self
            .post(
                "/api/v1/common/payments/nets-qr/request",
                json!({ "txn_id": txn_id, "amt_in_dollars": amount, "notify_mobile": 0 }),
            )
            .await?;

        let response_code = data.get("response_code").and_then(Value::as_str);
        let txn_status = data.get("txn_status").and_then(Value::as_i64);
        let qr_code = data
            .get("qr_code")
            .and_then(Value::as_str)
            .filter(|code| !code.is_empty());
        let retrieval_ref = data.get("txn_retrieval_ref").and_then(Value::as_str);

        match (response_code, txn_status, qr_code, retrieval_ref) {
            (Some("00"), Some(1), Some(qr_code), Some(retrieval_ref)) => Ok(GatewayQrCode {
                qr_code: qr_code.to_string(),
                retrieval_ref: retrieval_ref.to_string(),
            }),
            _ => {
                let network_failed = data
                    .get("network_status")
                    .and_then(Value::as_i64)
                    .map_or(false, |s| s != 0);
                let message = if network_failed {
                    data.get("error_message")
                        .and_then(Value::as_str)
                        .unwrap_or("Transaction failed. Please try again.")
                } else {
                    "An error occurred while generating the QR code."
                };
                warn!(?response_code, ?txn_status, "NETS declined the QR request");
                Err(ServiceError::PaymentFailed(message.to_string()))
            }
        }
    }

    #[instrument(skip(self))]
    async fn query_status(&self, retrieval_ref: &str) -> Result<QrStatusReport, ServiceError> {
        let data = self
            .post(
                "/api/v1/common/payments/nets-qr/query",
                json!({ "txn_retrieval_ref": retrieval_ref, "frontend_timeout_status": 0 }),
            )
            .await?;
        Ok(QrStatusReport {
            retrieval_ref: retrieval_ref.to_string(),
            response_code: data
                .get("response_code")
                .and_then(Value::as_str)
                .map(str::to_string),
            txn_status: data.get("txn_status").and_then(Value::as_i64),
        })
    }
}

/// Pending checkout parked until its QR code is paid. The confirmation call
/// carries no cart context, so delivery and redemption choices live here.
#[derive(Debug, Clone)]
pub struct QrSession {
    pub retrieval_ref: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub options: CheckoutOptions,
    pub created_at: DateTime<Utc>,
    state: Arc<watch::Sender<QrState>>,
}

impl QrSession {
    pub fn state(&self) -> QrState {
        *self.state.borrow()
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QrCodeView {
    pub retrieval_ref: String,
    /// Base64 PNG
    pub qr_code: String,
    #[schema(value_type = String, example = "6.36")]
    pub amount: Decimal,
    pub expires_in_secs: u64,
}

#[derive(Clone)]
pub struct QrAdapter {
    ledger: TransactionLogService,
    gateway: Arc<dyn QrPaymentGateway>,
    sessions: Arc<DashMap<String, QrSession>>,
    event_sender: Arc<EventSender>,
    txn_id_prefix: String,
    timeout: Duration,
}

impl QrAdapter {
    pub fn new(
        ledger: TransactionLogService,
        gateway: Arc<dyn QrPaymentGateway>,
        event_sender: Arc<EventSender>,
        settings: &NetsSettings,
    ) -> Self {
        Self {
            ledger,
            gateway,
            sessions: Arc::new(DashMap::new()),
            event_sender,
            txn_id_prefix: settings.txn_id_prefix.clone(),
            timeout: Duration::from_secs(settings.qr_timeout_secs),
        }
    }

    /// Requests a code and parks the checkout. A background timer closes the
    /// session when the timeout elapses.
    #[instrument(skip(self, options))]
    pub async fn begin(
        &self,
        user_id: Uuid,
        amount: Decimal,
        options: CheckoutOptions,
    ) -> Result<QrCodeView, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Nothing to pay for this order.".to_string(),
            ));
        }
        let txn_id = format!("{}{}", self.txn_id_prefix, Uuid::new_v4());
        let code = self
            .gateway
            .request_code(&gateway_amount(amount), &txn_id)
            .await?;

        let (state, _) = watch::channel(QrState::Pending);
        self.sessions.insert(
            code.retrieval_ref.clone(),
            QrSession {
                retrieval_ref: code.retrieval_ref.clone(),
                user_id,
                amount,
                options,
                created_at: Utc::now(),
                state: Arc::new(state),
            },
        );
        self.spawn_timeout(code.retrieval_ref.clone());
        info!(retrieval_ref = %code.retrieval_ref, "QR code issued");

        Ok(QrCodeView {
            retrieval_ref: code.retrieval_ref,
            qr_code: code.qr_code,
            amount,
            expires_in_secs: self.timeout.as_secs(),
        })
    }

    fn spawn_timeout(&self, retrieval_ref: String) {
        let adapter = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(adapter.timeout).await;
            adapter.expire(&retrieval_ref).await;
        });
    }

    /// Timer expiry. A still-pending session becomes `TimedOut`; a confirmed
    /// one that nobody settled is credited to the shopper's wallet. Both are
    /// dropped. Sessions already claimed for settlement are left alone.
    pub async fn expire(&self, retrieval_ref: &str) {
        let expired = self
            .sessions
            .remove_if(retrieval_ref, |_, session| session.state() == QrState::Pending);
        if let Some((_, session)) = expired {
            session.state.send_replace(QrState::TimedOut);
            warn!(retrieval_ref, "QR payment timed out");
            self.publish(retrieval_ref, QrState::TimedOut).await;
            return;
        }

        let unsettled = self
            .sessions
            .get(retrieval_ref)
            .filter(|session| session.state() == QrState::Confirmed)
            .map(|session| session.user_id);
        if let Some(user_id) = unsettled {
            warn!(retrieval_ref, %user_id, "confirmed QR payment was never settled");
            self.credit_unsettled(retrieval_ref, user_id, "was not settled before the code expired")
                .await;
        }
    }

    /// Claims a confirmed session and returns its amount as wallet credit.
    /// Returns `None` when another caller already claimed it or the credit
    /// could not be written.
    pub async fn credit_unsettled(
        &self,
        retrieval_ref: &str,
        user_id: Uuid,
        why: &str,
    ) -> Option<BalanceChange> {
        let session = match self.claim(retrieval_ref, user_id) {
            Ok(session) => session,
            Err(e) => {
                warn!(retrieval_ref, error = %e, "QR session already claimed");
                return None;
            }
        };
        let credited = self
            .credit_to_wallet(&session, format!("NETS payment {} {}", retrieval_ref, why))
            .await;
        self.discard(retrieval_ref);

        match credited {
            Ok(change) => {
                info!(%user_id, retrieval_ref, new_balance = %change.new, "unsettled QR payment credited to wallet");
                self.event_sender
                    .send_or_log(Event::PaymentCompensated {
                        user_id,
                        method: PaymentMethod::Nets,
                        amount: session.amount,
                    })
                    .await;
                Some(change)
            }
            Err(e) => {
                error!(
                    %user_id,
                    retrieval_ref,
                    amount = %session.amount,
                    error = %e,
                    "failed to credit unsettled QR payment"
                );
                None
            }
        }
    }

    /// Money the bank already collected lands in the wallet as a top-up.
    async fn credit_to_wallet(
        &self,
        session: &QrSession,
        details: String,
    ) -> Result<BalanceChange, ServiceError> {
        let entry = NewLogEntry::new(session.user_id, TransactionAction::WalletTopup, session.amount)
            .details(details);
        self.ledger
            .credit_wallet(session.user_id, session.amount, entry)
            .await
    }

    /// Owned session snapshot; other users' sessions are invisible.
    pub fn session(&self, retrieval_ref: &str, user_id: Uuid) -> Result<QrSession, ServiceError> {
        let session = self
            .sessions
            .get(retrieval_ref)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                ServiceError::NotFound("QR payment session not found or expired.".to_string())
            })?;
        if session.user_id != user_id {
            return Err(ServiceError::Forbidden(
                "QR payment session belongs to another user.".to_string(),
            ));
        }
        Ok(session)
    }

    pub fn subscribe(
        &self,
        retrieval_ref: &str,
        user_id: Uuid,
    ) -> Result<watch::Receiver<QrState>, ServiceError> {
        Ok(self.session(retrieval_ref, user_id)?.state.subscribe())
    }

    /// Applies a pushed or polled status. Unknown references and signals that
    /// do not move the state machine are ignored, so duplicate pushes are
    /// harmless.
    #[instrument(skip(self))]
    pub async fn apply_report(&self, report: &QrStatusReport) -> Option<QrState> {
        let next = {
            let session = self.sessions.get(&report.retrieval_ref)?;
            let next = session.state().on_signal(report.signal())?;
            session.state.send_replace(next);
            next
        };
        if next == QrState::Failed {
            self.sessions.remove(&report.retrieval_ref);
        }
        info!(retrieval_ref = %report.retrieval_ref, state = %next, "QR state changed");
        self.publish(&report.retrieval_ref, next).await;
        Some(next)
    }

    /// Pull fallback: asks the gateway when no push has arrived yet.
    pub async fn refresh(&self, retrieval_ref: &str, user_id: Uuid) -> Result<QrState, ServiceError> {
        let session = self.session(retrieval_ref, user_id)?;
        if session.state() != QrState::Pending {
            return Ok(session.state());
        }
        let report = self.gateway.query_status(retrieval_ref).await?;
        Ok(self.apply_report(&report).await.unwrap_or(QrState::Pending))
    }

    /// Moves a confirmed session to `Settled`. Exactly one caller wins.
    pub fn claim(&self, retrieval_ref: &str, user_id: Uuid) -> Result<QrSession, ServiceError> {
        let mut entry = self.sessions.get_mut(retrieval_ref).ok_or_else(|| {
            ServiceError::NotFound("QR payment session not found or expired.".to_string())
        })?;
        if entry.user_id != user_id {
            return Err(ServiceError::Forbidden(
                "QR payment session belongs to another user.".to_string(),
            ));
        }
        match entry.state() {
            QrState::Confirmed => {
                entry.state.send_replace(QrState::Settled);
                Ok(entry.value().clone())
            }
            other => Err(not_payable(other)),
        }
    }

    /// Drops a settled session once its order exists.
    pub async fn finish(&self, retrieval_ref: &str) {
        if self.sessions.remove(retrieval_ref).is_some() {
            self.publish(retrieval_ref, QrState::Settled).await;
        }
    }

    /// Drops a claimed session whose money went back to the wallet.
    pub fn discard(&self, retrieval_ref: &str) {
        self.sessions
            .remove_if(retrieval_ref, |_, session| session.state() == QrState::Settled);
    }

    async fn publish(&self, retrieval_ref: &str, state: QrState) {
        self.event_sender
            .send_or_log(Event::QrPaymentStateChanged {
                retrieval_ref: retrieval_ref.to_string(),
                state: state.to_string(),
            })
            .await;
    }
}

fn not_payable(state: QrState) -> ServiceError {
    match state {
        QrState::Pending => {
            ServiceError::PaymentFailed("Payment has not been confirmed yet.".to_string())
        }
        QrState::Failed => ServiceError::PaymentFailed("NETS payment failed.".to_string()),
        QrState::TimedOut => ServiceError::PaymentFailed(
            "NETS payment timed out. Please generate a new QR code.".to_string(),
        ),
        QrState::Settled | QrState::Confirmed => {
            ServiceError::Conflict("Payment is already being processed.".to_string())
        }
    }
}

#[async_trait]
impl PaymentAdapter for QrAdapter {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Nets
    }

    async fn validate(&self, user_id: Uuid, request: &PaymentRequest) -> Result<(), ServiceError> {
        let PaymentRequest::Nets { retrieval_ref } = request else {
            return Err(super::wrong_request(self.method()));
        };
        match self.refresh(retrieval_ref, user_id).await? {
            QrState::Confirmed => Ok(()),
            other => Err(not_payable(other)),
        }
    }

    async fn authorize(
        &self,
        ctx: &PaymentContext,
        request: &PaymentRequest,
    ) -> Result<PaymentOutcome, ServiceError> {
        let PaymentRequest::Nets { retrieval_ref } = request else {
            return Err(super::wrong_request(self.method()));
        };
        if self.session(retrieval_ref, ctx.user_id)?.amount != ctx.amount {
            return Err(ServiceError::PaymentFailed(
                "Your cart changed after the QR code was generated.".to_string(),
            ));
        }
        let session = self.claim(retrieval_ref, ctx.user_id)?;
        Ok(PaymentOutcome::approved(Some(session.retrieval_ref)))
    }

    /// The bank already moved the money, so it is returned as wallet credit.
    async fn compensate(
        &self,
        ctx: &PaymentContext,
        outcome: &PaymentOutcome,
    ) -> Result<(), ServiceError> {
        let reference = outcome.external_ref.as_deref().unwrap_or("without reference");
        let entry = NewLogEntry::new(ctx.user_id, TransactionAction::WalletTopup, ctx.amount)
            .details(format!("NETS payment {} credited after a cancelled checkout", reference));
        let change = self.ledger.credit_wallet(ctx.user_id, ctx.amount, entry).await?;
        if let Some(reference) = outcome.external_ref.as_deref() {
            self.discard(reference);
        }
        info!(user_id = %ctx.user_id, new_balance = %change.new, "QR payment credited to wallet");
        Ok(())
    }
}
