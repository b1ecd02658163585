//! Payment adapters. The settlement orchestrator talks to every method
//! through [`PaymentAdapter`] and never looks at method-specific fields.

pub mod card;
pub mod hosted;
pub mod qr;
pub mod wallet;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::order::PaymentMethod,
    errors::ServiceError,
    services::{accounts::BalanceChange, pricing::round_money},
};

pub use card::{CardAdapter, CardDetails};
pub use hosted::{HostedAdapter, HostedPaymentGateway, PaypalClient};
pub use qr::{NetsClient, QrAdapter, QrPaymentGateway, QrState};
pub use wallet::WalletAdapter;

/// Method-specific input supplied by the shopper.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PaymentRequest {
    Wallet,
    Card(CardDetails),
    /// Capture of a previously approved hosted-redirect intent
    Paypal { intent_id: String },
    /// Settlement of a confirmed QR code
    Nets { retrieval_ref: String },
}

impl PaymentRequest {
    pub fn method(&self) -> PaymentMethod {
        match self {
            Self::Wallet => PaymentMethod::Wallet,
            Self::Card(_) => PaymentMethod::Card,
            Self::Paypal { .. } => PaymentMethod::Paypal,
            Self::Nets { .. } => PaymentMethod::Nets,
        }
    }
}

/// What an adapter needs to know about the charge.
#[derive(Debug, Clone)]
pub struct PaymentContext {
    pub user_id: Uuid,
    pub amount: Decimal,
    /// Correlates log lines of one settlement attempt
    pub attempt_id: Uuid,
}

impl PaymentContext {
    pub fn new(user_id: Uuid, amount: Decimal) -> Self {
        Self {
            user_id,
            amount,
            attempt_id: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentOutcome {
    pub success: bool,
    pub external_ref: Option<String>,
    pub message: Option<String>,
    /// Set when the adapter moved money out of the wallet
    pub wallet_change: Option<BalanceChange>,
}

impl PaymentOutcome {
    pub fn approved(external_ref: Option<String>) -> Self {
        Self {
            success: true,
            external_ref,
            message: None,
            wallet_change: None,
        }
    }

    pub fn declined(message: impl Into<String>) -> Self {
        Self {
            success: false,
            external_ref: None,
            message: Some(message.into()),
            wallet_change: None,
        }
    }
}

#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Preconditions that do not depend on the final amount, checked before
    /// pricing.
    async fn validate(&self, user_id: Uuid, request: &PaymentRequest) -> Result<(), ServiceError>;

    /// Collects `ctx.amount`. A declined outcome means nothing was collected.
    async fn authorize(
        &self,
        ctx: &PaymentContext,
        request: &PaymentRequest,
    ) -> Result<PaymentOutcome, ServiceError>;

    /// Returns funds collected by [`PaymentAdapter::authorize`] after a later
    /// stage failed.
    async fn compensate(
        &self,
        ctx: &PaymentContext,
        outcome: &PaymentOutcome,
    ) -> Result<(), ServiceError>;
}

/// The four adapters, selected by the request's method.
#[derive(Clone)]
pub struct PaymentAdapters {
    pub wallet: Arc<WalletAdapter>,
    pub card: Arc<CardAdapter>,
    pub hosted: Arc<HostedAdapter>,
    pub qr: Arc<QrAdapter>,
}

impl PaymentAdapters {
    pub fn for_request(&self, request: &PaymentRequest) -> Arc<dyn PaymentAdapter> {
        match request {
            PaymentRequest::Wallet => self.wallet.clone(),
            PaymentRequest::Card(_) => self.card.clone(),
            PaymentRequest::Paypal { .. } => self.hosted.clone(),
            PaymentRequest::Nets { .. } => self.qr.clone(),
        }
    }
}

/// Formats an amount the way both gateways expect it: two fraction digits.
pub fn gateway_amount(amount: Decimal) -> String {
    format!("{:.2}", round_money(amount))
}

fn wrong_request(method: PaymentMethod) -> ServiceError {
    ServiceError::InvalidInput(format!("Payment details do not match method {}", method))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn gateway_amounts_have_two_fraction_digits() {
        assert_eq!(gateway_amount(dec!(6.36)), "6.36");
        assert_eq!(gateway_amount(dec!(5)), "5.00");
        assert_eq!(gateway_amount(dec!(4.995)), "5.00");
    }

    #[test]
    fn payment_request_is_tagged_by_method() {
        let request: PaymentRequest =
            serde_json::from_str(r#"{"method":"nets","retrieval_ref":"abc"}"#).unwrap();
        assert_eq!(request.method(), PaymentMethod::Nets);

        let request: PaymentRequest = serde_json::from_str(r#"{"method":"wallet"}"#).unwrap();
        assert_eq!(request.method(), PaymentMethod::Wallet);
    }
}
