//! Card payments. Cards are checked locally for format only; no card network
//! is contacted, so a well-formed card always authorizes.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{PaymentAdapter, PaymentContext, PaymentOutcome, PaymentRequest};
use crate::{entities::order::PaymentMethod, errors::ServiceError};

static CARD_NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{13,19}$").unwrap());
static EXPIRY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-1][0-9]/[0-9]{2}$").unwrap());
static CVV_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{3,4}$").unwrap());

#[derive(Clone, Deserialize, Serialize, ToSchema)]
pub struct CardDetails {
    pub card_name: String,
    #[schema(example = "4111 1111 1111 1111")]
    pub card_number: String,
    #[schema(example = "12/29")]
    pub card_expiry: String,
    #[schema(example = "123")]
    pub card_cvv: String,
}

impl std::fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardDetails")
            .field("card_name", &self.card_name)
            .field("last4", &self.last4())
            .finish()
    }
}

impl CardDetails {
    fn digits(&self) -> String {
        self.card_number.split_whitespace().collect()
    }

    pub fn last4(&self) -> String {
        let digits: Vec<char> = self.digits().chars().collect();
        let start = digits.len().saturating_sub(4);
        digits[start..].iter().collect()
    }

    /// Returns the first user-facing problem with the card, if any.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.card_name.trim().is_empty() {
            return Err(invalid("Please enter the name on the card."));
        }
        if !CARD_NUMBER_RE.is_match(&self.digits()) {
            return Err(invalid("Please enter a valid card number."));
        }
        if !EXPIRY_RE.is_match(self.card_expiry.trim()) {
            return Err(invalid("Please enter the expiry date as MM/YY."));
        }
        if !CVV_RE.is_match(self.card_cvv.trim()) {
            return Err(invalid("Please enter a valid CVV."));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ServiceError {
    ServiceError::ValidationError(message.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct CardAdapter;

#[async_trait]
impl PaymentAdapter for CardAdapter {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Card
    }

    async fn validate(&self, _user_id: Uuid, request: &PaymentRequest) -> Result<(), ServiceError> {
        match request {
            PaymentRequest::Card(card) => card.validate(),
            _ => Err(super::wrong_request(self.method())),
        }
    }

    async fn authorize(
        &self,
        ctx: &PaymentContext,
        request: &PaymentRequest,
    ) -> Result<PaymentOutcome, ServiceError> {
        let PaymentRequest::Card(card) = request else {
            return Err(super::wrong_request(self.method()));
        };
        card.validate()?;
        let reference = format!("card-{}", Uuid::new_v4().simple());
        info!(user_id = %ctx.user_id, amount = %ctx.amount, last4 = %card.last4(), "card authorized");
        Ok(PaymentOutcome::approved(Some(reference)))
    }

    async fn compensate(
        &self,
        ctx: &PaymentContext,
        outcome: &PaymentOutcome,
    ) -> Result<(), ServiceError> {
        info!(
            user_id = %ctx.user_id,
            amount = %ctx.amount,
            reference = ?outcome.external_ref,
            "card charge reversed"
        );
        Ok(())
    }
}
