use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{PaymentAdapter, PaymentContext, PaymentOutcome, PaymentRequest};
use crate::{
    entities::{order::PaymentMethod, transaction_log::TransactionAction},
    errors::ServiceError,
    services::{
        accounts::{debit_wallet, find_user},
        transaction_log::{NewLogEntry, TransactionLogService},
    },
};

/// Pays from the stored wallet balance. The debit is a single conditional
/// update, so two concurrent checkouts cannot both spend the same funds.
#[derive(Clone)]
pub struct WalletAdapter {
    db: Arc<DatabaseConnection>,
    ledger: TransactionLogService,
}

impl WalletAdapter {
    pub fn new(db: Arc<DatabaseConnection>, ledger: TransactionLogService) -> Self {
        Self { db, ledger }
    }
}

#[async_trait]
impl PaymentAdapter for WalletAdapter {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Wallet
    }

    /// The balance itself is checked by the conditional debit in
    /// [`PaymentAdapter::authorize`], once the amount is known.
    async fn validate(&self, user_id: Uuid, request: &PaymentRequest) -> Result<(), ServiceError> {
        if !matches!(request, PaymentRequest::Wallet) {
            return Err(super::wrong_request(self.method()));
        }
        find_user(&*self.db, user_id).await.map(|_| ())
    }

    #[instrument(skip(self, request), fields(user_id = %ctx.user_id, amount = %ctx.amount))]
    async fn authorize(
        &self,
        ctx: &PaymentContext,
        request: &PaymentRequest,
    ) -> Result<PaymentOutcome, ServiceError> {
        if !matches!(request, PaymentRequest::Wallet) {
            return Err(super::wrong_request(self.method()));
        }
        let change = debit_wallet(&*self.db, ctx.user_id, ctx.amount).await?;
        info!(new_balance = %change.new, "wallet debited");
        Ok(PaymentOutcome {
            wallet_change: Some(change),
            ..PaymentOutcome::approved(None)
        })
    }

    async fn compensate(
        &self,
        ctx: &PaymentContext,
        _outcome: &PaymentOutcome,
    ) -> Result<(), ServiceError> {
        let entry = NewLogEntry::new(ctx.user_id, TransactionAction::WalletTopup, ctx.amount)
            .details(format!("Wallet debit reversed for checkout attempt {}", ctx.attempt_id));
        let change = self.ledger.credit_wallet(ctx.user_id, ctx.amount, entry).await?;
        info!(user_id = %ctx.user_id, new_balance = %change.new, "wallet debit reversed");
        Ok(())
    }
}
