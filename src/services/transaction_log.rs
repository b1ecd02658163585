use crate::{
    entities::transaction_log::{self, Entity as TransactionLog, TransactionAction},
    errors::ServiceError,
    events::EventSender,
    services::{
        accounts::{self, BalanceChange},
        fraud::{self, FraudCheck, FraudMonitor, FraudVerdict, Strike},
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Default page size for the admin listing.
pub const DEFAULT_PAGE_SIZE: u64 = 20;

/// A balance-affecting event to append to the log.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub user_id: Uuid,
    pub action: TransactionAction,
    pub amount: Decimal,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    pub reference_id: Option<Uuid>,
    pub details: Option<String>,
}

impl NewLogEntry {
    pub fn new(user_id: Uuid, action: TransactionAction, amount: Decimal) -> Self {
        Self {
            user_id,
            action,
            amount,
            previous_balance: Decimal::ZERO,
            new_balance: Decimal::ZERO,
            reference_id: None,
            details: None,
        }
    }

    pub fn balances(mut self, previous: Decimal, new: Decimal) -> Self {
        self.previous_balance = previous;
        self.new_balance = new;
        self
    }

    pub fn reference(mut self, reference_id: Uuid) -> Self {
        self.reference_id = Some(reference_id);
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedEntry {
    pub entry: transaction_log::Model,
    pub strike: Option<Strike>,
}

/// Append-only audit log. Every entry is screened by the fraud monitor
/// before it is written.
#[derive(Clone)]
pub struct TransactionLogService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    monitor: FraudMonitor,
}

impl TransactionLogService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        monitor: FraudMonitor,
    ) -> Self {
        Self {
            db,
            event_sender,
            monitor,
        }
    }

    /// Evaluates and appends an entry on the given connection, applying a
    /// strike to the account when the entry looks suspicious.
    #[instrument(skip(self, conn), fields(user_id = %entry.user_id, action = %entry.action))]
    pub async fn record<C>(&self, conn: &C, entry: NewLogEntry) -> Result<RecordedEntry, ServiceError>
    where
        C: ConnectionTrait,
    {
        let verdict = self
            .monitor
            .evaluate(
                conn,
                &FraudCheck {
                    user_id: entry.user_id,
                    action: entry.action,
                    amount: entry.amount,
                    at: Utc::now(),
                },
            )
            .await?;

        let model = transaction_log::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(entry.user_id),
            action: Set(entry.action),
            amount: Set(entry.amount),
            previous_balance: Set(entry.previous_balance),
            new_balance: Set(entry.new_balance),
            reference_id: Set(entry.reference_id),
            details: Set(entry.details),
            suspicious: Set(verdict.suspicious),
            suspicious_reason: Set(verdict.reason.clone()),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?;

        let strike = match verdict.reason.as_deref() {
            Some(reason) if verdict.suspicious => {
                warn!(entry_id = %model.id, reason, "suspicious ledger entry");
                let (strike, event) = fraud::apply_strike(conn, model.user_id, reason).await?;
                self.event_sender.send_or_log(event).await;
                Some(strike)
            }
            _ => None,
        };

        info!(entry_id = %model.id, amount = %model.amount, "ledger entry recorded");
        Ok(RecordedEntry {
            entry: model,
            strike,
        })
    }

    /// Credits the wallet and records `entry` with the resulting balances in
    /// one transaction.
    pub async fn credit_wallet(
        &self,
        user_id: Uuid,
        amount: Decimal,
        entry: NewLogEntry,
    ) -> Result<BalanceChange, ServiceError> {
        let txn = self.db.begin().await?;
        let change = accounts::credit_wallet(&txn, user_id, amount).await?;
        self.record(&txn, entry.balances(change.previous, change.new))
            .await?;
        txn.commit().await?;
        Ok(change)
    }

    /// Runs the fraud rules for a hypothetical event without recording it.
    pub async fn check(&self, check: &FraudCheck) -> Result<FraudVerdict, ServiceError> {
        self.monitor.evaluate(&*self.db, check).await
    }

    /// Newest first. `page` is 1-based.
    pub async fn list_all(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<transaction_log::Model>, u64), ServiceError> {
        let paginator = TransactionLog::find()
            .order_by_desc(transaction_log::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));
        let total = paginator.num_items().await?;
        let entries = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((entries, total))
    }

    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<transaction_log::Model>, u64), ServiceError> {
        let paginator = TransactionLog::find()
            .filter(transaction_log::Column::UserId.eq(user_id))
            .order_by_desc(transaction_log::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));
        let total = paginator.num_items().await?;
        let entries = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((entries, total))
    }
}
