//! Velocity rules evaluated on every balance-affecting event, plus the
//! per-account two-strike state (first suspicious event warns, the next one
//! disables the account).

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    config::FraudSettings,
    entities::{
        transaction_log::{self, Entity as TransactionLog, TransactionAction},
        user_account::{self, Entity as UserAccount},
    },
    errors::ServiceError,
    events::Event,
};

/// A balance-affecting event about to be recorded.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FraudCheck {
    pub user_id: Uuid,
    #[schema(value_type = String, example = "PAYMENT")]
    pub action: TransactionAction,
    #[schema(value_type = String, example = "12.50")]
    pub amount: Decimal,
    #[serde(default = "Utc::now")]
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FraudVerdict {
    pub suspicious: bool,
    pub reason: Option<String>,
}

impl FraudVerdict {
    fn flag(reason: impl Into<String>) -> Self {
        Self {
            suspicious: true,
            reason: Some(reason.into()),
        }
    }
}

/// Outcome of applying a suspicious verdict to an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strike {
    Warned,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct FraudMonitor {
    settings: FraudSettings,
}

impl FraudMonitor {
    pub fn new(settings: FraudSettings) -> Self {
        Self { settings }
    }

    /// Evaluates the rules against the user's recorded history. The event
    /// being checked is not yet in the log and is counted explicitly.
    #[instrument(skip(self, conn))]
    pub async fn evaluate<C>(&self, conn: &C, check: &FraudCheck) -> Result<FraudVerdict, ServiceError>
    where
        C: ConnectionTrait,
    {
        let s = &self.settings;
        match check.action {
            TransactionAction::Payment => {
                let recent = count_since(
                    conn,
                    check.user_id,
                    TransactionAction::Payment,
                    check.at - Duration::seconds(s.payment_burst_window_secs),
                )
                .await?;
                if recent + 1 >= s.payment_burst_count {
                    return Ok(FraudVerdict::flag(format!(
                        "{} payments within {} seconds",
                        recent + 1,
                        s.payment_burst_window_secs
                    )));
                }

                let history =
                    amounts_since(conn, check.user_id, TransactionAction::Payment, None).await?;
                if history.len() >= s.order_spike_min_history {
                    let average =
                        history.iter().copied().sum::<Decimal>() / Decimal::from(history.len());
                    if average > Decimal::ZERO && check.amount > average * s.order_spike_multiplier
                    {
                        return Ok(FraudVerdict::flag(format!(
                            "Payment of {} far exceeds the usual spend of {}",
                            check.amount.round_dp(2),
                            average.round_dp(2)
                        )));
                    }
                }
            }
            TransactionAction::Refund => {
                let recent = count_since(
                    conn,
                    check.user_id,
                    TransactionAction::Refund,
                    check.at - Duration::seconds(s.refund_burst_window_secs),
                )
                .await?;
                if recent + 1 >= s.refund_burst_count {
                    return Ok(FraudVerdict::flag(format!(
                        "{} refunds within {} seconds",
                        recent + 1,
                        s.refund_burst_window_secs
                    )));
                }

                let window_start = check.at - Duration::days(s.refund_ratio_window_days);
                let refunded: Decimal =
                    amounts_since(conn, check.user_id, TransactionAction::Refund, Some(window_start))
                        .await?
                        .into_iter()
                        .sum::<Decimal>()
                        + check.amount;
                let spent: Decimal =
                    amounts_since(conn, check.user_id, TransactionAction::Payment, Some(window_start))
                        .await?
                        .into_iter()
                        .sum();
                if spent <= Decimal::ZERO || refunded / spent > s.refund_ratio_threshold {
                    return Ok(FraudVerdict::flag(format!(
                        "Refunds of {} against spend of {} in {} days",
                        refunded.round_dp(2),
                        spent.round_dp(2),
                        s.refund_ratio_window_days
                    )));
                }

                let topups = count_since(
                    conn,
                    check.user_id,
                    TransactionAction::WalletTopup,
                    check.at - Duration::seconds(s.topup_refund_window_secs),
                )
                .await?;
                if topups > 0 {
                    return Ok(FraudVerdict::flag("Refund requested shortly after a wallet top-up"));
                }
            }
            TransactionAction::PointsEarn
            | TransactionAction::PointsSpend
            | TransactionAction::WalletTopup => {}
        }

        Ok(FraudVerdict::default())
    }
}

/// Applies a suspicious verdict to the account: warns on the first offense,
/// disables once a warning is already on record.
pub async fn apply_strike<C>(
    conn: &C,
    user_id: Uuid,
    reason: &str,
) -> Result<(Strike, Event), ServiceError>
where
    C: ConnectionTrait,
{
    let user = UserAccount::find_by_id(user_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("User {} not found", user_id)))?;

    let already_warned = user.fraud_warning_sent_at.is_some();
    let mut active: user_account::ActiveModel = user.into();
    active.updated_at = Set(Utc::now());

    if already_warned {
        active.is_disabled = Set(true);
        active.update(conn).await?;
        warn!(%user_id, reason, "second suspicious event, account disabled");
        Ok((
            Strike::Disabled,
            Event::AccountDisabled {
                user_id,
                reason: reason.to_string(),
            },
        ))
    } else {
        active.fraud_warning_sent_at = Set(Some(Utc::now()));
        active.fraud_warning_reason = Set(Some(reason.to_string()));
        active.update(conn).await?;
        warn!(%user_id, reason, "suspicious activity warning issued");
        Ok((
            Strike::Warned,
            Event::AccountWarned {
                user_id,
                reason: reason.to_string(),
            },
        ))
    }
}

async fn count_since<C>(
    conn: &C,
    user_id: Uuid,
    action: TransactionAction,
    since: DateTime<Utc>,
) -> Result<u64, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(TransactionLog::find()
        .filter(transaction_log::Column::UserId.eq(user_id))
        .filter(transaction_log::Column::Action.eq(action))
        .filter(transaction_log::Column::CreatedAt.gte(since))
        .count(conn)
        .await?)
}

async fn amounts_since<C>(
    conn: &C,
    user_id: Uuid,
    action: TransactionAction,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<Decimal>, ServiceError>
where
    C: ConnectionTrait,
{
    let mut query = TransactionLog::find()
        .filter(transaction_log::Column::UserId.eq(user_id))
        .filter(transaction_log::Column::Action.eq(action));
    if let Some(since) = since {
        query = query.filter(transaction_log::Column::CreatedAt.gte(since));
    }
    Ok(query
        .order_by_asc(transaction_log::Column::CreatedAt)
        .all(conn)
        .await?
        .into_iter()
        .map(|entry| entry.amount)
        .collect())
}
