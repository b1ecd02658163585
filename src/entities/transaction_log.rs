use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Append-only audit row for every balance-affecting event.
///
/// Balances are recorded in the unit of the affected ledger: currency for
/// payments, refunds and top-ups; points for earn and spend entries.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transaction_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub action: TransactionAction,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub previous_balance: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub new_balance: Decimal,
    #[sea_orm(nullable)]
    pub reference_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub details: Option<String>,
    pub suspicious: bool,
    #[sea_orm(nullable)]
    pub suspicious_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionAction {
    #[sea_orm(string_value = "PAYMENT")]
    Payment,
    #[sea_orm(string_value = "POINTS_EARN")]
    PointsEarn,
    #[sea_orm(string_value = "POINTS_SPEND")]
    PointsSpend,
    #[sea_orm(string_value = "REFUND")]
    Refund,
    #[sea_orm(string_value = "WALLET_TOPUP")]
    WalletTopup,
}
