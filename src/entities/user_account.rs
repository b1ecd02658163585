use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Shopper or administrator account, carrying the membership plan and both
/// balances (wallet in minor units, loyalty points).
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub username: String,
    #[sea_orm(unique)]
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: UserRole,
    pub plan: MembershipPlan,
    pub wallet_cents: i64,
    pub loyalty_points: i64,
    #[sea_orm(nullable)]
    pub refund_flag_until: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub fraud_warning_sent_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub fraud_warning_reason: Option<String>,
    pub is_disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn wallet_balance(&self) -> Decimal {
        Decimal::new(self.wallet_cents, 2)
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::cart_line::Entity")]
    CartLines,
    #[sea_orm(has_many = "super::order::Entity")]
    Orders,
}

impl Related<super::cart_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CartLines.def()
    }
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Orders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum UserRole {
    #[sea_orm(string_value = "user")]
    User,
    #[sea_orm(string_value = "admin")]
    Admin,
}

/// Membership tier; the discount applies to the post-promotion remainder.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MembershipPlan {
    #[sea_orm(string_value = "basic")]
    Basic,
    #[sea_orm(string_value = "silver")]
    Silver,
    #[sea_orm(string_value = "gold")]
    Gold,
}

impl MembershipPlan {
    /// Parses a user-supplied plan key, ignoring surrounding whitespace and case.
    pub fn from_key(key: &str) -> Option<Self> {
        key.trim().parse().ok()
    }

    pub fn discount_percent(&self) -> Decimal {
        match self {
            Self::Basic => Decimal::ZERO,
            Self::Silver => dec!(5),
            Self::Gold => dec!(10),
        }
    }

    pub fn monthly_price(&self) -> Decimal {
        match self {
            Self::Basic => Decimal::ZERO,
            Self::Silver => dec!(4.99),
            Self::Gold => dec!(9.99),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Basic => "Basic",
            Self::Silver => "Silver",
            Self::Gold => "Gold",
        }
    }

    pub fn perks(&self) -> &'static [&'static str] {
        match self {
            Self::Basic => &["Standard checkout"],
            Self::Silver => &["Free delivery over $50", "5% off selected items"],
            Self::Gold => &["Free delivery", "10% off storewide", "Priority support"],
        }
    }

    pub fn is_paid(&self) -> bool {
        self.monthly_price() > Decimal::ZERO
    }
}
