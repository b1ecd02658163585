use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::user_account::MembershipPlan;

/// A settled purchase. Everything except `status` is a snapshot taken at
/// commit time and is never recomputed from the live catalog.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    /// JSON array of [`OrderLineSnapshot`]
    pub items: Json,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub promo_savings: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub membership_savings: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub loyalty_discount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_savings: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total: Decimal,
    pub points_spent: i64,
    pub points_earned: i64,
    pub membership_plan: MembershipPlan,
    pub status: OrderStatus,
    pub delivery_method: DeliveryMethod,
    #[sea_orm(nullable)]
    pub delivery_address: Option<String>,
    #[sea_orm(nullable)]
    pub pickup_outlet: Option<String>,
    pub payment_method: PaymentMethod,
    #[sea_orm(nullable, unique)]
    pub payment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub confirmed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// One purchased line as captured in `orders.items`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineSnapshot {
    pub product_id: Uuid,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl Model {
    /// Decodes the item snapshot.
    pub fn lines(&self) -> Result<Vec<OrderLineSnapshot>, serde_json::Error> {
        serde_json::from_value(self.items.clone())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user_account::Entity",
        from = "Column::UserId",
        to = "super::user_account::Column::Id"
    )]
    User,
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::refund_request::Entity")]
    RefundRequests,
}

impl Related<super::user_account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::refund_request::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RefundRequests.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(now);
            }
        }
        active_model.updated_at = Set(now);

        Ok(active_model)
    }
}

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
pub enum OrderStatus {
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "completed")]
    Completed,
    /// Set only by the settlement compensation path
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

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
pub enum DeliveryMethod {
    #[sea_orm(string_value = "delivery")]
    Delivery,
    #[sea_orm(string_value = "pickup")]
    Pickup,
}

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
pub enum PaymentMethod {
    #[sea_orm(string_value = "card")]
    Card,
    #[sea_orm(string_value = "paypal")]
    Paypal,
    #[sea_orm(string_value = "wallet")]
    Wallet,
    #[sea_orm(string_value = "nets")]
    Nets,
}
