use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::{str::FromStr, sync::Arc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity, OrderLineSnapshot, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
        refund_item::{self, Entity as RefundItemEntity},
        refund_request::{self, Entity as RefundRequestEntity},
        user_account,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Order with its decoded line snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    #[serde(flatten)]
    pub order: order::Model,
    pub lines: Vec<OrderLineSnapshot>,
}

impl TryFrom<order::Model> for OrderView {
    type Error = ServiceError;

    fn try_from(order: order::Model) -> Result<Self, Self::Error> {
        let lines = order.lines()?;
        Ok(Self { order, lines })
    }
}

/// Read side of the order ledger plus the few admin mutations orders allow.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Orders of one user, newest first.
    #[instrument(skip(self))]
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<OrderView>, ServiceError> {
        OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(OrderView::try_from)
            .collect()
    }

    /// Returns the order when the requester owns it or is an admin.
    #[instrument(skip(self, requester), fields(requester = %requester.id))]
    pub async fn get_order(
        &self,
        order_id: Uuid,
        requester: &user_account::Model,
    ) -> Result<OrderView, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        if order.user_id != requester.id && !requester.is_admin() {
            return Err(ServiceError::Forbidden(
                "You are not authorized to view this order.".to_string(),
            ));
        }
        OrderView::try_from(order)
    }

    #[instrument(skip(self))]
    pub async fn list_all(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderView>, u64), ServiceError> {
        let paginator = OrderEntity::find()
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));
        let total = paginator.num_items().await?;
        let orders = paginator
            .fetch_page(page.saturating_sub(1))
            .await?
            .into_iter()
            .map(OrderView::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((orders, total))
    }

    /// Admin status change. Only the fulfilment statuses can be set by hand;
    /// `cancelled` is reserved for settlement compensation and is final.
    #[instrument(skip(self))]
    pub async fn update_status(&self, order_id: Uuid, status: &str) -> Result<order::Model, ServiceError> {
        let new_status = OrderStatus::from_str(status.trim())
            .ok()
            .filter(|s| *s != OrderStatus::Cancelled)
            .ok_or_else(|| ServiceError::ValidationError("Invalid status.".to_string()))?;

        let order = find_order(&*self.db, order_id).await?;
        let old_status = order.status;
        if old_status == OrderStatus::Cancelled {
            return Err(ServiceError::InvalidOperation(
                "Cancelled orders cannot change status.".to_string(),
            ));
        }
        if old_status == new_status {
            return Ok(order);
        }

        let mut active: order::ActiveModel = order.into();
        active.status = Set(new_status);
        let updated = active.update(&*self.db).await?;

        info!(%order_id, %old_status, %new_status, "order status updated");
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            })
            .await;
        Ok(updated)
    }

    /// Deletes the order with its items and every refund request against it.
    #[instrument(skip(self))]
    pub async fn delete_order(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        find_order(&txn, order_id).await?;

        let request_ids: Vec<Uuid> = RefundRequestEntity::find()
            .filter(refund_request::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        let item_ids: Vec<Uuid> = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect();

        if !request_ids.is_empty() || !item_ids.is_empty() {
            RefundItemEntity::delete_many()
                .filter(
                    refund_item::Column::RefundRequestId
                        .is_in(request_ids.clone())
                        .or(refund_item::Column::OrderItemId.is_in(item_ids)),
                )
                .exec(&txn)
                .await?;
        }
        RefundRequestEntity::delete_many()
            .filter(refund_request::Column::OrderId.eq(order_id))
            .exec(&txn)
            .await?;
        OrderItemEntity::delete_many()
            .filter(order_item::Column::OrderId.eq(order_id))
            .exec(&txn)
            .await?;
        OrderEntity::delete_by_id(order_id).exec(&txn).await?;
        txn.commit().await?;

        warn!(%order_id, refund_requests = request_ids.len(), "order deleted");
        self.event_sender
            .send_or_log(Event::OrderDeleted(order_id))
            .await;
        Ok(())
    }
}

pub async fn find_order<C>(conn: &C, order_id: Uuid) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    OrderEntity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound("Order not found.".to_string()))
}

/// Returns the normalized lines of an order, creating them from the snapshot
/// on first use. Calling it again returns the existing rows.
pub async fn materialize_items<C>(
    conn: &C,
    order: &order::Model,
) -> Result<Vec<order_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    let existing = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order.id))
        .all(conn)
        .await?;
    if !existing.is_empty() {
        return Ok(existing);
    }

    let now = Utc::now();
    let mut items = Vec::new();
    for line in order.lines()? {
        let item = order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(line.product_id),
            name: Set(line.name),
            unit_price: Set(line.unit_price),
            quantity: Set(line.quantity),
            refunded_quantity: Set(0),
            created_at: Set(now),
        }
        .insert(conn)
        .await?;
        items.push(item);
    }
    Ok(items)
}
