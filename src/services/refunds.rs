//! Refund requests against settled orders.
//!
//! A request is `pending` (or `flagged` when the shopper is refunding too
//! often) until an admin approves or denies it; both decisions are final.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::RefundSettings,
    entities::{
        order::{self, OrderStatus, PaymentMethod},
        order_item::{self, Entity as OrderItemEntity},
        refund_item::{self, Entity as RefundItemEntity},
        refund_request::{self, Entity as RefundRequestEntity, RefundDestination, RefundStatus},
        transaction_log::TransactionAction,
        user_account::{self, Entity as UserAccount},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        accounts::{credit_wallet, ensure_active, find_user, BalanceChange},
        orders::{find_order, materialize_items},
        payments::HostedAdapter,
        pricing::round_money,
        transaction_log::{NewLogEntry, TransactionLogService},
    },
};

const FLAGGED_NOTE: &str = "Auto-flagged due to frequent refunds.";

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RefundLineInput {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct RefundInput {
    pub order_id: Uuid,
    #[validate(length(min = 1, max = 1000, message = "Please provide a reason for your refund request."))]
    pub reason: String,
    pub evidence_ref: Option<String>,
    #[serde(default = "default_destination")]
    #[schema(value_type = String, example = "wallet")]
    pub destination: RefundDestination,
    /// Empty means the whole remaining order
    #[serde(default)]
    pub items: Vec<RefundLineInput>,
}

fn default_destination() -> RefundDestination {
    RefundDestination::Wallet
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundView {
    #[serde(flatten)]
    pub request: refund_request::Model,
    pub items: Vec<refund_item::Model>,
}

#[derive(Clone)]
pub struct RefundService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    ledger: TransactionLogService,
    hosted: Arc<HostedAdapter>,
    settings: RefundSettings,
}

impl RefundService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        ledger: TransactionLogService,
        hosted: Arc<HostedAdapter>,
        settings: RefundSettings,
    ) -> Self {
        Self {
            db,
            event_sender,
            ledger,
            hosted,
            settings,
        }
    }

    #[instrument(skip(self, input), fields(order_id = %input.order_id))]
    pub async fn submit(&self, user_id: Uuid, input: RefundInput) -> Result<RefundView, ServiceError> {
        input.validate()?;
        let reason = input.reason.trim().to_string();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError(
                "Please provide a reason for your refund request.".to_string(),
            ));
        }
        let now = Utc::now();

        let txn = self.db.begin().await?;
        let order = find_order(&txn, input.order_id).await?;
        if order.user_id != user_id {
            return Err(ServiceError::Forbidden(
                "You are not authorized to request a refund for this order.".to_string(),
            ));
        }
        ensure_not_cancelled(&order)?;
        if let Some(confirmed_at) = order.confirmed_at {
            if now - confirmed_at > Duration::minutes(self.settings.window_minutes) {
                return Err(ServiceError::InvalidOperation(format!(
                    "Refund requests can only be made within {} minutes after purchase confirmation.",
                    self.settings.window_minutes
                )));
            }
        }
        if order.total <= Decimal::ZERO {
            return Err(ServiceError::InvalidOperation(
                "This order is not eligible for a refund.".to_string(),
            ));
        }

        let existing = RefundRequestEntity::find()
            .filter(refund_request::Column::OrderId.eq(order.id))
            .all(&txn)
            .await?;
        if existing
            .iter()
            .any(|r| r.status.is_open() || r.status == RefundStatus::Approved)
        {
            return Err(ServiceError::Conflict(
                "A refund request already exists for this order.".to_string(),
            ));
        }

        let order_items = materialize_items(&txn, &order).await?;
        let selected = select_lines(&txn, &order_items, &input.items).await?;

        let user = find_user(&txn, user_id).await?;
        ensure_active(&user)?;
        if let Some(until) = user.refund_flag_until.filter(|until| *until > now) {
            return Err(ServiceError::Forbidden(format!(
                "Your account is currently flagged due to unusually frequent refund requests. \
                 Refunds will be available again after {}.",
                until.format("%Y-%m-%d %H:%M UTC")
            )));
        }

        let requested = if selected.is_empty() {
            order.total
        } else {
            selected
                .iter()
                .map(|(item, qty)| item.unit_price * Decimal::from(*qty))
                .sum()
        };
        let amount = round_money(requested.min(refundable_balance(&txn, &order).await?));
        if amount <= Decimal::ZERO {
            return Err(ServiceError::InvalidOperation(
                "This order has already been fully refunded.".to_string(),
            ));
        }

        let request = refund_request::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            user_id: Set(user_id),
            reason: Set(reason),
            evidence_ref: Set(input.evidence_ref.filter(|s| !s.trim().is_empty())),
            amount: Set(amount),
            destination: Set(input.destination),
            status: Set(RefundStatus::Pending),
            admin_note: Set(None),
            external_ref: Set(None),
            created_at: Set(now),
            processed_at: Set(None),
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(selected.len());
        for (item, quantity) in &selected {
            let row = refund_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                refund_request_id: Set(request.id),
                order_item_id: Set(item.id),
                product_id: Set(item.product_id),
                quantity: Set(*quantity),
                unit_price: Set(item.unit_price),
            }
            .insert(&txn)
            .await?;
            items.push(row);
        }

        let recent = RefundRequestEntity::find()
            .filter(refund_request::Column::UserId.eq(user_id))
            .filter(
                refund_request::Column::CreatedAt
                    .gte(now - Duration::hours(self.settings.velocity_window_hours)),
            )
            .count(&txn)
            .await?;

        let (request, suspended_until) = if recent >= self.settings.velocity_max_requests {
            let until = now + Duration::minutes(self.settings.suspension_minutes);
            let mut active: refund_request::ActiveModel = request.into();
            active.status = Set(RefundStatus::Flagged);
            active.admin_note = Set(Some(FLAGGED_NOTE.to_string()));
            let flagged = active.update(&txn).await?;
            suspend_refunds(&txn, user_id, until).await?;
            (flagged, Some(until))
        } else {
            (request, None)
        };
        txn.commit().await?;

        info!(refund_id = %request.id, %amount, status = %request.status, "refund requested");
        self.event_sender
            .send_or_log(Event::RefundRequested {
                refund_id: request.id,
                order_id: order.id,
                amount,
            })
            .await;
        if let Some(suspended_until) = suspended_until {
            warn!(%user_id, recent, %suspended_until, "refund velocity exceeded");
            self.event_sender
                .send_or_log(Event::RefundFlagged {
                    refund_id: request.id,
                    user_id,
                    suspended_until,
                })
                .await;
        }

        Ok(RefundView { request, items })
    }

    /// Pays out a pending or flagged request.
    #[instrument(skip(self, admin_note))]
    pub async fn approve(
        &self,
        refund_id: Uuid,
        admin_note: Option<String>,
    ) -> Result<RefundView, ServiceError> {
        let request = find_request(&*self.db, refund_id).await?;
        ensure_open(&request)?;
        let order = find_order(&*self.db, request.order_id).await?;
        ensure_not_cancelled(&order)?;

        let amount = round_money(request.amount.min(refundable_balance(&*self.db, &order).await?));
        if amount <= Decimal::ZERO {
            return Err(ServiceError::InvalidOperation(
                "Invalid refund amount.".to_string(),
            ));
        }

        let capture_ref = match (&request.destination, order.payment_method, &order.payment_ref) {
            (RefundDestination::OriginalMethod, PaymentMethod::Paypal, Some(reference)) => {
                Some(reference.clone())
            }
            _ => None,
        };
        // The gateway call cannot join the transaction, so it goes first.
        let external_ref = match &capture_ref {
            Some(reference) => {
                let refund = self.hosted.refund(reference, amount).await?;
                Some(refund.refund_id.unwrap_or_else(|| reference.clone()))
            }
            None => None,
        };

        let result = self
            .apply_approval(&request, &order, amount, external_ref.clone(), admin_note)
            .await;
        if let (Err(err), Some(reference)) = (&result, &external_ref) {
            error!(
                %refund_id,
                external_ref = %reference,
                %amount,
                error = %err,
                "gateway refund issued but approval was not recorded"
            );
        }
        let view = result?;

        info!(%refund_id, %amount, destination = %request.destination, "refund approved");
        self.event_sender
            .send_or_log(Event::RefundApproved { refund_id, amount })
            .await;
        Ok(view)
    }

    async fn apply_approval(
        &self,
        request: &refund_request::Model,
        order: &order::Model,
        amount: Decimal,
        external_ref: Option<String>,
        admin_note: Option<String>,
    ) -> Result<RefundView, ServiceError> {
        let txn = self.db.begin().await?;
        let now = Utc::now();

        let claimed = RefundRequestEntity::update_many()
            .col_expr(refund_request::Column::Status, Expr::value(RefundStatus::Approved))
            .col_expr(refund_request::Column::Amount, Expr::value(amount))
            .col_expr(refund_request::Column::ProcessedAt, Expr::value(now))
            .col_expr(refund_request::Column::ExternalRef, Expr::value(external_ref.clone()))
            .col_expr(
                refund_request::Column::AdminNote,
                Expr::value(note_or_existing(admin_note, request.admin_note.clone())),
            )
            .filter(refund_request::Column::Id.eq(request.id))
            .filter(
                refund_request::Column::Status.is_in([RefundStatus::Pending, RefundStatus::Flagged]),
            )
            .exec(&txn)
            .await?;
        if claimed.rows_affected == 0 {
            return Err(ServiceError::InvalidOperation(
                "Refund request already processed.".to_string(),
            ));
        }

        let balances = if external_ref.is_some() {
            let balance = find_user(&txn, order.user_id).await?.wallet_balance();
            BalanceChange {
                previous: balance,
                new: balance,
            }
        } else {
            credit_wallet(&txn, order.user_id, amount).await?
        };
        let details = match &external_ref {
            Some(reference) => format!("Refund to PayPal ({}) for order {}", reference, order.id),
            None => format!("Refund to wallet for order {}", order.id),
        };
        self.ledger
            .record(
                &txn,
                NewLogEntry::new(order.user_id, TransactionAction::Refund, amount)
                    .balances(balances.previous, balances.new)
                    .reference(request.id)
                    .details(details),
            )
            .await?;

        let items = RefundItemEntity::find()
            .filter(refund_item::Column::RefundRequestId.eq(request.id))
            .all(&txn)
            .await?;
        let order_items = materialize_items(&txn, order).await?;
        if items.is_empty() {
            for item in order_items {
                let quantity = item.quantity;
                let mut active: order_item::ActiveModel = item.into();
                active.refunded_quantity = Set(quantity);
                active.update(&txn).await?;
            }
        } else {
            let by_id: HashMap<Uuid, order_item::Model> =
                order_items.into_iter().map(|i| (i.id, i)).collect();
            for refunded in &items {
                let Some(item) = by_id.get(&refunded.order_item_id) else {
                    continue;
                };
                let next = (item.refunded_quantity + refunded.quantity).min(item.quantity);
                let mut active: order_item::ActiveModel = item.clone().into();
                active.refunded_quantity = Set(next);
                active.update(&txn).await?;
            }
        }

        let request = find_request(&txn, request.id).await?;
        txn.commit().await?;
        Ok(RefundView { request, items })
    }

    #[instrument(skip(self, admin_note))]
    pub async fn deny(
        &self,
        refund_id: Uuid,
        admin_note: Option<String>,
    ) -> Result<RefundView, ServiceError> {
        let request = find_request(&*self.db, refund_id).await?;
        ensure_open(&request)?;

        let result = RefundRequestEntity::update_many()
            .col_expr(refund_request::Column::Status, Expr::value(RefundStatus::Denied))
            .col_expr(refund_request::Column::ProcessedAt, Expr::value(Utc::now()))
            .col_expr(
                refund_request::Column::AdminNote,
                Expr::value(note_or_existing(admin_note, request.admin_note.clone())),
            )
            .filter(refund_request::Column::Id.eq(refund_id))
            .filter(
                refund_request::Column::Status.is_in([RefundStatus::Pending, RefundStatus::Flagged]),
            )
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::InvalidOperation(
                "Refund request already processed.".to_string(),
            ));
        }

        info!(%refund_id, "refund denied");
        self.event_sender
            .send_or_log(Event::RefundDenied(refund_id))
            .await;
        self.view(find_request(&*self.db, refund_id).await?).await
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<RefundView>, ServiceError> {
        let requests = RefundRequestEntity::find()
            .filter(refund_request::Column::UserId.eq(user_id))
            .order_by_desc(refund_request::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        self.views(requests).await
    }

    pub async fn list_all(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<RefundView>, u64), ServiceError> {
        let paginator = RefundRequestEntity::find()
            .order_by_desc(refund_request::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));
        let total = paginator.num_items().await?;
        let requests = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((self.views(requests).await?, total))
    }

    async fn view(&self, request: refund_request::Model) -> Result<RefundView, ServiceError> {
        let items = RefundItemEntity::find()
            .filter(refund_item::Column::RefundRequestId.eq(request.id))
            .all(&*self.db)
            .await?;
        Ok(RefundView { request, items })
    }

    async fn views(&self, requests: Vec<refund_request::Model>) -> Result<Vec<RefundView>, ServiceError> {
        let ids: Vec<Uuid> = requests.iter().map(|r| r.id).collect();
        let mut items: HashMap<Uuid, Vec<refund_item::Model>> = HashMap::new();
        if !ids.is_empty() {
            for item in RefundItemEntity::find()
                .filter(refund_item::Column::RefundRequestId.is_in(ids))
                .all(&*self.db)
                .await?
            {
                items.entry(item.refund_request_id).or_default().push(item);
            }
        }
        Ok(requests
            .into_iter()
            .map(|request| RefundView {
                items: items.remove(&request.id).unwrap_or_default(),
                request,
            })
            .collect())
    }
}

async fn find_request<C>(conn: &C, refund_id: Uuid) -> Result<refund_request::Model, ServiceError>
where
    C: ConnectionTrait,
{
    RefundRequestEntity::find_by_id(refund_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound("Refund request not found.".to_string()))
}

fn ensure_open(request: &refund_request::Model) -> Result<(), ServiceError> {
    if !request.status.is_open() {
        return Err(ServiceError::InvalidOperation(
            "Refund request already processed.".to_string(),
        ));
    }
    Ok(())
}

/// A cancelled order's payment was already handed back at checkout.
fn ensure_not_cancelled(order: &order::Model) -> Result<(), ServiceError> {
    if order.status == OrderStatus::Cancelled {
        return Err(ServiceError::InvalidOperation(
            "Cancelled orders cannot be refunded.".to_string(),
        ));
    }
    Ok(())
}

fn note_or_existing(note: Option<String>, existing: Option<String>) -> Option<String> {
    note.map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .or(existing)
}

/// Order total minus everything already approved against it.
async fn refundable_balance<C>(conn: &C, order: &order::Model) -> Result<Decimal, ServiceError>
where
    C: ConnectionTrait,
{
    let refunded: Decimal = RefundRequestEntity::find()
        .filter(refund_request::Column::OrderId.eq(order.id))
        .filter(refund_request::Column::Status.eq(RefundStatus::Approved))
        .all(conn)
        .await?
        .iter()
        .map(|r| r.amount)
        .sum();
    Ok((order.total - refunded).max(Decimal::ZERO))
}

/// Resolves requested lines against the order, checking each quantity
/// against what has not been refunded yet.
async fn select_lines<C>(
    conn: &C,
    order_items: &[order_item::Model],
    requested: &[RefundLineInput],
) -> Result<Vec<(order_item::Model, i32)>, ServiceError>
where
    C: ConnectionTrait,
{
    if requested.is_empty() {
        return Ok(Vec::new());
    }
    let approved = approved_quantities(conn, order_items).await?;

    let mut quantities: HashMap<Uuid, i32> = HashMap::new();
    for line in requested {
        if line.quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Refund quantity must be greater than zero.".to_string(),
            ));
        }
        *quantities.entry(line.product_id).or_default() += line.quantity;
    }

    let mut selected = Vec::with_capacity(quantities.len());
    for (product_id, quantity) in quantities {
        let item = order_items
            .iter()
            .find(|i| i.product_id == product_id)
            .ok_or_else(|| ServiceError::NotFound("Item not found in this order.".to_string()))?;
        let already = item
            .refunded_quantity
            .max(approved.get(&item.id).copied().unwrap_or(0));
        let available = (item.quantity - already).max(0);
        if quantity > available {
            return Err(ServiceError::ValidationError(format!(
                "Only {} of {} can still be refunded.",
                available, item.name
            )));
        }
        selected.push((item.clone(), quantity));
    }
    Ok(selected)
}

/// Sum of approved refund-item quantities per order item.
async fn approved_quantities<C>(
    conn: &C,
    order_items: &[order_item::Model],
) -> Result<HashMap<Uuid, i32>, ServiceError>
where
    C: ConnectionTrait,
{
    let item_ids: Vec<Uuid> = order_items.iter().map(|i| i.id).collect();
    let rows = RefundItemEntity::find()
        .filter(refund_item::Column::OrderItemId.is_in(item_ids))
        .find_also_related(RefundRequestEntity)
        .all(conn)
        .await?;

    let mut totals = HashMap::new();
    for (item, request) in rows {
        if request.is_some_and(|r| r.status == RefundStatus::Approved) {
            *totals.entry(item.order_item_id).or_insert(0) += item.quantity;
        }
    }
    Ok(totals)
}

async fn suspend_refunds<C>(conn: &C, user_id: Uuid, until: DateTime<Utc>) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    UserAccount::update_many()
        .col_expr(user_account::Column::RefundFlagUntil, Expr::value(Some(until)))
        .col_expr(user_account::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(user_account::Column::Id.eq(user_id))
        .exec(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_note_falls_back_to_the_existing_note() {
        assert_eq!(
            note_or_existing(Some("  ".into()), Some(FLAGGED_NOTE.into())).as_deref(),
            Some(FLAGGED_NOTE)
        );
        assert_eq!(
            note_or_existing(Some(" receipt checked ".into()), None).as_deref(),
            Some("receipt checked")
        );
        assert_eq!(note_or_existing(None, None), None);
    }

    #[test]
    fn refund_input_defaults_to_whole_order_wallet_refund() {
        let input: RefundInput = serde_json::from_value(serde_json::json!({
            "order_id": Uuid::new_v4(),
            "reason": "Damaged packaging"
        }))
        .unwrap();
        assert_eq!(input.destination, RefundDestination::Wallet);
        assert!(input.items.is_empty());
        assert!(input.validate().is_ok());
    }
}
