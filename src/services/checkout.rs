//! Settlement orchestrator.
//!
//! One checkout attempt walks these stages in order:
//!
//! `VALIDATE_CART → VALIDATE_PAYMENT_INPUT → PRICE → AUTHORIZE_PAYMENT →
//! COMMIT_ORDER → DEDUCT_STOCK → SETTLE_LEDGERS → CLEAR_CART`
//!
//! Anything failing before AUTHORIZE_PAYMENT leaves no trace. Once funds are
//! collected a failed commit is compensated through the adapter that collected
//! them. COMMIT_ORDER spends the redeemed points in the same transaction that
//! writes the order. After it the order stands: insufficient stock unwinds it
//! (cancel, return points, compensate), every other failure is logged for
//! reconciliation and the remaining stages still run.
//!
//! Only one settlement per shopper runs at a time.

use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::Display;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, DeliveryMethod, OrderLineSnapshot, OrderStatus, PaymentMethod},
        product::{self, Entity as Product},
        transaction_log::TransactionAction,
        user_account::{self, MembershipPlan},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        accounts::{adjust_points, ensure_active, find_user, spend_points, BalanceChange},
        carts::{clear_cart, load_cart},
        catalog::{decrement_stock, CatalogService},
        payments::{
            hosted::{HostedIntentView, HostedPurpose},
            qr::{QrCodeView, QrStatusReport},
            PaymentAdapters, PaymentContext, PaymentOutcome, PaymentRequest, QrState,
        },
        pricing::{price, LoyaltyPolicy, LoyaltyRequest, PriceBreakdown, PricingLine},
        promotions::PromotionService,
        transaction_log::{NewLogEntry, TransactionLogService},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutStage {
    ValidateCart,
    ValidatePaymentInput,
    Price,
    AuthorizePayment,
    CommitOrder,
    DeductStock,
    SettleLedgers,
    ClearCart,
}

fn default_delivery() -> DeliveryMethod {
    DeliveryMethod::Delivery
}

/// Shopper choices that travel with a checkout, including across the
/// asynchronous hosted and QR flows.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
pub struct CheckoutOptions {
    #[serde(default = "default_delivery")]
    #[schema(value_type = String, example = "delivery")]
    pub delivery_method: DeliveryMethod,
    #[serde(default)]
    pub delivery_address: Option<String>,
    #[serde(default)]
    pub pickup_outlet: Option<String>,
    /// Points the shopper wants to redeem; normalized by the pricing engine
    #[serde(default)]
    pub redeem_points: i64,
}

impl Default for CheckoutOptions {
    fn default() -> Self {
        Self {
            delivery_method: default_delivery(),
            delivery_address: None,
            pickup_outlet: None,
            redeem_points: 0,
        }
    }
}

impl CheckoutOptions {
    /// Keeps only the destination that matches the delivery method.
    fn normalized(mut self) -> Self {
        let trim = |v: Option<String>| {
            v.map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        match self.delivery_method {
            DeliveryMethod::Delivery => {
                self.delivery_address = trim(self.delivery_address);
                self.pickup_outlet = None;
            }
            DeliveryMethod::Pickup => {
                self.delivery_address = None;
                self.pickup_outlet = trim(self.pickup_outlet);
            }
        }
        self.redeem_points = self.redeem_points.max(0);
        self
    }
}

/// Per-attempt context resolved from the authenticated user.
#[derive(Debug, Clone)]
pub struct CheckoutContext {
    pub user_id: Uuid,
    pub plan: MembershipPlan,
    pub available_points: i64,
    pub options: CheckoutOptions,
}

impl CheckoutContext {
    pub fn new(user: &user_account::Model, options: CheckoutOptions) -> Self {
        Self {
            user_id: user.id,
            plan: user.plan,
            available_points: user.loyalty_points,
            options: options.normalized(),
        }
    }

    fn loyalty(&self) -> LoyaltyRequest {
        LoyaltyRequest {
            requested_points: self.options.redeem_points,
            available_points: self.available_points,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QuoteLine {
    pub product_id: Uuid,
    pub name: String,
    #[schema(value_type = String, example = "3.00")]
    pub unit_price: Decimal,
    pub quantity: i32,
    #[schema(value_type = String, example = "6.00")]
    pub line_total: Decimal,
}

impl From<&PricingLine> for QuoteLine {
    fn from(line: &PricingLine) -> Self {
        Self {
            product_id: line.product_id,
            name: line.name.clone(),
            unit_price: line.unit_price,
            quantity: line.quantity,
            line_total: line.line_total(),
        }
    }
}

/// Priced cart without payment.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutQuote {
    pub lines: Vec<QuoteLine>,
    pub breakdown: PriceBreakdown,
    pub points_available: i64,
    #[schema(value_type = String, example = "20.00")]
    pub wallet_balance: Decimal,
}

#[derive(Debug, Clone)]
pub struct CheckoutReceipt {
    pub order: order::Model,
    pub breakdown: PriceBreakdown,
    pub loyalty_points: i64,
    pub wallet_balance: Decimal,
    pub message: String,
    /// True when a replayed confirmation returned an existing order
    pub replayed: bool,
}

/// Marks a shopper's settlement as running until dropped.
struct SettlementGuard {
    in_flight: Arc<DashMap<Uuid, ()>>,
    user_id: Uuid,
}

impl Drop for SettlementGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.user_id);
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    in_flight: Arc<DashMap<Uuid, ()>>,
    event_sender: Arc<EventSender>,
    promotions: PromotionService,
    policy: LoyaltyPolicy,
    adapters: PaymentAdapters,
    ledger: TransactionLogService,
    catalog: CatalogService,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        promotions: PromotionService,
        policy: LoyaltyPolicy,
        adapters: PaymentAdapters,
        ledger: TransactionLogService,
        catalog: CatalogService,
    ) -> Self {
        Self {
            db,
            in_flight: Arc::new(DashMap::new()),
            event_sender,
            promotions,
            policy,
            adapters,
            ledger,
            catalog,
        }
    }

    /// VALIDATE_CART + PRICE without touching anything.
    #[instrument(skip(self))]
    pub async fn quote(&self, user_id: Uuid, redeem_points: i64) -> Result<CheckoutQuote, ServiceError> {
        let user = find_user(&*self.db, user_id).await?;
        let ctx = CheckoutContext::new(
            &user,
            CheckoutOptions {
                redeem_points,
                ..CheckoutOptions::default()
            },
        );
        let lines = self.validate_cart(user_id).await?;
        let breakdown = self.price(&ctx, &lines).await;
        Ok(CheckoutQuote {
            lines: lines.iter().map(QuoteLine::from).collect(),
            breakdown,
            points_available: user.loyalty_points,
            wallet_balance: user.wallet_balance(),
        })
    }

    /// Checks out the current cart. Hosted and QR requests are routed to
    /// their capture/confirm paths, which use the choices stashed when the
    /// payment was started.
    pub async fn checkout(
        &self,
        user_id: Uuid,
        options: CheckoutOptions,
        request: PaymentRequest,
    ) -> Result<CheckoutReceipt, ServiceError> {
        match &request {
            PaymentRequest::Paypal { intent_id } => self.capture_hosted(user_id, intent_id).await,
            PaymentRequest::Nets { retrieval_ref } => self.confirm_qr(user_id, retrieval_ref).await,
            PaymentRequest::Wallet | PaymentRequest::Card(_) => {
                let _guard = self.lock_settlement(user_id)?;
                let user = find_user(&*self.db, user_id).await?;
                ensure_active(&user)?;
                self.settle(CheckoutContext::new(&user, options), request).await
            }
        }
    }

    /// Starts a hosted-redirect checkout for the current cart total.
    #[instrument(skip(self))]
    pub async fn begin_hosted(
        &self,
        user_id: Uuid,
        options: CheckoutOptions,
    ) -> Result<HostedIntentView, ServiceError> {
        let user = find_user(&*self.db, user_id).await?;
        ensure_active(&user)?;
        let ctx = CheckoutContext::new(&user, options);
        let lines = self.validate_cart(user_id).await?;
        let breakdown = self.price(&ctx, &lines).await;
        self.adapters
            .hosted
            .begin(
                user_id,
                breakdown.final_total,
                HostedPurpose::Checkout(ctx.options),
            )
            .await
    }

    #[instrument(skip(self))]
    pub async fn capture_hosted(
        &self,
        user_id: Uuid,
        intent_id: &str,
    ) -> Result<CheckoutReceipt, ServiceError> {
        let _guard = self.lock_settlement(user_id)?;
        let intent = self.adapters.hosted.pending(intent_id, user_id)?;
        let HostedPurpose::Checkout(options) = intent.purpose else {
            return Err(ServiceError::InvalidInput(
                "Payment session was not started for a checkout.".to_string(),
            ));
        };
        let user = find_user(&*self.db, user_id).await?;
        ensure_active(&user)?;
        self.settle(
            CheckoutContext::new(&user, options),
            PaymentRequest::Paypal {
                intent_id: intent_id.to_string(),
            },
        )
        .await
    }

    /// Generates a QR code for the current cart total and parks the checkout
    /// choices under its retrieval reference.
    #[instrument(skip(self))]
    pub async fn begin_qr(
        &self,
        user_id: Uuid,
        options: CheckoutOptions,
    ) -> Result<QrCodeView, ServiceError> {
        let user = find_user(&*self.db, user_id).await?;
        ensure_active(&user)?;
        let ctx = CheckoutContext::new(&user, options);
        let lines = self.validate_cart(user_id).await?;
        let breakdown = self.price(&ctx, &lines).await;
        self.adapters
            .qr
            .begin(user_id, breakdown.final_total, ctx.options)
            .await
    }

    /// Settles a QR payment. Replays of an already settled reference return
    /// the existing order. A confirmed payment whose settlement fails before
    /// the order is written is credited to the wallet.
    #[instrument(skip(self))]
    pub async fn confirm_qr(
        &self,
        user_id: Uuid,
        retrieval_ref: &str,
    ) -> Result<CheckoutReceipt, ServiceError> {
        let _guard = self.lock_settlement(user_id)?;
        if let Some(existing) = order::Entity::find()
            .filter(order::Column::PaymentRef.eq(retrieval_ref))
            .one(&*self.db)
            .await?
        {
            if existing.user_id != user_id {
                return Err(ServiceError::Forbidden(
                    "This payment belongs to another user.".to_string(),
                ));
            }
            info!(order_id = %existing.id, retrieval_ref, "QR confirmation replayed");
            return self.replayed_receipt(existing).await;
        }

        let session = self.adapters.qr.session(retrieval_ref, user_id)?;
        let user = find_user(&*self.db, user_id).await?;
        ensure_active(&user)?;

        let result = self
            .settle(
                CheckoutContext::new(&user, session.options.clone()),
                PaymentRequest::Nets {
                    retrieval_ref: retrieval_ref.to_string(),
                },
            )
            .await;

        match result {
            Ok(receipt) => {
                self.adapters.qr.finish(retrieval_ref).await;
                Ok(receipt)
            }
            Err(err) => {
                let paid_but_unsettled = self
                    .adapters
                    .qr
                    .session(retrieval_ref, user_id)
                    .map(|s| s.state() == QrState::Confirmed)
                    .unwrap_or(false);
                if paid_but_unsettled {
                    self.adapters
                        .qr
                        .credit_unsettled(retrieval_ref, user_id, "credited after a failed checkout")
                        .await;
                }
                Err(err)
            }
        }
    }

    /// Current state of a QR payment, asking the gateway while it is pending.
    pub async fn qr_status(&self, user_id: Uuid, retrieval_ref: &str) -> Result<QrState, ServiceError> {
        self.adapters.qr.refresh(retrieval_ref, user_id).await
    }

    pub fn qr_updates(
        &self,
        user_id: Uuid,
        retrieval_ref: &str,
    ) -> Result<tokio::sync::watch::Receiver<QrState>, ServiceError> {
        self.adapters.qr.subscribe(retrieval_ref, user_id)
    }

    /// Applies a pushed gateway notification. Unknown references are ignored.
    pub async fn apply_qr_report(&self, report: &QrStatusReport) -> Option<QrState> {
        self.adapters.qr.apply_report(report).await
    }

    fn lock_settlement(&self, user_id: Uuid) -> Result<SettlementGuard, ServiceError> {
        match self.in_flight.entry(user_id) {
            Entry::Occupied(_) => {
                warn!(%user_id, "checkout refused, another one is in progress");
                Err(ServiceError::Conflict(
                    "A checkout is already in progress for your account.".to_string(),
                ))
            }
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(SettlementGuard {
                    in_flight: self.in_flight.clone(),
                    user_id,
                })
            }
        }
    }

    #[instrument(skip(self, ctx, request), fields(user_id = %ctx.user_id, method = %request.method()))]
    async fn settle(
        &self,
        ctx: CheckoutContext,
        request: PaymentRequest,
    ) -> Result<CheckoutReceipt, ServiceError> {
        let adapter = self.adapters.for_request(&request);
        let method = request.method();

        // VALIDATE_CART
        let lines = self.validate_cart(ctx.user_id).await?;

        // VALIDATE_PAYMENT_INPUT
        adapter.validate(ctx.user_id, &request).await?;

        // PRICE
        let breakdown = self.price(&ctx, &lines).await;

        // AUTHORIZE_PAYMENT
        let payment = PaymentContext::new(ctx.user_id, breakdown.final_total);
        let outcome = match adapter.authorize(&payment, &request).await {
            Ok(outcome) if outcome.success => outcome,
            Ok(outcome) => {
                let reason = outcome
                    .message
                    .unwrap_or_else(|| "Payment was declined.".to_string());
                return Err(self.payment_failed(ctx.user_id, method, reason).await);
            }
            Err(ServiceError::ExternalServiceError(detail)) => {
                warn!(attempt_id = %payment.attempt_id, detail, "payment gateway unavailable");
                return Err(self
                    .payment_failed(
                        ctx.user_id,
                        method,
                        "Payment provider unavailable, please try again later.".to_string(),
                    )
                    .await);
            }
            Err(err) => {
                counter!("checkout.payments.failed", 1);
                return Err(err);
            }
        };
        self.event_sender
            .send_or_log(Event::PaymentCaptured {
                user_id: ctx.user_id,
                method,
                amount: payment.amount,
                reference: outcome.external_ref.clone(),
            })
            .await;

        // COMMIT_ORDER
        let order = match self.commit_order(&ctx, &lines, &breakdown, method, &outcome).await {
            Ok(order) => order,
            Err(err) => {
                error!(
                    user_id = %ctx.user_id,
                    stage = %CheckoutStage::CommitOrder,
                    error = %err,
                    "order commit failed after payment"
                );
                self.compensate(&*adapter, &payment, &outcome, method).await;
                return Err(err);
            }
        };

        // DEDUCT_STOCK
        if let Err(err) = self.deduct_stock(&lines).await {
            return match err {
                ServiceError::InsufficientStock(_) => {
                    self.unwind(&order, &*adapter, &payment, &outcome, &err)
                    .await;
                    Err(err)
                }
                other => {
                    self.reconcile(&order, CheckoutStage::DeductStock, &other);
                    self.finish(ctx, order, breakdown, outcome).await
                }
            };
        }

        self.finish(ctx, order, breakdown, outcome).await
    }

    /// SETTLE_LEDGERS and CLEAR_CART. Failures are logged, never returned.
    async fn finish(
        &self,
        ctx: CheckoutContext,
        order: order::Model,
        breakdown: PriceBreakdown,
        outcome: PaymentOutcome,
    ) -> Result<CheckoutReceipt, ServiceError> {
        if let Err(err) = self.settle_ledgers(&order, &breakdown, &outcome).await {
            self.reconcile(&order, CheckoutStage::SettleLedgers, &err);
        }

        match clear_cart(&*self.db, ctx.user_id).await {
            Ok(_) => {
                self.event_sender
                    .send_or_log(Event::CartCleared(ctx.user_id))
                    .await
            }
            Err(err) => self.reconcile(&order, CheckoutStage::ClearCart, &err),
        }

        counter!("checkout.orders.placed", 1);
        info!(
            order_id = %order.id,
            user_id = %ctx.user_id,
            total = %order.total,
            method = %order.payment_method,
            "order placed"
        );
        self.event_sender
            .send_or_log(Event::OrderPlaced {
                order_id: order.id,
                user_id: ctx.user_id,
                total: order.total,
                payment_method: order.payment_method,
            })
            .await;

        let user = find_user(&*self.db, ctx.user_id).await?;
        Ok(CheckoutReceipt {
            message: receipt_message(&order, &breakdown),
            order,
            breakdown,
            loyalty_points: user.loyalty_points,
            wallet_balance: user.wallet_balance(),
            replayed: false,
        })
    }

    async fn validate_cart(&self, user_id: Uuid) -> Result<Vec<PricingLine>, ServiceError> {
        let cart = load_cart(&*self.db, user_id).await?;
        if cart.is_empty() {
            return Err(ServiceError::ValidationError("Your cart is empty.".to_string()));
        }

        let mut lines = Vec::with_capacity(cart.len());
        for line in &cart {
            let product = Product::find_by_id(line.product_id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "{} is no longer available.",
                        line.product_name
                    ))
                })?;
            if line.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Invalid quantity for {}.",
                    product.name
                )));
            }
            if line.quantity > product.stock {
                return Err(ServiceError::InsufficientStock(format!(
                    "Only {} left in stock for {}",
                    product.stock.max(0),
                    product.name
                )));
            }
            lines.push(PricingLine::from(line));
        }
        Ok(lines)
    }

    async fn price(&self, ctx: &CheckoutContext, lines: &[PricingLine]) -> PriceBreakdown {
        let promotion = self.promotions.current().await;
        price(lines, &promotion, ctx.plan, ctx.loyalty(), &self.policy)
    }

    async fn payment_failed(&self, user_id: Uuid, method: PaymentMethod, reason: String) -> ServiceError {
        counter!("checkout.payments.failed", 1);
        warn!(%user_id, %method, reason, "payment declined");
        self.event_sender
            .send_or_log(Event::PaymentFailed {
                user_id,
                method,
                reason: reason.clone(),
            })
            .await;
        ServiceError::PaymentFailed(reason)
    }

    async fn commit_order(
        &self,
        ctx: &CheckoutContext,
        lines: &[PricingLine],
        breakdown: &PriceBreakdown,
        method: PaymentMethod,
        outcome: &PaymentOutcome,
    ) -> Result<order::Model, ServiceError> {
        let snapshot: Vec<OrderLineSnapshot> = lines
            .iter()
            .map(|l| OrderLineSnapshot {
                product_id: l.product_id,
                name: l.name.clone(),
                unit_price: l.unit_price,
                quantity: l.quantity,
            })
            .collect();
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let txn = self.db.begin().await?;
        let points = if breakdown.points_spent > 0 {
            Some(spend_points(&txn, ctx.user_id, breakdown.points_spent).await?)
        } else {
            None
        };

        let order = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(ctx.user_id),
            items: Set(serde_json::to_value(&snapshot)?),
            subtotal: Set(breakdown.subtotal),
            promo_savings: Set(breakdown.promo_savings),
            membership_savings: Set(breakdown.membership_savings),
            loyalty_discount: Set(breakdown.loyalty_discount),
            total_savings: Set(breakdown.total_savings),
            total: Set(breakdown.final_total),
            points_spent: Set(breakdown.points_spent),
            points_earned: Set(breakdown.points_earned),
            membership_plan: Set(ctx.plan),
            status: Set(OrderStatus::Processing),
            delivery_method: Set(ctx.options.delivery_method),
            delivery_address: Set(ctx.options.delivery_address.clone()),
            pickup_outlet: Set(ctx.options.pickup_outlet.clone()),
            payment_method: Set(method),
            payment_ref: Set(outcome.external_ref.clone()),
            created_at: Set(now),
            confirmed_at: Set(Some(now)),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        if let Some((before, after)) = points {
            self.ledger
                .record(
                    &txn,
                    NewLogEntry::new(ctx.user_id, TransactionAction::PointsSpend, Decimal::from(breakdown.points_spent))
                        .balances(Decimal::from(before), Decimal::from(after))
                        .reference(order_id),
                )
                .await?;
        }
        txn.commit().await?;
        Ok(order)
    }

    /// Decrements every line in one transaction; a line that cannot be
    /// covered rolls back the lines before it.
    async fn deduct_stock(&self, lines: &[PricingLine]) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        for line in lines {
            if !decrement_stock(&txn, line.product_id, line.quantity).await? {
                let remaining = Product::find_by_id(line.product_id)
                    .one(&txn)
                    .await?
                    .map_or(0, |p: product::Model| p.stock.max(0));
                txn.rollback().await?;
                return Err(ServiceError::InsufficientStock(format!(
                    "Only {} left in stock for {}",
                    remaining, line.name
                )));
            }
        }
        txn.commit().await?;

        for line in lines {
            if let Err(err) = self.catalog.notify_if_depleted(line.product_id).await {
                warn!(product_id = %line.product_id, error = %err, "stock check after sale failed");
            }
        }
        Ok(())
    }

    async fn settle_ledgers(
        &self,
        order: &order::Model,
        breakdown: &PriceBreakdown,
        outcome: &PaymentOutcome,
    ) -> Result<(), ServiceError> {
        let wallet = match outcome.wallet_change {
            Some(change) => change,
            None => {
                let balance = find_user(&*self.db, order.user_id).await?.wallet_balance();
                BalanceChange {
                    previous: balance,
                    new: balance,
                }
            }
        };
        let details = match &order.payment_ref {
            Some(reference) => format!("{} payment {}", order.payment_method, reference),
            None => format!("{} payment", order.payment_method),
        };
        self.ledger
            .record(
                &*self.db,
                NewLogEntry::new(order.user_id, TransactionAction::Payment, order.total)
                    .balances(wallet.previous, wallet.new)
                    .reference(order.id)
                    .details(details),
            )
            .await?;

        // Redeemed points were already spent by COMMIT_ORDER.
        let earned = breakdown.points_earned;
        if earned > 0 {
            let (before, after) = adjust_points(&*self.db, order.user_id, earned).await?;
            self.ledger
                .record(
                    &*self.db,
                    NewLogEntry::new(order.user_id, TransactionAction::PointsEarn, Decimal::from(earned))
                        .balances(Decimal::from(before), Decimal::from(after))
                        .reference(order.id),
                )
                .await?;
        }
        Ok(())
    }

    async fn compensate(
        &self,
        adapter: &dyn crate::services::payments::PaymentAdapter,
        payment: &PaymentContext,
        outcome: &PaymentOutcome,
        method: PaymentMethod,
    ) {
        counter!("checkout.compensations", 1);
        match adapter.compensate(payment, outcome).await {
            Ok(()) => {
                self.event_sender
                    .send_or_log(Event::PaymentCompensated {
                        user_id: payment.user_id,
                        method,
                        amount: payment.amount,
                    })
                    .await
            }
            Err(err) => error!(
                user_id = %payment.user_id,
                attempt_id = %payment.attempt_id,
                %method,
                amount = %payment.amount,
                error = %err,
                "payment compensation failed; manual refund required"
            ),
        }
    }

    /// Stock ran out between validation and deduction: cancel the order, give
    /// back the redeemed points and hand the money back.
    async fn unwind(
        &self,
        order: &order::Model,
        adapter: &dyn crate::services::payments::PaymentAdapter,
        payment: &PaymentContext,
        outcome: &PaymentOutcome,
        cause: &ServiceError,
    ) {
        warn!(order_id = %order.id, error = %cause, "stock gone after payment, cancelling order");
        let mut active: order::ActiveModel = order.clone().into();
        active.status = Set(OrderStatus::Cancelled);
        if let Err(err) = active.update(&*self.db).await {
            self.reconcile(order, CheckoutStage::DeductStock, &ServiceError::from(err));
        }
        if order.points_spent > 0 {
            if let Err(err) = self.return_points(order).await {
                self.reconcile(order, CheckoutStage::DeductStock, &err);
            }
        }
        self.compensate(adapter, payment, outcome, order.payment_method)
            .await;
        self.event_sender
            .send_or_log(Event::OrderCancelled {
                order_id: order.id,
                reason: cause.to_string(),
            })
            .await;
    }

    async fn return_points(&self, order: &order::Model) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let (before, after) = adjust_points(&txn, order.user_id, order.points_spent).await?;
        self.ledger
            .record(
                &txn,
                NewLogEntry::new(order.user_id, TransactionAction::PointsEarn, Decimal::from(order.points_spent))
                    .balances(Decimal::from(before), Decimal::from(after))
                    .reference(order.id)
                    .details("Redeemed points returned for a cancelled order"),
            )
            .await?;
        txn.commit().await?;
        Ok(())
    }

    fn reconcile(&self, order: &order::Model, stage: CheckoutStage, err: &ServiceError) {
        counter!("checkout.reconciliation_required", 1);
        error!(
            order_id = %order.id,
            user_id = %order.user_id,
            stage = %stage,
            error = %err,
            "post-commit settlement step failed"
        );
    }

    async fn replayed_receipt(&self, order: order::Model) -> Result<CheckoutReceipt, ServiceError> {
        let user = find_user(&*self.db, order.user_id).await?;
        let breakdown = PriceBreakdown {
            subtotal: order.subtotal,
            promo_savings: order.promo_savings,
            membership_savings: order.membership_savings,
            pre_loyalty_total: order.total + order.loyalty_discount,
            loyalty_discount: order.loyalty_discount,
            points_spent: order.points_spent,
            final_total: order.total,
            total_savings: order.total_savings,
            points_earned: order.points_earned,
        };
        Ok(CheckoutReceipt {
            message: receipt_message(&order, &breakdown),
            order,
            breakdown,
            loyalty_points: user.loyalty_points,
            wallet_balance: user.wallet_balance(),
            replayed: true,
        })
    }
}

fn receipt_message(order: &order::Model, breakdown: &PriceBreakdown) -> String {
    let mut message = format!("Order placed! Total: ${:.2}", order.total);
    if breakdown.total_savings > Decimal::ZERO {
        let parts: Vec<String> = [
            ("promo", breakdown.promo_savings),
            ("membership", breakdown.membership_savings),
            ("loyalty", breakdown.loyalty_discount),
        ]
        .iter()
        .filter(|(_, amount)| *amount > Decimal::ZERO)
        .map(|(label, amount)| format!("{} ${:.2}", label, amount))
        .collect();
        message.push_str(&format!(
            " (you saved ${:.2}: {})",
            breakdown.total_savings,
            parts.join(" + ")
        ));
    }
    message.push('.');
    if breakdown.points_earned > 0 || breakdown.points_spent > 0 {
        message.push_str(&format!(" You earned {} points", breakdown.points_earned));
        if breakdown.points_spent > 0 {
            message.push_str(&format!(" and redeemed {}", breakdown.points_spent));
        }
        message.push('.');
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stage_names_match_the_pipeline() {
        assert_eq!(CheckoutStage::ValidatePaymentInput.to_string(), "VALIDATE_PAYMENT_INPUT");
        assert_eq!(CheckoutStage::SettleLedgers.to_string(), "SETTLE_LEDGERS");
    }

    #[test]
    fn options_keep_only_the_matching_destination() {
        let pickup = CheckoutOptions {
            delivery_method: DeliveryMethod::Pickup,
            delivery_address: Some("1 Main St".into()),
            pickup_outlet: Some("  Tampines ".into()),
            redeem_points: -5,
        }
        .normalized();
        assert_eq!(pickup.delivery_address, None);
        assert_eq!(pickup.pickup_outlet.as_deref(), Some("Tampines"));
        assert_eq!(pickup.redeem_points, 0);

        let delivery = CheckoutOptions {
            delivery_address: Some("   ".into()),
            pickup_outlet: Some("Tampines".into()),
            ..CheckoutOptions::default()
        }
        .normalized();
        assert_eq!(delivery.delivery_address, None);
        assert_eq!(delivery.pickup_outlet, None);
    }

    #[test]
    fn options_default_to_delivery_when_omitted() {
        let options: CheckoutOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.delivery_method, DeliveryMethod::Delivery);
        assert_eq!(options.redeem_points, 0);
    }

    #[test]
    fn receipt_message_itemizes_savings_and_points() {
        let breakdown = PriceBreakdown {
            subtotal: dec!(8.00),
            promo_savings: dec!(0.60),
            membership_savings: dec!(0.74),
            pre_loyalty_total: dec!(6.66),
            loyalty_discount: dec!(0.30),
            points_spent: 30,
            final_total: dec!(6.36),
            total_savings: dec!(1.64),
            points_earned: 63,
        };
        let order = order::Model {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            items: serde_json::json!([]),
            subtotal: dec!(8.00),
            promo_savings: dec!(0.60),
            membership_savings: dec!(0.74),
            loyalty_discount: dec!(0.30),
            total_savings: dec!(1.64),
            total: dec!(6.36),
            points_spent: 30,
            points_earned: 63,
            membership_plan: MembershipPlan::Gold,
            status: OrderStatus::Processing,
            delivery_method: DeliveryMethod::Delivery,
            delivery_address: None,
            pickup_outlet: None,
            payment_method: PaymentMethod::Card,
            payment_ref: None,
            created_at: Utc::now(),
            confirmed_at: None,
            updated_at: Utc::now(),
        };
        assert_eq!(
            receipt_message(&order, &breakdown),
            "Order placed! Total: $6.36 (you saved $1.64: promo $0.60 + membership $0.74 + loyalty $0.30). You earned 63 points and redeemed 30."
        );
    }
}
