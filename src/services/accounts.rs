//! Membership, loyalty and wallet ledger. Balance changes are single relative
//! SQL updates so concurrent debits and credits for one user cannot lose
//! writes; the before/after values returned are for the audit log only.

use crate::{
    auth::hash_password,
    entities::{
        transaction_log::TransactionAction,
        user_account::{self, Entity as UserAccount, MembershipPlan, UserRole},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        payments::{
            hosted::{HostedIntentView, HostedPurpose},
            CardDetails, HostedAdapter,
        },
        pricing::round_money,
        transaction_log::{NewLogEntry, TransactionLogService},
    },
};
use chrono::Utc;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, Iterable, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Before and after values of a wallet balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct BalanceChange {
    #[schema(value_type = String, example = "10.00")]
    pub previous: Decimal,
    #[schema(value_type = String, example = "3.64")]
    pub new: Decimal,
}

pub fn to_cents(amount: Decimal) -> Result<i64, ServiceError> {
    (round_money(amount) * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| ServiceError::InvalidInput("Amount is out of range.".to_string()))
}

pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

pub async fn find_user<C>(conn: &C, user_id: Uuid) -> Result<user_account::Model, ServiceError>
where
    C: ConnectionTrait,
{
    UserAccount::find_by_id(user_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound("User not found.".to_string()))
}

/// Rejects accounts disabled by an admin or by the fraud monitor.
pub fn ensure_active(user: &user_account::Model) -> Result<(), ServiceError> {
    if user.is_disabled {
        return Err(ServiceError::Forbidden(
            "Your account has been disabled. Please contact support.".to_string(),
        ));
    }
    Ok(())
}

/// `points = max(0, points + delta)`; returns (previous, new).
pub async fn adjust_points<C>(conn: &C, user_id: Uuid, delta: i64) -> Result<(i64, i64), ServiceError>
where
    C: ConnectionTrait,
{
    let before = find_user(conn, user_id).await?.loyalty_points;
    UserAccount::update_many()
        .col_expr(
            user_account::Column::LoyaltyPoints,
            Expr::cust_with_values(
                "CASE WHEN loyalty_points + ? < 0 THEN 0 ELSE loyalty_points + ? END",
                [delta, delta],
            ),
        )
        .col_expr(user_account::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(user_account::Column::Id.eq(user_id))
        .exec(conn)
        .await?;
    let after = find_user(conn, user_id).await?.loyalty_points;
    Ok((before, after))
}

/// Spends only if the balance covers `points`; returns (previous, new).
pub async fn spend_points<C>(conn: &C, user_id: Uuid, points: i64) -> Result<(i64, i64), ServiceError>
where
    C: ConnectionTrait,
{
    if points < 0 {
        return Err(ServiceError::InvalidInput(
            "Points to spend cannot be negative.".to_string(),
        ));
    }
    let result = UserAccount::update_many()
        .col_expr(
            user_account::Column::LoyaltyPoints,
            Expr::col(user_account::Column::LoyaltyPoints).sub(points),
        )
        .col_expr(user_account::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(user_account::Column::Id.eq(user_id))
        .filter(user_account::Column::LoyaltyPoints.gte(points))
        .exec(conn)
        .await?;

    let after = find_user(conn, user_id).await?.loyalty_points;
    if result.rows_affected == 0 {
        return Err(ServiceError::InsufficientBalance(format!(
            "Only {} loyalty points available.",
            after
        )));
    }
    Ok((after + points, after))
}

/// `wallet = max(0, wallet + delta)`.
pub async fn adjust_wallet<C>(
    conn: &C,
    user_id: Uuid,
    delta: Decimal,
) -> Result<BalanceChange, ServiceError>
where
    C: ConnectionTrait,
{
    let cents = to_cents(delta)?;
    let before = find_user(conn, user_id).await?.wallet_balance();
    UserAccount::update_many()
        .col_expr(
            user_account::Column::WalletCents,
            Expr::cust_with_values(
                "CASE WHEN wallet_cents + ? < 0 THEN 0 ELSE wallet_cents + ? END",
                [cents, cents],
            ),
        )
        .col_expr(user_account::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(user_account::Column::Id.eq(user_id))
        .exec(conn)
        .await?;
    let after = find_user(conn, user_id).await?.wallet_balance();
    Ok(BalanceChange {
        previous: before,
        new: after,
    })
}

pub async fn credit_wallet<C>(
    conn: &C,
    user_id: Uuid,
    amount: Decimal,
) -> Result<BalanceChange, ServiceError>
where
    C: ConnectionTrait,
{
    if amount < Decimal::ZERO {
        return Err(ServiceError::InvalidInput(
            "Credit amount cannot be negative.".to_string(),
        ));
    }
    adjust_wallet(conn, user_id, amount).await
}

/// Debits only if the balance covers the amount; otherwise nothing changes.
pub async fn debit_wallet<C>(
    conn: &C,
    user_id: Uuid,
    amount: Decimal,
) -> Result<BalanceChange, ServiceError>
where
    C: ConnectionTrait,
{
    let cents = to_cents(amount)?;
    if cents < 0 {
        return Err(ServiceError::InvalidInput(
            "Debit amount cannot be negative.".to_string(),
        ));
    }
    let result = UserAccount::update_many()
        .col_expr(
            user_account::Column::WalletCents,
            Expr::col(user_account::Column::WalletCents).sub(cents),
        )
        .col_expr(user_account::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(user_account::Column::Id.eq(user_id))
        .filter(user_account::Column::WalletCents.gte(cents))
        .exec(conn)
        .await?;

    let after = find_user(conn, user_id).await?.wallet_balance();
    if result.rows_affected == 0 {
        return Err(ServiceError::InsufficientBalance(format!(
            "Wallet balance {:.2} is less than {:.2}.",
            after, amount
        )));
    }
    Ok(BalanceChange {
        previous: after + from_cents(cents),
        new: after,
    })
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct NewAccount {
    #[validate(length(min = 1, max = 100))]
    pub username: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "user")]
    pub role: Option<UserRole>,
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "basic")]
    pub plan: Option<MembershipPlan>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PlanView {
    pub key: String,
    pub name: String,
    #[schema(value_type = String, example = "9.99")]
    pub monthly_price: Decimal,
    #[schema(value_type = String, example = "10")]
    pub discount_percent: Decimal,
    pub perks: Vec<String>,
}

impl From<MembershipPlan> for PlanView {
    fn from(plan: MembershipPlan) -> Self {
        Self {
            key: plan.to_string(),
            name: plan.display_name().to_string(),
            monthly_price: plan.monthly_price(),
            discount_percent: plan.discount_percent(),
            perks: plan.perks().iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// How a paid plan is paid for.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PlanPayment {
    Card(CardDetails),
    Wallet,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MembershipReceipt {
    pub plan: PlanView,
    #[schema(value_type = String, example = "9.99")]
    pub charged: Decimal,
    #[schema(value_type = String, example = "0.01")]
    pub wallet_balance: Decimal,
}

#[derive(Clone)]
pub struct AccountService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    ledger: TransactionLogService,
    hosted: Arc<HostedAdapter>,
}

impl AccountService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        ledger: TransactionLogService,
        hosted: Arc<HostedAdapter>,
    ) -> Self {
        Self {
            db,
            event_sender,
            ledger,
            hosted,
        }
    }

    #[instrument(skip(self, input), fields(email = %input.email))]
    pub async fn create_user(&self, input: NewAccount) -> Result<user_account::Model, ServiceError> {
        input.validate()?;
        let email = input.email.trim().to_lowercase();

        let existing = UserAccount::find()
            .filter(user_account::Column::Email.eq(email.clone()))
            .one(&*self.db)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(
                "An account with this email already exists.".to_string(),
            ));
        }

        let password_hash = hash_password(&input.password)
            .map_err(|e| ServiceError::InternalError(format!("password hashing failed: {}", e)))?;
        let now = Utc::now();
        let user = user_account::ActiveModel {
            id: Set(Uuid::new_v4()),
            username: Set(input.username.trim().to_string()),
            email: Set(email),
            password_hash: Set(password_hash),
            role: Set(input.role.unwrap_or(UserRole::User)),
            plan: Set(input.plan.unwrap_or(MembershipPlan::Basic)),
            wallet_cents: Set(0),
            loyalty_points: Set(0),
            refund_flag_until: Set(None),
            fraud_warning_sent_at: Set(None),
            fraud_warning_reason: Set(None),
            is_disabled: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(user_id = %user.id, role = %user.role, "account created");
        Ok(user)
    }

    /// Creates the configured admin account on first start.
    pub async fn ensure_admin(&self, email: &str, password: &str) -> Result<(), ServiceError> {
        let exists = UserAccount::find()
            .filter(user_account::Column::Email.eq(email.trim().to_lowercase()))
            .one(&*self.db)
            .await?
            .is_some();
        if exists {
            return Ok(());
        }
        self.create_user(NewAccount {
            username: "admin".to_string(),
            email: email.to_string(),
            password: password.to_string(),
            role: Some(UserRole::Admin),
            plan: None,
        })
        .await
        .map(|_| ())
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<user_account::Model, ServiceError> {
        find_user(&*self.db, user_id).await
    }

    pub async fn list_users(&self) -> Result<Vec<user_account::Model>, ServiceError> {
        Ok(UserAccount::find()
            .order_by_asc(user_account::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    pub fn plans(&self) -> Vec<PlanView> {
        MembershipPlan::iter().map(PlanView::from).collect()
    }

    pub async fn get_plan(&self, user_id: Uuid) -> Result<MembershipPlan, ServiceError> {
        Ok(self.get_user(user_id).await?.plan)
    }

    /// Sets the plan without charging; used by admins.
    #[instrument(skip(self))]
    pub async fn set_plan(
        &self,
        user_id: Uuid,
        plan: MembershipPlan,
    ) -> Result<user_account::Model, ServiceError> {
        let user = set_plan(&*self.db, user_id, plan).await?;
        self.event_sender
            .send_or_log(Event::MembershipChanged {
                user_id,
                plan: plan.to_string(),
            })
            .await;
        Ok(user)
    }

    /// Subscribes to a plan, charging the monthly price by card or wallet.
    /// The basic plan is free and ignores the payment details.
    #[instrument(skip(self, payment))]
    pub async fn subscribe(
        &self,
        user_id: Uuid,
        plan_key: &str,
        payment: Option<PlanPayment>,
    ) -> Result<MembershipReceipt, ServiceError> {
        let plan = parse_plan(plan_key)?;
        ensure_active(&self.get_user(user_id).await?)?;
        let price = plan.monthly_price();

        let txn = self.db.begin().await?;
        let user = if !plan.is_paid() {
            set_plan(&txn, user_id, plan).await?
        } else {
            match payment {
                Some(PlanPayment::Card(card)) => {
                    card.validate()?;
                    let balance = find_user(&txn, user_id).await?.wallet_balance();
                    self.ledger
                        .record(
                            &txn,
                            NewLogEntry::new(user_id, TransactionAction::Payment, price)
                                .balances(balance, balance)
                                .details(format!(
                                    "{} membership by card ending {}",
                                    plan.display_name(),
                                    card.last4()
                                )),
                        )
                        .await?;
                    set_plan(&txn, user_id, plan).await?
                }
                Some(PlanPayment::Wallet) => {
                    let change = debit_wallet(&txn, user_id, price).await?;
                    self.ledger
                        .record(
                            &txn,
                            NewLogEntry::new(user_id, TransactionAction::Payment, price)
                                .balances(change.previous, change.new)
                                .details(format!("{} membership from wallet", plan.display_name())),
                        )
                        .await?;
                    set_plan(&txn, user_id, plan).await?
                }
                None => {
                    return Err(ServiceError::ValidationError(
                        "Please choose how to pay for the membership.".to_string(),
                    ))
                }
            }
        };
        txn.commit().await?;

        info!(%user_id, plan = %plan, charged = %price, "membership updated");
        self.event_sender
            .send_or_log(Event::MembershipChanged {
                user_id,
                plan: plan.to_string(),
            })
            .await;
        Ok(MembershipReceipt {
            plan: plan.into(),
            charged: price,
            wallet_balance: user.wallet_balance(),
        })
    }

    pub async fn begin_hosted_subscription(
        &self,
        user_id: Uuid,
        plan_key: &str,
    ) -> Result<HostedIntentView, ServiceError> {
        let plan = parse_plan(plan_key)?;
        ensure_active(&self.get_user(user_id).await?)?;
        if !plan.is_paid() {
            return Err(ServiceError::InvalidOperation(
                "The basic plan is free; subscribe without a payment.".to_string(),
            ));
        }
        self.hosted
            .begin(user_id, plan.monthly_price(), HostedPurpose::Membership(plan))
            .await
    }

    #[instrument(skip(self))]
    pub async fn capture_hosted_subscription(
        &self,
        user_id: Uuid,
        intent_id: &str,
    ) -> Result<MembershipReceipt, ServiceError> {
        let intent = self.hosted.pending(intent_id, user_id)?;
        let HostedPurpose::Membership(plan) = intent.purpose else {
            return Err(ServiceError::InvalidInput(
                "Payment session was not started for a membership.".to_string(),
            ));
        };
        let outcome = self.hosted.capture(intent_id, user_id).await?;
        if !outcome.success {
            return Err(ServiceError::PaymentFailed(
                outcome.message.unwrap_or_else(|| "Payment not completed.".to_string()),
            ));
        }

        let txn = self.db.begin().await?;
        let balance = find_user(&txn, user_id).await?.wallet_balance();
        self.ledger
            .record(
                &txn,
                NewLogEntry::new(user_id, TransactionAction::Payment, intent.amount)
                    .balances(balance, balance)
                    .details(format!(
                        "{} membership via PayPal {}",
                        plan.display_name(),
                        outcome.external_ref.as_deref().unwrap_or("-")
                    )),
            )
            .await?;
        let user = set_plan(&txn, user_id, plan).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::MembershipChanged {
                user_id,
                plan: plan.to_string(),
            })
            .await;
        Ok(MembershipReceipt {
            plan: plan.into(),
            charged: intent.amount,
            wallet_balance: user.wallet_balance(),
        })
    }

    /// Tops up the wallet from a card.
    #[instrument(skip(self, card))]
    pub async fn top_up_card(
        &self,
        user_id: Uuid,
        amount: Decimal,
        card: &CardDetails,
    ) -> Result<BalanceChange, ServiceError> {
        let amount = validate_top_up(amount)?;
        ensure_active(&self.get_user(user_id).await?)?;
        card.validate()?;
        self.credit_top_up(user_id, amount, format!("Card ending {}", card.last4()))
            .await
    }

    pub async fn begin_hosted_top_up(
        &self,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<HostedIntentView, ServiceError> {
        let amount = validate_top_up(amount)?;
        ensure_active(&self.get_user(user_id).await?)?;
        self.hosted
            .begin(user_id, amount, HostedPurpose::WalletTopUp)
            .await
    }

    #[instrument(skip(self))]
    pub async fn capture_hosted_top_up(
        &self,
        user_id: Uuid,
        intent_id: &str,
    ) -> Result<BalanceChange, ServiceError> {
        let intent = self.hosted.pending(intent_id, user_id)?;
        if !matches!(intent.purpose, HostedPurpose::WalletTopUp) {
            return Err(ServiceError::InvalidInput(
                "Payment session was not started for a wallet top-up.".to_string(),
            ));
        }
        let outcome = self.hosted.capture(intent_id, user_id).await?;
        if !outcome.success {
            return Err(ServiceError::PaymentFailed(
                outcome.message.unwrap_or_else(|| "Payment not completed.".to_string()),
            ));
        }
        self.credit_top_up(
            user_id,
            intent.amount,
            format!("PayPal {}", outcome.external_ref.as_deref().unwrap_or("-")),
        )
        .await
    }

    async fn credit_top_up(
        &self,
        user_id: Uuid,
        amount: Decimal,
        details: String,
    ) -> Result<BalanceChange, ServiceError> {
        let change = self
            .ledger
            .credit_wallet(
                user_id,
                amount,
                NewLogEntry::new(user_id, TransactionAction::WalletTopup, amount).details(details),
            )
            .await?;

        self.event_sender
            .send_or_log(Event::WalletToppedUp { user_id, amount })
            .await;
        Ok(change)
    }

    /// Hides the warning banner. The warning itself stays on record, so the
    /// next suspicious event still disables the account.
    pub async fn dismiss_warning(&self, user_id: Uuid) -> Result<(), ServiceError> {
        UserAccount::update_many()
            .col_expr(
                user_account::Column::FraudWarningReason,
                Expr::value(Option::<String>::None),
            )
            .filter(user_account::Column::Id.eq(user_id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Admin toggle. Enabling also clears the fraud strikes and any refund
    /// suspension.
    #[instrument(skip(self))]
    pub async fn set_disabled(
        &self,
        user_id: Uuid,
        disabled: bool,
    ) -> Result<user_account::Model, ServiceError> {
        let user = self.get_user(user_id).await?;
        let mut active: user_account::ActiveModel = user.into();
        active.is_disabled = Set(disabled);
        if !disabled {
            active.fraud_warning_sent_at = Set(None);
            active.fraud_warning_reason = Set(None);
            active.refund_flag_until = Set(None);
        }
        active.updated_at = Set(Utc::now());
        let user = active.update(&*self.db).await?;

        if !disabled {
            self.event_sender
                .send_or_log(Event::AccountReenabled(user_id))
                .await;
        } else {
            self.event_sender
                .send_or_log(Event::AccountDisabled {
                    user_id,
                    reason: "Disabled by an administrator".to_string(),
                })
                .await;
        }
        Ok(user)
    }
}

fn parse_plan(key: &str) -> Result<MembershipPlan, ServiceError> {
    MembershipPlan::from_key(key)
        .ok_or_else(|| ServiceError::ValidationError("Invalid plan selected.".to_string()))
}

fn validate_top_up(amount: Decimal) -> Result<Decimal, ServiceError> {
    let amount = round_money(amount);
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "Top-up amount must be greater than zero.".to_string(),
        ));
    }
    Ok(amount)
}

async fn set_plan<C>(
    conn: &C,
    user_id: Uuid,
    plan: MembershipPlan,
) -> Result<user_account::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let user = find_user(conn, user_id).await?;
    let mut active: user_account::ActiveModel = user.into();
    active.plan = Set(plan);
    active.updated_at = Set(Utc::now());
    Ok(active.update(conn).await?)
}
