use axum::{
    extract::{Path, Query, State},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    auth::AuthUser,
    entities::{transaction_log, user_account},
    errors::ServiceError,
    handlers::common::{ok, ok_with_message, paged, Acknowledged},
    services::{
        accounts::{BalanceChange, MembershipReceipt, PlanPayment, PlanView},
        payments::{card::CardDetails, hosted::HostedIntentView},
    },
    ApiResponse, AppState, ListQuery, PaginatedResponse,
};

/// Profile of the signed-in user with derived balances.
#[derive(Debug, Serialize)]
pub struct AccountView {
    #[serde(flatten)]
    pub user: user_account::Model,
    pub wallet_balance: Decimal,
    pub membership: PlanView,
}

impl From<user_account::Model> for AccountView {
    fn from(user: user_account::Model) -> Self {
        Self {
            wallet_balance: user.wallet_balance(),
            membership: PlanView::from(user.plan),
            user,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WalletView {
    #[schema(value_type = String, example = "12.50")]
    pub balance: Decimal,
    pub loyalty_points: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SubscribeRequest {
    #[schema(example = "gold")]
    pub plan: String,
    /// Omitted for the free plan
    pub payment: Option<PlanPayment>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PlanRequest {
    #[schema(example = "silver")]
    pub plan: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CardTopUpRequest {
    #[schema(value_type = String, example = "20.00")]
    pub amount: Decimal,
    pub card: CardDetails,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TopUpRequest {
    #[schema(value_type = String, example = "20.00")]
    pub amount: Decimal,
}

#[utoipa::path(
    get,
    path = "/api/v1/account",
    summary = "My account",
    responses((status = 200, description = "Profile, membership and balances")),
    security(("Bearer" = [])),
    tag = "Account"
)]
pub async fn me(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<AccountView>>, ServiceError> {
    let account = state.services.accounts.get_user(user.user_id).await?;
    Ok(ok(AccountView::from(account)))
}

#[utoipa::path(
    post,
    path = "/api/v1/account/warning/dismiss",
    summary = "Dismiss fraud warning",
    responses((status = 200, description = "Warning cleared", body = ApiResponse<Acknowledged>)),
    security(("Bearer" = [])),
    tag = "Account"
)]
pub async fn dismiss_warning(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Acknowledged>>, ServiceError> {
    state.services.accounts.dismiss_warning(user.user_id).await?;
    Ok(ok(Acknowledged::new("Warning dismissed.")))
}

#[utoipa::path(
    get,
    path = "/api/v1/account/transactions",
    summary = "My transaction history",
    params(ListQuery),
    responses((status = 200, description = "One page of ledger entries")),
    security(("Bearer" = [])),
    tag = "Account"
)]
pub async fn my_transactions(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<transaction_log::Model>>>, ServiceError> {
    let (entries, total) = state
        .services
        .ledger
        .list_for_user(user.user_id, query.page(), query.limit())
        .await?;
    Ok(paged(entries, total, &query))
}

#[utoipa::path(
    get,
    path = "/api/v1/membership/plans",
    summary = "Membership plans",
    responses((status = 200, description = "Available plans", body = ApiResponse<Vec<PlanView>>)),
    tag = "Membership"
)]
pub async fn plans(State(state): State<AppState>) -> Json<ApiResponse<Vec<PlanView>>> {
    ok(state.services.accounts.plans())
}

#[utoipa::path(
    post,
    path = "/api/v1/membership/subscribe",
    summary = "Subscribe",
    description = "Switches plan, charging the card or the wallet for paid plans",
    request_body = SubscribeRequest,
    responses(
        (status = 200, description = "Plan changed", body = ApiResponse<MembershipReceipt>),
        (status = 400, description = "Invalid plan or payment details", body = crate::errors::ErrorResponse),
        (status = 402, description = "Payment declined or wallet balance too low", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Membership"
)]
pub async fn subscribe(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<SubscribeRequest>,
) -> Result<Json<ApiResponse<MembershipReceipt>>, ServiceError> {
    let receipt = state
        .services
        .accounts
        .subscribe(user.user_id, &request.plan, request.payment)
        .await?;
    let message = format!("You are now a {} member.", receipt.plan.name);
    Ok(ok_with_message(receipt, message))
}

#[utoipa::path(
    post,
    path = "/api/v1/membership/paypal",
    summary = "Start PayPal subscription",
    request_body = PlanRequest,
    responses(
        (status = 200, description = "Intent created", body = ApiResponse<HostedIntentView>),
        (status = 400, description = "Invalid or free plan", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Membership"
)]
pub async fn begin_paypal_subscription(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<PlanRequest>,
) -> Result<Json<ApiResponse<HostedIntentView>>, ServiceError> {
    Ok(ok(state
        .services
        .accounts
        .begin_hosted_subscription(user.user_id, &request.plan)
        .await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/membership/paypal/{intent_id}/capture",
    summary = "Capture PayPal subscription",
    params(("intent_id" = String, Path, description = "PayPal order id")),
    responses(
        (status = 200, description = "Plan changed", body = ApiResponse<MembershipReceipt>),
        (status = 402, description = "Capture declined", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown intent", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Membership"
)]
pub async fn capture_paypal_subscription(
    State(state): State<AppState>,
    user: AuthUser,
    Path(intent_id): Path<String>,
) -> Result<Json<ApiResponse<MembershipReceipt>>, ServiceError> {
    Ok(ok(state
        .services
        .accounts
        .capture_hosted_subscription(user.user_id, &intent_id)
        .await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/wallet",
    summary = "Wallet and points",
    responses((status = 200, description = "Balances", body = ApiResponse<WalletView>)),
    security(("Bearer" = [])),
    tag = "Wallet"
)]
pub async fn wallet(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<WalletView>>, ServiceError> {
    let account = state.services.accounts.get_user(user.user_id).await?;
    Ok(ok(WalletView {
        balance: account.wallet_balance(),
        loyalty_points: account.loyalty_points,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/wallet/topup",
    summary = "Top up by card",
    request_body = CardTopUpRequest,
    responses(
        (status = 200, description = "Wallet credited", body = ApiResponse<BalanceChange>),
        (status = 400, description = "Invalid amount or card", body = crate::errors::ErrorResponse),
        (status = 402, description = "Card declined", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Wallet"
)]
pub async fn top_up_card(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CardTopUpRequest>,
) -> Result<Json<ApiResponse<BalanceChange>>, ServiceError> {
    let change = state
        .services
        .accounts
        .top_up_card(user.user_id, request.amount, &request.card)
        .await?;
    let message = format!("Wallet topped up. New balance: ${:.2}", change.new);
    Ok(ok_with_message(change, message))
}

#[utoipa::path(
    post,
    path = "/api/v1/wallet/paypal",
    summary = "Start PayPal top-up",
    request_body = TopUpRequest,
    responses(
        (status = 200, description = "Intent created", body = ApiResponse<HostedIntentView>),
        (status = 400, description = "Invalid amount", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Wallet"
)]
pub async fn begin_paypal_top_up(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<TopUpRequest>,
) -> Result<Json<ApiResponse<HostedIntentView>>, ServiceError> {
    Ok(ok(state
        .services
        .accounts
        .begin_hosted_top_up(user.user_id, request.amount)
        .await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/wallet/paypal/{intent_id}/capture",
    summary = "Capture PayPal top-up",
    params(("intent_id" = String, Path, description = "PayPal order id")),
    responses(
        (status = 200, description = "Wallet credited", body = ApiResponse<BalanceChange>),
        (status = 402, description = "Capture declined", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown intent", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Wallet"
)]
pub async fn capture_paypal_top_up(
    State(state): State<AppState>,
    user: AuthUser,
    Path(intent_id): Path<String>,
) -> Result<Json<ApiResponse<BalanceChange>>, ServiceError> {
    Ok(ok(state
        .services
        .accounts
        .capture_hosted_top_up(user.user_id, &intent_id)
        .await?))
}
