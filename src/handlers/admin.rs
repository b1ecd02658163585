use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::AdminUser,
    entities::{transaction_log, user_account::MembershipPlan},
    errors::ServiceError,
    handlers::{accounts::{AccountView, PlanRequest}, common::{created, ok, paged}},
    services::{
        accounts::NewAccount,
        fraud::{FraudCheck, FraudVerdict},
        promotions::PromotionConfig,
    },
    ApiResponse, AppState, ListQuery, PaginatedResponse,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct PromotionUpdateRequest {
    /// Comma-separated, matched case-insensitively against product names
    #[schema(example = "apple, milk")]
    pub keywords: String,
    #[schema(value_type = String, example = "10")]
    pub percent: Decimal,
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/users",
    summary = "Create account",
    description = "Accounts are created by administrators; there is no self-registration",
    request_body = NewAccount,
    responses(
        (status = 201, description = "Account created"),
        (status = 400, description = "Invalid account details", body = crate::errors::ErrorResponse),
        (status = 409, description = "Email already registered", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn create_user(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(input): Json<NewAccount>,
) -> Result<(StatusCode, Json<ApiResponse<AccountView>>), ServiceError> {
    let user = state.services.accounts.create_user(input).await?;
    Ok(created(AccountView::from(user)))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/users",
    summary = "List accounts",
    responses((status = 200, description = "All accounts")),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn list_users(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<ApiResponse<Vec<AccountView>>>, ServiceError> {
    let users = state.services.accounts.list_users().await?;
    Ok(ok(users.into_iter().map(AccountView::from).collect()))
}

#[utoipa::path(
    put,
    path = "/api/v1/admin/users/{id}/plan",
    summary = "Set membership plan",
    description = "Changes the plan without charging",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = PlanRequest,
    responses(
        (status = 200, description = "Plan changed"),
        (status = 400, description = "Invalid plan", body = crate::errors::ErrorResponse),
        (status = 404, description = "User not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn set_plan(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(request): Json<PlanRequest>,
) -> Result<Json<ApiResponse<AccountView>>, ServiceError> {
    let plan = MembershipPlan::from_key(&request.plan)
        .ok_or_else(|| ServiceError::ValidationError("Invalid plan selected.".to_string()))?;
    let user = state.services.accounts.set_plan(id, plan).await?;
    Ok(ok(AccountView::from(user)))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/users/{id}/enable",
    summary = "Re-enable account",
    description = "Lifts a fraud lock and clears the warning state",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "Account enabled"),
        (status = 404, description = "User not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn enable_user(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<AccountView>>, ServiceError> {
    let user = state.services.accounts.set_disabled(id, false).await?;
    Ok(ok(AccountView::from(user)))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/users/{id}/disable",
    summary = "Disable account",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "Account disabled"),
        (status = 404, description = "User not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn disable_user(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<AccountView>>, ServiceError> {
    let user = state.services.accounts.set_disabled(id, true).await?;
    Ok(ok(AccountView::from(user)))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/transactions",
    summary = "Transaction log",
    params(ListQuery),
    responses((status = 200, description = "One page of ledger entries, newest first")),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn list_transactions(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<transaction_log::Model>>>, ServiceError> {
    let (entries, total) = state
        .services
        .ledger
        .list_all(query.page(), query.limit())
        .await?;
    Ok(paged(entries, total, &query))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/promotions",
    summary = "Active promotion",
    responses((status = 200, description = "Current keywords and percent", body = ApiResponse<PromotionConfig>)),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn get_promotion(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Json<ApiResponse<PromotionConfig>> {
    ok(state.services.promotions.current().await)
}

#[utoipa::path(
    put,
    path = "/api/v1/admin/promotions",
    summary = "Replace promotion",
    request_body = PromotionUpdateRequest,
    responses(
        (status = 200, description = "Promotion replaced", body = ApiResponse<PromotionConfig>),
        (status = 400, description = "No keywords or percent out of range", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn update_promotion(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(request): Json<PromotionUpdateRequest>,
) -> Result<Json<ApiResponse<PromotionConfig>>, ServiceError> {
    Ok(ok(state
        .services
        .promotions
        .update(&request.keywords, request.percent)
        .await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/fraud/check",
    summary = "Evaluate fraud rules",
    description = "Runs the velocity and refund-ratio rules against a hypothetical event without recording anything",
    request_body = FraudCheck,
    responses((status = 200, description = "Verdict", body = ApiResponse<FraudVerdict>)),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn fraud_check(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(check): Json<FraudCheck>,
) -> Result<Json<ApiResponse<FraudVerdict>>, ServiceError> {
    Ok(ok(state.services.ledger.check(&check).await?))
}
