use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::{AdminUser, AuthUser},
    errors::ServiceError,
    handlers::common::{created, ok, paged},
    services::refunds::{RefundInput, RefundView},
    ApiResponse, AppState, ListQuery, PaginatedResponse,
};

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RefundDecision {
    pub admin_note: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/refunds",
    summary = "Request a refund",
    description = "Asks for a refund of a whole order or of selected lines. Frequent requests are flagged for review and pause further requests.",
    request_body = RefundInput,
    responses(
        (status = 201, description = "Request recorded"),
        (status = 400, description = "Outside the refund window or nothing left to refund", body = crate::errors::ErrorResponse),
        (status = 403, description = "Order belongs to someone else or refunds are paused", body = crate::errors::ErrorResponse),
        (status = 409, description = "A request for this order is already open", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Refunds"
)]
pub async fn submit_refund(
    State(state): State<AppState>,
    user: AuthUser,
    Json(input): Json<RefundInput>,
) -> Result<(StatusCode, Json<ApiResponse<RefundView>>), ServiceError> {
    Ok(created(state.services.refunds.submit(user.user_id, input).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/refunds",
    summary = "My refund requests",
    responses((status = 200, description = "Refund requests")),
    security(("Bearer" = [])),
    tag = "Refunds"
)]
pub async fn list_my_refunds(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Vec<RefundView>>>, ServiceError> {
    Ok(ok(state.services.refunds.list_for_user(user.user_id).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/refunds",
    summary = "All refund requests",
    params(ListQuery),
    responses((status = 200, description = "One page of refund requests")),
    security(("Bearer" = [])),
    tag = "Refunds"
)]
pub async fn list_all_refunds(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<RefundView>>>, ServiceError> {
    let (requests, total) = state
        .services
        .refunds
        .list_all(query.page(), query.limit())
        .await?;
    Ok(paged(requests, total, &query))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/refunds/{id}/approve",
    summary = "Approve refund",
    description = "Pays the refund to the wallet or back through PayPal and records it in the transaction log",
    params(("id" = Uuid, Path, description = "Refund request id")),
    request_body = RefundDecision,
    responses(
        (status = 200, description = "Refund approved"),
        (status = 400, description = "Request already processed", body = crate::errors::ErrorResponse),
        (status = 404, description = "Refund request not found", body = crate::errors::ErrorResponse),
        (status = 502, description = "PayPal refund failed", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Refunds"
)]
pub async fn approve_refund(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    body: Option<Json<RefundDecision>>,
) -> Result<Json<ApiResponse<RefundView>>, ServiceError> {
    let decision = body.map(|Json(d)| d).unwrap_or_default();
    Ok(ok(state
        .services
        .refunds
        .approve(id, decision.admin_note)
        .await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/refunds/{id}/deny",
    summary = "Deny refund",
    params(("id" = Uuid, Path, description = "Refund request id")),
    request_body = RefundDecision,
    responses(
        (status = 200, description = "Refund denied"),
        (status = 400, description = "Request already processed", body = crate::errors::ErrorResponse),
        (status = 404, description = "Refund request not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Refunds"
)]
pub async fn deny_refund(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    body: Option<Json<RefundDecision>>,
) -> Result<Json<ApiResponse<RefundView>>, ServiceError> {
    let decision = body.map(|Json(d)| d).unwrap_or_default();
    Ok(ok(state
        .services
        .refunds
        .deny(id, decision.admin_note)
        .await?))
}
