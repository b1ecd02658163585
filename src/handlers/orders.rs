use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::{AdminUser, AuthUser},
    entities::order,
    errors::ServiceError,
    handlers::common::{ok, paged, Acknowledged},
    services::orders::OrderView,
    ApiResponse, AppState, ListQuery, PaginatedResponse,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct StatusUpdateRequest {
    #[schema(example = "shipped")]
    pub status: String,
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "My orders",
    description = "Orders of the signed-in shopper, newest first",
    responses((status = 200, description = "Orders")),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_my_orders(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Vec<OrderView>>>, ServiceError> {
    Ok(ok(state.services.orders.list_for_user(user.user_id).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with its lines"),
        (status = 403, description = "Order belongs to someone else", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderView>>, ServiceError> {
    let requester = state.services.accounts.get_user(user.user_id).await?;
    Ok(ok(state.services.orders.get_order(id, &requester).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/orders",
    summary = "All orders",
    params(ListQuery),
    responses((status = 200, description = "One page of orders")),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_all_orders(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderView>>>, ServiceError> {
    let (orders, total) = state
        .services
        .orders
        .list_all(query.page(), query.limit())
        .await?;
    Ok(paged(orders, total, &query))
}

#[utoipa::path(
    put,
    path = "/api/v1/admin/orders/{id}/status",
    summary = "Set order status",
    description = "Moves an order between the fulfilment statuses. Cancellation is not available here.",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = StatusUpdateRequest,
    responses(
        (status = 200, description = "Order updated"),
        (status = 400, description = "Invalid status", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(request): Json<StatusUpdateRequest>,
) -> Result<Json<ApiResponse<order::Model>>, ServiceError> {
    Ok(ok(state
        .services
        .orders
        .update_status(id, &request.status)
        .await?))
}

#[utoipa::path(
    delete,
    path = "/api/v1/admin/orders/{id}",
    summary = "Delete order",
    description = "Removes the order together with its lines and refund requests",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order deleted", body = ApiResponse<Acknowledged>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn delete_order(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Acknowledged>>, ServiceError> {
    state.services.orders.delete_order(id).await?;
    Ok(ok(Acknowledged::new("Order deleted.")))
}
