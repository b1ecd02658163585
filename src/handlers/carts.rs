use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    entities::cart_line,
    errors::ServiceError,
    handlers::common::ok,
    services::carts::CartLineInput,
    ApiResponse, AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct QuantityRequest {
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SaveCartRequest {
    pub items: Vec<CartLineInput>,
}

#[utoipa::path(
    get,
    path = "/api/v1/cart",
    summary = "Get cart",
    responses((status = 200, description = "Current cart lines")),
    security(("Bearer" = [])),
    tag = "Cart"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Vec<cart_line::Model>>>, ServiceError> {
    Ok(ok(state.services.carts.get_cart(user.user_id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/cart/items",
    summary = "Add to cart",
    description = "Adds units of a product, merging with an existing line",
    request_body = CartLineInput,
    responses(
        (status = 200, description = "Updated cart"),
        (status = 400, description = "Invalid quantity", body = crate::errors::ErrorResponse),
        (status = 422, description = "Not enough stock", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Cart"
)]
pub async fn add_item(
    State(state): State<AppState>,
    user: AuthUser,
    Json(line): Json<CartLineInput>,
) -> Result<Json<ApiResponse<Vec<cart_line::Model>>>, ServiceError> {
    let cart = state
        .services
        .carts
        .add_item(user.user_id, line.product_id, line.quantity)
        .await?;
    Ok(ok(cart))
}

#[utoipa::path(
    put,
    path = "/api/v1/cart/items/{product_id}",
    summary = "Set line quantity",
    description = "A quantity of zero or less removes the line",
    params(("product_id" = Uuid, Path, description = "Product id")),
    request_body = QuantityRequest,
    responses((status = 200, description = "Updated cart")),
    security(("Bearer" = [])),
    tag = "Cart"
)]
pub async fn update_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(product_id): Path<Uuid>,
    Json(request): Json<QuantityRequest>,
) -> Result<Json<ApiResponse<Vec<cart_line::Model>>>, ServiceError> {
    let cart = state
        .services
        .carts
        .update_quantity(user.user_id, product_id, request.quantity)
        .await?;
    Ok(ok(cart))
}

#[utoipa::path(
    delete,
    path = "/api/v1/cart/items/{product_id}",
    summary = "Remove line",
    params(("product_id" = Uuid, Path, description = "Product id")),
    responses((status = 200, description = "Updated cart")),
    security(("Bearer" = [])),
    tag = "Cart"
)]
pub async fn remove_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<cart_line::Model>>>, ServiceError> {
    Ok(ok(state
        .services
        .carts
        .remove_item(user.user_id, product_id)
        .await?))
}

#[utoipa::path(
    put,
    path = "/api/v1/cart",
    summary = "Save whole cart",
    description = "Replaces the stored cart, e.g. when restoring it on another device",
    request_body = SaveCartRequest,
    responses((status = 200, description = "Saved cart")),
    security(("Bearer" = [])),
    tag = "Cart"
)]
pub async fn save_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<SaveCartRequest>,
) -> Result<Json<ApiResponse<Vec<cart_line::Model>>>, ServiceError> {
    Ok(ok(state
        .services
        .carts
        .save_cart(user.user_id, request.items)
        .await?))
}

#[utoipa::path(
    delete,
    path = "/api/v1/cart",
    summary = "Clear cart",
    responses((status = 200, description = "Empty cart")),
    security(("Bearer" = [])),
    tag = "Cart"
)]
pub async fn clear_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Vec<cart_line::Model>>>, ServiceError> {
    state.services.carts.clear(user.user_id).await?;
    Ok(ok(Vec::new()))
}
