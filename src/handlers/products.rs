use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AdminUser,
    entities::product,
    errors::ServiceError,
    handlers::common::{created, ok, Acknowledged},
    services::catalog::{ProductFilter, ProductInput},
    ApiResponse, AppState,
};

const DEFAULT_BESTSELLERS: u64 = 8;

#[derive(Debug, Deserialize, IntoParams)]
pub struct BestsellerQuery {
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RestockRequest {
    #[validate(range(min = 1))]
    pub quantity: i32,
}

#[utoipa::path(
    get,
    path = "/api/v1/products",
    summary = "List products",
    description = "Catalog listing with optional case-insensitive name search, category filter and price sort",
    params(ProductFilter),
    responses((status = 200, description = "Products")),
    tag = "Catalog"
)]
pub async fn list_products(
    State(state): State<AppState>,
    Query(filter): Query<ProductFilter>,
) -> Result<Json<ApiResponse<Vec<product::Model>>>, ServiceError> {
    let products = state.services.catalog.list_products(&filter).await?;
    Ok(ok(products))
}

#[utoipa::path(
    get,
    path = "/api/v1/products/bestsellers",
    summary = "Featured products",
    params(BestsellerQuery),
    responses((status = 200, description = "Products")),
    tag = "Catalog"
)]
pub async fn bestsellers(
    State(state): State<AppState>,
    Query(query): Query<BestsellerQuery>,
) -> Result<Json<ApiResponse<Vec<product::Model>>>, ServiceError> {
    let limit = query.limit.unwrap_or(DEFAULT_BESTSELLERS).clamp(1, 50);
    Ok(ok(state.services.catalog.bestsellers(limit).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/products/{id}",
    summary = "Get product",
    params(("id" = Uuid, Path, description = "Product id")),
    responses(
        (status = 200, description = "Product"),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Catalog"
)]
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<product::Model>>, ServiceError> {
    Ok(ok(state.services.catalog.require_product(id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/products",
    summary = "Create product",
    request_body = ProductInput,
    responses(
        (status = 201, description = "Product created"),
        (status = 400, description = "Invalid product", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Catalog"
)]
pub async fn create_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(input): Json<ProductInput>,
) -> Result<(StatusCode, Json<ApiResponse<product::Model>>), ServiceError> {
    input.validate()?;
    Ok(created(state.services.catalog.create_product(input).await?))
}

#[utoipa::path(
    put,
    path = "/api/v1/admin/products/{id}",
    summary = "Update product",
    params(("id" = Uuid, Path, description = "Product id")),
    request_body = ProductInput,
    responses(
        (status = 200, description = "Product updated"),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Catalog"
)]
pub async fn update_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(input): Json<ProductInput>,
) -> Result<Json<ApiResponse<product::Model>>, ServiceError> {
    input.validate()?;
    Ok(ok(state.services.catalog.update_product(id, input).await?))
}

#[utoipa::path(
    delete,
    path = "/api/v1/admin/products/{id}",
    summary = "Delete product",
    params(("id" = Uuid, Path, description = "Product id")),
    responses(
        (status = 200, description = "Product deleted", body = ApiResponse<Acknowledged>),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Catalog"
)]
pub async fn delete_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Acknowledged>>, ServiceError> {
    state.services.catalog.delete_product(id).await?;
    Ok(ok(Acknowledged::new("Product deleted.")))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/products/{id}/restock",
    summary = "Restock product",
    params(("id" = Uuid, Path, description = "Product id")),
    request_body = RestockRequest,
    responses(
        (status = 200, description = "Stock increased"),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Catalog"
)]
pub async fn restock(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(request): Json<RestockRequest>,
) -> Result<Json<ApiResponse<product::Model>>, ServiceError> {
    request.validate()?;
    Ok(ok(state.services.catalog.restock(id, request.quantity).await?))
}
