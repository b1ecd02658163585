use axum::{http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{ApiResponse, ListQuery, PaginatedResponse};

/// Standard success response
pub fn ok<T>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse::success(data))
}

/// Success response carrying a shopper-facing message
pub fn ok_with_message<T>(data: T, message: impl Into<String>) -> Json<ApiResponse<T>> {
    Json(ApiResponse::with_message(data, message))
}

/// Standard created response
pub fn created<T>(data: T) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::CREATED, Json(ApiResponse::success(data)))
}

/// Wraps one page of results together with the query that produced it
pub fn paged<T>(items: Vec<T>, total: u64, query: &ListQuery) -> Json<ApiResponse<PaginatedResponse<T>>> {
    ok(PaginatedResponse::new(items, total, query.page(), query.limit()))
}

/// Body of endpoints that only acknowledge an action
#[derive(Debug, Serialize, ToSchema)]
pub struct Acknowledged {
    pub message: String,
}

impl Acknowledged {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
