//! Supermarket checkout service
//!
//! Pricing, settlement, order ledger, refunds and fraud screening behind an
//! axum HTTP API.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod openapi;
pub mod services;
pub mod tracing;

use axum::{
    extract::FromRef,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::auth::AuthService;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub auth: Arc<AuthService>,
    pub services: handlers::AppServices,
}

impl FromRef<AppState> for Arc<AuthService> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

// Common query parameters for list endpoints
#[derive(Debug, Deserialize, ToSchema, utoipa::IntoParams)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_page() -> u64 {
    1
}
fn default_limit() -> u64 {
    services::transaction_log::DEFAULT_PAGE_SIZE
}

impl ListQuery {
    pub fn page(&self) -> u64 {
        self.page.max(1)
    }

    pub fn limit(&self) -> u64 {
        self.limit.clamp(1, 100)
    }
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total: u64, page: u64, limit: u64) -> Self {
        let total_pages = if total == 0 { 0 } else { total.div_ceil(limit.max(1)) };
        Self {
            items,
            total,
            page,
            limit,
            total_pages,
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::success(data)
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    let shopper = Router::new()
        // Catalog
        .route("/products", get(handlers::products::list_products))
        .route("/products/bestsellers", get(handlers::products::bestsellers))
        .route("/products/:id", get(handlers::products::get_product))
        // Cart
        .route(
            "/cart",
            get(handlers::carts::get_cart)
                .put(handlers::carts::save_cart)
                .delete(handlers::carts::clear_cart),
        )
        .route("/cart/items", post(handlers::carts::add_item))
        .route(
            "/cart/items/:product_id",
            put(handlers::carts::update_item).delete(handlers::carts::remove_item),
        )
        // Checkout
        .route("/checkout/quote", get(handlers::checkout::quote))
        .route("/checkout", post(handlers::checkout::checkout))
        .route("/checkout/paypal", post(handlers::checkout::begin_paypal))
        .route(
            "/checkout/paypal/:intent_id/capture",
            post(handlers::checkout::capture_paypal),
        )
        .route("/checkout/nets", post(handlers::checkout::begin_nets))
        .route(
            "/checkout/nets/:retrieval_ref/status",
            get(handlers::checkout::nets_status),
        )
        .route(
            "/checkout/nets/:retrieval_ref/events",
            get(handlers::checkout::nets_events),
        )
        .route(
            "/checkout/nets/:retrieval_ref/confirm",
            post(handlers::checkout::confirm_nets),
        )
        // Order ledger
        .route("/orders", get(handlers::orders::list_my_orders))
        .route("/orders/:id", get(handlers::orders::get_order))
        // Refunds
        .route(
            "/refunds",
            get(handlers::refunds::list_my_refunds).post(handlers::refunds::submit_refund),
        )
        // Account, membership and wallet
        .route("/account", get(handlers::accounts::me))
        .route(
            "/account/warning/dismiss",
            post(handlers::accounts::dismiss_warning),
        )
        .route("/account/transactions", get(handlers::accounts::my_transactions))
        .route("/membership/plans", get(handlers::accounts::plans))
        .route("/membership/subscribe", post(handlers::accounts::subscribe))
        .route(
            "/membership/paypal",
            post(handlers::accounts::begin_paypal_subscription),
        )
        .route(
            "/membership/paypal/:intent_id/capture",
            post(handlers::accounts::capture_paypal_subscription),
        )
        .route("/wallet", get(handlers::accounts::wallet))
        .route("/wallet/topup", post(handlers::accounts::top_up_card))
        .route("/wallet/paypal", post(handlers::accounts::begin_paypal_top_up))
        .route(
            "/wallet/paypal/:intent_id/capture",
            post(handlers::accounts::capture_paypal_top_up),
        );

    let admin = Router::new()
        .route("/admin/products", post(handlers::products::create_product))
        .route(
            "/admin/products/:id",
            put(handlers::products::update_product).delete(handlers::products::delete_product),
        )
        .route(
            "/admin/products/:id/restock",
            post(handlers::products::restock),
        )
        .route("/admin/orders", get(handlers::orders::list_all_orders))
        .route(
            "/admin/orders/:id",
            delete(handlers::orders::delete_order),
        )
        .route(
            "/admin/orders/:id/status",
            put(handlers::orders::update_order_status),
        )
        .route("/admin/refunds", get(handlers::refunds::list_all_refunds))
        .route(
            "/admin/refunds/:id/approve",
            post(handlers::refunds::approve_refund),
        )
        .route(
            "/admin/refunds/:id/deny",
            post(handlers::refunds::deny_refund),
        )
        .route(
            "/admin/users",
            get(handlers::admin::list_users).post(handlers::admin::create_user),
        )
        .route("/admin/users/:id/plan", put(handlers::admin::set_plan))
        .route("/admin/users/:id/enable", post(handlers::admin::enable_user))
        .route("/admin/users/:id/disable", post(handlers::admin::disable_user))
        .route("/admin/transactions", get(handlers::admin::list_transactions))
        .route(
            "/admin/promotions",
            get(handlers::admin::get_promotion).put(handlers::admin::update_promotion),
        )
        .route("/fraud/check", post(handlers::admin::fraud_check));

    Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .route("/webhooks/nets", post(handlers::webhooks::nets_notification))
        .route("/health", get(handlers::health::health_check))
        .merge(shopper)
        .merge(admin)
}

/// Full application router: the v1 API plus the OpenAPI document, with
/// request ids and HTTP tracing applied to every route.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "supermarket-checkout up" }))
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::routes())
        .layer(crate::tracing::configure_http_tracing())
        .layer(axum::middleware::from_fn(
            crate::tracing::request_id_middleware,
        ))
        .with_state(state)
}
