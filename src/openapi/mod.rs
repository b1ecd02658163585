use axum::{routing::get, Json, Router};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Supermarket Checkout API",
        version = "1.0.0",
        description = r#"
# Supermarket Checkout API

Catalog browsing, carts and checkout for a single-store online supermarket.

## Authentication

Sign in with `POST /api/v1/auth/login` and send the returned token on every other call:

```
Authorization: Bearer <your-jwt-token>
```

Accounts are created by administrators. Endpoints under `/admin` and `/fraud` need the admin role.

## Money

Amounts are decimal strings in dollars with two fractional digits, e.g. `"6.36"`.

## Pagination

List endpoints accept `page` (default 1) and `limit` (default 20, max 100).
        "#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers((url = "http://localhost:8080", description = "Local development")),
    tags(
        (name = "Auth", description = "Sign-in"),
        (name = "Catalog", description = "Products and stock"),
        (name = "Cart", description = "Per-user cart"),
        (name = "Checkout", description = "Pricing and settlement"),
        (name = "Orders", description = "Order history and fulfilment"),
        (name = "Refunds", description = "Refund requests and review"),
        (name = "Account", description = "Profile and ledger history"),
        (name = "Membership", description = "Membership plans"),
        (name = "Wallet", description = "Stored balance and loyalty points"),
        (name = "Admin", description = "Administrative endpoints"),
        (name = "Webhooks", description = "Payment provider callbacks"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        // Auth
        crate::handlers::auth::login,
        // Catalog
        crate::handlers::products::list_products,
        crate::handlers::products::bestsellers,
        crate::handlers::products::get_product,
        crate::handlers::products::create_product,
        crate::handlers::products::update_product,
        crate::handlers::products::delete_product,
        crate::handlers::products::restock,
        // Cart
        crate::handlers::carts::get_cart,
        crate::handlers::carts::add_item,
        crate::handlers::carts::update_item,
        crate::handlers::carts::remove_item,
        crate::handlers::carts::save_cart,
        crate::handlers::carts::clear_cart,
        // Checkout
        crate::handlers::checkout::quote,
        crate::handlers::checkout::checkout,
        crate::handlers::checkout::begin_paypal,
        crate::handlers::checkout::capture_paypal,
        crate::handlers::checkout::begin_nets,
        crate::handlers::checkout::nets_status,
        crate::handlers::checkout::nets_events,
        crate::handlers::checkout::confirm_nets,
        // Orders
        crate::handlers::orders::list_my_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::list_all_orders,
        crate::handlers::orders::update_order_status,
        crate::handlers::orders::delete_order,
        // Refunds
        crate::handlers::refunds::submit_refund,
        crate::handlers::refunds::list_my_refunds,
        crate::handlers::refunds::list_all_refunds,
        crate::handlers::refunds::approve_refund,
        crate::handlers::refunds::deny_refund,
        // Account, membership and wallet
        crate::handlers::accounts::me,
        crate::handlers::accounts::dismiss_warning,
        crate::handlers::accounts::my_transactions,
        crate::handlers::accounts::plans,
        crate::handlers::accounts::subscribe,
        crate::handlers::accounts::begin_paypal_subscription,
        crate::handlers::accounts::capture_paypal_subscription,
        crate::handlers::accounts::wallet,
        crate::handlers::accounts::top_up_card,
        crate::handlers::accounts::begin_paypal_top_up,
        crate::handlers::accounts::capture_paypal_top_up,
        // Admin
        crate::handlers::admin::create_user,
        crate::handlers::admin::list_users,
        crate::handlers::admin::set_plan,
        crate::handlers::admin::enable_user,
        crate::handlers::admin::disable_user,
        crate::handlers::admin::list_transactions,
        crate::handlers::admin::get_promotion,
        crate::handlers::admin::update_promotion,
        crate::handlers::admin::fraud_check,
        // Webhooks
        crate::handlers::webhooks::nets_notification,
        // Health
        crate::handlers::health::health_check,
    ),
    components(
        schemas(
            // Common types
            crate::handlers::common::Acknowledged,
            crate::errors::ErrorResponse,

            // Auth
            crate::auth::LoginCredentials,
            crate::auth::TokenPair,

            // Catalog and cart
            crate::services::catalog::ProductInput,
            crate::handlers::products::RestockRequest,
            crate::services::carts::CartLineInput,
            crate::handlers::carts::QuantityRequest,
            crate::handlers::carts::SaveCartRequest,

            // Checkout
            crate::services::checkout::CheckoutOptions,
            crate::services::checkout::CheckoutQuote,
            crate::services::checkout::QuoteLine,
            crate::services::pricing::PriceBreakdown,
            crate::services::payments::PaymentRequest,
            crate::services::payments::card::CardDetails,
            crate::services::payments::hosted::HostedIntentView,
            crate::services::payments::qr::QrCodeView,
            crate::services::payments::qr::QrStatusReport,
            crate::handlers::checkout::CheckoutRequest,
            crate::handlers::checkout::QrStatusView,

            // Orders and refunds
            crate::handlers::orders::StatusUpdateRequest,
            crate::services::refunds::RefundInput,
            crate::services::refunds::RefundLineInput,
            crate::handlers::refunds::RefundDecision,

            // Accounts
            crate::services::accounts::NewAccount,
            crate::services::accounts::PlanView,
            crate::services::accounts::PlanPayment,
            crate::services::accounts::MembershipReceipt,
            crate::services::accounts::BalanceChange,
            crate::handlers::accounts::WalletView,
            crate::handlers::accounts::SubscribeRequest,
            crate::handlers::accounts::PlanRequest,
            crate::handlers::accounts::CardTopUpRequest,
            crate::handlers::accounts::TopUpRequest,

            // Admin
            crate::services::promotions::PromotionConfig,
            crate::handlers::admin::PromotionUpdateRequest,
            crate::services::fraud::FraudCheck,
            crate::services::fraud::FraudVerdict,
            crate::handlers::webhooks::WebhookAck,
            crate::handlers::health::HealthStatus,
        )
    ),
    modifiers(&BearerAuth)
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "Bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

/// Serves the generated document at `/api-docs/openapi.json`.
pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/api-docs/openapi.json",
        get(|| async { Json(ApiDoc::openapi()) }),
    )
}
