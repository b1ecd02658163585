use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    Json,
};
use futures::{stream, Stream};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    auth::AuthUser,
    errors::ServiceError,
    handlers::common::{ok, ok_with_message},
    services::{
        checkout::{CheckoutOptions, CheckoutQuote, CheckoutReceipt},
        orders::OrderView,
        payments::{hosted::HostedIntentView, qr::QrCodeView, PaymentRequest, QrState},
        pricing::PriceBreakdown,
    },
    ApiResponse, AppState,
};

#[derive(Debug, Deserialize, IntoParams)]
pub struct QuoteQuery {
    #[serde(default)]
    pub redeem_points: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckoutRequest {
    #[serde(flatten)]
    pub options: CheckoutOptions,
    pub payment: PaymentRequest,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub order: OrderView,
    pub breakdown: PriceBreakdown,
    pub loyalty_points: i64,
    pub wallet_balance: Decimal,
    pub replayed: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QrStatusView {
    pub retrieval_ref: String,
    #[schema(value_type = String, example = "pending")]
    pub state: QrState,
}

fn receipt_response(
    receipt: CheckoutReceipt,
) -> Result<Json<ApiResponse<CheckoutResponse>>, ServiceError> {
    let message = receipt.message;
    let response = CheckoutResponse {
        order: OrderView::try_from(receipt.order)?,
        breakdown: receipt.breakdown,
        loyalty_points: receipt.loyalty_points,
        wallet_balance: receipt.wallet_balance,
        replayed: receipt.replayed,
    };
    Ok(ok_with_message(response, message))
}

#[utoipa::path(
    get,
    path = "/api/v1/checkout/quote",
    summary = "Price the cart",
    description = "Validates the cart and returns the full price breakdown without paying",
    params(QuoteQuery),
    responses(
        (status = 200, description = "Priced cart", body = ApiResponse<CheckoutQuote>),
        (status = 400, description = "Cart empty or invalid", body = crate::errors::ErrorResponse),
        (status = 422, description = "Not enough stock", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn quote(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<QuoteQuery>,
) -> Result<Json<ApiResponse<CheckoutQuote>>, ServiceError> {
    let quote = state
        .services
        .checkout
        .quote(user.user_id, query.redeem_points)
        .await?;
    Ok(ok(quote))
}

#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    summary = "Check out",
    description = "Settles the cart with the given payment method. PayPal and NETS requests capture or confirm a payment started earlier.",
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Order placed"),
        (status = 400, description = "Cart or payment details invalid", body = crate::errors::ErrorResponse),
        (status = 402, description = "Payment declined or wallet balance too low", body = crate::errors::ErrorResponse),
        (status = 422, description = "Not enough stock", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<ApiResponse<CheckoutResponse>>, ServiceError> {
    let receipt = state
        .services
        .checkout
        .checkout(user.user_id, request.options, request.payment)
        .await?;
    receipt_response(receipt)
}

#[utoipa::path(
    post,
    path = "/api/v1/checkout/paypal",
    summary = "Start PayPal checkout",
    description = "Creates a PayPal order for the current cart total and returns the approval link",
    request_body = CheckoutOptions,
    responses(
        (status = 200, description = "Intent created", body = ApiResponse<HostedIntentView>),
        (status = 502, description = "PayPal unavailable", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn begin_paypal(
    State(state): State<AppState>,
    user: AuthUser,
    Json(options): Json<CheckoutOptions>,
) -> Result<Json<ApiResponse<HostedIntentView>>, ServiceError> {
    Ok(ok(state
        .services
        .checkout
        .begin_hosted(user.user_id, options)
        .await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/checkout/paypal/{intent_id}/capture",
    summary = "Capture PayPal checkout",
    params(("intent_id" = String, Path, description = "PayPal order id")),
    responses(
        (status = 200, description = "Order placed"),
        (status = 402, description = "Capture declined or amount changed", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown intent", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn capture_paypal(
    State(state): State<AppState>,
    user: AuthUser,
    Path(intent_id): Path<String>,
) -> Result<Json<ApiResponse<CheckoutResponse>>, ServiceError> {
    let receipt = state
        .services
        .checkout
        .capture_hosted(user.user_id, &intent_id)
        .await?;
    receipt_response(receipt)
}

#[utoipa::path(
    post,
    path = "/api/v1/checkout/nets",
    summary = "Start NETS QR checkout",
    description = "Requests a QR code for the current cart total. The checkout choices are kept until the payment is confirmed or times out.",
    request_body = CheckoutOptions,
    responses(
        (status = 200, description = "QR code generated", body = ApiResponse<QrCodeView>),
        (status = 502, description = "NETS unavailable", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn begin_nets(
    State(state): State<AppState>,
    user: AuthUser,
    Json(options): Json<CheckoutOptions>,
) -> Result<Json<ApiResponse<QrCodeView>>, ServiceError> {
    Ok(ok(state
        .services
        .checkout
        .begin_qr(user.user_id, options)
        .await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/checkout/nets/{retrieval_ref}/status",
    summary = "Poll NETS payment",
    params(("retrieval_ref" = String, Path, description = "QR retrieval reference")),
    responses(
        (status = 200, description = "Current state", body = ApiResponse<QrStatusView>),
        (status = 404, description = "Unknown or expired reference", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn nets_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(retrieval_ref): Path<String>,
) -> Result<Json<ApiResponse<QrStatusView>>, ServiceError> {
    let current = state
        .services
        .checkout
        .qr_status(user.user_id, &retrieval_ref)
        .await?;
    Ok(ok(QrStatusView {
        retrieval_ref,
        state: current,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/checkout/nets/{retrieval_ref}/events",
    summary = "Stream NETS payment state",
    description = "Server-sent `status` events: the current state first, then every change. The stream ends once the payment leaves `pending`.",
    params(("retrieval_ref" = String, Path, description = "QR retrieval reference")),
    responses(
        (status = 200, description = "text/event-stream of state names"),
        (status = 404, description = "Unknown or expired reference", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn nets_events(
    State(state): State<AppState>,
    user: AuthUser,
    Path(retrieval_ref): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ServiceError> {
    let rx = state
        .services
        .checkout
        .qr_updates(user.user_id, &retrieval_ref)?;

    let events = stream::unfold((rx, true, false), |(mut rx, first, done)| async move {
        if done {
            return None;
        }
        // A closed channel means the session was dropped after its last update.
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let current = *rx.borrow_and_update();
        let event = SseEvent::default()
            .event("status")
            .data(current.to_string());
        Some((Ok(event), (rx, false, current != QrState::Pending)))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[utoipa::path(
    post,
    path = "/api/v1/checkout/nets/{retrieval_ref}/confirm",
    summary = "Confirm NETS checkout",
    description = "Settles a paid QR code. Repeating the call returns the order already placed.",
    params(("retrieval_ref" = String, Path, description = "QR retrieval reference")),
    responses(
        (status = 200, description = "Order placed"),
        (status = 402, description = "Payment not completed", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown or expired reference", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn confirm_nets(
    State(state): State<AppState>,
    user: AuthUser,
    Path(retrieval_ref): Path<String>,
) -> Result<Json<ApiResponse<CheckoutResponse>>, ServiceError> {
    let receipt = state
        .services
        .checkout
        .confirm_qr(user.user_id, &retrieval_ref)
        .await?;
    receipt_response(receipt)
}
