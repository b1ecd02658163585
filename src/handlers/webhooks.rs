use axum::{extract::State, http::HeaderMap, Json};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    errors::ServiceError,
    handlers::common::ok,
    services::payments::qr::QrStatusReport,
    ApiResponse, AppState,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub retrieval_ref: String,
    /// New session state, absent when the notification changed nothing
    pub state: Option<String>,
}

// POST /api/v1/webhooks/nets
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/nets",
    summary = "NETS payment notification",
    description = "Pushed QR payment status. When a webhook secret is configured the request must carry `x-timestamp` and `x-signature` (hex HMAC-SHA256 of `{timestamp}.{body}`).",
    request_body = String,
    responses(
        (status = 200, description = "Notification accepted", body = ApiResponse<WebhookAck>),
        (status = 400, description = "Invalid payload", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
    ),
    tag = "Webhooks"
)]
pub async fn nets_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Bytes,
) -> Result<Json<ApiResponse<WebhookAck>>, ServiceError> {
    if let Some(secret) = state.config.nets.webhook_secret.as_deref() {
        if !verify_signature(&headers, &payload, secret, state.config.nets.webhook_tolerance_secs) {
            warn!("NETS webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    }

    let report = parse_report(&payload)?;
    let next = state.services.checkout.apply_qr_report(&report).await;
    info!(retrieval_ref = %report.retrieval_ref, state = ?next, "NETS notification received");

    Ok(ok(WebhookAck {
        retrieval_ref: report.retrieval_ref,
        state: next.map(|s| s.to_string()),
    }))
}

/// Accepts the report either bare or wrapped in the gateway's `data` envelope.
fn parse_report(payload: &[u8]) -> Result<QrStatusReport, ServiceError> {
    let json: Value = serde_json::from_slice(payload)
        .map_err(|e| ServiceError::InvalidInput(format!("invalid json: {}", e)))?;
    let body = match json.get("data") {
        Some(data) if data.is_object() => data.clone(),
        _ => json,
    };
    serde_json::from_value(body)
        .map_err(|e| ServiceError::InvalidInput(format!("invalid notification: {}", e)))
}

fn verify_signature(headers: &HeaderMap, payload: &[u8], secret: &str, tolerance_secs: u64) -> bool {
    let (Some(ts), Some(sig)) = (
        headers.get("x-timestamp").and_then(|h| h.to_str().ok()),
        headers.get("x-signature").and_then(|h| h.to_str().ok()),
    ) else {
        return false;
    };
    let Ok(ts_i) = ts.parse::<i64>() else {
        return false;
    };
    if (chrono::Utc::now().timestamp() - ts_i).unsigned_abs() > tolerance_secs {
        return false;
    }
    let Ok(signature) = hex::decode(sig.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}
