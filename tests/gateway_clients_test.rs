//! HTTP clients for the PayPal and NETS gateways against mock servers.

use assert_matches::assert_matches;
use serde_json::json;
use supermarket_checkout::{
    config::{NetsSettings, PaypalSettings},
    errors::ServiceError,
    services::payments::{
        hosted::{HostedPaymentGateway, PaypalClient},
        qr::{NetsClient, QrPaymentGateway, QrSignal},
    },
};
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn paypal(server: &MockServer) -> PaypalClient {
    Mock::given(method("POST"))
        .and(path("/v1/oauth2/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": "A21AA-token", "expires_in": 32400 })),
        )
        .mount(server)
        .await;

    PaypalClient::new(
        PaypalSettings {
            base_url: server.uri(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            ..PaypalSettings::default()
        },
        "SGD",
    )
    .unwrap()
}

fn nets(server: &MockServer) -> NetsClient {
    NetsClient::new(NetsSettings {
        base_url: server.uri(),
        api_key: "key".to_string(),
        project_id: "project".to_string(),
        ..NetsSettings::default()
    })
    .unwrap()
}

// ==================== PayPal ====================

#[tokio::test]
async fn paypal_creates_an_order_with_an_approval_link() {
    let server = MockServer::start().await;
    let client = paypal(&server).await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders"))
        .and(header("authorization", "Bearer A21AA-token"))
        .and(body_partial_json(json!({
            "intent": "CAPTURE",
            "purchase_units": [{ "amount": { "currency_code": "SGD", "value": "6.66" } }]
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "5O190127TN364715T",
            "status": "CREATED",
            "links": [
                { "rel": "self", "href": "https://api.paypal.test/v2/checkout/orders/5O190127TN364715T" },
                { "rel": "approve", "href": "https://www.paypal.test/checkoutnow?token=5O190127TN364715T" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let intent = client.create_intent("6.66").await.unwrap();
    assert_eq!(intent.intent_id, "5O190127TN364715T");
    assert_eq!(intent.status, "CREATED");
    assert_eq!(
        intent.approve_url.as_deref(),
        Some("https://www.paypal.test/checkoutnow?token=5O190127TN364715T")
    );
}

#[tokio::test]
async fn paypal_capture_reads_the_capture_id() {
    let server = MockServer::start().await;
    let client = paypal(&server).await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders/ORDER-1/capture"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "ORDER-1",
            "status": "COMPLETED",
            "purchase_units": [{ "payments": { "captures": [{ "id": "3C679366HH908993F" }] } }]
        })))
        .mount(&server)
        .await;

    let capture = client.capture_intent("ORDER-1").await.unwrap();
    assert!(capture.is_success());
    assert_eq!(capture.capture_ref.as_deref(), Some("3C679366HH908993F"));
}

#[tokio::test]
async fn paypal_refund_posts_the_amount() {
    let server = MockServer::start().await;
    let client = paypal(&server).await;
    Mock::given(method("POST"))
        .and(path("/v2/payments/captures/CAP-9/refund"))
        .and(body_partial_json(json!({ "amount": { "value": "3.00" } })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({ "id": "1JU08902781691411", "status": "COMPLETED" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let refund = client.refund_capture("CAP-9", "3.00").await.unwrap();
    assert_eq!(refund.refund_id.as_deref(), Some("1JU08902781691411"));
    assert_eq!(refund.status, "COMPLETED");
}

#[tokio::test]
async fn paypal_errors_surface_as_external_failures() {
    let server = MockServer::start().await;
    let client = paypal(&server).await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders/ORDER-2/capture"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({ "name": "UNPROCESSABLE_ENTITY" })))
        .mount(&server)
        .await;

    let err = client.capture_intent("ORDER-2").await.unwrap_err();
    assert_matches!(err, ServiceError::ExternalServiceError(_));
}

#[tokio::test]
async fn paypal_without_credentials_never_calls_out() {
    let server = MockServer::start().await;
    let client = PaypalClient::new(
        PaypalSettings {
            base_url: server.uri(),
            ..PaypalSettings::default()
        },
        "SGD",
    )
    .unwrap();

    let err = client.create_intent("1.00").await.unwrap_err();
    assert_matches!(err, ServiceError::ExternalServiceError(msg) if msg.contains("not configured"));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

// ==================== NETS ====================

#[tokio::test]
async fn nets_request_returns_the_code_and_reference() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/common/payments/nets-qr/request"))
        .and(header("api-key", "key"))
        .and(header("project-id", "project"))
        .and(body_partial_json(json!({ "amt_in_dollars": "7.40", "txn_id": "txn-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "data": {
                "response_code": "00",
                "txn_status": 1,
                "qr_code": "iVBORw0KGgo=",
                "txn_retrieval_ref": "22012104211800009994"
            } }
        })))
        .mount(&server)
        .await;

    let code = nets(&server).request_code("7.40", "txn-1").await.unwrap();
    assert_eq!(code.retrieval_ref, "22012104211800009994");
    assert_eq!(code.qr_code, "iVBORw0KGgo=");
}

#[tokio::test]
async fn nets_request_failure_reports_the_gateway_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/common/payments/nets-qr/request"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "data": {
                "response_code": "68",
                "txn_status": 2,
                "network_status": 1,
                "error_message": "Issuer unavailable"
            } }
        })))
        .mount(&server)
        .await;

    let err = nets(&server).request_code("7.40", "txn-2").await.unwrap_err();
    assert_matches!(err, ServiceError::PaymentFailed(msg) if msg == "Issuer unavailable");
}

#[tokio::test]
async fn nets_query_maps_to_a_status_report() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/common/payments/nets-qr/query"))
        .and(body_partial_json(json!({ "txn_retrieval_ref": "REF-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "data": { "response_code": "00", "txn_status": 1 } }
        })))
        .mount(&server)
        .await;

    let report = nets(&server).query_status("REF-1").await.unwrap();
    assert_eq!(report.retrieval_ref, "REF-1");
    assert_eq!(report.signal(), QrSignal::Paid);
}

#[tokio::test]
async fn nets_responses_without_data_are_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/common/payments/nets-qr/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": {} })))
        .mount(&server)
        .await;

    let err = nets(&server).query_status("REF-2").await.unwrap_err();
    assert_matches!(err, ServiceError::ExternalServiceError(_));
}
