#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{header, Method, Request},
    response::Response,
    Router,
};
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use serde_json::Value;
use supermarket_checkout::{
    app_router,
    auth::{AuthConfig, AuthService},
    config::AppConfig,
    db,
    entities::{product, user_account},
    errors::ServiceError,
    events::{self, EventSender},
    handlers::AppServices,
    services::{
        accounts::{adjust_points, credit_wallet, NewAccount},
        catalog::ProductInput,
        payments::{
            hosted::{GatewayCapture, GatewayIntent, GatewayRefund, HostedPaymentGateway},
            qr::{GatewayQrCode, QrPaymentGateway, QrStatusReport},
        },
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const PASSWORD: &str = "correct-horse-battery";

/// PayPal stand-in: intents are numbered, captures answer with a
/// configurable status and refunds are recorded.
#[derive(Default)]
pub struct FakeHostedGateway {
    counter: AtomicU32,
    capture_status: Mutex<Option<String>>,
    before_capture: Mutex<Option<BoxFuture<'static, ()>>>,
    pub created: Mutex<Vec<String>>,
    pub refunds: Mutex<Vec<(String, String)>>,
}

impl FakeHostedGateway {
    pub fn decline_captures(&self) {
        *self.capture_status.lock().unwrap() = Some("DECLINED".to_string());
    }

    /// Runs `work` inside the next capture call, before the capture answers.
    pub fn before_next_capture(&self, work: impl Future<Output = ()> + Send + 'static) {
        *self.before_capture.lock().unwrap() = Some(Box::pin(work));
    }
}

#[async_trait]
impl HostedPaymentGateway for FakeHostedGateway {
    async fn create_intent(&self, amount: &str) -> Result<GatewayIntent, ServiceError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.lock().unwrap().push(amount.to_string());
        Ok(GatewayIntent {
            intent_id: format!("PAY-{n}"),
            status: "CREATED".to_string(),
            approve_url: Some(format!("https://paypal.test/approve/PAY-{n}")),
        })
    }

    async fn capture_intent(&self, intent_id: &str) -> Result<GatewayCapture, ServiceError> {
        let hook = self.before_capture.lock().unwrap().take();
        if let Some(hook) = hook {
            hook.await;
        }
        let status = self
            .capture_status
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "COMPLETED".to_string());
        Ok(GatewayCapture {
            status,
            capture_ref: Some(format!("CAP-{intent_id}")),
        })
    }

    async fn refund_capture(
        &self,
        capture_ref: &str,
        amount: &str,
    ) -> Result<GatewayRefund, ServiceError> {
        self.refunds
            .lock()
            .unwrap()
            .push((capture_ref.to_string(), amount.to_string()));
        Ok(GatewayRefund {
            refund_id: Some(format!("REF-{capture_ref}")),
            status: "COMPLETED".to_string(),
        })
    }
}

/// NETS stand-in: codes are numbered and status queries answer "in
/// progress" unless a report was staged with [`FakeQrGateway::stage`].
#[derive(Default)]
pub struct FakeQrGateway {
    counter: AtomicU32,
    staged: Mutex<HashMap<String, QrStatusReport>>,
    pub requested: Mutex<Vec<(String, String)>>,
}

impl FakeQrGateway {
    pub fn stage(&self, report: QrStatusReport) {
        self.staged
            .lock()
            .unwrap()
            .insert(report.retrieval_ref.clone(), report);
    }
}

#[async_trait]
impl QrPaymentGateway for FakeQrGateway {
    async fn request_code(&self, amount: &str, txn_id: &str) -> Result<GatewayQrCode, ServiceError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.requested
            .lock()
            .unwrap()
            .push((amount.to_string(), txn_id.to_string()));
        Ok(GatewayQrCode {
            qr_code: "iVBORw0KGgo=".to_string(),
            retrieval_ref: format!("NETS-REF-{n}"),
        })
    }

    async fn query_status(&self, retrieval_ref: &str) -> Result<QrStatusReport, ServiceError> {
        Ok(self
            .staged
            .lock()
            .unwrap()
            .get(retrieval_ref)
            .cloned()
            .unwrap_or_else(|| in_progress(retrieval_ref)))
    }
}

pub fn in_progress(retrieval_ref: &str) -> QrStatusReport {
    QrStatusReport {
        retrieval_ref: retrieval_ref.to_string(),
        response_code: Some("09".to_string()),
        txn_status: Some(0),
    }
}

pub fn paid(retrieval_ref: &str) -> QrStatusReport {
    QrStatusReport {
        retrieval_ref: retrieval_ref.to_string(),
        response_code: Some("00".to_string()),
        txn_status: Some(1),
    }
}

pub fn declined(retrieval_ref: &str) -> QrStatusReport {
    QrStatusReport {
        retrieval_ref: retrieval_ref.to_string(),
        response_code: Some("00".to_string()),
        txn_status: Some(2),
    }
}

/// Application state backed by an in-memory SQLite database and fake gateways.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub hosted: Arc<FakeHostedGateway>,
    pub qr: Arc<FakeQrGateway>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Builds the app after letting the caller adjust the configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            TEST_JWT_SECRET.to_string(),
            18_080,
            "test".to_string(),
        );
        // One connection keeps every query on the same in-memory database.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        adjust(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let (tx, rx) = mpsc::channel(cfg.event_channel_capacity);
        let event_task = tokio::spawn(events::process_events(rx));
        let event_sender = Arc::new(EventSender::new(tx));

        let hosted = Arc::new(FakeHostedGateway::default());
        let qr = Arc::new(FakeQrGateway::default());
        let services = AppServices::with_gateways(
            db.clone(),
            event_sender,
            &cfg,
            hosted.clone(),
            qr.clone(),
        );

        let auth = Arc::new(AuthService::new(
            AuthConfig::new(
                cfg.jwt_secret.clone(),
                std::time::Duration::from_secs(cfg.jwt_expiration_secs),
            ),
            db.clone(),
        ));

        let state = AppState {
            db,
            config: Arc::new(cfg),
            auth,
            services,
        };

        Self {
            router: app_router(state.clone()),
            state,
            hosted,
            qr,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.state.db
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    pub async fn create_user(&self, email: &str, plan: user_account::MembershipPlan) -> user_account::Model {
        self.services()
            .accounts
            .create_user(NewAccount {
                username: email.split('@').next().unwrap_or(email).to_string(),
                email: email.to_string(),
                password: PASSWORD.to_string(),
                role: None,
                plan: Some(plan),
            })
            .await
            .expect("create user")
    }

    pub async fn create_admin(&self) -> user_account::Model {
        self.services()
            .accounts
            .create_user(NewAccount {
                username: "admin".to_string(),
                email: "admin@store.test".to_string(),
                password: PASSWORD.to_string(),
                role: Some(user_account::UserRole::Admin),
                plan: None,
            })
            .await
            .expect("create admin")
    }

    pub async fn fund_wallet(&self, user_id: Uuid, amount: Decimal) {
        credit_wallet(self.db(), user_id, amount)
            .await
            .expect("fund wallet");
    }

    pub async fn grant_points(&self, user_id: Uuid, points: i64) {
        adjust_points(self.db(), user_id, points)
            .await
            .expect("grant points");
    }

    pub async fn user(&self, user_id: Uuid) -> user_account::Model {
        self.services()
            .accounts
            .get_user(user_id)
            .await
            .expect("load user")
    }

    pub async fn create_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        self.services()
            .catalog
            .create_product(ProductInput {
                name: name.to_string(),
                description: None,
                category: Some("Groceries".to_string()),
                image_url: None,
                price,
                stock,
                discount_percent: 0,
            })
            .await
            .expect("create product")
    }

    pub async fn product(&self, id: Uuid) -> product::Model {
        self.services()
            .catalog
            .require_product(id)
            .await
            .expect("load product")
    }

    pub async fn add_to_cart(&self, user_id: Uuid, product_id: Uuid, quantity: i32) {
        self.services()
            .carts
            .add_item(user_id, product_id, quantity)
            .await
            .expect("add to cart");
    }

    /// 2x "Fresh Milk" @ 3.00 and 1x "Bread" @ 2.00 in the user's cart.
    pub async fn milk_and_bread_cart(&self, user_id: Uuid) -> (product::Model, product::Model) {
        let milk = self.create_product("Fresh Milk", Decimal::new(300, 2), 20).await;
        let bread = self.create_product("Bread", Decimal::new(200, 2), 20).await;
        self.add_to_cart(user_id, milk.id, 2).await;
        self.add_to_cart(user_id, bread.id, 1).await;
        (milk, bread)
    }

    pub fn token_for(&self, user: &user_account::Model) -> String {
        self.state
            .auth
            .generate_token(user)
            .expect("token")
            .access_token
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.router.clone().oneshot(request).await.unwrap()
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
