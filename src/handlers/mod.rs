pub mod accounts;
pub mod admin;
pub mod auth;
pub mod carts;
pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod products;
pub mod refunds;
pub mod webhooks;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::{
    config::AppConfig,
    errors::ServiceError,
    events::EventSender,
    services::{
        accounts::AccountService,
        carts::CartService,
        catalog::CatalogService,
        checkout::CheckoutService,
        fraud::FraudMonitor,
        orders::OrderService,
        payments::{
            CardAdapter, HostedAdapter, HostedPaymentGateway, NetsClient, PaymentAdapters,
            PaypalClient, QrAdapter, QrPaymentGateway, WalletAdapter,
        },
        pricing::LoyaltyPolicy,
        promotions::{PromotionConfig, PromotionService},
        refunds::RefundService,
        transaction_log::TransactionLogService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub catalog: Arc<CatalogService>,
    pub carts: Arc<CartService>,
    pub promotions: Arc<PromotionService>,
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
    pub refunds: Arc<RefundService>,
    pub accounts: Arc<AccountService>,
    pub ledger: Arc<TransactionLogService>,
}

impl AppServices {
    /// Wires every service against the configured PayPal and NETS gateways.
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
    ) -> Result<Self, ServiceError> {
        let hosted: Arc<dyn HostedPaymentGateway> = Arc::new(PaypalClient::new(
            config.paypal.clone(),
            config.currency.clone(),
        )?);
        let qr: Arc<dyn QrPaymentGateway> = Arc::new(NetsClient::new(config.nets.clone())?);
        Ok(Self::with_gateways(db, event_sender, config, hosted, qr))
    }

    /// Same as [`AppServices::new`] with caller-supplied gateways.
    pub fn with_gateways(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
        hosted_gateway: Arc<dyn HostedPaymentGateway>,
        qr_gateway: Arc<dyn QrPaymentGateway>,
    ) -> Self {
        let catalog = CatalogService::new(db.clone(), event_sender.clone());
        let promotions = PromotionService::new(
            PromotionConfig::from(&config.pricing),
            event_sender.clone(),
        );
        let ledger = TransactionLogService::new(
            db.clone(),
            event_sender.clone(),
            FraudMonitor::new(config.fraud.clone()),
        );

        let hosted = Arc::new(HostedAdapter::new(hosted_gateway));
        let adapters = PaymentAdapters {
            wallet: Arc::new(WalletAdapter::new(db.clone(), ledger.clone())),
            card: Arc::new(CardAdapter),
            hosted: hosted.clone(),
            qr: Arc::new(QrAdapter::new(
                ledger.clone(),
                qr_gateway,
                event_sender.clone(),
                &config.nets,
            )),
        };

        let checkout = CheckoutService::new(
            db.clone(),
            event_sender.clone(),
            promotions.clone(),
            LoyaltyPolicy::from(&config.pricing),
            adapters,
            ledger.clone(),
            catalog.clone(),
        );

        Self {
            carts: Arc::new(CartService::new(db.clone(), event_sender.clone())),
            orders: Arc::new(OrderService::new(db.clone(), event_sender.clone())),
            refunds: Arc::new(RefundService::new(
                db.clone(),
                event_sender.clone(),
                ledger.clone(),
                hosted.clone(),
                config.refunds.clone(),
            )),
            accounts: Arc::new(AccountService::new(
                db,
                event_sender,
                ledger.clone(),
                hosted,
            )),
            catalog: Arc::new(catalog),
            promotions: Arc::new(promotions),
            checkout: Arc::new(checkout),
            ledger: Arc::new(ledger),
        }
    }
}
