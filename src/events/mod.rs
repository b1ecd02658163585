use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::order::{OrderStatus, PaymentMethod};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "dropping domain event");
        }
    }
}

/// Domain events emitted by the checkout services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Catalog
    ProductCreated(Uuid),
    ProductUpdated(Uuid),
    ProductDeleted(Uuid),
    StockDepleted {
        product_id: Uuid,
    },

    // Cart
    CartUpdated(Uuid),
    CartCleared(Uuid),

    // Orders
    OrderPlaced {
        order_id: Uuid,
        user_id: Uuid,
        total: Decimal,
        payment_method: PaymentMethod,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled {
        order_id: Uuid,
        reason: String,
    },
    OrderDeleted(Uuid),

    // Payments
    PaymentCaptured {
        user_id: Uuid,
        method: PaymentMethod,
        amount: Decimal,
        reference: Option<String>,
    },
    PaymentFailed {
        user_id: Uuid,
        method: PaymentMethod,
        reason: String,
    },
    PaymentCompensated {
        user_id: Uuid,
        method: PaymentMethod,
        amount: Decimal,
    },
    QrPaymentStateChanged {
        retrieval_ref: String,
        state: String,
    },

    // Refunds
    RefundRequested {
        refund_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
    },
    RefundFlagged {
        refund_id: Uuid,
        user_id: Uuid,
        suspended_until: DateTime<Utc>,
    },
    RefundApproved {
        refund_id: Uuid,
        amount: Decimal,
    },
    RefundDenied(Uuid),

    // Accounts
    MembershipChanged {
        user_id: Uuid,
        plan: String,
    },
    WalletToppedUp {
        user_id: Uuid,
        amount: Decimal,
    },
    AccountWarned {
        user_id: Uuid,
        reason: String,
    },
    AccountDisabled {
        user_id: Uuid,
        reason: String,
    },
    AccountReenabled(Uuid),

    // Promotions
    PromotionUpdated {
        keywords: Vec<String>,
        percent: Decimal,
    },
}

/// Drains the event channel, logging every event at a severity matching its kind.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderPlaced {
                order_id,
                user_id,
                total,
                payment_method,
            } => {
                info!(%order_id, %user_id, %total, %payment_method, "order placed");
            }
            Event::OrderCancelled { order_id, reason } => {
                warn!(%order_id, %reason, "order cancelled");
            }
            Event::PaymentFailed {
                user_id,
                method,
                reason,
            } => {
                warn!(%user_id, %method, %reason, "payment failed");
            }
            Event::PaymentCompensated {
                user_id,
                method,
                amount,
            } => {
                warn!(%user_id, %method, %amount, "payment compensated");
            }
            Event::RefundFlagged {
                refund_id,
                user_id,
                suspended_until,
            } => {
                warn!(%refund_id, %user_id, %suspended_until, "refund auto-flagged");
            }
            Event::AccountWarned { user_id, reason } => {
                warn!(%user_id, %reason, "fraud warning issued");
            }
            Event::AccountDisabled { user_id, reason } => {
                error!(%user_id, %reason, "account disabled by fraud monitor");
            }
            Event::StockDepleted { product_id } => {
                warn!(%product_id, "product out of stock");
            }
            other => {
                info!(event = ?other, "domain event");
            }
        }
    }

    warn!("Event processing loop has ended");
}
