//! Refund request lifecycle: submission rules, admin decisions and payouts.

mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::TestApp;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use supermarket_checkout::{
    entities::{
        order::{self, OrderStatus},
        order_item,
        refund_request::{RefundDestination, RefundStatus},
        transaction_log::{self, TransactionAction},
        user_account::MembershipPlan,
    },
    errors::ServiceError,
    services::{
        checkout::{CheckoutOptions, CheckoutReceipt},
        payments::PaymentRequest,
        refunds::{RefundInput, RefundLineInput},
    },
};
use uuid::Uuid;

async fn wallet_order(app: &TestApp, user_id: Uuid) -> (CheckoutReceipt, Uuid) {
    let (milk, _) = app.milk_and_bread_cart(user_id).await;
    let receipt = app
        .services()
        .checkout
        .checkout(user_id, CheckoutOptions::default(), PaymentRequest::Wallet)
        .await
        .expect("checkout succeeds");
    (receipt, milk.id)
}

fn whole_order(order_id: Uuid) -> RefundInput {
    RefundInput {
        order_id,
        reason: "Damaged packaging".to_string(),
        evidence_ref: None,
        destination: RefundDestination::Wallet,
        items: Vec::new(),
    }
}

fn one_unit(order_id: Uuid, product_id: Uuid) -> RefundInput {
    RefundInput {
        items: vec![RefundLineInput {
            product_id,
            quantity: 1,
        }],
        ..whole_order(order_id)
    }
}

#[tokio::test]
async fn partial_refund_credits_the_wallet() {
    let app = TestApp::new().await;
    let user = app.create_user("refund@store.test", MembershipPlan::Gold).await;
    app.fund_wallet(user.id, dec!(10.00)).await;
    let (receipt, milk_id) = wallet_order(&app, user.id).await;

    let view = app
        .services()
        .refunds
        .submit(user.id, one_unit(receipt.order.id, milk_id))
        .await
        .expect("refund submitted");
    assert_eq!(view.request.status, RefundStatus::Pending);
    assert_eq!(view.request.amount, dec!(3.00));
    assert_eq!(view.items.len(), 1);

    let approved = app
        .services()
        .refunds
        .approve(view.request.id, Some("Confirmed with store".to_string()))
        .await
        .expect("refund approved");
    assert_eq!(approved.request.status, RefundStatus::Approved);
    assert!(approved.request.processed_at.is_some());
    assert_eq!(approved.request.admin_note.as_deref(), Some("Confirmed with store"));

    assert_eq!(app.user(user.id).await.wallet_balance(), dec!(3.34) + dec!(3.00));

    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(receipt.order.id))
        .all(app.db())
        .await
        .unwrap();
    let milk = items.iter().find(|i| i.product_id == milk_id).unwrap();
    assert_eq!(milk.refunded_quantity, 1);
    assert!(items
        .iter()
        .filter(|i| i.product_id != milk_id)
        .all(|i| i.refunded_quantity == 0));

    let order = order::Entity::find_by_id(receipt.order.id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.total, receipt.order.total);
    assert_eq!(order.status, OrderStatus::Processing);

    let refund_entry = transaction_log::Entity::find()
        .filter(transaction_log::Column::Action.eq(TransactionAction::Refund))
        .one(app.db())
        .await
        .unwrap()
        .expect("refund logged");
    assert_eq!(refund_entry.amount, dec!(3.00));
    assert_eq!(refund_entry.reference_id, Some(view.request.id));
}

#[tokio::test]
async fn second_request_while_one_is_open_conflicts() {
    let app = TestApp::new().await;
    let user = app.create_user("twice@store.test", MembershipPlan::Basic).await;
    app.fund_wallet(user.id, dec!(20.00)).await;
    let (receipt, milk_id) = wallet_order(&app, user.id).await;

    app.services()
        .refunds
        .submit(user.id, one_unit(receipt.order.id, milk_id))
        .await
        .unwrap();
    let err = app
        .services()
        .refunds
        .submit(user.id, whole_order(receipt.order.id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));
}

#[tokio::test]
async fn requests_after_the_window_are_rejected() {
    let app = TestApp::new().await;
    let user = app.create_user("late@store.test", MembershipPlan::Basic).await;
    app.fund_wallet(user.id, dec!(20.00)).await;
    let (receipt, _) = wallet_order(&app, user.id).await;

    let mut active: order::ActiveModel = receipt.order.clone().into();
    active.confirmed_at = Set(Some(Utc::now() - Duration::minutes(31)));
    active.update(app.db()).await.unwrap();

    let err = app
        .services()
        .refunds
        .submit(user.id, whole_order(receipt.order.id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(msg) if msg.contains("30 minutes"));
}

#[tokio::test]
async fn only_the_buyer_may_request_a_refund() {
    let app = TestApp::new().await;
    let buyer = app.create_user("buyer@store.test", MembershipPlan::Basic).await;
    let other = app.create_user("other@store.test", MembershipPlan::Basic).await;
    app.fund_wallet(buyer.id, dec!(20.00)).await;
    let (receipt, _) = wallet_order(&app, buyer.id).await;

    let err = app
        .services()
        .refunds
        .submit(other.id, whole_order(receipt.order.id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(_));
}

#[tokio::test]
async fn frequent_requests_are_flagged_and_suspend_refunds() {
    let app = TestApp::new().await;
    let user = app.create_user("often@store.test", MembershipPlan::Basic).await;
    app.fund_wallet(user.id, dec!(50.00)).await;

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let (receipt, milk_id) = wallet_order(&app, user.id).await;
        let view = app
            .services()
            .refunds
            .submit(user.id, one_unit(receipt.order.id, milk_id))
            .await
            .expect("refund submitted");
        statuses.push((view.request.status, view.request.admin_note));
    }

    assert_eq!(statuses[0].0, RefundStatus::Pending);
    assert_eq!(statuses[1].0, RefundStatus::Pending);
    assert_eq!(statuses[2].0, RefundStatus::Flagged);
    assert_eq!(
        statuses[2].1.as_deref(),
        Some("Auto-flagged due to frequent refunds.")
    );

    let until = app.user(user.id).await.refund_flag_until.expect("suspended");
    assert!(until > Utc::now() + Duration::minutes(29));

    let (receipt, _) = wallet_order(&app, user.id).await;
    let err = app
        .services()
        .refunds
        .submit(user.id, whole_order(receipt.order.id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(msg) if msg.contains("flagged"));
}

#[tokio::test]
async fn denied_requests_are_final() {
    let app = TestApp::new().await;
    let user = app.create_user("denied@store.test", MembershipPlan::Basic).await;
    app.fund_wallet(user.id, dec!(20.00)).await;
    let (receipt, _) = wallet_order(&app, user.id).await;
    let balance = app.user(user.id).await.wallet_balance();

    let view = app
        .services()
        .refunds
        .submit(user.id, whole_order(receipt.order.id))
        .await
        .unwrap();
    let denied = app
        .services()
        .refunds
        .deny(view.request.id, None)
        .await
        .unwrap();
    assert_eq!(denied.request.status, RefundStatus::Denied);
    assert_eq!(app.user(user.id).await.wallet_balance(), balance);

    let err = app
        .services()
        .refunds
        .approve(view.request.id, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}

#[tokio::test]
async fn paypal_orders_refund_to_the_original_capture() {
    let app = TestApp::new().await;
    let user = app.create_user("pp-refund@store.test", MembershipPlan::Gold).await;
    let (milk, _) = app.milk_and_bread_cart(user.id).await;
    let intent = app
        .services()
        .checkout
        .begin_hosted(user.id, CheckoutOptions::default())
        .await
        .unwrap();
    let receipt = app
        .services()
        .checkout
        .capture_hosted(user.id, &intent.intent_id)
        .await
        .unwrap();

    let view = app
        .services()
        .refunds
        .submit(
            user.id,
            RefundInput {
                destination: RefundDestination::OriginalMethod,
                ..one_unit(receipt.order.id, milk.id)
            },
        )
        .await
        .unwrap();
    let approved = app
        .services()
        .refunds
        .approve(view.request.id, None)
        .await
        .unwrap();

    let capture_ref = format!("CAP-{}", intent.intent_id);
    assert_eq!(
        app.hosted.refunds.lock().unwrap().as_slice(),
        [(capture_ref.clone(), "3.00".to_string())]
    );
    assert_eq!(
        approved.request.external_ref,
        Some(format!("REF-{capture_ref}"))
    );
    // Paid back through PayPal, so the wallet is untouched.
    assert_eq!(app.user(user.id).await.wallet_balance(), dec!(0));
}

#[tokio::test]
async fn admin_listing_is_paged_newest_first() {
    let app = TestApp::new().await;
    let mut ids = Vec::new();
    for n in 0..3 {
        let user = app
            .create_user(&format!("pager{n}@store.test"), MembershipPlan::Basic)
            .await;
        app.fund_wallet(user.id, dec!(20.00)).await;
        let (receipt, _) = wallet_order(&app, user.id).await;
        let view = app
            .services()
            .refunds
            .submit(user.id, whole_order(receipt.order.id))
            .await
            .unwrap();
        ids.push(view.request.id);
    }

    let (first, total) = app.services().refunds.list_all(1, 2).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(first.len(), 2);
    let (second, _) = app.services().refunds.list_all(2, 2).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].request.id, ids[0]);
}

#[tokio::test]
async fn cancelled_orders_cannot_be_refunded() {
    let app = TestApp::new().await;
    let user = app.create_user("cancelled@store.test", MembershipPlan::Basic).await;
    app.fund_wallet(user.id, dec!(10.00)).await;
    let (receipt, _) = wallet_order(&app, user.id).await;

    let pending = app
        .services()
        .refunds
        .submit(user.id, whole_order(receipt.order.id))
        .await
        .expect("refund submitted");

    // Checkout gave the money back when it cancelled the order.
    let mut active: order::ActiveModel = receipt.order.clone().into();
    active.status = Set(OrderStatus::Cancelled);
    active.update(app.db()).await.unwrap();
    app.fund_wallet(user.id, receipt.order.total).await;

    let err = app
        .services()
        .refunds
        .approve(pending.request.id, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let err = app
        .services()
        .refunds
        .submit(user.id, whole_order(receipt.order.id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(msg) if msg.contains("Cancelled"));

    assert_eq!(app.user(user.id).await.wallet_balance(), dec!(10.00));
}

#[tokio::test]
async fn disabled_accounts_cannot_request_refunds() {
    let app = TestApp::new().await;
    let user = app.create_user("disabled@store.test", MembershipPlan::Basic).await;
    app.fund_wallet(user.id, dec!(10.00)).await;
    let (receipt, _) = wallet_order(&app, user.id).await;
    app.services()
        .accounts
        .set_disabled(user.id, true)
        .await
        .unwrap();

    let err = app
        .services()
        .refunds
        .submit(user.id, whole_order(receipt.order.id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(msg) if msg.contains("disabled"));
}
