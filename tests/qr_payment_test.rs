//! NETS QR checkout: code issuance, gateway notifications, confirmation
//! and expiry.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::{declined, in_progress, paid, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{EntityTrait, PaginatorTrait};
use supermarket_checkout::{
    entities::{
        order::{self, PaymentMethod},
        transaction_log::TransactionAction,
        user_account::MembershipPlan,
    },
    errors::ServiceError,
    services::{checkout::CheckoutOptions, payments::qr::QrState},
};

#[tokio::test]
async fn code_is_issued_for_the_priced_total() {
    let app = TestApp::new().await;
    let user = app.create_user("qr@store.test", MembershipPlan::Gold).await;
    app.milk_and_bread_cart(user.id).await;

    let code = app
        .services()
        .checkout
        .begin_qr(user.id, CheckoutOptions::default())
        .await
        .expect("code issued");
    assert_eq!(code.amount, dec!(6.66));
    assert_eq!(code.retrieval_ref, "NETS-REF-1");
    assert_eq!(code.expires_in_secs, 240);

    let requested = app.qr.requested.lock().unwrap().clone();
    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].0, "6.66");
}

#[tokio::test]
async fn confirming_before_payment_fails() {
    let app = TestApp::new().await;
    let user = app.create_user("early@store.test", MembershipPlan::Basic).await;
    app.milk_and_bread_cart(user.id).await;
    let code = app
        .services()
        .checkout
        .begin_qr(user.id, CheckoutOptions::default())
        .await
        .unwrap();

    let err = app
        .services()
        .checkout
        .confirm_qr(user.id, &code.retrieval_ref)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentFailed(_));
    assert_eq!(order::Entity::find().count(app.db()).await.unwrap(), 0);

    // Still pending, so a later payment can settle.
    let state = app
        .services()
        .checkout
        .qr_status(user.id, &code.retrieval_ref)
        .await
        .unwrap();
    assert_eq!(state, QrState::Pending);
}

#[tokio::test]
async fn paid_notification_settles_once_and_replays_return_the_order() {
    let app = TestApp::new().await;
    let user = app.create_user("paid@store.test", MembershipPlan::Gold).await;
    let (milk, _) = app.milk_and_bread_cart(user.id).await;
    let code = app
        .services()
        .checkout
        .begin_qr(user.id, CheckoutOptions::default())
        .await
        .unwrap();

    let state = app
        .services()
        .checkout
        .apply_qr_report(&paid(&code.retrieval_ref))
        .await;
    assert_eq!(state, Some(QrState::Confirmed));
    // Duplicate pushes do not move the state machine.
    assert_eq!(
        app.services()
            .checkout
            .apply_qr_report(&paid(&code.retrieval_ref))
            .await,
        None
    );

    let receipt = app
        .services()
        .checkout
        .confirm_qr(user.id, &code.retrieval_ref)
        .await
        .expect("confirmed payment settles");
    assert!(!receipt.replayed);
    assert_eq!(receipt.order.payment_method, PaymentMethod::Nets);
    assert_eq!(receipt.order.payment_ref.as_deref(), Some(code.retrieval_ref.as_str()));
    assert_eq!(receipt.order.total, dec!(6.66));
    assert_eq!(app.product(milk.id).await.stock, 18);

    let replay = app
        .services()
        .checkout
        .confirm_qr(user.id, &code.retrieval_ref)
        .await
        .expect("replay returns the order");
    assert!(replay.replayed);
    assert_eq!(replay.order.id, receipt.order.id);
    assert_eq!(order::Entity::find().count(app.db()).await.unwrap(), 1);
}

#[tokio::test]
async fn replay_by_another_user_is_forbidden() {
    let app = TestApp::new().await;
    let user = app.create_user("owner@store.test", MembershipPlan::Basic).await;
    let other = app.create_user("snoop@store.test", MembershipPlan::Basic).await;
    app.milk_and_bread_cart(user.id).await;
    let code = app
        .services()
        .checkout
        .begin_qr(user.id, CheckoutOptions::default())
        .await
        .unwrap();
    app.services()
        .checkout
        .apply_qr_report(&paid(&code.retrieval_ref))
        .await;
    app.services()
        .checkout
        .confirm_qr(user.id, &code.retrieval_ref)
        .await
        .unwrap();

    let err = app
        .services()
        .checkout
        .confirm_qr(other.id, &code.retrieval_ref)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(_));
}

#[tokio::test]
async fn declined_notification_fails_the_session() {
    let app = TestApp::new().await;
    let user = app.create_user("declined@store.test", MembershipPlan::Basic).await;
    app.milk_and_bread_cart(user.id).await;
    let code = app
        .services()
        .checkout
        .begin_qr(user.id, CheckoutOptions::default())
        .await
        .unwrap();

    let state = app
        .services()
        .checkout
        .apply_qr_report(&declined(&code.retrieval_ref))
        .await;
    assert_eq!(state, Some(QrState::Failed));

    let err = app
        .services()
        .checkout
        .confirm_qr(user.id, &code.retrieval_ref)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
    assert_eq!(app.services().carts.get_cart(user.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn status_poll_picks_up_the_gateway_result() {
    let app = TestApp::new().await;
    let user = app.create_user("poll@store.test", MembershipPlan::Basic).await;
    app.milk_and_bread_cart(user.id).await;
    let code = app
        .services()
        .checkout
        .begin_qr(user.id, CheckoutOptions::default())
        .await
        .unwrap();

    app.qr.stage(in_progress(&code.retrieval_ref));
    let state = app
        .services()
        .checkout
        .qr_status(user.id, &code.retrieval_ref)
        .await
        .unwrap();
    assert_eq!(state, QrState::Pending);

    app.qr.stage(paid(&code.retrieval_ref));
    let state = app
        .services()
        .checkout
        .qr_status(user.id, &code.retrieval_ref)
        .await
        .unwrap();
    assert_eq!(state, QrState::Confirmed);
}

#[tokio::test]
async fn unknown_references_are_ignored() {
    let app = TestApp::new().await;
    assert_eq!(
        app.services()
            .checkout
            .apply_qr_report(&paid("NETS-REF-404"))
            .await,
        None
    );
}

#[tokio::test]
async fn unpaid_codes_time_out() {
    let app = TestApp::with_config(|cfg| cfg.nets.qr_timeout_secs = 1).await;
    let user = app.create_user("slow@store.test", MembershipPlan::Basic).await;
    app.milk_and_bread_cart(user.id).await;
    let code = app
        .services()
        .checkout
        .begin_qr(user.id, CheckoutOptions::default())
        .await
        .unwrap();
    let mut updates = app
        .services()
        .checkout
        .qr_updates(user.id, &code.retrieval_ref)
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), updates.wait_for(|s| *s == QrState::TimedOut))
        .await
        .expect("session expires")
        .expect("state channel open");

    let err = app
        .services()
        .checkout
        .qr_status(user.id, &code.retrieval_ref)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));

    // A late payment notification finds nothing to confirm.
    assert_eq!(
        app.services()
            .checkout
            .apply_qr_report(&paid(&code.retrieval_ref))
            .await,
        None
    );
}

#[tokio::test]
async fn paid_codes_nobody_confirms_are_credited_on_expiry() {
    let app = TestApp::with_config(|cfg| cfg.nets.qr_timeout_secs = 1).await;
    let user = app.create_user("walked-off@store.test", MembershipPlan::Basic).await;
    app.milk_and_bread_cart(user.id).await;
    let code = app
        .services()
        .checkout
        .begin_qr(user.id, CheckoutOptions::default())
        .await
        .unwrap();
    assert_eq!(
        app.services()
            .checkout
            .apply_qr_report(&paid(&code.retrieval_ref))
            .await,
        Some(QrState::Confirmed)
    );

    // The shopper never comes back to confirm.
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(order::Entity::find().count(app.db()).await.unwrap(), 0);
    assert_eq!(app.user(user.id).await.wallet_balance(), dec!(7.40));
    let (entries, total) = app
        .services()
        .ledger
        .list_for_user(user.id, 1, 20)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(entries[0].action, TransactionAction::WalletTopup);
    assert_eq!(entries[0].amount, dec!(7.40));
    assert_eq!(entries[0].new_balance, dec!(7.40));

    let err = app
        .services()
        .checkout
        .confirm_qr(user.id, &code.retrieval_ref)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
    assert_eq!(app.user(user.id).await.wallet_balance(), dec!(7.40));
}
