//! Membership subscriptions, wallet top-ups and promotion updates.

mod common;

use assert_matches::assert_matches;
use common::TestApp;
use rust_decimal_macros::dec;
use supermarket_checkout::{
    entities::{transaction_log::TransactionAction, user_account::MembershipPlan},
    errors::ServiceError,
    services::{
        accounts::PlanPayment,
        payments::{CardDetails, PaymentAdapter, PaymentContext, PaymentRequest, WalletAdapter},
    },
};

fn card() -> CardDetails {
    CardDetails {
        card_name: "Test Shopper".to_string(),
        card_number: "4111 1111 1111 1111".to_string(),
        card_expiry: "12/29".to_string(),
        card_cvv: "123".to_string(),
    }
}

// ==================== Membership ====================

#[tokio::test]
async fn wallet_subscription_debits_and_logs_the_payment() {
    let app = TestApp::new().await;
    let user = app.create_user("gold@store.test", MembershipPlan::Basic).await;
    app.fund_wallet(user.id, dec!(20.00)).await;

    let receipt = app
        .services()
        .accounts
        .subscribe(user.id, " Gold ", Some(PlanPayment::Wallet))
        .await
        .expect("subscribed");
    assert_eq!(receipt.plan.key, "gold");
    assert_eq!(receipt.charged, dec!(9.99));
    assert_eq!(receipt.wallet_balance, dec!(10.01));
    assert_eq!(app.user(user.id).await.plan, MembershipPlan::Gold);

    let (entries, total) = app
        .services()
        .ledger
        .list_for_user(user.id, 1, 20)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(entries[0].action, TransactionAction::Payment);
    assert_eq!(entries[0].amount, dec!(9.99));
    assert_eq!(entries[0].previous_balance, dec!(20.00));
    assert_eq!(entries[0].new_balance, dec!(10.01));
}

#[tokio::test]
async fn card_subscription_leaves_the_wallet_alone() {
    let app = TestApp::new().await;
    let user = app.create_user("silver@store.test", MembershipPlan::Basic).await;

    let receipt = app
        .services()
        .accounts
        .subscribe(user.id, "silver", Some(PlanPayment::Card(card())))
        .await
        .unwrap();
    assert_eq!(receipt.charged, dec!(4.99));
    assert_eq!(receipt.wallet_balance, dec!(0.00));
    assert_eq!(app.user(user.id).await.plan, MembershipPlan::Silver);
}

#[tokio::test]
async fn paid_plans_need_a_way_to_pay() {
    let app = TestApp::new().await;
    let user = app.create_user("nopay@store.test", MembershipPlan::Basic).await;
    let accounts = &app.services().accounts;

    let err = accounts.subscribe(user.id, "gold", None).await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let err = accounts
        .subscribe(user.id, "gold", Some(PlanPayment::Wallet))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientBalance(_));

    let err = accounts
        .subscribe(user.id, "platinum", Some(PlanPayment::Wallet))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    assert_eq!(app.user(user.id).await.plan, MembershipPlan::Basic);
}

#[tokio::test]
async fn downgrading_to_basic_is_free() {
    let app = TestApp::new().await;
    let user = app.create_user("down@store.test", MembershipPlan::Gold).await;

    let receipt = app
        .services()
        .accounts
        .subscribe(user.id, "BASIC", None)
        .await
        .unwrap();
    assert_eq!(receipt.charged, dec!(0));
    assert_eq!(app.user(user.id).await.plan, MembershipPlan::Basic);
}

// ==================== Wallet ====================

#[tokio::test]
async fn card_top_up_credits_the_wallet() {
    let app = TestApp::new().await;
    let user = app.create_user("topup-card@store.test", MembershipPlan::Basic).await;

    let change = app
        .services()
        .accounts
        .top_up_card(user.id, dec!(25.00), &card())
        .await
        .unwrap();
    assert_eq!(change.previous, dec!(0.00));
    assert_eq!(change.new, dec!(25.00));

    let (entries, _) = app
        .services()
        .ledger
        .list_for_user(user.id, 1, 20)
        .await
        .unwrap();
    assert_eq!(entries[0].action, TransactionAction::WalletTopup);

    let err = app
        .services()
        .accounts
        .top_up_card(user.id, dec!(0), &card())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn hosted_top_up_credits_after_capture() {
    let app = TestApp::new().await;
    let user = app.create_user("topup-paypal@store.test", MembershipPlan::Basic).await;
    let accounts = &app.services().accounts;

    let intent = accounts.begin_hosted_top_up(user.id, dec!(15.00)).await.unwrap();
    assert_eq!(app.hosted.created.lock().unwrap().clone(), vec!["15.00".to_string()]);
    assert_eq!(app.user(user.id).await.wallet_balance(), dec!(0.00));

    let change = accounts
        .capture_hosted_top_up(user.id, &intent.intent_id)
        .await
        .unwrap();
    assert_eq!(change.new, dec!(15.00));

    // The intent is spent.
    let err = accounts
        .capture_hosted_top_up(user.id, &intent.intent_id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn top_up_intents_cannot_buy_a_membership() {
    let app = TestApp::new().await;
    let user = app.create_user("mixup@store.test", MembershipPlan::Basic).await;
    let accounts = &app.services().accounts;

    let intent = accounts.begin_hosted_top_up(user.id, dec!(9.99)).await.unwrap();
    let err = accounts
        .capture_hosted_subscription(user.id, &intent.intent_id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidInput(_));
    assert_eq!(app.user(user.id).await.plan, MembershipPlan::Basic);
}

#[tokio::test]
async fn reversed_wallet_debits_are_logged() {
    let app = TestApp::new().await;
    let user = app.create_user("reversal@store.test", MembershipPlan::Basic).await;
    app.fund_wallet(user.id, dec!(10.00)).await;
    let adapter = WalletAdapter::new(app.state.db.clone(), (*app.services().ledger).clone());

    let payment = PaymentContext::new(user.id, dec!(6.50));
    let outcome = adapter
        .authorize(&payment, &PaymentRequest::Wallet)
        .await
        .unwrap();
    assert_eq!(app.user(user.id).await.wallet_balance(), dec!(3.50));

    adapter.compensate(&payment, &outcome).await.unwrap();
    assert_eq!(app.user(user.id).await.wallet_balance(), dec!(10.00));

    let (entries, total) = app
        .services()
        .ledger
        .list_for_user(user.id, 1, 20)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(entries[0].action, TransactionAction::WalletTopup);
    assert_eq!(entries[0].amount, dec!(6.50));
    assert_eq!(entries[0].previous_balance, dec!(3.50));
    assert_eq!(entries[0].new_balance, dec!(10.00));
}

// ==================== Promotions ====================

#[tokio::test]
async fn promotion_update_applies_to_the_next_quote() {
    let app = TestApp::new().await;
    let user = app.create_user("promo@store.test", MembershipPlan::Basic).await;
    app.milk_and_bread_cart(user.id).await;

    let before = app.services().checkout.quote(user.id, 0).await.unwrap();
    assert_eq!(before.breakdown.promo_savings, dec!(0.60));
    assert_eq!(before.breakdown.final_total, dec!(7.40));

    app.services()
        .promotions
        .update("Bread", dec!(50))
        .await
        .unwrap();

    let after = app.services().checkout.quote(user.id, 0).await.unwrap();
    assert_eq!(after.breakdown.promo_savings, dec!(1.00));
    assert_eq!(after.breakdown.final_total, dec!(7.00));
}
