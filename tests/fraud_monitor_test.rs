mod common;

use chrono::Utc;
use common::TestApp;
use rust_decimal_macros::dec;
use sea_orm::{EntityTrait, PaginatorTrait};
use supermarket_checkout::{
    entities::{
        transaction_log::{self, TransactionAction},
        user_account::MembershipPlan,
    },
    services::{
        fraud::{FraudCheck, Strike},
        transaction_log::NewLogEntry,
    },
};

async fn record_payment(app: &TestApp, user_id: uuid::Uuid) -> Option<Strike> {
    app.services()
        .ledger
        .record(
            app.db(),
            NewLogEntry::new(user_id, TransactionAction::Payment, dec!(12.00)),
        )
        .await
        .expect("entry recorded")
        .strike
}

#[tokio::test]
async fn payment_bursts_warn_then_disable() {
    let app = TestApp::new().await;
    let user = app.create_user("burst@store.test", MembershipPlan::Basic).await;

    for _ in 0..4 {
        assert_eq!(record_payment(&app, user.id).await, None);
    }

    assert_eq!(record_payment(&app, user.id).await, Some(Strike::Warned));
    let warned = app.user(user.id).await;
    assert!(warned.fraud_warning_sent_at.is_some());
    assert!(warned
        .fraud_warning_reason
        .as_deref()
        .is_some_and(|r| r.contains("payments within")));
    assert!(!warned.is_disabled);

    assert_eq!(record_payment(&app, user.id).await, Some(Strike::Disabled));
    assert!(app.user(user.id).await.is_disabled);

    let suspicious = transaction_log::Entity::find()
        .all(app.db())
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.suspicious)
        .count();
    assert_eq!(suspicious, 2);

    // Re-enabling clears the strikes.
    let user = app
        .services()
        .accounts
        .set_disabled(user.id, false)
        .await
        .unwrap();
    assert!(!user.is_disabled);
    assert!(user.fraud_warning_sent_at.is_none());
}

#[tokio::test]
async fn dismissing_the_warning_keeps_the_strike() {
    let app = TestApp::new().await;
    let user = app.create_user("dismiss@store.test", MembershipPlan::Basic).await;
    for _ in 0..5 {
        record_payment(&app, user.id).await;
    }
    app.services().accounts.dismiss_warning(user.id).await.unwrap();

    let user = app.user(user.id).await;
    assert!(user.fraud_warning_reason.is_none());
    assert!(user.fraud_warning_sent_at.is_some());
}

#[tokio::test]
async fn refunds_without_spend_are_suspicious() {
    let app = TestApp::new().await;
    let user = app.create_user("ratio@store.test", MembershipPlan::Basic).await;

    let recorded = app
        .services()
        .ledger
        .record(
            app.db(),
            NewLogEntry::new(user.id, TransactionAction::Refund, dec!(5.00)),
        )
        .await
        .unwrap();
    assert!(recorded.entry.suspicious);
    assert_eq!(recorded.strike, Some(Strike::Warned));
}

#[tokio::test]
async fn refund_soon_after_top_up_is_flagged() {
    let app = TestApp::new().await;
    let user = app.create_user("topup@store.test", MembershipPlan::Basic).await;
    let ledger = &app.services().ledger;
    for action in [TransactionAction::Payment, TransactionAction::WalletTopup] {
        ledger
            .record(app.db(), NewLogEntry::new(user.id, action, dec!(20.00)))
            .await
            .unwrap();
    }

    let verdict = ledger
        .check(&FraudCheck {
            user_id: user.id,
            action: TransactionAction::Refund,
            amount: dec!(2.00),
            at: Utc::now(),
        })
        .await
        .unwrap();
    assert!(verdict.suspicious);
    assert_eq!(
        verdict.reason.as_deref(),
        Some("Refund requested shortly after a wallet top-up")
    );
}

#[tokio::test]
async fn order_spike_is_flagged_after_enough_history() {
    let app = TestApp::new().await;
    let user = app.create_user("spike@store.test", MembershipPlan::Basic).await;
    for _ in 0..3 {
        record_payment(&app, user.id).await;
    }

    let check = |amount| FraudCheck {
        user_id: user.id,
        action: TransactionAction::Payment,
        amount,
        at: Utc::now(),
    };
    let ledger = &app.services().ledger;
    assert!(!ledger.check(&check(dec!(60.00))).await.unwrap().suspicious);
    let verdict = ledger.check(&check(dec!(60.01))).await.unwrap();
    assert!(verdict.suspicious);
    assert!(verdict.reason.unwrap().contains("usual spend"));
}

#[tokio::test]
async fn checking_does_not_write_to_the_log() {
    let app = TestApp::new().await;
    let user = app.create_user("dry@store.test", MembershipPlan::Basic).await;

    let verdict = app
        .services()
        .ledger
        .check(&FraudCheck {
            user_id: user.id,
            action: TransactionAction::Payment,
            amount: dec!(10.00),
            at: Utc::now(),
        })
        .await
        .unwrap();
    assert!(!verdict.suspicious);
    assert_eq!(
        transaction_log::Entity::find().count(app.db()).await.unwrap(),
        0
    );
    assert!(app.user(user.id).await.fraud_warning_sent_at.is_none());
}
