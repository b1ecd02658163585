mod common;

use assert_matches::assert_matches;
use common::TestApp;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use supermarket_checkout::{
    entities::{
        order::{self, OrderStatus},
        user_account::MembershipPlan,
    },
    errors::ServiceError,
    services::{
        checkout::CheckoutOptions,
        payments::{gateway_amount, PaymentRequest},
    },
};

#[tokio::test]
async fn last_unit_goes_to_exactly_one_shopper() {
    let app = TestApp::new().await;
    let product = app.create_product("Organic Eggs", dec!(4.50), 1).await;

    let alice = app.create_user("alice@store.test", MembershipPlan::Basic).await;
    let bob = app.create_user("bob@store.test", MembershipPlan::Basic).await;
    for user in [&alice, &bob] {
        app.fund_wallet(user.id, dec!(10.00)).await;
        app.add_to_cart(user.id, product.id, 1).await;
    }

    let checkout = &app.services().checkout;
    let (a, b) = tokio::join!(
        checkout.checkout(alice.id, CheckoutOptions::default(), PaymentRequest::Wallet),
        checkout.checkout(bob.id, CheckoutOptions::default(), PaymentRequest::Wallet),
    );

    let (winner, loser, err) = match (a, b) {
        (Ok(_), Err(err)) => (&alice, &bob, err),
        (Err(err), Ok(_)) => (&bob, &alice, err),
        (a, b) => panic!("expected one success and one failure, got {a:?} / {b:?}"),
    };
    assert_matches!(err, ServiceError::InsufficientStock(_));

    assert_eq!(app.product(product.id).await.stock, 0);
    assert_eq!(app.user(winner.id).await.wallet_balance(), dec!(5.50));
    assert_eq!(app.user(loser.id).await.wallet_balance(), dec!(10.00));
    assert_eq!(app.services().carts.get_cart(loser.id).await.unwrap().len(), 1);

    let live_orders = order::Entity::find()
        .filter(order::Column::Status.ne(order::OrderStatus::Cancelled))
        .count(app.db())
        .await
        .unwrap();
    assert_eq!(live_orders, 1);
}

#[tokio::test]
async fn cart_above_stock_fails_validation() {
    let app = TestApp::new().await;
    let product = app.create_product("Sourdough", dec!(6.00), 3).await;
    let user = app.create_user("greedy@store.test", MembershipPlan::Basic).await;
    app.fund_wallet(user.id, dec!(50.00)).await;
    app.add_to_cart(user.id, product.id, 3).await;

    // Someone else buys stock after the cart was filled.
    let taken = app
        .services()
        .catalog
        .decrement_stock(product.id, 2)
        .await
        .unwrap();
    assert!(taken);
    assert!(!app.services().catalog.decrement_stock(product.id, 2).await.unwrap());

    let err = app
        .services()
        .checkout
        .checkout(user.id, CheckoutOptions::default(), PaymentRequest::Wallet)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));
    assert_eq!(app.user(user.id).await.wallet_balance(), dec!(50.00));
}

#[tokio::test]
async fn stock_lost_during_capture_cancels_and_refunds() {
    let app = TestApp::new().await;
    let product = app.create_product("Wagyu Slices", dec!(10.00), 2).await;
    let user = app.create_user("late@store.test", MembershipPlan::Basic).await;
    app.grant_points(user.id, 100).await;
    app.add_to_cart(user.id, product.id, 2).await;

    let options = CheckoutOptions {
        redeem_points: 100,
        ..CheckoutOptions::default()
    };
    let intent = app
        .services()
        .checkout
        .begin_hosted(user.id, options)
        .await
        .unwrap();
    assert_eq!(intent.amount, dec!(19.00));

    // Another shopper buys a unit while PayPal is capturing.
    let catalog = app.services().catalog.clone();
    let product_id = product.id;
    app.hosted.before_next_capture(async move {
        assert!(catalog.decrement_stock(product_id, 1).await.unwrap());
    });

    let err = app
        .services()
        .checkout
        .capture_hosted(user.id, &intent.intent_id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    let cancelled = order::Entity::find()
        .one(app.db())
        .await
        .unwrap()
        .expect("order was committed before the stock ran out");
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.points_spent, 100);

    assert_eq!(
        app.hosted.refunds.lock().unwrap().clone(),
        vec![(format!("CAP-{}", intent.intent_id), gateway_amount(intent.amount))]
    );
    let shopper = app.user(user.id).await;
    assert_eq!(shopper.loyalty_points, 100);
    assert_eq!(shopper.wallet_balance(), dec!(0.00));
    assert_eq!(app.product(product.id).await.stock, 1);
    assert_eq!(app.services().carts.get_cart(user.id).await.unwrap().len(), 1);

    // The cancellation is final.
    let err = app
        .services()
        .orders
        .update_status(cancelled.id, "processing")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
    assert_eq!(
        order::Entity::find_by_id(cancelled.id)
            .one(app.db())
            .await
            .unwrap()
            .unwrap()
            .status,
        OrderStatus::Cancelled
    );
}
