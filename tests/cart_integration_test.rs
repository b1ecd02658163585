//! Cart store behavior, through the service and over HTTP.

mod common;

use assert_matches::assert_matches;
use axum::http::{Method, StatusCode};
use common::{response_json, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use supermarket_checkout::{
    entities::user_account::MembershipPlan,
    errors::ServiceError,
    services::{carts::CartLineInput, catalog::ProductInput},
};

// ==================== Service ====================

#[tokio::test]
async fn adding_the_same_product_merges_lines() {
    let app = TestApp::new().await;
    let user = app.create_user("merge@store.test", MembershipPlan::Basic).await;
    let apples = app.create_product("Apples", dec!(0.80), 10).await;

    app.add_to_cart(user.id, apples.id, 2).await;
    app.add_to_cart(user.id, apples.id, 3).await;

    let cart = app.services().carts.get_cart(user.id).await.unwrap();
    assert_eq!(cart.len(), 1);
    assert_eq!(cart[0].quantity, 5);
    assert_eq!(cart[0].unit_price, dec!(0.80));
    assert_eq!(cart[0].product_name, "Apples");
}

#[tokio::test]
async fn cannot_add_more_than_is_in_stock() {
    let app = TestApp::new().await;
    let user = app.create_user("stock@store.test", MembershipPlan::Basic).await;
    let cheese = app.create_product("Cheddar Cheese", dec!(5.20), 2).await;
    app.add_to_cart(user.id, cheese.id, 2).await;

    let err = app
        .services()
        .carts
        .add_item(user.id, cheese.id, 1)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));
    assert_eq!(app.services().carts.get_cart(user.id).await.unwrap()[0].quantity, 2);
}

#[tokio::test]
async fn non_positive_quantities_are_rejected_or_remove() {
    let app = TestApp::new().await;
    let user = app.create_user("zero@store.test", MembershipPlan::Basic).await;
    let (milk, bread) = app.milk_and_bread_cart(user.id).await;

    let err = app
        .services()
        .carts
        .add_item(user.id, milk.id, 0)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let cart = app
        .services()
        .carts
        .update_quantity(user.id, milk.id, 0)
        .await
        .unwrap();
    assert_eq!(cart.len(), 1);
    assert_eq!(cart[0].product_id, bread.id);
}

#[tokio::test]
async fn updating_a_missing_line_is_not_found() {
    let app = TestApp::new().await;
    let user = app.create_user("missing@store.test", MembershipPlan::Basic).await;
    let eggs = app.create_product("Eggs", dec!(3.10), 12).await;

    let err = app
        .services()
        .carts
        .update_quantity(user.id, eggs.id, 4)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn saving_replaces_the_cart_and_keeps_locked_prices() {
    let app = TestApp::new().await;
    let user = app.create_user("save@store.test", MembershipPlan::Basic).await;
    let (milk, bread) = app.milk_and_bread_cart(user.id).await;
    let butter = app.create_product("Butter", dec!(4.00), 5).await;

    // A price change after the line was added does not touch the cart.
    app.services()
        .catalog
        .update_product(
            milk.id,
            ProductInput {
                name: milk.name.clone(),
                description: None,
                category: milk.category.clone(),
                image_url: None,
                price: dec!(3.50),
                stock: milk.stock,
                discount_percent: 0,
            },
        )
        .await
        .unwrap();

    let saved = app
        .services()
        .carts
        .save_cart(
            user.id,
            vec![
                CartLineInput { product_id: milk.id, quantity: 1 },
                CartLineInput { product_id: butter.id, quantity: 1 },
                CartLineInput { product_id: milk.id, quantity: 2 },
            ],
        )
        .await
        .unwrap();

    assert_eq!(saved.len(), 2);
    assert!(saved.iter().all(|l| l.product_id != bread.id));
    let milk_line = saved.iter().find(|l| l.product_id == milk.id).unwrap();
    assert_eq!(milk_line.quantity, 3);
    assert_eq!(milk_line.unit_price, dec!(3.00));
    let butter_line = saved.iter().find(|l| l.product_id == butter.id).unwrap();
    assert_eq!(butter_line.unit_price, dec!(4.00));
}

#[tokio::test]
async fn clearing_empties_the_cart() {
    let app = TestApp::new().await;
    let user = app.create_user("clear@store.test", MembershipPlan::Basic).await;
    app.milk_and_bread_cart(user.id).await;

    app.services().carts.clear(user.id).await.unwrap();
    assert!(app.services().carts.get_cart(user.id).await.unwrap().is_empty());
}

// ==================== HTTP ====================

#[tokio::test]
async fn cart_routes_require_a_token() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/api/v1/cart", None, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn add_then_read_over_http() {
    let app = TestApp::new().await;
    let user = app.create_user("http-cart@store.test", MembershipPlan::Basic).await;
    let token = app.token_for(&user);
    let yogurt = app.create_product("Greek Yogurt", dec!(1.25), 8).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(&token),
            Some(json!({ "product_id": yogurt.id, "quantity": 4 })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"][0]["quantity"], 4);

    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(&token),
            Some(json!({ "product_id": yogurt.id, "quantity": 5 })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = app
        .request(
            Method::DELETE,
            &format!("/api/v1/cart/items/{}", yogurt.id),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"].as_array().map(Vec::len), Some(0));
}
