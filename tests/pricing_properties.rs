//! Property and table tests for the pricing engine.

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use supermarket_checkout::{
    entities::user_account::MembershipPlan,
    services::{
        pricing::{price, LoyaltyPolicy, LoyaltyRequest, PricingLine, POINT_BLOCK},
        promotions::PromotionConfig,
    },
};
use test_case::test_case;
use uuid::Uuid;

fn line(name: &str, cents: i64, quantity: i32) -> PricingLine {
    PricingLine {
        product_id: Uuid::new_v4(),
        name: name.to_string(),
        unit_price: Decimal::new(cents, 2),
        quantity,
    }
}

fn milk_promo() -> PromotionConfig {
    PromotionConfig {
        keywords: vec!["milk".to_string()],
        percent: dec!(10),
    }
}

fn milk_and_bread() -> Vec<PricingLine> {
    vec![line("Fresh Milk", 300, 2), line("Bread", 200, 1)]
}

#[test_case(0, 0, dec!(6.66) ; "no redemption")]
#[test_case(35, 30, dec!(6.36) ; "redemption floors to a block of ten")]
#[test_case(1_000, 330, dec!(3.36) ; "redemption capped at half the total")]
fn gold_member_milk_and_bread(requested: i64, spent: i64, expected_total: Decimal) {
    let breakdown = price(
        &milk_and_bread(),
        &milk_promo(),
        MembershipPlan::Gold,
        LoyaltyRequest {
            requested_points: requested,
            available_points: 5_000,
        },
        &LoyaltyPolicy::default(),
    );

    assert_eq!(breakdown.subtotal, dec!(8.00));
    assert_eq!(breakdown.promo_savings, dec!(0.60));
    assert_eq!(breakdown.membership_savings, dec!(0.74));
    assert_eq!(breakdown.pre_loyalty_total, dec!(6.66));
    assert_eq!(breakdown.points_spent, spent);
    assert_eq!(breakdown.final_total, expected_total);
}

#[test]
fn redemption_limited_by_available_points() {
    let breakdown = price(
        &milk_and_bread(),
        &milk_promo(),
        MembershipPlan::Basic,
        LoyaltyRequest {
            requested_points: 200,
            available_points: 49,
        },
        &LoyaltyPolicy::default(),
    );
    assert_eq!(breakdown.points_spent, 40);
    assert_eq!(breakdown.loyalty_discount, dec!(0.40));
}

fn arb_line() -> impl Strategy<Value = PricingLine> {
    (
        prop::sample::select(vec!["Fresh Milk", "Bread", "Cheddar Cheese", "Apples", "Oat Milk"]),
        1i64..=5_000,
        1i32..=12,
    )
        .prop_map(|(name, cents, qty)| line(name, cents, qty))
}

fn arb_plan() -> impl Strategy<Value = MembershipPlan> {
    prop::sample::select(vec![
        MembershipPlan::Basic,
        MembershipPlan::Silver,
        MembershipPlan::Gold,
    ])
}

proptest! {
    #[test]
    fn breakdown_is_consistent(
        lines in prop::collection::vec(arb_line(), 1..8),
        plan in arb_plan(),
        percent in 0i64..=100,
        requested in -50i64..5_000,
        available in 0i64..5_000,
    ) {
        let promotion = PromotionConfig {
            keywords: vec!["milk".to_string(), "cheese".to_string()],
            percent: Decimal::from(percent),
        };
        let policy = LoyaltyPolicy::default();
        let b = price(
            &lines,
            &promotion,
            plan,
            LoyaltyRequest { requested_points: requested, available_points: available },
            &policy,
        );

        prop_assert!(b.final_total >= Decimal::ZERO);
        prop_assert!(b.final_total <= b.subtotal);
        prop_assert_eq!(
            b.total_savings,
            b.promo_savings + b.membership_savings + b.loyalty_discount
        );
        prop_assert_eq!(b.final_total, b.pre_loyalty_total - b.loyalty_discount);

        prop_assert_eq!(b.points_spent % POINT_BLOCK, 0);
        prop_assert!(b.points_spent >= 0);
        prop_assert!(b.points_spent <= available);
        prop_assert!(b.points_spent <= requested.max(0));
        prop_assert!(b.loyalty_discount * dec!(2) <= b.pre_loyalty_total + dec!(0.01));

        // Money values never carry fractions of a cent.
        for amount in [b.subtotal, b.promo_savings, b.membership_savings, b.loyalty_discount, b.final_total] {
            prop_assert_eq!(amount, amount.round_dp(2));
        }
    }

    #[test]
    fn empty_promotion_never_discounts(lines in prop::collection::vec(arb_line(), 1..6)) {
        let b = price(
            &lines,
            &PromotionConfig::disabled(),
            MembershipPlan::Basic,
            LoyaltyRequest::default(),
            &LoyaltyPolicy::default(),
        );
        prop_assert_eq!(b.promo_savings, Decimal::ZERO);
        prop_assert_eq!(b.final_total, b.subtotal);
    }
}
