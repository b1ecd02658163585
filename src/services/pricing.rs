//! Checkout pricing.
//!
//! [`price`] is a pure function: given the cart lines, a promotion snapshot,
//! the caller's membership plan and a loyalty redemption request, it returns
//! the full [`PriceBreakdown`]. Discounts stack in a fixed order (promotion,
//! then membership on the remainder, then loyalty points) and every money
//! component is rounded to cents, half away from zero, as soon as it is
//! produced so that replaying a computation always yields the same numbers.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::PricingSettings;
use crate::entities::{cart_line, user_account::MembershipPlan};
use crate::services::promotions::PromotionConfig;

/// Points are redeemed in blocks of this size.
pub const POINT_BLOCK: i64 = 10;

/// A cart line as seen by the pricing engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingLine {
    pub product_id: Uuid,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl PricingLine {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

impl From<&cart_line::Model> for PricingLine {
    fn from(line: &cart_line::Model) -> Self {
        Self {
            product_id: line.product_id,
            name: line.product_name.clone(),
            unit_price: line.unit_price,
            quantity: line.quantity,
        }
    }
}

/// Loyalty point economics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoyaltyPolicy {
    /// Currency value of one point
    pub point_value: Decimal,
    /// Share of the pre-loyalty total payable with points, in percent
    pub max_redemption_percent: Decimal,
    /// Points earned per currency unit of the final total
    pub earn_rate: Decimal,
}

impl Default for LoyaltyPolicy {
    fn default() -> Self {
        Self {
            point_value: dec!(0.01),
            max_redemption_percent: dec!(50),
            earn_rate: dec!(10),
        }
    }
}

impl From<&PricingSettings> for LoyaltyPolicy {
    fn from(settings: &PricingSettings) -> Self {
        Self {
            point_value: settings.loyalty_point_value,
            max_redemption_percent: settings.loyalty_max_redemption_percent,
            earn_rate: settings.loyalty_earn_rate,
        }
    }
}

/// The caller's loyalty position for one computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoyaltyRequest {
    /// Points the shopper asked to redeem
    pub requested_points: i64,
    /// Points currently on the account
    pub available_points: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PriceBreakdown {
    #[schema(value_type = String, example = "8.00")]
    pub subtotal: Decimal,
    #[schema(value_type = String, example = "0.60")]
    pub promo_savings: Decimal,
    #[schema(value_type = String, example = "0.74")]
    pub membership_savings: Decimal,
    #[schema(value_type = String, example = "6.66")]
    pub pre_loyalty_total: Decimal,
    #[schema(value_type = String, example = "0.30")]
    pub loyalty_discount: Decimal,
    pub points_spent: i64,
    #[schema(value_type = String, example = "6.36")]
    pub final_total: Decimal,
    #[schema(value_type = String, example = "1.64")]
    pub total_savings: Decimal,
    pub points_earned: i64,
}

/// Rounds to cents, half away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Largest multiple of [`POINT_BLOCK`] not above `points`; negative input yields 0.
pub fn floor_to_block(points: i64) -> i64 {
    if points <= 0 {
        0
    } else {
        points - points % POINT_BLOCK
    }
}

fn percent_of(amount: Decimal, percent: Decimal) -> Decimal {
    amount * percent / dec!(100)
}

fn matches_promotion(name: &str, promotion: &PromotionConfig) -> bool {
    let name = name.to_lowercase();
    promotion
        .keywords
        .iter()
        .filter(|k| !k.is_empty())
        .any(|k| name.contains(k.to_lowercase().as_str()))
}

/// Computes the price breakdown of a cart.
pub fn price(
    lines: &[PricingLine],
    promotion: &PromotionConfig,
    plan: MembershipPlan,
    loyalty: LoyaltyRequest,
    policy: &LoyaltyPolicy,
) -> PriceBreakdown {
    if lines.is_empty() {
        return PriceBreakdown::default();
    }

    let subtotal = round_money(lines.iter().map(PricingLine::line_total).sum());

    let promo_base: Decimal = lines
        .iter()
        .filter(|line| matches_promotion(&line.name, promotion))
        .map(PricingLine::line_total)
        .sum();
    let promo_percent = promotion.percent.max(Decimal::ZERO);
    let promo_savings = round_money(percent_of(promo_base, promo_percent));

    let after_promo = (subtotal - promo_savings).max(Decimal::ZERO);
    let membership_savings = round_money(percent_of(after_promo, plan.discount_percent()));

    let pre_loyalty_total = (subtotal - promo_savings - membership_savings).max(Decimal::ZERO);

    let (points_spent, loyalty_discount) = redeem(pre_loyalty_total, loyalty, policy);

    let final_total = (pre_loyalty_total - loyalty_discount).max(Decimal::ZERO);
    let total_savings = promo_savings + membership_savings + loyalty_discount;
    let points_earned = earned_points(final_total, policy);

    PriceBreakdown {
        subtotal,
        promo_savings,
        membership_savings,
        pre_loyalty_total,
        loyalty_discount,
        points_spent,
        final_total,
        total_savings,
        points_earned,
    }
}

/// Returns `(points, discount)` for a redemption against `pre_loyalty_total`.
fn redeem(
    pre_loyalty_total: Decimal,
    loyalty: LoyaltyRequest,
    policy: &LoyaltyPolicy,
) -> (i64, Decimal) {
    if policy.point_value <= Decimal::ZERO || pre_loyalty_total <= Decimal::ZERO {
        return (0, Decimal::ZERO);
    }

    let cap_amount = round_money(percent_of(
        pre_loyalty_total,
        policy.max_redemption_percent.max(Decimal::ZERO),
    ));
    let max_points = (cap_amount / policy.point_value)
        .floor()
        .try_into()
        .map(floor_to_block)
        .unwrap_or(0);

    let points = floor_to_block(loyalty.requested_points)
        .min(floor_to_block(loyalty.available_points))
        .min(max_points);
    if points <= 0 {
        return (0, Decimal::ZERO);
    }

    let discount = round_money(Decimal::from(points) * policy.point_value)
        .min(cap_amount)
        .min(pre_loyalty_total);
    (points, discount)
}

/// Points credited for paying `final_total`.
pub fn earned_points(final_total: Decimal, policy: &LoyaltyPolicy) -> i64 {
    (final_total.max(Decimal::ZERO) * policy.earn_rate.max(Decimal::ZERO))
        .floor()
        .try_into()
        .unwrap_or(0)
}

/// Unit price locked into a cart line for a product carrying a per-unit discount.
pub fn discounted_unit_price(price: Decimal, discount_percent: i32) -> Decimal {
    let discount = Decimal::from(discount_percent.clamp(0, 50));
    round_money(price * (dec!(100) - discount) / dec!(100))
}
