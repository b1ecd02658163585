use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument};
use utoipa::ToSchema;

use crate::{
    config::PricingSettings,
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Keyword promotion applied at checkout to every line whose product name
/// contains one of the keywords.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PromotionConfig {
    pub keywords: Vec<String>,
    #[schema(value_type = String, example = "10")]
    pub percent: Decimal,
}

impl PromotionConfig {
    pub fn disabled() -> Self {
        Self {
            keywords: Vec::new(),
            percent: Decimal::ZERO,
        }
    }
}

impl From<&PricingSettings> for PromotionConfig {
    fn from(settings: &PricingSettings) -> Self {
        Self {
            keywords: normalize_keywords(settings.promotion_keywords.iter().map(String::as_str)),
            percent: settings.promotion_percent.max(Decimal::ZERO),
        }
    }
}

/// Lowercases, trims and de-duplicates keywords, preserving first-seen order.
pub fn normalize_keywords<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for keyword in raw {
        let keyword = keyword.trim().to_lowercase();
        if !keyword.is_empty() && !out.contains(&keyword) {
            out.push(keyword);
        }
    }
    out
}

/// Owns the process-wide promotion. Readers take a snapshot; the admin update
/// replaces it wholesale.
#[derive(Clone)]
pub struct PromotionService {
    config: Arc<RwLock<PromotionConfig>>,
    event_sender: Arc<EventSender>,
}

impl PromotionService {
    pub fn new(initial: PromotionConfig, event_sender: Arc<EventSender>) -> Self {
        Self {
            config: Arc::new(RwLock::new(initial)),
            event_sender,
        }
    }

    /// Point-in-time copy of the active promotion.
    pub async fn current(&self) -> PromotionConfig {
        self.config.read().await.clone()
    }

    /// Replaces the promotion from a comma-separated keyword list.
    #[instrument(skip(self))]
    pub async fn update(
        &self,
        keywords: &str,
        percent: Decimal,
    ) -> Result<PromotionConfig, ServiceError> {
        if percent <= Decimal::ZERO || percent > Decimal::ONE_HUNDRED {
            return Err(ServiceError::ValidationError(
                "Percent must be between 0 and 100.".to_string(),
            ));
        }
        let keywords = normalize_keywords(keywords.split(','));
        if keywords.is_empty() {
            return Err(ServiceError::ValidationError(
                "Please provide at least one keyword.".to_string(),
            ));
        }

        let updated = PromotionConfig { keywords, percent };
        *self.config.write().await = updated.clone();
        info!(keywords = ?updated.keywords, %percent, "promotion updated");

        self.event_sender
            .send_or_log(Event::PromotionUpdated {
                keywords: updated.keywords.clone(),
                percent,
            })
            .await;

        Ok(updated)
    }
}
