use crate::{
    entities::product::{self, Entity as Product},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, Func},
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

/// Maximum per-unit product discount, in percent.
pub const MAX_PRODUCT_DISCOUNT: i32 = 50;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProductSort {
    PriceAsc,
    PriceDesc,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct ProductFilter {
    /// Case-insensitive substring of the product name
    pub q: Option<String>,
    pub category: Option<String>,
    pub sort: Option<ProductSort>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ProductInput {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub image_url: Option<String>,
    #[schema(value_type = String, example = "3.00")]
    pub price: Decimal,
    #[validate(range(min = 0))]
    pub stock: i32,
    /// Clamped to 0..=50
    #[serde(default)]
    pub discount_percent: i32,
}

/// Catalog store: product reads, admin CRUD and the atomic stock primitives
/// used by settlement.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    pub async fn get_product(&self, id: Uuid) -> Result<Option<product::Model>, ServiceError> {
        Ok(Product::find_by_id(id).one(&*self.db).await?)
    }

    pub async fn require_product(&self, id: Uuid) -> Result<product::Model, ServiceError> {
        self.get_product(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))
    }

    #[instrument(skip(self))]
    pub async fn list_products(
        &self,
        filter: &ProductFilter,
    ) -> Result<Vec<product::Model>, ServiceError> {
        let mut query = Product::find();

        if let Some(q) = filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let pattern = format!("%{}%", q.to_lowercase());
            query = query.filter(Expr::expr(Func::lower(Expr::col(product::Column::Name))).like(pattern));
        }
        if let Some(category) = filter.category.as_deref().filter(|c| !c.is_empty()) {
            query = query.filter(product::Column::Category.eq(category));
        }

        query = match filter.sort {
            Some(ProductSort::PriceAsc) => query.order_by_asc(product::Column::Price),
            Some(ProductSort::PriceDesc) => query.order_by_desc(product::Column::Price),
            None => query.order_by_asc(product::Column::Name),
        };

        Ok(query.all(&*self.db).await?)
    }

    /// Newest products first, for the storefront landing page.
    pub async fn bestsellers(&self, limit: u64) -> Result<Vec<product::Model>, ServiceError> {
        use sea_orm::QuerySelect;
        Ok(Product::find()
            .order_by_desc(product::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_product(&self, input: ProductInput) -> Result<product::Model, ServiceError> {
        validate_price(input.price)?;
        let now = Utc::now();
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(input.name.trim().to_string()),
            description: Set(input.description),
            category: Set(input.category),
            image_url: Set(input.image_url),
            price: Set(input.price),
            stock: Set(input.stock.max(0)),
            discount_percent: Set(clamp_discount(input.discount_percent)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        self.event_sender
            .send_or_log(Event::ProductCreated(model.id))
            .await;
        info!(product_id = %model.id, "product created");
        Ok(model)
    }

    #[instrument(skip(self, input))]
    pub async fn update_product(
        &self,
        id: Uuid,
        input: ProductInput,
    ) -> Result<product::Model, ServiceError> {
        validate_price(input.price)?;
        let existing = self.require_product(id).await?;
        let mut active: product::ActiveModel = existing.into();
        active.name = Set(input.name.trim().to_string());
        active.description = Set(input.description);
        active.category = Set(input.category);
        active.image_url = Set(input.image_url);
        active.price = Set(input.price);
        active.stock = Set(input.stock.max(0));
        active.discount_percent = Set(clamp_discount(input.discount_percent));
        active.updated_at = Set(Utc::now());
        let model = active.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::ProductUpdated(id))
            .await;
        Ok(model)
    }

    #[instrument(skip(self))]
    pub async fn delete_product(&self, id: Uuid) -> Result<(), ServiceError> {
        let result = Product::delete_by_id(id).exec(&*self.db).await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Product {} not found", id)));
        }
        self.event_sender
            .send_or_log(Event::ProductDeleted(id))
            .await;
        info!(product_id = %id, "product deleted");
        Ok(())
    }

    /// Adds units to a product's stock.
    #[instrument(skip(self))]
    pub async fn restock(&self, id: Uuid, quantity: i32) -> Result<product::Model, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Restock quantity must be greater than zero.".to_string(),
            ));
        }
        restore_stock(&*self.db, id, quantity).await?;
        let model = self.require_product(id).await?;
        self.event_sender
            .send_or_log(Event::ProductUpdated(id))
            .await;
        Ok(model)
    }

    /// Atomically takes `quantity` units if at least that many are in stock.
    pub async fn decrement_stock(&self, id: Uuid, quantity: i32) -> Result<bool, ServiceError> {
        let taken = decrement_stock(&*self.db, id, quantity).await?;
        if taken {
            self.notify_if_depleted(id).await?;
        }
        Ok(taken)
    }

    pub(crate) async fn notify_if_depleted(&self, id: Uuid) -> Result<(), ServiceError> {
        if let Some(product) = self.get_product(id).await? {
            if product.stock == 0 {
                self.event_sender
                    .send_or_log(Event::StockDepleted { product_id: id })
                    .await;
            }
        }
        Ok(())
    }
}

/// `UPDATE products SET stock = stock - q WHERE id = ? AND stock >= q`.
///
/// Returns false, leaving stock untouched, when fewer than `quantity` units
/// remain. Stock therefore never goes negative.
pub async fn decrement_stock<C>(conn: &C, id: Uuid, quantity: i32) -> Result<bool, ServiceError>
where
    C: ConnectionTrait,
{
    if quantity <= 0 {
        return Err(ServiceError::ValidationError(
            "Quantity must be greater than zero.".to_string(),
        ));
    }
    let result = Product::update_many()
        .col_expr(
            product::Column::Stock,
            Expr::col(product::Column::Stock).sub(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(id))
        .filter(product::Column::Stock.gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        warn!(product_id = %id, quantity, "stock decrement refused");
    }
    Ok(result.rows_affected == 1)
}

/// Puts units back, e.g. when a settlement is unwound.
pub async fn restore_stock<C>(conn: &C, id: Uuid, quantity: i32) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let result = Product::update_many()
        .col_expr(
            product::Column::Stock,
            Expr::col(product::Column::Stock).add(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(id))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::NotFound(format!("Product {} not found", id)));
    }
    Ok(())
}

pub fn clamp_discount(percent: i32) -> i32 {
    percent.clamp(0, MAX_PRODUCT_DISCOUNT)
}

fn validate_price(price: Decimal) -> Result<(), ServiceError> {
    if price < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "Price must not be negative.".to_string(),
        ));
    }
    Ok(())
}
