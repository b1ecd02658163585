use crate::{
    entities::{
        cart_line::{self, Entity as CartLine},
        product::{self, Entity as Product},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::pricing::discounted_unit_price,
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CartLineInput {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Server-side cart store. Every mutation reloads the persisted lines first,
/// so the last write wins across devices.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    pub async fn get_cart(&self, user_id: Uuid) -> Result<Vec<cart_line::Model>, ServiceError> {
        load_cart(&*self.db, user_id).await
    }

    /// Adds units of a product, merging into an existing line.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<Vec<cart_line::Model>, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Quantity must be greater than zero.".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let product = find_product(&txn, product_id).await?;
        let existing = find_line(&txn, user_id, product_id).await?;

        let merged = existing.as_ref().map_or(0, |l| l.quantity) + quantity;
        ensure_in_stock(&product, merged)?;

        let now = Utc::now();
        match existing {
            Some(line) => {
                let mut active: cart_line::ActiveModel = line.into();
                active.quantity = Set(merged);
                active.updated_at = Set(now);
                active.update(&txn).await?;
            }
            None => {
                new_line(user_id, &product, merged).insert(&txn).await?;
            }
        }

        let lines = load_cart(&txn, user_id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartUpdated(user_id))
            .await;
        Ok(lines)
    }

    /// Sets a line's quantity; zero or less removes the line.
    #[instrument(skip(self))]
    pub async fn update_quantity(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<Vec<cart_line::Model>, ServiceError> {
        if quantity <= 0 {
            return self.remove_item(user_id, product_id).await;
        }

        let txn = self.db.begin().await?;
        let line = find_line(&txn, user_id, product_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Item is not in your cart.".to_string()))?;
        let product = find_product(&txn, product_id).await?;
        ensure_in_stock(&product, quantity)?;

        let mut active: cart_line::ActiveModel = line.into();
        active.quantity = Set(quantity);
        active.updated_at = Set(Utc::now());
        active.update(&txn).await?;

        let lines = load_cart(&txn, user_id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartUpdated(user_id))
            .await;
        Ok(lines)
    }

    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Vec<cart_line::Model>, ServiceError> {
        let txn = self.db.begin().await?;
        CartLine::delete_many()
            .filter(cart_line::Column::UserId.eq(user_id))
            .filter(cart_line::Column::ProductId.eq(product_id))
            .exec(&txn)
            .await?;
        let lines = load_cart(&txn, user_id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartUpdated(user_id))
            .await;
        Ok(lines)
    }

    pub async fn clear(&self, user_id: Uuid) -> Result<(), ServiceError> {
        clear_cart(&*self.db, user_id).await?;
        self.event_sender
            .send_or_log(Event::CartCleared(user_id))
            .await;
        Ok(())
    }

    /// Replaces the whole cart, e.g. when restoring from another device.
    ///
    /// Lines for products already in the cart keep their locked price; new
    /// lines lock the current catalog price. Duplicate products are merged.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn save_cart(
        &self,
        user_id: Uuid,
        lines: Vec<CartLineInput>,
    ) -> Result<Vec<cart_line::Model>, ServiceError> {
        let mut merged: Vec<CartLineInput> = Vec::with_capacity(lines.len());
        for line in lines {
            if line.quantity <= 0 {
                return Err(ServiceError::ValidationError(
                    "Quantity must be greater than zero.".to_string(),
                ));
            }
            match merged.iter_mut().find(|l| l.product_id == line.product_id) {
                Some(existing) => existing.quantity += line.quantity,
                None => merged.push(line),
            }
        }

        let txn = self.db.begin().await?;
        let previous = load_cart(&txn, user_id).await?;

        let mut rows = Vec::with_capacity(merged.len());
        for line in &merged {
            let product = find_product(&txn, line.product_id).await?;
            ensure_in_stock(&product, line.quantity)?;
            let mut row = new_line(user_id, &product, line.quantity);
            if let Some(locked) = previous.iter().find(|p| p.product_id == line.product_id) {
                row.unit_price = Set(locked.unit_price);
                row.created_at = Set(locked.created_at);
            }
            rows.push(row);
        }

        clear_cart(&txn, user_id).await?;
        for row in rows {
            row.insert(&txn).await?;
        }
        let saved = load_cart(&txn, user_id).await?;
        txn.commit().await?;

        info!(%user_id, lines = saved.len(), "cart saved");
        self.event_sender
            .send_or_log(Event::CartUpdated(user_id))
            .await;
        Ok(saved)
    }
}

pub async fn load_cart<C>(conn: &C, user_id: Uuid) -> Result<Vec<cart_line::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(CartLine::find()
        .filter(cart_line::Column::UserId.eq(user_id))
        .order_by_asc(cart_line::Column::CreatedAt)
        .all(conn)
        .await?)
}

pub async fn clear_cart<C>(conn: &C, user_id: Uuid) -> Result<u64, ServiceError>
where
    C: ConnectionTrait,
{
    let result = CartLine::delete_many()
        .filter(cart_line::Column::UserId.eq(user_id))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

async fn find_line<C>(
    conn: &C,
    user_id: Uuid,
    product_id: Uuid,
) -> Result<Option<cart_line::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(CartLine::find()
        .filter(cart_line::Column::UserId.eq(user_id))
        .filter(cart_line::Column::ProductId.eq(product_id))
        .one(conn)
        .await?)
}

async fn find_product<C>(conn: &C, product_id: Uuid) -> Result<product::Model, ServiceError>
where
    C: ConnectionTrait,
{
    Product::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product not found (id {}).", product_id)))
}

fn ensure_in_stock(product: &product::Model, quantity: i32) -> Result<(), ServiceError> {
    if quantity > product.stock {
        return Err(ServiceError::InsufficientStock(format!(
            "Only {} left in stock for {}",
            product.stock.max(0),
            product.name
        )));
    }
    Ok(())
}

fn new_line(user_id: Uuid, product: &product::Model, quantity: i32) -> cart_line::ActiveModel {
    let now = Utc::now();
    cart_line::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        product_id: Set(product.id),
        quantity: Set(quantity),
        unit_price: Set(discounted_unit_price(product.price, product.discount_percent)),
        product_name: Set(product.name.clone()),
        image_url: Set(product.image_url.clone()),
        created_at: Set(now),
        updated_at: Set(now),
    }
}
