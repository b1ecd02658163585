use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_users_table::Migration),
            Box::new(m20240301_000002_create_products_table::Migration),
            Box::new(m20240301_000003_create_cart_lines_table::Migration),
            Box::new(m20240301_000004_create_orders_table::Migration),
            Box::new(m20240301_000005_create_order_items_table::Migration),
            Box::new(m20240301_000006_create_refund_tables::Migration),
            Box::new(m20240301_000007_create_transaction_logs_table::Migration),
        ]
    }
}

mod m20240301_000001_create_users_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_users_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Users::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Users::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Users::Username).string().not_null())
                        .col(
                            ColumnDef::new(Users::Email)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Users::PasswordHash).string().not_null())
                        .col(
                            ColumnDef::new(Users::Role)
                                .string_len(20)
                                .not_null()
                                .default("user"),
                        )
                        .col(
                            ColumnDef::new(Users::Plan)
                                .string_len(20)
                                .not_null()
                                .default("basic"),
                        )
                        .col(
                            ColumnDef::new(Users::WalletCents)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Users::LoyaltyPoints)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Users::RefundFlagUntil)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Users::FraudWarningSentAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Users::FraudWarningReason).string().null())
                        .col(
                            ColumnDef::new(Users::IsDisabled)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Users::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Users::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Users::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Users {
        Table,
        Id,
        Username,
        Email,
        PasswordHash,
        Role,
        Plan,
        WalletCents,
        LoyaltyPoints,
        RefundFlagUntil,
        FraudWarningSentAt,
        FraudWarningReason,
        IsDisabled,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000002_create_products_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_products_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Products::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(ColumnDef::new(Products::Description).text().null())
                        .col(ColumnDef::new(Products::Category).string().null())
                        .col(ColumnDef::new(Products::ImageUrl).string().null())
                        .col(
                            ColumnDef::new(Products::Price)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::Stock)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::DiscountPercent)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_products_name")
                        .table(Products::Table)
                        .col(Products::Name)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Products {
        Table,
        Id,
        Name,
        Description,
        Category,
        ImageUrl,
        Price,
        Stock,
        DiscountPercent,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000003_create_cart_lines_table {
    use super::m20240301_000001_create_users_table::Users;
    use super::m20240301_000002_create_products_table::Products;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_cart_lines_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CartLines::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CartLines::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CartLines::UserId).uuid().not_null())
                        .col(ColumnDef::new(CartLines::ProductId).uuid().not_null())
                        .col(ColumnDef::new(CartLines::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(CartLines::UnitPrice)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(CartLines::ProductName).string().not_null())
                        .col(ColumnDef::new(CartLines::ImageUrl).string().null())
                        .col(
                            ColumnDef::new(CartLines::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CartLines::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cart_lines_user_id")
                                .from(CartLines::Table, CartLines::UserId)
                                .to(Users::Table, Users::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cart_lines_product_id")
                                .from(CartLines::Table, CartLines::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_cart_lines_user_product")
                        .table(CartLines::Table)
                        .col(CartLines::UserId)
                        .col(CartLines::ProductId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CartLines::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum CartLines {
        Table,
        Id,
        UserId,
        ProductId,
        Quantity,
        UnitPrice,
        ProductName,
        ImageUrl,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000004_create_orders_table {
    use super::m20240301_000001_create_users_table::Users;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Orders::UserId).uuid().not_null())
                        .col(ColumnDef::new(Orders::Items).json().not_null())
                        .col(
                            ColumnDef::new(Orders::Subtotal)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::PromoSavings)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::MembershipSavings)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::LoyaltyDiscount)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::TotalSavings)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::Total).decimal_len(16, 4).not_null())
                        .col(
                            ColumnDef::new(Orders::PointsSpent)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::PointsEarned)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::MembershipPlan)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Orders::Status).string_len(20).not_null())
                        .col(
                            ColumnDef::new(Orders::DeliveryMethod)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Orders::DeliveryAddress).string().null())
                        .col(ColumnDef::new(Orders::PickupOutlet).string().null())
                        .col(
                            ColumnDef::new(Orders::PaymentMethod)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::PaymentRef)
                                .string()
                                .null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::ConfirmedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_orders_user_id")
                                .from(Orders::Table, Orders::UserId)
                                .to(Users::Table, Users::Id)
                                .on_delete(ForeignKeyAction::Restrict)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_user_id")
                        .table(Orders::Table)
                        .col(Orders::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_created_at")
                        .table(Orders::Table)
                        .col(Orders::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Orders {
        Table,
        Id,
        UserId,
        Items,
        Subtotal,
        PromoSavings,
        MembershipSavings,
        LoyaltyDiscount,
        TotalSavings,
        Total,
        PointsSpent,
        PointsEarned,
        MembershipPlan,
        Status,
        DeliveryMethod,
        DeliveryAddress,
        PickupOutlet,
        PaymentMethod,
        PaymentRef,
        CreatedAt,
        ConfirmedAt,
        UpdatedAt,
    }
}

mod m20240301_000005_create_order_items_table {
    use super::m20240301_000004_create_orders_table::Orders;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000005_create_order_items_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::Name).string().not_null())
                        .col(
                            ColumnDef::new(OrderItems::UnitPrice)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderItems::RefundedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order_id")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum OrderItems {
        Table,
        Id,
        OrderId,
        ProductId,
        Name,
        UnitPrice,
        Quantity,
        RefundedQuantity,
        CreatedAt,
    }
}

mod m20240301_000006_create_refund_tables {
    use super::m20240301_000004_create_orders_table::Orders;
    use super::m20240301_000005_create_order_items_table::OrderItems;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000006_create_refund_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(RefundRequests::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(RefundRequests::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(RefundRequests::OrderId).uuid().not_null())
                        .col(ColumnDef::new(RefundRequests::UserId).uuid().not_null())
                        .col(ColumnDef::new(RefundRequests::Reason).text().not_null())
                        .col(ColumnDef::new(RefundRequests::EvidenceRef).string().null())
                        .col(
                            ColumnDef::new(RefundRequests::Amount)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RefundRequests::Destination)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RefundRequests::Status)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(ColumnDef::new(RefundRequests::AdminNote).text().null())
                        .col(ColumnDef::new(RefundRequests::ExternalRef).string().null())
                        .col(
                            ColumnDef::new(RefundRequests::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RefundRequests::ProcessedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_refund_requests_order_id")
                                .from(RefundRequests::Table, RefundRequests::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_refund_requests_user_created")
                        .table(RefundRequests::Table)
                        .col(RefundRequests::UserId)
                        .col(RefundRequests::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(RefundItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(RefundItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(RefundItems::RefundRequestId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(RefundItems::OrderItemId).uuid().not_null())
                        .col(ColumnDef::new(RefundItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(RefundItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(RefundItems::UnitPrice)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_refund_items_request_id")
                                .from(RefundItems::Table, RefundItems::RefundRequestId)
                                .to(RefundRequests::Table, RefundRequests::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_refund_items_order_item_id")
                                .from(RefundItems::Table, RefundItems::OrderItemId)
                                .to(OrderItems::Table, OrderItems::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(RefundItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(RefundRequests::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum RefundRequests {
        Table,
        Id,
        OrderId,
        UserId,
        Reason,
        EvidenceRef,
        Amount,
        Destination,
        Status,
        AdminNote,
        ExternalRef,
        CreatedAt,
        ProcessedAt,
    }

    #[derive(DeriveIden)]
    enum RefundItems {
        Table,
        Id,
        RefundRequestId,
        OrderItemId,
        ProductId,
        Quantity,
        UnitPrice,
    }
}

mod m20240301_000007_create_transaction_logs_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000007_create_transaction_logs_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(TransactionLogs::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(TransactionLogs::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(TransactionLogs::UserId).uuid().not_null())
                        .col(
                            ColumnDef::new(TransactionLogs::Action)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TransactionLogs::Amount)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TransactionLogs::PreviousBalance)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TransactionLogs::NewBalance)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(TransactionLogs::ReferenceId).uuid().null())
                        .col(ColumnDef::new(TransactionLogs::Details).text().null())
                        .col(
                            ColumnDef::new(TransactionLogs::Suspicious)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(TransactionLogs::SuspiciousReason)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(TransactionLogs::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_transaction_logs_user_created")
                        .table(TransactionLogs::Table)
                        .col(TransactionLogs::UserId)
                        .col(TransactionLogs::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(TransactionLogs::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum TransactionLogs {
        Table,
        Id,
        UserId,
        Action,
        Amount,
        PreviousBalance,
        NewBalance,
        ReferenceId,
        Details,
        Suspicious,
        SuspiciousReason,
        CreatedAt,
    }
}
