use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_users_table::Migration),
            Box::new(m20240601_000002_create_products_table::Migration),
            Box::new(m20240601_000003_create_orders_table::Migration),
            Box::new(m20240601_000004_create_order_items_table::Migration),
            Box::new(m20240601_000005_create_coin_transactions_table::Migration),
            Box::new(m20240601_000006_create_referrals_table::Migration),
            Box::new(m20240601_000007_create_coupons_table::Migration),
        ]
    }
}

mod m20240601_000001_create_users_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_users_table"
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
                        .col(ColumnDef::new(Users::Name).string().not_null())
                        .col(ColumnDef::new(Users::Email).string().not_null())
                        .col(
                            ColumnDef::new(Users::Coins)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Users::TotalEarned)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Users::TotalRedeemed)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Users::ReferredBy).uuid().null())
                        .col(
                            ColumnDef::new(Users::ReferralTotalEarnings)
                                .big_integer()
                                .not_null()
                                .default(0),
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
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_users_email")
                        .table(Users::Table)
                        .col(Users::Email)
                        .unique()
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
        Name,
        Email,
        Coins,
        TotalEarned,
        TotalRedeemed,
        ReferredBy,
        ReferralTotalEarnings,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_products_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_products_table"
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
                        .col(ColumnDef::new(Products::Description).text().not_null())
                        .col(ColumnDef::new(Products::Category).string().not_null())
                        .col(
                            ColumnDef::new(Products::Price)
                                .decimal_len(12, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::Stock)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::IsGift)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(Products::Images).json().not_null())
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
                        .name("idx_products_is_gift")
                        .table(Products::Table)
                        .col(Products::IsGift)
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
        Price,
        Stock,
        IsGift,
        Images,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000003_create_orders_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_orders_table"
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
                        .col(ColumnDef::new(Orders::OrderNumber).string().not_null())
                        .col(ColumnDef::new(Orders::UserId).uuid().not_null())
                        .col(ColumnDef::new(Orders::ShippingAddress).json().not_null())
                        .col(ColumnDef::new(Orders::PaymentMethod).string().not_null())
                        .col(
                            ColumnDef::new(Orders::ItemsPrice)
                                .decimal_len(12, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::TaxPrice)
                                .decimal_len(12, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::TotalPrice)
                                .decimal_len(12, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::CoinDiscount)
                                .decimal_len(12, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::CoinsUsed)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::FinalAmount)
                                .decimal_len(12, 2)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Orders::RazorpayOrderId).string().null())
                        .col(ColumnDef::new(Orders::RazorpayPaymentId).string().null())
                        .col(ColumnDef::new(Orders::PaymentStatus).string().not_null())
                        .col(
                            ColumnDef::new(Orders::PaidAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Orders::Status).string().not_null())
                        .col(ColumnDef::new(Orders::StatusHistory).json().not_null())
                        .col(
                            ColumnDef::new(Orders::GiftEvaluated)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Orders::StockCommitted)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Orders::ConfirmationSent)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Orders::Settled)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
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
                        .name("idx_orders_order_number")
                        .table(Orders::Table)
                        .col(Orders::OrderNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_user_id_created_at")
                        .table(Orders::Table)
                        .col(Orders::UserId)
                        .col(Orders::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_settled")
                        .table(Orders::Table)
                        .col(Orders::Settled)
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
        OrderNumber,
        UserId,
        ShippingAddress,
        PaymentMethod,
        ItemsPrice,
        TaxPrice,
        TotalPrice,
        CoinDiscount,
        CoinsUsed,
        FinalAmount,
        RazorpayOrderId,
        RazorpayPaymentId,
        PaymentStatus,
        PaidAt,
        Status,
        StatusHistory,
        GiftEvaluated,
        StockCommitted,
        ConfirmationSent,
        Settled,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000004_create_order_items_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_order_items_table"
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
                        .col(ColumnDef::new(OrderItems::Position).integer().not_null())
                        .col(ColumnDef::new(OrderItems::Name).string().not_null())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderItems::Price)
                                .decimal_len(12, 2)
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderItems::Image).string().null())
                        .col(
                            ColumnDef::new(OrderItems::IsGift)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(OrderItems::GiftCouponCode).string().null())
                        .col(ColumnDef::new(OrderItems::Value).decimal_len(12, 2).null())
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
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
        Position,
        Name,
        Quantity,
        Price,
        Image,
        IsGift,
        GiftCouponCode,
        Value,
        CreatedAt,
    }
}

mod m20240601_000005_create_coin_transactions_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000005_create_coin_transactions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CoinTransactions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CoinTransactions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CoinTransactions::UserId).uuid().not_null())
                        .col(
                            ColumnDef::new(CoinTransactions::TransactionType)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CoinTransactions::Amount)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CoinTransactions::Source).string().not_null())
                        .col(
                            ColumnDef::new(CoinTransactions::Description)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CoinTransactions::ReferenceId).uuid().null())
                        .col(
                            ColumnDef::new(CoinTransactions::ReferenceModel)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(CoinTransactions::BalanceAfter)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CoinTransactions::Metadata).json().null())
                        .col(
                            ColumnDef::new(CoinTransactions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // One entry per (user, source, reference) keeps credits idempotent
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_coin_transactions_ledger_key")
                        .table(CoinTransactions::Table)
                        .col(CoinTransactions::UserId)
                        .col(CoinTransactions::Source)
                        .col(CoinTransactions::ReferenceId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_coin_transactions_user_created_at")
                        .table(CoinTransactions::Table)
                        .col(CoinTransactions::UserId)
                        .col(CoinTransactions::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CoinTransactions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum CoinTransactions {
        Table,
        Id,
        UserId,
        TransactionType,
        Amount,
        Source,
        Description,
        ReferenceId,
        ReferenceModel,
        BalanceAfter,
        Metadata,
        CreatedAt,
    }
}

mod m20240601_000006_create_referrals_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000006_create_referrals_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Referrals::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Referrals::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Referrals::ReferrerId).uuid().not_null())
                        .col(ColumnDef::new(Referrals::ReferredId).uuid().not_null())
                        .col(ColumnDef::new(Referrals::Status).string().not_null())
                        .col(
                            ColumnDef::new(Referrals::FirstOrderCompleted)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Referrals::FirstOrderDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Referrals::OrderReward)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Referrals::TotalRewards)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Referrals::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Referrals::UpdatedAt)
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
                        .name("idx_referrals_pair")
                        .table(Referrals::Table)
                        .col(Referrals::ReferrerId)
                        .col(Referrals::ReferredId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Referrals::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Referrals {
        Table,
        Id,
        ReferrerId,
        ReferredId,
        Status,
        FirstOrderCompleted,
        FirstOrderDate,
        OrderReward,
        TotalRewards,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000007_create_coupons_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000007_create_coupons_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Coupons::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Coupons::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Coupons::Code).string_len(16).not_null())
                        .col(ColumnDef::new(Coupons::CouponType).string().not_null())
                        .col(ColumnDef::new(Coupons::GiftItem).json().not_null())
                        .col(ColumnDef::new(Coupons::GiftProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(Coupons::ValidUntil)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::UsageLimit)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(Coupons::UsedCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Coupons::AssignedTo).uuid().not_null())
                        .col(ColumnDef::new(Coupons::SourceOrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(Coupons::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(ColumnDef::new(Coupons::Metadata).json().not_null())
                        .col(
                            ColumnDef::new(Coupons::CreatedAt)
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
                        .name("idx_coupons_code")
                        .table(Coupons::Table)
                        .col(Coupons::Code)
                        .unique()
                        .to_owned(),
                )
                .await?;

            // At most one gift coupon per order
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_coupons_source_order_id")
                        .table(Coupons::Table)
                        .col(Coupons::SourceOrderId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_coupons_assigned_to")
                        .table(Coupons::Table)
                        .col(Coupons::AssignedTo)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Coupons::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Coupons {
        Table,
        Id,
        Code,
        CouponType,
        GiftItem,
        GiftProductId,
        ValidUntil,
        UsageLimit,
        UsedCount,
        AssignedTo,
        SourceOrderId,
        IsActive,
        Metadata,
        CreatedAt,
    }
}
