#![allow(elided_lifetimes_in_paths)]

use anyhow::Result;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::prelude::*;
use std::time::Duration;
use tracing::{error, info};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_donation_tables::Migration),
            Box::new(m20250101_000002_create_gateway_tables::Migration),
            Box::new(m20250101_000003_create_payments_table::Migration),
            Box::new(m20250101_000004_create_payment_attempts_table::Migration),
        ]
    }
}

fn id_column<T: IntoIden>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .big_integer()
        .not_null()
        .auto_increment()
        .primary_key()
        .to_owned()
}

fn money_column<T: IntoIden>(col: T) -> ColumnDef {
    ColumnDef::new(col).decimal_len(16, 4).to_owned()
}

mod m20250101_000001_create_donation_tables {
    use super::{id_column, money_column};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000001_create_donation_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Campaigns::Table)
                        .if_not_exists()
                        .col(id_column(Campaigns::Id))
                        .col(ColumnDef::new(Campaigns::Title).string().not_null())
                        .col(money_column(Campaigns::GoalAmount).not_null())
                        .col(ColumnDef::new(Campaigns::Currency).string_len(3).not_null())
                        .col(
                            ColumnDef::new(Campaigns::DonationsCount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(money_column(Campaigns::AmountRaised).not_null().default(0))
                        .col(
                            ColumnDef::new(Campaigns::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Campaigns::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Donations::Table)
                        .if_not_exists()
                        .col(id_column(Donations::Id))
                        .col(ColumnDef::new(Donations::CampaignId).big_integer().not_null())
                        .col(ColumnDef::new(Donations::DonorId).big_integer().null())
                        .col(money_column(Donations::Amount).not_null())
                        .col(ColumnDef::new(Donations::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Donations::PaymentMethod).string().not_null())
                        .col(ColumnDef::new(Donations::PaymentIntentId).string().null())
                        .col(ColumnDef::new(Donations::Status).text().not_null())
                        .col(ColumnDef::new(Donations::IsAnonymous).boolean().not_null())
                        .col(ColumnDef::new(Donations::IsRecurring).boolean().not_null())
                        .col(ColumnDef::new(Donations::RecurringFrequency).string().null())
                        .col(
                            ColumnDef::new(Donations::DonatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Donations::ProcessedAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Donations::CompletedAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Donations::CancelledAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Donations::RefundedAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Donations::FailedAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Donations::FailureReason).text().null())
                        .col(ColumnDef::new(Donations::RefundReason).text().null())
                        .col(ColumnDef::new(Donations::Metadata).json().null())
                        .col(ColumnDef::new(Donations::DeletedAt).timestamp_with_time_zone().null())
                        .col(
                            ColumnDef::new(Donations::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Donations::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_donations_campaign_id")
                                .from(Donations::Table, Donations::CampaignId)
                                .to(Campaigns::Table, Campaigns::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_donations_campaign_id")
                        .table(Donations::Table)
                        .col(Donations::CampaignId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_donations_payment_intent_id")
                        .table(Donations::Table)
                        .col(Donations::PaymentIntentId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Donations::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Campaigns::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Campaigns {
        Table,
        Id,
        Title,
        GoalAmount,
        Currency,
        DonationsCount,
        AmountRaised,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum Donations {
        Table,
        Id,
        CampaignId,
        DonorId,
        Amount,
        Currency,
        PaymentMethod,
        PaymentIntentId,
        Status,
        IsAnonymous,
        IsRecurring,
        RecurringFrequency,
        DonatedAt,
        ProcessedAt,
        CompletedAt,
        CancelledAt,
        RefundedAt,
        FailedAt,
        FailureReason,
        RefundReason,
        Metadata,
        DeletedAt,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000002_create_gateway_tables {
    use super::{id_column, money_column};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000002_create_gateway_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentGateways::Table)
                        .if_not_exists()
                        .col(id_column(PaymentGateways::Id))
                        .col(ColumnDef::new(PaymentGateways::Name).string().not_null())
                        .col(ColumnDef::new(PaymentGateways::Provider).text().not_null())
                        .col(
                            ColumnDef::new(PaymentGateways::IsActive)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(PaymentGateways::ApiKeyEncrypted).text().null())
                        .col(ColumnDef::new(PaymentGateways::WebhookSecretEncrypted).text().null())
                        .col(ColumnDef::new(PaymentGateways::SettingsEncrypted).text().null())
                        .col(
                            ColumnDef::new(PaymentGateways::Priority)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(money_column(PaymentGateways::MinAmount).not_null())
                        .col(money_column(PaymentGateways::MaxAmount).not_null())
                        .col(ColumnDef::new(PaymentGateways::TestMode).boolean().not_null())
                        .col(
                            ColumnDef::new(PaymentGateways::LockVersion)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PaymentGateways::DeletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentGateways::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentGateways::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PaymentGatewayCurrencies::Table)
                        .if_not_exists()
                        .col(id_column(PaymentGatewayCurrencies::Id))
                        .col(
                            ColumnDef::new(PaymentGatewayCurrencies::GatewayId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentGatewayCurrencies::Currency)
                                .string_len(3)
                                .not_null(),
                        )
                        .col(money_column(PaymentGatewayCurrencies::MinAmount).null())
                        .col(money_column(PaymentGatewayCurrencies::MaxAmount).null())
                        .col(
                            ColumnDef::new(PaymentGatewayCurrencies::FeePercentage)
                                .decimal_len(7, 6)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            money_column(PaymentGatewayCurrencies::FeeFixed)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PaymentGatewayCurrencies::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_gateway_currencies_gateway_id")
                                .from(
                                    PaymentGatewayCurrencies::Table,
                                    PaymentGatewayCurrencies::GatewayId,
                                )
                                .to(PaymentGateways::Table, PaymentGateways::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_gateway_currencies_gateway_currency")
                        .table(PaymentGatewayCurrencies::Table)
                        .col(PaymentGatewayCurrencies::GatewayId)
                        .col(PaymentGatewayCurrencies::Currency)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentGatewayCurrencies::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(PaymentGateways::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PaymentGateways {
        Table,
        Id,
        Name,
        Provider,
        IsActive,
        ApiKeyEncrypted,
        WebhookSecretEncrypted,
        SettingsEncrypted,
        Priority,
        MinAmount,
        MaxAmount,
        TestMode,
        LockVersion,
        DeletedAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum PaymentGatewayCurrencies {
        Table,
        Id,
        GatewayId,
        Currency,
        MinAmount,
        MaxAmount,
        FeePercentage,
        FeeFixed,
        IsActive,
    }
}

mod m20250101_000003_create_payments_table {
    use super::m20250101_000001_create_donation_tables::Donations;
    use super::{id_column, money_column};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000003_create_payments_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(id_column(Payments::Id))
                        .col(ColumnDef::new(Payments::DonationId).big_integer().not_null())
                        .col(ColumnDef::new(Payments::GatewayName).string().not_null())
                        .col(ColumnDef::new(Payments::IntentId).string().not_null())
                        .col(ColumnDef::new(Payments::TransactionId).string().null())
                        .col(money_column(Payments::Amount).not_null())
                        .col(ColumnDef::new(Payments::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Payments::PaymentMethod).string().null())
                        .col(ColumnDef::new(Payments::Status).text().not_null())
                        .col(ColumnDef::new(Payments::GatewayCustomerId).string().null())
                        .col(ColumnDef::new(Payments::GatewayPaymentMethodId).string().null())
                        .col(ColumnDef::new(Payments::FailureCode).string().null())
                        .col(ColumnDef::new(Payments::FailureMessage).text().null())
                        .col(ColumnDef::new(Payments::DeclineCode).string().null())
                        .col(ColumnDef::new(Payments::GatewayData).json().not_null())
                        .col(ColumnDef::new(Payments::Metadata).json().null())
                        .col(ColumnDef::new(Payments::AuthorizedAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Payments::CapturedAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Payments::FailedAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Payments::CancelledAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Payments::ExpiresAt).timestamp_with_time_zone().null())
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payments_donation_id")
                                .from(Payments::Table, Payments::DonationId)
                                .to(Donations::Table, Donations::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_payments_donation_id")
                        .table(Payments::Table)
                        .col(Payments::DonationId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_payments_gateway_intent")
                        .table(Payments::Table)
                        .col(Payments::GatewayName)
                        .col(Payments::IntentId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Payments {
        Table,
        Id,
        DonationId,
        GatewayName,
        IntentId,
        TransactionId,
        Amount,
        Currency,
        PaymentMethod,
        Status,
        GatewayCustomerId,
        GatewayPaymentMethodId,
        FailureCode,
        FailureMessage,
        DeclineCode,
        GatewayData,
        Metadata,
        AuthorizedAt,
        CapturedAt,
        FailedAt,
        CancelledAt,
        ExpiresAt,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000004_create_payment_attempts_table {
    use super::id_column;
    use super::m20250101_000003_create_payments_table::Payments;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000004_create_payment_attempts_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentAttempts::Table)
                        .if_not_exists()
                        .col(id_column(PaymentAttempts::Id))
                        .col(ColumnDef::new(PaymentAttempts::PaymentId).big_integer().not_null())
                        .col(ColumnDef::new(PaymentAttempts::AttemptNumber).integer().not_null())
                        .col(ColumnDef::new(PaymentAttempts::GatewayName).string().not_null())
                        .col(ColumnDef::new(PaymentAttempts::GatewayAction).string().not_null())
                        .col(ColumnDef::new(PaymentAttempts::GatewayRequestId).string().not_null())
                        .col(ColumnDef::new(PaymentAttempts::RequestData).json().null())
                        .col(ColumnDef::new(PaymentAttempts::ResponseData).json().null())
                        .col(ColumnDef::new(PaymentAttempts::Status).text().not_null())
                        .col(ColumnDef::new(PaymentAttempts::ErrorCode).string().null())
                        .col(ColumnDef::new(PaymentAttempts::ErrorMessage).text().null())
                        .col(ColumnDef::new(PaymentAttempts::ResponseTimeMs).big_integer().null())
                        .col(ColumnDef::new(PaymentAttempts::GatewayTransactionId).string().null())
                        .col(ColumnDef::new(PaymentAttempts::IpAddress).string().null())
                        .col(ColumnDef::new(PaymentAttempts::UserAgent).text().null())
                        .col(
                            ColumnDef::new(PaymentAttempts::AttemptedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentAttempts::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payment_attempts_payment_id")
                                .from(PaymentAttempts::Table, PaymentAttempts::PaymentId)
                                .to(Payments::Table, Payments::Id),
                        )
                        .to_owned(),
                )
                .await?;

            // Gap-free numbering relies on this index to reject duplicates
            manager
                .create_index(
                    Index::create()
                        .name("idx_payment_attempts_payment_number")
                        .table(PaymentAttempts::Table)
                        .col(PaymentAttempts::PaymentId)
                        .col(PaymentAttempts::AttemptNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_payment_attempts_attempted_at")
                        .table(PaymentAttempts::Table)
                        .col(PaymentAttempts::AttemptedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentAttempts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PaymentAttempts {
        Table,
        Id,
        PaymentId,
        AttemptNumber,
        GatewayName,
        GatewayAction,
        GatewayRequestId,
        RequestData,
        ResponseData,
        Status,
        ErrorCode,
        ErrorMessage,
        ResponseTimeMs,
        GatewayTransactionId,
        IpAddress,
        UserAgent,
        AttemptedAt,
        CompletedAt,
    }
}

/// Connects to `db_url` and applies all pending migrations.
pub async fn run_migration(db_url: &str) -> Result<()> {
    info!("Setting up database connection for migrations");

    let mut opt = ConnectOptions::new(db_url);
    opt.max_connections(2)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;

    info!("Running database migrations");
    match Migrator::up(&db, None).await {
        Ok(_) => {
            info!("Migrations completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Migration failed: {}", e);
            Err(e.into())
        }
    }
}
