use sea_orm_migration::prelude::*;

use crate::m20261001_000001_create_rate_samples::RateSamples;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Alerts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Alerts::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Alerts::SampleTs)
                            .timestamp_with_time_zone()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Alerts::DeviationPct)
                            .decimal_len(18, 8)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Alerts::ThresholdPct)
                            .decimal_len(18, 8)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Alerts::Direction).string_len(8).not_null())
                    .col(
                        ColumnDef::new(Alerts::Channels)
                            .array(ColumnType::Text)
                            .not_null()
                            .default(Expr::cust("'{}'::text[]")),
                    )
                    .col(
                        ColumnDef::new(Alerts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(SimpleExpr::Keyword(Keyword::CurrentTimestamp)),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_alerts_sample_ts")
                            .from(Alerts::Table, Alerts::SampleTs)
                            .to(RateSamples::Table, RateSamples::BucketTs)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Retention sweeps and recent-alert listings go by created_at
        manager
            .create_index(
                Index::create()
                    .name("idx_alerts_created_at")
                    .table(Alerts::Table)
                    .col(Alerts::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Alerts::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Alerts {
    Table,
    Id,
    SampleTs,
    DeviationPct,
    ThresholdPct,
    Direction,
    Channels,
    CreatedAt,
}
