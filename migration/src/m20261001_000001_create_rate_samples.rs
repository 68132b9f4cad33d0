use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // One row per aligned bucket; the bucket timestamp is the identity key
        manager
            .create_table(
                Table::create()
                    .table(RateSamples::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RateSamples::BucketTs)
                            .timestamp_with_time_zone()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RateSamples::OfficialRate)
                            .decimal_len(38, 18)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RateSamples::MarketRate)
                            .decimal_len(38, 18)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RateSamples::DeviationPct)
                            .decimal_len(18, 8)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RateSamples::Notional)
                            .decimal_len(38, 18)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RateSamples::QuoteQuality)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RateSamples::RawQuote)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(ColumnDef::new(RateSamples::BlockNumber).big_integer().null())
                    .col(
                        ColumnDef::new(RateSamples::Status)
                            .string_len(16)
                            .not_null()
                            .default("complete"),
                    )
                    .col(ColumnDef::new(RateSamples::Error).text().null())
                    .col(
                        ColumnDef::new(RateSamples::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(SimpleExpr::Keyword(Keyword::CurrentTimestamp)),
                    )
                    .to_owned(),
            )
            .await?;

        // Recent-first listing used by `show`
        manager
            .create_index(
                Index::create()
                    .name("idx_rate_samples_bucket_desc")
                    .table(RateSamples::Table)
                    .col((RateSamples::BucketTs, IndexOrder::Desc))
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RateSamples::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum RateSamples {
    Table,
    BucketTs,
    OfficialRate,
    MarketRate,
    DeviationPct,
    Notional,
    QuoteQuality,
    RawQuote,
    BlockNumber,
    Status,
    Error,
    CreatedAt,
}
