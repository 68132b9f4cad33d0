//! SeaORM Entity for the per-bucket rate sample table

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "rate_samples")]
pub struct Model {
    /// Aligned bucket start; one row per bucket
    #[sea_orm(primary_key, auto_increment = false)]
    pub bucket_ts: DateTimeWithTimeZone,
    /// Official (vault) rate, 18 fractional digits
    #[sea_orm(column_type = "Decimal(Some((38, 18)))")]
    pub official_rate: Decimal,
    /// Market (quote) rate, 18 fractional digits
    #[sea_orm(column_type = "Decimal(Some((38, 18)))")]
    pub market_rate: Decimal,
    /// (market / official - 1) * 100, signed
    #[sea_orm(column_type = "Decimal(Some((18, 8)))")]
    pub deviation_pct: Decimal,
    #[sea_orm(column_type = "Decimal(Some((38, 18)))")]
    pub notional: Decimal,
    pub quote_quality: String,
    /// Opaque quote payload kept for audit
    #[sea_orm(column_type = "JsonBinary")]
    pub raw_quote: Json,
    pub block_number: Option<i64>,
    /// 'complete' or 'errored'
    pub status: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::alerts::Entity")]
    Alert,
}

impl Related<super::alerts::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Alert.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
