//! SeaORM Entity for alerts (at most one per sample bucket)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "alerts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub sample_ts: DateTimeWithTimeZone,
    #[sea_orm(column_type = "Decimal(Some((18, 8)))")]
    pub deviation_pct: Decimal,
    #[sea_orm(column_type = "Decimal(Some((18, 8)))")]
    pub threshold_pct: Decimal,
    /// 'up', 'down' or 'flat'
    pub direction: String,
    pub channels: Vec<String>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::rate_samples::Entity",
        from = "Column::SampleTs",
        to = "super::rate_samples::Column::BucketTs",
        on_delete = "Cascade"
    )]
    RateSample,
}

impl Related<super::rate_samples::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RateSample.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
