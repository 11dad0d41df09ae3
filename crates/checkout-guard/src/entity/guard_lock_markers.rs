//! guard_lock_markers entity
//! Expiring mutual-exclusion markers for stores without a native named lock

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "guard_lock_markers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub lock_name: String,  // VARCHAR(64)
    pub holder: String,  // UUID of the holding session
    #[sea_orm(column_type = "TimestampWithTimeZone")]
    pub acquired_at: DateTimeUtc,
    #[sea_orm(column_type = "TimestampWithTimeZone")]
    pub lease_until: DateTimeUtc,  // Marker is void after this instant
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
