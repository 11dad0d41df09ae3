//! orders entity
//! Owned by the order-persistence side; the guard reads it and writes through a held session

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: u64,
    #[sea_orm(indexed)]
    pub fingerprint: String,  // SHA-256 hex of cart + identity (CHAR(64))
    pub customer_identity: String,  // email:<address> or account:<id>
    pub status: String,  // pending, processing, on_hold, completed, refunded, cancelled, failed
    #[sea_orm(column_type = "TimestampWithTimeZone")]
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
