//! Car block entity (index row for one block frame inside a CAR)

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "car_blocks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub car_id: i64,
    pub cid: String,
    pub car_offset: i64,          // Offset of the varint frame within the CAR
    pub varint_size: i32,         // Length of the varint length prefix
    pub raw_block_size: i64,      // Length of the block data, CID excluded
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::car::Entity",
        from = "Column::CarId",
        to = "super::car::Column::Id"
    )]
    Car,
}

impl Related<super::car::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Car.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
