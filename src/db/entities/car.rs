//! Car entity (one produced CAR file and its Filecoin piece commitment)

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "cars")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub piece_cid: String,
    pub piece_size: i64,          // Padded size, power of two >= file_size
    pub root_cid: String,
    pub file_size: i64,
    pub file_path: String,
    pub pack_job_id: Option<i64>,
    pub dataset_id: i64,
    pub source_id: Option<i64>,
    pub header: Vec<u8>,          // Raw CARv1 header bytes, varint prefix included
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::pack_job::Entity",
        from = "Column::PackJobId",
        to = "super::pack_job::Column::Id"
    )]
    PackJob,
    #[sea_orm(has_many = "super::car_block::Entity")]
    Blocks,
}

impl Related<super::pack_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PackJob.def()
    }
}

impl Related<super::car_block::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Blocks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
