//! Source entity (one scanned backend root within a dataset)

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sources")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub dataset_id: i64,
    pub kind: String,             // Handler tag, e.g. "local"
    pub path: String,             // Backend-specific base path or remote
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::dataset::Entity",
        from = "Column::DatasetId",
        to = "super::dataset::Column::Id"
    )]
    Dataset,
    #[sea_orm(has_many = "super::pack_job::Entity")]
    PackJobs,
    #[sea_orm(has_many = "super::directory::Entity")]
    Directories,
}

impl Related<super::dataset::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Dataset.def()
    }
}

impl Related<super::pack_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PackJobs.def()
    }
}

impl Related<super::directory::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Directories.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
