//! Dataset entity (packing configuration shared by its sources)

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "datasets")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub piece_size: i64,          // Target unpadded CAR size cap in bytes
    pub chunk_size: i64,          // UnixFS leaf size in bytes
    pub output_dirs: String,      // JSON array of output directories
    pub delete_after_export: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::source::Entity")]
    Sources,
}

impl Related<super::source::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Sources.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Output directories parsed from the JSON column.
    pub fn output_dirs(&self) -> Vec<String> {
        serde_json::from_str(&self.output_dirs).unwrap_or_default()
    }
}
