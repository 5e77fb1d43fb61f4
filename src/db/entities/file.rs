//! File entity (one logical source object)

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "files")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub source_id: i64,
    pub directory_id: i64,
    pub path: String,             // Relative path within the source, '/' separated
    pub size: i64,
    pub cid: Option<String>,      // Set once every range of the file has a CID
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::directory::Entity",
        from = "Column::DirectoryId",
        to = "super::directory::Column::Id"
    )]
    Directory,
    #[sea_orm(has_many = "super::file_range::Entity")]
    FileRanges,
}

impl Related<super::directory::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Directory.def()
    }
}

impl Related<super::file_range::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FileRanges.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Basename of the file within its directory.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}
