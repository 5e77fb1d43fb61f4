//! File range entity (half-open byte interval of a file)

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "file_ranges")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub file_id: i64,
    pub pack_job_id: Option<i64>, // Job the range is assigned to
    pub offset: i64,
    pub length: i64,
    pub cid: Option<String>,      // Set when the range has been packed
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::file::Entity",
        from = "Column::FileId",
        to = "super::file::Column::Id"
    )]
    File,
    #[sea_orm(
        belongs_to = "super::pack_job::Entity",
        from = "Column::PackJobId",
        to = "super::pack_job::Column::Id"
    )]
    PackJob,
}

impl Related<super::file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::File.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether this range covers its file entirely.
    pub fn is_whole_file(&self, file: &super::file::Model) -> bool {
        self.offset == 0 && self.length == file.size
    }
}
