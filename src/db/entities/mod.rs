//! Database entities

pub mod car;
pub mod car_block;
pub mod dataset;
pub mod directory;
pub mod file;
pub mod file_range;
pub mod pack_job;
pub mod source;

pub use car::Entity as Car;
pub use car_block::Entity as CarBlock;
pub use dataset::Entity as Dataset;
pub use directory::Entity as Directory;
pub use file::Entity as File;
pub use file_range::Entity as FileRange;
pub use pack_job::Entity as PackJob;
pub use source::Entity as Source;
