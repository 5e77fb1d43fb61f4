//! carpack: pack job execution core for a data-preservation pipeline.
//!
//! A pack job streams an ordered set of file ranges from a source
//! backend through a fixed-size chunker and a balanced UnixFS DAG
//! builder into CARv1 files capped at a target piece size, computes the
//! Filecoin piece commitment per CAR, and then updates the relational
//! catalog (range, file, and directory CIDs plus the CAR block index)
//! inside retry-wrapped transactions.
//!
//! [`pack::pack`] is the single entry point; [`pack::pack_handler`]
//! additionally loads the job by id and records its terminal state.

pub mod daggen;
pub mod db;
pub mod error;
pub mod pack;
pub mod source;
pub mod unixfs;

pub use error::{PackError, Result};
pub use pack::{load_pack_job, pack, pack_handler, PackJobDetails};
