//! Pack job execution.
//!
//! [`pack`] is the core entry point: it assembles CAR files for a
//! loaded pack job and then applies the catalog updates in order (range
//! and file CIDs first, CAR rows and their block index in one
//! transaction, directory reconciliation in another), so no directory
//! ever links a CID that is not persisted. [`pack_handler`] wraps it
//! with job loading and terminal state bookkeeping.

pub mod assemble;
pub mod car;
pub mod chunker;
pub mod commp;
pub mod dag;
pub mod device;

use std::collections::{HashMap, HashSet};

use cid::Cid;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::daggen::{self, DirectoryData};
use crate::db::entities::{
    self, car as car_entity, car_block, dataset, directory, file, file_range, pack_job, source,
};
use crate::db::retry::do_retry;
use crate::error::{PackError, Result};
use crate::source::HandlerResolver;

use self::assemble::PackResult;

/// Rows per bulk insert of car blocks.
pub const BATCH_SIZE: usize = 1000;

/// A pack job with its relations loaded: the owning source and dataset,
/// plus the job's ranges paired with their files, in input order.
pub struct PackJobDetails {
    pub job: pack_job::Model,
    pub source: source::Model,
    pub dataset: dataset::Model,
    pub ranges: Vec<(file_range::Model, file::Model)>,
}

/// Load a pack job and everything [`pack`] needs to run it.
pub async fn load_pack_job(db: &DatabaseConnection, pack_job_id: i64) -> Result<PackJobDetails> {
    let job = entities::PackJob::find_by_id(pack_job_id)
        .one(db)
        .await?
        .ok_or_else(|| PackError::NotFound(format!("pack job {pack_job_id}")))?;
    let source = entities::Source::find_by_id(job.source_id)
        .one(db)
        .await?
        .ok_or_else(|| PackError::NotFound(format!("source {}", job.source_id)))?;
    let dataset = entities::Dataset::find_by_id(source.dataset_id)
        .one(db)
        .await?
        .ok_or_else(|| PackError::NotFound(format!("dataset {}", source.dataset_id)))?;

    let range_rows = entities::FileRange::find()
        .filter(file_range::Column::PackJobId.eq(pack_job_id))
        .order_by_asc(file_range::Column::Id)
        .all(db)
        .await?;

    let mut files: HashMap<i64, file::Model> = HashMap::new();
    let mut ranges = Vec::with_capacity(range_rows.len());
    for row in range_rows {
        if !files.contains_key(&row.file_id) {
            let file = entities::File::find_by_id(row.file_id)
                .one(db)
                .await?
                .ok_or_else(|| PackError::NotFound(format!("file {}", row.file_id)))?;
            files.insert(row.file_id, file);
        }
        let file = files[&row.file_id].clone();
        ranges.push((row, file));
    }

    Ok(PackJobDetails {
        job,
        source,
        dataset,
        ranges,
    })
}

/// Load and run a pack job by id, recording its terminal state.
pub async fn pack_handler(
    token: &CancellationToken,
    db: &DatabaseConnection,
    resolver: &dyn HandlerResolver,
    pack_job_id: i64,
) -> Result<Vec<car_entity::Model>> {
    let details = load_pack_job(db, pack_job_id).await?;
    set_job_state(db, pack_job_id, pack_job::state::RUNNING, None).await?;

    match pack(token, db, &details, resolver).await {
        Ok(cars) => {
            set_job_state(db, pack_job_id, pack_job::state::COMPLETE, None).await?;
            Ok(cars)
        }
        Err(e) => {
            if let Err(update_err) =
                set_job_state(db, pack_job_id, pack_job::state::ERROR, Some(e.to_string())).await
            {
                warn!(pack_job_id, error = %update_err, "failed to record job error state");
            }
            Err(e)
        }
    }
}

async fn set_job_state(
    db: &DatabaseConnection,
    pack_job_id: i64,
    state: &str,
    error_message: Option<String>,
) -> Result<()> {
    entities::PackJob::update_many()
        .col_expr(pack_job::Column::State, Expr::value(state))
        .col_expr(pack_job::Column::ErrorMessage, Expr::value(error_message))
        .filter(pack_job::Column::Id.eq(pack_job_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Pack one job: stream its ranges into CAR files, then update the
/// catalog. On failure nothing is persisted and partial CAR files are
/// removed; source objects are only deleted after a fully successful
/// run, and only for files with no unpacked ranges left.
pub async fn pack(
    token: &CancellationToken,
    db: &DatabaseConnection,
    details: &PackJobDetails,
    resolver: &dyn HandlerResolver,
) -> Result<Vec<car_entity::Model>> {
    let dataset = &details.dataset;

    let output_dirs = dataset.output_dirs();
    if output_dirs.is_empty() {
        return Err(PackError::NotFound(format!(
            "output directories for dataset {}",
            dataset.name
        )));
    }
    let out_dir = match device::path_with_most_space(&output_dirs) {
        Ok(dir) => dir,
        Err(e) => {
            warn!(error = %e, "failed to get path with most space, using the first one");
            output_dirs[0].clone()
        }
    };
    debug!(dir = %out_dir, "using output directory");

    let handler = resolver
        .resolve(&details.source)
        .await
        .map_err(|e| PackError::HandlerResolution(e.to_string()))?;

    let result = assemble::assemble_car(
        token,
        handler.clone(),
        dataset,
        &details.ranges,
        &out_dir,
        details.job.id,
    )
    .await?;

    // Range CID updates are idempotent, so they run outside any
    // transaction. Whole-file ranges settle the file CID immediately;
    // partial files wait for the reconciler.
    for (range, file) in &details.ranges {
        let range_cid = *result
            .file_range_cids
            .get(&range.id)
            .ok_or(PackError::RangeNotPacked(range.id))?;
        debug!(range_id = range.id, cid = %range_cid, "updating file range CID");
        let cid_value = range_cid.to_string();
        do_retry(token, || {
            let cid_value = cid_value.clone();
            async move {
                entities::FileRange::update_many()
                    .col_expr(file_range::Column::Cid, Expr::value(cid_value))
                    .filter(file_range::Column::Id.eq(range.id))
                    .exec(db)
                    .await?;
                Ok(())
            }
        })
        .await?;

        if range.is_whole_file(file) {
            debug!(file_id = file.id, cid = %range_cid, "updating file CID");
            let cid_value = range_cid.to_string();
            do_retry(token, || {
                let cid_value = cid_value.clone();
                async move {
                    entities::File::update_many()
                        .col_expr(file::Column::Cid, Expr::value(cid_value))
                        .filter(file::Column::Id.eq(file.id))
                        .exec(db)
                        .await?;
                    Ok(())
                }
            })
            .await?;
        }
    }

    // All car and car_block rows commit together or not at all.
    debug!(pack_job_id = details.job.id, "creating cars for finished pack job");
    let cars = do_retry(token, || async {
        let txn = db.begin().await.map_err(PackError::Db)?;
        let mut created = Vec::with_capacity(result.car_results.len());
        for car_result in &result.car_results {
            let car = car_entity::ActiveModel {
                piece_cid: Set(car_result.piece_cid.to_string()),
                piece_size: Set(car_result.piece_size as i64),
                root_cid: Set(car_result.root_cid.to_string()),
                file_size: Set(car_result.car_file_size as i64),
                file_path: Set(car_result.car_file_path.clone()),
                pack_job_id: Set(Some(details.job.id)),
                dataset_id: Set(dataset.id),
                source_id: Set(Some(details.source.id)),
                header: Set(car_result.header.clone()),
                ..Default::default()
            };
            let car = car.insert(&txn).await?;
            for batch in car_result.car_blocks.chunks(BATCH_SIZE) {
                let rows = batch.iter().map(|block| car_block::ActiveModel {
                    car_id: Set(car.id),
                    cid: Set(block.cid.to_string()),
                    car_offset: Set(block.car_offset as i64),
                    varint_size: Set(block.varint_size as i32),
                    raw_block_size: Set(block.raw_block_size as i64),
                    ..Default::default()
                });
                entities::CarBlock::insert_many(rows).exec(&txn).await?;
            }
            created.push(car);
        }
        txn.commit().await?;
        Ok(created)
    })
    .await?;

    debug!(pack_job_id = details.job.id, "updating directory data");
    do_retry(token, || async {
        let txn = db.begin().await.map_err(PackError::Db)?;
        reconcile_directories(&txn, details, &result).await?;
        txn.commit().await?;
        Ok(())
    })
    .await?;

    info!(pack_job_id = details.job.id, "finished packing");

    if dataset.delete_after_export && !result.car_results.is_empty() {
        info!("deleting source objects after export");
        let mut handled: HashSet<i64> = HashSet::new();
        for (range, file) in &details.ranges {
            if !handled.insert(file.id) {
                continue;
            }
            let Some(object) = result.objects.get(&file.id) else {
                continue;
            };

            if !range.is_whole_file(file) {
                // Other jobs may still register further ranges, so the
                // gate is byte coverage of the file, not a row count
                match file_fully_packed(db, file).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(file_id = file.id, "not all ranges are packed yet, skipping delete");
                        continue;
                    }
                    Err(e) => {
                        warn!(file_id = file.id, error = %e, "failed to check packed ranges");
                        continue;
                    }
                }
            }

            debug!(remote = %object.remote, "removing source object");
            if let Err(e) = handler.remove(&object.path).await {
                warn!(remote = %object.remote, error = %e, "failed to remove source object");
            }
        }
    }

    Ok(cars)
}

/// Merge the pack output into the enclosing directories and recompute
/// CIDs up to the source root. Runs inside one transaction.
async fn reconcile_directories<C: ConnectionTrait>(
    txn: &C,
    details: &PackJobDetails,
    result: &PackResult,
) -> Result<()> {
    if details.ranges.is_empty() {
        return Ok(());
    }

    let mut dir_cache: HashMap<i64, DirectoryData> = HashMap::new();
    let mut children_cache: HashMap<i64, Vec<i64>> = HashMap::new();

    for (range, file) in &details.ranges {
        let mut current = Some(file.directory_id);
        while let Some(dir_id) = current {
            if !dir_cache.contains_key(&dir_id) {
                let dir = entities::Directory::find_by_id(dir_id)
                    .one(txn)
                    .await?
                    .ok_or(PackError::DirectoryMissing(dir_id))?;
                if let Some(parent_id) = dir.parent_id {
                    children_cache.entry(parent_id).or_default().push(dir_id);
                }
                dir_cache.insert(dir_id, DirectoryData::from_model(dir)?);
            }

            // Only the immediate parent absorbs the range; the walk
            // above it just makes the ancestors resolvable.
            if dir_id == file.directory_id {
                let range_cid = *result
                    .file_range_cids
                    .get(&range.id)
                    .ok_or(PackError::RangeNotPacked(range.id))?;
                let name = file.name().to_string();

                if range.is_whole_file(file) {
                    let dir_data = dir_cache
                        .get_mut(&dir_id)
                        .ok_or(PackError::DirectoryMissing(dir_id))?;
                    dir_data.add_file(&name, range_cid, range.length as u64);
                } else {
                    let all_parts = entities::FileRange::find()
                        .filter(file_range::Column::FileId.eq(file.id))
                        .order_by_asc(file_range::Column::Offset)
                        .all(txn)
                        .await?;

                    if let Some(links) = packed_file_links(&all_parts, file.size)? {
                        let dir_data = dir_cache
                            .get_mut(&dir_id)
                            .ok_or(PackError::DirectoryMissing(dir_id))?;
                        let file_cid = dir_data.add_file_from_links(&name, links);
                        debug!(file_id = file.id, cid = %file_cid, "updating file CID from assembled parts");
                        entities::File::update_many()
                            .col_expr(file::Column::Cid, Expr::value(file_cid.to_string()))
                            .filter(file::Column::Id.eq(file.id))
                            .exec(txn)
                            .await?;
                    }
                }
            }

            current = dir_cache
                .get(&dir_id)
                .and_then(|d| d.directory.parent_id);
        }
    }

    let root_dir_id = root_directory_id(txn, details.source.id).await?;
    daggen::resolve_directory_tree(root_dir_id, &mut dir_cache, &children_cache)?;

    for (dir_id, dir_data) in &dir_cache {
        let data = dir_data.marshal()?;
        let (cid, _) = dir_data.node();
        entities::Directory::update_many()
            .col_expr(directory::Column::Cid, Expr::value(cid.to_string()))
            .col_expr(directory::Column::Data, Expr::value(data))
            .col_expr(directory::Column::Exported, Expr::value(false))
            .filter(directory::Column::Id.eq(*dir_id))
            .exec(txn)
            .await?;
    }

    Ok(())
}

async fn root_directory_id<C: ConnectionTrait>(txn: &C, source_id: i64) -> Result<i64> {
    entities::Directory::find()
        .filter(directory::Column::SourceId.eq(source_id))
        .filter(directory::Column::ParentId.is_null())
        .one(txn)
        .await?
        .map(|dir| dir.id)
        .ok_or_else(|| PackError::NotFound(format!("root directory for source {source_id}")))
}

/// Links for a fully packed file. Ranges can be registered
/// progressively across jobs, so the absence of unpacked rows proves
/// nothing; the file is complete only when its existing ranges cover
/// `[0, file.size)` contiguously and every one carries a CID. Returns
/// `None` while any byte is still uncovered or unpacked. `parts` must
/// be ordered by offset.
fn packed_file_links(
    parts: &[file_range::Model],
    file_size: i64,
) -> Result<Option<Vec<(Cid, u64)>>> {
    let mut links = Vec::with_capacity(parts.len());
    let mut expected_offset = 0i64;
    for part in parts {
        let Some(cid_str) = &part.cid else {
            return Ok(None);
        };
        if part.offset != expected_offset {
            return Ok(None);
        }
        links.push((Cid::try_from(cid_str.as_str())?, part.length as u64));
        expected_offset += part.length;
    }
    if expected_offset == file_size {
        Ok(Some(links))
    } else {
        Ok(None)
    }
}

/// Whether the file's registered ranges cover it entirely and are all
/// packed.
async fn file_fully_packed<C: ConnectionTrait>(db: &C, file: &file::Model) -> Result<bool> {
    let parts = entities::FileRange::find()
        .filter(file_range::Column::FileId.eq(file.id))
        .order_by_asc(file_range::Column::Offset)
        .all(db)
        .await?;
    Ok(packed_file_links(&parts, file.size)?.is_some())
}
