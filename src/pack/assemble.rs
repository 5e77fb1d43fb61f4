//! Pack orchestrator: drives each file range through the chunker, DAG
//! builder, and CAR writer.
//!
//! The pipeline is a pull chain. The chunker reads when the DAG builder
//! demands a leaf, the builder emits blocks as layers fill, and the CAR
//! writer appends them (rolling over transparently), so backpressure
//! falls out of the sequential awaits and nothing buffers more than one
//! layer of links.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::car::{CarResult, CarWriter};
use super::chunker::Chunker;
use super::dag::FileDagBuilder;
use crate::db::entities::{dataset, file, file_range};
use crate::error::{PackError, Result};
use crate::source::{ByteStream, SourceError, SourceHandler};

const OPEN_ATTEMPTS: u32 = 3;
const OPEN_RETRY_DELAY_MS: u64 = 500;

/// Identifies one source object that was read during the pack, for
/// logging and the delete-after-export pass.
#[derive(Clone, Debug)]
pub struct SourceObject {
    pub file_id: i64,
    pub path: String,
    pub remote: String,
}

/// Everything a pack produced, before any catalog mutation.
pub struct PackResult {
    pub file_range_cids: HashMap<i64, Cid>,
    pub car_results: Vec<CarResult>,
    pub objects: HashMap<i64, SourceObject>,
}

/// Stream every range of the job into CAR files under `out_dir`.
///
/// Ranges are processed in input order, which is also block-emit order
/// in the CARs. On any error all partially written CAR files are
/// removed before the error propagates.
pub async fn assemble_car(
    token: &CancellationToken,
    handler: Arc<dyn SourceHandler>,
    dataset: &dataset::Model,
    ranges: &[(file_range::Model, file::Model)],
    out_dir: &str,
    pack_job_id: i64,
) -> Result<PackResult> {
    let mut writer = CarWriter::new(
        out_dir,
        &dataset.name,
        pack_job_id,
        dataset.piece_size as u64,
    )?;

    let (file_range_cids, objects) =
        match assemble_ranges(token, handler.as_ref(), dataset, ranges, &mut writer).await {
            Ok(produced) => produced,
            Err(e) => {
                writer.abort().await;
                return Err(e);
            }
        };

    let car_results = match writer.finalize().await {
        Ok(results) => results,
        Err(e) => {
            writer.abort().await;
            return Err(e);
        }
    };

    Ok(PackResult {
        file_range_cids,
        car_results,
        objects,
    })
}

async fn assemble_ranges(
    token: &CancellationToken,
    handler: &dyn SourceHandler,
    dataset: &dataset::Model,
    ranges: &[(file_range::Model, file::Model)],
    writer: &mut CarWriter,
) -> Result<(HashMap<i64, Cid>, HashMap<i64, SourceObject>)> {
    let mut file_range_cids = HashMap::new();
    let mut objects = HashMap::new();

    for (range, file) in ranges {
        if token.is_cancelled() {
            return Err(PackError::Cancelled);
        }
        debug!(
            range_id = range.id,
            file = %file.path,
            offset = range.offset,
            length = range.length,
            "packing file range"
        );

        let stream = open_with_retry(
            handler,
            &file.path,
            range.offset as u64,
            range.length as u64,
        )
        .await?;

        let mut chunker = Chunker::new(stream, dataset.chunk_size as usize);
        let mut builder = FileDagBuilder::new();
        while let Some((chunk, _)) = chunker.next_chunk().await? {
            for block in builder.add_chunk(chunk) {
                writer.write_block(&block).await?;
            }
        }
        if chunker.bytes_read() != range.length as u64 {
            return Err(PackError::SourceCorrupt {
                path: file.path.clone(),
                expected: range.length as u64,
                got: chunker.bytes_read(),
            });
        }

        let (parents, root) = builder.finalize();
        for block in &parents {
            writer.write_block(block).await?;
        }
        writer.set_root(root.cid);

        file_range_cids.insert(range.id, root.cid);
        objects.entry(file.id).or_insert_with(|| SourceObject {
            file_id: file.id,
            path: file.path.clone(),
            remote: handler.remote(&file.path),
        });
    }

    Ok((file_range_cids, objects))
}

async fn open_with_retry(
    handler: &dyn SourceHandler,
    path: &str,
    offset: u64,
    length: u64,
) -> Result<ByteStream> {
    let mut attempt = 0u32;
    loop {
        match handler.open(path, offset, length).await {
            Ok(stream) => return Ok(stream),
            Err(SourceError::Unavailable(msg)) if attempt + 1 < OPEN_ATTEMPTS => {
                attempt += 1;
                warn!(path, attempt, error = %msg, "source unavailable, retrying open");
                tokio::time::sleep(Duration::from_millis(OPEN_RETRY_DELAY_MS)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
