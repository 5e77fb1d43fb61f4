//! End-to-end pack job tests against an in-memory catalog and a
//! temporary source tree.

use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use carpack::daggen::DirectoryData;
use carpack::db::{self, entities::*};
use carpack::pack::{dag, pack_handler};
use carpack::source::DefaultResolver;
use carpack::unixfs::encode_varint;

const MIB: i64 = 1 << 20;

struct Fixture {
    db: DatabaseConnection,
    source_dir: TempDir,
    out_dir: TempDir,
    source_id: i64,
    root_dir_id: i64,
}

async fn fixture(piece_size: i64, chunk_size: i64, delete_after_export: bool) -> Fixture {
    let db = db::init_database("sqlite::memory:").await.unwrap();
    let source_dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();

    let dataset = dataset::ActiveModel {
        name: Set("testset".to_string()),
        piece_size: Set(piece_size),
        chunk_size: Set(chunk_size),
        output_dirs: Set(
            serde_json::to_string(&[out_dir.path().display().to_string()]).unwrap(),
        ),
        delete_after_export: Set(delete_after_export),
        ..Default::default()
    }
    .insert(&db)
    .await
    .unwrap();

    let source = source::ActiveModel {
        dataset_id: Set(dataset.id),
        kind: Set("local".to_string()),
        path: Set(source_dir.path().display().to_string()),
        ..Default::default()
    }
    .insert(&db)
    .await
    .unwrap();

    let root = directory::ActiveModel {
        source_id: Set(source.id),
        parent_id: Set(None),
        name: Set("testset".to_string()),
        data: Set(Vec::new()),
        exported: Set(false),
        ..Default::default()
    }
    .insert(&db)
    .await
    .unwrap();

    Fixture {
        db,
        source_dir,
        out_dir,
        source_id: source.id,
        root_dir_id: root.id,
    }
}

impl Fixture {
    async fn add_directory(&self, parent_id: i64, name: &str) -> i64 {
        directory::ActiveModel {
            source_id: Set(self.source_id),
            parent_id: Set(Some(parent_id)),
            name: Set(name.to_string()),
            data: Set(Vec::new()),
            exported: Set(false),
            ..Default::default()
        }
        .insert(&self.db)
        .await
        .unwrap()
        .id
    }

    /// Write `content` under the source tree and register the file.
    async fn add_file(&self, directory_id: i64, rel_path: &str, content: &[u8]) -> i64 {
        let full = self.source_dir.path().join(rel_path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full, content).unwrap();

        file::ActiveModel {
            source_id: Set(self.source_id),
            directory_id: Set(directory_id),
            path: Set(rel_path.to_string()),
            size: Set(content.len() as i64),
            ..Default::default()
        }
        .insert(&self.db)
        .await
        .unwrap()
        .id
    }

    async fn add_job(&self) -> i64 {
        pack_job::ActiveModel {
            source_id: Set(self.source_id),
            state: Set(pack_job::state::CREATED.to_string()),
            ..Default::default()
        }
        .insert(&self.db)
        .await
        .unwrap()
        .id
    }

    async fn add_range(&self, file_id: i64, job_id: i64, offset: i64, length: i64) -> i64 {
        file_range::ActiveModel {
            file_id: Set(file_id),
            pack_job_id: Set(Some(job_id)),
            offset: Set(offset),
            length: Set(length),
            ..Default::default()
        }
        .insert(&self.db)
        .await
        .unwrap()
        .id
    }

    async fn run_job(&self, job_id: i64) -> carpack::Result<Vec<car::Model>> {
        let token = CancellationToken::new();
        pack_handler(&token, &self.db, &DefaultResolver, job_id).await
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Re-emit a CAR from its parsed frames and compare byte-for-byte.
fn assert_car_byte_identity(car: &car::Model, blocks: &[car_block::Model]) {
    let original = std::fs::read(&car.file_path).unwrap();
    assert_eq!(original.len() as i64, car.file_size);

    let (header, frames) = carpack::pack::car::parse_car(&original).unwrap();
    assert_eq!(header, car.header);
    assert_eq!(frames.len(), blocks.len());

    let mut rebuilt = header;
    for (frame, row) in frames.iter().zip(blocks) {
        let (cid, data, offset) = frame;
        assert_eq!(*offset as i64, row.car_offset);
        assert_eq!(cid.to_string(), row.cid);
        assert_eq!(data.len() as i64, row.raw_block_size);

        let cid_bytes = cid.to_bytes();
        let mut varint = Vec::new();
        encode_varint((cid_bytes.len() + data.len()) as u64, &mut varint);
        assert_eq!(varint.len() as i32, row.varint_size);
        rebuilt.extend_from_slice(&varint);
        rebuilt.extend_from_slice(&cid_bytes);
        rebuilt.extend_from_slice(data);
    }
    assert_eq!(rebuilt, original);
}

async fn car_blocks_of(db: &DatabaseConnection, car_id: i64) -> Vec<car_block::Model> {
    CarBlock::find()
        .filter(car_block::Column::CarId.eq(car_id))
        .order_by_asc(car_block::Column::CarOffset)
        .all(db)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_single_whole_small_file() {
    let fx = fixture(2 * MIB, MIB, false).await;
    let file_id = fx.add_file(fx.root_dir_id, "a.bin", &pattern(1024, 1)).await;
    let job_id = fx.add_job().await;
    let range_id = fx.add_range(file_id, job_id, 0, 1024).await;

    let cars = fx.run_job(job_id).await.unwrap();
    assert_eq!(cars.len(), 1);
    let car = &cars[0];

    // Piece invariants
    assert!((car.piece_size as u64).is_power_of_two());
    assert!(car.piece_size >= car.file_size);

    // The whole-file range CID is the file CID and the CAR root
    let range = FileRange::find_by_id(range_id).one(&fx.db).await.unwrap().unwrap();
    let file = File::find_by_id(file_id).one(&fx.db).await.unwrap().unwrap();
    let range_cid = range.cid.unwrap();
    assert_eq!(file.cid.as_deref(), Some(range_cid.as_str()));
    assert_eq!(car.root_cid, range_cid);

    // Directory recomputed to link a.bin
    let root = Directory::find_by_id(fx.root_dir_id).one(&fx.db).await.unwrap().unwrap();
    assert!(root.cid.is_some());
    assert!(!root.exported);
    let root_data = DirectoryData::from_model(root.clone()).unwrap();
    let entry = &root_data.entries()["a.bin"];
    assert_eq!(entry.cid.to_string(), range_cid);
    assert_eq!(entry.size, 1024);
    // Stored CID matches the recomputed node CID
    assert_eq!(root_data.node().0.to_string(), root.cid.unwrap());

    // Terminal job state
    let job = PackJob::find_by_id(job_id).one(&fx.db).await.unwrap().unwrap();
    assert_eq!(job.state, pack_job::state::COMPLETE);
    assert_eq!(job.error_message, None);

    // CAR byte identity from the recorded block index
    let blocks = car_blocks_of(&fx.db, car.id).await;
    assert_car_byte_identity(car, &blocks);
}

#[tokio::test]
async fn test_multipart_file_across_jobs() {
    let fx = fixture(2 * MIB, MIB, false).await;
    let content = pattern(3 * MIB as usize, 2);
    let file_id = fx.add_file(fx.root_dir_id, "big.bin", &content).await;

    let job1 = fx.add_job().await;
    fx.add_range(file_id, job1, 0, MIB).await;
    fx.add_range(file_id, job1, MIB, MIB).await;
    let job2 = fx.add_job().await;
    fx.add_range(file_id, job2, 2 * MIB, MIB).await;

    fx.run_job(job1).await.unwrap();

    // Two of three ranges packed: no file CID yet
    let file = File::find_by_id(file_id).one(&fx.db).await.unwrap().unwrap();
    assert_eq!(file.cid, None);

    fx.run_job(job2).await.unwrap();

    let file = File::find_by_id(file_id).one(&fx.db).await.unwrap().unwrap();
    let file_cid = file.cid.expect("file CID set once all ranges are packed");

    // The file CID is the UnixFS node over the range CIDs in offset order
    let parts = FileRange::find()
        .filter(file_range::Column::FileId.eq(file_id))
        .order_by_asc(file_range::Column::Offset)
        .all(&fx.db)
        .await
        .unwrap();
    assert_eq!(parts.len(), 3);
    let links: Vec<_> = parts
        .iter()
        .map(|p| (p.cid.as_deref().unwrap().try_into().unwrap(), p.length as u64))
        .collect();
    let (_, expected_root) = dag::file_from_links(links);
    assert_eq!(file_cid, expected_root.cid.to_string());

    // Directory links the file-level CID, not a partial range CID
    let root = Directory::find_by_id(fx.root_dir_id).one(&fx.db).await.unwrap().unwrap();
    let root_data = DirectoryData::from_model(root).unwrap();
    assert_eq!(root_data.entries()["big.bin"].cid.to_string(), file_cid);
}

#[tokio::test]
async fn test_car_rollover() {
    let fx = fixture(4 * MIB, MIB, false).await;
    let job_id = fx.add_job().await;
    let mut total_input = 0i64;
    for i in 0..10 {
        let content = pattern(MIB as usize, i as u8);
        let file_id = fx.add_file(fx.root_dir_id, &format!("f{i}.bin"), &content).await;
        fx.add_range(file_id, job_id, 0, MIB).await;
        total_input += MIB;
    }

    let cars = fx.run_job(job_id).await.unwrap();
    assert!(cars.len() >= 3, "expected at least 3 CARs, got {}", cars.len());

    let mut total_car_size = 0i64;
    let mut total_blocks = 0usize;
    for car in &cars {
        assert!(car.file_size <= 4 * MIB);
        assert!((car.piece_size as u64).is_power_of_two());
        assert!(car.piece_size >= car.file_size);

        // Every block frame is contained in exactly one CAR
        let blocks = car_blocks_of(&fx.db, car.id).await;
        assert_car_byte_identity(car, &blocks);
        total_blocks += blocks.len();
        total_car_size += car.file_size;
    }
    assert_eq!(total_blocks, 10);
    // Framing overhead stays within 1%
    assert!(total_car_size <= total_input + total_input / 100);
}

#[tokio::test]
async fn test_directory_tree_update() {
    let fx = fixture(2 * MIB, MIB, false).await;
    let sub_id = fx.add_directory(fx.root_dir_id, "sub").await;
    let a_id = fx.add_file(sub_id, "sub/a.bin", &pattern(512, 3)).await;
    let b_id = fx.add_file(fx.root_dir_id, "b.bin", &pattern(256, 4)).await;

    let job_id = fx.add_job().await;
    fx.add_range(a_id, job_id, 0, 512).await;
    fx.add_range(b_id, job_id, 0, 256).await;

    fx.run_job(job_id).await.unwrap();

    let sub = Directory::find_by_id(sub_id).one(&fx.db).await.unwrap().unwrap();
    let sub_data = DirectoryData::from_model(sub.clone()).unwrap();
    let a = File::find_by_id(a_id).one(&fx.db).await.unwrap().unwrap();
    assert_eq!(sub_data.entries()["a.bin"].cid.to_string(), a.cid.unwrap());
    assert_eq!(sub_data.entries()["a.bin"].size, 512);

    // Root has exactly two children: sub and b.bin, with consistent CIDs
    let root = Directory::find_by_id(fx.root_dir_id).one(&fx.db).await.unwrap().unwrap();
    let root_data = DirectoryData::from_model(root.clone()).unwrap();
    assert_eq!(root_data.entries().len(), 2);

    let b = File::find_by_id(b_id).one(&fx.db).await.unwrap().unwrap();
    assert_eq!(root_data.entries()["b.bin"].cid.to_string(), b.cid.unwrap());
    assert_eq!(
        root_data.entries()["sub"].cid.to_string(),
        sub.cid.unwrap()
    );
    assert_eq!(root_data.node().0.to_string(), root.cid.unwrap());
}

#[tokio::test]
async fn test_determinism_across_identical_sources() {
    // Two fixtures with identical trees produce identical CIDs
    let mut cids = Vec::new();
    for _ in 0..2 {
        let fx = fixture(2 * MIB, MIB, false).await;
        let file_id = fx.add_file(fx.root_dir_id, "same.bin", &pattern(100_000, 9)).await;
        let job_id = fx.add_job().await;
        let range_id = fx.add_range(file_id, job_id, 0, 100_000).await;
        fx.run_job(job_id).await.unwrap();

        let range = FileRange::find_by_id(range_id).one(&fx.db).await.unwrap().unwrap();
        let root = Directory::find_by_id(fx.root_dir_id).one(&fx.db).await.unwrap().unwrap();
        cids.push((range.cid.unwrap(), root.cid.unwrap()));
    }
    assert_eq!(cids[0], cids[1]);
}

#[tokio::test]
async fn test_delete_after_export_waits_for_all_ranges() {
    let fx = fixture(2 * MIB, MIB, true).await;
    let whole_id = fx.add_file(fx.root_dir_id, "whole.bin", &pattern(128, 5)).await;
    let partial_content = pattern(2048, 6);
    let partial_id = fx.add_file(fx.root_dir_id, "partial.bin", &partial_content).await;

    // Both ranges of partial.bin exist up front; only the first is
    // assigned to job1, the second stays unpacked until job2 runs
    let job1 = fx.add_job().await;
    let job2 = fx.add_job().await;
    fx.add_range(whole_id, job1, 0, 128).await;
    fx.add_range(partial_id, job1, 0, 1024).await;
    fx.add_range(partial_id, job2, 1024, 1024).await;

    fx.run_job(job1).await.unwrap();

    // Whole-file export deletes immediately; the partial file stays
    assert!(!fx.source_dir.path().join("whole.bin").exists());
    assert!(fx.source_dir.path().join("partial.bin").exists());

    // No file CID either: one packed range does not cover the file
    let partial = File::find_by_id(partial_id).one(&fx.db).await.unwrap().unwrap();
    assert_eq!(partial.cid, None);

    fx.run_job(job2).await.unwrap();

    // All ranges packed now, so the source object goes away
    assert!(!fx.source_dir.path().join("partial.bin").exists());
    let partial = File::find_by_id(partial_id).one(&fx.db).await.unwrap().unwrap();
    assert!(partial.cid.is_some());
}

#[tokio::test]
async fn test_failed_job_records_error_and_keeps_catalog_clean() {
    let fx = fixture(2 * MIB, MIB, false).await;
    let file_id = fx.add_file(fx.root_dir_id, "gone.bin", &pattern(64, 7)).await;
    std::fs::remove_file(fx.source_dir.path().join("gone.bin")).unwrap();

    let job_id = fx.add_job().await;
    let range_id = fx.add_range(file_id, job_id, 0, 64).await;

    let result = fx.run_job(job_id).await;
    assert!(result.is_err());

    let job = PackJob::find_by_id(job_id).one(&fx.db).await.unwrap().unwrap();
    assert_eq!(job.state, pack_job::state::ERROR);
    assert!(job.error_message.is_some());

    // No catalog mutation and no stray CAR files
    let range = FileRange::find_by_id(range_id).one(&fx.db).await.unwrap().unwrap();
    assert_eq!(range.cid, None);
    assert_eq!(Car::find().all(&fx.db).await.unwrap().len(), 0);
    assert_eq!(std::fs::read_dir(fx.out_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_range_coverage_recovers_original_bytes() {
    let fx = fixture(4 * MIB, MIB / 4, false).await;
    let content = pattern(MIB as usize + 12345, 8);
    let file_id = fx.add_file(fx.root_dir_id, "data.bin", &content).await;
    let job_id = fx.add_job().await;

    let half = content.len() as i64 / 2;
    fx.add_range(file_id, job_id, 0, half).await;
    fx.add_range(file_id, job_id, half, content.len() as i64 - half).await;

    let cars = fx.run_job(job_id).await.unwrap();

    // Concatenating leaf payloads in emit order yields the file bytes
    let mut recovered = Vec::new();
    for car in &cars {
        let bytes = std::fs::read(&car.file_path).unwrap();
        let (_, frames) = carpack::pack::car::parse_car(&bytes).unwrap();
        for (cid, data, _) in frames {
            if cid.codec() == carpack::unixfs::RAW_CODEC {
                recovered.extend_from_slice(&data);
            }
        }
    }
    assert_eq!(recovered, content);
}
