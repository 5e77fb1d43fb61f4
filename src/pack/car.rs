//! CARv1 writer with rollover at the target piece size.
//!
//! Layout: a varint-prefixed DAG-CBOR header `{roots: [cid], version: 1}`
//! followed by block frames `varint(len(cid) + len(data)) || cid || data`.
//!
//! Roots are only known once a range's DAG completes, so the writer
//! reserves a fixed-size header slot up front and rewrites it on
//! finalization. Every root is a CIDv1 sha2-256 identifier, so the
//! header length never changes. The output is canonical CARv1.

use cid::Cid;
use integer_encoding::VarInt;
use multihash_codetable::{Code, MultihashDigest};
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::commp;
use super::dag::Block;
use crate::error::{PackError, Result};
use crate::unixfs::DAG_PB_CODEC;

#[derive(Serialize)]
struct CarHeader {
    roots: Vec<Cid>,
    version: u64,
}

/// Varint-prefixed CARv1 header bytes for the given root.
pub fn header_bytes(root: &Cid) -> Result<Vec<u8>> {
    let body = serde_ipld_dagcbor::to_vec(&CarHeader {
        roots: vec![*root],
        version: 1,
    })
    .map_err(|e| PackError::CommP(format!("header encoding: {e}")))?;
    let mut out = (body.len() as u64).encode_var_vec();
    out.extend_from_slice(&body);
    Ok(out)
}

fn placeholder_root() -> Cid {
    Cid::new_v1(DAG_PB_CODEC, Code::Sha2_256.digest(&[]))
}

/// Index entry for one block frame.
#[derive(Clone, Debug)]
pub struct CarBlockInfo {
    pub cid: Cid,
    pub car_offset: u64,
    pub varint_size: u32,
    pub raw_block_size: u64,
}

/// One finalized CAR file.
#[derive(Clone, Debug)]
pub struct CarResult {
    pub piece_cid: Cid,
    pub piece_size: u64,
    pub root_cid: Cid,
    pub car_file_size: u64,
    pub car_file_path: String,
    pub header: Vec<u8>,
    pub car_blocks: Vec<CarBlockInfo>,
}

struct OpenCar {
    file: fs::File,
    path: PathBuf,
    /// Current file size; the offset of the next frame.
    offset: u64,
    blocks: Vec<CarBlockInfo>,
    /// Root of the last range completed inside this CAR.
    root: Option<Cid>,
    /// Fallback root for a CAR cut mid-range.
    first_block: Option<Cid>,
}

pub struct CarWriter {
    out_dir: PathBuf,
    dataset_name: String,
    pack_job_id: i64,
    /// Unpadded size cap per CAR.
    piece_size: u64,
    header_len: u64,
    seq: u32,
    current: Option<OpenCar>,
    results: Vec<CarResult>,
}

impl CarWriter {
    pub fn new(
        out_dir: impl Into<PathBuf>,
        dataset_name: impl Into<String>,
        pack_job_id: i64,
        piece_size: u64,
    ) -> Result<Self> {
        let header_len = header_bytes(&placeholder_root())?.len() as u64;
        Ok(Self {
            out_dir: out_dir.into(),
            dataset_name: dataset_name.into(),
            pack_job_id,
            piece_size,
            header_len,
            seq: 0,
            current: None,
            results: Vec::new(),
        })
    }

    /// Append a block, rolling over to a new CAR when the frame would
    /// push the current file past the piece size. Blocks never split.
    pub async fn write_block(&mut self, block: &Block) -> Result<()> {
        let cid_bytes = block.cid.to_bytes();
        let frame_len = cid_bytes.len() + block.data.len();
        let varint = (frame_len as u64).encode_var_vec();
        let frame_total = (varint.len() + frame_len) as u64;

        if self.header_len + frame_total > self.piece_size {
            return Err(PackError::BlockTooLarge {
                size: frame_total,
                piece_size: self.piece_size,
            });
        }

        if let Some(car) = &self.current {
            if car.offset + frame_total > self.piece_size {
                self.close_current().await?;
            }
        }
        if self.current.is_none() {
            self.open_car().await?;
        }

        let car = self.current.as_mut().expect("car opened above");
        car.file.write_all(&varint).await?;
        car.file.write_all(&cid_bytes).await?;
        car.file.write_all(&block.data).await?;

        car.blocks.push(CarBlockInfo {
            cid: block.cid,
            car_offset: car.offset,
            varint_size: varint.len() as u32,
            raw_block_size: block.data.len() as u64,
        });
        car.offset += frame_total;
        car.first_block.get_or_insert(block.cid);
        Ok(())
    }

    /// Record the DAG root of a range whose blocks just went out. The
    /// root names the header of the CAR it landed in.
    pub fn set_root(&mut self, root: Cid) {
        if let Some(car) = &mut self.current {
            car.root = Some(root);
        }
    }

    /// Close the open CAR (if any) and hand back every finished result.
    pub async fn finalize(&mut self) -> Result<Vec<CarResult>> {
        self.close_current().await?;
        Ok(std::mem::take(&mut self.results))
    }

    /// Remove every CAR file written so far. Used on job failure.
    pub async fn abort(&mut self) {
        let mut paths: Vec<PathBuf> = self.results.drain(..).map(|r| r.car_file_path.into()).collect();
        if let Some(car) = self.current.take() {
            paths.push(car.path);
        }
        for path in paths {
            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove partial CAR file");
            }
        }
    }

    async fn open_car(&mut self) -> Result<()> {
        self.seq += 1;
        let suffix: u32 = rand::thread_rng().gen();
        let filename = format!(
            "{}-{}-{}-{:08x}.car",
            self.dataset_name, self.pack_job_id, self.seq, suffix
        );
        let path = self.out_dir.join(filename);
        debug!(path = %path.display(), "opening CAR file");

        let mut file = fs::File::create(&path).await?;
        file.write_all(&header_bytes(&placeholder_root())?).await?;

        self.current = Some(OpenCar {
            file,
            path,
            offset: self.header_len,
            blocks: Vec::new(),
            root: None,
            first_block: None,
        });
        Ok(())
    }

    async fn close_current(&mut self) -> Result<()> {
        let Some(mut car) = self.current.take() else {
            return Ok(());
        };

        let root = match car.root.or(car.first_block) {
            Some(root) => root,
            None => {
                // Nothing was ever written; drop the empty shell.
                drop(car.file);
                fs::remove_file(&car.path).await?;
                return Ok(());
            }
        };

        let header = header_bytes(&root)?;
        debug_assert_eq!(header.len() as u64, self.header_len);
        car.file.seek(std::io::SeekFrom::Start(0)).await?;
        car.file.write_all(&header).await?;
        car.file.sync_all().await?;
        drop(car.file);

        let (piece_cid, piece_size) = commp::commp_of_file(&car.path).await?;
        debug!(
            path = %car.path.display(),
            size = car.offset,
            piece_size,
            piece_cid = %piece_cid,
            "finalized CAR file"
        );

        self.results.push(CarResult {
            piece_cid,
            piece_size,
            root_cid: root,
            car_file_size: car.offset,
            car_file_path: car.path.display().to_string(),
            header,
            car_blocks: car.blocks,
        });
        Ok(())
    }
}

/// Parse the frames of a CARv1 file into `(cid, data, frame_offset)`
/// triples, skipping the header.
pub fn parse_car(bytes: &[u8]) -> Result<(Vec<u8>, Vec<(Cid, Vec<u8>, u64)>)> {
    let (header_len, varint_len) = u64::decode_var(bytes)
        .ok_or_else(|| PackError::CommP("truncated CAR header varint".to_string()))?;
    let header_end = varint_len + header_len as usize;
    let header = bytes[..header_end].to_vec();

    let mut blocks = Vec::new();
    let mut pos = header_end;
    while pos < bytes.len() {
        let (frame_len, varint_len) = u64::decode_var(&bytes[pos..])
            .ok_or_else(|| PackError::CommP("truncated frame varint".to_string()))?;
        let body_start = pos + varint_len;
        let body_end = body_start + frame_len as usize;
        let cid = Cid::read_bytes(&bytes[body_start..body_end])
            .map_err(|e| PackError::CommP(format!("bad CID in frame: {e}")))?;
        let data = bytes[body_start + cid.encoded_len()..body_end].to_vec();
        blocks.push((cid, data, pos as u64));
        pos = body_end;
    }
    Ok((header, blocks))
}
