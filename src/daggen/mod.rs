//! Directory DAG generation.
//!
//! Directories reference children by name while children only point
//! back by id, so the reconciler works arena-style: `dir_cache` maps
//! directory ids to their in-memory [`DirectoryData`], `children_cache`
//! maps a parent id to the cached child ids underneath it, and CIDs are
//! recomputed strictly bottom-up. Parent pointers are never followed
//! during recomputation.

use std::collections::{BTreeMap, HashMap};

use cid::Cid;
use serde::{Deserialize, Serialize};

use crate::db::entities::directory;
use crate::error::{PackError, Result};
use crate::pack::dag;
use crate::unixfs::{self, PbLink};

/// One child link of a directory node.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirEntry {
    pub cid: Cid,
    pub size: u64,
}

/// In-memory state of one directory: the backing catalog row plus its
/// child links, kept sorted by name so the UnixFS node is canonical.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryData {
    pub directory: directory::Model,
    entries: BTreeMap<String, DirEntry>,
}

impl DirectoryData {
    /// Load from a catalog row, unmarshalling its serialized state.
    pub fn from_model(directory: directory::Model) -> Result<Self> {
        let entries = unmarshal(&directory.data)?;
        Ok(Self { directory, entries })
    }

    /// Serialized child links for the `directories.data` column.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        serde_ipld_dagcbor::to_vec(&self.entries)
            .map_err(|e| PackError::DirectoryData(e.to_string()))
    }

    pub fn entries(&self) -> &BTreeMap<String, DirEntry> {
        &self.entries
    }

    /// Link a whole-file range: the range CID is the file CID.
    pub fn add_file(&mut self, name: &str, cid: Cid, length: u64) {
        self.entries.insert(
            name.to_string(),
            DirEntry { cid, size: length },
        );
    }

    /// Link a multi-part file from its range `(cid, length)` pairs in
    /// offset order. Returns the file-level CID.
    pub fn add_file_from_links(
        &mut self,
        name: &str,
        links: impl IntoIterator<Item = (Cid, u64)>,
    ) -> Cid {
        let (_, root) = dag::file_from_links(links);
        self.entries.insert(
            name.to_string(),
            DirEntry {
                cid: root.cid,
                size: root.payload_size,
            },
        );
        root.cid
    }

    /// Upsert a child link, used for child directories during resolve.
    pub fn set_link(&mut self, name: &str, cid: Cid, size: u64) {
        self.entries.insert(name.to_string(), DirEntry { cid, size });
    }

    /// Canonical UnixFS directory node over the current entries.
    pub fn node(&self) -> (Cid, Vec<u8>) {
        let links: Vec<PbLink> = self
            .entries
            .iter()
            .map(|(name, entry)| PbLink {
                cid: entry.cid,
                name: name.clone(),
                tsize: entry.size,
            })
            .collect();
        let bytes = unixfs::encode_node(&links, &unixfs::encode_directory_data());
        (unixfs::cid_for_node(&bytes), bytes)
    }

    /// Node CID plus the cumulative size a parent link should carry.
    pub fn node_and_size(&self) -> (Cid, u64) {
        let (cid, bytes) = self.node();
        let size = bytes.len() as u64 + self.entries.values().map(|e| e.size).sum::<u64>();
        (cid, size)
    }
}

fn unmarshal(data: &[u8]) -> Result<BTreeMap<String, DirEntry>> {
    if data.is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_ipld_dagcbor::from_slice(data).map_err(|e| PackError::DirectoryData(e.to_string()))
}

/// Recompute directory CIDs bottom-up from `dir_id`. Only directories
/// present in `dir_cache` are visited; an untouched subtree keeps the
/// link its parent already stores. Returns the directory's name, CID,
/// and cumulative size for the caller's own link.
pub fn resolve_directory_tree(
    dir_id: i64,
    dir_cache: &mut HashMap<i64, DirectoryData>,
    children_cache: &HashMap<i64, Vec<i64>>,
) -> Result<(String, Cid, u64)> {
    let children = children_cache.get(&dir_id).cloned().unwrap_or_default();
    for child_id in children {
        let (child_name, child_cid, child_size) =
            resolve_directory_tree(child_id, dir_cache, children_cache)?;
        let dir = dir_cache
            .get_mut(&dir_id)
            .ok_or(PackError::DirectoryMissing(dir_id))?;
        dir.set_link(&child_name, child_cid, child_size);
    }

    let dir = dir_cache
        .get(&dir_id)
        .ok_or(PackError::DirectoryMissing(dir_id))?;
    let (cid, size) = dir.node_and_size();
    Ok((dir.directory.name.clone(), cid, size))
}
