//! Balanced UnixFS file DAG builder.
//!
//! Leaves are `raw` blocks; every parent is a DAG-PB node carrying a
//! UnixFS `File` payload with the children's `blocksizes` and the total
//! `filesize`. Layers reduce left to right as soon as they reach
//! [`MAX_LINKS`] siblings, so blocks reach the CAR writer in production
//! order; at end of input the remaining layers collapse bottom-up into
//! a single root.

use bytes::Bytes;
use cid::Cid;

use crate::unixfs::{self, PbLink, MAX_LINKS};

/// One IPLD block ready for the CAR writer.
#[derive(Clone, Debug)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

/// Finished DAG for one file range.
#[derive(Clone, Debug)]
pub struct DagRoot {
    pub cid: Cid,
    /// Logical payload bytes under the root.
    pub payload_size: u64,
}

/// A child entry tracked while its parent is still being filled.
#[derive(Clone, Copy, Debug)]
struct ChildLink {
    cid: Cid,
    /// Encoded subtree size, used for the link `Tsize`.
    tsize: u64,
    /// Logical payload size, used for `blocksizes`/`filesize`.
    blocksize: u64,
}

#[derive(Default)]
pub struct FileDagBuilder {
    layers: Vec<Vec<ChildLink>>,
}

impl FileDagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one leaf chunk. Returns the leaf block plus any parent
    /// blocks produced by full-layer reductions, in emit order.
    pub fn add_chunk(&mut self, data: Bytes) -> Vec<Block> {
        let cid = unixfs::cid_for_raw(&data);
        let size = data.len() as u64;
        let mut out = vec![Block { cid, data }];
        self.push_link(
            0,
            ChildLink {
                cid,
                tsize: size,
                blocksize: size,
            },
            &mut out,
        );
        out
    }

    /// Add a pre-built subtree (e.g. the DAG root of an already-packed
    /// file range) as a direct child. `length` is its logical payload
    /// size and also serves as the link `Tsize`.
    pub fn add_link(&mut self, cid: Cid, length: u64) -> Vec<Block> {
        let mut out = Vec::new();
        self.push_link(
            0,
            ChildLink {
                cid,
                tsize: length,
                blocksize: length,
            },
            &mut out,
        );
        out
    }

    fn push_link(&mut self, layer: usize, link: ChildLink, out: &mut Vec<Block>) {
        if self.layers.len() == layer {
            self.layers.push(Vec::new());
        }
        self.layers[layer].push(link);
        if self.layers[layer].len() == MAX_LINKS {
            let links = std::mem::take(&mut self.layers[layer]);
            let (block, parent) = reduce(&links);
            out.push(block);
            self.push_link(layer + 1, parent, out);
        }
    }

    /// Collapse the remaining layers bottom-up. Returns the parent
    /// blocks still to be written and the root of the whole range.
    pub fn finalize(mut self) -> (Vec<Block>, DagRoot) {
        let mut out = Vec::new();

        // Zero-length range: canonical empty UnixFS file node.
        if self.layers.is_empty() {
            let data = unixfs::encode_node(&[], &unixfs::encode_file_data(&[], 0));
            let cid = unixfs::cid_for_node(&data);
            out.push(Block {
                cid,
                data: Bytes::from(data),
            });
            return (
                out,
                DagRoot {
                    cid,
                    payload_size: 0,
                },
            );
        }

        let mut layer = 0;
        loop {
            let is_top = layer + 1 == self.layers.len();
            let links = std::mem::take(&mut self.layers[layer]);

            if links.is_empty() {
                // Reduced exactly at the boundary; nothing left here.
                layer += 1;
                continue;
            }
            if is_top && links.len() == 1 {
                let root = links[0];
                return (
                    out,
                    DagRoot {
                        cid: root.cid,
                        payload_size: root.blocksize,
                    },
                );
            }

            let (block, parent) = reduce(&links);
            out.push(block);
            if self.layers.len() == layer + 1 {
                self.layers.push(Vec::new());
            }
            self.layers[layer + 1].push(parent);
            layer += 1;
        }
    }
}

/// Reduce up to [`MAX_LINKS`] siblings into one UnixFS file parent.
fn reduce(links: &[ChildLink]) -> (Block, ChildLink) {
    let blocksizes: Vec<u64> = links.iter().map(|l| l.blocksize).collect();
    let filesize: u64 = blocksizes.iter().sum();
    let pb_links: Vec<PbLink> = links
        .iter()
        .map(|l| PbLink {
            cid: l.cid,
            name: String::new(),
            tsize: l.tsize,
        })
        .collect();

    let data = unixfs::encode_node(&pb_links, &unixfs::encode_file_data(&blocksizes, filesize));
    let cid = unixfs::cid_for_node(&data);
    let tsize = data.len() as u64 + links.iter().map(|l| l.tsize).sum::<u64>();

    (
        Block {
            cid,
            data: Bytes::from(data),
        },
        ChildLink {
            cid,
            tsize,
            blocksize: filesize,
        },
    )
}

/// Build the file-level node over already-packed range roots, in offset
/// order. Returns the blocks of any new parent nodes and the file root.
pub fn file_from_links(links: impl IntoIterator<Item = (Cid, u64)>) -> (Vec<Block>, DagRoot) {
    let mut builder = FileDagBuilder::new();
    let mut out = Vec::new();
    for (cid, length) in links {
        out.extend(builder.add_link(cid, length));
    }
    let (blocks, root) = builder.finalize();
    out.extend(blocks);
    (out, root)
}
