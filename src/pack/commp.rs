//! Filecoin piece commitment (CommP).
//!
//! The commitment is a binary Merkle root over the Fr32-padded payload:
//! every 127-byte quantum expands to 128 bytes of four 254-bit field
//! elements (two zero high bits each), the padded stream is cut into
//! 32-byte leaves, and nodes combine with SHA2-256 truncated to 254
//! bits. The tree is extended with zero leaves up to the padded piece
//! size, the smallest power of two that fits the expanded payload.
//!
//! The hasher is streaming: it keeps one quantum and a stack of pending
//! subtree roots, so committing a CAR never needs the file in memory.

use cid::multihash::Multihash;
use cid::Cid;
use sha2::{Digest, Sha256};

use crate::error::{PackError, Result};

/// `fil-commitment-unsealed` multicodec.
pub const FIL_COMMITMENT_UNSEALED: u64 = 0xf101;
/// `sha2-256-trunc254-padded` multihash.
pub const SHA2_256_TRUNC254_PADDED: u64 = 0x1012;

const QUANTUM: usize = 127;
const NODE_SIZE: usize = 32;
/// Smallest padded piece (four leaves).
const MIN_PIECE_SIZE: u64 = 128;

/// Padded piece size for an `unpadded`-byte payload: the smallest power
/// of two that holds the Fr32 expansion, at least [`MIN_PIECE_SIZE`].
pub fn padded_piece_size(unpadded: u64) -> u64 {
    let expanded = unpadded + unpadded.div_ceil(QUANTUM as u64);
    expanded.next_power_of_two().max(MIN_PIECE_SIZE)
}

/// Expand one 127-byte quantum into 128 Fr32-padded bytes: four 254-bit
/// little-endian field elements, each with its two high bits zeroed.
fn fr32_pad(input: &[u8; QUANTUM], out: &mut [u8; 128]) {
    out[..31].copy_from_slice(&input[..31]);

    let mut t = input[31] >> 6;
    out[31] = input[31] & 0x3f;
    let mut v = 0u8;

    for i in 32..64 {
        v = input[i];
        out[i] = (v << 2) | t;
        t = v >> 6;
    }

    t = v >> 4;
    out[63] &= 0x3f;

    for i in 64..96 {
        v = input[i];
        out[i] = (v << 4) | t;
        t = v >> 4;
    }

    t = v >> 2;
    out[95] &= 0x3f;

    for i in 96..127 {
        v = input[i];
        out[i] = (v << 6) | t;
        t = v >> 2;
    }

    out[127] = t & 0x3f;
}

/// SHA2-256 of `left || right` with the two high bits of the final byte
/// zeroed, keeping the node inside the field.
fn trunc_hash(left: &[u8; NODE_SIZE], right: &[u8; NODE_SIZE]) -> [u8; NODE_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut node: [u8; NODE_SIZE] = hasher.finalize().into();
    node[31] &= 0x3f;
    node
}

/// Streaming CommP hasher.
pub struct CommpHasher {
    quantum: [u8; QUANTUM],
    quantum_len: usize,
    /// Pending subtree roots, levels strictly decreasing towards the top.
    stack: Vec<(u32, [u8; NODE_SIZE])>,
    /// Zero-subtree roots, index = level.
    zero_ladder: Vec<[u8; NODE_SIZE]>,
    bytes_fed: u64,
}

impl Default for CommpHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommpHasher {
    pub fn new() -> Self {
        Self {
            quantum: [0u8; QUANTUM],
            quantum_len: 0,
            stack: Vec::new(),
            zero_ladder: vec![[0u8; NODE_SIZE]],
            bytes_fed: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.bytes_fed += data.len() as u64;
        while !data.is_empty() {
            let take = (QUANTUM - self.quantum_len).min(data.len());
            self.quantum[self.quantum_len..self.quantum_len + take]
                .copy_from_slice(&data[..take]);
            self.quantum_len += take;
            data = &data[take..];
            if self.quantum_len == QUANTUM {
                self.flush_quantum();
            }
        }
    }

    fn flush_quantum(&mut self) {
        let mut padded = [0u8; 128];
        fr32_pad(&self.quantum, &mut padded);
        for leaf in padded.chunks_exact(NODE_SIZE) {
            self.push_node(0, leaf.try_into().expect("exact chunk"));
        }
        self.quantum_len = 0;
    }

    fn push_node(&mut self, mut level: u32, mut hash: [u8; NODE_SIZE]) {
        while let Some(&(top_level, top_hash)) = self.stack.last() {
            if top_level != level {
                break;
            }
            self.stack.pop();
            hash = trunc_hash(&top_hash, &hash);
            level += 1;
        }
        self.stack.push((level, hash));
    }

    fn zero_hash(&mut self, level: u32) -> [u8; NODE_SIZE] {
        while self.zero_ladder.len() <= level as usize {
            let top = *self.zero_ladder.last().expect("ladder is never empty");
            self.zero_ladder.push(trunc_hash(&top, &top));
        }
        self.zero_ladder[level as usize]
    }

    /// Finish the tree: Fr32-flush the partial quantum, extend with
    /// zero subtrees to the padded piece size, and return the piece CID
    /// with that size.
    pub fn finalize(mut self) -> Result<(Cid, u64)> {
        if self.bytes_fed == 0 {
            return Err(PackError::CommP("empty payload".to_string()));
        }
        if self.quantum_len > 0 {
            self.quantum[self.quantum_len..].fill(0);
            self.flush_quantum();
        }

        let piece_size = padded_piece_size(self.bytes_fed);
        let target_level = (piece_size / NODE_SIZE as u64).trailing_zeros();

        let (mut level, mut hash) = self.stack.pop().expect("at least one quantum flushed");
        while level < target_level || !self.stack.is_empty() {
            match self.stack.last().copied() {
                Some((top_level, top_hash)) if top_level == level => {
                    self.stack.pop();
                    hash = trunc_hash(&top_hash, &hash);
                }
                _ => {
                    // No left sibling at this level: data ends here, the
                    // right sibling is an all-zero subtree.
                    let zero = self.zero_hash(level);
                    hash = trunc_hash(&hash, &zero);
                }
            }
            level += 1;
        }

        let mh = Multihash::wrap(SHA2_256_TRUNC254_PADDED, &hash)
            .map_err(|e| PackError::CommP(e.to_string()))?;
        Ok((Cid::new_v1(FIL_COMMITMENT_UNSEALED, mh), piece_size))
    }
}

/// CommP of a file on disk, streamed in 1 MiB reads.
pub async fn commp_of_file(path: &std::path::Path) -> Result<(Cid, u64)> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = CommpHasher::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_piece_size() {
        let cases = [
            (1, 128),
            (126, 128),
            (127, 128),
            (128, 256),
            (254, 256),
            (255, 512),
            (1016, 1024),
            (1017, 2048),
            (1 << 20, 2 << 20),
        ];
        for (unpadded, padded) in cases {
            assert_eq!(padded_piece_size(unpadded), padded, "unpadded={unpadded}");
        }
    }

    #[test]
    fn test_fr32_high_bits_are_zero() {
        let mut input = [0u8; QUANTUM];
        for (i, b) in input.iter_mut().enumerate() {
            *b = 0xff ^ (i as u8);
        }
        let mut out = [0u8; 128];
        fr32_pad(&input, &mut out);

        for boundary in [31, 63, 95, 127] {
            assert_eq!(out[boundary] & 0xc0, 0, "field element at byte {boundary}");
        }
    }

    #[test]
    fn test_fr32_of_zeros_is_zero() {
        let input = [0u8; QUANTUM];
        let mut out = [0xffu8; 128];
        fr32_pad(&input, &mut out);
        assert_eq!(out, [0u8; 128]);
    }

    #[test]
    fn test_fr32_preserves_low_bytes() {
        let mut input = [0u8; QUANTUM];
        input[0] = 0xab;
        input[30] = 0xcd;
        let mut out = [0u8; 128];
        fr32_pad(&input, &mut out);
        assert_eq!(out[0], 0xab);
        assert_eq!(out[30], 0xcd);
    }

    #[test]
    fn test_zero_payload_root_is_zero_subtree() {
        // fr32(zeros) == zeros and hashing propagates the zero ladder,
        // so a zero payload's root equals the ladder root directly.
        let mut hasher = CommpHasher::new();
        hasher.update(&[0u8; QUANTUM]);
        let (cid, piece_size) = hasher.finalize().unwrap();
        assert_eq!(piece_size, 128);

        let leaf = [0u8; NODE_SIZE];
        let l1 = trunc_hash(&leaf, &leaf);
        let root = trunc_hash(&l1, &l1);
        assert_eq!(&cid.hash().digest()[..], &root[..]);
    }

    #[test]
    fn test_commitment_shape() {
        let mut hasher = CommpHasher::new();
        hasher.update(&vec![0x5au8; 1000]);
        let (cid, piece_size) = hasher.finalize().unwrap();

        assert_eq!(piece_size, 1024);
        assert!(piece_size.is_power_of_two());
        assert_eq!(cid.codec(), FIL_COMMITMENT_UNSEALED);
        assert_eq!(cid.hash().code(), SHA2_256_TRUNC254_PADDED);
        assert_eq!(cid.hash().size(), 32);
        // Truncation keeps the root inside the field
        assert_eq!(cid.hash().digest()[31] & 0xc0, 0);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mut one_shot = CommpHasher::new();
        one_shot.update(&data);

        let mut streamed = CommpHasher::new();
        for piece in data.chunks(33) {
            streamed.update(piece);
        }

        assert_eq!(one_shot.finalize().unwrap(), streamed.finalize().unwrap());
    }

    #[test]
    fn test_different_payloads_different_commitments() {
        let mut a = CommpHasher::new();
        a.update(&[1u8; 500]);
        let mut b = CommpHasher::new();
        b.update(&[2u8; 500]);
        assert_ne!(a.finalize().unwrap().0, b.finalize().unwrap().0);
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        assert!(CommpHasher::new().finalize().is_err());
    }
}
