//! Content addressing for chunked files.
//!
//! A file is split into fixed-size chunks (the last may be shorter; a
//! zero-byte file has one empty chunk) and hashed into a binary SHA-256
//! tree: leaves are chunk hashes, internal nodes hash `left ‖ right`, and
//! an odd node at any level is paired with itself. The root hash is the
//! file's content id. The tree keeps every level so inclusion proofs cost
//! O(log n) lookups.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

/// A node hash in the tree.
pub type NodeHash = [u8; 32];

/// Split `data` into `chunk_size` pieces. Zero-byte input yields a single
/// empty chunk so every file has at least one leaf.
pub fn chunk_bytes(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return vec![Vec::new()];
    }
    data.chunks(chunk_size).map(<[u8]>::to_vec).collect()
}

/// Number of chunks a file of `size` bytes occupies.
pub fn expected_chunk_count(size: u64, chunk_size: usize) -> u64 {
    if size == 0 {
        1
    } else {
        size.div_ceil(chunk_size as u64)
    }
}

fn leaf_hash(chunk: &[u8]) -> NodeHash {
    Sha256::digest(chunk).into()
}

fn parent_hash(left: &NodeHash, right: &NodeHash) -> NodeHash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Sibling hashes from a leaf up to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProof {
    pub index: u64,
    pub siblings: Vec<NodeHash>,
}

/// Binary SHA-256 hash tree over ordered chunks.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// Levels bottom-up: `levels[0]` are the leaves, the last level is the
    /// root alone.
    levels: Vec<Vec<NodeHash>>,
}

impl MerkleTree {
    /// Build a tree over ordered chunks. At least one chunk is required;
    /// use [`chunk_bytes`] which guarantees that.
    pub fn from_chunks<C: AsRef<[u8]>>(chunks: &[C]) -> Self {
        assert!(!chunks.is_empty(), "a file has at least one (empty) chunk");
        let mut levels = vec![chunks.iter().map(|c| leaf_hash(c.as_ref())).collect::<Vec<_>>()];
        while levels.last().unwrap().len() > 1 {
            let below = levels.last().unwrap();
            let mut level = Vec::with_capacity(below.len().div_ceil(2));
            for pair in below.chunks(2) {
                let right = pair.get(1).unwrap_or(&pair[0]);
                level.push(parent_hash(&pair[0], right));
            }
            levels.push(level);
        }
        Self { levels }
    }

    /// Convenience: chunk `data` and build the tree in one step.
    pub fn from_bytes(data: &[u8], chunk_size: usize) -> Self {
        Self::from_chunks(&chunk_bytes(data, chunk_size))
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Root hash; the content id of the file.
    pub fn root(&self) -> NodeHash {
        self.levels.last().unwrap()[0]
    }

    /// Inclusion proof for the chunk at `index`.
    pub fn proof(&self, index: usize) -> Option<ChunkProof> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut siblings = Vec::with_capacity(self.levels.len());
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = position ^ 1;
            // An odd tail node is its own sibling.
            siblings.push(*level.get(sibling).unwrap_or(&level[position]));
            position /= 2;
        }
        Some(ChunkProof {
            index: index as u64,
            siblings,
        })
    }
}

/// Recompute the root from a chunk and its proof and compare.
pub fn verify_proof(chunk: &[u8], proof: &ChunkProof, root: &NodeHash) -> bool {
    let mut hash = leaf_hash(chunk);
    let mut position = proof.index;
    for sibling in &proof.siblings {
        hash = if position % 2 == 0 {
            parent_hash(&hash, sibling)
        } else {
            parent_hash(sibling, &hash)
        };
        position /= 2;
    }
    hash == *root
}

/// File id: base64 of the root hash.
pub fn content_id(root: &NodeHash) -> String {
    BASE64.encode(root)
}
