//! Piece hash verification, flat (v1) and tree-hash (v2).
//!
//! Flat verification compares a SHA-1 digest of the whole piece against the
//! stored per-piece reference. Tree verification hashes the piece's 16 KiB
//! blocks into SHA-256 leaves, reduces them to the piece's subtree root, then
//! folds the supplied proof hashes up to the torrent root.
//!
//! The span constraints on tree-hash requests are shared between the
//! verifying and the serving side: both reject the same invalid requests.

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::constants::{BLOCK_SIZE, MAX_HASH_REQUEST_LENGTH, MIN_HASH_REQUEST_LENGTH};

/// Why a tree-hash request is invalid.
///
/// Answered with a reject message rather than a connection drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashRequestFault {
    /// Span length is not a power of two in `[2, 512]`.
    BadLength(u32),
    /// Index is not a multiple of the span length.
    Misaligned { index: u32, length: u32 },
    /// More proof layers than the tree has.
    TooManyProofLayers { requested: u32, max: u32 },
}

/// Validates the span constraints of a tree-hash request.
///
/// Enforced identically when serving `HashRequest` messages and when
/// checking a `Hashes` response before use.
pub fn validate_hash_request(
    piece_count: u32,
    index: u32,
    length: u32,
    proof_layers: u32,
) -> Result<(), HashRequestFault> {
    if !length.is_power_of_two()
        || length < MIN_HASH_REQUEST_LENGTH
        || length > MAX_HASH_REQUEST_LENGTH
    {
        return Err(HashRequestFault::BadLength(length));
    }
    if index % length != 0 {
        return Err(HashRequestFault::Misaligned { index, length });
    }
    let max = ceil_log2(piece_count);
    if proof_layers > max {
        return Err(HashRequestFault::TooManyProofLayers {
            requested: proof_layers,
            max,
        });
    }
    Ok(())
}

/// `ceil(log2(n))` for `n >= 1`; 0 for `n <= 1`.
pub fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        n.next_power_of_two().trailing_zeros()
    }
}

/// One verification unit for a single piece, produced transiently by the
/// disk collaborator when re-hashing on-disk data.
#[derive(Debug, Clone)]
pub enum PieceHash {
    /// A 20-byte flat digest of the whole piece.
    Flat([u8; 20]),
    /// The piece's subtree root plus the proof layers up to the torrent
    /// root.
    TreeRoot {
        root: [u8; 32],
        proof: Vec<[u8; 32]>,
    },
}

/// The reference hashes a torrent verifies pieces against.
#[derive(Debug, Clone)]
pub enum PieceHashes {
    /// One 20-byte SHA-1 digest per piece (legacy).
    Flat(Vec<[u8; 20]>),
    /// A SHA-256 tree root over 16 KiB block leaves (BEP-52).
    Tree { root: [u8; 32] },
}

/// Verifies completed pieces against the torrent's reference hashes.
pub struct HashVerifier {
    hashes: PieceHashes,
    piece_count: u32,
    leaves_per_piece: u32,
    /// Piece-layer hashes of a tree torrent, once fetched from the swarm.
    piece_roots: Option<Vec<[u8; 32]>>,
}

impl HashVerifier {
    /// A verifier for a legacy flat-hash torrent.
    pub fn flat(digests: Vec<[u8; 20]>) -> Self {
        let piece_count = digests.len() as u32;
        Self {
            hashes: PieceHashes::Flat(digests),
            piece_count,
            leaves_per_piece: 1,
            piece_roots: None,
        }
    }

    /// A verifier for a tree-hash torrent.
    ///
    /// `piece_length` must be a multiple of the 16 KiB block size, as BEP-52
    /// requires.
    pub fn tree(root: [u8; 32], piece_count: u32, piece_length: u32) -> Self {
        let leaves_per_piece = (piece_length / BLOCK_SIZE).max(1);
        Self {
            hashes: PieceHashes::Tree { root },
            piece_count,
            leaves_per_piece,
            piece_roots: None,
        }
    }

    /// Installs the fetched piece-layer hashes of a tree torrent.
    ///
    /// Returns false (and stores nothing) unless the layer actually reduces
    /// to the torrent root. Once installed, pieces verify against their own
    /// layer hash and need no per-piece proofs.
    pub fn set_piece_roots(&mut self, roots: Vec<[u8; 32]>) -> bool {
        let PieceHashes::Tree { root } = &self.hashes else {
            return false;
        };
        if roots.len() as u32 != self.piece_count {
            return false;
        }
        if &reduce_to_root(roots.clone()) != root {
            return false;
        }
        self.piece_roots = Some(roots);
        true
    }

    /// Whether the piece layer is known (always true for flat torrents).
    pub fn has_piece_roots(&self) -> bool {
        match &self.hashes {
            PieceHashes::Flat(_) => true,
            PieceHashes::Tree { .. } => self.piece_roots.is_some(),
        }
    }

    /// The piece-layer hashes, if known.
    pub fn piece_roots(&self) -> Option<&[[u8; 32]]> {
        self.piece_roots.as_deref()
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Whether this torrent verifies with the tree scheme.
    pub fn is_tree(&self) -> bool {
        matches!(self.hashes, PieceHashes::Tree { .. })
    }

    /// The torrent's tree root, for tree-hash torrents.
    pub fn tree_root(&self) -> Option<[u8; 32]> {
        match &self.hashes {
            PieceHashes::Tree { root } => Some(*root),
            PieceHashes::Flat(_) => None,
        }
    }

    /// Verifies a fully received piece against its flat digest.
    ///
    /// Returns false for out-of-range indices and for tree-hash torrents.
    pub fn verify_flat(&self, piece_index: u32, piece_bytes: &[u8]) -> bool {
        let PieceHashes::Flat(digests) = &self.hashes else {
            return false;
        };
        let Some(expected) = digests.get(piece_index as usize) else {
            return false;
        };
        let digest: [u8; 20] = Sha1::digest(piece_bytes).into();
        &digest == expected
    }

    /// Verifies a fully received piece against the tree root.
    ///
    /// `proof` carries the ancestor hashes from the piece's subtree root up
    /// to the torrent root, nearest layer first. A full proof
    /// (`ceil_log2(piece_count)` hashes) folds all the way to the root; an
    /// empty proof is accepted once the piece layer has been installed.
    /// Any other proof count fails verification.
    pub fn verify_tree(&self, piece_index: u32, piece_bytes: &[u8], proof: &[[u8; 32]]) -> bool {
        let PieceHashes::Tree { root } = &self.hashes else {
            return false;
        };
        if piece_index >= self.piece_count {
            return false;
        }
        let full = ceil_log2(self.piece_count);
        if proof.len() as u32 > full {
            return false;
        }

        let leaves = leaf_hashes(piece_bytes, self.leaves_per_piece as usize);
        let piece_root = reduce_to_root(leaves);

        if proof.len() as u32 == full {
            let mut node = piece_root;
            let mut position = piece_index as usize;
            for uncle in proof {
                node = if position % 2 == 0 {
                    hash_pair(&node, uncle)
                } else {
                    hash_pair(uncle, &node)
                };
                position /= 2;
            }
            return &node == root;
        }

        if proof.is_empty() {
            if let Some(roots) = &self.piece_roots {
                return roots[piece_index as usize] == piece_root;
            }
        }
        false
    }

    /// Verifies a piece with whichever scheme the torrent uses.
    pub fn verify(&self, piece_index: u32, piece_bytes: &[u8], proof: &[[u8; 32]]) -> bool {
        match &self.hashes {
            PieceHashes::Flat(_) => self.verify_flat(piece_index, piece_bytes),
            PieceHashes::Tree { .. } => self.verify_tree(piece_index, piece_bytes, proof),
        }
    }

    /// Checks a disk-produced [`PieceHash`] against the reference for
    /// `piece_index`. Used by the hash-check phase, where the disk
    /// collaborator hashed the on-disk bytes.
    pub fn matches_reference(&self, piece_index: u32, hash: &PieceHash) -> bool {
        match (&self.hashes, hash) {
            (PieceHashes::Flat(digests), PieceHash::Flat(digest)) => digests
                .get(piece_index as usize)
                .is_some_and(|expected| expected == digest),
            (PieceHashes::Tree { root }, PieceHash::TreeRoot { root: piece_root, proof }) => {
                if piece_index >= self.piece_count {
                    return false;
                }
                if proof.len() as u32 != ceil_log2(self.piece_count) {
                    return false;
                }
                let mut node = *piece_root;
                let mut position = piece_index as usize;
                for uncle in proof {
                    node = if position % 2 == 0 {
                        hash_pair(&node, uncle)
                    } else {
                        hash_pair(uncle, &node)
                    };
                    position /= 2;
                }
                &node == root
            }
            _ => false,
        }
    }
}

/// SHA-256 leaf hashes of a piece's 16 KiB blocks, zero-padded to the
/// piece's leaf span.
pub fn leaf_hashes(piece_bytes: &[u8], leaves_per_piece: usize) -> Vec<[u8; 32]> {
    let mut leaves: Vec<[u8; 32]> = piece_bytes
        .chunks(BLOCK_SIZE as usize)
        .map(|block| Sha256::digest(block).into())
        .collect();
    while leaves.len() < leaves_per_piece {
        leaves.push([0u8; 32]);
    }
    leaves
}

/// Reduces a zero-padded leaf layer to a single subtree root.
pub fn reduce_to_root(mut level: Vec<[u8; 32]>) -> [u8; 32] {
    if level.is_empty() {
        return [0u8; 32];
    }
    let padded = level.len().next_power_of_two();
    while level.len() < padded {
        level.push([0u8; 32]);
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

/// Hashes two interior nodes together (SHA-256).
pub fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Verifies a fetched span of piece-layer hashes against the torrent root.
///
/// The span is reduced to its subtree root, then each proof hash is folded
/// in by the parity of the span's position. Succeeds only when the fold
/// lands exactly on the root: the proof count must bridge the full distance
/// from the reduced span to the tree's top.
pub fn verify_layer_span(
    root: &[u8; 32],
    piece_count: u32,
    index: u32,
    hashes: &[[u8; 32]],
    proof: &[[u8; 32]],
) -> bool {
    if hashes.is_empty() {
        return false;
    }
    let length = hashes.len() as u32;
    let span_levels = ceil_log2(length);
    let total_levels = ceil_log2(piece_count);
    if span_levels + proof.len() as u32 != total_levels.max(span_levels) {
        return false;
    }

    let mut node = reduce_to_root(hashes.to_vec());
    let mut position = (index / length.max(1)) as usize;
    for uncle in proof {
        node = if position % 2 == 0 {
            hash_pair(&node, uncle)
        } else {
            hash_pair(uncle, &node)
        };
        position /= 2;
    }
    &node == root
}

/// The serving side of the tree-hash extension: a fully built tree over the
/// piece layer, able to answer span and proof queries.
pub struct PieceTree {
    /// `levels[0]` is the zero-padded piece layer; the last level is the
    /// single root.
    levels: Vec<Vec<[u8; 32]>>,
    piece_count: u32,
}

impl PieceTree {
    pub fn from_piece_roots(roots: &[[u8; 32]]) -> Self {
        let piece_count = roots.len() as u32;
        let mut base = roots.to_vec();
        let padded = base.len().next_power_of_two().max(1);
        base.resize(padded, [0u8; 32]);

        let mut levels = vec![base];
        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let next: Vec<[u8; 32]> = levels
                .last()
                .unwrap()
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            levels.push(next);
        }
        Self {
            levels,
            piece_count,
        }
    }

    pub fn root(&self) -> [u8; 32] {
        self.levels.last().map(|l| l[0]).unwrap_or([0u8; 32])
    }

    /// The span `[index, index + length)` of the piece layer, zero-padded
    /// past the tree's width. `None` when the whole span lies outside the
    /// torrent's pieces.
    pub fn span(&self, index: u32, length: u32) -> Option<Vec<[u8; 32]>> {
        if index >= self.piece_count {
            return None;
        }
        let base = &self.levels[0];
        let hashes = (index..index + length)
            .map(|i| base.get(i as usize).copied().unwrap_or([0u8; 32]))
            .collect();
        Some(hashes)
    }

    /// The `proof_layers` uncle hashes that connect the reduced span at
    /// `[index, index + length)` to the tree's upper levels, nearest first.
    pub fn proof(&self, index: u32, length: u32, proof_layers: u32) -> Vec<[u8; 32]> {
        let mut uncles = Vec::new();
        let mut level = ceil_log2(length) as usize;
        let mut position = (index / length.max(1)) as usize;

        for _ in 0..proof_layers {
            let Some(nodes) = self.levels.get(level) else {
                break;
            };
            if nodes.len() <= 1 {
                break;
            }
            let sibling = if position % 2 == 0 {
                position + 1
            } else {
                position - 1
            };
            uncles.push(nodes.get(sibling).copied().unwrap_or([0u8; 32]));
            level += 1;
            position /= 2;
        }
        uncles
    }
}
