//! The log's Merkle tree is binary and left-balanced: leaves are appended on
//! the right, and only the roots of the maximal complete subtrees need to be
//! kept to extend the tree or compute its root.
//!
//! ```text
//!     (*)
//!   /   \
//!  *     *
//! / \   / \
//! 0 1 2 3 4
//!
//! evolves into:
//!         *
//!       /  \
//!     (*)   (5)
//!   /   \
//!  *     *
//! / \   / \
//! 0 1 2 3 4
//! ```
//!
//! where `(_)` denotes a cached maximal subroot. That cache is the whole of
//! [`TreeBuilder`]'s state, which is why it serializes to a handful of hashes
//! and survives process restarts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MirrorError;
use crate::{node_hash, Hash};

/// Root of a maximal complete subtree. `size` is always a power of two;
/// a node of size 1 is a leaf hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Subroot {
    size: u64,
    #[serde(with = "crate::b64")]
    root: Hash,
}

/// Streaming Merkle tree builder.
///
/// Accepts leaf hashes in strictly increasing index order and can produce the
/// RFC 6962 tree root for everything pushed so far at any point. The stack of
/// subroots is ordered largest-first; pushing a leaf combines equal-sized
/// complete subtrees until the invariant holds again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeBuilder {
    subroots: Vec<Subroot>,
    size: u64,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves pushed so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append the next leaf hash on the right.
    pub fn push(&mut self, leaf: Hash) {
        let mut node = Subroot { size: 1, root: leaf };
        while let Some(top) = self.subroots.pop() {
            if top.size == node.size {
                node = Subroot {
                    size: top.size * 2,
                    root: node_hash(&top.root, &node.root),
                };
            } else {
                self.subroots.push(top);
                break;
            }
        }
        self.subroots.push(node);
        self.size += 1;
    }

    /// The RFC 6962 root over everything pushed so far.
    ///
    /// Folds the subroot stack right to left, so the smallest (rightmost)
    /// subtree ends up deepest. The empty tree hashes to `SHA-256("")`.
    pub fn root(&self) -> Hash {
        let mut stack = self.subroots.iter().rev();
        let mut acc = match stack.next() {
            Some(node) => node.root,
            None => return Sha256::digest(b"").into(),
        };
        for node in stack {
            acc = node_hash(&node.root, &acc);
        }
        acc
    }
}

/// Verify an RFC 6962 §2.1.2 consistency proof between two tree sizes.
///
/// Reconstructs both roots from the proof path (the iterative form of the
/// SUBPROOF recursion) and requires each to equal its expected value. The
/// proof must be consumed exactly.
///
/// Edge cases per the RFC: equal sizes require an empty proof and equal
/// roots; an empty old tree is a prefix of every tree and no proof is
/// consulted.
pub fn verify_consistency(
    first: u64,
    second: u64,
    old_root: &Hash,
    new_root: &Hash,
    proof: &[Hash],
) -> Result<(), MirrorError> {
    let fail = |reason: &str| MirrorError::ConsistencyProofFailed {
        first,
        second,
        reason: reason.to_string(),
    };

    if first > second {
        return Err(fail("old tree is larger than new tree"));
    }
    if first == second {
        if !proof.is_empty() {
            return Err(fail("expected an empty proof between equal sizes"));
        }
        if old_root != new_root {
            return Err(fail("equal sizes with differing roots"));
        }
        return Ok(());
    }
    if first == 0 {
        return Ok(());
    }

    // Strip the common complete-subtree suffix: while the old tree's last
    // node is a right child, both trees share that pairing.
    let mut node = first - 1;
    let mut last = second - 1;
    while node & 1 == 1 {
        node >>= 1;
        last >>= 1;
    }

    let mut hashes = proof.iter();
    let mut next = || hashes.next().copied();

    // If the old tree is a complete subtree its root is the first proof
    // element and the server omits it.
    let (mut old_acc, mut new_acc) = match node {
        0 => (*old_root, *old_root),
        _ => {
            let h = next().ok_or_else(|| fail("proof too short"))?;
            (h, h)
        }
    };

    while node > 0 {
        if node & 1 == 1 {
            // Right child: the sibling on the left is shared by both trees.
            let h = next().ok_or_else(|| fail("proof too short"))?;
            old_acc = node_hash(&h, &old_acc);
            new_acc = node_hash(&h, &new_acc);
        } else if node < last {
            // Left child with a sibling that only exists in the new tree.
            let h = next().ok_or_else(|| fail("proof too short"))?;
            new_acc = node_hash(&new_acc, &h);
        }
        node >>= 1;
        last >>= 1;
    }

    // Remaining levels exist only in the new tree.
    while last > 0 {
        let h = next().ok_or_else(|| fail("proof too short"))?;
        new_acc = node_hash(&new_acc, &h);
        last >>= 1;
    }

    if hashes.next().is_some() {
        return Err(fail("unconsumed proof hashes"));
    }
    if old_acc != *old_root {
        return Err(fail("reconstructed old root does not match"));
    }
    if new_acc != *new_root {
        return Err(fail("reconstructed new root does not match"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;
    use crate::leaf_hash;

    /// Leaf inputs from RFC 6962's worked examples (d[0] through d[7]).
    fn rfc_leaves() -> Vec<Hash> {
        [
            &b""[..],
            &b"\x00"[..],
            &b"\x10"[..],
            &b"\x20\x21"[..],
            &b"\x30\x31"[..],
            &b"\x40\x41\x42\x43"[..],
            &b"\x50\x51\x52\x53\x54\x55\x56\x57"[..],
            &b"\x60\x61\x62\x63\x64\x65\x66\x67\x68\x69\x6a\x6b\x6c\x6d\x6e\x6f"[..],
        ]
        .iter()
        .map(|leaf| leaf_hash(leaf))
        .collect()
    }

    /// Batch MTH per RFC 6962 §2.1: split at the largest power of two
    /// strictly smaller than n.
    fn batch_root(leaves: &[Hash]) -> Hash {
        match leaves.len() {
            0 => sha2::Sha256::digest(b"").into(),
            1 => leaves[0],
            n => {
                let split = largest_power_of_two_less_than(n as u64) as usize;
                node_hash(&batch_root(&leaves[..split]), &batch_root(&leaves[split..]))
            }
        }
    }

    fn largest_power_of_two_less_than(n: u64) -> u64 {
        assert!(n >= 2);
        1 << (63 - (n - 1).leading_zeros())
    }

    /// PROOF(m, D[n]) per RFC 6962 §2.1.2; the reference the verifier must
    /// accept.
    fn consistency_proof(m: u64, leaves: &[Hash]) -> Vec<Hash> {
        let mut out = Vec::new();
        subproof(m, leaves, true, &mut out);
        out
    }

    fn subproof(m: u64, leaves: &[Hash], complete: bool, out: &mut Vec<Hash>) {
        let n = leaves.len() as u64;
        if m == n {
            if !complete {
                out.push(batch_root(leaves));
            }
            return;
        }
        let split = largest_power_of_two_less_than(n);
        if m <= split {
            subproof(m, &leaves[..split as usize], complete, out);
            out.push(batch_root(&leaves[split as usize..]));
        } else {
            // Bottom-up ordering: the recursion's hashes precede the shared
            // left-subtree root.
            subproof(m - split, &leaves[split as usize..], false, out);
            out.push(batch_root(&leaves[..split as usize]));
        }
    }

    #[test]
    fn empty_tree_root_is_hash_of_empty_string() {
        assert_eq!(
            TreeBuilder::new().root(),
            hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn single_leaf_root_is_the_leaf_hash() {
        // SHA-256(0x00) for the empty leaf input.
        let mut builder = TreeBuilder::new();
        builder.push(leaf_hash(b""));
        assert_eq!(
            builder.root(),
            hex!("6e340b9cffb37a989ca544e6bb780a2c78901d3fb33738768511a30617afa01d")
        );
    }

    #[test]
    fn three_leaf_root_shape() {
        let hashes = rfc_leaves();
        let mut builder = TreeBuilder::new();
        for h in &hashes[..3] {
            builder.push(*h);
        }
        let expected = node_hash(&node_hash(&hashes[0], &hashes[1]), &hashes[2]);
        assert_eq!(builder.root(), expected);
    }

    #[test]
    fn seven_leaf_root_shape() {
        let hashes = rfc_leaves();
        let mut builder = TreeBuilder::new();
        for h in &hashes[..7] {
            builder.push(*h);
        }
        let left = node_hash(
            &node_hash(&hashes[0], &hashes[1]),
            &node_hash(&hashes[2], &hashes[3]),
        );
        let right = node_hash(&node_hash(&hashes[4], &hashes[5]), &hashes[6]);
        assert_eq!(builder.root(), node_hash(&left, &right));
    }

    #[test]
    fn streaming_matches_batch_for_all_small_sizes() {
        let leaves: Vec<Hash> = (0u32..64).map(|i| leaf_hash(&i.to_be_bytes())).collect();
        let mut builder = TreeBuilder::new();
        for (i, leaf) in leaves.iter().enumerate() {
            builder.push(*leaf);
            assert_eq!(builder.size(), i as u64 + 1);
            assert_eq!(builder.root(), batch_root(&leaves[..=i]), "size {}", i + 1);
        }
    }

    #[test]
    fn builder_round_trips_through_serde() {
        let mut builder = TreeBuilder::new();
        for i in 0u32..13 {
            builder.push(leaf_hash(&i.to_be_bytes()));
        }
        let json = serde_json::to_string(&builder).unwrap();
        let restored: TreeBuilder = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, builder);

        // The restored builder keeps extending identically.
        let mut builder = builder;
        let mut restored = restored;
        for i in 13u32..21 {
            builder.push(leaf_hash(&i.to_be_bytes()));
            restored.push(leaf_hash(&i.to_be_bytes()));
        }
        assert_eq!(restored.root(), builder.root());
    }

    #[test]
    fn consistency_verifies_for_all_size_pairs() {
        let leaves: Vec<Hash> = (0u32..20).map(|i| leaf_hash(&i.to_be_bytes())).collect();
        for second in 1..=leaves.len() as u64 {
            for first in 1..=second {
                let proof = consistency_proof(first, &leaves[..second as usize]);
                let old_root = batch_root(&leaves[..first as usize]);
                let new_root = batch_root(&leaves[..second as usize]);
                verify_consistency(first, second, &old_root, &new_root, &proof)
                    .unwrap_or_else(|e| panic!("{first} -> {second}: {e}"));
            }
        }
    }

    #[test]
    fn rfc_proof_lengths() {
        // §2.1.3 worked examples: the proof between hash1 = MTH(D[0:3]) and
        // hash = MTH(D[0:7]) has four elements; between MTH(D[0:4]) and the
        // same tree, one element; between MTH(D[0:6]) and it, three.
        let leaves = rfc_leaves();
        assert_eq!(consistency_proof(3, &leaves[..7]).len(), 4);
        assert_eq!(consistency_proof(4, &leaves[..7]).len(), 1);
        assert_eq!(consistency_proof(6, &leaves[..7]).len(), 3);
    }

    #[test]
    fn equal_sizes_require_empty_proof_and_equal_roots() {
        let leaves = rfc_leaves();
        let root = batch_root(&leaves[..5]);
        verify_consistency(5, 5, &root, &root, &[]).unwrap();

        let other = batch_root(&leaves[..4]);
        assert!(verify_consistency(5, 5, &root, &other, &[]).is_err());
        assert!(verify_consistency(5, 5, &root, &root, &[root]).is_err());
    }

    #[test]
    fn empty_old_tree_is_vacuously_consistent() {
        let leaves = rfc_leaves();
        let new_root = batch_root(&leaves[..6]);
        verify_consistency(0, 6, &[0u8; 32], &new_root, &[]).unwrap();
    }

    #[test]
    fn tampered_proof_is_rejected() {
        let leaves: Vec<Hash> = (0u32..13).map(|i| leaf_hash(&i.to_be_bytes())).collect();
        let old_root = batch_root(&leaves[..5]);
        let new_root = batch_root(&leaves);
        let mut proof = consistency_proof(5, &leaves);
        proof[0][0] ^= 0x01;
        assert!(verify_consistency(5, 13, &old_root, &new_root, &proof).is_err());
    }

    #[test]
    fn truncated_and_padded_proofs_are_rejected() {
        let leaves: Vec<Hash> = (0u32..13).map(|i| leaf_hash(&i.to_be_bytes())).collect();
        let old_root = batch_root(&leaves[..6]);
        let new_root = batch_root(&leaves);
        let proof = consistency_proof(6, &leaves);

        let truncated = &proof[..proof.len() - 1];
        assert!(verify_consistency(6, 13, &old_root, &new_root, truncated).is_err());

        let mut padded = proof.clone();
        padded.push([0u8; 32]);
        assert!(verify_consistency(6, 13, &old_root, &new_root, &padded).is_err());
    }

    #[test]
    fn wrong_old_root_is_rejected() {
        let leaves: Vec<Hash> = (0u32..13).map(|i| leaf_hash(&i.to_be_bytes())).collect();
        let new_root = batch_root(&leaves);
        let proof = consistency_proof(5, &leaves);
        let mut bad_old = batch_root(&leaves[..5]);
        bad_old[31] ^= 0x80;
        assert!(verify_consistency(5, 13, &bad_old, &new_root, &proof).is_err());
    }
}
