//! Merkle tree over block payload values.
//!
//! Each block carries the Merkle root of its payload's string-coerced
//! values in insertion order. The tree hashes every leaf with SHA-256,
//! then repeatedly pairs adjacent hashes (duplicating the last one on
//! odd levels) and hashes the concatenation of their hex digests until
//! a single root remains. An empty leaf set hashes to SHA-256 of the
//! empty byte string so the root is always defined.

use crate::hashing::{hash_bytes, hash_str};
use crate::types::HexHash;

/// Computes the Merkle root of an ordered list of leaf strings.
pub fn merkle_root<S: AsRef<str>>(leaves: &[S]) -> HexHash {
    if leaves.is_empty() {
        return hash_bytes(b"");
    }

    let mut level: Vec<HexHash> = leaves.iter().map(|l| hash_str(l.as_ref())).collect();

    while level.len() > 1 {
        if level.len() % 2 != 0 {
            // Duplicate the last hash so every node has a sibling.
            let last = level.last().cloned().expect("level is non-empty");
            level.push(last);
        }

        level = level
            .chunks(2)
            .map(|pair| {
                let combined = format!("{}{}", pair[0].as_str(), pair[1].as_str());
                hash_str(&combined)
            })
            .collect();
    }

    level.remove(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_leaves_hash_to_empty_digest() {
        assert_eq!(
            merkle_root::<&str>(&[]).as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let root = merkle_root(&["genesis"]);
        assert_eq!(root, hash_str("genesis"));
    }

    #[test]
    fn odd_leaf_count_duplicates_last() {
        // With three leaves the last is paired with itself.
        let h = |s: &str| hash_str(s);
        let a = h("a");
        let b = h("b");
        let c = h("c");
        let ab = hash_str(&format!("{}{}", a.as_str(), b.as_str()));
        let cc = hash_str(&format!("{}{}", c.as_str(), c.as_str()));
        let expected = hash_str(&format!("{}{}", ab.as_str(), cc.as_str()));

        assert_eq!(merkle_root(&["a", "b", "c"]), expected);
    }

    #[test]
    fn root_depends_on_leaf_order() {
        assert_ne!(merkle_root(&["a", "b"]), merkle_root(&["b", "a"]));
    }

    #[test]
    fn root_is_deterministic() {
        let leaves = vec!["SHEET_1", "ROLL_1", "EXAM_1"];
        assert_eq!(merkle_root(&leaves), merkle_root(&leaves));
    }
}
