//! Hashing utilities for carton
//!
//! - BLAKE3 for block checksums
//! - HRW (Highest Random Weight) for pipeline member selection

use blake3::Hasher;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Compute BLAKE3 hash incrementally (for streaming block writes)
pub struct Blake3Hasher {
    hasher: Hasher,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> String {
        let hash = self.hasher.finalize();
        format!("{}", hash)
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// HRW (Highest Random Weight) hashing over node ids
///
/// Given a key and a set of nodes, returns nodes sorted by their weight
/// (deterministic per key), so pipeline placement is stable as the
/// cluster changes.
pub fn hrw_hash(key: &str, nodes: &[String]) -> Vec<String> {
    let mut weights: Vec<(String, u64)> = nodes
        .iter()
        .map(|node| {
            let combined = format!("{}{}", key, node);
            let hash = blake3::hash(combined.as_bytes());
            let weight = u64::from_le_bytes(hash.as_bytes()[0..8].try_into().unwrap());
            (node.clone(), weight)
        })
        .collect();

    weights.sort_by(|a, b| b.1.cmp(&a.1));

    weights.into_iter().map(|(node, _)| node).collect()
}

/// Select N members using HRW hashing
pub fn select_members(key: &str, nodes: &[String], n: usize) -> Vec<String> {
    let sorted = hrw_hash(key, nodes);
    sorted.into_iter().take(n).collect()
}
