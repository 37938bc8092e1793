//! The backing node store the sync layer reads and fills.
//!
//! The storage engine itself lives elsewhere; the sync layer only needs
//! content-addressed access plus the ability to enumerate the child
//! hashes a stored trie node references, so newly fetched nodes can fan
//! the traversal out.

use {
    sha3::{Digest, Sha3_256},
    std::{collections::HashMap, sync::RwLock},
};

/// Content-addressed access to trie nodes.
pub trait NodeStore: Send + Sync {
    /// Whether a node with this hash is present.
    fn has(&self, hash: &[u8]) -> bool;

    /// Fetch a node by hash.
    fn get(&self, hash: &[u8]) -> Option<Vec<u8>>;

    /// Store a node under its hash.
    fn put(&self, hash: &[u8], data: &[u8]);

    /// The hashes a stored node references, in the store's node encoding.
    fn children(&self, data: &[u8]) -> Vec<Vec<u8>>;
}

/// Content hash of a trie node.
pub fn node_hash(data: &[u8]) -> Vec<u8> {
    Sha3_256::digest(data).to_vec()
}

// ── In-memory store ─────────────────────────────────────────────────────────

/// In-memory [`NodeStore`] whose node encoding is a bincode pair of
/// `(child hashes, value bytes)`. Used by tests and light tooling.
#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a node referencing `children`, returning `(hash, data)`.
    pub fn encode_node(children: &[Vec<u8>], value: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let data = bincode::serialize(&(children.to_vec(), value.to_vec()))
            .expect("in-memory node encoding cannot fail");
        (node_hash(&data), data)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeStore for MemoryStore {
    fn has(&self, hash: &[u8]) -> bool {
        self.nodes
            .read()
            .expect("store lock poisoned")
            .contains_key(hash)
    }

    fn get(&self, hash: &[u8]) -> Option<Vec<u8>> {
        self.nodes
            .read()
            .expect("store lock poisoned")
            .get(hash)
            .cloned()
    }

    fn put(&self, hash: &[u8], data: &[u8]) {
        self.nodes
            .write()
            .expect("store lock poisoned")
            .insert(hash.to_vec(), data.to_vec());
    }

    fn children(&self, data: &[u8]) -> Vec<Vec<u8>> {
        bincode::deserialize::<(Vec<Vec<u8>>, Vec<u8>)>(data)
            .map(|(children, _)| children)
            .unwrap_or_default()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_has() {
        let store = MemoryStore::new();
        let (hash, data) = MemoryStore::encode_node(&[], b"leaf");
        assert!(!store.has(&hash));
        store.put(&hash, &data);
        assert!(store.has(&hash));
        assert_eq!(store.get(&hash).unwrap(), data);
    }

    #[test]
    fn test_children_roundtrip() {
        let store = MemoryStore::new();
        let (leaf_hash, _) = MemoryStore::encode_node(&[], b"leaf");
        let (_, branch_data) = MemoryStore::encode_node(&[leaf_hash.clone()], b"");
        assert_eq!(store.children(&branch_data), vec![leaf_hash]);
    }

    #[test]
    fn test_children_of_garbage_is_empty() {
        let store = MemoryStore::new();
        assert!(store.children(&[0xFF, 0x00, 0x01]).is_empty());
    }
}
