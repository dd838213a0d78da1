//! Deduplicated attachment storage shared by all entries of a KDBX file

use crate::crypto::sha256;
use crate::entry::Entry;
use crate::protected::ProtectedBinary;
use std::collections::{BTreeMap, HashMap};

/// Attachments keyed by their numeric reference id
#[derive(Debug, Clone, Default)]
pub struct BinaryPool {
    binaries: BTreeMap<u32, ProtectedBinary>,
    by_content: HashMap<([u8; 32], bool), u32>,
}

impl BinaryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the pool written on save: every attachment of every entry and
    /// history entry, numbered in traversal order
    pub fn collect<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        let mut pool = Self::new();
        for entry in entries {
            pool.add_entry(entry);
        }
        pool
    }

    fn add_entry(&mut self, entry: &Entry) {
        for binary in entry.binaries.values() {
            self.add(binary);
        }
        for old in &entry.history {
            self.add_entry(old);
        }
    }

    /// Add a binary unless an identical one (content and protect flag) exists.
    /// Returns its id.
    pub fn add(&mut self, binary: &ProtectedBinary) -> u32 {
        let key = (sha256(&[binary.reveal().as_slice()]), binary.is_protected());
        if let Some(id) = self.by_content.get(&key) {
            return *id;
        }
        let id = self.binaries.len() as u32;
        self.binaries.insert(id, binary.clone());
        self.by_content.insert(key, id);
        id
    }

    /// Store a binary under an id read from a file
    pub fn insert(&mut self, id: u32, binary: ProtectedBinary) {
        self.binaries.insert(id, binary);
    }

    pub fn get(&self, id: u32) -> Option<&ProtectedBinary> {
        self.binaries.get(&id)
    }

    /// Id of a binary already in the pool
    pub fn find(&self, binary: &ProtectedBinary) -> Option<u32> {
        let key = (sha256(&[binary.reveal().as_slice()]), binary.is_protected());
        self.by_content.get(&key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &ProtectedBinary)> {
        self.binaries.iter().map(|(id, b)| (*id, b))
    }

    pub fn len(&self) -> usize {
        self.binaries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryBuilder;

    #[test]
    fn test_dedup_by_content_and_flag() {
        let mut pool = BinaryPool::new();
        let a = pool.add(&ProtectedBinary::new(b"same", false));
        let b = pool.add(&ProtectedBinary::new(b"same", false));
        let c = pool.add(&ProtectedBinary::new(b"same", true));
        let d = pool.add(&ProtectedBinary::new(b"other", false));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!((a, c, d), (0, 1, 2));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_collect_includes_history() {
        let mut entry = EntryBuilder::new("e").attachment("a.txt", b"one").build();
        let old = EntryBuilder::new("e").attachment("b.txt", b"two").build();
        entry.history.push(old);
        let pool = BinaryPool::collect([&entry]);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(1).unwrap().reveal().as_slice(), b"two");
        assert_eq!(pool.find(&ProtectedBinary::new(b"one", false)), Some(0));
    }
}
