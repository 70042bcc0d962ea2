//! The in-memory index: key bytes → log position.
//!
//! The index holds one entry per live key, pointing at the chunk of that
//! key's latest committed write. It is rebuilt from the log on open and
//! never persisted.
//!
//! Cross-key write ordering is serialized by the engine's writer lock, so
//! an implementation only has to make each individual operation atomic.

use dashmap::DashMap;
use vellum_wal::ChunkPosition;

/// Capability set the engine requires of an index.
pub trait Index: Send + Sync {
    /// Position of the latest live write of `key`, if any.
    fn get(&self, key: &[u8]) -> Option<ChunkPosition>;

    /// Map `key` to `pos`, returning the previous position if present.
    fn put(&self, key: Vec<u8>, pos: ChunkPosition) -> Option<ChunkPosition>;

    /// Remove `key`, returning the previous position if present.
    fn delete(&self, key: &[u8]) -> Option<ChunkPosition>;

    /// Number of indexed keys.
    fn len(&self) -> usize;

    /// Whether the index holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every entry. The visitor returns `false` to stop early.
    ///
    /// Entries inserted or removed concurrently may or may not be visited;
    /// callers that need a stable view hold the writer lock.
    fn for_each(&self, visitor: &mut dyn FnMut(&[u8], &ChunkPosition) -> bool);
}

/// Default index: a hash map sharded by key hash.
///
/// Reads don't contend with writes to other shards, which keeps shared-mode
/// readers cheap while a writer batch holds the engine lock.
#[derive(Debug, Default)]
pub struct ShardedIndex {
    map: DashMap<Vec<u8>, ChunkPosition>,
}

impl ShardedIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Index for ShardedIndex {
    fn get(&self, key: &[u8]) -> Option<ChunkPosition> {
        self.map.get(key).map(|entry| *entry.value())
    }

    fn put(&self, key: Vec<u8>, pos: ChunkPosition) -> Option<ChunkPosition> {
        self.map.insert(key, pos)
    }

    fn delete(&self, key: &[u8]) -> Option<ChunkPosition> {
        self.map.remove(key).map(|(_, pos)| pos)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn for_each(&self, visitor: &mut dyn FnMut(&[u8], &ChunkPosition) -> bool) {
        for entry in self.map.iter() {
            if !visitor(entry.key(), entry.value()) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(segment_id: u64, offset: u64) -> ChunkPosition {
        ChunkPosition {
            segment_id,
            offset,
            length: 10,
        }
    }

    #[test]
    fn test_put_get_delete() {
        let index = ShardedIndex::new();
        assert!(index.get(b"a").is_none());

        assert!(index.put(b"a".to_vec(), pos(1, 16)).is_none());
        assert_eq!(index.get(b"a"), Some(pos(1, 16)));
        assert_eq!(index.len(), 1);

        let previous = index.put(b"a".to_vec(), pos(2, 64));
        assert_eq!(previous, Some(pos(1, 16)));
        assert_eq!(index.get(b"a"), Some(pos(2, 64)));
        assert_eq!(index.len(), 1);

        assert_eq!(index.delete(b"a"), Some(pos(2, 64)));
        assert!(index.get(b"a").is_none());
        assert!(index.is_empty());
        assert!(index.delete(b"a").is_none());
    }

    #[test]
    fn test_for_each_visits_all() {
        let index = ShardedIndex::new();
        for i in 0..100u64 {
            index.put(i.to_be_bytes().to_vec(), pos(1, i * 32));
        }

        let mut visited = 0usize;
        index.for_each(&mut |_, _| {
            visited += 1;
            true
        });
        assert_eq!(visited, 100);
    }

    #[test]
    fn test_for_each_early_stop() {
        let index = ShardedIndex::new();
        for i in 0..100u64 {
            index.put(i.to_be_bytes().to_vec(), pos(1, i * 32));
        }

        let mut visited = 0usize;
        index.for_each(&mut |_, _| {
            visited += 1;
            visited < 10
        });
        assert_eq!(visited, 10);
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        use std::sync::Arc;

        let index = Arc::new(ShardedIndex::new());
        let mut handles = Vec::new();

        for t in 0..4u64 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                for i in 0..500u64 {
                    let key = (t * 1000 + i).to_be_bytes().to_vec();
                    index.put(key.clone(), pos(t, i));
                    assert_eq!(index.get(&key), Some(pos(t, i)));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(index.len(), 2000);
    }
}
