//! Priority structures the repair loop schedules from
//!
//! [`DirectoryHeap`] finds the worst directories first. [`UploadHeap`]
//! orders the chunks picked from them, with stuck chunks and streaming
//! uploads ahead of ordinary repairs.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::types::{ChunkId, DirPath};

/// A directory waiting to be searched for chunks to repair
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub dir: DirPath,
    pub health: f64,
    pub aggregate_health: f64,
    /// Explored entries stand for the directory's own files only
    pub explored: bool,
}

impl DirEntry {
    pub fn unexplored(dir: DirPath, health: f64, aggregate_health: f64) -> Self {
        Self {
            dir,
            health,
            aggregate_health,
            explored: false,
        }
    }

    /// Health the entry is ranked by
    pub fn rank(&self) -> f64 {
        if self.explored {
            self.health
        } else {
            self.aggregate_health
        }
    }
}

impl PartialEq for DirEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DirEntry {}

impl PartialOrd for DirEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DirEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank()
            .total_cmp(&other.rank())
            .then_with(|| other.dir.cmp(&self.dir))
    }
}

/// Max-heap of directories by health
#[derive(Debug, Default)]
pub struct DirectoryHeap {
    heap: BinaryHeap<DirEntry>,
}

impl DirectoryHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: DirEntry) {
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<DirEntry> {
        self.heap.pop()
    }

    /// Rank of the worst directory
    pub fn peek_rank(&self) -> Option<f64> {
        self.heap.peek().map(DirEntry::rank)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

/// Admission class of an upload heap entry, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeapClass {
    Normal,
    Stuck,
    Streaming,
}

#[derive(Debug)]
pub struct HeapItem<T> {
    /// Chunk being repaired; streaming uploads have none
    pub chunk: Option<ChunkId>,
    pub class: HeapClass,
    pub health: f64,
    pub item: T,
}

struct Ranked<T> {
    seq: u64,
    inner: HeapItem<T>,
}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Ranked<T> {}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ranked<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner
            .class
            .cmp(&other.inner.class)
            .then_with(|| self.inner.health.total_cmp(&other.inner.health))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Chunks queued for upload
///
/// A chunk stays tracked from admission until [`UploadHeap::complete`], so
/// it cannot be queued again while its repair runs. Only normal entries
/// count against the size limit.
pub struct UploadHeap<T> {
    heap: BinaryHeap<Ranked<T>>,
    tracked: HashMap<ChunkId, HeapClass>,
    max_normal: usize,
    normal: usize,
    /// Stuck chunks queued or being repaired
    stuck: usize,
    next_seq: u64,
}

impl<T> UploadHeap<T> {
    pub fn new(max_normal: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            tracked: HashMap::new(),
            max_normal,
            normal: 0,
            stuck: 0,
            next_seq: 0,
        }
    }

    /// Queue an entry; false if its chunk is already tracked or the heap
    /// has no room for another normal entry
    pub fn push(&mut self, item: HeapItem<T>) -> bool {
        if item.class == HeapClass::Normal && self.normal >= self.max_normal {
            return false;
        }
        if let Some(chunk) = &item.chunk {
            if self.tracked.contains_key(chunk) {
                return false;
            }
            self.tracked.insert(chunk.clone(), item.class);
            if item.class == HeapClass::Stuck {
                self.stuck += 1;
            }
        }
        if item.class == HeapClass::Normal {
            self.normal += 1;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Ranked { seq, inner: item });
        true
    }

    pub fn pop(&mut self) -> Option<HeapItem<T>> {
        let ranked = self.heap.pop()?;
        if ranked.inner.class == HeapClass::Normal {
            self.normal -= 1;
        }
        Some(ranked.inner)
    }

    /// Stop tracking a chunk whose repair finished
    pub fn complete(&mut self, chunk: &ChunkId) {
        if self.tracked.remove(chunk) == Some(HeapClass::Stuck) {
            self.stuck -= 1;
        }
    }

    pub fn is_tracked(&self, chunk: &ChunkId) -> bool {
        self.tracked.contains_key(chunk)
    }

    pub fn is_full(&self) -> bool {
        self.normal >= self.max_normal
    }

    /// Stuck chunks admitted and not yet completed, running ones included
    pub fn num_stuck(&self) -> usize {
        self.stuck
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FilePath;

    fn chunk(name: &str, index: u64) -> Option<ChunkId> {
        Some(ChunkId::new(FilePath::parse(name).unwrap(), index))
    }

    fn item(chunk: Option<ChunkId>, class: HeapClass, health: f64, tag: u32) -> HeapItem<u32> {
        HeapItem {
            chunk,
            class,
            health,
            item: tag,
        }
    }

    #[test]
    fn test_directory_heap_ranks_by_explored_state() {
        let mut heap = DirectoryHeap::new();
        heap.push(DirEntry::unexplored(DirPath::new("a"), 0.1, 0.9));
        heap.push(DirEntry {
            dir: DirPath::new("b"),
            health: 0.5,
            aggregate_health: 2.0,
            explored: true,
        });
        heap.push(DirEntry::unexplored(DirPath::new("c"), 0.0, 0.3));

        let order: Vec<_> = std::iter::from_fn(|| heap.pop()).map(|e| e.dir).collect();
        assert_eq!(
            order,
            vec![DirPath::new("a"), DirPath::new("b"), DirPath::new("c")]
        );
    }

    #[test]
    fn test_upload_heap_class_then_health() {
        let mut heap = UploadHeap::new(10);
        assert!(heap.push(item(chunk("n1", 0), HeapClass::Normal, 0.4, 1)));
        assert!(heap.push(item(chunk("n2", 0), HeapClass::Normal, 0.9, 2)));
        assert!(heap.push(item(chunk("s", 0), HeapClass::Stuck, 0.1, 3)));
        assert!(heap.push(item(None, HeapClass::Streaming, 0.0, 4)));
        assert!(heap.push(item(None, HeapClass::Streaming, 0.0, 5)));
        assert_eq!(heap.num_stuck(), 1);

        let order: Vec<u32> = std::iter::from_fn(|| heap.pop()).map(|i| i.item).collect();
        assert_eq!(order, vec![4, 5, 3, 2, 1]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_running_stuck_repairs_count_until_complete() {
        let mut heap = UploadHeap::new(10);
        let stuck = chunk("s", 0);
        assert!(heap.push(item(stuck.clone(), HeapClass::Stuck, 0.1, 1)));
        assert!(heap.push(item(chunk("n", 0), HeapClass::Normal, 0.5, 2)));

        // popped for repair but still running
        assert_eq!(heap.pop().map(|i| i.item), Some(1));
        assert_eq!(heap.num_stuck(), 1);

        heap.complete(chunk("n", 0).as_ref().unwrap());
        assert_eq!(heap.num_stuck(), 1);
        heap.complete(stuck.as_ref().unwrap());
        assert_eq!(heap.num_stuck(), 0);
    }

    #[test]
    fn test_upload_heap_tracks_until_complete() {
        let mut heap = UploadHeap::new(10);
        let id = chunk("f", 3);
        assert!(heap.push(item(id.clone(), HeapClass::Normal, 0.5, 1)));
        assert!(!heap.push(item(id.clone(), HeapClass::Stuck, 0.5, 2)));

        heap.pop();
        assert!(!heap.push(item(id.clone(), HeapClass::Normal, 0.5, 3)));
        heap.complete(id.as_ref().unwrap());
        assert!(heap.push(item(id, HeapClass::Normal, 0.5, 4)));
    }

    #[test]
    fn test_upload_heap_limit_applies_to_normal_only() {
        let mut heap = UploadHeap::new(1);
        assert!(heap.push(item(chunk("a", 0), HeapClass::Normal, 0.5, 1)));
        assert!(heap.is_full());
        assert!(!heap.push(item(chunk("b", 0), HeapClass::Normal, 0.9, 2)));
        assert!(!heap.is_tracked(chunk("b", 0).as_ref().unwrap()));
        assert!(heap.push(item(chunk("c", 0), HeapClass::Stuck, 0.9, 3)));
        assert!(heap.push(item(None, HeapClass::Streaming, 0.0, 4)));
        assert_eq!(heap.len(), 3);
    }
}
