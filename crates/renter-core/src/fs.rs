//! Persistence collaborator
//!
//! The renter's directory tree, per-directory health metadata and file
//! layouts live behind [`RenterFs`]. Each call is transactional on its own;
//! the engine never holds a lock across calls. [`MemoryFs`] keeps all of it
//! in memory.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use renter_ec::ErasureScheme;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ChunkId, DirPath, FilePath, PieceLocation};

/// Health record of one directory
///
/// Plain fields describe the files directly in the directory; `aggregate_`
/// fields fold in every subdirectory recursively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirMetadata {
    /// Worst health of a non-stuck chunk; 0 is fully redundant
    pub health: f64,
    pub aggregate_health: f64,
    /// Worst health of a stuck chunk
    pub stuck_health: f64,
    pub aggregate_stuck_health: f64,
    pub num_files: u64,
    pub aggregate_num_files: u64,
    pub size: u64,
    pub aggregate_size: u64,
    pub num_stuck_chunks: u64,
    pub aggregate_num_stuck_chunks: u64,
    /// Lowest `good pieces / k` of any chunk
    pub min_redundancy: f64,
    pub aggregate_min_redundancy: f64,
    pub last_health_check: DateTime<Utc>,
    pub aggregate_last_health_check: DateTime<Utc>,
}

impl Default for DirMetadata {
    fn default() -> Self {
        Self {
            health: 0.0,
            aggregate_health: 0.0,
            stuck_health: 0.0,
            aggregate_stuck_health: 0.0,
            num_files: 0,
            aggregate_num_files: 0,
            size: 0,
            aggregate_size: 0,
            num_stuck_chunks: 0,
            aggregate_num_stuck_chunks: 0,
            min_redundancy: f64::MAX,
            aggregate_min_redundancy: f64::MAX,
            last_health_check: DateTime::<Utc>::UNIX_EPOCH,
            aggregate_last_health_check: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Immediate children of a directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirListing {
    pub dirs: Vec<DirPath>,
    pub files: Vec<FilePath>,
}

/// Stored pieces of one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    pub index: u64,
    pub pieces: Vec<PieceLocation>,
    /// Set aside by the repair loop as independently unrepairable
    pub stuck: bool,
}

/// Layout of a file at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub path: FilePath,
    pub scheme: ErasureScheme,
    pub chunk_size: u64,
    pub size: u64,
    pub chunks: Vec<ChunkSnapshot>,
}

impl FileSnapshot {
    /// A file with no pieces stored yet
    pub fn new(path: FilePath, scheme: ErasureScheme, chunk_size: u64, size: u64) -> Self {
        let count = size.div_ceil(chunk_size.max(1)).max(1);
        Self {
            path,
            scheme,
            chunk_size,
            size,
            chunks: (0..count)
                .map(|index| ChunkSnapshot {
                    index,
                    pieces: Vec::new(),
                    stuck: false,
                })
                .collect(),
        }
    }

    /// Bytes of file data in chunk `index`
    pub fn chunk_len(&self, index: u64) -> u64 {
        let start = index.saturating_mul(self.chunk_size);
        self.size.saturating_sub(start).min(self.chunk_size)
    }

    pub fn chunk_id(&self, index: u64) -> ChunkId {
        ChunkId::new(self.path.clone(), index)
    }

    pub fn num_stuck_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.stuck).count()
    }
}

#[async_trait]
pub trait RenterFs: Send + Sync {
    async fn list_dir(&self, dir: &DirPath) -> Result<DirListing>;

    async fn dir_metadata(&self, dir: &DirPath) -> Result<DirMetadata>;

    async fn update_dir_metadata(&self, dir: &DirPath, metadata: DirMetadata) -> Result<()>;

    async fn file(&self, path: &FilePath) -> Result<FileSnapshot>;

    /// Create or replace a file, optionally with a local copy of its data
    async fn create_file(&self, file: FileSnapshot, local: Option<Bytes>) -> Result<()>;

    async fn set_chunk_stuck(&self, chunk: &ChunkId, stuck: bool) -> Result<()>;

    /// Record newly stored pieces
    async fn add_pieces(&self, chunk: &ChunkId, pieces: &[PieceLocation]) -> Result<()>;

    /// Chunk data from the local source file, if one is still available
    async fn read_local_chunk(&self, chunk: &ChunkId) -> Result<Option<Bytes>>;

    /// Directory holding backup files, whose chunks are repaired first
    fn backup_root(&self) -> Option<DirPath> {
        None
    }
}

struct StoredFile {
    snapshot: FileSnapshot,
    local: Option<Bytes>,
}

#[derive(Default)]
struct FsState {
    dirs: BTreeMap<DirPath, DirMetadata>,
    files: BTreeMap<FilePath, StoredFile>,
}

impl FsState {
    fn ensure_dir(&mut self, dir: &DirPath) {
        let mut current = Some(dir.clone());
        while let Some(dir) = current {
            current = dir.parent();
            self.dirs.entry(dir).or_default();
        }
    }

    fn chunk_mut(&mut self, chunk: &ChunkId) -> Result<&mut ChunkSnapshot> {
        self.files
            .get_mut(&chunk.file)
            .and_then(|f| f.snapshot.chunks.get_mut(chunk.index as usize))
            .ok_or_else(|| Error::NotFound(chunk.to_string()))
    }
}

/// In-memory [`RenterFs`]
pub struct MemoryFs {
    state: RwLock<FsState>,
    backup_root: Option<DirPath>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut state = FsState::default();
        state.ensure_dir(&DirPath::root());
        Self {
            state: RwLock::new(state),
            backup_root: None,
        }
    }

    pub fn with_backup_root(mut self, dir: DirPath) -> Self {
        self.state.get_mut().ensure_dir(&dir);
        self.backup_root = Some(dir);
        self
    }

    pub fn create_dir(&self, dir: &DirPath) {
        self.state.write().ensure_dir(dir);
    }

    /// Forget the local copy of a file, leaving hosts as the only source
    pub fn remove_local(&self, path: &FilePath) -> bool {
        self.state
            .write()
            .files
            .get_mut(path)
            .is_some_and(|f| f.local.take().is_some())
    }

    pub fn file_count(&self) -> usize {
        self.state.read().files.len()
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RenterFs for MemoryFs {
    async fn list_dir(&self, dir: &DirPath) -> Result<DirListing> {
        let state = self.state.read();
        if !state.dirs.contains_key(dir) {
            return Err(Error::NotFound(dir.to_string()));
        }
        let dirs: BTreeSet<DirPath> = state
            .dirs
            .keys()
            .filter(|d| d.parent().as_ref() == Some(dir))
            .cloned()
            .collect();
        let files = state
            .files
            .keys()
            .filter(|f| f.dir() == dir)
            .cloned()
            .collect();
        Ok(DirListing {
            dirs: dirs.into_iter().collect(),
            files,
        })
    }

    async fn dir_metadata(&self, dir: &DirPath) -> Result<DirMetadata> {
        self.state
            .read()
            .dirs
            .get(dir)
            .cloned()
            .ok_or_else(|| Error::NotFound(dir.to_string()))
    }

    async fn update_dir_metadata(&self, dir: &DirPath, metadata: DirMetadata) -> Result<()> {
        let mut state = self.state.write();
        let slot = state
            .dirs
            .get_mut(dir)
            .ok_or_else(|| Error::NotFound(dir.to_string()))?;
        *slot = metadata;
        Ok(())
    }

    async fn file(&self, path: &FilePath) -> Result<FileSnapshot> {
        self.state
            .read()
            .files
            .get(path)
            .map(|f| f.snapshot.clone())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn create_file(&self, file: FileSnapshot, local: Option<Bytes>) -> Result<()> {
        let mut state = self.state.write();
        state.ensure_dir(file.path.dir());
        state.files.insert(
            file.path.clone(),
            StoredFile {
                snapshot: file,
                local,
            },
        );
        Ok(())
    }

    async fn set_chunk_stuck(&self, chunk: &ChunkId, stuck: bool) -> Result<()> {
        self.state.write().chunk_mut(chunk)?.stuck = stuck;
        Ok(())
    }

    async fn add_pieces(&self, chunk: &ChunkId, pieces: &[PieceLocation]) -> Result<()> {
        let mut state = self.state.write();
        let snapshot = state.chunk_mut(chunk)?;
        for piece in pieces {
            if !snapshot.pieces.contains(piece) {
                snapshot.pieces.push(*piece);
            }
        }
        Ok(())
    }

    async fn read_local_chunk(&self, chunk: &ChunkId) -> Result<Option<Bytes>> {
        let state = self.state.read();
        let file = state
            .files
            .get(&chunk.file)
            .ok_or_else(|| Error::NotFound(chunk.file.to_string()))?;
        let Some(local) = &file.local else {
            return Ok(None);
        };
        let start = chunk.index.saturating_mul(file.snapshot.chunk_size) as usize;
        let len = file.snapshot.chunk_len(chunk.index) as usize;
        Ok(local.get(start..start + len).map(|_| local.slice(start..start + len)))
    }

    fn backup_root(&self) -> Option<DirPath> {
        self.backup_root.clone()
    }
}
