//! Identifiers shared across the engine

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::host::{HostKey, PieceRoot};

/// Scheduling priority for downloads, uploads and memory admission
///
/// Higher variants are served first by workers. `High` and above also
/// jump the memory manager's normal queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Repair traffic
    Background,
    /// Ordinary user requests
    #[default]
    Normal,
    /// Latency-sensitive user requests (streaming)
    High,
}

impl Priority {
    /// Whether memory for this request is admitted ahead of normal waiters
    pub fn is_memory_priority(self) -> bool {
        self >= Priority::High
    }
}

/// A directory in the renter's filesystem, relative to the root
///
/// The root is the empty path. Components are separated by `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirPath(String);

impl DirPath {
    /// The filesystem root
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Build a path, ignoring leading, trailing and repeated separators
    pub fn new(path: impl AsRef<str>) -> Self {
        let parts: Vec<&str> = path
            .as_ref()
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();
        Self(parts.join("/"))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Parent directory, `None` for the root
    pub fn parent(&self) -> Option<DirPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Child directory `name`
    pub fn join(&self, name: &str) -> DirPath {
        if self.is_root() {
            Self::new(name)
        } else {
            Self::new(format!("{}/{}", self.0, name))
        }
    }

    /// Whether `self` is `other` or lies beneath it
    pub fn is_within(&self, other: &DirPath) -> bool {
        other.is_root()
            || self.0 == other.0
            || (self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DirPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

/// A file: its directory plus a name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilePath {
    dir: DirPath,
    name: String,
}

impl FilePath {
    pub fn new(dir: DirPath, name: impl Into<String>) -> Self {
        Self {
            dir,
            name: name.into(),
        }
    }

    /// Parse `a/b/name`; the last component is the file name
    pub fn parse(path: &str) -> Option<Self> {
        let full = DirPath::new(path);
        if full.is_root() {
            return None;
        }
        let name = full.as_str().rsplit('/').next()?.to_string();
        let dir = full.parent()?;
        Some(Self { dir, name })
    }

    pub fn dir(&self) -> &DirPath {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dir.is_root() {
            write!(f, "/{}", self.name)
        } else {
            write!(f, "{}/{}", self.dir, self.name)
        }
    }
}

/// A chunk of a file, by position
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    pub file: FilePath,
    pub index: u64,
}

impl ChunkId {
    pub fn new(file: FilePath, index: u64) -> Self {
        Self { file, index }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file, self.index)
    }
}

/// Where one piece of a chunk is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceLocation {
    /// Piece index within the chunk (0..n)
    pub index: usize,
    pub host: HostKey,
    pub root: PieceRoot,
}
