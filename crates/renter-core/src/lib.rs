//! Client-side engine of a decentralized storage renter
//!
//! Files are erasure coded into pieces that live on many independent,
//! unreliable hosts. This crate moves those pieces and keeps them healthy:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  HealthLoop ──bubble──▶ DirMetadata ──▶ RepairLoop ◀── StuckLoop  │
//! │                                              │                   │
//! │                                     UploadHeap (priority)        │
//! │                                              │                   │
//! │  request_download ──▶ Downloader    Uploader ◀┘                  │
//! │                           │   MemoryManager   │                  │
//! │                           └──────┐    ┌───────┘                  │
//! │                              WorkerPool (one Worker per host)    │
//! │                                  │                               │
//! │                     HostConnection::{read,write,has}_piece       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Collaborators are abstract: hosts come in as [`UsableHost`]s with a
//! [`HostConnection`], persistence is a [`RenterFs`]. [`MemoryHost`] and
//! [`MemoryFs`] are in-memory implementations for simulation and tests.

pub mod config;
pub mod download;
pub mod error;
pub mod fs;
pub mod health;
pub mod heap;
pub mod host;
pub mod loops;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod renter;
pub mod stuck;
pub mod types;
pub mod upload;
pub mod worker;

pub use config::{ConfigError, RenterConfig};
pub use download::{
    ChunkLayout, DownloadHandle, DownloadRequest, DownloadStats, Downloader, WorkerFilter,
};
pub use error::{Error, Result};
pub use fs::{ChunkSnapshot, DirListing, DirMetadata, FileSnapshot, MemoryFs, RenterFs};
pub use health::{FileHealth, HostView};
pub use heap::{DirectoryHeap, HeapClass, UploadHeap};
pub use host::{ContractTerms, HostConnection, HostKey, MemoryHost, PieceRoot, UsableHost};
pub use loops::bubble::Bubbler;
pub use loops::LoopSignals;
pub use memory::{MemoryGuard, MemoryManager};
pub use metrics::{RenterMetrics, RenterStats};
pub use pool::{ReconcileReport, WorkerPool};
pub use renter::Renter;
pub use stuck::StuckStack;
pub use types::{ChunkId, DirPath, FilePath, PieceLocation, Priority};
pub use upload::{UploadHandle, UploadOutcome, UploadRequest, UploadSource, UploadStats, Uploader};
pub use worker::{Worker, WorkerPhase, WorkerStatus};

/// Tracing target for actionable repair outcomes
///
/// Only stuck chunks, permanently lost files and repaired stuck chunks are
/// logged here. Transient piece failures stay on the module targets.
pub const REPAIR_LOG_TARGET: &str = "renter::repair";
