//! Health, repair and stuck loops
//!
//! Each loop is a long-lived task that sleeps on `select!` over shutdown,
//! its wake signal and a timer. They share one [`LoopContext`].

pub mod bubble;
pub(crate) mod health;
pub(crate) mod repair;
pub(crate) mod stuck;

use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::RenterConfig;
use crate::download::Downloader;
use crate::fs::RenterFs;
use crate::heap::UploadHeap;
use crate::memory::MemoryManager;
use crate::metrics::RenterMetrics;
use crate::pool::WorkerPool;
use crate::stuck::StuckStack;
use crate::types::ChunkId;
use crate::upload::Uploader;

use self::bubble::Bubbler;
use self::repair::RepairTask;

/// Wake-ups between loops; a notification sent while nobody waits is kept
#[derive(Debug, Default)]
pub struct LoopSignals {
    pub repair: Notify,
    pub stuck: Notify,
    pub health: Notify,
}

pub(crate) struct LoopContext {
    pub config: RenterConfig,
    pub fs: Arc<dyn RenterFs>,
    pub pool: Arc<WorkerPool>,
    pub downloader: Arc<Downloader>,
    pub uploader: Arc<Uploader>,
    pub repair_memory: MemoryManager,
    pub metrics: Arc<RenterMetrics>,
    pub signals: Arc<LoopSignals>,
    pub bubbler: Bubbler,
    pub heap: Mutex<UploadHeap<RepairTask>>,
    pub stuck_stack: Mutex<StuckStack>,
    /// Chunks found below 1x redundancy with no local copy; never retried
    pub lost: DashSet<ChunkId>,
}

impl LoopContext {
    pub fn new(config: RenterConfig, fs: Arc<dyn RenterFs>, metrics: Arc<RenterMetrics>) -> Arc<Self> {
        let pool = Arc::new(WorkerPool::new(config.worker.clone(), metrics.clone()));
        let downloader = Arc::new(Downloader::new(
            pool.clone(),
            MemoryManager::new("download", config.memory.download_budget),
            config.download.clone(),
            metrics.clone(),
        ));
        let uploader = Arc::new(Uploader::new(
            pool.clone(),
            MemoryManager::new("upload", config.memory.upload_budget),
            metrics.clone(),
        ));
        let signals = Arc::new(LoopSignals::default());
        let bubbler = Bubbler::new(
            fs.clone(),
            pool.clone(),
            signals.clone(),
            metrics.clone(),
            config.repair.threshold,
        );

        Arc::new(Self {
            repair_memory: MemoryManager::new("repair", config.memory.repair_budget),
            heap: Mutex::new(UploadHeap::new(config.repair.max_upload_heap_chunks)),
            stuck_stack: Mutex::new(StuckStack::new(config.stuck.max_successful_stuck_repair_files)),
            lost: DashSet::new(),
            config,
            fs,
            pool,
            downloader,
            uploader,
            metrics,
            signals,
            bubbler,
        })
    }
}
