//! The renter facade
//!
//! Owns the worker pool, the download and upload entry points, and the
//! three scheduling loops. Hosts come in through [`Renter::reconcile`];
//! everything else is driven by requests and the loops.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use renter_ec::ErasureScheme;
use renter_telemetry::LogContext;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::config::RenterConfig;
use crate::download::{ChunkLayout, DownloadHandle, DownloadRequest};
use crate::error::{Error, Result};
use crate::fs::{FileSnapshot, RenterFs};
use crate::health::{file_health, FileHealth};
use crate::host::UsableHost;
use crate::loops::{self, LoopContext};
use crate::metrics::{RenterMetrics, RenterStats};
use crate::pool::{ReconcileReport, WorkerPool};
use crate::types::{ChunkId, DirPath, FilePath};
use crate::upload::{UploadHandle, UploadRequest};

struct Lifecycle {
    running: bool,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Renter {
    ctx: Arc<LoopContext>,
    shutdown_tx: broadcast::Sender<()>,
    lifecycle: Mutex<Lifecycle>,
}

impl Renter {
    /// Build a stopped renter; no loop runs until [`Renter::start`]
    pub fn new(config: RenterConfig, fs: Arc<dyn RenterFs>) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            ctx: LoopContext::new(config, fs, Arc::new(RenterMetrics::new())),
            shutdown_tx,
            lifecycle: Mutex::new(Lifecycle {
                running: false,
                tasks: Vec::new(),
            }),
        })
    }

    /// Spawn the health, repair and stuck loops
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.running {
            return;
        }
        lifecycle.running = true;

        let ctx = &self.ctx;
        info!(
            health_interval = ?ctx.config.health.check_interval(),
            stuck_interval = ?ctx.config.stuck.interval(),
            repair_threshold = ctx.config.repair.threshold,
            "Starting renter"
        );
        lifecycle.tasks = vec![
            tokio::spawn(
                loops::health::run(ctx.clone(), self.shutdown_tx.subscribe())
                    .instrument(LogContext::new("health").span()),
            ),
            tokio::spawn(
                loops::repair::run(ctx.clone(), self.shutdown_tx.subscribe())
                    .instrument(LogContext::new("repair").span()),
            ),
            tokio::spawn(
                loops::stuck::run(ctx.clone(), self.shutdown_tx.subscribe())
                    .instrument(LogContext::new("stuck").span()),
            ),
        ];
        ctx.metrics.record_start();
        info!("Renter started");
    }

    /// Stop the loops and kill every worker
    pub async fn shutdown(&self) {
        let tasks = {
            let mut lifecycle = self.lifecycle.lock();
            if !lifecycle.running {
                return;
            }
            lifecycle.running = false;
            std::mem::take(&mut lifecycle.tasks)
        };
        info!("Stopping renter");

        let _ = self.shutdown_tx.send(());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Loop task failed");
            }
        }
        self.ctx.pool.kill_all();
        self.ctx.metrics.record_stop();
        info!("Renter stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().running
    }

    pub fn config(&self) -> &RenterConfig {
        &self.ctx.config
    }

    /// Bring the worker pool in line with the usable host set
    ///
    /// Any change wakes the health loop, since piece health depends on
    /// which hosts are usable.
    pub fn reconcile(&self, hosts: &[UsableHost]) -> ReconcileReport {
        let report = self.ctx.pool.reconcile(hosts);
        if !report.is_noop() {
            self.ctx.signals.health.notify_one();
        }
        report
    }

    pub async fn request_download(&self, request: DownloadRequest) -> Result<DownloadHandle> {
        self.ctx.downloader.request(request).await
    }

    /// Read `length` bytes of a file starting at `offset`
    pub async fn download_range(&self, path: &FilePath, offset: u64, length: u64) -> Result<Bytes> {
        let file = self.ctx.fs.file(path).await?;
        let end = offset.checked_add(length).filter(|end| *end <= file.size);
        let Some(end) = end.filter(|_| length > 0 && file.chunk_size > 0) else {
            return Err(Error::InvalidRequest(format!(
                "range {}+{} outside file of {} bytes",
                offset, length, file.size
            )));
        };

        let mut out = BytesMut::with_capacity(length as usize);
        let mut pos = offset;
        while pos < end {
            let index = pos / file.chunk_size;
            let chunk_start = index * file.chunk_size;
            let within = pos - chunk_start;
            let take = (end - pos).min(file.chunk_len(index) - within);
            let layout = ChunkLayout::from_file(&file, index)?;
            let request = DownloadRequest::range(layout, within as usize, take as usize);
            out.extend_from_slice(&self.request_download(request).await?.wait().await?);
            pos += take;
        }
        Ok(out.freeze())
    }

    /// Upload one chunk
    ///
    /// While the loops run the request is queued ahead of all repairs;
    /// otherwise it goes straight to the uploader.
    pub async fn request_upload(&self, request: UploadRequest) -> Result<UploadHandle> {
        if !self.is_running() {
            return self.ctx.uploader.request(request).await;
        }
        loops::repair::submit_streaming(&self.ctx, request)
            .await
            .unwrap_or(Err(Error::Shutdown))
    }

    /// Store a new file: record it, upload every chunk, record placements
    ///
    /// The data is kept as the file's local copy for later repairs.
    pub async fn upload_file(&self, path: FilePath, data: Bytes, scheme: ErasureScheme) -> Result<FileSnapshot> {
        if data.is_empty() {
            return Err(Error::InvalidRequest("file is empty".into()));
        }
        let file = FileSnapshot::new(path.clone(), scheme, self.ctx.config.upload.chunk_size, data.len() as u64);
        self.ctx.fs.create_file(file.clone(), Some(data.clone())).await?;

        let mut handles = Vec::with_capacity(file.chunks.len());
        for chunk in &file.chunks {
            let start = (chunk.index * file.chunk_size) as usize;
            let len = file.chunk_len(chunk.index) as usize;
            let id = file.chunk_id(chunk.index);
            let request = UploadRequest::new(data.slice(start..start + len), scheme).with_id(id.clone());
            handles.push((id, self.request_upload(request).await?));
        }

        let mut failed = None;
        for (id, handle) in handles {
            let outcome = handle.wait_outcome().await?;
            self.ctx.fs.add_pieces(&id, &outcome.new_placements).await?;
            if !outcome.is_available() && failed.is_none() {
                failed = Some(Error::InsufficientRedundancy {
                    needed: outcome.min_pieces,
                    available: outcome.pieces_confirmed,
                });
            }
        }
        debug!(file = %path, chunks = file.chunks.len(), "File uploaded");
        if self.is_running() {
            self.ctx.bubbler.queue(path.dir().clone());
        }
        match failed {
            Some(e) => Err(e),
            None => self.ctx.fs.file(&path).await,
        }
    }

    pub fn notify_repair_needed(&self) {
        self.ctx.signals.repair.notify_one();
    }

    pub fn notify_stuck_chunk_found(&self) {
        self.ctx.signals.stuck.notify_one();
    }

    /// Recompute health for the whole tree now
    pub async fn check_health(&self) -> Result<()> {
        self.ctx.bubbler.wait_idle().await;
        loops::health::check_tree(&self.ctx, &DirPath::root()).await
    }

    /// Current health of one file against the live worker pool
    pub async fn file_health(&self, path: &FilePath) -> Result<FileHealth> {
        let file = self.ctx.fs.file(path).await?;
        Ok(file_health(&file, &self.ctx.pool.host_view()))
    }

    /// Chunks given up as permanently lost
    pub fn lost_chunks(&self) -> Vec<ChunkId> {
        self.ctx.lost.iter().map(|id| id.key().clone()).collect()
    }

    pub fn metrics(&self) -> Arc<RenterMetrics> {
        self.ctx.metrics.clone()
    }

    pub fn stats(&self) -> RenterStats {
        self.ctx.metrics.stats()
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.ctx.pool
    }

    pub fn fs(&self) -> &Arc<dyn RenterFs> {
        &self.ctx.fs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use crate::host::{ContractTerms, HostKey, MemoryHost};

    fn config() -> RenterConfig {
        let mut config = RenterConfig::default();
        config.upload.chunk_size = 64;
        config
    }

    fn hosts(count: u64) -> Vec<UsableHost> {
        (0..count)
            .map(|i| {
                let host = Arc::new(MemoryHost::new(HostKey::from_seed(3000 + i)));
                UsableHost::new(host.key(), ContractTerms::open(i), host)
            })
            .collect()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = config();
        config.memory.download_budget = 0;
        assert!(matches!(
            Renter::new(config, Arc::new(MemoryFs::new())),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_upload_and_download_range_without_loops() {
        let renter = Renter::new(config(), Arc::new(MemoryFs::new())).unwrap();
        renter.reconcile(&hosts(5));
        let data = Bytes::from((0..300u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
        let path = FilePath::parse("music/song").unwrap();

        let file = renter
            .upload_file(path.clone(), data.clone(), ErasureScheme::new(2, 3).unwrap())
            .await
            .unwrap();
        assert_eq!(file.chunks.len(), 5);
        assert!(file.chunks.iter().all(|c| c.pieces.len() == 5));

        let middle = renter.download_range(&path, 50, 200).await.unwrap();
        assert_eq!(&middle[..], &data[50..250]);
        let tail = renter.download_range(&path, 299, 1).await.unwrap();
        assert_eq!(&tail[..], &data[299..]);
        assert!(renter.download_range(&path, 250, 100).await.is_err());

        assert_eq!(renter.file_health(&path).await.unwrap().health, 0.0);
        renter.worker_pool().kill_all();
    }

    #[tokio::test]
    async fn test_start_and_shutdown_are_idempotent() {
        let renter = Renter::new(config(), Arc::new(MemoryFs::new())).unwrap();
        renter.start();
        renter.start();
        assert!(renter.is_running());
        renter.shutdown().await;
        renter.shutdown().await;
        assert!(!renter.is_running());
        assert!(renter.stats().uptime.is_none());
    }
}
