//! Directory health propagation
//!
//! A bubble recomputes one directory's [`DirMetadata`] from its files and
//! its children's metadata, then queues the parent, up to the root. At
//! most one bubble per directory runs at a time: asking for a bubble while
//! one is active leaves a pending marker, and the active bubble runs once
//! more before handing off to the parent.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use renter_telemetry::LogContext;
use tokio::sync::watch;
use tracing::{debug, trace, warn, Instrument};

use crate::error::Result;
use crate::fs::{DirMetadata, RenterFs};
use crate::health::{file_health, summarize_dir};
use crate::metrics::RenterMetrics;
use crate::pool::WorkerPool;
use crate::types::DirPath;

use super::LoopSignals;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BubbleStatus {
    Active,
    Pending,
}

struct Inner {
    fs: Arc<dyn RenterFs>,
    pool: Arc<WorkerPool>,
    signals: Arc<LoopSignals>,
    metrics: Arc<RenterMetrics>,
    repair_threshold: f64,
    status: Mutex<HashMap<DirPath, BubbleStatus>>,
    /// Number of directories with an active bubble
    tracked: watch::Sender<usize>,
}

#[derive(Clone)]
pub struct Bubbler {
    inner: Arc<Inner>,
}

impl Bubbler {
    pub fn new(
        fs: Arc<dyn RenterFs>,
        pool: Arc<WorkerPool>,
        signals: Arc<LoopSignals>,
        metrics: Arc<RenterMetrics>,
        repair_threshold: f64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fs,
                pool,
                signals,
                metrics,
                repair_threshold,
                status: Mutex::new(HashMap::new()),
                tracked: watch::channel(0).0,
            }),
        }
    }

    /// Bubble `dir` and then its ancestors in the background
    pub fn queue(&self, dir: DirPath) {
        if !self.claim(&dir) {
            return;
        }
        let bubbler = self.clone();
        let span = LogContext::new("bubble").with_dir(&dir).span();
        tokio::spawn(
            async move {
                bubbler.run_claimed(&dir, true).await;
            }
            .instrument(span),
        );
    }

    /// Bubble `dir` now, without touching its parent
    ///
    /// If a bubble for `dir` is already active it is marked pending, and
    /// this waits until that bubble has run again and released `dir`.
    pub async fn bubble_exclusive(&self, dir: &DirPath) {
        if self.claim(dir) {
            self.run_claimed(dir, false).await;
            return;
        }
        let mut rx = self.inner.tracked.subscribe();
        while self.is_tracked(dir) {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once no bubble is active or pending
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.tracked.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.tracked.borrow() == 0
    }

    fn is_tracked(&self, dir: &DirPath) -> bool {
        self.inner.status.lock().contains_key(dir)
    }

    /// Mark `dir` active; false if a bubble already owns it
    fn claim(&self, dir: &DirPath) -> bool {
        let mut status = self.inner.status.lock();
        match status.get_mut(dir) {
            Some(state) => {
                *state = BubbleStatus::Pending;
                trace!(dir = %dir, "Bubble pending");
                false
            }
            None => {
                status.insert(dir.clone(), BubbleStatus::Active);
                self.inner.tracked.send_replace(status.len());
                true
            }
        }
    }

    /// Bubble until no pending marker was left behind, then drop the claim
    ///
    /// The parent is claimed before `dir` is released so the bubbler never
    /// looks idle halfway up the tree.
    async fn run_claimed(&self, dir: &DirPath, propagate: bool) {
        loop {
            match self.bubble_once(dir).await {
                Ok(meta) => {
                    if dir.is_root() {
                        self.signal_from_root(&meta);
                    }
                }
                Err(e) => warn!(dir = %dir, error = %e, "Bubble failed"),
            }
            if propagate {
                if let Some(parent) = dir.parent() {
                    self.queue(parent);
                }
            }

            let mut status = self.inner.status.lock();
            if status.get(dir) == Some(&BubbleStatus::Pending) {
                status.insert(dir.clone(), BubbleStatus::Active);
                continue;
            }
            status.remove(dir);
            self.inner.tracked.send_replace(status.len());
            return;
        }
    }

    async fn bubble_once(&self, dir: &DirPath) -> Result<DirMetadata> {
        let fs = &self.inner.fs;
        let listing = fs.list_dir(dir).await?;
        let view = self.inner.pool.host_view();

        let mut files = Vec::with_capacity(listing.files.len());
        for path in &listing.files {
            match fs.file(path).await {
                Ok(file) => files.push(file_health(&file, &view)),
                Err(e) => debug!(file = %path, error = %e, "Skipping file in bubble"),
            }
        }
        let mut children = Vec::with_capacity(listing.dirs.len());
        for child in &listing.dirs {
            children.push(fs.dir_metadata(child).await?);
        }

        let meta = summarize_dir(&files, &children, Utc::now());
        fs.update_dir_metadata(dir, meta.clone()).await?;
        self.inner.metrics.record_bubble();
        trace!(
            dir = %dir,
            health = meta.health,
            aggregate_health = meta.aggregate_health,
            "Bubbled directory"
        );
        Ok(meta)
    }

    fn signal_from_root(&self, meta: &DirMetadata) {
        if meta.aggregate_health >= self.inner.repair_threshold && meta.aggregate_health > 0.0 {
            debug!(aggregate_health = meta.aggregate_health, "Root needs repair");
            self.inner.signals.repair.notify_one();
        }
        if meta.aggregate_num_stuck_chunks > 0 {
            self.inner.signals.stuck.notify_one();
        }
    }
}
