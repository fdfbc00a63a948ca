//! One worker per usable host
//!
//! A worker owns typed job queues and a loop that checks them in a fixed
//! order: downloads, then uploads, then maintenance checks. Each iteration
//! starts at most one job and then restarts the check from the top, so a
//! steady stream of downloads can starve uploads.
//!
//! Uploads are *serial*: they revise the host's file contract, and only one
//! may be in flight per worker. Downloads and checks are *async* and run
//! alongside it, up to `max_async_jobs`.
//!
//! Killing a worker drains every queue and fails each job, and makes any
//! in-flight host call return [`Error::WorkerKilled`].

mod jobs;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use renter_telemetry::LogContext;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, info, trace, Instrument};

use crate::config::WorkerConfig;
use crate::download::chunk::{Assignment, DownloadChunk};
use crate::error::{Error, Result};
use crate::host::{ContractTerms, HostConnection, HostKey, PieceRoot, UsableHost};
use crate::metrics::RenterMetrics;
use crate::types::Priority;
use crate::upload::chunk::{UploadAssignment, UploadChunk};

use jobs::{DownloadJob, HasPieceJob, Job, JobQueues, UploadJob};

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    /// Nothing runnable
    Idle,
    /// Scanning queues
    Checking,
    /// At least one job in flight
    Executing,
    /// Terminal
    Killed,
}

/// Observability snapshot of a worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub host: HostKey,
    pub phase: WorkerPhase,
    pub contract_version: u64,
    pub download_queue: usize,
    pub upload_queue: usize,
    pub maintenance_queue: usize,
    pub serial_busy: bool,
    pub async_in_flight: usize,
    pub killed: bool,
    /// Remaining upload cooldown
    pub upload_cooldown: Option<Duration>,
    pub consecutive_upload_failures: u32,
    pub recent_download_failures: u32,
    pub read_latency: Option<Duration>,
}

/// What a download chunk needs to know to accept or decline a worker
#[derive(Debug, Clone, Copy)]
pub(crate) struct DownloadProfile {
    pub good_for_download: bool,
    pub latency: Option<Duration>,
    pub recent_failures: u32,
    pub price: u64,
}

struct WorkerState {
    terms: ContractTerms,
    phase: WorkerPhase,
    started: bool,
    killed: bool,
    queues: JobQueues,
    serial_in_flight: bool,
    async_in_flight: usize,
    consecutive_upload_failures: u32,
    upload_cooldown_until: Option<Instant>,
    recent_download_failures: u32,
    latency_ema: Option<Duration>,
}

impl WorkerState {
    fn busy(&self) -> bool {
        self.serial_in_flight || self.async_in_flight > 0
    }

    fn on_upload_cooldown(&self) -> bool {
        self.upload_cooldown_until
            .is_some_and(|until| Instant::now() < until)
    }
}

struct WorkerInner {
    key: HostKey,
    connection: Arc<dyn HostConnection>,
    config: WorkerConfig,
    state: Mutex<WorkerState>,
    wake: Notify,
    killed_tx: watch::Sender<bool>,
    metrics: Arc<RenterMetrics>,
}

enum NextJob {
    Run(Job),
    Idle,
    Killed,
}

/// Handle to a host's worker; clones share the same worker
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Create a worker; it runs nothing until [`start`](Self::start)
    pub fn new(host: &UsableHost, config: WorkerConfig, metrics: Arc<RenterMetrics>) -> Self {
        let (killed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(WorkerInner {
                key: host.key,
                connection: host.connection.clone(),
                config,
                state: Mutex::new(WorkerState {
                    terms: host.terms.clone(),
                    phase: WorkerPhase::Idle,
                    started: false,
                    killed: false,
                    queues: JobQueues::new(),
                    serial_in_flight: false,
                    async_in_flight: 0,
                    consecutive_upload_failures: 0,
                    upload_cooldown_until: None,
                    recent_download_failures: 0,
                    latency_ema: None,
                }),
                wake: Notify::new(),
                killed_tx,
                metrics,
            }),
        }
    }

    /// Spawn the worker loop; later calls do nothing
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.started || state.killed {
                return;
            }
            state.started = true;
        }
        let span = LogContext::new("worker").with_host(self.inner.key).span();
        tokio::spawn(self.clone().run().instrument(span));
    }

    pub fn key(&self) -> HostKey {
        self.inner.key
    }

    pub fn terms(&self) -> ContractTerms {
        self.inner.state.lock().terms.clone()
    }

    pub fn is_killed(&self) -> bool {
        self.inner.state.lock().killed
    }

    pub fn status(&self) -> WorkerStatus {
        let state = self.inner.state.lock();
        let now = Instant::now();
        WorkerStatus {
            host: self.inner.key,
            phase: state.phase,
            contract_version: state.terms.version,
            download_queue: state.queues.download.len(),
            upload_queue: state.queues.upload.len(),
            maintenance_queue: state.queues.has_piece.len(),
            serial_busy: state.serial_in_flight,
            async_in_flight: state.async_in_flight,
            killed: state.killed,
            upload_cooldown: state
                .upload_cooldown_until
                .filter(|until| *until > now)
                .map(|until| until - now),
            consecutive_upload_failures: state.consecutive_upload_failures,
            recent_download_failures: state.recent_download_failures,
            read_latency: state.latency_ema,
        }
    }

    /// Replace the contract terms, keeping queued work
    ///
    /// A host that is no longer good for anything is killed instead.
    pub fn on_usable_set_change(&self, terms: ContractTerms) {
        if !terms.is_usable() {
            self.kill();
            return;
        }
        let mut state = self.inner.state.lock();
        if state.killed {
            return;
        }
        debug!(host = %self.inner.key, version = terms.version, "Contract terms updated");
        state.terms = terms;
        drop(state);
        self.inner.wake.notify_one();
    }

    /// Tear the worker down; every queued job fails with `WorkerKilled`
    pub fn kill(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            if state.killed {
                return;
            }
            state.killed = true;
            state.phase = WorkerPhase::Killed;
            state.queues.drain_all()
        };
        self.inner.killed_tx.send_replace(true);
        self.inner.wake.notify_one();
        info!(host = %self.inner.key, failed_jobs = drained.len(), "Worker killed");
        for job in drained {
            job.fail_killed(self.inner.key);
        }
    }

    pub(crate) fn queue_download(&self, chunk: Arc<DownloadChunk>) -> Result<()> {
        let priority = chunk.priority();
        self.push(|queues| queues.download.push(priority, DownloadJob { chunk }))
    }

    pub(crate) fn queue_upload(&self, chunk: Arc<UploadChunk>) -> Result<()> {
        let priority = chunk.priority();
        self.push(|queues| queues.upload.push(priority, UploadJob { chunk }))
    }

    /// Queue a piece check; the receiver resolves with the answer or `WorkerKilled`
    pub fn queue_has_piece(
        &self,
        root: PieceRoot,
        priority: Priority,
    ) -> Result<oneshot::Receiver<Result<bool>>> {
        let (reply, rx) = oneshot::channel();
        self.push(|queues| queues.has_piece.push(priority, HasPieceJob { root, reply }))?;
        Ok(rx)
    }

    /// Ask the host whether it still stores `root`
    pub async fn has_piece(&self, root: PieceRoot) -> Result<bool> {
        let rx = self.queue_has_piece(root, Priority::Normal)?;
        rx.await
            .unwrap_or_else(|_| Err(Error::WorkerKilled(self.inner.key)))
    }

    fn push(&self, f: impl FnOnce(&mut JobQueues)) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.killed {
                return Err(Error::WorkerKilled(self.inner.key));
            }
            f(&mut state.queues);
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    pub(crate) fn download_profile(&self) -> DownloadProfile {
        let state = self.inner.state.lock();
        DownloadProfile {
            good_for_download: state.terms.good_for_download && !state.killed,
            latency: state.latency_ema,
            recent_failures: state.recent_download_failures,
            price: state.terms.download_price,
        }
    }

    /// Whether the worker takes new upload pieces right now
    pub(crate) fn upload_eligible(&self) -> bool {
        let state = self.inner.state.lock();
        state.terms.good_for_upload && !state.killed && !state.on_upload_cooldown()
    }

    async fn run(self) {
        let mut killed_rx = self.inner.killed_tx.subscribe();
        info!(host = %self.inner.key, "Worker started");
        loop {
            match self.next_job() {
                NextJob::Killed => break,
                NextJob::Run(job) => {
                    self.spawn_job(job);
                    continue;
                }
                NextJob::Idle => {}
            }
            tokio::select! {
                _ = self.inner.wake.notified() => {}
                _ = killed_rx.wait_for(|killed| *killed) => break,
            }
        }
        debug!(host = %self.inner.key, "Worker loop exited");
    }

    /// Pick the first runnable job in fixed priority order
    fn next_job(&self) -> NextJob {
        let mut state = self.inner.state.lock();
        if state.killed {
            return NextJob::Killed;
        }
        state.phase = WorkerPhase::Checking;
        let async_free = state.async_in_flight < self.inner.config.max_async_jobs;

        let job = if async_free && !state.queues.download.is_empty() {
            state.async_in_flight += 1;
            state.queues.download.pop().map(Job::Download)
        } else if !state.serial_in_flight && !state.queues.upload.is_empty() {
            state.serial_in_flight = true;
            state.queues.upload.pop().map(Job::Upload)
        } else if async_free && !state.queues.has_piece.is_empty() {
            state.async_in_flight += 1;
            state.queues.has_piece.pop().map(Job::HasPiece)
        } else {
            None
        };

        state.phase = if job.is_some() || state.busy() {
            WorkerPhase::Executing
        } else {
            WorkerPhase::Idle
        };
        match job {
            Some(job) => NextJob::Run(job),
            None => NextJob::Idle,
        }
    }

    fn spawn_job(&self, job: Job) {
        let worker = self.clone();
        let serial = job.is_serial();
        tokio::spawn(async move {
            worker.execute(job).await;
            worker.finish_job(serial);
        });
    }

    fn finish_job(&self, serial: bool) {
        {
            let mut state = self.inner.state.lock();
            if serial {
                state.serial_in_flight = false;
            } else {
                state.async_in_flight = state.async_in_flight.saturating_sub(1);
            }
            if !state.killed && !state.busy() {
                state.phase = WorkerPhase::Idle;
            }
        }
        self.inner.wake.notify_one();
    }

    async fn execute(&self, job: Job) {
        match job {
            Job::Download(job) => self.execute_download(job).await,
            Job::Upload(job) => self.execute_upload(job).await,
            Job::HasPiece(job) => {
                let result = self
                    .until_killed(self.inner.connection.has_piece(job.root))
                    .await;
                let _ = job.reply.send(result);
            }
        }
    }

    async fn execute_download(&self, job: DownloadJob) {
        let chunk = job.chunk;
        let Assignment::Fetch { piece, root } = chunk.assign(self) else {
            return;
        };
        trace!(host = %self.inner.key, chunk = %chunk.id(), piece, "Fetching piece");
        let started = Instant::now();
        match self.until_killed(self.inner.connection.read_piece(root)).await {
            Ok(data) => {
                self.record_download_success(started.elapsed());
                chunk.piece_completed(self.inner.key, piece, data);
            }
            Err(err) => {
                if !err.is_worker_killed() {
                    self.record_download_failure();
                }
                chunk.piece_failed(self.inner.key, piece, &err);
            }
        }
    }

    async fn execute_upload(&self, job: UploadJob) {
        let chunk = job.chunk;
        let UploadAssignment::Upload { piece, data } = chunk.assign(self) else {
            return;
        };
        trace!(host = %self.inner.key, chunk = %chunk.label(), piece, "Uploading piece");
        match self.until_killed(self.inner.connection.write_piece(data)).await {
            Ok(root) => {
                self.record_upload_success();
                chunk.piece_uploaded(self.inner.key, piece, root);
            }
            Err(err) => {
                if !err.is_worker_killed() {
                    self.record_upload_failure();
                }
                chunk.piece_failed(self.inner.key, piece, &err);
            }
        }
    }

    /// Race host I/O against the kill signal
    async fn until_killed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let mut killed_rx = self.inner.killed_tx.subscribe();
        tokio::select! {
            result = fut => result,
            _ = killed_rx.wait_for(|killed| *killed) => Err(Error::WorkerKilled(self.inner.key)),
        }
    }

    fn record_download_success(&self, elapsed: Duration) {
        self.inner.metrics.record_piece_fetched();
        let alpha = self.inner.config.latency_ema_alpha;
        let mut state = self.inner.state.lock();
        state.latency_ema = Some(match state.latency_ema {
            Some(ema) => ema.mul_f64(1.0 - alpha) + elapsed.mul_f64(alpha),
            None => elapsed,
        });
        state.recent_download_failures /= 2;
    }

    fn record_download_failure(&self) {
        self.inner.metrics.record_piece_fetch_failed();
        let mut state = self.inner.state.lock();
        state.recent_download_failures = state.recent_download_failures.saturating_add(1);
    }

    fn record_upload_success(&self) {
        self.inner.metrics.record_piece_uploaded();
        let mut state = self.inner.state.lock();
        state.consecutive_upload_failures = 0;
        state.upload_cooldown_until = None;
    }

    fn record_upload_failure(&self) {
        self.inner.metrics.record_piece_upload_failed();
        let config = &self.inner.config;
        let mut state = self.inner.state.lock();
        state.consecutive_upload_failures = state.consecutive_upload_failures.saturating_add(1);
        let failures = state.consecutive_upload_failures;
        if failures >= config.upload_failure_cooldown_threshold {
            let doublings = (failures - config.upload_failure_cooldown_threshold).min(16);
            let cooldown = config
                .upload_cooldown_base()
                .saturating_mul(1 << doublings)
                .min(config.upload_cooldown_max());
            debug!(host = %self.inner.key, failures, ?cooldown, "Worker on upload cooldown");
            state.upload_cooldown_until = Some(Instant::now() + cooldown);
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("host", &self.inner.key)
            .finish_non_exhaustive()
    }
}
