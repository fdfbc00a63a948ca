//! Job kinds and per-kind queues

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::download::chunk::DownloadChunk;
use crate::error::{Error, Result};
use crate::host::{HostKey, PieceRoot};
use crate::types::Priority;
use crate::upload::chunk::UploadChunk;

/// Fetch one piece of a download chunk, if the worker can contribute
pub(crate) struct DownloadJob {
    pub chunk: Arc<DownloadChunk>,
}

/// Store one piece of an upload chunk; serial, it revises the contract
pub(crate) struct UploadJob {
    pub chunk: Arc<UploadChunk>,
}

/// Maintenance check: does the host still hold a piece
pub(crate) struct HasPieceJob {
    pub root: PieceRoot,
    pub reply: oneshot::Sender<Result<bool>>,
}

pub(crate) enum Job {
    Download(DownloadJob),
    Upload(UploadJob),
    HasPiece(HasPieceJob),
}

impl Job {
    /// Serial jobs need exclusive use of the contract revision
    pub fn is_serial(&self) -> bool {
        matches!(self, Job::Upload(_))
    }

    /// Resolve a job the worker will never run
    pub fn fail_killed(self, host: HostKey) {
        match self {
            Job::Download(job) => job.chunk.remove_worker(host),
            Job::Upload(job) => job.chunk.remove_worker(host),
            Job::HasPiece(job) => {
                let _ = job.reply.send(Err(Error::WorkerKilled(host)));
            }
        }
    }
}

struct Queued<T> {
    priority: Priority,
    seq: u64,
    job: T,
}

impl<T> PartialEq for Queued<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Queued<T> {}

impl<T> PartialOrd for Queued<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Queued<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Highest priority first, FIFO among equals
pub(crate) struct JobQueue<T> {
    heap: BinaryHeap<Queued<T>>,
    next_seq: u64,
}

impl<T> JobQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, priority: Priority, job: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Queued { priority, seq, job });
    }

    pub fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|q| q.job)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.heap.drain().map(|q| q.job)
    }
}

/// All of a worker's queues, checked in declaration order
pub(crate) struct JobQueues {
    pub download: JobQueue<DownloadJob>,
    pub upload: JobQueue<UploadJob>,
    pub has_piece: JobQueue<HasPieceJob>,
}

impl JobQueues {
    pub fn new() -> Self {
        Self {
            download: JobQueue::new(),
            upload: JobQueue::new(),
            has_piece: JobQueue::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.download.len() + self.upload.len() + self.has_piece.len()
    }

    /// Remove every queued job
    pub fn drain_all(&mut self) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(self.len());
        jobs.extend(self.download.drain().map(Job::Download));
        jobs.extend(self.upload.drain().map(Job::Upload));
        jobs.extend(self.has_piece.drain().map(Job::HasPiece));
        jobs
    }
}
