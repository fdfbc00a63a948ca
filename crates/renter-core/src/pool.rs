//! The set of live workers, one per usable host
//!
//! [`WorkerPool::reconcile`] diffs the pool against the usable host list
//! under the write lock, so readers of [`WorkerPool::workers`] always see
//! either the old or the new set. Removed workers are killed after the
//! lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::health::HostView;
use crate::host::{HostKey, UsableHost};
use crate::metrics::RenterMetrics;
use crate::worker::{Worker, WorkerStatus};

/// What a reconcile changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub created: Vec<HostKey>,
    pub removed: Vec<HostKey>,
    pub updated: Vec<HostKey>,
    pub unchanged: usize,
}

impl ReconcileReport {
    /// No worker was created, removed or updated
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

pub struct WorkerPool {
    workers: RwLock<HashMap<HostKey, Worker>>,
    config: WorkerConfig,
    metrics: Arc<RenterMetrics>,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig, metrics: Arc<RenterMetrics>) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            config,
            metrics,
        }
    }

    /// Bring the pool in line with `hosts`
    ///
    /// Hosts good for neither upload nor download count as unusable. A
    /// worker found killed is replaced. Calling this twice with the same
    /// list changes nothing the second time.
    pub fn reconcile(&self, hosts: &[UsableHost]) -> ReconcileReport {
        let wanted: HashMap<HostKey, &UsableHost> = hosts
            .iter()
            .filter(|host| host.terms.is_usable())
            .map(|host| (host.key, host))
            .collect();

        let mut report = ReconcileReport::default();
        let mut removed = Vec::new();
        {
            let mut workers = self.workers.write();
            workers.retain(|key, worker| {
                let keep = wanted.contains_key(key) && !worker.is_killed();
                if !keep {
                    removed.push(worker.clone());
                }
                keep
            });

            for (key, host) in &wanted {
                match workers.get(key) {
                    Some(worker) => {
                        if worker.terms() != host.terms {
                            worker.on_usable_set_change(host.terms.clone());
                            report.updated.push(*key);
                        } else {
                            report.unchanged += 1;
                        }
                    }
                    None => {
                        let worker = Worker::new(host, self.config.clone(), self.metrics.clone());
                        worker.start();
                        workers.insert(*key, worker);
                        self.metrics.record_worker_created();
                        report.created.push(*key);
                    }
                }
            }
        }

        for worker in removed {
            worker.kill();
            self.metrics.record_worker_killed();
            report.removed.push(worker.key());
        }

        if !report.is_noop() {
            info!(
                created = report.created.len(),
                removed = report.removed.len(),
                updated = report.updated.len(),
                unchanged = report.unchanged,
                "Worker pool reconciled"
            );
        }
        report
    }

    /// The current worker for `key`
    ///
    /// It may be killed by a later reconcile at any time; a failed queue
    /// call on it is a normal outcome.
    pub fn worker(&self, key: &HostKey) -> Result<Worker> {
        self.workers
            .read()
            .get(key)
            .cloned()
            .ok_or(Error::WorkerNotFound(*key))
    }

    /// Point-in-time snapshot; the pool is not locked while it is used
    pub fn workers(&self) -> Vec<Worker> {
        self.workers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Terms of every host in the pool, for health computations
    pub fn host_view(&self) -> HostView {
        HostView::new(
            self.workers()
                .into_iter()
                .map(|worker| (worker.key(), worker.terms())),
        )
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.workers().iter().map(Worker::status).collect()
    }

    /// Kill and remove every worker
    pub fn kill_all(&self) {
        let workers: Vec<Worker> = self.workers.write().drain().map(|(_, w)| w).collect();
        for worker in workers {
            worker.kill();
            self.metrics.record_worker_killed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ContractTerms, MemoryHost, PieceRoot};
    use crate::types::Priority;

    fn hosts(seeds: &[u64]) -> Vec<UsableHost> {
        seeds
            .iter()
            .map(|seed| {
                let host = Arc::new(MemoryHost::new(HostKey::from_seed(*seed)));
                UsableHost::new(host.key(), ContractTerms::open(*seed), host)
            })
            .collect()
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(WorkerConfig::default(), Arc::new(RenterMetrics::new()))
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let pool = pool();
        let set = hosts(&[1, 2, 3]);

        let first = pool.reconcile(&set);
        assert_eq!(first.created.len(), 3);
        assert_eq!(pool.len(), 3);

        let second = pool.reconcile(&set);
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 3);
        assert_eq!(pool.metrics.stats().workers_created, 3);
        pool.kill_all();
    }

    #[tokio::test]
    async fn test_reconcile_removes_and_updates() {
        let pool = pool();
        let mut set = hosts(&[1, 2, 3]);
        pool.reconcile(&set);
        let dropped = pool.worker(&set[2].key).unwrap();

        set[0].terms.version = 2;
        set[1].terms.good_for_upload = false;
        set[1].terms.good_for_download = false;
        set.truncate(2);
        let report = pool.reconcile(&set);

        assert_eq!(report.updated, vec![set[0].key]);
        assert_eq!(report.removed.len(), 2);
        assert!(report.created.is_empty());
        assert_eq!(pool.len(), 1);
        assert!(dropped.is_killed());
        assert!(matches!(
            pool.worker(&set[1].key),
            Err(Error::WorkerNotFound(_))
        ));
        assert_eq!(pool.worker(&set[0].key).unwrap().terms().version, 2);
        pool.kill_all();
    }

    #[tokio::test]
    async fn test_snapshot_survives_reconcile() {
        let pool = pool();
        let set = hosts(&[1, 2]);
        pool.reconcile(&set);
        let snapshot = pool.workers();

        pool.reconcile(&[]);
        assert!(pool.is_empty());
        assert_eq!(snapshot.len(), 2);
        for worker in &snapshot {
            assert!(matches!(
                worker.queue_has_piece(PieceRoot::of(b"x"), Priority::Normal),
                Err(Error::WorkerKilled(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_killed_worker_replaced() {
        let pool = pool();
        let set = hosts(&[7]);
        pool.reconcile(&set);
        pool.worker(&set[0].key).unwrap().kill();

        let report = pool.reconcile(&set);
        assert_eq!(report.removed, vec![set[0].key]);
        assert_eq!(report.created, vec![set[0].key]);
        assert!(!pool.worker(&set[0].key).unwrap().is_killed());
        pool.kill_all();
    }

    #[tokio::test]
    async fn test_host_view() {
        let pool = pool();
        let mut set = hosts(&[1, 2]);
        set[1].terms.good_for_upload = false;
        pool.reconcile(&set);

        let view = pool.host_view();
        assert!(view.good_for_upload(&set[0].key));
        assert!(!view.good_for_upload(&set[1].key));
        assert!(view.good_for_download(&set[1].key));
        assert!(!view.good_for_download(&HostKey::from_seed(99)));
        pool.kill_all();
    }
}
