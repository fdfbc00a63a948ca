//! Shared state of one chunk being uploaded

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use renter_ec::ErasureScheme;
use tokio::sync::oneshot;
use tracing::debug;

use super::{UploadOutcome, UploadStats};
use crate::error::Error;
use crate::host::{HostKey, PieceRoot};
use crate::memory::MemoryGuard;
use crate::metrics::RenterMetrics;
use crate::types::{PieceLocation, Priority};
use crate::worker::Worker;

/// A worker's role for this chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UploadAssignment {
    Upload { piece: usize, data: Bytes },
    /// Every piece is taken but some are still in flight
    Standby,
    Unavailable,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceState {
    Pending,
    InFlight,
    Durable,
    /// Already stored before this upload started
    Existing,
}

struct UploadState {
    pieces: Vec<PieceState>,
    data: Vec<Option<Bytes>>,
    /// Hosts holding or receiving a piece; one piece per host
    used_hosts: HashSet<HostKey>,
    active: HashSet<HostKey>,
    standby: Vec<Worker>,
    recalled: HashSet<HostKey>,
    registered: usize,
    confirmed: usize,
    placements: Vec<PieceLocation>,
    memory: Option<MemoryGuard>,
    finished: bool,
    standby_recalls: usize,
}

#[derive(Default)]
struct Actions {
    recall: Vec<Worker>,
    finish: Option<UploadOutcome>,
}

pub(crate) struct UploadChunk {
    label: String,
    scheme: ErasureScheme,
    piece_size: usize,
    priority: Priority,
    excluded: HashSet<HostKey>,
    state: Mutex<UploadState>,
    completion: Mutex<Option<oneshot::Sender<UploadOutcome>>>,
    metrics: Arc<RenterMetrics>,
}

impl UploadChunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        label: String,
        scheme: ErasureScheme,
        pieces: Vec<Bytes>,
        existing: &[PieceLocation],
        excluded: HashSet<HostKey>,
        priority: Priority,
        memory: Option<MemoryGuard>,
        metrics: Arc<RenterMetrics>,
    ) -> (Arc<Self>, oneshot::Receiver<UploadOutcome>) {
        let n = scheme.num_pieces();
        let piece_size = pieces.first().map_or(0, Bytes::len);
        let mut state = UploadState {
            pieces: vec![PieceState::Pending; n],
            data: pieces.into_iter().map(Some).collect(),
            used_hosts: HashSet::new(),
            active: HashSet::new(),
            standby: Vec::new(),
            recalled: HashSet::new(),
            registered: 0,
            confirmed: 0,
            placements: Vec::new(),
            memory,
            finished: false,
            standby_recalls: 0,
        };
        for location in existing {
            let fresh = state.pieces.get(location.index) == Some(&PieceState::Pending);
            if fresh && state.used_hosts.insert(location.host) {
                state.pieces[location.index] = PieceState::Existing;
                state.data[location.index] = None;
                state.confirmed += 1;
            }
        }

        let (tx, rx) = oneshot::channel();
        let chunk = Arc::new(Self {
            label,
            scheme,
            piece_size,
            priority,
            excluded,
            state: Mutex::new(state),
            completion: Mutex::new(Some(tx)),
            metrics,
        });
        (chunk, rx)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn dispatch(self: &Arc<Self>, workers: &[Worker]) {
        self.state
            .lock()
            .active
            .extend(workers.iter().map(Worker::key));
        for worker in workers {
            if worker.queue_upload(self.clone()).is_err() {
                self.remove_worker(worker.key());
            }
        }
        self.update(|_| {});
    }

    pub fn assign(self: &Arc<Self>, worker: &Worker) -> UploadAssignment {
        let key = worker.key();
        let eligible = worker.upload_eligible();
        self.update(|st| {
            if !st.active.contains(&key) {
                return UploadAssignment::Finished;
            }
            st.recalled.remove(&key);
            if st.finished {
                st.active.remove(&key);
                return UploadAssignment::Finished;
            }
            if !eligible || self.excluded.contains(&key) || st.used_hosts.contains(&key) {
                st.active.remove(&key);
                return UploadAssignment::Unavailable;
            }
            let pending = st.pieces.iter().position(|p| *p == PieceState::Pending);
            match pending.and_then(|piece| st.data[piece].clone().map(|data| (piece, data))) {
                Some((piece, data)) => {
                    st.pieces[piece] = PieceState::InFlight;
                    st.used_hosts.insert(key);
                    st.registered += 1;
                    UploadAssignment::Upload { piece, data }
                }
                None if st.registered > 0 => {
                    st.standby.push(worker.clone());
                    UploadAssignment::Standby
                }
                None => {
                    st.active.remove(&key);
                    UploadAssignment::Finished
                }
            }
        })
    }

    pub fn piece_uploaded(self: &Arc<Self>, host: HostKey, piece: usize, root: PieceRoot) {
        let piece_size = self.piece_size as u64;
        self.update(|st| {
            st.active.remove(&host);
            st.registered = st.registered.saturating_sub(1);
            st.pieces[piece] = PieceState::Durable;
            st.data[piece] = None;
            st.confirmed += 1;
            st.placements.push(PieceLocation {
                index: piece,
                host,
                root,
            });
            if let Some(memory) = st.memory.as_mut() {
                memory.release(piece_size);
            }
        });
    }

    pub fn piece_failed(self: &Arc<Self>, host: HostKey, piece: usize, err: &Error) {
        debug!(chunk = %self.label, host = %host, piece, error = %err, "Piece upload failed");
        self.update(|st| {
            st.active.remove(&host);
            st.used_hosts.remove(&host);
            st.registered = st.registered.saturating_sub(1);
            st.pieces[piece] = PieceState::Pending;
        });
    }

    pub fn remove_worker(self: &Arc<Self>, host: HostKey) {
        self.update(|st| {
            st.recalled.remove(&host);
            st.standby.retain(|w| w.key() != host);
            st.active.remove(&host);
        });
    }

    pub fn stats(&self) -> UploadStats {
        let st = self.state.lock();
        UploadStats {
            pieces_confirmed: st.confirmed,
            pieces_in_flight: st.registered,
            standby: st.standby.len(),
            standby_recalls: st.standby_recalls,
            workers_remaining: st.active.len(),
            memory_held: st.memory.as_ref().map_or(0, MemoryGuard::remaining),
            finished: st.finished,
        }
    }

    fn update<T>(self: &Arc<Self>, f: impl FnOnce(&mut UploadState) -> T) -> T {
        let mut actions = Actions::default();
        let result = {
            let mut st = self.state.lock();
            let result = f(&mut st);
            self.cleanup(&mut st, &mut actions);
            result
        };
        for worker in actions.recall {
            if worker.queue_upload(self.clone()).is_err() {
                self.remove_worker(worker.key());
            }
        }
        if let Some(outcome) = actions.finish {
            self.finish(outcome);
        }
        result
    }

    fn cleanup(&self, st: &mut UploadState, actions: &mut Actions) {
        if st.finished {
            return;
        }
        let pending = st
            .pieces
            .iter()
            .filter(|p| **p == PieceState::Pending)
            .count();

        let mut needed = pending.saturating_sub(st.recalled.len());
        while needed > 0 {
            let Some(worker) = st.standby.pop() else { break };
            debug!(chunk = %self.label, host = %worker.key(), "Recalling standby worker");
            st.recalled.insert(worker.key());
            st.standby_recalls += 1;
            self.metrics.record_standby_recall();
            actions.recall.push(worker);
            needed -= 1;
        }

        let all_stored = pending == 0 && st.registered == 0;
        if all_stored || st.active.is_empty() {
            st.finished = true;
            for worker in st.standby.drain(..) {
                st.active.remove(&worker.key());
            }
            st.memory = None;
            st.data.clear();
            actions.finish = Some(UploadOutcome {
                pieces_confirmed: st.confirmed,
                min_pieces: self.scheme.min_pieces(),
                num_pieces: self.scheme.num_pieces(),
                piece_size: self.piece_size,
                new_placements: std::mem::take(&mut st.placements),
            });
        }
    }

    fn finish(&self, outcome: UploadOutcome) {
        let Some(tx) = self.completion.lock().take() else {
            return;
        };
        if outcome.is_available() {
            self.metrics.record_chunk_uploaded();
        } else {
            self.metrics.record_chunk_upload_failed();
        }
        debug!(
            chunk = %self.label,
            confirmed = outcome.pieces_confirmed,
            total = outcome.num_pieces,
            "Chunk upload finished"
        );
        let _ = tx.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::host::{ContractTerms, MemoryHost, UsableHost};
    use crate::memory::MemoryManager;

    fn workers(count: usize, metrics: &Arc<RenterMetrics>) -> Vec<Worker> {
        (0..count)
            .map(|i| {
                let host = Arc::new(MemoryHost::new(HostKey::from_seed(900 + i as u64)));
                let usable = UsableHost::new(host.key(), ContractTerms::open(i as u64), host);
                Worker::new(&usable, WorkerConfig::default(), metrics.clone())
            })
            .collect()
    }

    fn pieces(n: usize) -> Vec<Bytes> {
        (0..n).map(|i| Bytes::from(vec![i as u8; 8])).collect()
    }

    #[tokio::test]
    async fn test_failed_piece_recalls_standby() {
        let metrics = Arc::new(RenterMetrics::new());
        let workers = workers(7, &metrics);
        let scheme = ErasureScheme::new(2, 4).unwrap();
        let memory = MemoryManager::new("upload", 1024);
        let guard = memory.request_guard(6 * 8, Priority::Normal).await;
        let (chunk, rx) = UploadChunk::new(
            "test".into(),
            scheme,
            pieces(6),
            &[],
            HashSet::new(),
            Priority::Normal,
            Some(guard),
            metrics.clone(),
        );
        chunk.dispatch(&workers);

        for (i, worker) in workers[..6].iter().enumerate() {
            match chunk.assign(worker) {
                UploadAssignment::Upload { piece, .. } => assert_eq!(piece, i),
                other => panic!("unexpected assignment {:?}", other),
            }
        }
        assert_eq!(chunk.assign(&workers[6]), UploadAssignment::Standby);

        chunk.piece_failed(workers[0].key(), 0, &Error::Cancelled);
        assert_eq!(chunk.stats().standby_recalls, 1);
        assert_eq!(workers[6].status().upload_queue, 2);
        assert!(matches!(
            chunk.assign(&workers[6]),
            UploadAssignment::Upload { piece: 0, .. }
        ));

        for (i, worker) in workers[1..].iter().enumerate() {
            let piece = (i + 1) % 6;
            chunk.piece_uploaded(worker.key(), piece, PieceRoot::of(&[piece as u8]));
            if piece != 0 {
                assert_eq!(memory.outstanding(), ((5 - i) * 8) as u64);
            }
        }
        let outcome = rx.await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.new_placements.len(), 6);
        assert_eq!(memory.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_nothing_left_to_try() {
        let metrics = Arc::new(RenterMetrics::new());
        let workers = workers(3, &metrics);
        let scheme = ErasureScheme::new(2, 2).unwrap();
        let (chunk, rx) = UploadChunk::new(
            "test".into(),
            scheme,
            pieces(4),
            &[],
            HashSet::new(),
            Priority::Normal,
            None,
            metrics.clone(),
        );
        chunk.dispatch(&workers);

        for worker in &workers {
            assert!(matches!(chunk.assign(worker), UploadAssignment::Upload { .. }));
        }
        chunk.piece_uploaded(workers[0].key(), 0, PieceRoot::of(b"0"));
        chunk.piece_failed(workers[1].key(), 1, &Error::Cancelled);
        assert!(!chunk.stats().finished);
        chunk.remove_worker(workers[2].key());

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.pieces_confirmed, 1);
        assert!(!outcome.is_available());
        assert_eq!(metrics.stats().chunks_upload_failed, 1);
    }

    #[tokio::test]
    async fn test_existing_pieces_need_no_upload() {
        let metrics = Arc::new(RenterMetrics::new());
        let workers = workers(2, &metrics);
        let scheme = ErasureScheme::new(1, 1).unwrap();
        let existing: Vec<PieceLocation> = workers
            .iter()
            .enumerate()
            .map(|(index, w)| PieceLocation {
                index,
                host: w.key(),
                root: PieceRoot::of(&[index as u8]),
            })
            .collect();
        let (chunk, rx) = UploadChunk::new(
            "test".into(),
            scheme,
            pieces(2),
            &existing,
            HashSet::new(),
            Priority::Normal,
            None,
            metrics,
        );
        chunk.dispatch(&workers);

        let outcome = rx.await.unwrap();
        assert!(outcome.is_complete());
        assert!(outcome.new_placements.is_empty());
        assert_eq!(chunk.assign(&workers[0]), UploadAssignment::Finished);
    }
}
