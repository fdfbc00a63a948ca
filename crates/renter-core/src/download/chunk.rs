//! Shared state of one chunk being downloaded
//!
//! Every worker in the pool receives the chunk and calls [`DownloadChunk::assign`]
//! from its own loop. The chunk decides whether that worker fetches a piece,
//! waits on standby, or drops out. Workers never learn whether their fetch
//! is one of the `d` overdrive fetches: after every event the chunk runs the
//! same cleanup, which derives from current state what memory can be
//! released, which standby workers to recall and whether it is done.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use renter_ec::{ErasureDecoder, ErasureScheme};
use tokio::sync::{oneshot, watch};
use tracing::debug;

use super::{DownloadRequest, DownloadStats, WorkerFilter};
use crate::error::{Error, Result};
use crate::host::{HostKey, PieceRoot};
use crate::memory::MemoryGuard;
use crate::metrics::RenterMetrics;
use crate::types::{ChunkId, Priority};
use crate::worker::Worker;

/// A worker's role for this chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Assignment {
    /// Fetch `piece`, then report back
    Fetch { piece: usize, root: PieceRoot },
    /// Held in reserve until a fetch fails
    Standby,
    /// Cannot contribute; the worker is done with this chunk
    Unavailable,
    /// The chunk no longer needs workers
    Finished,
}

struct ChunkState {
    /// Workers that may still contribute: queued, fetching or on standby
    active: HashSet<HostKey>,
    /// Fetches in flight per piece
    usage: Vec<usize>,
    completed: Vec<bool>,
    data: Vec<Option<Vec<u8>>>,
    pieces_registered: usize,
    pieces_completed: usize,
    standby: Vec<Worker>,
    /// Recalled standby workers and the piece reserved for each
    recalled: HashMap<HostKey, usize>,
    recovery_started: bool,
    recovery_complete: bool,
    failed: bool,
    done: bool,
    memory: Option<MemoryGuard>,
    max_in_flight: usize,
    standby_recalls: usize,
}

impl ChunkState {
    fn reserved(&self, piece: usize) -> usize {
        self.recalled.values().filter(|p| **p == piece).count()
    }
}

#[derive(Default)]
struct Actions {
    recall: Vec<Worker>,
    recover: Option<Vec<Option<Vec<u8>>>>,
    finish: Option<Result<Bytes>>,
}

pub(crate) struct DownloadChunk {
    id: ChunkId,
    scheme: ErasureScheme,
    piece_size: usize,
    chunk_len: usize,
    offset: usize,
    length: usize,
    priority: Priority,
    overdrive: usize,
    piece_redundancy: usize,
    filter: Option<WorkerFilter>,
    by_host: HashMap<HostKey, Vec<(usize, PieceRoot)>>,
    state: Mutex<ChunkState>,
    completion: Mutex<Option<oneshot::Sender<Result<Bytes>>>>,
    done_tx: watch::Sender<bool>,
    metrics: Arc<RenterMetrics>,
}

impl DownloadChunk {
    pub fn new(
        request: DownloadRequest,
        overdrive: usize,
        piece_redundancy: usize,
        memory: Option<MemoryGuard>,
        metrics: Arc<RenterMetrics>,
    ) -> (Arc<Self>, oneshot::Receiver<Result<Bytes>>) {
        let layout = request.chunk;
        let n = layout.scheme.num_pieces();
        let mut by_host: HashMap<HostKey, Vec<(usize, PieceRoot)>> = HashMap::new();
        for location in &layout.pieces {
            by_host
                .entry(location.host)
                .or_default()
                .push((location.index, location.root));
        }

        let (tx, rx) = oneshot::channel();
        let (done_tx, _) = watch::channel(false);
        let chunk = Arc::new(Self {
            id: layout.id.clone(),
            scheme: layout.scheme,
            piece_size: layout.piece_size(),
            chunk_len: layout.length,
            offset: request.offset,
            length: request.length,
            priority: request.priority,
            overdrive,
            piece_redundancy: piece_redundancy.max(1),
            filter: request.filter,
            by_host,
            state: Mutex::new(ChunkState {
                active: HashSet::new(),
                usage: vec![0; n],
                completed: vec![false; n],
                data: vec![None; n],
                pieces_registered: 0,
                pieces_completed: 0,
                standby: Vec::new(),
                recalled: HashMap::new(),
                recovery_started: false,
                recovery_complete: false,
                failed: false,
                done: false,
                memory,
                max_in_flight: 0,
                standby_recalls: 0,
            }),
            completion: Mutex::new(Some(tx)),
            done_tx,
            metrics,
        });
        (chunk, rx)
    }

    pub fn id(&self) -> &ChunkId {
        &self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Hand the chunk to every worker; each decides its own relevance
    pub fn dispatch(self: &Arc<Self>, workers: &[Worker]) {
        self.state
            .lock()
            .active
            .extend(workers.iter().map(Worker::key));
        for worker in workers {
            if worker.queue_download(self.clone()).is_err() {
                self.remove_worker(worker.key());
            }
        }
        self.update(|_| {});
    }

    /// Called by a worker when it reaches this chunk in its queue
    pub fn assign(self: &Arc<Self>, worker: &Worker) -> Assignment {
        let key = worker.key();
        let profile = worker.download_profile();
        let k = self.scheme.min_pieces();

        self.update(|st| {
            if !st.active.contains(&key) {
                return Assignment::Finished;
            }
            let reserved = st.recalled.remove(&key);
            if st.failed || st.recovery_started || st.pieces_completed >= k {
                st.active.remove(&key);
                return Assignment::Finished;
            }

            let candidates: Vec<(usize, PieceRoot)> = self
                .by_host
                .get(&key)
                .map(|pieces| {
                    pieces
                        .iter()
                        .copied()
                        .filter(|(piece, _)| !st.completed[*piece])
                        .collect()
                })
                .unwrap_or_default();
            let suitable = profile.good_for_download
                && self.filter.as_ref().map_or(true, |f| f.accepts(&profile));
            if candidates.is_empty() || !suitable {
                st.active.remove(&key);
                return Assignment::Unavailable;
            }

            let in_use =
                st.pieces_registered + st.pieces_completed + st.recalled.len();
            if in_use >= k + self.overdrive {
                st.standby.push(worker.clone());
                return Assignment::Standby;
            }

            let free = |piece: usize| st.usage[piece] + st.reserved(piece) < self.piece_redundancy;
            let pick = reserved
                .and_then(|r| candidates.iter().find(|(p, _)| *p == r && free(*p)))
                .or_else(|| candidates.iter().find(|(p, _)| free(*p)))
                .copied();
            match pick {
                Some((piece, root)) => {
                    st.usage[piece] += 1;
                    st.pieces_registered += 1;
                    st.max_in_flight = st.max_in_flight.max(st.pieces_registered);
                    Assignment::Fetch { piece, root }
                }
                None => {
                    st.standby.push(worker.clone());
                    Assignment::Standby
                }
            }
        })
    }

    pub fn piece_completed(self: &Arc<Self>, host: HostKey, piece: usize, data: Bytes) {
        let k = self.scheme.min_pieces();
        let valid = data.len() == self.piece_size;
        if !valid {
            debug!(
                chunk = %self.id,
                host = %host,
                piece,
                len = data.len(),
                "Host returned a piece of the wrong size"
            );
        }
        self.update_with(|st, actions| {
            st.active.remove(&host);
            st.usage[piece] = st.usage[piece].saturating_sub(1);
            st.pieces_registered = st.pieces_registered.saturating_sub(1);
            if !valid || st.completed[piece] {
                return;
            }
            st.completed[piece] = true;
            st.pieces_completed += 1;
            if st.recovery_started || st.failed {
                return;
            }
            st.data[piece] = Some(data.to_vec());
            if st.pieces_completed == k {
                st.recovery_started = true;
                actions.recover = Some(std::mem::take(&mut st.data));
            }
        });
    }

    pub fn piece_failed(self: &Arc<Self>, host: HostKey, piece: usize, err: &Error) {
        debug!(chunk = %self.id, host = %host, piece, error = %err, "Piece fetch failed");
        self.update(|st| {
            st.active.remove(&host);
            st.usage[piece] = st.usage[piece].saturating_sub(1);
            st.pieces_registered = st.pieces_registered.saturating_sub(1);
        });
    }

    /// The worker will never run this chunk's job
    pub fn remove_worker(self: &Arc<Self>, host: HostKey) {
        self.update(|st| {
            st.recalled.remove(&host);
            st.standby.retain(|w| w.key() != host);
            st.active.remove(&host);
        });
    }

    /// Give up on the chunk; in-flight fetches still finish and clean up
    pub fn cancel(self: &Arc<Self>) {
        self.update_with(|st, actions| {
            if !st.failed && !st.recovery_complete {
                st.failed = true;
                actions.finish = Some(Err(Error::Cancelled));
            }
        });
    }

    pub fn stats(&self) -> DownloadStats {
        let st = self.state.lock();
        DownloadStats {
            pieces_completed: st.pieces_completed,
            pieces_in_flight: st.pieces_registered,
            max_in_flight: st.max_in_flight,
            standby_recalls: st.standby_recalls,
            workers_remaining: st.active.len(),
            memory_held: st.memory.as_ref().map_or(0, MemoryGuard::remaining),
            done: st.done,
        }
    }

    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    fn recovery_finished(self: &Arc<Self>, result: Result<Vec<u8>>) {
        self.update_with(|st, actions| {
            st.recovery_complete = true;
            actions.finish = Some(match result {
                Ok(data) => {
                    Ok(Bytes::from(data).slice(self.offset..self.offset + self.length))
                }
                Err(err) => {
                    debug!(chunk = %self.id, error = %err, "Chunk recovery failed");
                    st.failed = true;
                    Err(err)
                }
            });
        });
    }

    fn update<T>(self: &Arc<Self>, f: impl FnOnce(&mut ChunkState) -> T) -> T {
        self.update_with(|st, _| f(st))
    }

    /// Mutate state, clean up, then act outside the lock
    fn update_with<T>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut ChunkState, &mut Actions) -> T,
    ) -> T {
        let mut actions = Actions::default();
        let result = {
            let mut st = self.state.lock();
            let result = f(&mut st, &mut actions);
            self.cleanup(&mut st, &mut actions);
            result
        };
        self.run(actions);
        result
    }

    /// Idempotent: safe to run after any event
    fn cleanup(&self, st: &mut ChunkState, actions: &mut Actions) {
        let k = self.scheme.min_pieces();
        let remaining = st.active.len();

        if !st.failed && !st.recovery_started && remaining + st.pieces_completed < k {
            st.failed = true;
            debug!(
                chunk = %self.id,
                remaining,
                completed = st.pieces_completed,
                "Not enough workers left to recover chunk"
            );
            actions.finish = Some(Err(Error::InsufficientRedundancy {
                needed: k,
                available: remaining + st.pieces_completed,
            }));
        }

        if st.failed || st.recovery_started {
            for worker in st.standby.drain(..) {
                st.active.remove(&worker.key());
            }
        } else {
            let ChunkState {
                standby,
                active,
                completed,
                ..
            } = &mut *st;
            standby.retain(|worker| {
                let useful = self.by_host.get(&worker.key()).is_some_and(|pieces| {
                    pieces.iter().any(|(piece, _)| !completed[*piece])
                });
                if !useful {
                    active.remove(&worker.key());
                }
                useful
            });
            self.recall_standby(st, actions);
        }

        let keep = if st.recovery_complete || st.failed {
            st.pieces_registered
        } else if st.recovery_started {
            st.pieces_completed + st.pieces_registered
        } else {
            st.active.len() + st.pieces_completed
        };
        if let Some(memory) = st.memory.as_mut() {
            memory.shrink_to((keep * self.piece_size) as u64);
        }

        let recovering = st.recovery_started && !st.recovery_complete;
        if !st.done
            && st.pieces_registered == 0
            && !recovering
            && (st.recovery_complete || st.failed)
        {
            st.done = true;
            st.memory = None;
            self.done_tx.send_replace(true);
        }
    }

    fn recall_standby(&self, st: &mut ChunkState, actions: &mut Actions) {
        let k = self.scheme.min_pieces();
        let mut needed = (k + self.overdrive)
            .saturating_sub(st.pieces_registered + st.pieces_completed + st.recalled.len());
        let mut i = 0;
        while needed > 0 && i < st.standby.len() {
            let key = st.standby[i].key();
            let piece = self.by_host.get(&key).and_then(|pieces| {
                pieces
                    .iter()
                    .map(|(piece, _)| *piece)
                    .find(|p| {
                        !st.completed[*p]
                            && st.usage[*p] + st.reserved(*p) < self.piece_redundancy
                    })
            });
            match piece {
                Some(piece) => {
                    let worker = st.standby.remove(i);
                    st.recalled.insert(key, piece);
                    st.standby_recalls += 1;
                    self.metrics.record_standby_recall();
                    debug!(chunk = %self.id, host = %key, piece, "Recalling standby worker");
                    actions.recall.push(worker);
                    needed -= 1;
                }
                None => i += 1,
            }
        }
    }

    fn run(self: &Arc<Self>, actions: Actions) {
        for worker in actions.recall {
            if worker.queue_download(self.clone()).is_err() {
                self.remove_worker(worker.key());
            }
        }
        if let Some(pieces) = actions.recover {
            self.spawn_recovery(pieces);
        }
        if let Some(result) = actions.finish {
            self.finish(result);
        }
    }

    /// Decode off the completing worker's task
    fn spawn_recovery(self: &Arc<Self>, pieces: Vec<Option<Vec<u8>>>) {
        let chunk = self.clone();
        tokio::spawn(async move {
            let scheme = chunk.scheme;
            let chunk_len = chunk.chunk_len;
            let result = tokio::task::spawn_blocking(move || {
                ErasureDecoder::new(scheme).decode_exact(&pieces, chunk_len)
            })
            .await
            .map_err(Error::from)
            .and_then(|decoded| decoded.map_err(Error::from));
            chunk.recovery_finished(result);
        });
    }

    /// Fire the completion callback; only the first call has an effect
    fn finish(&self, result: Result<Bytes>) {
        let Some(tx) = self.completion.lock().take() else {
            return;
        };
        match &result {
            Ok(_) => self.metrics.record_chunk_downloaded(),
            Err(_) => self.metrics.record_chunk_download_failed(),
        }
        let _ = tx.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::download::ChunkLayout;
    use crate::host::{ContractTerms, MemoryHost, UsableHost};
    use crate::memory::MemoryManager;
    use crate::types::{FilePath, PieceLocation};
    use renter_ec::ErasureEncoder;

    struct Fixture {
        data: Vec<u8>,
        pieces: Vec<Bytes>,
        workers: Vec<Worker>,
        layout: ChunkLayout,
        metrics: Arc<RenterMetrics>,
    }

    /// One unstarted worker per piece, so tests drive `assign` by hand
    fn fixture(k: usize, parity: usize, len: usize) -> Fixture {
        let scheme = ErasureScheme::new(k, parity).unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        let pieces: Vec<Bytes> = ErasureEncoder::new(scheme)
            .encode(&data)
            .unwrap()
            .into_iter()
            .map(Bytes::from)
            .collect();
        let metrics = Arc::new(RenterMetrics::new());

        let mut workers = Vec::new();
        let mut locations = Vec::new();
        for (index, piece) in pieces.iter().enumerate() {
            let host = Arc::new(MemoryHost::new(HostKey::from_seed(index as u64)));
            let root = host.insert_piece(piece.clone());
            locations.push(PieceLocation {
                index,
                host: host.key(),
                root,
            });
            let usable = UsableHost::new(host.key(), ContractTerms::open(index as u64), host);
            workers.push(Worker::new(&usable, WorkerConfig::default(), metrics.clone()));
        }

        let layout = ChunkLayout {
            id: ChunkId::new(FilePath::parse("dir/file").unwrap(), 0),
            scheme,
            length: len,
            pieces: locations,
        };
        Fixture {
            data,
            pieces,
            workers,
            layout,
            metrics,
        }
    }

    fn chunk_for(
        fx: &Fixture,
        overdrive: usize,
        memory: Option<MemoryGuard>,
    ) -> (Arc<DownloadChunk>, oneshot::Receiver<Result<Bytes>>) {
        let request = DownloadRequest::whole(fx.layout.clone());
        let (chunk, rx) = DownloadChunk::new(request, overdrive, 1, memory, fx.metrics.clone());
        chunk.dispatch(&fx.workers);
        (chunk, rx)
    }

    #[tokio::test]
    async fn test_overdrive_recalls_one_standby_per_failure() {
        let fx = fixture(10, 20, 1000);
        let (chunk, rx) = chunk_for(&fx, 2, None);

        let assignments: Vec<Assignment> = fx.workers.iter().map(|w| chunk.assign(w)).collect();
        let fetching: Vec<usize> = assignments
            .iter()
            .enumerate()
            .filter(|(_, a)| matches!(a, Assignment::Fetch { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(fetching, (0..12).collect::<Vec<_>>());
        assert!(assignments[12..].iter().all(|a| *a == Assignment::Standby));

        chunk.piece_failed(fx.workers[3].key(), 3, &Error::Cancelled);
        chunk.piece_failed(fx.workers[7].key(), 7, &Error::Cancelled);
        assert_eq!(chunk.stats().standby_recalls, 2);
        // recalled workers got the chunk queued a second time
        assert_eq!(fx.workers[12].status().download_queue, 2);
        assert_eq!(fx.workers[13].status().download_queue, 2);
        assert_eq!(fx.workers[14].status().download_queue, 1);

        for i in fetching.iter().copied().filter(|i| *i != 3 && *i != 7) {
            chunk.piece_completed(fx.workers[i].key(), i, fx.pieces[i].clone());
        }
        let data = rx.await.unwrap().unwrap();
        assert_eq!(&data[..], &fx.data[..]);

        // the recalled workers arrive after recovery and are turned away
        assert_eq!(chunk.assign(&fx.workers[12]), Assignment::Finished);
        assert_eq!(chunk.assign(&fx.workers[13]), Assignment::Finished);
        let stats = chunk.stats();
        assert_eq!(stats.standby_recalls, 2);
        assert_eq!(stats.max_in_flight, 12);
        assert_eq!(fx.metrics.stats().standby_recalls, 2);
    }

    #[tokio::test]
    async fn test_recovery_fires_exactly_once() {
        let fx = fixture(2, 2, 64);
        let (chunk, rx) = chunk_for(&fx, 2, None);
        let mut done = chunk.subscribe_done();

        for worker in &fx.workers {
            assert!(matches!(chunk.assign(worker), Assignment::Fetch { .. }));
        }
        for (i, worker) in fx.workers.iter().enumerate() {
            chunk.piece_completed(worker.key(), i, fx.pieces[i].clone());
        }
        assert_eq!(&rx.await.unwrap().unwrap()[..], &fx.data[..]);
        done.wait_for(|d| *d).await.unwrap();

        let stats = chunk.stats();
        assert_eq!(stats.pieces_completed, 4);
        assert_eq!(fx.metrics.stats().chunks_downloaded, 1);
        assert_eq!(fx.metrics.stats().chunks_download_failed, 0);
    }

    #[tokio::test]
    async fn test_in_flight_bounded_by_overdrive() {
        let fx = fixture(4, 8, 200);
        let (chunk, _rx) = chunk_for(&fx, 1, None);

        for worker in &fx.workers {
            chunk.assign(worker);
            assert!(chunk.stats().pieces_in_flight <= 5);
        }
        // failures free capacity that recalled workers take, never more
        for i in 0..3 {
            chunk.piece_failed(fx.workers[i].key(), i, &Error::Cancelled);
            assert!(chunk.stats().pieces_in_flight <= 5);
        }
        for worker in &fx.workers[5..8] {
            assert!(matches!(chunk.assign(worker), Assignment::Fetch { .. }));
            assert!(chunk.stats().pieces_in_flight <= 5);
        }
        assert_eq!(chunk.stats().max_in_flight, 5);
    }

    #[tokio::test]
    async fn test_fails_when_too_few_workers_remain() {
        let fx = fixture(2, 2, 64);
        let (chunk, rx) = chunk_for(&fx, 0, None);

        assert!(matches!(chunk.assign(&fx.workers[0]), Assignment::Fetch { .. }));
        assert!(matches!(chunk.assign(&fx.workers[1]), Assignment::Fetch { .. }));
        chunk.remove_worker(fx.workers[2].key());
        chunk.piece_failed(fx.workers[0].key(), 0, &Error::Cancelled);
        chunk.piece_failed(fx.workers[1].key(), 1, &Error::Cancelled);

        // worker 3 alone cannot supply two pieces
        match rx.await.unwrap() {
            Err(Error::InsufficientRedundancy { needed, available }) => {
                assert_eq!(needed, 2);
                assert!(available < 2);
            }
            other => panic!("unexpected result: {:?}", other.map(|b| b.len())),
        }
        assert!(chunk.stats().done);
    }

    #[tokio::test]
    async fn test_killing_workers_with_queued_jobs_fails_chunk() {
        let fx = fixture(2, 2, 64);
        let (chunk, rx) = chunk_for(&fx, 0, None);
        for worker in &fx.workers {
            assert_eq!(worker.status().download_queue, 1);
        }

        for worker in &fx.workers {
            worker.kill();
        }
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::InsufficientRedundancy { .. })));
        assert_eq!(chunk.stats().workers_remaining, 0);
        assert!(chunk.stats().done);
    }

    #[tokio::test]
    async fn test_killed_worker_leaves_piece_to_others() {
        let fx = fixture(2, 2, 64);
        let (chunk, rx) = chunk_for(&fx, 0, None);

        fx.workers[0].kill();
        fx.workers[1].kill();
        assert_eq!(chunk.stats().workers_remaining, 2);
        for worker in &fx.workers[2..] {
            worker.start();
        }

        let data = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&data[..], &fx.data[..]);
        for worker in &fx.workers[2..] {
            worker.kill();
        }
    }

    #[tokio::test]
    async fn test_memory_released_when_done() {
        let fx = fixture(2, 2, 64);
        let piece_size = fx.layout.piece_size() as u64;
        let memory = MemoryManager::new("download", 1 << 20);
        let guard = memory.request_guard(4 * piece_size, Priority::Normal).await;
        let (chunk, rx) = chunk_for(&fx, 2, Some(guard));
        let mut done = chunk.subscribe_done();

        for worker in &fx.workers {
            chunk.assign(worker);
        }
        chunk.piece_completed(fx.workers[0].key(), 0, fx.pieces[0].clone());
        chunk.piece_completed(fx.workers[1].key(), 1, fx.pieces[1].clone());
        rx.await.unwrap().unwrap();

        // two overdrive fetches are still running
        tokio::task::yield_now().await;
        assert!(!chunk.stats().done);
        assert_eq!(memory.outstanding(), 2 * piece_size);

        chunk.piece_failed(fx.workers[2].key(), 2, &Error::Cancelled);
        chunk.piece_completed(fx.workers[3].key(), 3, fx.pieces[3].clone());
        done.wait_for(|d| *d).await.unwrap();
        assert_eq!(memory.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancel_lets_fetches_drain() {
        let fx = fixture(2, 2, 64);
        let (chunk, rx) = chunk_for(&fx, 0, None);
        chunk.assign(&fx.workers[0]);

        chunk.cancel();
        assert!(matches!(rx.await.unwrap(), Err(Error::Cancelled)));
        assert!(!chunk.stats().done);
        assert_eq!(chunk.assign(&fx.workers[1]), Assignment::Finished);

        chunk.piece_completed(fx.workers[0].key(), 0, fx.pieces[0].clone());
        assert!(chunk.stats().done);
    }

    #[tokio::test]
    async fn test_filter_marks_worker_unavailable() {
        let fx = fixture(2, 2, 64);
        let mut request = DownloadRequest::whole(fx.layout.clone());
        request.filter = Some(WorkerFilter {
            max_price: Some(0),
            ..WorkerFilter::default()
        });
        let (chunk, _rx) = DownloadChunk::new(request, 2, 1, None, fx.metrics.clone());
        chunk.dispatch(&fx.workers);

        let mut terms = ContractTerms::open(9);
        terms.download_price = 10;
        fx.workers[0].on_usable_set_change(terms);
        assert_eq!(chunk.assign(&fx.workers[0]), Assignment::Unavailable);
        assert!(matches!(chunk.assign(&fx.workers[1]), Assignment::Fetch { .. }));
        assert_eq!(chunk.stats().workers_remaining, 3);
    }
}
