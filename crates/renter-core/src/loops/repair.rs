//! Repair loop
//!
//! Fills the upload heap from the worst directories, then drains it with a
//! bounded number of concurrent repairs. Source data comes from the local
//! file when there is one, otherwise from the chunk's remaining hosts.

use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinSet;
use renter_telemetry::LogContext;
use tracing::{debug, info, warn, Instrument};

use crate::download::{estimate_memory, ChunkLayout, DownloadRequest};
use crate::error::{Error, Result};
use crate::health::{chunks_needing_repair, downloadable_pieces, good_pieces, HostView};
use crate::heap::{DirEntry, DirectoryHeap, HeapClass, HeapItem};
use crate::types::{ChunkId, DirPath, FilePath, PieceLocation, Priority};
use crate::upload::{UploadHandle, UploadRequest};
use crate::REPAIR_LOG_TARGET;

use super::LoopContext;

pub(crate) enum RepairTask {
    /// Repair the chunk the heap entry names
    Chunk,
    /// Upload on behalf of a caller, ahead of every repair
    Streaming {
        request: UploadRequest,
        reply: oneshot::Sender<Result<UploadHandle>>,
    },
}

/// How a repair attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Repaired {
    /// Every piece is durable
    Complete,
    /// Some pieces could not be placed
    Incomplete,
    /// Too few local workers to try; the chunk is left as it was
    Deferred,
}

type Finished = Option<(ChunkId, HeapClass, Result<Repaired>)>;

pub(crate) async fn run(ctx: Arc<LoopContext>, mut shutdown: broadcast::Receiver<()>) {
    info!("Repair loop started");
    loop {
        match fill_heap(&ctx).await {
            Ok(0) => {}
            Ok(queued) => debug!(queued, "Filled upload heap"),
            Err(e) => warn!(error = %e, "Failed to fill upload heap"),
        }
        let Some(finished) = drain_heap(&ctx, &mut shutdown).await else {
            break;
        };
        if finished > 0 {
            continue;
        }

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ctx.signals.repair.notified() => {}
            _ = tokio::time::sleep(ctx.config.repair.idle_interval()) => {}
        }
    }
    clear_heap(&ctx);
    info!("Repair loop stopped");
}

/// Queue a caller's upload ahead of every repair
pub(crate) fn submit_streaming(
    ctx: &LoopContext,
    request: UploadRequest,
) -> oneshot::Receiver<Result<UploadHandle>> {
    let (reply, rx) = oneshot::channel();
    ctx.heap.lock().push(HeapItem {
        chunk: None,
        class: HeapClass::Streaming,
        health: 0.0,
        item: RepairTask::Streaming { request, reply },
    });
    ctx.signals.repair.notify_one();
    rx
}

/// Queue a stuck chunk; false if it is already queued or being repaired
pub(crate) fn admit_stuck(ctx: &LoopContext, chunk: ChunkId) -> bool {
    admit(ctx, chunk, HeapClass::Stuck, f64::MAX)
}

fn admit(ctx: &LoopContext, chunk: ChunkId, class: HeapClass, health: f64) -> bool {
    let queued = ctx.heap.lock().push(HeapItem {
        chunk: Some(chunk),
        class,
        health,
        item: RepairTask::Chunk,
    });
    if queued {
        ctx.metrics.record_repair_queued();
    }
    queued
}

fn heap_full(ctx: &LoopContext) -> bool {
    ctx.heap.lock().is_full()
}

fn pop_task(ctx: &LoopContext) -> Option<HeapItem<RepairTask>> {
    ctx.heap.lock().pop()
}

fn clear_heap(ctx: &LoopContext) {
    let mut heap = ctx.heap.lock();
    while let Some(item) = heap.pop() {
        if let Some(chunk) = &item.chunk {
            heap.complete(chunk);
        }
    }
}

/// Admit chunks needing repair, backups first, then the worst directories
pub(crate) async fn fill_heap(ctx: &LoopContext) -> Result<usize> {
    let view = ctx.pool.host_view();
    let threshold = ctx.config.repair.threshold;
    let mut queued = 0;

    if let Some(backup) = ctx.fs.backup_root() {
        let mut dirs = vec![backup];
        while let Some(dir) = dirs.pop() {
            let listing = ctx.fs.list_dir(&dir).await?;
            dirs.extend(listing.dirs);
            for path in &listing.files {
                queued += queue_file(ctx, path, &view, threshold).await?;
            }
        }
    }

    let mut dirs = DirectoryHeap::new();
    let root = ctx.fs.dir_metadata(&DirPath::root()).await?;
    dirs.push(DirEntry::unexplored(DirPath::root(), root.health, root.aggregate_health));
    while !heap_full(ctx) {
        let Some(entry) = dirs.pop() else { break };
        if entry.rank() < threshold || entry.rank() <= 0.0 {
            break;
        }
        let listing = ctx.fs.list_dir(&entry.dir).await?;
        if entry.explored {
            for path in &listing.files {
                queued += queue_file(ctx, path, &view, threshold).await?;
            }
            continue;
        }
        for child in listing.dirs {
            let meta = ctx.fs.dir_metadata(&child).await?;
            dirs.push(DirEntry::unexplored(child, meta.health, meta.aggregate_health));
        }
        dirs.push(DirEntry {
            explored: true,
            ..entry
        });
    }
    Ok(queued)
}

async fn queue_file(ctx: &LoopContext, path: &FilePath, view: &HostView, threshold: f64) -> Result<usize> {
    let file = match ctx.fs.file(path).await {
        Ok(file) => file,
        Err(Error::NotFound(_)) => return Ok(0),
        Err(e) => return Err(e),
    };
    if file.size == 0 {
        return Ok(0);
    }
    let mut queued = 0;
    for (index, health) in chunks_needing_repair(&file, view, threshold) {
        let id = file.chunk_id(index);
        if ctx.lost.contains(&id) {
            continue;
        }
        if admit(ctx, id, HeapClass::Normal, health) {
            queued += 1;
        } else if heap_full(ctx) {
            break;
        }
    }
    Ok(queued)
}

/// Run queued work until the heap is empty; `None` on shutdown
async fn drain_heap(ctx: &Arc<LoopContext>, shutdown: &mut broadcast::Receiver<()>) -> Option<usize> {
    let max = ctx.config.repair.max_concurrent_repairs;
    let mut tasks: JoinSet<Finished> = JoinSet::new();
    let mut finished = 0;
    loop {
        while tasks.len() < max {
            let Some(item) = pop_task(ctx) else { break };
            spawn_task(ctx, &mut tasks, item);
        }
        if tasks.is_empty() {
            return Some(finished);
        }

        tokio::select! {
            _ = shutdown.recv() => {
                tasks.shutdown().await;
                return None;
            }
            _ = ctx.signals.repair.notified() => {}
            Some(joined) = tasks.join_next() => match joined {
                Ok(Some((id, class, result))) => {
                    // a deferred repair is not progress
                    if !matches!(result, Ok(Repaired::Deferred)) {
                        finished += 1;
                    }
                    finish_repair(ctx, id, class, result).await;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Repair task failed"),
            },
        }
    }
}

fn spawn_task(ctx: &Arc<LoopContext>, tasks: &mut JoinSet<Finished>, item: HeapItem<RepairTask>) {
    let ctx = ctx.clone();
    match item.item {
        RepairTask::Streaming { request, reply } => {
            tasks.spawn(async move {
                let _ = reply.send(ctx.uploader.request(request).await);
                None
            });
        }
        RepairTask::Chunk => {
            let Some(id) = item.chunk else { return };
            let class = item.class;
            let span = LogContext::new("repair").with_chunk(&id).span();
            tasks.spawn(
                async move {
                    let result = repair_chunk(&ctx, &id).await;
                    Some((id, class, result))
                }
                .instrument(span),
            );
        }
    }
}

/// Bring a chunk back to full redundancy
pub(crate) async fn repair_chunk(ctx: &LoopContext, id: &ChunkId) -> Result<Repaired> {
    let file = ctx.fs.file(&id.file).await?;
    let chunk = file
        .chunks
        .get(id.index as usize)
        .ok_or_else(|| Error::NotFound(id.to_string()))?;
    let scheme = file.scheme;
    let view = ctx.pool.host_view();

    let workers = ctx.pool.len();
    if workers == 0 {
        debug!(chunk = %id, "No workers, deferring repair");
        return Ok(Repaired::Deferred);
    }
    let good = good_pieces(chunk, &scheme, &view);
    if good >= scheme.num_pieces() {
        return Ok(Repaired::Complete);
    }
    let existing: Vec<PieceLocation> = chunk
        .pieces
        .iter()
        .filter(|p| view.good_for_upload(&p.host))
        .copied()
        .collect();
    let excluded: Vec<_> = chunk.pieces.iter().map(|p| p.host).collect();

    let local = ctx.fs.read_local_chunk(id).await?;
    if local.is_none() && downloadable_pieces(chunk, &scheme, &view) < scheme.min_pieces() {
        return Err(Error::Unrecoverable(id.to_string()));
    }
    if workers < scheme.min_pieces() {
        debug!(
            chunk = %id,
            workers,
            needed = scheme.min_pieces(),
            "Too few workers, deferring repair"
        );
        return Ok(Repaired::Deferred);
    }

    let layout = ChunkLayout::from_file(&file, id.index)?;
    let upload_bytes = ((scheme.num_pieces() - good) * layout.piece_size()) as u64;
    let reserve = upload_bytes.max(estimate_memory(&layout, ctx.config.download.overdrive));
    let _memory = ctx
        .repair_memory
        .request_guard(reserve, Priority::Background)
        .await;

    let data = match local {
        Some(data) => data,
        None => {
            debug!(chunk = %id, "Fetching repair source from hosts");
            let request = DownloadRequest::whole(layout)
                .with_priority(Priority::Background)
                .preallocated();
            ctx.downloader.request(request).await?.wait().await?
        }
    };

    let request = UploadRequest::new(data, scheme)
        .with_id(id.clone())
        .with_priority(Priority::Background)
        .with_existing(existing)
        .excluding(excluded)
        .preallocated();
    let outcome = ctx.uploader.request(request).await?.wait_outcome().await?;
    if !outcome.new_placements.is_empty() {
        ctx.fs.add_pieces(id, &outcome.new_placements).await?;
    }
    debug!(
        chunk = %id,
        confirmed = outcome.pieces_confirmed,
        added = outcome.new_placements.len(),
        "Chunk repair finished"
    );
    Ok(if outcome.is_complete() {
        Repaired::Complete
    } else {
        Repaired::Incomplete
    })
}

async fn finish_repair(ctx: &LoopContext, id: ChunkId, class: HeapClass, result: Result<Repaired>) {
    ctx.heap.lock().complete(&id);
    let was_stuck = class == HeapClass::Stuck;
    match result {
        Ok(Repaired::Deferred) => return,
        Ok(Repaired::Complete) => {
            ctx.metrics.record_repair_succeeded();
            if was_stuck {
                if let Err(e) = ctx.fs.set_chunk_stuck(&id, false).await {
                    warn!(chunk = %id, error = %e, "Failed to clear stuck flag");
                }
                ctx.metrics.record_stuck_chunk_repaired();
                ctx.stuck_stack.lock().push(id.file.clone());
                info!(target: REPAIR_LOG_TARGET, chunk = %id, "Stuck chunk repaired");
                ctx.signals.stuck.notify_one();
            }
        }
        Err(e) if e.is_shutdown() => {
            debug!(chunk = %id, "Repair interrupted by shutdown");
        }
        Err(Error::Unrecoverable(_)) => {
            if ctx.lost.insert(id.clone()) {
                ctx.metrics.record_chunk_lost();
                warn!(
                    target: REPAIR_LOG_TARGET,
                    chunk = %id,
                    file = %id.file,
                    "File permanently lost: chunk below 1x redundancy with no local copy"
                );
            }
        }
        other => {
            ctx.metrics.record_repair_failed();
            if let Err(e) = &other {
                debug!(chunk = %id, error = %e, "Chunk repair failed");
            }
            if !was_stuck {
                match ctx.fs.set_chunk_stuck(&id, true).await {
                    Ok(()) => {
                        ctx.metrics.record_chunk_marked_stuck();
                        info!(target: REPAIR_LOG_TARGET, chunk = %id, "Chunk marked stuck");
                        ctx.signals.stuck.notify_one();
                    }
                    Err(e) => warn!(chunk = %id, error = %e, "Failed to mark chunk stuck"),
                }
            }
        }
    }
    ctx.bubbler.queue(id.file.dir().clone());
}
