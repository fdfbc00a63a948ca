//! Stuck loop
//!
//! Feeds stuck chunks back into the upload heap a few at a time. Files
//! with a recent successful stuck repair come first, since their other
//! stuck chunks share its settings and tend to succeed too. Otherwise
//! chunks are drawn at random, weighted by where the stuck chunks are.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{ChunkId, DirPath, FilePath};

use super::{repair, LoopContext};

pub(crate) async fn run(ctx: Arc<LoopContext>, mut shutdown: broadcast::Receiver<()>) {
    info!("Stuck loop started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ctx.signals.stuck.notified() => {}
            _ = tokio::time::sleep(ctx.config.stuck.interval()) => {}
        }
        match add_stuck_chunks(&ctx).await {
            Ok(0) => {}
            Ok(added) => {
                debug!(added, "Queued stuck chunks");
                ctx.signals.repair.notify_one();
            }
            Err(e) => warn!(error = %e, "Failed to queue stuck chunks"),
        }
    }
    info!("Stuck loop stopped");
}

/// Queue stuck chunks within the heap's stuck allowance
pub(crate) async fn add_stuck_chunks(ctx: &LoopContext) -> Result<usize> {
    let room = ctx
        .config
        .stuck
        .max_stuck_chunks_in_heap
        .saturating_sub(ctx.heap.lock().num_stuck());
    if room == 0 {
        return Ok(0);
    }

    let mut added = 0;
    while added < room {
        let Some(path) = pop_stuck_file(ctx) else { break };
        let file = match ctx.fs.file(&path).await {
            Ok(file) => file,
            Err(Error::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        let mut leftover = false;
        for chunk in file.chunks.iter().filter(|c| c.stuck) {
            let id = file.chunk_id(chunk.index);
            if added == room {
                leftover = !ctx.heap.lock().is_tracked(&id);
                if leftover {
                    break;
                }
                continue;
            }
            if repair::admit_stuck(ctx, id) {
                added += 1;
            }
        }
        // keep the file's priority for the chunks that did not fit
        if leftover {
            ctx.stuck_stack.lock().push(path);
        }
    }
    if added > 0 {
        return Ok(added);
    }

    let draws = room.min(ctx.config.stuck.max_random_stuck_chunks_add_to_heap);
    for _ in 0..draws {
        let Some(id) = random_stuck_chunk(ctx).await? else { break };
        if repair::admit_stuck(ctx, id) {
            added += 1;
        }
    }
    Ok(added)
}

fn pop_stuck_file(ctx: &LoopContext) -> Option<FilePath> {
    ctx.stuck_stack.lock().pop()
}

fn pick(total: u64) -> u64 {
    rand::thread_rng().gen_range(0..total)
}

/// Descend from the root choosing a directory or file with probability
/// proportional to its stuck chunk count
async fn random_stuck_chunk(ctx: &LoopContext) -> Result<Option<ChunkId>> {
    let mut dir = DirPath::root();
    'descend: loop {
        let own = ctx.fs.dir_metadata(&dir).await?.num_stuck_chunks;
        let listing = ctx.fs.list_dir(&dir).await?;
        let mut children = Vec::with_capacity(listing.dirs.len());
        for child in listing.dirs {
            let stuck = ctx.fs.dir_metadata(&child).await?.aggregate_num_stuck_chunks;
            if stuck > 0 {
                children.push((child, stuck));
            }
        }

        let total = own + children.iter().map(|(_, n)| n).sum::<u64>();
        if total == 0 {
            return Ok(None);
        }
        let mut choice = pick(total);
        if choice < own {
            return random_chunk_in(ctx, &listing.files).await;
        }
        choice -= own;
        for (child, stuck) in children {
            if choice < stuck {
                dir = child;
                continue 'descend;
            }
            choice -= stuck;
        }
        return Ok(None);
    }
}

async fn random_chunk_in(ctx: &LoopContext, files: &[FilePath]) -> Result<Option<ChunkId>> {
    let mut stuck = Vec::new();
    for path in files {
        if let Ok(file) = ctx.fs.file(path).await {
            stuck.extend(
                file.chunks
                    .iter()
                    .filter(|c| c.stuck)
                    .map(|c| file.chunk_id(c.index)),
            );
        }
    }
    if stuck.is_empty() {
        return Ok(None);
    }
    let index = pick(stuck.len() as u64) as usize;
    Ok(Some(stuck.swap_remove(index)))
}
