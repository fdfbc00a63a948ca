//! Health loop
//!
//! Finds the subtree whose health was checked longest ago and bubbles it,
//! bottom-up, all the way to the root. A subtree is small enough once it
//! holds at most `max_files_per_check` files.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::DirPath;

use super::LoopContext;

pub(crate) async fn run(ctx: Arc<LoopContext>, mut shutdown: broadcast::Receiver<()>) {
    info!("Health loop started");
    let mut wait = Duration::ZERO;
    let mut force = false;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ctx.signals.health.notified() => force = true,
            _ = tokio::time::sleep(wait) => {}
        }

        let result = if force {
            force = false;
            check_tree(&ctx, &DirPath::root()).await.map(|_| ctx.config.health.check_interval())
        } else {
            check_once(&ctx).await
        };
        wait = match result {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "Health check failed");
                ctx.config.health.check_interval()
            }
        };
    }
    info!("Health loop stopped");
}

/// Check the stalest subtree if one is due; returns how long to sleep
pub(crate) async fn check_once(ctx: &LoopContext) -> Result<Duration> {
    let interval = ctx.config.health.check_interval();
    let root = ctx.fs.dir_metadata(&DirPath::root()).await?;
    let age = (Utc::now() - root.aggregate_last_health_check)
        .to_std()
        .unwrap_or_default();
    if age < interval {
        return Ok(interval - age);
    }

    let dir = stalest_subtree(ctx).await?;
    debug!(dir = %dir, "Checking health of subtree");
    check_tree(ctx, &dir).await?;
    Ok(Duration::ZERO)
}

/// Descend towards the oldest aggregate timestamp
async fn stalest_subtree(ctx: &LoopContext) -> Result<DirPath> {
    let limit = ctx.config.health.max_files_per_check;
    let mut dir = DirPath::root();
    loop {
        let meta = ctx.fs.dir_metadata(&dir).await?;
        if meta.aggregate_num_files <= limit {
            return Ok(dir);
        }

        let mut oldest = None;
        for child in ctx.fs.list_dir(&dir).await?.dirs {
            let child_meta = ctx.fs.dir_metadata(&child).await?;
            let stamp = child_meta.aggregate_last_health_check;
            if oldest.as_ref().map_or(true, |(_, t)| stamp < *t) {
                oldest = Some((child, stamp));
            }
        }
        match oldest {
            Some((child, stamp)) if stamp <= meta.last_health_check => dir = child,
            _ => return Ok(dir),
        }
    }
}

/// Bubble every directory under `top` children first, then `top`'s
/// ancestors up to the root
pub(crate) async fn check_tree(ctx: &LoopContext, top: &DirPath) -> Result<()> {
    let mut order = Vec::new();
    let mut stack = vec![top.clone()];
    while let Some(dir) = stack.pop() {
        stack.extend(ctx.fs.list_dir(&dir).await?.dirs);
        order.push(dir);
    }
    // every child was listed after its parent
    for dir in order.iter().rev() {
        ctx.bubbler.bubble_exclusive(dir).await;
    }
    let mut ancestor = top.parent();
    while let Some(dir) = ancestor {
        ctx.bubbler.bubble_exclusive(&dir).await;
        ancestor = dir.parent();
    }
    ctx.metrics.record_health_check();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use renter_ec::ErasureScheme;

    use crate::config::RenterConfig;
    use crate::fs::{FileSnapshot, MemoryFs, RenterFs};
    use crate::metrics::RenterMetrics;
    use crate::types::FilePath;

    fn file(path: &str) -> FileSnapshot {
        FileSnapshot::new(
            FilePath::parse(path).unwrap(),
            ErasureScheme::new(1, 1).unwrap(),
            10,
            10,
        )
    }

    async fn context(max_files: u64) -> (Arc<LoopContext>, Arc<MemoryFs>) {
        let fs = Arc::new(MemoryFs::new());
        for path in ["a/1", "a/2", "a/x/3", "b/4", "b/5", "top"] {
            fs.create_file(file(path), None).await.unwrap();
        }
        let mut config = RenterConfig::default();
        config.health.max_files_per_check = max_files;
        let ctx = LoopContext::new(config, fs.clone(), Arc::new(RenterMetrics::new()));
        (ctx, fs)
    }

    #[tokio::test]
    async fn test_first_check_covers_whole_tree() {
        let (ctx, fs) = context(2).await;
        let wait = check_once(&ctx).await.unwrap();
        assert_eq!(wait, Duration::ZERO);

        let root = fs.dir_metadata(&DirPath::root()).await.unwrap();
        assert_eq!(root.num_files, 1);
        assert_eq!(root.aggregate_num_files, 6);
        assert_eq!(
            fs.dir_metadata(&DirPath::new("a")).await.unwrap().aggregate_num_files,
            3
        );
        assert_eq!(ctx.metrics.stats().health_checks, 1);

        // nothing is due until the interval has passed
        let wait = check_once(&ctx).await.unwrap();
        assert!(wait > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_descends_to_bounded_stale_subtree() {
        let (ctx, fs) = context(3).await;
        check_tree(&ctx, &DirPath::root()).await.unwrap();

        // make b the stalest subtree
        let mut stale = fs.dir_metadata(&DirPath::new("b")).await.unwrap();
        stale.last_health_check = chrono::DateTime::<Utc>::UNIX_EPOCH;
        stale.aggregate_last_health_check = chrono::DateTime::<Utc>::UNIX_EPOCH;
        fs.update_dir_metadata(&DirPath::new("b"), stale).await.unwrap();
        let mut root = fs.dir_metadata(&DirPath::root()).await.unwrap();
        root.aggregate_last_health_check = chrono::DateTime::<Utc>::UNIX_EPOCH;
        fs.update_dir_metadata(&DirPath::root(), root).await.unwrap();

        assert_eq!(stalest_subtree(&ctx).await.unwrap(), DirPath::new("b"));
        check_once(&ctx).await.unwrap();
        let b = fs.dir_metadata(&DirPath::new("b")).await.unwrap();
        assert!(b.last_health_check > chrono::DateTime::<Utc>::UNIX_EPOCH);
        let root = fs.dir_metadata(&DirPath::root()).await.unwrap();
        assert!(root.aggregate_last_health_check > chrono::DateTime::<Utc>::UNIX_EPOCH);
    }
}
