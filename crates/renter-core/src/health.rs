//! Health of chunks, files and directories
//!
//! Health is the fraction of parity redundancy a chunk is missing:
//! `1 - (good - k) / (n - k)`. A fully stored chunk is 0, a chunk with
//! exactly `k` good pieces is 1, and anything above 1 can no longer be
//! rebuilt from hosts alone.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use renter_ec::ErasureScheme;

use crate::fs::{ChunkSnapshot, DirMetadata, FileSnapshot};
use crate::host::{ContractTerms, HostKey};

/// The usable host set as seen by health computations
#[derive(Debug, Clone, Default)]
pub struct HostView {
    hosts: HashMap<HostKey, ContractTerms>,
}

impl HostView {
    pub fn new(hosts: impl IntoIterator<Item = (HostKey, ContractTerms)>) -> Self {
        Self {
            hosts: hosts.into_iter().collect(),
        }
    }

    pub fn good_for_upload(&self, host: &HostKey) -> bool {
        self.hosts.get(host).is_some_and(|t| t.good_for_upload)
    }

    pub fn good_for_download(&self, host: &HostKey) -> bool {
        self.hosts.get(host).is_some_and(|t| t.good_for_download)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Health of a chunk with `good` distinct good pieces
pub fn chunk_health(good: usize, scheme: &ErasureScheme) -> f64 {
    let k = scheme.min_pieces() as f64;
    let parity = scheme.parity_pieces() as f64;
    1.0 - (good as f64 - k) / parity
}

fn distinct_pieces(
    chunk: &ChunkSnapshot,
    scheme: &ErasureScheme,
    keep: impl Fn(&HostKey) -> bool,
) -> usize {
    chunk
        .pieces
        .iter()
        .filter(|p| p.index < scheme.num_pieces() && keep(&p.host))
        .map(|p| p.index)
        .collect::<HashSet<_>>()
        .len()
}

/// Distinct piece indices stored on hosts still good for upload
pub fn good_pieces(chunk: &ChunkSnapshot, scheme: &ErasureScheme, view: &HostView) -> usize {
    distinct_pieces(chunk, scheme, |h| view.good_for_upload(h))
}

/// Distinct piece indices that can still be fetched
pub fn downloadable_pieces(
    chunk: &ChunkSnapshot,
    scheme: &ErasureScheme,
    view: &HostView,
) -> usize {
    distinct_pieces(chunk, scheme, |h| view.good_for_download(h))
}

/// Health summary of one file
#[derive(Debug, Clone, PartialEq)]
pub struct FileHealth {
    /// Worst non-stuck chunk
    pub health: f64,
    /// Worst stuck chunk
    pub stuck_health: f64,
    /// Lowest downloadable redundancy of any chunk
    pub redundancy: f64,
    pub num_stuck_chunks: u64,
    pub size: u64,
}

pub fn file_health(file: &FileSnapshot, view: &HostView) -> FileHealth {
    let k = file.scheme.min_pieces() as f64;
    let mut summary = FileHealth {
        health: 0.0,
        stuck_health: 0.0,
        redundancy: f64::MAX,
        num_stuck_chunks: 0,
        size: file.size,
    };
    for chunk in &file.chunks {
        let health = chunk_health(good_pieces(chunk, &file.scheme, view), &file.scheme);
        if chunk.stuck {
            summary.num_stuck_chunks += 1;
            summary.stuck_health = summary.stuck_health.max(health);
        } else {
            summary.health = summary.health.max(health);
        }
        let redundancy = downloadable_pieces(chunk, &file.scheme, view) as f64 / k;
        summary.redundancy = summary.redundancy.min(redundancy);
    }
    summary
}

/// Non-stuck chunks whose health reached `threshold`, worst first
pub fn chunks_needing_repair(file: &FileSnapshot, view: &HostView, threshold: f64) -> Vec<(u64, f64)> {
    let mut chunks: Vec<(u64, f64)> = file
        .chunks
        .iter()
        .filter(|c| !c.stuck)
        .map(|c| (c.index, chunk_health(good_pieces(c, &file.scheme, view), &file.scheme)))
        .filter(|(_, health)| *health >= threshold && *health > 0.0)
        .collect();
    chunks.sort_by(|a, b| b.1.total_cmp(&a.1));
    chunks
}

/// Metadata for a directory from its files and its children's metadata
pub fn summarize_dir(files: &[FileHealth], children: &[DirMetadata], now: DateTime<Utc>) -> DirMetadata {
    let mut meta = DirMetadata {
        last_health_check: now,
        ..DirMetadata::default()
    };
    for file in files {
        meta.health = meta.health.max(file.health);
        meta.stuck_health = meta.stuck_health.max(file.stuck_health);
        meta.num_files += 1;
        meta.size += file.size;
        meta.num_stuck_chunks += file.num_stuck_chunks;
        meta.min_redundancy = meta.min_redundancy.min(file.redundancy);
    }

    meta.aggregate_health = meta.health;
    meta.aggregate_stuck_health = meta.stuck_health;
    meta.aggregate_num_files = meta.num_files;
    meta.aggregate_size = meta.size;
    meta.aggregate_num_stuck_chunks = meta.num_stuck_chunks;
    meta.aggregate_min_redundancy = meta.min_redundancy;
    meta.aggregate_last_health_check = now;
    for child in children {
        meta.aggregate_health = meta.aggregate_health.max(child.aggregate_health);
        meta.aggregate_stuck_health = meta.aggregate_stuck_health.max(child.aggregate_stuck_health);
        meta.aggregate_num_files += child.aggregate_num_files;
        meta.aggregate_size += child.aggregate_size;
        meta.aggregate_num_stuck_chunks += child.aggregate_num_stuck_chunks;
        meta.aggregate_min_redundancy = meta
            .aggregate_min_redundancy
            .min(child.aggregate_min_redundancy);
        meta.aggregate_last_health_check = meta
            .aggregate_last_health_check
            .min(child.aggregate_last_health_check);
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::PieceRoot;
    use crate::types::{FilePath, PieceLocation};

    fn scheme() -> ErasureScheme {
        ErasureScheme::new(2, 4).unwrap()
    }

    fn view(seeds: &[u64]) -> HostView {
        HostView::new(
            seeds
                .iter()
                .map(|&s| (HostKey::from_seed(s), ContractTerms::open(s))),
        )
    }

    fn chunk(index: u64, seeds: &[u64], stuck: bool) -> ChunkSnapshot {
        ChunkSnapshot {
            index,
            pieces: seeds
                .iter()
                .enumerate()
                .map(|(i, &s)| PieceLocation {
                    index: i,
                    host: HostKey::from_seed(s),
                    root: PieceRoot::of(&[i as u8]),
                })
                .collect(),
            stuck,
        }
    }

    #[test]
    fn test_chunk_health_bounds() {
        let s = scheme();
        assert_eq!(chunk_health(6, &s), 0.0);
        assert_eq!(chunk_health(2, &s), 1.0);
        assert_eq!(chunk_health(4, &s), 0.5);
        assert!(chunk_health(1, &s) > 1.0);
    }

    #[test]
    fn test_good_pieces_ignores_lost_hosts_and_duplicates() {
        let mut c = chunk(0, &[1, 2, 3], false);
        c.pieces.push(PieceLocation {
            index: 0,
            host: HostKey::from_seed(4),
            root: PieceRoot::of(&[0]),
        });
        let v = view(&[1, 3, 4]);
        assert_eq!(good_pieces(&c, &scheme(), &v), 2);

        let mut terms = ContractTerms::open(3);
        terms.good_for_upload = false;
        let v = HostView::new([(HostKey::from_seed(3), terms)]);
        assert_eq!(good_pieces(&c, &scheme(), &v), 0);
        assert_eq!(downloadable_pieces(&c, &scheme(), &v), 1);
    }

    #[test]
    fn test_file_health_separates_stuck_chunks() {
        let file = FileSnapshot {
            path: FilePath::parse("f").unwrap(),
            scheme: scheme(),
            chunk_size: 10,
            size: 30,
            chunks: vec![
                chunk(0, &[1, 2, 3, 4, 5, 6], false),
                chunk(1, &[1, 2, 3, 4], false),
                chunk(2, &[1], true),
            ],
        };
        let h = file_health(&file, &view(&[1, 2, 3, 4, 5, 6]));
        assert_eq!(h.health, 0.5);
        assert!(h.stuck_health > 1.0);
        assert_eq!(h.num_stuck_chunks, 1);
        assert_eq!(h.redundancy, 0.5);

        let repair = chunks_needing_repair(&file, &view(&[1, 2, 3, 4, 5, 6]), 0.25);
        assert_eq!(repair, vec![(1, 0.5)]);
    }

    #[test]
    fn test_summarize_folds_children() {
        let earlier = DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(10);
        let now = earlier + chrono::Duration::seconds(100);
        let child = DirMetadata {
            aggregate_health: 0.9,
            aggregate_num_files: 3,
            aggregate_size: 300,
            aggregate_num_stuck_chunks: 2,
            aggregate_min_redundancy: 1.5,
            aggregate_last_health_check: earlier,
            ..DirMetadata::default()
        };
        let files = [FileHealth {
            health: 0.2,
            stuck_health: 0.0,
            redundancy: 2.0,
            num_stuck_chunks: 0,
            size: 50,
        }];

        let meta = summarize_dir(&files, &[child], now);
        assert_eq!(meta.health, 0.2);
        assert_eq!(meta.aggregate_health, 0.9);
        assert_eq!(meta.num_files, 1);
        assert_eq!(meta.aggregate_num_files, 4);
        assert_eq!(meta.aggregate_size, 350);
        assert_eq!(meta.aggregate_num_stuck_chunks, 2);
        assert_eq!(meta.min_redundancy, 2.0);
        assert_eq!(meta.aggregate_min_redundancy, 1.5);
        assert_eq!(meta.last_health_check, now);
        assert_eq!(meta.aggregate_last_health_check, earlier);
    }
}
