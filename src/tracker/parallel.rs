//! Parallel pattern detector
//!
//! Candidate enumeration fans out over a worker pool; each worker owns
//! disjoint `(length, position range)` chunks and returns a local bucket
//! map. The coordinator merges chunk results in chunk-index order and
//! hands the merged map to the same selection phases the serial detector
//! uses, so the two implementations are byte-identical for any input.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::CompileConfig;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::nes::{ChannelTimeline, FrameCell};
use crate::tracker::detector::{
    detect_with, enumerate_range, BucketMap, PatternDetect,
};
use crate::tracker::pattern::{CompressedChannel, PatternLibrary};

const STAGE: &str = "pattern-detect";

/// Smallest chunk worth dispatching to a worker.
const MIN_CHUNK_WINDOWS: usize = 512;

/// One unit of enumeration work: windows of one length over a position
/// range.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    len: usize,
    start: usize,
    end: usize,
}

/// Production detector: threaded enumeration, serial selection.
#[derive(Debug)]
pub struct ParallelDetector {
    workers: usize,
    chunk_timeout: Duration,
}

impl ParallelDetector {
    pub fn new(workers: usize, chunk_timeout: Duration) -> Self {
        let workers = if workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            workers
        };
        Self {
            workers,
            chunk_timeout,
        }
    }

    pub fn from_config(config: &CompileConfig) -> Self {
        Self::new(config.workers, Duration::from_secs(config.chunk_timeout_secs))
    }

    fn enumerate_parallel(
        &self,
        cells: &[FrameCell],
        config: &CompileConfig,
        diagnostics: &mut Diagnostics,
    ) -> BucketMap {
        let max_len = config.max_pattern_len.min(cells.len());
        let chunks = build_chunks(
            cells.len(),
            config.min_pattern_len,
            max_len,
            self.workers,
        );
        if self.workers <= 1 || chunks.len() <= 1 {
            return crate::tracker::detector::enumerate_all(cells, config);
        }
        debug!(
            chunks = chunks.len(),
            workers = self.workers,
            "dispatching enumeration chunks"
        );

        // Workers outlive a timed-out collection loop, so they own the
        // data rather than borrow it.
        let shared_cells: Arc<Vec<FrameCell>> = Arc::new(cells.to_vec());
        let shared_chunks: Arc<Vec<Chunk>> = Arc::new(chunks);
        let next = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel::<(usize, BucketMap)>();

        for _ in 0..self.workers.min(shared_chunks.len()) {
            let cells = Arc::clone(&shared_cells);
            let chunks = Arc::clone(&shared_chunks);
            let next = Arc::clone(&next);
            let tx = tx.clone();
            thread::spawn(move || loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                let Some(chunk) = chunks.get(index) else {
                    break;
                };
                let mut local = BucketMap::new();
                enumerate_range(&cells, chunk.len, chunk.start, chunk.end, &mut local);
                if tx.send((index, local)).is_err() {
                    break;
                }
            });
        }
        drop(tx);

        let mut results: Vec<Option<BucketMap>> = vec![None; shared_chunks.len()];
        let mut received = 0usize;
        while received < results.len() {
            match rx.recv_timeout(self.chunk_timeout) {
                Ok((index, map)) => {
                    if results[index].replace(map).is_none() {
                        received += 1;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("enumeration chunk timed out after {:?}", self.chunk_timeout);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Stragglers are retried serially; a chunk that fails again is
        // abandoned and its candidates lost, which only costs
        // compression, never correctness.
        for index in 0..results.len() {
            if results[index].is_some() {
                continue;
            }
            let chunk = shared_chunks[index];
            let retry = catch_unwind(AssertUnwindSafe(|| {
                let mut local = BucketMap::new();
                enumerate_range(&shared_cells, chunk.len, chunk.start, chunk.end, &mut local);
                local
            }));
            match retry {
                Ok(local) => {
                    results[index] = Some(local);
                }
                Err(_) => {
                    diagnostics.record(
                        STAGE,
                        DiagnosticKind::AbandonedChunk,
                        format!(
                            "chunk len={} positions {}..{} abandoned after serial retry",
                            chunk.len, chunk.start, chunk.end
                        ),
                    );
                }
            }
        }

        // Merge in chunk-index order; chunk ranges for one length ascend,
        // so bucket positions come out sorted and the map is identical to
        // the serial enumeration.
        let mut merged = BucketMap::new();
        for map in results.into_iter().flatten() {
            for (key, mut positions) in map {
                merged.entry(key).or_default().append(&mut positions);
            }
        }
        for positions in merged.values_mut() {
            positions.sort_unstable();
        }
        merged
    }
}

impl PatternDetect for ParallelDetector {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn detect(
        &self,
        timeline: &ChannelTimeline,
        library: &mut PatternLibrary,
        config: &CompileConfig,
        diagnostics: &mut Diagnostics,
    ) -> CompressedChannel {
        detect_with(timeline, library, config, diagnostics, |cells, config, diags| {
            self.enumerate_parallel(cells, config, diags)
        })
    }
}

fn build_chunks(total: usize, min_len: usize, max_len: usize, workers: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    if total < min_len {
        return chunks;
    }
    for len in min_len..=max_len {
        let windows = total + 1 - len;
        let chunk_size = (windows.div_ceil(workers.max(1))).max(MIN_CHUNK_WINDOWS);
        let mut start = 0;
        while start < windows {
            let end = (start + chunk_size).min(windows);
            chunks.push(Chunk { len, start, end });
            start = end;
        }
    }
    chunks
}
