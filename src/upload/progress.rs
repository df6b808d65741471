//! Upload progress reporting

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, info};

/// Snapshot after a chunk was acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes acknowledged contiguously from zero
    pub acknowledged: u64,
    pub total: u64,
    pub chunk_offset: u64,
    pub chunk_len: u64,
}

impl Progress {
    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            100
        } else {
            self.acknowledged.saturating_mul(100) / self.total
        }
    }
}

/// Receives progress updates. Called from worker threads in parallel mode.
pub trait ProgressSink: Send + Sync {
    fn on_chunk(&self, progress: &Progress);

    fn on_complete(&self, _total: u64) {}
}

/// Logs each chunk at debug level and every tenth percent at info level.
#[derive(Debug, Default)]
pub struct TracingProgress {
    last_decile: AtomicU64,
}

impl TracingProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for TracingProgress {
    fn on_chunk(&self, progress: &Progress) {
        debug!(
            offset = progress.chunk_offset,
            len = progress.chunk_len,
            acknowledged = progress.acknowledged,
            total = progress.total,
            "chunk acknowledged"
        );
        let decile = progress.percent() / 10;
        if self.last_decile.fetch_max(decile, Ordering::Relaxed) < decile {
            info!(
                acknowledged = progress.acknowledged,
                total = progress.total,
                "upload {}%",
                progress.percent()
            );
        }
    }

    fn on_complete(&self, total: u64) {
        info!(total, "upload complete");
    }
}

/// Keeps every update; handy for tests and `--json` summaries.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    updates: Mutex<Vec<Progress>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<Progress> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgress {
    fn on_chunk(&self, progress: &Progress) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push(*progress);
        }
    }
}
