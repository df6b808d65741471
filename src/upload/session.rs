//! Upload session bookkeeping
//!
//! [`UploadSession`] tracks one transfer attempt: sizes, the resume point,
//! and the acknowledged offset. [`AckLedger`] collects completed byte ranges
//! that may arrive out of order and exposes only the contiguous prefix.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A contiguous byte range `[offset, offset + len)` sent in one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub offset: u64,
    pub len: u64,
}

impl ChunkRange {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// State of a single upload attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub file_name: String,
    /// Total content length
    pub total_size: u64,
    pub chunk_size: u64,
    /// Offset the transfer started from
    pub resume_offset: u64,
    /// Bytes the backend acknowledged contiguously from zero
    acknowledged: u64,
}

impl UploadSession {
    pub fn new(file_name: impl Into<String>, total_size: u64, chunk_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            total_size,
            chunk_size: chunk_size.max(1),
            resume_offset: 0,
            acknowledged: 0,
        }
    }

    /// Start the transfer at `offset` (clamped to the total size).
    pub fn with_resume(mut self, offset: u64) -> Self {
        let offset = offset.min(self.total_size);
        self.resume_offset = offset;
        self.acknowledged = offset;
        self
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    pub fn is_complete(&self) -> bool {
        self.acknowledged >= self.total_size
    }

    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.acknowledged)
    }

    /// Record a backend acknowledgment. The offset may move backwards when
    /// the backend reports holding less than previously assumed.
    pub fn acknowledge(&mut self, offset: u64) {
        self.acknowledged = offset.min(self.total_size);
    }

    /// The chunk starting at `offset`, if any bytes remain there.
    pub fn chunk_at(&self, offset: u64) -> Option<ChunkRange> {
        if offset >= self.total_size {
            return None;
        }
        Some(ChunkRange {
            offset,
            len: self.chunk_size.min(self.total_size - offset),
        })
    }

    /// All chunks from the current acknowledged offset to the end.
    pub fn pending_chunks(&self) -> Vec<ChunkRange> {
        let mut chunks = Vec::new();
        let mut offset = self.acknowledged;
        while let Some(chunk) = self.chunk_at(offset) {
            offset = chunk.end();
            chunks.push(chunk);
        }
        chunks
    }
}

/// Completed ranges, possibly out of order, with a contiguous prefix.
#[derive(Debug, Clone, Default)]
pub struct AckLedger {
    /// Everything below this offset is complete.
    contiguous: u64,
    /// Completed ranges above the prefix: start -> end.
    pending: BTreeMap<u64, u64>,
}

impl AckLedger {
    /// Ledger whose first `start` bytes are already complete.
    pub fn starting_at(start: u64) -> Self {
        Self {
            contiguous: start,
            pending: BTreeMap::new(),
        }
    }

    pub fn contiguous(&self) -> u64 {
        self.contiguous
    }

    /// Mark `[start, end)` complete and return the new contiguous prefix.
    pub fn record(&mut self, start: u64, end: u64) -> u64 {
        if end <= self.contiguous || end <= start {
            return self.contiguous;
        }
        let entry = self.pending.entry(start).or_insert(end);
        if *entry < end {
            *entry = end;
        }

        while let Some((&start, &end)) = self.pending.iter().next() {
            if start > self.contiguous {
                break;
            }
            self.pending.remove(&start);
            if end > self.contiguous {
                self.contiguous = end;
            }
        }
        self.contiguous
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_chunks() {
        let mib = 1024 * 1024;
        let session = UploadSession::new("a.tar", 25 * mib, 10 * mib);
        let chunks = session.pending_chunks();
        let lens: Vec<u64> = chunks.iter().map(|c| c.len).collect();
        assert_eq!(lens, vec![10 * mib, 10 * mib, 5 * mib]);
        assert_eq!(chunks[2].offset, 20 * mib);
        assert_eq!(chunks[2].end(), 25 * mib);
    }

    #[test]
    fn test_session_resume() {
        let session = UploadSession::new("a.tar", 100, 30).with_resume(60);
        assert_eq!(session.acknowledged(), 60);
        assert_eq!(session.remaining(), 40);
        let offsets: Vec<u64> = session.pending_chunks().iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![60, 90]);

        let done = UploadSession::new("a.tar", 100, 30).with_resume(500);
        assert!(done.is_complete());
        assert!(done.pending_chunks().is_empty());
    }

    #[test]
    fn test_session_empty_file() {
        let session = UploadSession::new("empty.tar", 0, 10);
        assert!(session.is_complete());
        assert!(session.chunk_at(0).is_none());
    }

    #[test]
    fn test_ledger_out_of_order() {
        let mut ledger = AckLedger::default();
        assert_eq!(ledger.record(20, 30), 0);
        assert_eq!(ledger.record(10, 20), 0);
        assert_eq!(ledger.record(0, 10), 30);
    }

    #[test]
    fn test_ledger_duplicates_and_overlap() {
        let mut ledger = AckLedger::starting_at(10);
        assert_eq!(ledger.record(0, 10), 10);
        assert_eq!(ledger.record(10, 20), 20);
        assert_eq!(ledger.record(10, 20), 20);
        assert_eq!(ledger.record(15, 25), 25);
        assert_eq!(ledger.record(40, 50), 25);
        assert_eq!(ledger.record(30, 35), 25);
        assert_eq!(ledger.record(25, 30), 35);
    }
}
