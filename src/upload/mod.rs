//! Chunked, resumable archive upload
//!
//! The manager opens the backend's upload target, then sends the archive in
//! fixed-size chunks from the acknowledged offset. Transient failures retry
//! the same chunk with backoff; any other failure stops the transfer with
//! the acknowledged offset attached so a later attempt can resume there.
//!
//! After the last acknowledgment the archive is re-hashed from disk and
//! compared with the checksum the backend reports.
//!
//! With `parallelism > 1` and a backend that allows it, chunks go out from a
//! bounded set of scoped threads. Completions feed one [`AckLedger`], so the
//! acknowledged offset only covers a contiguous prefix.

mod progress;
mod retry;
mod session;

pub use progress::{Progress, ProgressSink, RecordingProgress, TracingProgress};
pub use retry::RetryPolicy;
pub use session::{AckLedger, ChunkRange, UploadSession};

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::checksum::{hash_file, Checksum, ChecksumSet};
use crate::config::{UploadConfig, DEFAULT_CHUNK_SIZE_BYTES};
use crate::repository::{RepositoryClient, RepositoryError, RepositoryRecord, RepositoryResult, UploadFile};

/// Errors from an upload attempt
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload failed at byte {acknowledged_offset} after {attempts} attempts: {source}")]
    UploadFailed {
        acknowledged_offset: u64,
        attempts: u32,
        source: RepositoryError,
    },

    #[error("upload stopped at byte {acknowledged_offset}: {source}")]
    Rejected {
        acknowledged_offset: u64,
        source: RepositoryError,
    },

    #[error("checksum mismatch: local {expected}, repository reports {actual}")]
    Integrity { expected: Checksum, actual: Checksum },

    #[error("archive changed since export: {0}")]
    ArchiveChanged(String),

    #[error("upload cancelled at byte {acknowledged_offset}")]
    Cancelled { acknowledged_offset: u64 },

    #[error("IO error reading archive: {0}")]
    Io(#[from] io::Error),
}

impl UploadError {
    /// Offset a later attempt can resume from, when known.
    pub fn acknowledged_offset(&self) -> Option<u64> {
        match self {
            UploadError::UploadFailed { acknowledged_offset, .. }
            | UploadError::Rejected { acknowledged_offset, .. }
            | UploadError::Cancelled { acknowledged_offset } => Some(*acknowledged_offset),
            _ => None,
        }
    }

    /// The underlying repository error, if any.
    pub fn repository_error(&self) -> Option<&RepositoryError> {
        match self {
            UploadError::UploadFailed { source, .. } | UploadError::Rejected { source, .. } => Some(source),
            _ => None,
        }
    }

    fn with_acknowledged(mut self, offset: u64) -> Self {
        match &mut self {
            UploadError::UploadFailed { acknowledged_offset, .. }
            | UploadError::Rejected { acknowledged_offset, .. }
            | UploadError::Cancelled { acknowledged_offset } => *acknowledged_offset = offset,
            _ => {}
        }
        self
    }
}

/// Result of a completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub acknowledged: u64,
    pub resumed_from: u64,
    pub chunks_sent: u32,
    pub bytes_sent: u64,
    /// Checksums recomputed from disk after the transfer
    pub checksums: ChecksumSet,
    /// Checksum reported by the backend, if it reports one
    pub remote_checksum: Option<Checksum>,
}

#[derive(Debug, Default, Clone, Copy)]
struct TransferStats {
    chunks_sent: u32,
    bytes_sent: u64,
}

/// Drives one archive upload against a [`RepositoryClient`].
pub struct UploadManager<'a> {
    client: &'a dyn RepositoryClient,
    chunk_size: u64,
    retry: RetryPolicy,
    parallelism: usize,
    cancel: CancelToken,
    progress: Arc<dyn ProgressSink>,
}

impl<'a> UploadManager<'a> {
    pub fn new(client: &'a dyn RepositoryClient) -> Self {
        Self {
            client,
            chunk_size: DEFAULT_CHUNK_SIZE_BYTES,
            retry: RetryPolicy::default(),
            parallelism: 1,
            cancel: CancelToken::new(),
            progress: Arc::new(TracingProgress::new()),
        }
    }

    pub fn from_config(client: &'a dyn RepositoryClient, config: &UploadConfig) -> Self {
        Self::new(client)
            .with_chunk_size(config.chunk_size_bytes)
            .with_retry(config.retry_policy())
            .with_parallelism(config.parallelism)
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Upload `path` as record content.
    ///
    /// Starts at `resume_from` when given, otherwise at whatever the backend
    /// reports holding. Part-based backends round the start down to a part
    /// boundary; re-sent bytes are not duplicated.
    pub fn upload(
        &self,
        record: &mut RepositoryRecord,
        path: &Path,
        file: &UploadFile,
        resume_from: Option<u64>,
    ) -> Result<UploadOutcome, UploadError> {
        self.check_cancel(0)?;
        let remote = self.retrying(0, || self.client.open_upload(&mut *record, file))?;

        let requested = match resume_from {
            Some(offset) if offset > file.size => {
                return Err(UploadError::Rejected {
                    acknowledged_offset: remote,
                    source: RepositoryError::InvalidState(format!(
                        "resume offset {} beyond file size {}",
                        offset, file.size
                    )),
                })
            }
            Some(offset) => offset,
            None => remote,
        };

        let part_size = record.upload.as_ref().and_then(|h| h.part_size);
        let chunk_size = aligned_chunk_size(self.chunk_size, part_size);
        let start = match part_size {
            Some(part) if requested < file.size => requested - requested % part,
            _ => requested,
        };

        let mut session = UploadSession::new(&file.name, file.size, chunk_size).with_resume(start);
        info!(
            file = %file.name,
            size = file.size,
            chunk_size,
            resume_from = start,
            "starting upload"
        );

        let workers = self.parallelism.min(self.client.max_parallel_chunks()).max(1);
        let record_view: &RepositoryRecord = record;
        let stats = if workers > 1 && session.pending_chunks().len() > 1 {
            self.upload_parallel(record_view, path, &mut session, workers)?
        } else {
            self.upload_sequential(record_view, path, &mut session)?
        };

        let acknowledged = session.acknowledged();
        self.check_cancel(acknowledged)?;
        let remote_checksum = self.retrying(acknowledged, || self.client.complete_upload(&mut *record))?;
        self.progress.on_complete(file.size);

        let checksums = self.verify(path, file, remote_checksum.as_ref())?;
        Ok(UploadOutcome {
            acknowledged,
            resumed_from: start,
            chunks_sent: stats.chunks_sent,
            bytes_sent: stats.bytes_sent,
            checksums,
            remote_checksum,
        })
    }

    fn upload_sequential(
        &self,
        record: &RepositoryRecord,
        path: &Path,
        session: &mut UploadSession,
    ) -> Result<TransferStats, UploadError> {
        let mut reader = File::open(path)?;
        let mut buf = Vec::new();
        let mut stats = TransferStats::default();
        let mut stalls = 0u32;

        while let Some(chunk) = session.chunk_at(session.acknowledged()) {
            self.check_cancel(session.acknowledged())?;
            read_range(&mut reader, chunk, &mut buf)?;

            let acked = self.retrying(session.acknowledged(), || {
                self.client.upload_chunk(record, chunk.offset, &buf)
            })?;
            stats.chunks_sent += 1;
            stats.bytes_sent += chunk.len;

            if acked <= chunk.offset {
                stalls += 1;
                if stalls > self.retry.max_attempts {
                    return Err(UploadError::Rejected {
                        acknowledged_offset: session.acknowledged(),
                        source: RepositoryError::Protocol(format!(
                            "no progress past byte {} after {} chunks",
                            chunk.offset, stalls
                        )),
                    });
                }
                warn!(offset = chunk.offset, acked, "backend acknowledged no bytes of chunk");
            } else {
                stalls = 0;
            }

            session.acknowledge(acked);
            self.progress.on_chunk(&Progress {
                acknowledged: session.acknowledged(),
                total: session.total_size,
                chunk_offset: chunk.offset,
                chunk_len: chunk.len,
            });
        }
        Ok(stats)
    }

    fn upload_parallel(
        &self,
        record: &RepositoryRecord,
        path: &Path,
        session: &mut UploadSession,
        workers: usize,
    ) -> Result<TransferStats, UploadError> {
        debug!(workers, "parallel chunk upload");
        let queue: Mutex<VecDeque<ChunkRange>> = Mutex::new(session.pending_chunks().into());
        let ledger = Mutex::new(AckLedger::starting_at(session.acknowledged()));
        let failure: Mutex<Option<UploadError>> = Mutex::new(None);
        let stats = Mutex::new(TransferStats::default());
        let total = session.total_size;

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    let fail = |e: UploadError| {
                        let mut slot = lock(&failure);
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    };
                    let mut reader = match File::open(path) {
                        Ok(f) => f,
                        Err(e) => return fail(e.into()),
                    };
                    let mut buf = Vec::new();

                    loop {
                        if lock(&failure).is_some() {
                            return;
                        }
                        let Some(chunk) = lock(&queue).pop_front() else {
                            return;
                        };
                        let prefix = lock(&ledger).contiguous();
                        if let Err(e) = self.check_cancel(prefix) {
                            return fail(e);
                        }
                        if let Err(e) = read_range(&mut reader, chunk, &mut buf) {
                            return fail(e.into());
                        }

                        let acked = match self.retrying(prefix, || {
                            self.client.upload_chunk(record, chunk.offset, &buf)
                        }) {
                            Ok(acked) => acked,
                            Err(e) => return fail(e),
                        };
                        {
                            let mut s = lock(&stats);
                            s.chunks_sent += 1;
                            s.bytes_sent += chunk.len;
                        }
                        if acked < chunk.end() {
                            return fail(UploadError::Rejected {
                                acknowledged_offset: prefix,
                                source: RepositoryError::Protocol(format!(
                                    "backend stored {} of {} bytes at offset {}",
                                    acked.saturating_sub(chunk.offset),
                                    chunk.len,
                                    chunk.offset
                                )),
                            });
                        }

                        let acknowledged = lock(&ledger).record(chunk.offset, chunk.end());
                        self.progress.on_chunk(&Progress {
                            acknowledged,
                            total,
                            chunk_offset: chunk.offset,
                            chunk_len: chunk.len,
                        });
                    }
                });
            }
        });

        let acknowledged = lock(&ledger).contiguous();
        session.acknowledge(acknowledged);
        if let Some(e) = lock(&failure).take() {
            return Err(e.with_acknowledged(acknowledged));
        }
        let stats = *lock(&stats);
        Ok(stats)
    }

    /// Re-hash the archive and compare with what was exported and with
    /// the backend's checksum.
    fn verify(&self, path: &Path, file: &UploadFile, remote: Option<&Checksum>) -> Result<ChecksumSet, UploadError> {
        let (size, local) = hash_file(path)
            .map_err(|e| UploadError::ArchiveChanged(format!("cannot re-read {}: {}", path.display(), e)))?;
        if size != file.size || local != file.checksums {
            return Err(UploadError::ArchiveChanged(format!(
                "{} is {} bytes with {}, expected {} bytes with {}",
                path.display(),
                size,
                local.sha256,
                file.size,
                file.checksums.sha256
            )));
        }
        match remote {
            Some(reported) => {
                let expected = local.get(reported.algorithm);
                if expected != reported {
                    return Err(UploadError::Integrity {
                        expected: expected.clone(),
                        actual: reported.clone(),
                    });
                }
                debug!(checksum = %reported, "backend checksum verified");
            }
            None => debug!("backend reported no checksum; verified local archive only"),
        }
        Ok(local)
    }

    fn check_cancel(&self, acknowledged_offset: u64) -> Result<(), UploadError> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled { acknowledged_offset });
        }
        Ok(())
    }

    /// Run `op`, retrying transient failures per the policy.
    fn retrying<T>(
        &self,
        acknowledged_offset: u64,
        mut op: impl FnMut() -> RepositoryResult<T>,
    ) -> Result<T, UploadError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    thread::sleep(delay);
                    self.check_cancel(acknowledged_offset)?;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(UploadError::UploadFailed {
                        acknowledged_offset,
                        attempts: attempt,
                        source: e,
                    })
                }
                Err(e) => {
                    return Err(UploadError::Rejected {
                        acknowledged_offset,
                        source: e,
                    })
                }
            }
        }
    }
}

/// Round the chunk size to a whole number of parts.
fn aligned_chunk_size(chunk_size: u64, part_size: Option<u64>) -> u64 {
    match part_size {
        Some(part) if part > 0 => (chunk_size / part).max(1) * part,
        _ => chunk_size.max(1),
    }
}

fn read_range(reader: &mut File, chunk: ChunkRange, buf: &mut Vec<u8>) -> io::Result<()> {
    buf.resize(chunk.len as usize, 0);
    reader.seek(SeekFrom::Start(chunk.offset))?;
    reader.read_exact(buf)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
