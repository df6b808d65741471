//! In-process repository backend
//!
//! Behaves like a real backend for the pipeline's purposes: drafts with
//! idempotency keys, sparse chunk storage with a contiguous acknowledged
//! prefix, checksums computed from stored bytes, replacement of a completed
//! file whose checksum does not match, and an irreversible publish. Every call is recorded so tests can count network traffic.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use fairops_rocrate::MetadataCrate;

use crate::checksum::{hash_bytes, Checksum};
use crate::repository::{
    Backend, RecordState, RepositoryClient, RepositoryError, RepositoryRecord, RepositoryResult, StoredContent,
    UploadFile, UploadHandle,
};
use crate::upload::AckLedger;

use super::failure::{FailureConfig, FailureInjector, MockOp};

/// Parallel chunk limit for part-based mock backends.
const MOCK_PARALLEL_CHUNKS: usize = 8;

/// A recorded repository call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateDeposition { idempotency_key: String },
    AttachMetadata { id: String },
    OpenUpload { id: String, file_name: String },
    UploadChunk { id: String, offset: u64, len: u64 },
    CompleteUpload { id: String },
    Finalize { id: String },
    GetStatus { id: String },
    FetchRecord { id: String },
}

impl MockCall {
    pub fn op(&self) -> MockOp {
        match self {
            MockCall::CreateDeposition { .. } => MockOp::CreateDeposition,
            MockCall::AttachMetadata { .. } => MockOp::AttachMetadata,
            MockCall::OpenUpload { .. } => MockOp::OpenUpload,
            MockCall::UploadChunk { .. } => MockOp::UploadChunk,
            MockCall::CompleteUpload { .. } => MockOp::CompleteUpload,
            MockCall::Finalize { .. } => MockOp::Finalize,
            MockCall::GetStatus { .. } => MockOp::GetStatus,
            MockCall::FetchRecord { .. } => MockOp::FetchRecord,
        }
    }

    fn offset(&self) -> Option<u64> {
        match self {
            MockCall::UploadChunk { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct StoredFile {
    name: String,
    data: Vec<u8>,
    ledger: AckLedger,
    /// Checksum reported once the upload completed
    checksum: Option<Checksum>,
}

impl StoredFile {
    fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            data: vec![0; size as usize],
            ledger: AckLedger::default(),
            checksum: None,
        }
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn completed(&self) -> bool {
        self.checksum.is_some()
    }

    fn content(&self) -> Option<StoredContent> {
        self.completed().then(|| StoredContent {
            name: self.name.clone(),
            size: self.size(),
            checksum: self.checksum.clone(),
        })
    }
}

#[derive(Debug)]
struct MockRecord {
    record: RepositoryRecord,
    metadata: Option<MetadataCrate>,
    file: Option<StoredFile>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    records: BTreeMap<String, MockRecord>,
    idempotency: HashMap<String, String>,
    calls: Vec<MockCall>,
    failures: FailureInjector,
    reported_checksum: Option<Checksum>,
    rejected_licenses: Vec<String>,
}

impl MockState {
    fn record_mut(&mut self, id: &str) -> RepositoryResult<&mut MockRecord> {
        self.records
            .get_mut(id)
            .ok_or_else(|| RepositoryError::RecordNotFound(id.to_string()))
    }
}

/// Mock repository backend
#[derive(Debug)]
pub struct MockRepository {
    backend: Backend,
    part_size: Option<u64>,
    state: Mutex<MockState>,
}

impl MockRepository {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            part_size: None,
            state: Mutex::new(MockState {
                next_id: 1000,
                ..MockState::default()
            }),
        }
    }

    /// Store whole parts only, like a part-based upload service.
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size.max(1));
        self
    }

    /// Reject this license identifier when metadata is attached.
    pub fn with_rejected_license(self, license: &str) -> Self {
        self.lock().rejected_licenses.push(license.to_ascii_lowercase());
        self
    }

    pub fn inject(&self, op: MockOp, config: FailureConfig) {
        self.lock().failures.inject(op, config);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Report this checksum from `complete_upload` instead of the real one.
    pub fn report_checksum(&self, checksum: Checksum) {
        self.lock().reported_checksum = Some(checksum);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: MockOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Server-side view of a record.
    pub fn record(&self, id: &str) -> Option<RepositoryRecord> {
        self.lock().records.get(id).map(|r| r.record.clone())
    }

    pub fn record_ids(&self) -> Vec<String> {
        self.lock().records.keys().cloned().collect()
    }

    pub fn metadata(&self, id: &str) -> Option<MetadataCrate> {
        self.lock().records.get(id).and_then(|r| r.metadata.clone())
    }

    /// Bytes acknowledged contiguously for the record's file.
    pub fn acknowledged(&self, id: &str) -> Option<u64> {
        let state = self.lock();
        let file = state.records.get(id)?.file.as_ref()?;
        Some(file.ledger.contiguous())
    }

    /// The stored file content up to the acknowledged prefix.
    pub fn stored_bytes(&self, id: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        let file = state.records.get(id)?.file.as_ref()?;
        Some(file.data[..file.ledger.contiguous() as usize].to_vec())
    }

    /// Flip one stored byte of a completed file, as if damaged in transit.
    /// The backend's checksum then describes the damaged bytes.
    pub fn corrupt_stored(&self, id: &str, offset: u64) -> bool {
        let mut state = self.lock();
        let Some(stored) = state.records.get_mut(id) else {
            return false;
        };
        let Some(file) = stored.file.as_mut() else {
            return false;
        };
        let Some(byte) = file.data.get_mut(offset as usize) else {
            return false;
        };
        *byte ^= 0xff;
        if file.completed() {
            file.checksum = Some(hash_bytes(&file.data).md5);
        }
        if let Some(content) = file.content() {
            stored.record.set_content(content);
        }
        true
    }

    /// Simulate a draft deleted through the repository's web interface.
    pub fn delete_record(&self, id: &str) -> bool {
        self.lock().records.remove(id).is_some()
    }

    pub fn published_count(&self) -> usize {
        self.lock()
            .records
            .values()
            .filter(|r| r.record.state == RecordState::Published)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and apply any injected failure.
    fn begin(&self, call: MockCall) -> RepositoryResult<()> {
        let injected = {
            let mut state = self.lock();
            let op = call.op();
            let offset = call.offset();
            state.calls.push(call);
            state.failures.check(op, offset)
        };
        if let Some(config) = injected {
            if let Some(delay) = config.delay {
                std::thread::sleep(delay);
            }
            if let Some(error) = config.error {
                return Err(error);
            }
        }
        Ok(())
    }
}

impl RepositoryClient for MockRepository {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn create_deposition(&self, _metadata: &MetadataCrate, idempotency_key: &str) -> RepositoryResult<RepositoryRecord> {
        self.begin(MockCall::CreateDeposition {
            idempotency_key: idempotency_key.to_string(),
        })?;
        let mut state = self.lock();
        if let Some(id) = state.idempotency.get(idempotency_key).cloned() {
            if let Some(existing) = state.records.get(&id) {
                return Ok(existing.record.clone());
            }
        }

        state.next_id += 1;
        let id = state.next_id.to_string();
        let mut record = RepositoryRecord::draft(self.backend, &id);
        record.location = Some(format!("mock://{}/{}", self.backend, id));

        state.idempotency.insert(idempotency_key.to_string(), id.clone());
        state.records.insert(
            id,
            MockRecord {
                record: record.clone(),
                metadata: None,
                file: None,
            },
        );
        Ok(record)
    }

    fn attach_metadata(&self, record: &mut RepositoryRecord, metadata: &MetadataCrate) -> RepositoryResult<()> {
        self.begin(MockCall::AttachMetadata { id: record.id.clone() })?;
        let mut state = self.lock();
        let license = metadata.license().unwrap_or_default();
        if state.rejected_licenses.contains(&license.to_ascii_lowercase()) {
            return Err(RepositoryError::MetadataRejected {
                field: "license".to_string(),
                message: format!("unknown license: {}", license),
            });
        }

        let stored = state.record_mut(&record.id)?;
        if stored.record.is_published() {
            return Err(RepositoryError::InvalidState(format!("record {} is published", record.id)));
        }
        stored.metadata = Some(metadata.clone());
        stored.record.mark_metadata_attached();
        record.mark_metadata_attached();
        Ok(())
    }

    fn open_upload(&self, record: &mut RepositoryRecord, file: &UploadFile) -> RepositoryResult<u64> {
        self.begin(MockCall::OpenUpload {
            id: record.id.clone(),
            file_name: file.name.clone(),
        })?;
        let backend = self.backend;
        let part_size = self.part_size;
        let mut state = self.lock();
        let stored = state.record_mut(&record.id)?;
        if stored.record.is_published() {
            return Err(RepositoryError::InvalidState(format!("record {} is published", record.id)));
        }

        let reusable = stored.file.as_ref().is_some_and(|f| match f.content() {
            Some(content) => content.matches(file),
            None => f.name == file.name && f.size() == file.size,
        });
        if !reusable {
            if stored.file.as_ref().is_some_and(StoredFile::completed) {
                stored.record.clear_content();
                record.clear_content();
            }
            stored.file = Some(StoredFile::new(&file.name, file.size));
        } else if let Some(content) = stored.file.as_ref().and_then(StoredFile::content) {
            record.set_content(content);
        }
        let acknowledged = stored
            .file
            .as_ref()
            .map(|f| f.ledger.contiguous())
            .unwrap_or(0);

        record.upload = Some(UploadHandle {
            file_name: file.name.clone(),
            size: file.size,
            location: format!("mock://{}/{}/files/{}", backend, record.id, file.name),
            file_id: Some(file.name.clone()),
            part_size,
        });
        Ok(acknowledged)
    }

    fn upload_chunk(&self, record: &RepositoryRecord, offset: u64, data: &[u8]) -> RepositoryResult<u64> {
        self.begin(MockCall::UploadChunk {
            id: record.id.clone(),
            offset,
            len: data.len() as u64,
        })?;
        let part_size = self.part_size;
        let mut state = self.lock();
        let stored = state.record_mut(&record.id)?;
        let file = stored
            .file
            .as_mut()
            .ok_or_else(|| RepositoryError::InvalidState("upload not opened".to_string()))?;

        let end = offset + data.len() as u64;
        if end > file.size() {
            return Err(RepositoryError::Rejected {
                status: 416,
                message: format!("range {}-{} beyond size {}", offset, end, file.size()),
            });
        }

        let storable = match part_size {
            Some(part) => {
                if offset % part != 0 {
                    return Err(RepositoryError::InvalidState(format!(
                        "offset {} not aligned to part size {}",
                        offset, part
                    )));
                }
                if end == file.size() {
                    data.len() as u64
                } else {
                    data.len() as u64 / part * part
                }
            }
            None => data.len() as u64,
        };

        let start = offset as usize;
        file.data[start..start + storable as usize].copy_from_slice(&data[..storable as usize]);
        file.ledger.record(offset, offset + storable);
        Ok(offset + storable)
    }

    fn complete_upload(&self, record: &mut RepositoryRecord) -> RepositoryResult<Option<Checksum>> {
        self.begin(MockCall::CompleteUpload { id: record.id.clone() })?;
        let mut state = self.lock();
        let reported = state.reported_checksum.clone();
        let stored = state.record_mut(&record.id)?;
        let file = stored
            .file
            .as_mut()
            .ok_or_else(|| RepositoryError::InvalidState("upload not opened".to_string()))?;
        if file.ledger.contiguous() < file.size() {
            return Err(RepositoryError::InvalidState(format!(
                "upload incomplete: {} of {} bytes",
                file.ledger.contiguous(),
                file.size()
            )));
        }
        let checksum = reported.unwrap_or_else(|| hash_bytes(&file.data).md5);
        file.checksum = Some(checksum.clone());
        let content = StoredContent {
            name: file.name.clone(),
            size: file.size(),
            checksum: Some(checksum.clone()),
        };

        stored.record.set_content(content.clone());
        record.set_content(content);
        Ok(Some(checksum))
    }

    fn finalize(&self, record: &RepositoryRecord) -> RepositoryResult<RepositoryRecord> {
        self.begin(MockCall::Finalize { id: record.id.clone() })?;
        let backend = self.backend;
        let mut state = self.lock();
        let stored = state.record_mut(&record.id)?;

        if stored.record.is_published() {
            return Err(RepositoryError::InvalidState(format!("record {} already published", record.id)));
        }
        let content_ready = stored
            .file
            .as_ref()
            .is_some_and(|f| f.completed() && f.ledger.contiguous() == f.size());
        if stored.metadata.is_none() || !content_ready {
            return Err(RepositoryError::InvalidState(format!(
                "record {} is missing metadata or content",
                record.id
            )));
        }

        stored.record.advance(RecordState::Published);
        stored.record.doi = Some(format!("10.5281/mock.{}", record.id));
        stored.record.url = Some(format!("https://{}.mock/records/{}", backend, record.id));

        let mut published = record.clone();
        published.advance(RecordState::Published);
        published.doi = stored.record.doi.clone();
        published.url = stored.record.url.clone();
        Ok(published)
    }

    fn get_status(&self, record: &RepositoryRecord) -> RepositoryResult<RecordState> {
        self.begin(MockCall::GetStatus { id: record.id.clone() })?;
        let mut state = self.lock();
        Ok(state.record_mut(&record.id)?.record.state)
    }

    fn fetch_record(&self, id: &str) -> RepositoryResult<RepositoryRecord> {
        self.begin(MockCall::FetchRecord { id: id.to_string() })?;
        let mut state = self.lock();
        Ok(state.record_mut(id)?.record.clone())
    }

    fn max_parallel_chunks(&self) -> usize {
        match self.backend {
            Backend::Zenodo => 1,
            Backend::Figshare => MOCK_PARALLEL_CHUNKS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hash_bytes;
    use fairops_rocrate::{Author, CrateBuilder, FileInfo};

    fn metadata(license: &str) -> MetadataCrate {
        CrateBuilder::new()
            .title("t")
            .author(Author::new("a"))
            .license(license)
            .file(FileInfo::new("f.tar", 10, "0".repeat(64)))
            .build()
            .unwrap()
    }

    fn upload_file(data: &[u8]) -> UploadFile {
        UploadFile {
            name: "f.tar".to_string(),
            size: data.len() as u64,
            checksums: hash_bytes(data),
        }
    }

    #[test]
    fn test_idempotency_key() {
        let repo = MockRepository::new(Backend::Zenodo);
        let a = repo.create_deposition(&metadata("MIT"), "k1").unwrap();
        let b = repo.create_deposition(&metadata("MIT"), "k1").unwrap();
        let c = repo.create_deposition(&metadata("MIT"), "k2").unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(repo.record_ids().len(), 2);
    }

    #[test]
    fn test_chunk_resend_does_not_duplicate() {
        let repo = MockRepository::new(Backend::Zenodo);
        let data = b"0123456789";
        let mut record = repo.create_deposition(&metadata("MIT"), "k").unwrap();
        repo.open_upload(&mut record, &upload_file(data)).unwrap();

        assert_eq!(repo.upload_chunk(&record, 0, &data[..5]).unwrap(), 5);
        assert_eq!(repo.upload_chunk(&record, 0, &data[..5]).unwrap(), 5);
        assert_eq!(repo.upload_chunk(&record, 5, &data[5..]).unwrap(), 10);
        assert_eq!(repo.stored_bytes(&record.id).unwrap(), data.to_vec());
    }

    #[test]
    fn test_part_size_stores_whole_parts() {
        let repo = MockRepository::new(Backend::Figshare).with_part_size(4);
        let data = b"0123456789";
        let mut record = repo.create_deposition(&metadata("MIT"), "k").unwrap();
        repo.open_upload(&mut record, &upload_file(data)).unwrap();

        assert_eq!(repo.upload_chunk(&record, 0, &data[..6]).unwrap(), 4);
        assert!(repo.upload_chunk(&record, 6, &data[6..]).is_err());
        assert_eq!(repo.upload_chunk(&record, 4, &data[4..]).unwrap(), 10);
        assert_eq!(repo.acknowledged(&record.id), Some(10));
    }

    #[test]
    fn test_finalize_requires_content_and_metadata() {
        let repo = MockRepository::new(Backend::Zenodo);
        let data = b"abc";
        let meta = metadata("MIT");
        let mut record = repo.create_deposition(&meta, "k").unwrap();

        assert!(matches!(repo.finalize(&record), Err(RepositoryError::InvalidState(_))));

        repo.attach_metadata(&mut record, &meta).unwrap();
        repo.open_upload(&mut record, &upload_file(data)).unwrap();
        repo.upload_chunk(&record, 0, data).unwrap();
        let checksum = repo.complete_upload(&mut record).unwrap();
        assert_eq!(checksum, Some(hash_bytes(data).md5));
        assert_eq!(record.state, RecordState::FilesAttached);

        let published = repo.finalize(&record).unwrap();
        assert_eq!(published.state, RecordState::Published);
        assert!(published.doi.is_some());
        assert!(matches!(repo.finalize(&record), Err(RepositoryError::InvalidState(_))));
        assert_eq!(repo.published_count(), 1);
    }

    #[test]
    fn test_corrupted_file_is_replaced_on_next_upload() {
        let repo = MockRepository::new(Backend::Zenodo);
        let data = b"0123456789";
        let meta = metadata("MIT");
        let mut record = repo.create_deposition(&meta, "k").unwrap();
        repo.attach_metadata(&mut record, &meta).unwrap();
        repo.open_upload(&mut record, &upload_file(data)).unwrap();
        repo.upload_chunk(&record, 0, data).unwrap();
        repo.complete_upload(&mut record).unwrap();

        // Intact: reused as is
        assert_eq!(repo.open_upload(&mut record, &upload_file(data)).unwrap(), 10);
        assert_eq!(record.state, RecordState::FilesAttached);

        assert!(repo.corrupt_stored(&record.id, 3));
        assert_ne!(repo.stored_bytes(&record.id).unwrap(), data.to_vec());
        assert_eq!(repo.open_upload(&mut record, &upload_file(data)).unwrap(), 0);
        assert_eq!(record.state, RecordState::Draft);
        assert_eq!(repo.record(&record.id).unwrap().state, RecordState::Draft);
        assert!(matches!(repo.finalize(&record), Err(RepositoryError::InvalidState(_))));

        repo.upload_chunk(&record, 0, data).unwrap();
        let checksum = repo.complete_upload(&mut record).unwrap();
        assert_eq!(checksum, Some(hash_bytes(data).md5));
        assert_eq!(repo.stored_bytes(&record.id).unwrap(), data.to_vec());
        assert_eq!(record.state, RecordState::FilesAttached);
    }

    #[test]
    fn test_rejected_license() {
        let repo = MockRepository::new(Backend::Figshare).with_rejected_license("Bogus-1.0");
        let meta = metadata("bogus-1.0");
        let mut record = repo.create_deposition(&meta, "k").unwrap();
        let err = repo.attach_metadata(&mut record, &meta).unwrap_err();
        assert!(matches!(err, RepositoryError::MetadataRejected { ref field, .. } if field == "license"));
    }

    #[test]
    fn test_deleted_record() {
        let repo = MockRepository::new(Backend::Zenodo);
        let record = repo.create_deposition(&metadata("MIT"), "k").unwrap();
        assert!(repo.delete_record(&record.id));
        assert!(matches!(repo.get_status(&record), Err(RepositoryError::RecordNotFound(_))));
        assert_eq!(repo.count(MockOp::GetStatus), 1);
    }
}
