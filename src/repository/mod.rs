//! Repository backends
//!
//! A [`RepositoryClient`] owns the lifecycle of one deposition record:
//! create draft, attach metadata, upload file content, finalize, and status
//! queries. Backends are chosen once from [`Backend`] by [`build_client`].
//!
//! Lifecycle of a record moves forward (`draft` → `files_attached` →
//! `published`). The one step back is a stored archive that fails
//! verification: the backend file is discarded and the record is a draft
//! again. Records themselves are never deleted here.
//!
//! A record counts as holding content only when the archive's own file is
//! listed and complete; the metadata document stored next to it does not
//! count.

mod figshare;
mod http;
mod zenodo;

pub use figshare::FigshareClient;
pub use http::HttpClient;
pub use zenodo::ZenodoClient;

use std::fmt;
use std::str::FromStr;

use fairops_rocrate::MetadataCrate;
use serde::{Deserialize, Serialize};

use crate::checksum::{Checksum, ChecksumSet};
use crate::config::{Credentials, PublishConfig};
use crate::export::Artifact;

/// Errors returned by repository operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("metadata rejected ({field}): {message}")]
    MetadataRejected { field: String, message: String },

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid record state: {0}")]
    InvalidState(String),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl RepositoryError {
    /// Timeouts, connection failures, 5xx and 429 may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Transient(_))
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Supported repository backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Zenodo,
    Figshare,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Zenodo => "zenodo",
            Backend::Figshare => "figshare",
        }
    }

    /// Environment variable holding this backend's API token.
    pub fn token_env_var(&self) -> &'static str {
        match self {
            Backend::Zenodo => crate::config::ZENODO_TOKEN_ENV,
            Backend::Figshare => crate::config::FIGSHARE_TOKEN_ENV,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zenodo" => Ok(Backend::Zenodo),
            "figshare" => Ok(Backend::Figshare),
            other => Err(format!("unknown repository target: {} (expected zenodo or figshare)", other)),
        }
    }
}

/// Lifecycle state of a deposition record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Draft,
    FilesAttached,
    Published,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordState::Draft => "draft",
            RecordState::FilesAttached => "files_attached",
            RecordState::Published => "published",
        };
        f.write_str(s)
    }
}

/// Backend-specific upload target, created by `open_upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadHandle {
    pub file_name: String,
    pub size: u64,
    /// Zenodo: bucket object URL. Figshare: upload-service session URL.
    pub location: String,
    /// Zenodo: multipart upload id. Figshare: article file id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// Fixed part size for part-based backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_size: Option<u64>,
}

/// A file to be uploaded as record content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub size: u64,
    pub checksums: ChecksumSet,
}

impl From<&Artifact> for UploadFile {
    fn from(artifact: &Artifact) -> Self {
        Self {
            name: artifact.file_name(),
            size: artifact.size,
            checksums: artifact.checksums.clone(),
        }
    }
}

/// The archive file a backend lists on a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredContent {
    pub name: String,
    pub size: u64,
    /// Checksum the backend computed over the stored bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
}

impl StoredContent {
    /// Whether the stored bytes are provably `file`'s bytes.
    pub fn matches(&self, file: &UploadFile) -> bool {
        self.name == file.name
            && self.size == file.size
            && self
                .checksum
                .as_ref()
                .is_some_and(|c| c == file.checksums.get(c.algorithm))
    }
}

/// A deposition record as seen by this client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub backend: Backend,
    pub id: String,
    pub state: RecordState,
    /// Backend resource used for content uploads (Zenodo bucket URL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadHandle>,
    #[serde(default)]
    pub metadata_attached: bool,
    #[serde(default)]
    pub content_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<StoredContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl RepositoryRecord {
    pub fn draft(backend: Backend, id: impl Into<String>) -> Self {
        Self {
            backend,
            id: id.into(),
            state: RecordState::Draft,
            location: None,
            upload: None,
            metadata_attached: false,
            content_complete: false,
            content: None,
            doi: None,
            url: None,
        }
    }

    /// Move to `state` if it is ahead of the current one; never moves back.
    pub fn advance(&mut self, state: RecordState) {
        if state > self.state {
            self.state = state;
        }
    }

    pub fn mark_metadata_attached(&mut self) {
        self.metadata_attached = true;
        self.refresh_attached();
    }

    fn mark_content_complete(&mut self) {
        self.content_complete = true;
        self.refresh_attached();
    }

    /// Record the completed archive file the backend holds.
    pub fn set_content(&mut self, content: StoredContent) {
        self.content = Some(content);
        self.mark_content_complete();
    }

    /// Forget stored content after the backend file was discarded.
    pub fn clear_content(&mut self) {
        self.content = None;
        self.content_complete = false;
        if self.state == RecordState::FilesAttached {
            self.state = RecordState::Draft;
        }
    }

    fn refresh_attached(&mut self) {
        if self.metadata_attached && self.content_complete {
            self.advance(RecordState::FilesAttached);
        }
    }

    pub fn is_published(&self) -> bool {
        self.state == RecordState::Published
    }
}

/// Operations every repository backend provides.
///
/// `upload_chunk` must be idempotent: re-sending an acknowledged range does
/// not duplicate stored bytes. The returned offset is what the backend holds
/// contiguously from byte zero and may trail `offset + data.len()`.
pub trait RepositoryClient: Send + Sync {
    fn backend(&self) -> Backend;

    /// Create a new draft. Real backends create one draft per call.
    fn create_deposition(
        &self,
        metadata: &MetadataCrate,
        idempotency_key: &str,
    ) -> RepositoryResult<RepositoryRecord>;

    /// Apply descriptive metadata and store the metadata document.
    fn attach_metadata(&self, record: &mut RepositoryRecord, metadata: &MetadataCrate) -> RepositoryResult<()>;

    /// Prepare the upload target; returns bytes the backend already holds.
    fn open_upload(&self, record: &mut RepositoryRecord, file: &UploadFile) -> RepositoryResult<u64>;

    fn upload_chunk(&self, record: &RepositoryRecord, offset: u64, data: &[u8]) -> RepositoryResult<u64>;

    /// Close the upload; returns the checksum the backend computed, if any.
    fn complete_upload(&self, record: &mut RepositoryRecord) -> RepositoryResult<Option<Checksum>>;

    /// Publish the draft. Irreversible.
    fn finalize(&self, record: &RepositoryRecord) -> RepositoryResult<RepositoryRecord>;

    fn get_status(&self, record: &RepositoryRecord) -> RepositoryResult<RecordState>;

    /// Load an existing record by id.
    fn fetch_record(&self, id: &str) -> RepositoryResult<RepositoryRecord>;

    /// Chunks that may be in flight at once. Backends needing ordered
    /// writes keep the default of 1.
    fn max_parallel_chunks(&self) -> usize {
        1
    }
}

/// Construct the client for `backend`. A missing token is an
/// authentication failure here, before any network traffic.
pub fn build_client(
    backend: Backend,
    config: &PublishConfig,
    credentials: &Credentials,
) -> RepositoryResult<Box<dyn RepositoryClient>> {
    let token = credentials
        .require(backend)
        .map_err(|e| RepositoryError::Authentication(e.to_string()))?;
    let http = HttpClient::new(&config.http, token, backend)?;
    Ok(match backend {
        Backend::Zenodo => Box::new(
            ZenodoClient::new(http, config.zenodo.effective_api_url()).with_part_size(config.upload.chunk_size_bytes),
        ),
        Backend::Figshare => Box::new(FigshareClient::new(http, &config.figshare.api_url)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!("zenodo".parse::<Backend>().unwrap(), Backend::Zenodo);
        assert_eq!("Figshare".parse::<Backend>().unwrap(), Backend::Figshare);
        assert!("dryad".parse::<Backend>().is_err());
        assert_eq!(Backend::Figshare.token_env_var(), "FIGSHARE_TOKEN");
    }

    #[test]
    fn test_record_state_is_monotonic() {
        let mut record = RepositoryRecord::draft(Backend::Zenodo, "1");
        record.mark_content_complete();
        assert_eq!(record.state, RecordState::Draft);

        record.mark_metadata_attached();
        assert_eq!(record.state, RecordState::FilesAttached);

        record.advance(RecordState::Published);
        record.advance(RecordState::Draft);
        assert_eq!(record.state, RecordState::Published);
    }

    #[test]
    fn test_discarded_content_returns_record_to_draft() {
        let mut record = RepositoryRecord::draft(Backend::Zenodo, "1");
        record.mark_metadata_attached();
        record.set_content(StoredContent {
            name: "a.tar".to_string(),
            size: 3,
            checksum: Some(crate::checksum::hash_bytes(b"abc").md5),
        });
        assert_eq!(record.state, RecordState::FilesAttached);

        record.clear_content();
        assert_eq!(record.state, RecordState::Draft);
        assert!(!record.content_complete);
        assert!(record.metadata_attached);

        let mut published = RepositoryRecord::draft(Backend::Zenodo, "2");
        published.advance(RecordState::Published);
        published.clear_content();
        assert_eq!(published.state, RecordState::Published);
    }

    #[test]
    fn test_stored_content_matches_by_checksum() {
        let data = b"archive bytes";
        let file = UploadFile {
            name: "a.tar".to_string(),
            size: data.len() as u64,
            checksums: crate::checksum::hash_bytes(data),
        };
        let mut stored = StoredContent {
            name: "a.tar".to_string(),
            size: file.size,
            checksum: Some(file.checksums.md5.clone()),
        };
        assert!(stored.matches(&file));

        stored.checksum = Some(crate::checksum::hash_bytes(b"archive bytez").md5);
        assert!(!stored.matches(&file));

        stored.checksum = None;
        assert!(!stored.matches(&file));
    }

    #[test]
    fn test_build_client_requires_token() {
        let config = PublishConfig::default();
        let err = build_client(Backend::Zenodo, &config, &Credentials::new())
            .err()
            .unwrap();
        assert!(matches!(err, RepositoryError::Authentication(_)));

        let creds = Credentials::new().with_token(Backend::Figshare, "t");
        let client = build_client(Backend::Figshare, &config, &creds).unwrap();
        assert_eq!(client.backend(), Backend::Figshare);
        assert!(client.max_parallel_chunks() > 1);
    }

    #[test]
    fn test_record_serialization() {
        let mut record = RepositoryRecord::draft(Backend::Figshare, "42");
        record.upload = Some(UploadHandle {
            file_name: "alpine.3.20.tar".to_string(),
            size: 10,
            location: "https://uploads.example/abc".to_string(),
            file_id: Some("7".to_string()),
            part_size: Some(4),
        });
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"backend\":\"figshare\""));
        assert!(json.contains("\"state\":\"draft\""));
        let parsed: RepositoryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
