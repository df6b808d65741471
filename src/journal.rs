//! Publish journal (`<archive>.<backend>.publish.json`)
//!
//! Written next to the archive after every completed step so an interrupted
//! publish can pick up its draft instead of creating a second one. Only the
//! record handle and the furthest completed step are persisted; the upload
//! offset is always re-read from the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::export::{Artifact, ImageRef};
use crate::repository::{Backend, RepositoryRecord};
use crate::state::{now_rfc3339, PublishState};

/// Schema version for publish journals
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "fairops/publish_journal@1";

/// Errors for journal operations
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported journal schema {found} (expected {expected})")]
    SchemaMismatch { found: String, expected: String },
}

/// Persisted progress of one publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishJournal {
    pub schema_version: u32,
    pub schema_id: String,
    pub backend: Backend,
    pub image: ImageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    /// Archive file name, relative to the journal's directory
    pub archive: String,
    pub archive_size: u64,
    pub archive_sha256: String,
    /// Key passed to `create_deposition`
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<RepositoryRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub furthest_completed: Option<PublishState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PublishJournal {
    pub fn new(backend: Backend, artifact: &Artifact, idempotency_key: impl Into<String>) -> Self {
        let now = now_rfc3339();
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            backend,
            image: artifact.image.clone(),
            image_digest: artifact.digest.clone(),
            archive: artifact.file_name(),
            archive_size: artifact.size,
            archive_sha256: artifact.checksums.sha256.hex.clone(),
            idempotency_key: idempotency_key.into(),
            record: None,
            furthest_completed: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Journal location for an archive and backend.
    pub fn path_for(archive: &Path, backend: Backend) -> PathBuf {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        archive.with_file_name(format!("{}.{}.publish.json", name, backend))
    }

    /// Whether this journal describes exactly these archive bytes.
    pub fn matches(&self, artifact: &Artifact, backend: Backend) -> bool {
        self.backend == backend
            && self.image == artifact.image
            && self.archive_size == artifact.size
            && self.archive_sha256 == artifact.checksums.sha256.hex
    }

    /// Record a completed step. Earlier steps never overwrite later ones.
    pub fn record_step(&mut self, step: PublishState) {
        let further = match (self.furthest_completed.and_then(|s| s.step_index()), step.step_index()) {
            (Some(current), Some(candidate)) => candidate > current,
            (None, Some(_)) => true,
            _ => false,
        };
        if further {
            self.furthest_completed = Some(step);
        }
        self.updated_at = now_rfc3339();
    }

    pub fn set_record(&mut self, record: &RepositoryRecord) {
        self.record = Some(record.clone());
        self.updated_at = now_rfc3339();
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON, rejecting other schemas
    pub fn from_json(json: &str) -> Result<Self, JournalError> {
        let journal: Self = serde_json::from_str(json)?;
        if journal.schema_id != SCHEMA_ID || journal.schema_version != SCHEMA_VERSION {
            return Err(JournalError::SchemaMismatch {
                found: format!("{} v{}", journal.schema_id, journal.schema_version),
                expected: format!("{} v{}", SCHEMA_ID, SCHEMA_VERSION),
            });
        }
        Ok(journal)
    }

    /// Write atomically via a temporary file and rename.
    pub fn write_to_file(&self, path: &Path) -> Result<(), JournalError> {
        let json = self.to_json()?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Load a journal; `None` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, JournalError> {
        match fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
