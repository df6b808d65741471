//! Publish error taxonomy and stable exit codes

use serde::{Deserialize, Serialize};

use fairops_rocrate::CrateError;

use crate::config::ConfigError;
use crate::export::ExportError;
use crate::journal::JournalError;
use crate::repository::RepositoryError;
use crate::state::PublishStateError;
use crate::upload::UploadError;

/// Errors surfaced by the publish pipeline
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("export failed: {0}")]
    Export(#[from] ExportError),

    #[error("metadata validation failed: {0}")]
    MetadataValidation(#[from] CrateError),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("metadata rejected by repository ({field}): {message}")]
    MetadataRejected { field: String, message: String },

    #[error("repository request failed: {0}")]
    Repository(RepositoryError),

    #[error("upload failed at byte {acknowledged_offset}: {message}")]
    UploadFailed { acknowledged_offset: u64, message: String },

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("finalize failed: {0}")]
    Finalize(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("publish cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("publish state error: {0}")]
    State(#[from] PublishStateError),
}

impl PublishError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PublishError::Export(ExportError::Cancelled) => FailureKind::Cancelled,
            PublishError::Export(_) => FailureKind::Export,
            PublishError::MetadataValidation(_) => FailureKind::MetadataValidation,
            PublishError::Authentication(_) => FailureKind::Authentication,
            PublishError::MetadataRejected { .. } => FailureKind::MetadataRejected,
            PublishError::Repository(_) => FailureKind::Repository,
            PublishError::UploadFailed { .. } => FailureKind::UploadFailed,
            PublishError::Integrity(_) => FailureKind::Integrity,
            PublishError::Finalize(_) => FailureKind::Finalize,
            PublishError::RecordNotFound(_) => FailureKind::RecordNotFound,
            PublishError::Cancelled => FailureKind::Cancelled,
            PublishError::Config(_) | PublishError::Journal(_) | PublishError::State(_) => FailureKind::Config,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        self.kind().exit_code()
    }

    /// Wrap a repository error raised while finalizing.
    pub fn from_finalize(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Authentication(m) => PublishError::Authentication(m),
            RepositoryError::RecordNotFound(id) => PublishError::RecordNotFound(id),
            other => PublishError::Finalize(other.to_string()),
        }
    }
}

impl From<RepositoryError> for PublishError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Authentication(m) => PublishError::Authentication(m),
            RepositoryError::MetadataRejected { field, message } => PublishError::MetadataRejected { field, message },
            RepositoryError::RecordNotFound(id) => PublishError::RecordNotFound(id),
            other => PublishError::Repository(other),
        }
    }
}

impl From<UploadError> for PublishError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::UploadFailed {
                acknowledged_offset,
                attempts,
                source,
            } => PublishError::UploadFailed {
                acknowledged_offset,
                message: format!("{} (after {} attempts)", source, attempts),
            },
            UploadError::Rejected {
                acknowledged_offset,
                source,
            } => match source {
                RepositoryError::Authentication(_)
                | RepositoryError::RecordNotFound(_)
                | RepositoryError::MetadataRejected { .. } => source.into(),
                other => PublishError::UploadFailed {
                    acknowledged_offset,
                    message: other.to_string(),
                },
            },
            UploadError::Integrity { .. } | UploadError::ArchiveChanged(_) => {
                PublishError::Integrity(error.to_string())
            }
            UploadError::Cancelled { .. } => PublishError::Cancelled,
            UploadError::Io(e) => PublishError::UploadFailed {
                acknowledged_offset: 0,
                message: format!("reading archive: {}", e),
            },
        }
    }
}

/// Failure kind: the category of a failed publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Config,
    MetadataValidation,
    Authentication,
    Export,
    MetadataRejected,
    Repository,
    UploadFailed,
    Integrity,
    Finalize,
    RecordNotFound,
    Cancelled,
}

impl FailureKind {
    /// Get the stable exit code for this failure kind
    pub fn exit_code(&self) -> ExitCode {
        match self {
            FailureKind::Config => ExitCode::Config,
            FailureKind::MetadataValidation => ExitCode::MetadataValidation,
            FailureKind::Authentication => ExitCode::Authentication,
            FailureKind::Export => ExitCode::Export,
            FailureKind::MetadataRejected => ExitCode::MetadataRejected,
            FailureKind::Repository => ExitCode::Repository,
            FailureKind::UploadFailed => ExitCode::UploadFailed,
            FailureKind::Integrity => ExitCode::Integrity,
            FailureKind::Finalize => ExitCode::Finalize,
            FailureKind::RecordNotFound => ExitCode::RecordNotFound,
            FailureKind::Cancelled => ExitCode::Cancelled,
        }
    }

    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            FailureKind::Config => "Configuration error",
            FailureKind::MetadataValidation => "Metadata incomplete",
            FailureKind::Authentication => "Repository authentication failed",
            FailureKind::Export => "Artifact export failed",
            FailureKind::MetadataRejected => "Repository rejected metadata",
            FailureKind::Repository => "Repository request failed",
            FailureKind::UploadFailed => "Upload failed",
            FailureKind::Integrity => "Integrity check failed",
            FailureKind::Finalize => "Publication failed",
            FailureKind::RecordNotFound => "Draft record not found",
            FailureKind::Cancelled => "Publish cancelled",
        }
    }
}

/// Stable process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Config = 1,
    MetadataValidation = 10,
    Authentication = 20,
    Export = 30,
    MetadataRejected = 40,
    Repository = 45,
    UploadFailed = 50,
    Integrity = 60,
    Finalize = 70,
    RecordNotFound = 75,
    Cancelled = 80,
}

impl ExitCode {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}
