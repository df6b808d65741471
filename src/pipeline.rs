//! Publish pipeline orchestration
//!
//! Drives one artifact through export, metadata, draft creation, metadata
//! attachment, content upload and publication:
//! - each step is entered through [`PublishMachine`], so skipped or repeated
//!   steps are rejected
//! - a [`PublishJournal`] next to the archive records the draft handle after
//!   every completed step; a rerun with the same archive resumes that draft
//! - publication happens only after the upload was verified and is never
//!   retried automatically
//!
//! Failures are returned as [`PublishFailure`], which names the step that
//! failed, the furthest step that completed and the draft involved.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fairops_rocrate::{Author, CrateBuilder, FileInfo, MetadataCrate};

use crate::cancel::CancelToken;
use crate::checksum::hash_file;
use crate::config::UploadConfig;
use crate::error::{ExitCode, FailureKind, PublishError};
use crate::export::{Artifact, ArtifactExporter, ImageRef};
use crate::journal::PublishJournal;
use crate::repository::{RecordState, RepositoryClient, RepositoryError, RepositoryRecord, UploadFile};
use crate::state::{PublishMachine, PublishState, Transition};
use crate::upload::{ProgressSink, TracingProgress, UploadManager, UploadOutcome};

/// What to publish and how to describe it
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub image: ImageRef,
    pub output_dir: PathBuf,
    pub title: String,
    pub description: Option<String>,
    pub authors: Vec<Author>,
    /// SPDX license identifier
    pub license: Option<String>,
    /// Upstream pipeline run URIs
    pub provenance: Vec<String>,
}

impl PublishRequest {
    pub fn new(image: ImageRef, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            image,
            output_dir: output_dir.into(),
            title: String::new(),
            description: None,
            authors: Vec::new(),
            license: None,
            provenance: Vec::new(),
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn author(mut self, author: Author) -> Self {
        self.authors.push(author);
        self
    }

    pub fn license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }

    pub fn provenance(mut self, uri: impl Into<String>) -> Self {
        self.provenance.push(uri.into());
        self
    }

    /// Path of the archive this request exports to.
    pub fn archive_path(&self) -> PathBuf {
        self.output_dir.join(self.image.archive_file_name())
    }

    /// Build the metadata document for an exported artifact.
    pub fn build_metadata(&self, artifact: &Artifact, created_at: DateTime<Utc>) -> Result<MetadataCrate, PublishError> {
        let file = FileInfo::new(artifact.file_name(), artifact.size, artifact.checksums.sha256.hex.clone())
            .with_md5(artifact.checksums.md5.hex.clone())
            .with_media_type("application/x-tar");

        let mut builder = CrateBuilder::new()
            .title(self.title.clone())
            .authors(self.authors.iter().cloned())
            .provenance_links(self.provenance.iter().cloned())
            .file(file)
            .image(artifact.image.to_string(), artifact.digest.clone())
            .created_at(created_at);
        if let Some(description) = &self.description {
            builder = builder.description(description.clone());
        }
        if let Some(license) = &self.license {
            builder = builder.license(license.clone());
        }
        Ok(builder.build()?)
    }
}

/// Result of a successful publish
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub record: RepositoryRecord,
    pub artifact: Artifact,
    pub metadata: MetadataCrate,
    /// `None` when the record was found already published
    pub upload: Option<UploadOutcome>,
    /// Whether a journal from an earlier attempt was used
    pub resumed: bool,
    pub journal_path: PathBuf,
    pub transitions: Vec<Transition>,
}

/// A failed publish attempt
#[derive(Debug, thiserror::Error)]
#[error("{error} (failed during {failed_step})")]
pub struct PublishFailure {
    #[source]
    pub error: PublishError,
    pub failed_step: PublishState,
    pub furthest_completed: Option<PublishState>,
    pub record_id: Option<String>,
    /// Bytes the backend holds, when the failure happened during upload
    pub resume_offset: Option<u64>,
    pub transitions: Vec<Transition>,
}

impl PublishFailure {
    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }

    pub fn exit_code(&self) -> ExitCode {
        self.error.exit_code()
    }
}

/// Per-attempt bookkeeping used to build a [`PublishFailure`].
struct Attempt {
    machine: PublishMachine,
    record_id: Option<String>,
    resume_offset: Option<u64>,
}

impl Attempt {
    fn new() -> Self {
        Self {
            machine: PublishMachine::new(),
            record_id: None,
            resume_offset: None,
        }
    }

    fn enter(&mut self, step: PublishState) -> Result<(), PublishError> {
        self.machine.transition(step)?;
        info!(step = %step, record_id = self.record_id.as_deref().unwrap_or("-"), "publish step");
        Ok(())
    }

    fn into_failure(mut self, error: PublishError) -> PublishFailure {
        let failed_step = self.machine.fail();
        PublishFailure {
            error,
            failed_step,
            furthest_completed: self.machine.furthest_completed(),
            record_id: self.record_id,
            resume_offset: self.resume_offset,
            transitions: self.machine.transitions().to_vec(),
        }
    }
}

/// Draft state carried from creation through publication.
struct Draft {
    artifact: Artifact,
    metadata: MetadataCrate,
    record: RepositoryRecord,
    journal: PublishJournal,
    journal_path: PathBuf,
    resumed: bool,
}

/// Sequences the publish steps against one repository backend.
pub struct PublishOrchestrator {
    exporter: ArtifactExporter,
    client: Arc<dyn RepositoryClient>,
    upload: UploadConfig,
    cancel: CancelToken,
    progress: Arc<dyn ProgressSink>,
    journal: bool,
}

impl PublishOrchestrator {
    pub fn new(exporter: ArtifactExporter, client: Arc<dyn RepositoryClient>) -> Self {
        Self {
            exporter,
            client,
            upload: UploadConfig::default(),
            cancel: CancelToken::new(),
            progress: Arc::new(TracingProgress::new()),
            journal: true,
        }
    }

    pub fn with_upload_config(mut self, upload: UploadConfig) -> Self {
        self.upload = upload;
        self
    }

    /// Share a cancellation token with the exporter and uploader.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.exporter = self.exporter.with_cancel(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Disable reading and writing the publish journal.
    pub fn with_journal(mut self, enabled: bool) -> Self {
        self.journal = enabled;
        self
    }

    pub fn client(&self) -> &dyn RepositoryClient {
        self.client.as_ref()
    }

    /// Run the full pipeline, resuming from a matching journal if present.
    pub fn publish(&self, request: &PublishRequest) -> Result<PublishOutcome, PublishFailure> {
        let mut attempt = Attempt::new();
        match self.run_publish(request, &mut attempt) {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let failure = attempt.into_failure(error);
                warn!(
                    step = %failure.failed_step,
                    kind = ?failure.kind(),
                    record_id = failure.record_id.as_deref().unwrap_or("-"),
                    error = %failure.error,
                    "publish failed"
                );
                Err(failure)
            }
        }
    }

    /// Publish an existing draft whose content and metadata are in place.
    ///
    /// The draft's stored archive must be `archive`: same name, size and
    /// checksum as the local file. Nothing is published otherwise.
    pub fn finalize_only(&self, record_id: &str, archive: &Path) -> Result<RepositoryRecord, PublishFailure> {
        let mut attempt = Attempt::new();
        attempt.record_id = Some(record_id.to_string());
        self.run_finalize(record_id, archive, &mut attempt)
            .map_err(|error| attempt.into_failure(error))
    }

    /// Current backend view of a record.
    pub fn status(&self, record_id: &str) -> Result<RepositoryRecord, PublishError> {
        Ok(self.client.fetch_record(record_id)?)
    }

    fn run_publish(&self, request: &PublishRequest, attempt: &mut Attempt) -> Result<PublishOutcome, PublishError> {
        let backend = self.client.backend();
        let journal_path = PublishJournal::path_for(&request.archive_path(), backend);

        let draft = match self.resumable(request, &journal_path)? {
            Some((journal, artifact)) => {
                match self.resume_draft(request, attempt, journal, artifact, &journal_path)? {
                    Resumed::Draft(draft) => draft,
                    Resumed::Published(outcome) => return Ok(outcome),
                }
            }
            None => self.create_draft(request, attempt, &journal_path)?,
        };
        self.complete_draft(attempt, draft)
    }

    /// Load the journal if it describes the archive currently on disk.
    fn resumable(
        &self,
        request: &PublishRequest,
        journal_path: &Path,
    ) -> Result<Option<(PublishJournal, Artifact)>, PublishError> {
        if !self.journal {
            return Ok(None);
        }
        let journal = match PublishJournal::load(journal_path) {
            Ok(Some(journal)) => journal,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(path = %journal_path.display(), error = %e, "ignoring unreadable publish journal");
                return Ok(None);
            }
        };
        if journal.record.is_none() || journal.image != request.image {
            return Ok(None);
        }

        let archive = request.archive_path();
        if !archive.is_file() {
            debug!(path = %archive.display(), "journal archive missing, starting over");
            return Ok(None);
        }
        let artifact = Artifact::from_archive(journal.image.clone(), journal.image_digest.clone(), &archive)?;
        if !journal.matches(&artifact, self.client.backend()) {
            info!(path = %archive.display(), "archive changed since last attempt, starting over");
            return Ok(None);
        }
        Ok(Some((journal, artifact)))
    }

    fn create_draft(
        &self,
        request: &PublishRequest,
        attempt: &mut Attempt,
        journal_path: &Path,
    ) -> Result<Draft, PublishError> {
        attempt.enter(PublishState::Exporting)?;
        self.check_cancel()?;
        let artifact = self.exporter.export(&request.image, &request.output_dir)?;
        let mut journal = PublishJournal::new(self.client.backend(), &artifact, Uuid::new_v4().to_string());
        journal.record_step(PublishState::Exporting);

        attempt.enter(PublishState::BuildingMetadata)?;
        let metadata = request.build_metadata(&artifact, journal.created_at)?;
        journal.record_step(PublishState::BuildingMetadata);

        attempt.enter(PublishState::CreatingDeposition)?;
        self.check_cancel()?;
        let record = self.client.create_deposition(&metadata, &journal.idempotency_key)?;
        attempt.record_id = Some(record.id.clone());
        info!(record_id = %record.id, backend = %record.backend, "draft created");
        journal.set_record(&record);
        journal.record_step(PublishState::CreatingDeposition);
        self.save_journal(&journal, journal_path);

        Ok(Draft {
            artifact,
            metadata,
            record,
            journal,
            journal_path: journal_path.to_path_buf(),
            resumed: false,
        })
    }

    fn resume_draft(
        &self,
        request: &PublishRequest,
        attempt: &mut Attempt,
        mut journal: PublishJournal,
        artifact: Artifact,
        journal_path: &Path,
    ) -> Result<Resumed, PublishError> {
        let Some(mut record) = journal.record.clone() else {
            return Err(PublishError::RecordNotFound("journal has no record".to_string()));
        };
        attempt.machine = PublishMachine::resumed(journal.furthest_completed);
        attempt.record_id = Some(record.id.clone());
        info!(
            record_id = %record.id,
            furthest = ?journal.furthest_completed,
            "resuming publish"
        );

        // Same inputs and timestamp as the first attempt
        let metadata = request.build_metadata(&artifact, journal.created_at)?;

        match self.client.get_status(&record) {
            Ok(RecordState::Published) => {
                let published = self.client.fetch_record(&record.id)?;
                info!(record_id = %published.id, doi = ?published.doi, "record already published");
                attempt.enter(PublishState::Done)?;
                journal.set_record(&published);
                journal.record_step(PublishState::Done);
                self.save_journal(&journal, journal_path);
                return Ok(Resumed::Published(PublishOutcome {
                    record: published,
                    artifact,
                    metadata,
                    upload: None,
                    resumed: true,
                    journal_path: journal_path.to_path_buf(),
                    transitions: attempt.machine.transitions().to_vec(),
                }));
            }
            Ok(state) => record.advance(state),
            Err(RepositoryError::RecordNotFound(id)) => {
                warn!(record_id = %id, "draft no longer exists, creating a new one");
                attempt.machine = PublishMachine::resumed(Some(PublishState::BuildingMetadata));
                journal.furthest_completed = Some(PublishState::BuildingMetadata);
                journal.idempotency_key = Uuid::new_v4().to_string();

                attempt.enter(PublishState::CreatingDeposition)?;
                self.check_cancel()?;
                record = self.client.create_deposition(&metadata, &journal.idempotency_key)?;
                attempt.record_id = Some(record.id.clone());
                info!(record_id = %record.id, backend = %record.backend, "draft created");
                journal.set_record(&record);
                journal.record_step(PublishState::CreatingDeposition);
                self.save_journal(&journal, journal_path);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Resumed::Draft(Draft {
            artifact,
            metadata,
            record,
            journal,
            journal_path: journal_path.to_path_buf(),
            resumed: true,
        }))
    }

    fn complete_draft(&self, attempt: &mut Attempt, draft: Draft) -> Result<PublishOutcome, PublishError> {
        let Draft {
            artifact,
            metadata,
            mut record,
            mut journal,
            journal_path,
            resumed,
        } = draft;

        if !record.metadata_attached {
            attempt.enter(PublishState::AttachingMetadata)?;
            self.check_cancel()?;
            self.client.attach_metadata(&mut record, &metadata)?;
            journal.set_record(&record);
            journal.record_step(PublishState::AttachingMetadata);
            self.save_journal(&journal, &journal_path);
        }

        attempt.enter(PublishState::Uploading)?;
        let manager = UploadManager::from_config(self.client.as_ref(), &self.upload)
            .with_cancel(self.cancel.clone())
            .with_progress(self.progress.clone());
        let file = UploadFile::from(&artifact);
        let upload = match manager.upload(&mut record, &artifact.path, &file, None) {
            Ok(outcome) => outcome,
            Err(e) => {
                attempt.resume_offset = e.acknowledged_offset();
                return Err(e.into());
            }
        };
        attempt.resume_offset = Some(upload.acknowledged);
        if upload.acknowledged != artifact.size {
            return Err(PublishError::Integrity(format!(
                "{} of {} bytes acknowledged",
                upload.acknowledged, artifact.size
            )));
        }
        journal.set_record(&record);
        journal.record_step(PublishState::Uploading);
        self.save_journal(&journal, &journal_path);

        if record.state != RecordState::FilesAttached {
            return Err(PublishError::Finalize(format!(
                "record {} is {} after upload, expected {}",
                record.id,
                record.state,
                RecordState::FilesAttached
            )));
        }

        attempt.enter(PublishState::Finalizing)?;
        self.check_cancel()?;
        let published = self.client.finalize(&record).map_err(PublishError::from_finalize)?;
        attempt.enter(PublishState::Done)?;
        info!(record_id = %published.id, doi = ?published.doi, url = ?published.url, "record published");

        journal.set_record(&published);
        journal.record_step(PublishState::Done);
        self.save_journal(&journal, &journal_path);

        Ok(PublishOutcome {
            record: published,
            artifact,
            metadata,
            upload: Some(upload),
            resumed,
            journal_path,
            transitions: attempt.machine.transitions().to_vec(),
        })
    }

    fn run_finalize(
        &self,
        record_id: &str,
        archive: &Path,
        attempt: &mut Attempt,
    ) -> Result<RepositoryRecord, PublishError> {
        attempt.enter(PublishState::Finalizing)?;
        let record = self.client.fetch_record(record_id)?;
        if record.is_published() {
            info!(record_id, doi = ?record.doi, "record already published");
            attempt.enter(PublishState::Done)?;
            return Ok(record);
        }
        if record.state != RecordState::FilesAttached {
            return Err(PublishError::Finalize(format!(
                "record {} is {}; content and metadata must be attached before publishing",
                record_id, record.state
            )));
        }

        let (size, checksums) = hash_file(archive)
            .map_err(|e| PublishError::Integrity(format!("cannot read {}: {}", archive.display(), e)))?;
        let local = UploadFile {
            name: archive
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            size,
            checksums,
        };
        match &record.content {
            Some(stored) if stored.matches(&local) => {
                debug!(record_id, file = %stored.name, "stored archive matches local archive");
            }
            Some(stored) => {
                return Err(PublishError::Integrity(format!(
                    "record {} holds {} ({} bytes, {}), local archive is {} ({} bytes, {})",
                    record_id,
                    stored.name,
                    stored.size,
                    stored
                        .checksum
                        .as_ref()
                        .map_or_else(|| "no checksum".to_string(), |c| c.to_string()),
                    local.name,
                    local.size,
                    local.checksums.md5
                )));
            }
            None => {
                return Err(PublishError::Integrity(format!(
                    "record {} lists no archive file",
                    record_id
                )));
            }
        }

        self.check_cancel()?;
        let published = self.client.finalize(&record).map_err(PublishError::from_finalize)?;
        attempt.enter(PublishState::Done)?;
        info!(record_id, doi = ?published.doi, "record published");
        Ok(published)
    }

    fn check_cancel(&self) -> Result<(), PublishError> {
        if self.cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }
        Ok(())
    }

    fn save_journal(&self, journal: &PublishJournal, path: &Path) {
        if !self.journal {
            return;
        }
        // A lost journal only costs the ability to resume
        if let Err(e) = journal.write_to_file(path) {
            warn!(path = %path.display(), error = %e, "failed to write publish journal");
        }
    }
}

enum Resumed {
    Draft(Draft),
    Published(PublishOutcome),
}
