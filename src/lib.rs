//! FAIROps Publish - archive computational artifacts in research repositories
//!
//! This crate exports a container image to a tar archive, describes it with
//! an RO-Crate metadata document, and deposits both in a research data
//! repository (Zenodo or Figshare) with chunked, resumable, verified uploads
//! before minting a DOI.

pub mod cancel;
pub mod checksum;
pub mod config;
pub mod error;
pub mod export;
pub mod journal;
pub mod mock;
pub mod pipeline;
pub mod repository;
pub mod state;
pub mod upload;

pub use cancel::CancelToken;
pub use config::{Credentials, PublishConfig};
pub use error::{ExitCode, FailureKind, PublishError};
pub use export::{Artifact, ArtifactExporter, DockerCli, ImageRef};
pub use pipeline::{PublishFailure, PublishOrchestrator, PublishOutcome, PublishRequest};
pub use repository::{build_client, Backend, RecordState, RepositoryClient, RepositoryRecord};
pub use state::PublishState;
pub use upload::UploadManager;

pub use fairops_rocrate as rocrate;
