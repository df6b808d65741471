//! FAIROps RO-Crate documents
//!
//! Builds and parses the `ro-crate-metadata.json` document that describes a
//! published container archive: the archive file entity with its checksums,
//! ordered authors, the license, and provenance links to the pipeline runs
//! that produced the artifact.

pub mod builder;
pub mod document;
pub mod entity;
pub mod error;

pub use builder::{Author, CrateBuilder, FileInfo};
pub use document::MetadataCrate;
pub use entity::{Entity, EntityType};
pub use error::CrateError;

/// JSON-LD context for RO-Crate 1.1.
pub const RO_CRATE_CONTEXT: &str = "https://w3id.org/ro/crate/1.1/context";

/// RO-Crate specification the descriptor conforms to.
pub const RO_CRATE_PROFILE: &str = "https://w3id.org/ro/crate/1.1";

/// Identifier of the metadata descriptor entity (and the file name on disk).
pub const METADATA_FILE: &str = "ro-crate-metadata.json";

/// Identifier of the root dataset entity.
pub const ROOT_ID: &str = "./";

/// Versioned document profile. Bump only with a parser that still reads `@1`.
pub const PROFILE_VERSION: &str = "fairops-crate@1";

/// Media type recorded for exported image archives.
pub const ARCHIVE_MEDIA_TYPE: &str = "application/x-tar";
