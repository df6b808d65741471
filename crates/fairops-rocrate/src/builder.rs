//! Validating builder for [`MetadataCrate`].
//!
//! Validation runs before any entity is assembled: a missing title, an empty
//! author list, or a missing license fails with [`CrateError::MissingField`]
//! naming the field, and no partial document is ever returned. Two authors
//! sharing one identifier would share one `Person` entity and are rejected.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::document::MetadataCrate;
use crate::entity::{Entity, EntityType};
use crate::error::CrateError;
use crate::{ARCHIVE_MEDIA_TYPE, METADATA_FILE, PROFILE_VERSION, RO_CRATE_CONTEXT, RO_CRATE_PROFILE, ROOT_ID};

/// A creator of the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    /// Persistent identifier, usually an ORCID URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

impl Author {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifier: None,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Parse `"Name"` or `"Name,identifier"`.
    pub fn parse(spec: &str) -> Self {
        match spec.split_once(',') {
            Some((name, id)) if !id.trim().is_empty() => {
                Author::new(name.trim()).with_identifier(id.trim())
            }
            Some((name, _)) => Author::new(name.trim()),
            None => Author::new(spec.trim()),
        }
    }
}

/// Facts about the archive file being described.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// SHA-256, lowercase hex.
    pub sha256: String,
    /// MD5, lowercase hex, when known.
    pub md5: Option<String>,
    pub media_type: String,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, size: u64, sha256: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            sha256: sha256.into(),
            md5: None,
            media_type: ARCHIVE_MEDIA_TYPE.to_string(),
        }
    }

    pub fn with_md5(mut self, md5: impl Into<String>) -> Self {
        self.md5 = Some(md5.into());
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = media_type.into();
        self
    }
}

/// Builder for a FAIROps crate.
#[derive(Debug, Clone, Default)]
pub struct CrateBuilder {
    title: Option<String>,
    description: Option<String>,
    license: Option<String>,
    authors: Vec<Author>,
    provenance: Vec<String>,
    file: Option<FileInfo>,
    image_reference: Option<String>,
    image_digest: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

impl CrateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// SPDX license identifier, e.g. `CC-BY-4.0`, or a license URL.
    pub fn license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }

    pub fn author(mut self, author: Author) -> Self {
        self.authors.push(author);
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = Author>) -> Self {
        self.authors.extend(authors);
        self
    }

    /// URI of an upstream pipeline run.
    pub fn provenance(mut self, uri: impl Into<String>) -> Self {
        self.provenance.push(uri.into());
        self
    }

    pub fn provenance_links(mut self, uris: impl IntoIterator<Item = String>) -> Self {
        self.provenance.extend(uris);
        self
    }

    pub fn file(mut self, file: FileInfo) -> Self {
        self.file = Some(file);
        self
    }

    /// Image reference (`repository:tag`) and resolved digest of the exported image.
    pub fn image(mut self, reference: impl Into<String>, digest: Option<String>) -> Self {
        self.image_reference = Some(reference.into());
        self.image_digest = digest;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Check required fields without building anything.
    pub fn validate(&self) -> Result<(), CrateError> {
        if self.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return Err(CrateError::MissingField("title"));
        }
        if self.authors.is_empty() {
            return Err(CrateError::MissingField("authors"));
        }
        if let Some(position) = self.authors.iter().position(|a| a.name.trim().is_empty()) {
            return Err(CrateError::InvalidField {
                field: "authors",
                reason: format!("author #{} has an empty name", position + 1),
            });
        }
        let mut seen = HashSet::new();
        for (position, author) in self.authors.iter().enumerate() {
            let Some(identifier) = author.identifier.as_deref().map(str::trim) else {
                continue;
            };
            if !seen.insert(identifier) {
                return Err(CrateError::InvalidField {
                    field: "authors",
                    reason: format!("author #{} repeats identifier {}", position + 1, identifier),
                });
            }
        }
        if self.license.as_deref().map_or(true, |l| l.trim().is_empty()) {
            return Err(CrateError::MissingField("license"));
        }

        let file = self.file.as_ref().ok_or(CrateError::MissingField("file"))?;
        if file.name.trim().is_empty() {
            return Err(CrateError::MissingField("file"));
        }
        if file.sha256.len() != 64 || !file.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CrateError::InvalidField {
                field: "file",
                reason: "sha256 must be 64 hex characters".to_string(),
            });
        }
        Ok(())
    }

    /// Validate and assemble the document.
    pub fn build(self) -> Result<MetadataCrate, CrateError> {
        self.validate()?;

        // validate() guarantees these are present
        let (Some(title), Some(license), Some(file)) = (self.title, self.license, self.file) else {
            return Err(CrateError::Malformed("builder state changed during build".to_string()));
        };

        let created_at = self.created_at.unwrap_or_else(Utc::now);
        let license_id = license_url(license.trim());

        let descriptor = Entity::new(METADATA_FILE, EntityType::CreativeWork)
            .with_property("conformsTo", json!({ "@id": RO_CRATE_PROFILE }))
            .with_property("version", PROFILE_VERSION)
            .with_reference("about", ROOT_ID);

        let author_ids: Vec<String> = self
            .authors
            .iter()
            .enumerate()
            .map(|(i, a)| {
                a.identifier
                    .as_deref()
                    .map(|id| id.trim().to_string())
                    .unwrap_or_else(|| format!("#author-{}", i + 1))
            })
            .collect();

        let mut root = Entity::new(ROOT_ID, EntityType::Dataset)
            .with_name(title.trim())
            .with_property(
                "datePublished",
                created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .with_reference("license", license_id.clone())
            .with_references("author", author_ids.clone())
            .with_references("hasPart", [file.name.clone()]);
        if let Some(description) = self.description.filter(|d| !d.trim().is_empty()) {
            root = root.with_property("description", description);
        }
        if !self.provenance.is_empty() {
            root = root.with_references("mentions", self.provenance.clone());
        }

        let mut file_entity = Entity::new(file.name.clone(), EntityType::File)
            .with_name(file.name.clone())
            .with_property("contentSize", file.size)
            .with_property("encodingFormat", file.media_type.clone())
            .with_property("sha256", file.sha256.to_ascii_lowercase());
        if let Some(md5) = &file.md5 {
            file_entity = file_entity.with_property("md5", md5.to_ascii_lowercase());
        }
        if let Some(reference) = &self.image_reference {
            file_entity = file_entity.with_property("alternateName", reference.clone());
        }
        if let Some(digest) = &self.image_digest {
            file_entity = file_entity.with_property("identifier", digest.clone());
        }

        let license_entity = Entity::new(license_id, EntityType::CreativeWork)
            .with_name(license.trim())
            .with_property("identifier", license.trim());

        let mut graph = vec![descriptor, root, file_entity, license_entity];

        for (author, id) in self.authors.iter().zip(&author_ids) {
            let mut person = Entity::new(id.clone(), EntityType::Person).with_name(author.name.trim());
            if let Some(identifier) = &author.identifier {
                person = person.with_property("identifier", identifier.clone());
            }
            graph.push(person);
        }

        for uri in &self.provenance {
            graph.push(
                Entity::new(uri.clone(), EntityType::CreateAction)
                    .with_name("Pipeline run")
                    .with_reference("result", file.name.clone()),
            );
        }

        Ok(MetadataCrate {
            context: json!(RO_CRATE_CONTEXT),
            graph,
        })
    }
}

/// `@id` of the license entity: URLs as given, SPDX identifiers resolved.
fn license_url(license: &str) -> String {
    if license.starts_with("https://") || license.starts_with("http://") {
        license.to_string()
    } else {
        format!("https://spdx.org/licenses/{}", license)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "4dd766dea72b9bcf1d36087dcc45ab6c93e1ce56fbadeedde7514cd1f6bbb90e";

    fn complete() -> CrateBuilder {
        CrateBuilder::new()
            .title("Alpine base image")
            .license("MIT")
            .author(Author::new("Ada Lovelace").with_identifier("https://orcid.org/0000-0001"))
            .file(FileInfo::new("alpine.3.20.tar", 1024, SHA))
    }

    #[test]
    fn test_author_parse() {
        assert_eq!(Author::parse("Ada"), Author::new("Ada"));
        assert_eq!(
            Author::parse("Ada Lovelace, https://orcid.org/1"),
            Author::new("Ada Lovelace").with_identifier("https://orcid.org/1")
        );
        assert_eq!(Author::parse("Ada,"), Author::new("Ada"));
    }

    #[test]
    fn test_missing_title() {
        let err = CrateBuilder::new()
            .license("MIT")
            .author(Author::new("Ada"))
            .file(FileInfo::new("a.tar", 1, SHA))
            .build()
            .unwrap_err();
        assert_eq!(err.field(), Some("title"));
    }

    #[test]
    fn test_blank_title_is_missing() {
        let err = complete().title("   ").build().unwrap_err();
        assert_eq!(err.field(), Some("title"));
    }

    #[test]
    fn test_missing_authors() {
        let err = CrateBuilder::new()
            .title("t")
            .license("MIT")
            .file(FileInfo::new("a.tar", 1, SHA))
            .build()
            .unwrap_err();
        assert_eq!(err.field(), Some("authors"));
        assert_eq!(err.to_string(), "missing required field: authors");
    }

    #[test]
    fn test_empty_author_name() {
        let err = complete().author(Author::new(" ")).build().unwrap_err();
        assert!(matches!(err, CrateError::InvalidField { field: "authors", .. }));
    }

    #[test]
    fn test_duplicate_author_identifier() {
        let err = complete()
            .author(Author::new("A. Lovelace").with_identifier(" https://orcid.org/0000-0001 "))
            .build()
            .unwrap_err();
        assert!(matches!(err, CrateError::InvalidField { field: "authors", ref reason } if reason.contains("#2")));

        // Authors without identifiers never collide
        let doc = complete()
            .author(Author::new("Grace Hopper"))
            .author(Author::new("Grace Hopper"))
            .build()
            .unwrap();
        assert_eq!(doc.authors().len(), 3);
    }

    #[test]
    fn test_license_url_used_as_is() {
        let url = "https://creativecommons.org/licenses/by/4.0/";
        let doc = complete().license(url).build().unwrap();
        assert_eq!(doc.license().as_deref(), Some(url));
        assert!(doc.entity(url).is_some());
        assert!(doc.entity(&format!("https://spdx.org/licenses/{}", url)).is_none());

        let doc = complete().license("CC-BY-4.0").build().unwrap();
        assert!(doc.entity("https://spdx.org/licenses/CC-BY-4.0").is_some());
    }

    #[test]
    fn test_missing_license() {
        let err = CrateBuilder::new()
            .title("t")
            .author(Author::new("Ada"))
            .file(FileInfo::new("a.tar", 1, SHA))
            .build()
            .unwrap_err();
        assert_eq!(err.field(), Some("license"));
    }

    #[test]
    fn test_bad_checksum() {
        let err = complete()
            .file(FileInfo::new("a.tar", 1, "not-a-digest"))
            .build()
            .unwrap_err();
        assert_eq!(err.field(), Some("file"));
    }

    #[test]
    fn test_build_layout() {
        let doc = complete()
            .description("Base layer")
            .author(Author::new("Grace Hopper"))
            .provenance("https://mlflow.example.org/#/experiments/1/runs/abc")
            .build()
            .unwrap();

        assert_eq!(doc.profile_version(), Some(PROFILE_VERSION));
        assert_eq!(doc.title(), Some("Alpine base image"));
        assert_eq!(doc.description(), Some("Base layer"));
        assert_eq!(doc.license().as_deref(), Some("MIT"));
        assert_eq!(doc.archive_name(), Some("alpine.3.20.tar"));
        assert_eq!(doc.archive_sha256(), Some(SHA));
        assert_eq!(doc.archive_size(), Some(1024));

        let authors = doc.authors();
        assert_eq!(authors.len(), 2);
        assert_eq!(authors[0].name, "Ada Lovelace");
        assert_eq!(authors[0].identifier.as_deref(), Some("https://orcid.org/0000-0001"));
        assert_eq!(authors[1].name, "Grace Hopper");
        assert!(authors[1].identifier.is_none());

        assert_eq!(
            doc.provenance(),
            vec!["https://mlflow.example.org/#/experiments/1/runs/abc"]
        );
    }
}
