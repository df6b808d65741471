//! The crate document and its read accessors.
//!
//! Accessors locate entities by role (descriptor, root dataset, archive file,
//! provenance actions) rather than by position, so documents reordered or
//! extended by other RO-Crate tools stay readable.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::builder::Author;
use crate::entity::{Entity, EntityType};
use crate::error::CrateError;
use crate::{METADATA_FILE, ROOT_ID};

/// A validated RO-Crate metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataCrate {
    #[serde(rename = "@context")]
    pub context: serde_json::Value,

    #[serde(rename = "@graph")]
    pub graph: Vec<Entity>,
}

impl MetadataCrate {
    /// Parse a document and check it carries the entities every crate needs.
    pub fn from_json(json: &str) -> Result<Self, CrateError> {
        let parsed: Self = serde_json::from_str(json)?;
        parsed.check_structure()?;
        Ok(parsed)
    }

    pub fn from_file(path: &Path) -> Result<Self, CrateError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| CrateError::Malformed(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn to_json(&self) -> Result<String, CrateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), CrateError> {
        let json = self.to_json()?;
        fs::write(path, json)
            .map_err(|e| CrateError::Malformed(format!("{}: {}", path.display(), e)))
    }

    fn check_structure(&self) -> Result<(), CrateError> {
        if self.entity(METADATA_FILE).is_none() {
            return Err(CrateError::Malformed(format!("no {} descriptor", METADATA_FILE)));
        }
        if self.root().is_none() {
            return Err(CrateError::Malformed("no root dataset".to_string()));
        }
        if self.archive_file().is_none() {
            return Err(CrateError::Malformed("no file entity in hasPart".to_string()));
        }
        Ok(())
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.graph.iter().find(|e| e.id == id)
    }

    /// The root dataset, as named by the descriptor's `about`, falling back to `./`.
    pub fn root(&self) -> Option<&Entity> {
        let root_id = self
            .entity(METADATA_FILE)
            .and_then(|d| d.references("about").into_iter().next())
            .unwrap_or_else(|| ROOT_ID.to_string());
        self.entity(&root_id)
    }

    /// Profile version recorded on the descriptor.
    pub fn profile_version(&self) -> Option<&str> {
        self.entity(METADATA_FILE)?.str_property("version")
    }

    pub fn title(&self) -> Option<&str> {
        self.root()?.str_property("name")
    }

    pub fn description(&self) -> Option<&str> {
        self.root()?.str_property("description")
    }

    /// License identifier (SPDX id when the license entity carries one).
    pub fn license(&self) -> Option<String> {
        let license_id = self.root()?.references("license").into_iter().next()?;
        match self.entity(&license_id) {
            Some(entity) => entity
                .str_property("identifier")
                .map(String::from)
                .or(Some(license_id)),
            None => Some(license_id),
        }
    }

    /// Authors in document order.
    pub fn authors(&self) -> Vec<Author> {
        let Some(root) = self.root() else {
            return Vec::new();
        };
        root.references("author")
            .iter()
            .filter_map(|id| self.entity(id))
            .map(|person| Author {
                name: person.str_property("name").unwrap_or_default().to_string(),
                identifier: person.str_property("identifier").map(String::from),
            })
            .collect()
    }

    /// The first `File` entity listed in the root's `hasPart`.
    pub fn archive_file(&self) -> Option<&Entity> {
        self.root()?
            .references("hasPart")
            .iter()
            .filter_map(|id| self.entity(id))
            .find(|e| e.is_type(&EntityType::File))
    }

    pub fn archive_name(&self) -> Option<&str> {
        self.archive_file().map(|e| e.id.as_str())
    }

    pub fn archive_size(&self) -> Option<u64> {
        self.archive_file()?.u64_property("contentSize")
    }

    /// SHA-256 of the archive, lowercase hex.
    pub fn archive_sha256(&self) -> Option<&str> {
        self.archive_file()?.str_property("sha256")
    }

    pub fn archive_md5(&self) -> Option<&str> {
        self.archive_file()?.str_property("md5")
    }

    /// Provenance URIs (pipeline runs), in graph order.
    pub fn provenance(&self) -> Vec<&str> {
        self.graph
            .iter()
            .filter(|e| e.is_type(&EntityType::CreateAction))
            .map(|e| e.id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_json() -> serde_json::Value {
        json!({
            "@context": "https://w3id.org/ro/crate/1.1/context",
            "@graph": [
                {
                    "@id": "ro-crate-metadata.json",
                    "@type": "CreativeWork",
                    "about": { "@id": "./" }
                },
                {
                    "@id": "./",
                    "@type": "Dataset",
                    "name": "Image",
                    "license": { "@id": "MIT" },
                    "hasPart": [{ "@id": "alpine.3.20.tar" }],
                    "extraProperty": { "nested": true }
                },
                {
                    "@id": "alpine.3.20.tar",
                    "@type": "File",
                    "contentSize": 1024,
                    "sha256": "ab"
                }
            ]
        })
    }

    #[test]
    fn test_parse_tolerates_unknown_properties() {
        let doc = MetadataCrate::from_json(&minimal_json().to_string()).unwrap();
        assert_eq!(doc.title(), Some("Image"));
        assert_eq!(doc.archive_sha256(), Some("ab"));
        assert_eq!(doc.archive_size(), Some(1024));
        assert_eq!(doc.license().as_deref(), Some("MIT"));
        assert!(doc.provenance().is_empty());
        assert!(doc.profile_version().is_none());
    }

    #[test]
    fn test_parse_rejects_missing_descriptor() {
        let mut value = minimal_json();
        value["@graph"].as_array_mut().unwrap().remove(0);

        let err = MetadataCrate::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, CrateError::Malformed(_)));
    }

    #[test]
    fn test_parse_rejects_missing_file() {
        let mut value = minimal_json();
        value["@graph"].as_array_mut().unwrap().remove(2);

        let err = MetadataCrate::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, CrateError::Malformed(_)));
    }

    #[test]
    fn test_parse_invalid_json() {
        let err = MetadataCrate::from_json("{not json").unwrap_err();
        assert!(matches!(err, CrateError::Json(_)));
    }
}
