//! Document format stability tests.
//!
//! A crate written by this library must parse back to the same graph, and a
//! previously published `fairops-crate@1` document must stay readable.

use chrono::{TimeZone, Utc};
use fairops_rocrate::{Author, CrateBuilder, FileInfo, MetadataCrate, PROFILE_VERSION};

const SHA: &str = "4dd766dea72b9bcf1d36087dcc45ab6c93e1ce56fbadeedde7514cd1f6bbb90e";

const PUBLISHED_V1: &str = r#"{
  "@context": "https://w3id.org/ro/crate/1.1/context",
  "@graph": [
    {
      "@id": "ro-crate-metadata.json",
      "@type": "CreativeWork",
      "about": { "@id": "./" },
      "conformsTo": { "@id": "https://w3id.org/ro/crate/1.1" },
      "version": "fairops-crate@1"
    },
    {
      "@id": "./",
      "@type": "Dataset",
      "author": [{ "@id": "https://orcid.org/0000-0002-1825-0097" }],
      "datePublished": "2025-03-01T12:00:00Z",
      "hasPart": [{ "@id": "alpine.3.20.tar" }],
      "license": { "@id": "https://spdx.org/licenses/CC-BY-4.0" },
      "mentions": [{ "@id": "https://mlflow.example.org/runs/7f3a" }],
      "name": "Alpine 3.20 training image"
    },
    {
      "@id": "alpine.3.20.tar",
      "@type": "File",
      "contentSize": 8388608,
      "encodingFormat": "application/x-tar",
      "md5": "9e107d9d372bb6826bd81d3542a419d6",
      "name": "alpine.3.20.tar",
      "sha256": "4dd766dea72b9bcf1d36087dcc45ab6c93e1ce56fbadeedde7514cd1f6bbb90e"
    },
    {
      "@id": "https://spdx.org/licenses/CC-BY-4.0",
      "@type": "CreativeWork",
      "identifier": "CC-BY-4.0",
      "name": "CC-BY-4.0"
    },
    {
      "@id": "https://orcid.org/0000-0002-1825-0097",
      "@type": "Person",
      "identifier": "https://orcid.org/0000-0002-1825-0097",
      "name": "Josiah Carberry"
    },
    {
      "@id": "https://mlflow.example.org/runs/7f3a",
      "@type": "CreateAction",
      "name": "Pipeline run",
      "result": { "@id": "alpine.3.20.tar" }
    }
  ]
}"#;

#[test]
fn test_written_document_parses_back_identically() {
    let built = CrateBuilder::new()
        .title("Alpine 3.20 training image")
        .license("CC-BY-4.0")
        .author(Author::new("Josiah Carberry").with_identifier("https://orcid.org/0000-0002-1825-0097"))
        .provenance("https://mlflow.example.org/runs/7f3a")
        .file(FileInfo::new("alpine.3.20.tar", 8_388_608, SHA).with_md5("9e107d9d372bb6826bd81d3542a419d6"))
        .created_at(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap())
        .build()
        .unwrap();

    let json = built.to_json().unwrap();
    let parsed = MetadataCrate::from_json(&json).unwrap();

    assert_eq!(parsed, built);
}

#[test]
fn test_builder_output_matches_published_v1_document() {
    let built = CrateBuilder::new()
        .title("Alpine 3.20 training image")
        .license("CC-BY-4.0")
        .author(Author::new("Josiah Carberry").with_identifier("https://orcid.org/0000-0002-1825-0097"))
        .provenance("https://mlflow.example.org/runs/7f3a")
        .file(FileInfo::new("alpine.3.20.tar", 8_388_608, SHA).with_md5("9e107d9d372bb6826bd81d3542a419d6"))
        .created_at(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap())
        .build()
        .unwrap();

    let published = MetadataCrate::from_json(PUBLISHED_V1).unwrap();
    assert_eq!(built, published);
}

#[test]
fn test_published_v1_document_is_readable() {
    let doc = MetadataCrate::from_json(PUBLISHED_V1).unwrap();

    assert_eq!(doc.profile_version(), Some(PROFILE_VERSION));
    assert_eq!(doc.title(), Some("Alpine 3.20 training image"));
    assert_eq!(doc.license().as_deref(), Some("CC-BY-4.0"));
    assert_eq!(doc.archive_sha256(), Some(SHA));
    assert_eq!(doc.archive_md5(), Some("9e107d9d372bb6826bd81d3542a419d6"));
    assert_eq!(doc.archive_size(), Some(8_388_608));
    assert_eq!(doc.provenance(), vec!["https://mlflow.example.org/runs/7f3a"]);

    let authors = doc.authors();
    assert_eq!(authors.len(), 1);
    assert_eq!(authors[0].name, "Josiah Carberry");
}

#[test]
fn test_document_with_reordered_graph_is_readable() {
    let mut value: serde_json::Value = serde_json::from_str(PUBLISHED_V1).unwrap();
    value["@graph"].as_array_mut().unwrap().reverse();

    let doc = MetadataCrate::from_json(&value.to_string()).unwrap();
    assert_eq!(doc.archive_sha256(), Some(SHA));
    assert_eq!(doc.title(), Some("Alpine 3.20 training image"));
}
