//! Zenodo deposition API
//!
//! Content goes to the deposition's bucket. Archives up to one part are sent
//! with a single object `PUT`; larger ones use the bucket's multipart
//! uploads (`?uploads` to start, `?uploadId=&partNumber=` per part, `POST
//! ?uploadId=` to complete). Parts are numbered from zero and may arrive in
//! any order. An unfinished multipart upload is found again through the
//! bucket's upload listing, so a later run resumes it.
//!
//! An object only shows up in the deposition's file list once complete.

use std::collections::BTreeSet;

use fairops_rocrate::{MetadataCrate, METADATA_FILE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::checksum::Checksum;
use crate::config::DEFAULT_CHUNK_SIZE_BYTES;

use super::http::{check_status, classify_status, id_string, read_json, HttpClient};
use super::{
    Backend, RecordState, RepositoryClient, RepositoryError, RepositoryRecord, RepositoryResult, StoredContent,
    UploadFile, UploadHandle,
};

const ORCID_PREFIX: &str = "https://orcid.org/";

/// Parts sent concurrently to one multipart upload.
const MAX_PARALLEL_PARTS: usize = 4;

pub struct ZenodoClient {
    http: HttpClient,
    api_url: String,
    part_size: u64,
}

#[derive(Debug, Deserialize)]
struct DepositionFile {
    filename: String,
    #[serde(default)]
    filesize: u64,
    #[serde(default)]
    checksum: Option<String>,
}

impl DepositionFile {
    fn content(&self) -> StoredContent {
        StoredContent {
            name: self.filename.clone(),
            size: self.filesize,
            checksum: self.checksum.as_deref().and_then(|c| c.parse::<Checksum>().ok()),
        }
    }
}

/// A multipart upload as the bucket reports it
#[derive(Debug, Clone)]
struct Multipart {
    id: String,
    part_size: u64,
}

impl ZenodoClient {
    pub fn new(http: HttpClient, api_url: &str) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            part_size: DEFAULT_CHUNK_SIZE_BYTES,
        }
    }

    /// Part size for new multipart uploads.
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    fn deposition_url(&self, id: &str) -> String {
        format!("{}/deposit/depositions/{}", self.api_url, id)
    }

    fn bucket<'a>(&self, record: &'a RepositoryRecord) -> RepositoryResult<&'a str> {
        record
            .location
            .as_deref()
            .map(|b| b.trim_end_matches('/'))
            .ok_or_else(|| RepositoryError::InvalidState(format!("deposition {} has no bucket link", record.id)))
    }

    fn list_files(&self, record: &RepositoryRecord) -> RepositoryResult<Vec<DepositionFile>> {
        self.http.get_json(&format!("{}/files", self.deposition_url(&record.id)))
    }

    fn stored_file(&self, record: &RepositoryRecord, name: &str) -> RepositoryResult<Option<DepositionFile>> {
        Ok(self.list_files(record)?.into_iter().find(|f| f.filename == name))
    }

    /// An unfinished multipart upload of `key` with the same total size.
    fn pending_multipart(&self, bucket: &str, key: &str, size: u64) -> RepositoryResult<Option<Multipart>> {
        let body: Value = self.http.get_json(&format!("{}?uploads", bucket))?;
        let uploads = body
            .as_array()
            .or_else(|| body["contents"].as_array())
            .cloned()
            .unwrap_or_default();
        Ok(uploads
            .iter()
            .filter(|u| u["key"].as_str() == Some(key) && u["size"].as_u64() == Some(size))
            .filter(|u| !u["completed"].as_bool().unwrap_or(false))
            .find_map(multipart_from))
    }

    fn start_multipart(&self, object: &str, size: u64) -> RepositoryResult<Multipart> {
        let url = format!("{}?uploads&size={}&partSize={}", object, size, self.part_size);
        let body: Value = read_json(self.http.post_empty(&url)?)?;
        let mut upload = multipart_from(&body)
            .ok_or_else(|| RepositoryError::Protocol("multipart upload response without id".to_string()))?;
        if upload.part_size == 0 {
            upload.part_size = self.part_size;
        }
        Ok(upload)
    }

    /// Part numbers the bucket already holds for an upload.
    fn uploaded_parts(&self, object: &str, upload_id: &str) -> RepositoryResult<(BTreeSet<u64>, bool)> {
        let body: Value = self.http.get_json(&multipart_url(object, upload_id))?;
        let parts = body["parts"]
            .as_array()
            .map(|parts| parts.iter().filter_map(|p| p["part_number"].as_u64()).collect())
            .unwrap_or_default();
        Ok((parts, body["completed"].as_bool().unwrap_or(false)))
    }

    fn record_from_deposition(&self, body: &Value) -> RepositoryResult<RepositoryRecord> {
        let id = id_string(&body["id"])
            .ok_or_else(|| RepositoryError::Protocol("deposition response without id".to_string()))?;
        let mut record = RepositoryRecord::draft(Backend::Zenodo, id);
        record.location = body["links"]["bucket"].as_str().map(String::from);

        if body["metadata"]["title"].as_str().is_some_and(|t| !t.is_empty()) {
            record.mark_metadata_attached();
        }
        let files: Vec<DepositionFile> = body["files"]
            .as_array()
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| serde_json::from_value(f.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        if let Some(archive) = archive_file(&files) {
            record.set_content(archive.content());
        }
        if is_submitted(body) {
            record.advance(RecordState::Published);
            record.doi = body["doi"].as_str().filter(|d| !d.is_empty()).map(String::from);
            record.url = body["links"]["record_html"]
                .as_str()
                .or_else(|| body["links"]["html"].as_str())
                .map(String::from);
        }
        Ok(record)
    }
}

impl RepositoryClient for ZenodoClient {
    fn backend(&self) -> Backend {
        Backend::Zenodo
    }

    fn create_deposition(&self, _metadata: &MetadataCrate, _idempotency_key: &str) -> RepositoryResult<RepositoryRecord> {
        let url = format!("{}/deposit/depositions", self.api_url);
        let body: Value = read_json(self.http.post_json(&url, &json!({}))?)?;
        let record = self.record_from_deposition(&body)?;
        if record.location.is_none() {
            return Err(RepositoryError::Protocol("deposition response without bucket link".to_string()));
        }
        info!(backend = "zenodo", id = %record.id, "draft deposition created");
        Ok(record)
    }

    fn attach_metadata(&self, record: &mut RepositoryRecord, metadata: &MetadataCrate) -> RepositoryResult<()> {
        let body = json!({ "metadata": deposition_metadata(metadata) });
        let url = self.deposition_url(&record.id);
        let request = self.http.raw().put(&url).json(&body);
        let response = self.http.send_raw(request)?;
        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            let text = response.text().unwrap_or_default();
            return Err(parse_validation_error(&text).unwrap_or_else(|| classify_status(status, &text)));
        }
        check_status(response)?;

        let document = metadata
            .to_json()
            .map_err(|e| RepositoryError::Protocol(e.to_string()))?;
        let bucket = self.bucket(record)?;
        self.http
            .put_bytes(&format!("{}/{}", bucket, METADATA_FILE), document.into_bytes())?;

        record.mark_metadata_attached();
        debug!(id = %record.id, "metadata attached");
        Ok(())
    }

    fn open_upload(&self, record: &mut RepositoryRecord, file: &UploadFile) -> RepositoryResult<u64> {
        let bucket = self.bucket(record)?.to_string();
        let object = format!("{}/{}", bucket, file.name);

        if let Some(stored) = self.stored_file(record, &file.name)? {
            let content = stored.content();
            if content.matches(file) {
                debug!(id = %record.id, file = %file.name, "archive already stored");
                record.set_content(content);
                record.upload = Some(UploadHandle {
                    file_name: file.name.clone(),
                    size: file.size,
                    location: object,
                    file_id: None,
                    part_size: None,
                });
                return Ok(file.size);
            }
            warn!(
                id = %record.id,
                file = %file.name,
                stored_size = content.size,
                stored_checksum = ?content.checksum,
                "stored file does not match the archive, replacing it"
            );
            self.http.delete(&object)?;
            record.clear_content();
        }

        if file.size <= self.part_size {
            record.upload = Some(UploadHandle {
                file_name: file.name.clone(),
                size: file.size,
                location: object,
                file_id: None,
                part_size: Some(file.size.max(1)),
            });
            debug!(id = %record.id, size = file.size, "single request upload");
            return Ok(0);
        }

        let upload = match self.pending_multipart(&bucket, &file.name, file.size)? {
            Some(upload) => upload,
            None => self.start_multipart(&object, file.size)?,
        };
        let (parts, _) = self.uploaded_parts(&object, &upload.id)?;
        let acknowledged = contiguous_parts(&parts, upload.part_size, file.size);

        debug!(
            id = %record.id,
            upload_id = %upload.id,
            part_size = upload.part_size,
            acknowledged,
            "multipart upload ready"
        );
        record.upload = Some(UploadHandle {
            file_name: file.name.clone(),
            size: file.size,
            location: object,
            file_id: Some(upload.id),
            part_size: Some(upload.part_size),
        });
        Ok(acknowledged)
    }

    fn upload_chunk(&self, record: &RepositoryRecord, offset: u64, data: &[u8]) -> RepositoryResult<u64> {
        let handle = record
            .upload
            .as_ref()
            .ok_or_else(|| RepositoryError::InvalidState("upload not opened".to_string()))?;
        let part_size = handle
            .part_size
            .ok_or_else(|| RepositoryError::InvalidState("archive already stored".to_string()))?;
        if data.is_empty() {
            return Ok(offset);
        }

        let Some(upload_id) = handle.file_id.as_deref() else {
            if offset != 0 || data.len() as u64 != handle.size {
                return Err(RepositoryError::InvalidState(format!(
                    "single request upload needs all {} bytes, got {} at offset {}",
                    handle.size,
                    data.len(),
                    offset
                )));
            }
            self.http.put_bytes(&handle.location, data.to_vec())?;
            return Ok(handle.size);
        };

        if offset % part_size != 0 {
            return Err(RepositoryError::InvalidState(format!(
                "chunk offset {} is not aligned to part size {}",
                offset, part_size
            )));
        }
        let mut sent = 0u64;
        while sent < data.len() as u64 {
            let part_start = offset + sent;
            let len = part_size.min(handle.size - part_start);
            if sent + len > data.len() as u64 {
                break;
            }
            let url = format!(
                "{}&partNumber={}",
                multipart_url(&handle.location, upload_id),
                part_start / part_size
            );
            self.http
                .put_bytes(&url, data[sent as usize..(sent + len) as usize].to_vec())?;
            sent += len;
        }
        Ok(offset + sent)
    }

    fn complete_upload(&self, record: &mut RepositoryRecord) -> RepositoryResult<Option<Checksum>> {
        let handle = record
            .upload
            .clone()
            .ok_or_else(|| RepositoryError::InvalidState("upload not opened".to_string()))?;

        let mut stored = self.stored_file(record, &handle.file_name)?;
        if stored.is_none() {
            if let Some(upload_id) = handle.file_id.as_deref() {
                let url = multipart_url(&handle.location, upload_id);
                let (_, completed) = self.uploaded_parts(&handle.location, upload_id)?;
                if !completed {
                    self.http.post_empty(&url)?;
                    debug!(id = %record.id, upload_id, "multipart upload completed");
                }
                stored = self.stored_file(record, &handle.file_name)?;
            }
        }
        // Merged objects appear in the listing asynchronously.
        let stored = stored.ok_or_else(|| {
            RepositoryError::Transient(format!("{} not yet listed on deposition {}", handle.file_name, record.id))
        })?;

        let content = stored.content();
        let checksum = content.checksum.clone();
        record.set_content(content);
        Ok(checksum)
    }

    fn finalize(&self, record: &RepositoryRecord) -> RepositoryResult<RepositoryRecord> {
        if record.state != RecordState::FilesAttached {
            return Err(RepositoryError::InvalidState(format!(
                "deposition {} is {}, expected files_attached",
                record.id, record.state
            )));
        }
        let url = format!("{}/actions/publish", self.deposition_url(&record.id));
        let body: Value = read_json(self.http.post_empty(&url)?)?;

        let mut published = record.clone();
        published.advance(RecordState::Published);
        published.doi = body["doi"].as_str().map(String::from);
        published.url = body["links"]["record_html"]
            .as_str()
            .or_else(|| body["links"]["html"].as_str())
            .map(String::from);
        if published.doi.is_none() {
            return Err(RepositoryError::Protocol("publish response without DOI".to_string()));
        }
        info!(id = %record.id, doi = ?published.doi, "deposition published");
        Ok(published)
    }

    fn get_status(&self, record: &RepositoryRecord) -> RepositoryResult<RecordState> {
        let body: Value = self.http.get_json(&self.deposition_url(&record.id))?;
        Ok(self.record_from_deposition(&body)?.state)
    }

    fn fetch_record(&self, id: &str) -> RepositoryResult<RepositoryRecord> {
        let body: Value = self.http.get_json(&self.deposition_url(id))?;
        self.record_from_deposition(&body)
    }

    fn max_parallel_chunks(&self) -> usize {
        MAX_PARALLEL_PARTS
    }
}

fn multipart_url(object: &str, upload_id: &str) -> String {
    format!("{}?uploadId={}", object, upload_id)
}

fn multipart_from(value: &Value) -> Option<Multipart> {
    Some(Multipart {
        id: id_string(&value["id"])?,
        part_size: value["part_size"].as_u64().unwrap_or(0),
    })
}

/// The archive among a deposition's files: anything but the metadata document.
fn archive_file(files: &[DepositionFile]) -> Option<&DepositionFile> {
    files.iter().find(|f| f.filename != METADATA_FILE)
}

/// Bytes covered by parts `0..n` with no gap.
fn contiguous_parts(parts: &BTreeSet<u64>, part_size: u64, size: u64) -> u64 {
    let mut next = 0u64;
    while parts.contains(&next) {
        next += 1;
    }
    next.saturating_mul(part_size).min(size)
}

fn is_submitted(body: &Value) -> bool {
    body["submitted"].as_bool().unwrap_or(false) || body["state"].as_str() == Some("done")
}

/// Zenodo `metadata` object for a crate.
fn deposition_metadata(metadata: &MetadataCrate) -> Value {
    let title = metadata.title().unwrap_or_default();
    let creators: Vec<Value> = metadata
        .authors()
        .into_iter()
        .map(|author| {
            let mut creator = json!({ "name": author.name });
            if let Some(orcid) = author.identifier.as_deref().and_then(orcid_of) {
                creator["orcid"] = json!(orcid);
            }
            creator
        })
        .collect();
    let related: Vec<Value> = metadata
        .provenance()
        .into_iter()
        .map(|uri| json!({ "identifier": uri, "relation": "isDerivedFrom" }))
        .collect();

    let mut body = json!({
        "title": title,
        "upload_type": "software",
        "description": metadata.description().unwrap_or(title),
        "creators": creators,
        "license": metadata.license().unwrap_or_default().to_ascii_lowercase(),
    });
    if !related.is_empty() {
        body["related_identifiers"] = json!(related);
    }
    body
}

/// Bare ORCID iD from an identifier, if it is one.
fn orcid_of(identifier: &str) -> Option<&str> {
    let id = identifier.strip_prefix(ORCID_PREFIX).unwrap_or(identifier);
    let looks_like_orcid = id.len() == 19 && id.split('-').count() == 4;
    looks_like_orcid.then_some(id)
}

/// Field-level validation failure from a 400 body.
fn parse_validation_error(body: &str) -> Option<RepositoryError> {
    let value: Value = serde_json::from_str(body).ok()?;
    let first = value["errors"].as_array()?.first()?;
    let field = first["field"].as_str()?;
    let message = first["message"]
        .as_str()
        .map(String::from)
        .or_else(|| {
            first["messages"].as_array().map(|m| {
                m.iter()
                    .filter_map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            })
        })
        .unwrap_or_else(|| "rejected".to_string());
    Some(RepositoryError::MetadataRejected {
        field: field.strip_prefix("metadata.").unwrap_or(field).to_string(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairops_rocrate::{Author, CrateBuilder, FileInfo};

    fn sample_crate() -> MetadataCrate {
        CrateBuilder::new()
            .title("Churn model image")
            .author(Author::new("Ada Lovelace").with_identifier("https://orcid.org/0000-0002-1825-0097"))
            .author(Author::new("Charles Babbage"))
            .license("CC-BY-4.0")
            .provenance("https://mlflow.example.org/runs/42")
            .file(FileInfo::new("model.v1.tar", 10, "a".repeat(64)))
            .build()
            .unwrap()
    }

    fn file(name: &str, size: u64) -> DepositionFile {
        DepositionFile {
            filename: name.to_string(),
            filesize: size,
            checksum: Some("9e107d9d372bb6826bd81d3542a419d6".to_string()),
        }
    }

    #[test]
    fn test_deposition_metadata() {
        let body = deposition_metadata(&sample_crate());
        assert_eq!(body["title"], "Churn model image");
        assert_eq!(body["upload_type"], "software");
        assert_eq!(body["description"], "Churn model image");
        assert_eq!(body["license"], "cc-by-4.0");
        assert_eq!(body["creators"][0]["orcid"], "0000-0002-1825-0097");
        assert!(body["creators"][1].get("orcid").is_none());
        assert_eq!(body["related_identifiers"][0]["relation"], "isDerivedFrom");
    }

    #[test]
    fn test_contiguous_parts() {
        let parts: BTreeSet<u64> = [0, 1, 3].into_iter().collect();
        assert_eq!(contiguous_parts(&parts, 10, 45), 20);
        let all: BTreeSet<u64> = [0, 1, 2, 3, 4].into_iter().collect();
        assert_eq!(contiguous_parts(&all, 10, 45), 45);
        assert_eq!(contiguous_parts(&BTreeSet::new(), 10, 45), 0);
    }

    #[test]
    fn test_archive_file_skips_metadata_document() {
        let only_metadata = vec![file(METADATA_FILE, 900)];
        assert!(archive_file(&only_metadata).is_none());

        let both = vec![file(METADATA_FILE, 900), file("model.v1.tar", 10)];
        let archive = archive_file(&both).unwrap().content();
        assert_eq!(archive.name, "model.v1.tar");
        assert_eq!(archive.checksum, Some(Checksum::md5("9e107d9d372bb6826bd81d3542a419d6")));
    }

    #[test]
    fn test_parse_validation_error() {
        let body = r#"{"status":400,"message":"Validation error.","errors":[{"field":"metadata.license","messages":["Invalid license."]}]}"#;
        assert_eq!(
            parse_validation_error(body),
            Some(RepositoryError::MetadataRejected {
                field: "license".to_string(),
                message: "Invalid license.".to_string()
            })
        );
        assert!(parse_validation_error("not json").is_none());
    }

    #[test]
    fn test_orcid_of() {
        assert_eq!(orcid_of("https://orcid.org/0000-0002-1825-0097"), Some("0000-0002-1825-0097"));
        assert_eq!(orcid_of("0000-0002-1825-0097"), Some("0000-0002-1825-0097"));
        assert_eq!(orcid_of("https://example.org/people/ada"), None);
    }
}
