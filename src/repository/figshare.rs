//! Figshare v2 API
//!
//! File content goes through the upload service: initiate the file on the
//! article, read its parts list, `PUT` each part, then complete. Parts are
//! independent, so chunks may be sent in parallel, but the service only
//! stores whole parts.
//!
//! A file of the archive's name that is complete but whose `computed_md5`
//! differs from the local archive is deleted and uploaded again.

use fairops_rocrate::{MetadataCrate, METADATA_FILE};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::checksum::{hash_bytes, Checksum};

use super::http::{classify_status, id_string, read_json, HttpClient};
use super::{
    Backend, RecordState, RepositoryClient, RepositoryError, RepositoryRecord, RepositoryResult, StoredContent,
    UploadFile, UploadHandle,
};

/// Upload parts the service accepts concurrently.
const MAX_PARALLEL_PARTS: usize = 8;

pub struct FigshareClient {
    http: HttpClient,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct ArticleFile {
    id: Value,
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    upload_url: Option<String>,
    #[serde(default)]
    computed_md5: Option<String>,
    #[serde(default)]
    supplied_md5: Option<String>,
}

impl ArticleFile {
    fn is_available(&self) -> bool {
        self.status.as_deref() == Some("available")
    }

    /// Whether this file can hold `file`'s bytes: a complete file must
    /// match by checksum, an unfinished one must have been started for them.
    fn holds(&self, file: &UploadFile) -> bool {
        if self.is_available() {
            return self.content().matches(file);
        }
        self.size == file.size
            && self
                .supplied_md5
                .as_deref()
                .map_or(true, |m| m.eq_ignore_ascii_case(&file.checksums.md5.hex))
    }

    fn content(&self) -> StoredContent {
        StoredContent {
            name: self.name.clone(),
            size: self.size,
            checksum: self
                .computed_md5
                .as_deref()
                .filter(|m| !m.is_empty())
                .map(Checksum::md5),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadPart {
    #[serde(rename = "partNo")]
    part_no: u64,
    #[serde(rename = "startOffset")]
    start_offset: u64,
    #[serde(rename = "endOffset")]
    end_offset: u64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct UploadStatus {
    #[serde(default)]
    parts: Vec<UploadPart>,
}

#[derive(Debug, Deserialize)]
struct License {
    value: i64,
    name: String,
    #[serde(default)]
    url: Option<String>,
}

impl FigshareClient {
    pub fn new(http: HttpClient, api_url: &str) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    fn article_url(&self, id: &str) -> String {
        format!("{}/account/articles/{}", self.api_url, id)
    }

    fn list_files(&self, article_id: &str) -> RepositoryResult<Vec<ArticleFile>> {
        self.http.get_json(&format!("{}/files", self.article_url(article_id)))
    }

    fn get_file(&self, article_id: &str, file_id: &str) -> RepositoryResult<ArticleFile> {
        self.http
            .get_json(&format!("{}/files/{}", self.article_url(article_id), file_id))
    }

    /// Register a file on the article and return its metadata.
    fn initiate_file(&self, article_id: &str, name: &str, size: u64, md5: &str) -> RepositoryResult<ArticleFile> {
        let url = format!("{}/files", self.article_url(article_id));
        let body: Value = read_json(self.http.post_json(&url, &json!({ "name": name, "size": size, "md5": md5 }))?)?;
        let location = body["location"]
            .as_str()
            .ok_or_else(|| RepositoryError::Protocol("file initiation without location".to_string()))?;
        self.http.get_json(location)
    }

    fn upload_status(&self, upload_url: &str) -> RepositoryResult<UploadStatus> {
        self.http.get_json(upload_url)
    }

    fn delete_file(&self, article_id: &str, file_id: &str) -> RepositoryResult<()> {
        self.http
            .delete(&format!("{}/files/{}", self.article_url(article_id), file_id))?;
        Ok(())
    }

    fn complete_file(&self, article_id: &str, file_id: &str) -> RepositoryResult<()> {
        let url = format!("{}/files/{}", self.article_url(article_id), file_id);
        self.http.post_empty(&url)?;
        Ok(())
    }

    /// Resolve a license identifier to Figshare's numeric license value.
    fn resolve_license(&self, identifier: &str) -> RepositoryResult<i64> {
        let licenses: Vec<License> = self.http.get_json(&format!("{}/account/licenses", self.api_url))?;
        match_license(&licenses, identifier).ok_or_else(|| RepositoryError::MetadataRejected {
            field: "license".to_string(),
            message: format!("license {} is not offered by this account", identifier),
        })
    }

    /// Upload a small file in one pass (used for the metadata document).
    fn upload_whole_file(&self, article_id: &str, name: &str, data: &[u8]) -> RepositoryResult<()> {
        let md5 = hash_bytes(data).md5.hex;
        let file = self.initiate_file(article_id, name, data.len() as u64, &md5)?;
        let file_id = id_string(&file.id)
            .ok_or_else(|| RepositoryError::Protocol("file without id".to_string()))?;
        let upload_url = file
            .upload_url
            .ok_or_else(|| RepositoryError::Protocol("file without upload_url".to_string()))?;

        for part in self.upload_status(&upload_url)?.parts {
            let bytes = part_bytes(data, &part)?;
            self.http
                .put_bytes(&format!("{}/{}", upload_url, part.part_no), bytes.to_vec())?;
        }
        self.complete_file(article_id, &file_id)
    }

    fn record_from_article(&self, body: &Value) -> RepositoryResult<RepositoryRecord> {
        let id = id_string(&body["id"])
            .ok_or_else(|| RepositoryError::Protocol("article response without id".to_string()))?;
        let mut record = RepositoryRecord::draft(Backend::Figshare, id);
        record.location = body["url_private_api"].as_str().map(String::from);

        if body["title"].as_str().is_some_and(|t| !t.is_empty()) && body["license"].is_object() {
            record.mark_metadata_attached();
        }
        let files: Vec<ArticleFile> = body["files"]
            .as_array()
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| serde_json::from_value(f.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        if let Some(archive) = files.iter().find(|f| f.name != METADATA_FILE && f.is_available()) {
            record.set_content(archive.content());
        }
        if body["status"].as_str() == Some("public") || body["is_public"].as_bool() == Some(true) {
            record.advance(RecordState::Published);
            record.doi = body["doi"].as_str().filter(|d| !d.is_empty()).map(String::from);
            record.url = body["figshare_url"].as_str().map(String::from);
        }
        Ok(record)
    }
}

impl RepositoryClient for FigshareClient {
    fn backend(&self) -> Backend {
        Backend::Figshare
    }

    fn create_deposition(&self, metadata: &MetadataCrate, _idempotency_key: &str) -> RepositoryResult<RepositoryRecord> {
        let url = format!("{}/account/articles", self.api_url);
        let title = metadata.title().unwrap_or_default();
        let body: Value = read_json(self.http.post_json(&url, &json!({ "title": title }))?)?;

        let id = id_string(&body["entity_id"])
            .or_else(|| {
                body["location"]
                    .as_str()
                    .and_then(|l| l.rsplit('/').next())
                    .map(String::from)
            })
            .ok_or_else(|| RepositoryError::Protocol("article creation without id".to_string()))?;

        let mut record = RepositoryRecord::draft(Backend::Figshare, id);
        record.location = body["location"].as_str().map(String::from);
        info!(backend = "figshare", id = %record.id, "draft article created");
        Ok(record)
    }

    fn attach_metadata(&self, record: &mut RepositoryRecord, metadata: &MetadataCrate) -> RepositoryResult<()> {
        let license_id = metadata.license().unwrap_or_default();
        let license = self.resolve_license(&license_id)?;
        let body = article_metadata(metadata, license);

        let request = self.http.raw().put(self.article_url(&record.id)).json(&body);
        let response = self.http.send_raw(request)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(parse_field_error(status.as_u16(), &text).unwrap_or_else(|| classify_status(status, &text)));
        }

        let document = metadata
            .to_json()
            .map_err(|e| RepositoryError::Protocol(e.to_string()))?;
        let already_stored = self
            .list_files(&record.id)?
            .iter()
            .any(|f| f.name == METADATA_FILE);
        if !already_stored {
            self.upload_whole_file(&record.id, METADATA_FILE, document.as_bytes())?;
        }

        record.mark_metadata_attached();
        debug!(id = %record.id, license, "metadata attached");
        Ok(())
    }

    fn open_upload(&self, record: &mut RepositoryRecord, file: &UploadFile) -> RepositoryResult<u64> {
        let existing = self
            .list_files(&record.id)?
            .into_iter()
            .find(|f| f.name == file.name && f.name != METADATA_FILE);

        let mut resumable = None;
        if let Some(found) = existing {
            let file_id = id_string(&found.id)
                .ok_or_else(|| RepositoryError::Protocol("file without id".to_string()))?;
            let current = self.get_file(&record.id, &file_id)?;
            if !current.holds(file) {
                warn!(
                    id = %record.id,
                    file_id = %file_id,
                    stored_size = current.size,
                    stored_checksum = ?current.computed_md5,
                    "stored file does not match the archive, replacing it"
                );
                self.delete_file(&record.id, &file_id)?;
                record.clear_content();
            } else {
                debug!(id = %record.id, file_id = %file_id, "reusing uploaded file");
                resumable = Some(current);
            }
        }
        let article_file = match resumable {
            Some(current) => current,
            None => self.initiate_file(&record.id, &file.name, file.size, &file.checksums.md5.hex)?,
        };

        let file_id = id_string(&article_file.id)
            .ok_or_else(|| RepositoryError::Protocol("file without id".to_string()))?;

        if article_file.is_available() {
            record.set_content(article_file.content());
            record.upload = Some(UploadHandle {
                file_name: file.name.clone(),
                size: file.size,
                location: article_file.upload_url.unwrap_or_default(),
                file_id: Some(file_id),
                part_size: None,
            });
            return Ok(file.size);
        }

        let upload_url = article_file
            .upload_url
            .ok_or_else(|| RepositoryError::Protocol("file without upload_url".to_string()))?;
        let status = self.upload_status(&upload_url)?;
        let part_size = status
            .parts
            .first()
            .and_then(|p| p.end_offset.checked_sub(p.start_offset))
            .map(|span| span + 1)
            .ok_or_else(|| RepositoryError::Protocol("upload session without valid parts".to_string()))?;
        let acknowledged = completed_prefix(&status.parts).min(file.size);

        record.upload = Some(UploadHandle {
            file_name: file.name.clone(),
            size: file.size,
            location: upload_url,
            file_id: Some(file_id),
            part_size: Some(part_size),
        });
        debug!(id = %record.id, part_size, acknowledged, "upload session ready");
        Ok(acknowledged)
    }

    fn upload_chunk(&self, record: &RepositoryRecord, offset: u64, data: &[u8]) -> RepositoryResult<u64> {
        let handle = record
            .upload
            .as_ref()
            .ok_or_else(|| RepositoryError::InvalidState("upload not opened".to_string()))?;
        let part_size = handle
            .part_size
            .ok_or_else(|| RepositoryError::InvalidState("upload session already complete".to_string()))?;
        if offset % part_size != 0 {
            return Err(RepositoryError::InvalidState(format!(
                "chunk offset {} is not aligned to part size {}",
                offset, part_size
            )));
        }

        let mut sent = 0u64;
        while sent < data.len() as u64 {
            let part_start = offset + sent;
            let part_end = (part_start + part_size).min(handle.size);
            let len = part_end - part_start;
            if sent + len > data.len() as u64 {
                // Trailing partial part; the service cannot store it.
                break;
            }
            let part_no = part_start / part_size + 1;
            let bytes = &data[sent as usize..(sent + len) as usize];
            self.http
                .put_bytes(&format!("{}/{}", handle.location, part_no), bytes.to_vec())?;
            sent += len;
        }
        Ok(offset + sent)
    }

    fn complete_upload(&self, record: &mut RepositoryRecord) -> RepositoryResult<Option<Checksum>> {
        let file_id = record
            .upload
            .as_ref()
            .and_then(|h| h.file_id.clone())
            .ok_or_else(|| RepositoryError::InvalidState("upload not opened".to_string()))?;

        let current = self.get_file(&record.id, &file_id)?;
        if !current.is_available() {
            self.complete_file(&record.id, &file_id)?;
        }
        let completed = self.get_file(&record.id, &file_id)?;
        if !completed.is_available() {
            return Err(RepositoryError::Transient(format!(
                "file {} on article {} is still {}",
                file_id,
                record.id,
                completed.status.as_deref().unwrap_or("processing")
            )));
        }

        let content = completed.content();
        let checksum = content.checksum.clone();
        record.set_content(content);
        Ok(checksum)
    }

    fn finalize(&self, record: &RepositoryRecord) -> RepositoryResult<RepositoryRecord> {
        if record.state != RecordState::FilesAttached {
            return Err(RepositoryError::InvalidState(format!(
                "article {} is {}, expected files_attached",
                record.id, record.state
            )));
        }
        self.http
            .post_empty(&format!("{}/publish", self.article_url(&record.id)))?;

        let body: Value = self.http.get_json(&self.article_url(&record.id))?;
        let mut published = record.clone();
        published.advance(RecordState::Published);
        published.doi = body["doi"].as_str().filter(|d| !d.is_empty()).map(String::from);
        published.url = body["figshare_url"].as_str().map(String::from);
        info!(id = %record.id, doi = ?published.doi, "article published");
        Ok(published)
    }

    fn get_status(&self, record: &RepositoryRecord) -> RepositoryResult<RecordState> {
        let body: Value = self.http.get_json(&self.article_url(&record.id))?;
        Ok(self.record_from_article(&body)?.state)
    }

    fn fetch_record(&self, id: &str) -> RepositoryResult<RepositoryRecord> {
        let body: Value = self.http.get_json(&self.article_url(id))?;
        self.record_from_article(&body)
    }

    fn max_parallel_chunks(&self) -> usize {
        MAX_PARALLEL_PARTS
    }
}

/// Figshare article body for a crate.
fn article_metadata(metadata: &MetadataCrate, license: i64) -> Value {
    let title = metadata.title().unwrap_or_default();
    let authors: Vec<Value> = metadata
        .authors()
        .into_iter()
        .map(|a| match a.identifier.as_deref().and_then(|id| id.strip_prefix("https://orcid.org/")) {
            Some(orcid) => json!({ "name": a.name, "orcid_id": orcid }),
            None => json!({ "name": a.name }),
        })
        .collect();
    let references: Vec<&str> = metadata.provenance();

    json!({
        "title": title,
        "description": metadata.description().unwrap_or(title),
        "authors": authors,
        "license": license,
        "defined_type": "software",
        "references": references,
    })
}

/// Match by SPDX-style name (`CC-BY-4.0` ~ `CC BY 4.0`) or license URL.
fn match_license(licenses: &[License], identifier: &str) -> Option<i64> {
    let normalize = |s: &str| {
        s.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase()
    };
    let wanted = normalize(identifier);
    if wanted.is_empty() {
        return None;
    }
    licenses
        .iter()
        .find(|l| {
            normalize(&l.name) == wanted
                || l.url.as_deref().is_some_and(|u| {
                    u.trim_end_matches('/') == identifier.trim_end_matches('/')
                })
        })
        .map(|l| l.value)
}

/// Bytes complete from offset zero, counting only leading `COMPLETE` parts.
fn completed_prefix(parts: &[UploadPart]) -> u64 {
    let mut sorted: Vec<&UploadPart> = parts.iter().collect();
    sorted.sort_by_key(|p| p.part_no);

    let mut acknowledged = 0u64;
    for part in sorted {
        if part.status != "COMPLETE" || part.start_offset != acknowledged {
            break;
        }
        acknowledged = part.end_offset + 1;
    }
    acknowledged
}

/// The slice of `data` a server-assigned part covers.
fn part_bytes<'a>(data: &'a [u8], part: &UploadPart) -> RepositoryResult<&'a [u8]> {
    let start = part.start_offset;
    let end = part.end_offset.saturating_add(1).min(data.len() as u64);
    if start > end {
        return Err(RepositoryError::Protocol(format!(
            "part {} spans bytes {}..={} of a {} byte file",
            part.part_no,
            part.start_offset,
            part.end_offset,
            data.len()
        )));
    }
    Ok(&data[start as usize..end as usize])
}

/// `{"message": ..., "code": ...}` bodies that name a field.
fn parse_field_error(status: u16, body: &str) -> Option<RepositoryError> {
    if status != 400 && status != 422 {
        return None;
    }
    let value: Value = serde_json::from_str(body).ok()?;
    let message = value["message"].as_str()?.to_string();
    let field = value["data"]
        .as_object()
        .and_then(|data| data.keys().next().cloned())
        .or_else(|| {
            ["license", "title", "authors", "description"]
                .iter()
                .find(|f| message.to_ascii_lowercase().contains(*f))
                .map(|f| f.to_string())
        })?;
    Some(RepositoryError::MetadataRejected { field, message })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(no: u64, start: u64, end: u64, status: &str) -> UploadPart {
        UploadPart {
            part_no: no,
            start_offset: start,
            end_offset: end,
            status: status.to_string(),
        }
    }

    #[test]
    fn test_completed_prefix() {
        let parts = vec![
            part(1, 0, 9, "COMPLETE"),
            part(2, 10, 19, "COMPLETE"),
            part(3, 20, 29, "PENDING"),
            part(4, 30, 34, "COMPLETE"),
        ];
        assert_eq!(completed_prefix(&parts), 20);
        assert_eq!(completed_prefix(&[part(1, 0, 9, "PENDING")]), 0);
        assert_eq!(completed_prefix(&[]), 0);
    }

    fn article_file(status: &str, size: u64, computed: Option<&str>, supplied: Option<&str>) -> ArticleFile {
        ArticleFile {
            id: json!(7),
            name: "model.v1.tar".to_string(),
            size,
            status: Some(status.to_string()),
            upload_url: None,
            computed_md5: computed.map(String::from),
            supplied_md5: supplied.map(String::from),
        }
    }

    #[test]
    fn test_existing_file_holds_archive_only_with_matching_bytes() {
        let data = b"archive bytes";
        let file = UploadFile {
            name: "model.v1.tar".to_string(),
            size: data.len() as u64,
            checksums: hash_bytes(data),
        };
        let md5 = file.checksums.md5.hex.clone();
        let other = hash_bytes(b"archive bytez").md5.hex;

        assert!(article_file("available", file.size, Some(&md5), None).holds(&file));
        assert!(!article_file("available", file.size, Some(&other), None).holds(&file));
        assert!(!article_file("available", file.size, None, None).holds(&file));
        assert!(article_file("created", file.size, None, Some(&md5)).holds(&file));
        assert!(!article_file("created", file.size, None, Some(&other)).holds(&file));
        assert!(!article_file("created", file.size + 1, None, None).holds(&file));
    }

    #[test]
    fn test_part_bytes_checks_server_offsets() {
        let data = b"0123456789";
        assert_eq!(part_bytes(data, &part(1, 0, 3, "PENDING")).unwrap(), b"0123");
        assert_eq!(part_bytes(data, &part(3, 8, 11, "PENDING")).unwrap(), b"89");
        assert!(matches!(
            part_bytes(data, &part(2, 20, 29, "PENDING")),
            Err(RepositoryError::Protocol(_))
        ));
        assert!(matches!(
            part_bytes(data, &part(2, 6, 3, "PENDING")),
            Err(RepositoryError::Protocol(_))
        ));
        assert!(part_bytes(data, &part(1, 0, u64::MAX, "PENDING")).is_ok());
    }

    #[test]
    fn test_match_license() {
        let licenses = vec![
            License {
                value: 1,
                name: "CC BY 4.0".to_string(),
                url: Some("https://creativecommons.org/licenses/by/4.0/".to_string()),
            },
            License {
                value: 2,
                name: "MIT".to_string(),
                url: None,
            },
        ];
        assert_eq!(match_license(&licenses, "CC-BY-4.0"), Some(1));
        assert_eq!(match_license(&licenses, "mit"), Some(2));
        assert_eq!(
            match_license(&licenses, "https://creativecommons.org/licenses/by/4.0"),
            Some(1)
        );
        assert_eq!(match_license(&licenses, "GPL-3.0"), None);
        assert_eq!(match_license(&licenses, ""), None);
    }

    #[test]
    fn test_parse_field_error() {
        let body = r#"{"message": "Invalid license", "code": "BadRequest"}"#;
        assert_eq!(
            parse_field_error(400, body),
            Some(RepositoryError::MetadataRejected {
                field: "license".to_string(),
                message: "Invalid license".to_string()
            })
        );
        assert!(parse_field_error(500, body).is_none());
    }
}
