//! Artifact export
//!
//! Materializes a tagged container image into a tar archive on local disk.
//! The image stream is copied through a [`HashingWriter`] so the returned
//! checksums always describe the bytes that landed in the file, and memory
//! use stays at one copy buffer regardless of image size.
//!
//! Output is written to `<archive>.partial` and renamed into place only after
//! the stream ended cleanly; any failure removes the partial file.

mod docker;

pub use docker::DockerCli;

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::checksum::{hash_file, ChecksumSet, HashingWriter};

/// Copy buffer for the export stream.
const COPY_BUFFER_BYTES: usize = 256 * 1024;

/// Errors raised while exporting or loading an image
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("image not found locally: {0}")]
    ImageNotFound(ImageRef),

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("export stream for {reference} terminated early: {reason}")]
    Truncated { reference: ImageRef, reason: String },

    #[error("archive not found: {0}")]
    ArchiveNotFound(PathBuf),

    #[error("export cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A `repository:tag` image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Archive file name: `<repository>.<tag>.tar`, with path and port
    /// separators in the repository replaced by `_`.
    pub fn archive_file_name(&self) -> String {
        let repository: String = self
            .repository
            .chars()
            .map(|c| if c == '/' || c == ':' { '_' } else { c })
            .collect();
        format!("{}.{}.tar", repository, self.tag)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl FromStr for ImageRef {
    type Err = ExportError;

    /// Parse `repository[:tag]`; the tag defaults to `latest`. A colon
    /// before the last `/` belongs to a registry port, not the tag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ExportError::InvalidReference(s.to_string()));
        }
        let name_start = s.rfind('/').map_or(0, |i| i + 1);
        match s[name_start..].rfind(':') {
            Some(i) => {
                let split = name_start + i;
                let (repository, tag) = (&s[..split], &s[split + 1..]);
                if repository.is_empty() || tag.is_empty() {
                    return Err(ExportError::InvalidReference(s.to_string()));
                }
                Ok(ImageRef::new(repository, tag))
            }
            None => Ok(ImageRef::new(s, "latest")),
        }
    }
}

/// A byte stream of an image export.
///
/// `finish` must be called after the stream is drained; it reports whether
/// the producer completed, which a short read alone cannot tell.
pub trait ImageStream: Read + Send {
    fn finish(self: Box<Self>) -> Result<(), ExportError>;
}

/// Access to a local container image store.
pub trait ImageSource: Send + Sync {
    fn exists(&self, image: &ImageRef) -> Result<bool, ExportError>;

    /// Content digest of the local image, if the runtime reports one.
    fn digest(&self, image: &ImageRef) -> Result<Option<String>, ExportError>;

    /// Fetch the image from its remote registry.
    fn pull(&self, image: &ImageRef) -> Result<(), ExportError>;

    /// Stream the image as a tar archive that preserves its tags.
    fn save(&self, image: &ImageRef) -> Result<Box<dyn ImageStream>, ExportError>;

    /// Import an archive; returns the references that were loaded.
    fn load(&self, archive: &Path) -> Result<Vec<String>, ExportError>;
}

/// An exported archive. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub image: ImageRef,
    /// Resolved image digest, when known.
    pub digest: Option<String>,
    pub path: PathBuf,
    pub size: u64,
    pub checksums: ChecksumSet,
}

impl Artifact {
    /// Describe an archive already on disk by hashing it.
    pub fn from_archive(image: ImageRef, digest: Option<String>, path: &Path) -> Result<Self, ExportError> {
        if !path.is_file() {
            return Err(ExportError::ArchiveNotFound(path.to_path_buf()));
        }
        let (size, checksums) = hash_file(path)?;
        Ok(Self {
            image,
            digest,
            path: path.to_path_buf(),
            size,
            checksums,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.image.archive_file_name())
    }
}

/// Exports images from an [`ImageSource`] into archives.
pub struct ArtifactExporter {
    source: Arc<dyn ImageSource>,
    pull: bool,
    cancel: CancelToken,
}

impl ArtifactExporter {
    pub fn new(source: Arc<dyn ImageSource>) -> Self {
        Self {
            source,
            pull: false,
            cancel: CancelToken::new(),
        }
    }

    /// Pull the image from its registry before exporting.
    pub fn with_pull(mut self, pull: bool) -> Self {
        self.pull = pull;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn image_exists(&self, image: &ImageRef) -> Result<bool, ExportError> {
        self.source.exists(image)
    }

    /// Export `image` into `dest_dir`, returning the archive description.
    pub fn export(&self, image: &ImageRef, dest_dir: &Path) -> Result<Artifact, ExportError> {
        if self.pull {
            info!(image = %image, "pulling image");
            self.source.pull(image)?;
        }
        if !self.source.exists(image)? {
            return Err(ExportError::ImageNotFound(image.clone()));
        }
        let digest = self.source.digest(image)?;

        fs::create_dir_all(dest_dir)?;
        let final_path = dest_dir.join(image.archive_file_name());
        let partial_path = dest_dir.join(format!("{}.partial", image.archive_file_name()));

        info!(image = %image, path = %final_path.display(), "exporting image");
        match self.write_archive(image, &partial_path) {
            Ok((size, checksums)) => {
                fs::rename(&partial_path, &final_path)?;
                info!(image = %image, size, sha256 = %checksums.sha256.hex, "export complete");
                Ok(Artifact {
                    image: image.clone(),
                    digest,
                    path: final_path,
                    size,
                    checksums,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&partial_path);
                Err(e)
            }
        }
    }

    fn write_archive(&self, image: &ImageRef, path: &Path) -> Result<(u64, ChecksumSet), ExportError> {
        let mut stream = self.source.save(image)?;
        let mut writer = HashingWriter::new(BufWriter::new(File::create(path)?));
        let mut buf = vec![0u8; COPY_BUFFER_BYTES];

        loop {
            if self.cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }
            let n = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ExportError::Truncated {
                        reference: image.clone(),
                        reason: e.to_string(),
                    })
                }
            };
            io::Write::write_all(&mut writer, &buf[..n])?;
        }

        stream.finish()?;
        let size = writer.bytes_written();
        let (file, checksums) = writer.finish()?;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        debug!(image = %image, size, "archive written");

        if size == 0 {
            return Err(ExportError::Truncated {
                reference: image.clone(),
                reason: "empty export stream".to_string(),
            });
        }
        Ok((size, checksums))
    }

    /// Load an archive back into the local image store.
    pub fn load(&self, archive: &Path) -> Result<Vec<String>, ExportError> {
        if !archive.is_file() {
            return Err(ExportError::ArchiveNotFound(archive.to_path_buf()));
        }
        let loaded = self.source.load(archive)?;
        for reference in &loaded {
            info!(image = %reference, "loaded image");
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hash_bytes;
    use crate::mock::MemoryImageSource;
    use tempfile::TempDir;

    fn image() -> ImageRef {
        ImageRef::new("alpine", "3.20")
    }

    #[test]
    fn test_parse_image_ref() {
        assert_eq!("alpine:3.20".parse::<ImageRef>().unwrap(), image());
        assert_eq!(
            "alpine".parse::<ImageRef>().unwrap(),
            ImageRef::new("alpine", "latest")
        );
        assert_eq!(
            "registry.local:5000/team/model:v1".parse::<ImageRef>().unwrap(),
            ImageRef::new("registry.local:5000/team/model", "v1")
        );
        assert_eq!(
            "registry.local:5000/team/model".parse::<ImageRef>().unwrap(),
            ImageRef::new("registry.local:5000/team/model", "latest")
        );
        assert!("alpine:".parse::<ImageRef>().is_err());
        assert!("".parse::<ImageRef>().is_err());
    }

    #[test]
    fn test_archive_file_name() {
        assert_eq!(image().archive_file_name(), "alpine.3.20.tar");
        assert_eq!(
            ImageRef::new("registry.local:5000/team/model", "v1").archive_file_name(),
            "registry.local_5000_team_model.v1.tar"
        );
    }

    #[test]
    fn test_export_checksum_matches_disk() {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..1_000_000u32).map(|i| (i % 253) as u8).collect();
        let source = MemoryImageSource::new().with_image(image(), content.clone());

        let exporter = ArtifactExporter::new(Arc::new(source));
        let artifact = exporter.export(&image(), dir.path()).unwrap();

        assert_eq!(artifact.path, dir.path().join("alpine.3.20.tar"));
        assert_eq!(artifact.size, content.len() as u64);
        assert_eq!(artifact.checksums, hash_bytes(&content));
        assert_eq!(fs::read(&artifact.path).unwrap(), content);
        assert!(artifact.digest.as_deref().unwrap().starts_with("sha256:"));
    }

    #[test]
    fn test_export_missing_image() {
        let dir = TempDir::new().unwrap();
        let exporter = ArtifactExporter::new(Arc::new(MemoryImageSource::new()));

        let err = exporter.export(&image(), dir.path()).unwrap_err();
        assert!(matches!(err, ExportError::ImageNotFound(_)));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_export_truncated_stream_removes_partial() {
        let dir = TempDir::new().unwrap();
        let source = MemoryImageSource::new()
            .with_image(image(), vec![7u8; 4096])
            .with_truncation(image(), 1000);

        let exporter = ArtifactExporter::new(Arc::new(source));
        let err = exporter.export(&image(), dir.path()).unwrap_err();

        assert!(matches!(err, ExportError::Truncated { .. }));
        assert!(!dir.path().join("alpine.3.20.tar").exists());
        assert!(!dir.path().join("alpine.3.20.tar.partial").exists());
    }

    #[test]
    fn test_export_cancelled_removes_partial() {
        let dir = TempDir::new().unwrap();
        let source = MemoryImageSource::new().with_image(image(), vec![1u8; 4096]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let exporter = ArtifactExporter::new(Arc::new(source)).with_cancel(cancel);
        let err = exporter.export(&image(), dir.path()).unwrap_err();

        assert!(matches!(err, ExportError::Cancelled));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_export_with_pull() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(MemoryImageSource::new().with_remote_image(image(), vec![3u8; 10]));

        let exporter = ArtifactExporter::new(source.clone());
        assert!(!exporter.image_exists(&image()).unwrap());

        let exporter = exporter.with_pull(true);
        let artifact = exporter.export(&image(), dir.path()).unwrap();
        assert_eq!(artifact.size, 10);
        assert!(source.exists(&image()).unwrap());
    }

    #[test]
    fn test_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(MemoryImageSource::new().with_image(image(), vec![9u8; 64]));
        let exporter = ArtifactExporter::new(source.clone());
        let artifact = exporter.export(&image(), dir.path()).unwrap();

        source.remove(&image());
        assert!(!exporter.image_exists(&image()).unwrap());

        let loaded = exporter.load(&artifact.path).unwrap();
        assert_eq!(loaded, vec!["alpine:3.20".to_string()]);
        assert!(exporter.image_exists(&image()).unwrap());
    }

    #[test]
    fn test_load_missing_archive() {
        let dir = TempDir::new().unwrap();
        let exporter = ArtifactExporter::new(Arc::new(MemoryImageSource::new()));
        let err = exporter.load(&dir.path().join("nope.tar")).unwrap_err();
        assert!(matches!(err, ExportError::ArchiveNotFound(_)));
    }

    #[test]
    fn test_artifact_from_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alpine.3.20.tar");
        fs::write(&path, b"archive bytes").unwrap();

        let artifact = Artifact::from_archive(image(), None, &path).unwrap();
        assert_eq!(artifact.size, 13);
        assert_eq!(artifact.checksums, hash_bytes(b"archive bytes"));
        assert_eq!(artifact.file_name(), "alpine.3.20.tar");
    }
}
