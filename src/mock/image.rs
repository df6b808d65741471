//! In-memory image store

use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::checksum::hash_bytes;
use crate::export::{ExportError, ImageRef, ImageSource, ImageStream};

#[derive(Debug, Default)]
struct Images {
    /// Images present locally
    local: HashMap<ImageRef, Vec<u8>>,
    /// Images only available after a pull
    remote: HashMap<ImageRef, Vec<u8>>,
    /// Every image ever known, for matching loaded archives
    known: HashMap<ImageRef, Vec<u8>>,
    /// Streams cut short after this many bytes
    truncations: HashMap<ImageRef, usize>,
    pulls: u32,
}

/// [`ImageSource`] over byte buffers.
#[derive(Debug, Default)]
pub struct MemoryImageSource {
    images: Mutex<Images>,
}

impl MemoryImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(self, image: ImageRef, content: Vec<u8>) -> Self {
        {
            let mut images = self.lock();
            images.known.insert(image.clone(), content.clone());
            images.local.insert(image, content);
        }
        self
    }

    /// An image that exists only in the remote registry.
    pub fn with_remote_image(self, image: ImageRef, content: Vec<u8>) -> Self {
        {
            let mut images = self.lock();
            images.known.insert(image.clone(), content.clone());
            images.remote.insert(image, content);
        }
        self
    }

    /// Make `save` end after `bytes` bytes with a failed producer.
    pub fn with_truncation(self, image: ImageRef, bytes: usize) -> Self {
        self.lock().truncations.insert(image, bytes);
        self
    }

    /// Drop an image from the local store.
    pub fn remove(&self, image: &ImageRef) {
        self.lock().local.remove(image);
    }

    pub fn pull_count(&self) -> u32 {
        self.lock().pulls
    }

    fn lock(&self) -> MutexGuard<'_, Images> {
        self.images.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ImageSource for MemoryImageSource {
    fn exists(&self, image: &ImageRef) -> Result<bool, ExportError> {
        Ok(self.lock().local.contains_key(image))
    }

    fn digest(&self, image: &ImageRef) -> Result<Option<String>, ExportError> {
        let images = self.lock();
        let content = images
            .local
            .get(image)
            .ok_or_else(|| ExportError::ImageNotFound(image.clone()))?;
        Ok(Some(format!("sha256:{}", hash_bytes(content).sha256.hex)))
    }

    fn pull(&self, image: &ImageRef) -> Result<(), ExportError> {
        let mut images = self.lock();
        images.pulls += 1;
        let content = images
            .remote
            .get(image)
            .or_else(|| images.local.get(image))
            .cloned()
            .ok_or_else(|| ExportError::Runtime(format!("pull {} failed: manifest unknown", image)))?;
        images.local.insert(image.clone(), content);
        Ok(())
    }

    fn save(&self, image: &ImageRef) -> Result<Box<dyn ImageStream>, ExportError> {
        let images = self.lock();
        let content = images
            .local
            .get(image)
            .ok_or_else(|| ExportError::ImageNotFound(image.clone()))?;
        let (content, truncated) = match images.truncations.get(image) {
            Some(&limit) => (content[..limit.min(content.len())].to_vec(), true),
            None => (content.clone(), false),
        };
        Ok(Box::new(MemoryStream {
            image: image.clone(),
            reader: Cursor::new(content),
            truncated,
        }))
    }

    fn load(&self, archive: &Path) -> Result<Vec<String>, ExportError> {
        let bytes = fs::read(archive)?;
        let mut images = self.lock();
        let matched: Vec<ImageRef> = images
            .known
            .iter()
            .filter(|(_, content)| **content == bytes)
            .map(|(image, _)| image.clone())
            .collect();
        if matched.is_empty() {
            return Err(ExportError::Runtime(format!(
                "load {} failed: unrecognized archive",
                archive.display()
            )));
        }
        let mut loaded = Vec::new();
        for image in matched {
            images.local.insert(image.clone(), bytes.clone());
            loaded.push(image.to_string());
        }
        loaded.sort();
        Ok(loaded)
    }
}

struct MemoryStream {
    image: ImageRef,
    reader: Cursor<Vec<u8>>,
    truncated: bool,
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl ImageStream for MemoryStream {
    fn finish(self: Box<Self>) -> Result<(), ExportError> {
        if self.truncated {
            return Err(ExportError::Truncated {
                reference: self.image,
                reason: "producer exited with status 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_makes_remote_image_local() {
        let image = ImageRef::new("ghcr.io/lab/model", "v2");
        let source = MemoryImageSource::new().with_remote_image(image.clone(), vec![1, 2, 3]);
        assert!(!source.exists(&image).unwrap());

        source.pull(&image).unwrap();
        assert!(source.exists(&image).unwrap());
        assert_eq!(source.pull_count(), 1);

        let missing = ImageRef::new("nope", "latest");
        assert!(matches!(source.pull(&missing), Err(ExportError::Runtime(_))));
    }

    #[test]
    fn test_truncated_stream_fails_on_finish() {
        let image = ImageRef::new("alpine", "3.20");
        let source = MemoryImageSource::new()
            .with_image(image.clone(), vec![0; 100])
            .with_truncation(image.clone(), 10);

        let mut stream = source.save(&image).unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), 10);
        assert!(matches!(stream.finish(), Err(ExportError::Truncated { .. })));
    }
}
