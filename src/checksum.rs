//! Archive checksums
//!
//! The archive is hashed once, while it is written, with SHA-256 (the
//! checksum recorded in the metadata crate) and MD5 (what Zenodo and
//! Figshare report back for stored files).

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Read buffer for hashing files from disk.
const HASH_BUFFER_BYTES: usize = 64 * 1024;

/// Hash algorithm of a [`Checksum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sha256,
    Md5,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Md5 => "md5",
        }
    }
}

/// A digest in `algorithm:hex` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: Algorithm,
    /// Lowercase hex.
    pub hex: String,
}

impl Checksum {
    pub fn new(algorithm: Algorithm, hex: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    pub fn sha256(hex: impl Into<String>) -> Self {
        Self::new(Algorithm::Sha256, hex)
    }

    pub fn md5(hex: impl Into<String>) -> Self {
        Self::new(Algorithm::Md5, hex)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

/// Parse error for `algorithm:hex` strings.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized checksum: {0}")]
pub struct ChecksumParseError(String);

impl FromStr for Checksum {
    type Err = ChecksumParseError;

    /// Accepts `sha256:<hex>`, `md5:<hex>`, or a bare hex digest whose
    /// length identifies the algorithm.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = match s.split_once(':') {
            Some(("sha256", hex)) => (Algorithm::Sha256, hex),
            Some(("md5", hex)) => (Algorithm::Md5, hex),
            Some(_) => return Err(ChecksumParseError(s.to_string())),
            None => match s.len() {
                64 => (Algorithm::Sha256, s),
                32 => (Algorithm::Md5, s),
                _ => return Err(ChecksumParseError(s.to_string())),
            },
        };

        let expected_len = match algorithm {
            Algorithm::Sha256 => 64,
            Algorithm::Md5 => 32,
        };
        if hex.len() != expected_len || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChecksumParseError(s.to_string()));
        }
        Ok(Checksum::new(algorithm, hex))
    }
}

/// Both digests of one byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSet {
    pub sha256: Checksum,
    pub md5: Checksum,
}

impl ChecksumSet {
    /// The digest for `algorithm`.
    pub fn get(&self, algorithm: Algorithm) -> &Checksum {
        match algorithm {
            Algorithm::Sha256 => &self.sha256,
            Algorithm::Md5 => &self.md5,
        }
    }
}

/// Incremental hasher computing SHA-256 and MD5 together.
#[derive(Clone, Default)]
pub struct StreamHasher {
    sha256: Sha256,
    md5: Md5,
    bytes: u64,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.sha256.update(data);
        self.md5.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> ChecksumSet {
        ChecksumSet {
            sha256: Checksum::sha256(hex::encode(self.sha256.finalize())),
            md5: Checksum::md5(hex::encode(self.md5.finalize())),
        }
    }
}

/// Writer adapter that hashes every byte it forwards.
///
/// Only bytes accepted by the inner writer are hashed, so the digest always
/// describes exactly what reached the destination.
pub struct HashingWriter<W> {
    inner: W,
    hasher: StreamHasher,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: StreamHasher::new(),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.hasher.bytes()
    }

    /// Flush and return the inner writer with the digests.
    pub fn finish(mut self) -> io::Result<(W, ChecksumSet)> {
        self.inner.flush()?;
        Ok((self.inner, self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hash a file from disk.
pub fn hash_file(path: &Path) -> io::Result<(u64, ChecksumSet)> {
    let mut file = File::open(path)?;
    let mut hasher = StreamHasher::new();
    let mut buf = vec![0u8; HASH_BUFFER_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let bytes = hasher.bytes();
    Ok((bytes, hasher.finalize()))
}

/// Hash an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> ChecksumSet {
    let mut hasher = StreamHasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_digests() {
        let set = hash_bytes(b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            set.sha256.hex,
            "d7a8fbb307d7809469ca9abcb0082e4f8d5651e46d3cdb762d02d0bf37c9e592"
        );
        assert_eq!(set.md5.hex, "9e107d9d372bb6826bd81d3542a419d6");
    }

    #[test]
    fn test_hashing_writer_matches_file_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let mut writer = HashingWriter::new(File::create(&path).unwrap());
        for chunk in data.chunks(7_001) {
            writer.write_all(chunk).unwrap();
        }
        assert_eq!(writer.bytes_written(), data.len() as u64);
        let (_, streamed) = writer.finish().unwrap();

        let (size, on_disk) = hash_file(&path).unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(streamed, on_disk);
    }

    #[test]
    fn test_parse_checksum() {
        let md5: Checksum = "md5:9E107D9D372BB6826BD81D3542A419D6".parse().unwrap();
        assert_eq!(md5.algorithm, Algorithm::Md5);
        assert_eq!(md5.hex, "9e107d9d372bb6826bd81d3542a419d6");
        assert_eq!(md5.to_string(), "md5:9e107d9d372bb6826bd81d3542a419d6");

        let bare: Checksum = "9e107d9d372bb6826bd81d3542a419d6".parse().unwrap();
        assert_eq!(bare, md5);

        assert!("crc32:abcd".parse::<Checksum>().is_err());
        assert!("md5:xyz".parse::<Checksum>().is_err());
        assert!("abc".parse::<Checksum>().is_err());
    }
}
