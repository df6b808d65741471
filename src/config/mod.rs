//! Publish configuration
//!
//! Three layers, merged in order of increasing precedence:
//! 1. Built-in defaults
//! 2. User config file (`~/.config/fairops/publish.toml` or `--config`)
//! 3. CLI overrides
//!
//! Credentials are not part of this structure; see [`Credentials`].

mod credentials;
mod defaults;
mod merge;

pub use credentials::{Credentials, FIGSHARE_TOKEN_ENV, ZENODO_SANDBOX_ENV, ZENODO_TOKEN_ENV};
pub use defaults::*;
pub use merge::{deep_merge, merge_layers};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::upload::RetryPolicy;

/// Errors for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing credential: {0}")]
    MissingCredential(String),
}

/// Origin of a configuration layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Cli,
}

/// A contributing layer with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// SHA-256 of the raw file bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Chunked transfer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub chunk_size_bytes: u64,
    pub max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Chunks in flight at once; backends that need ordered writes cap this at 1.
    pub parallelism: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_initial_delay_ms: DEFAULT_RETRY_INITIAL_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

impl UploadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

/// HTTP client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub request_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            connect_timeout_seconds: DEFAULT_CONNECT_TIMEOUT_SECONDS,
            user_agent: format!("fairops-publish/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZenodoConfig {
    pub api_url: String,
    pub sandbox_api_url: String,
    pub sandbox: bool,
}

impl Default for ZenodoConfig {
    fn default() -> Self {
        Self {
            api_url: ZENODO_API_URL.to_string(),
            sandbox_api_url: ZENODO_SANDBOX_API_URL.to_string(),
            sandbox: false,
        }
    }
}

impl ZenodoConfig {
    pub fn effective_api_url(&self) -> &str {
        if self.sandbox {
            &self.sandbox_api_url
        } else {
            &self.api_url
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FigshareConfig {
    pub api_url: String,
}

impl Default for FigshareConfig {
    fn default() -> Self {
        Self {
            api_url: FIGSHARE_API_URL.to_string(),
        }
    }
}

/// Effective publish configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Directory receiving exported archives and resume journals
    pub output_dir: PathBuf,
    pub upload: UploadConfig,
    pub http: HttpConfig,
    pub zenodo: ZenodoConfig,
    pub figshare: FigshareConfig,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            upload: UploadConfig::default(),
            http: HttpConfig::default(),
            zenodo: ZenodoConfig::default(),
            figshare: FigshareConfig::default(),
        }
    }
}

impl PublishConfig {
    /// Merge layers and validate. A `file` that does not exist is skipped.
    pub fn load(
        file: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<(Self, Vec<ConfigSource>), ConfigError> {
        let builtin = serde_json::to_value(Self::default())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let mut layers = vec![builtin];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        if let Some(path) = file {
            if path.exists() {
                let (value, digest) = load_toml_file(path)?;
                layers.push(value);
                sources.push(ConfigSource {
                    origin: ConfigOrigin::File,
                    path: Some(path.to_string_lossy().to_string()),
                    digest: Some(digest),
                });
            }
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let config: PublishConfig =
            serde_json::from_value(merged).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok((config, sources))
    }

    /// Path of the user config file, if `$HOME` is set.
    pub fn user_config_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(USER_CONFIG_PATH))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let upload = &self.upload;
        if !(MIN_CHUNK_SIZE_BYTES..=MAX_CHUNK_SIZE_BYTES).contains(&upload.chunk_size_bytes) {
            return Err(ConfigError::Invalid(format!(
                "upload.chunk_size_bytes must be in [{}, {}], got {}",
                MIN_CHUNK_SIZE_BYTES, MAX_CHUNK_SIZE_BYTES, upload.chunk_size_bytes
            )));
        }
        if upload.max_attempts == 0 || upload.max_attempts > 20 {
            return Err(ConfigError::Invalid(format!(
                "upload.max_attempts must be in [1, 20], got {}",
                upload.max_attempts
            )));
        }
        if upload.retry_initial_delay_ms > upload.retry_max_delay_ms {
            return Err(ConfigError::Invalid(
                "upload.retry_initial_delay_ms must not exceed upload.retry_max_delay_ms".to_string(),
            ));
        }
        if upload.parallelism == 0 || upload.parallelism > MAX_PARALLELISM {
            return Err(ConfigError::Invalid(format!(
                "upload.parallelism must be in [1, {}], got {}",
                MAX_PARALLELISM, upload.parallelism
            )));
        }
        if self.http.request_timeout_seconds == 0 || self.http.connect_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("http timeouts must be positive".to_string()));
        }
        for (key, url) in [
            ("zenodo.api_url", &self.zenodo.api_url),
            ("zenodo.sandbox_api_url", &self.zenodo.sandbox_api_url),
            ("figshare.api_url", &self.figshare.api_url),
        ] {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(ConfigError::Invalid(format!("{} must be an http(s) URL: {}", key, url)));
            }
        }
        Ok(())
    }
}

/// Read a TOML file as a JSON value, with the SHA-256 of its raw bytes.
fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let digest = hex::encode(Sha256::digest(&bytes));

    let contents = String::from_utf8(bytes).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("invalid UTF-8: {}", e),
    })?;
    let value: Value = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok((value, digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = PublishConfig::default();
        config.validate().unwrap();
        assert_eq!(config.upload.chunk_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.zenodo.effective_api_url(), ZENODO_API_URL);
    }

    #[test]
    fn test_load_without_file_uses_builtin() {
        let (config, sources) = PublishConfig::load(None, None).unwrap();
        assert_eq!(config, PublishConfig::default());
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_file_and_cli_layers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("publish.toml");
        fs::write(
            &path,
            r#"
output_dir = "/data/archives"

[upload]
max_attempts = 3
parallelism = 4

[zenodo]
sandbox = true
"#,
        )
        .unwrap();

        let cli = json!({ "upload": { "max_attempts": 7 } });
        let (config, sources) = PublishConfig::load(Some(&path), Some(cli)).unwrap();

        assert_eq!(config.output_dir, PathBuf::from("/data/archives"));
        assert_eq!(config.upload.max_attempts, 7);
        assert_eq!(config.upload.parallelism, 4);
        assert_eq!(config.upload.chunk_size_bytes, DEFAULT_CHUNK_SIZE_BYTES);
        assert_eq!(config.zenodo.effective_api_url(), ZENODO_SANDBOX_API_URL);

        let origins: Vec<_> = sources.iter().map(|s| s.origin).collect();
        assert_eq!(origins, vec![ConfigOrigin::Builtin, ConfigOrigin::File, ConfigOrigin::Cli]);
        assert_eq!(sources[1].digest.as_ref().unwrap().len(), 64);
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (_, sources) = PublishConfig::load(Some(&dir.path().join("absent.toml")), None).unwrap();
        assert_eq!(sources.len(), 1);
    }

    #[test]
    fn test_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("publish.toml");
        fs::write(&path, "[upload\nmax_attempts = ").unwrap();

        let err = PublishConfig::load(Some(&path), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validation_bounds() {
        let cases = [
            json!({ "upload": { "chunk_size_bytes": 1 } }),
            json!({ "upload": { "max_attempts": 0 } }),
            json!({ "upload": { "parallelism": 0 } }),
            json!({ "upload": { "retry_initial_delay_ms": 5000, "retry_max_delay_ms": 10 } }),
            json!({ "http": { "request_timeout_seconds": 0 } }),
            json!({ "figshare": { "api_url": "ftp://example.org" } }),
        ];
        for overrides in cases {
            let err = PublishConfig::load(None, Some(overrides.clone())).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{} accepted", overrides);
        }
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = UploadConfig::default().retry_policy();
        assert_eq!(policy.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(policy.initial_delay, Duration::from_millis(DEFAULT_RETRY_INITIAL_DELAY_MS));
    }
}
