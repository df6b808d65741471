//! Built-in defaults (lowest configuration layer)

/// Chunk size for archive uploads: 10 MiB.
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Attempts per chunk before the upload is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1_000;

pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Sequential chunk transfer unless configured otherwise.
pub const DEFAULT_PARALLELISM: usize = 1;

/// Per-request timeout. Applies to each HTTP call, never to a whole publish.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 300;

pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 30;

pub const ZENODO_API_URL: &str = "https://zenodo.org/api";

pub const ZENODO_SANDBOX_API_URL: &str = "https://sandbox.zenodo.org/api";

pub const FIGSHARE_API_URL: &str = "https://api.figshare.com/v2";

/// Smallest accepted chunk size: 256 KiB.
pub const MIN_CHUNK_SIZE_BYTES: u64 = 256 * 1024;

/// Largest accepted chunk size: 1 GiB.
pub const MAX_CHUNK_SIZE_BYTES: u64 = 1024 * 1024 * 1024;

pub const MAX_PARALLELISM: usize = 16;

/// Default location of the user config file, relative to `$HOME`.
pub const USER_CONFIG_PATH: &str = ".config/fairops/publish.toml";
