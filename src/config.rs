//! Runtime configuration shared by the search, token and download steps.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::DatastoreError;
use crate::token::AccessKey;

pub const DEFAULT_API_ENDPOINT: &str = "http://api.eumetsat.int/";
pub const DEFAULT_COLLECTION: &str = "EO:EUM:DAT:METOP:IASIL1C-ALL";
pub const DEFAULT_BLOCK_SIZE: usize = 1024;
pub const DEFAULT_FILE_CHECK_LIMIT: u64 = 100_000;
pub const DEFAULT_TOKEN_REFRESH_MINUTES: u64 = 20;
pub const ACCESS_KEY_ENV: &str = "EUM_ACCESS_KEY";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Top level API URL; the search, token, download and collection endpoints hang off it.
    pub api_endpoint: String,
    pub collection: String,
    /// Downloads reach the disk in writes of this many bytes; only the last one is shorter.
    pub block_size: usize,
    /// Downloads smaller than this many bytes are deleted as bad files.
    pub file_check_limit: u64,
    pub token_refresh_minutes: u64,
    /// `None` leaves requests without a timeout.
    pub request_timeout_secs: Option<u64>,
    pub progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            file_check_limit: DEFAULT_FILE_CHECK_LIMIT,
            token_refresh_minutes: DEFAULT_TOKEN_REFRESH_MINUTES,
            request_timeout_secs: None,
            progress: true,
        }
    }
}

impl Config {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn token_lifetime(self: &Self) -> Duration {
        Duration::from_secs(self.token_refresh_minutes.saturating_mul(60))
    }

    pub fn request_timeout(self: &Self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Picks the access key: an explicit value wins over the `EUM_ACCESS_KEY` environment variable.
pub fn resolve_access_key(explicit: Option<String>) -> Result<AccessKey, DatastoreError> {
    resolve_access_key_from(explicit, std::env::var(ACCESS_KEY_ENV).ok())
}

pub fn resolve_access_key_from(
    explicit: Option<String>,
    from_env: Option<String>,
) -> Result<AccessKey, DatastoreError> {
    explicit
        .into_iter()
        .chain(from_env)
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
        .map(AccessKey::new)
        .ok_or(DatastoreError::MissingAccessKey)
}
