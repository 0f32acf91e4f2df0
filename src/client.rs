//! HTTP client and endpoint layout for the data store API.
use anyhow::Result;
use reqwest::{Client, Response};
use url::Url;

use crate::config::Config;
use crate::error::DatastoreError;

const SEARCH_PATH: &str = "data/search-products/os";
const TOKEN_PATH: &str = "token";
const DOWNLOAD_PATH: &str = "data/download/products/";
const COLLECTIONS_PATH: &str = "product-navigator/csw/record/_search";

#[derive(Clone, Debug)]
pub struct DataStore {
    client: Client,
    base: Url,
}

impl DataStore {
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        let base = parse_base_url(&config.api_endpoint)?;
        Ok(Self { client, base })
    }

    pub fn http(self: &Self) -> &Client {
        &self.client
    }

    pub fn search_url(self: &Self) -> Result<Url, DatastoreError> {
        Ok(self.base.join(SEARCH_PATH)?)
    }

    pub fn token_url(self: &Self) -> Result<Url, DatastoreError> {
        Ok(self.base.join(TOKEN_PATH)?)
    }

    pub fn collections_url(self: &Self) -> Result<Url, DatastoreError> {
        Ok(self.base.join(COLLECTIONS_PATH)?)
    }

    /// The identifier is percent-encoded into a single path segment.
    pub fn download_url(self: &Self, id: &str) -> Result<Url, DatastoreError> {
        let relative = format!("{}{}", DOWNLOAD_PATH, urlencoding::encode(id));
        Ok(self.base.join(&relative)?)
    }
}

/// Endpoint paths are joined relative to the base, so the base must end in '/'.
fn parse_base_url(endpoint: &str) -> Result<Url, DatastoreError> {
    let mut base = Url::parse(endpoint)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

pub(crate) fn ensure_success(url: &Url, response: Response) -> Result<Response, DatastoreError> {
    let status = response.status();
    if !status.is_success() {
        return Err(DatastoreError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}
