pub mod client;
pub mod collections;
pub mod config;
pub mod download;
pub mod error;
pub mod query;
pub mod search;
pub mod token;

pub use client::DataStore;
pub use config::Config;
pub use download::{download_files, DownloadSummary, DownloadTask, ItemOutcome};
pub use error::DatastoreError;
pub use query::{BoundingBox, SearchQuery};
pub use search::find_files_on_store;
pub use token::{AccessKey, TokenManager};
