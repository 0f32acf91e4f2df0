//! Command line arguments and how they layer over the configuration file.
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::warn;

use eum_datastore::query::parse_bound;
use eum_datastore::{BoundingBox, Config, DatastoreError, SearchQuery};

/// Search for data on the EUMETSAT data store and download it.
///
/// Example: search and download IASI L1C for a region around Etna in May 2020:
///
///   eum-datastore 202005010000 202005312359 --min-lon 14 --max-lon 15 --min-lat 14 --max-lat 16
#[derive(Parser, Debug)]
#[command(name = "eum-datastore")]
#[command(version, about)]
pub struct Args {
    /// Start of the search in YYYYMMDDHHMM or YYYYMMDD format (UTC)
    #[arg(required_unless_present = "list_collections")]
    pub start_dt: Option<String>,

    /// End of the search in YYYYMMDDHHMM or YYYYMMDD format (UTC)
    #[arg(required_unless_present = "list_collections")]
    pub end_dt: Option<String>,

    /// Minimum longitude of the search box
    #[arg(long, allow_negative_numbers = true)]
    pub min_lon: Option<f64>,

    /// Maximum longitude of the search box
    #[arg(long, allow_negative_numbers = true)]
    pub max_lon: Option<f64>,

    /// Minimum latitude of the search box
    #[arg(long, allow_negative_numbers = true)]
    pub min_lat: Option<f64>,

    /// Maximum latitude of the search box
    #[arg(long, allow_negative_numbers = true)]
    pub max_lat: Option<f64>,

    /// Directory in which to save files
    #[arg(long, default_value = "./")]
    pub out_dir: PathBuf,

    /// Collection to search and download [default: EO:EUM:DAT:METOP:IASIL1C-ALL]
    #[arg(long)]
    pub collection: Option<String>,

    /// Access key from the data store user page (falls back to EUM_ACCESS_KEY)
    #[arg(long)]
    pub eum_access_key: Option<String>,

    /// Top level API URL
    #[arg(long)]
    pub api_endpoint: Option<String>,

    /// Write buffer size in bytes for downloads
    #[arg(long)]
    pub block_size: Option<usize>,

    /// Downloads smaller than this many bytes are treated as failures and deleted
    #[arg(long)]
    pub file_check_limit: Option<u64>,

    /// Request timeout in seconds (no timeout unless set)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Search and print what would be downloaded, without downloading
    #[arg(long)]
    pub dry_run: bool,

    /// List the collections available on the data store and exit
    #[arg(long)]
    pub list_collections: bool,

    /// Print the collection list as JSON
    #[arg(long, requires = "list_collections")]
    pub json: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    pub fn log_level(self: &Self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Built-in defaults, overridden by the config file, overridden by flags.
    pub fn resolve_config(self: &Self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::read(path)?,
            None => Config::default(),
        };
        if let Some(endpoint) = &self.api_endpoint {
            config.api_endpoint = endpoint.clone();
        }
        if let Some(collection) = &self.collection {
            config.collection = collection.clone();
        }
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        if let Some(limit) = self.file_check_limit {
            config.file_check_limit = limit;
        }
        if self.timeout.is_some() {
            config.request_timeout_secs = self.timeout;
        }
        if self.quiet {
            config.progress = false;
        }
        Ok(config)
    }

    pub fn search_query(self: &Self, config: &Config) -> Result<SearchQuery, DatastoreError> {
        let start = parse_bound("Start", self.start_dt.as_deref().unwrap_or_default())?;
        let end = parse_bound("End", self.end_dt.as_deref().unwrap_or_default())?;
        if end < start {
            warn!(%start, %end, "End of the search is before its start");
        }
        let bbox = BoundingBox::from_corners(self.min_lon, self.min_lat, self.max_lon, self.max_lat);
        Ok(SearchQuery::new(start, end, &config.collection).with_bbox(bbox))
    }
}
