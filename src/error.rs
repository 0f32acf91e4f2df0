use std::path::PathBuf;
use thiserror::Error;

use crate::config::ACCESS_KEY_ENV;

#[derive(Error, Debug)]
pub enum DatastoreError {
    #[error(
        "No EUMETSAT access key supplied. Pass it with --eum-access-key or set the {} environment variable.",
        ACCESS_KEY_ENV
    )]
    MissingAccessKey,

    #[error("{label} date/time must be in YYYYMMDD or YYYYMMDDHHMM format, got {value:?}")]
    InvalidDateTime { label: &'static str, value: String },

    #[error("Invalid API endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error("Identifier {id:?} does not name a single file inside the output directory")]
    UnsafeIdentifier { id: String },

    /// The size check is a heuristic, not an integrity check: legitimately small
    /// products are rejected too.
    #[error("Bad file {}. Possible credential problem. Size: {size} bytes (limit {limit})", .path.display())]
    UndersizedFile { path: PathBuf, size: u64, limit: u64 },
}
