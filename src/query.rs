use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

use crate::error::DatastoreError;

const DATETIME_PARAM_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

static DATETIME_ARG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?<year>\d{4})(?<month>\d{2})(?<day>\d{2})(?:(?<hour>\d{2})(?<minute>\d{2}))?$")
        .expect("Regex pattern should always compile")
});

/// Parses `YYYYMMDDHHMM` or `YYYYMMDD` as a UTC instant.
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let captures = DATETIME_ARG.captures(value.trim())?;
    let field = |name: &str| -> Option<u32> {
        match captures.name(name) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(0),
        }
    };

    let year: i32 = captures.name("year")?.as_str().parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, field("month")?, field("day")?)?;
    let datetime = date.and_hms_opt(field("hour")?, field("minute")?, 0)?;
    Some(datetime.and_utc())
}

/// Same as [`parse_datetime`], reporting `label` ("Start", "End") on failure.
pub fn parse_bound(label: &'static str, value: &str) -> Result<DateTime<Utc>, DatastoreError> {
    parse_datetime(value).ok_or_else(|| DatastoreError::InvalidDateTime {
        label,
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// A box is only built when all four corners are present; a partial box means a global search.
    pub fn from_corners(
        min_lon: Option<f64>,
        min_lat: Option<f64>,
        max_lon: Option<f64>,
        max_lat: Option<f64>,
    ) -> Option<Self> {
        match (min_lon, min_lat, max_lon, max_lat) {
            (Some(min_lon), Some(min_lat), Some(max_lon), Some(max_lat)) => Some(Self {
                min_lon,
                min_lat,
                max_lon,
                max_lat,
            }),
            (None, None, None, None) => None,
            _ => {
                warn!("Incomplete bounding box given, searching the full globe");
                None
            }
        }
    }

    pub fn to_param(self: &Self) -> String {
        format!(
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub collection: String,
    pub bbox: Option<BoundingBox>,
}

impl SearchQuery {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, collection: &str) -> Self {
        Self {
            start,
            end,
            collection: collection.to_string(),
            bbox: None,
        }
    }

    pub fn with_bbox(mut self, bbox: Option<BoundingBox>) -> Self {
        self.bbox = bbox;
        self
    }

    /// Request parameters for one results page starting at `offset`.
    pub fn params(self: &Self, offset: u64) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("format", "json".to_string()),
            ("pi", self.collection.clone()),
            ("dtstart", self.start.format(DATETIME_PARAM_FORMAT).to_string()),
            ("dtend", self.end.format(DATETIME_PARAM_FORMAT).to_string()),
        ];
        if let Some(bbox) = &self.bbox {
            params.push(("bbox", bbox.to_param()));
        }
        params.push(("si", offset.to_string()));
        params
    }
}
