use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::instrument;

use crate::client::{ensure_success, DataStore};
use crate::error::DatastoreError;

/// Upper bound on the number of collection records returned by the navigator.
const MAX_COLLECTIONS: &str = "500";

#[derive(Deserialize)]
struct NavigatorResponse {
    hits: Hits,
}

#[derive(Deserialize)]
struct Hits {
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: CollectionRecord,
}

#[derive(Deserialize)]
struct CollectionRecord {
    id: String,
    #[serde(rename = "abstract", default)]
    description: String,
}

/// Collection ids on the data store, mapped to their abstracts.
#[instrument(skip_all)]
pub async fn retrieve_collections(store: &DataStore) -> Result<BTreeMap<String, String>> {
    let url = store.collections_url()?;
    let response = store
        .http()
        .get(url.clone())
        .query(&[("_source_include", "id,abstract"), ("size", MAX_COLLECTIONS)])
        .send()
        .await?;
    let response = ensure_success(&url, response)?;

    let body = response.text().await?;
    let navigator: NavigatorResponse =
        serde_json::from_str(&body).map_err(|e| DatastoreError::MalformedResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let collections = navigator
        .hits
        .hits
        .into_iter()
        .map(|hit| (hit.source.id, hit.source.description))
        .collect();
    Ok(collections)
}
