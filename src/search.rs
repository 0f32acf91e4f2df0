//! Paginated product search.
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::client::{ensure_success, DataStore};
use crate::error::DatastoreError;
use crate::query::SearchQuery;

#[derive(Deserialize, Debug)]
pub struct SearchPage {
    pub properties: PageProperties,
    #[serde(default)]
    pub features: Vec<Feature>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub struct PageProperties {
    pub total_results: u64,
    pub items_per_page: u64,
}

#[derive(Deserialize, Debug)]
pub struct Feature {
    pub properties: FeatureProperties,
}

#[derive(Deserialize, Debug)]
pub struct FeatureProperties {
    pub identifier: String,
}

impl SearchPage {
    pub fn identifiers(self: &Self) -> impl Iterator<Item = &str> {
        self.features
            .iter()
            .map(|feature| feature.properties.identifier.as_str())
    }
}

/// Start offsets of every results page: `0, P, 2P, ...` while below the total.
#[derive(Debug, Clone)]
pub struct PageOffsets {
    total: u64,
    per_page: u64,
    next: u64,
}

impl PageOffsets {
    pub fn new(total: u64, per_page: u64) -> Self {
        Self {
            total,
            per_page,
            next: 0,
        }
    }
}

impl Iterator for PageOffsets {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.per_page == 0 || self.next >= self.total {
            return None;
        }
        let offset = self.next;
        // An offset past u64::MAX is past any total too.
        self.next = self.next.checked_add(self.per_page).unwrap_or(u64::MAX);
        Some(offset)
    }
}

#[instrument(skip(store, query), fields(collection = %query.collection))]
async fn fetch_page(store: &DataStore, query: &SearchQuery, offset: u64) -> Result<SearchPage> {
    let url = store.search_url()?;
    debug!("Requesting results page");
    let response = store
        .http()
        .get(url.clone())
        .query(&query.params(offset))
        .send()
        .await?;
    let response = ensure_success(&url, response)?;

    let body = response.text().await?;
    let page = serde_json::from_str(&body).map_err(|e| DatastoreError::MalformedResponse {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    Ok(page)
}

fn search_progress(total: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("{spinner} {pos}/{len} files found")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

/// Collects the identifiers of every product matching `query`, in page order.
///
/// The first page also tells us the total and the page size, so it is not requested twice.
pub async fn find_files_on_store(
    store: &DataStore,
    query: &SearchQuery,
    progress: bool,
) -> Result<Vec<String>> {
    let first = fetch_page(store, query, 0).await?;
    let PageProperties {
        total_results,
        items_per_page,
    } = first.properties;

    if items_per_page == 0 && total_results > 0 {
        return Err(DatastoreError::MalformedResponse {
            url: store.search_url()?.to_string(),
            reason: format!("{total_results} results reported with a page size of 0"),
        }
        .into());
    }

    let bar = search_progress(total_results, progress);
    let mut identifiers: Vec<String> = vec![];
    let mut pending = Some(first);

    for offset in PageOffsets::new(total_results, items_per_page) {
        let page = match pending.take() {
            Some(page) => page,
            None => fetch_page(store, query, offset).await?,
        };
        let before = identifiers.len();
        identifiers.extend(page.identifiers().map(str::to_string));
        bar.inc((identifiers.len() - before) as u64);
    }
    bar.finish_and_clear();

    info!(found = identifiers.len(), "A total of {} files have been found", identifiers.len());
    Ok(identifiers)
}
