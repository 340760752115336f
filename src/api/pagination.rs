//! The two pagination protocols behind one contract: fetch every record an
//! endpoint will yield, and stop cleanly.

use log::{debug, warn};
use reqwest::Method;
use serde_json::Value;

use super::client::RestClient;
use crate::error::{CrawlError, Result};
use crate::models::PageInfo;

/// Result of draining a page-numbered endpoint.
///
/// An error on page N ends pagination but keeps the records from pages
/// 1..N; the error rides along so the orchestrator can report it without
/// losing data.
#[derive(Debug, Default)]
pub struct PageOutcome {
    pub records: Vec<Value>,
    pub error: Option<CrawlError>,
    pub pages_fetched: u32,
}

/// Drain a page-numbered REST endpoint.
///
/// Appends `per_page`/`page` query parameters and stops when a page is
/// empty or not an array, when a page comes back short, or when the
/// `max_pages` safety cap is reached.
pub async fn fetch_all_pages(
    client: &RestClient,
    endpoint: &str,
    per_page: u32,
    max_pages: u32,
) -> PageOutcome {
    let mut outcome = PageOutcome::default();
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    for page in 1..=max_pages {
        let paged = format!("{endpoint}{separator}per_page={per_page}&page={page}");
        let value = match client.request_json(Method::GET, &paged, None).await {
            Ok(value) => value,
            Err(e) => {
                warn!("pagination of {endpoint} stopped at page {page}: {e}");
                outcome.error = Some(e);
                return outcome;
            }
        };
        outcome.pages_fetched = page;
        let Value::Array(records) = value else {
            debug!("{endpoint} page {page} is not an array; stopping");
            return outcome;
        };
        if records.is_empty() {
            return outcome;
        }
        let short = records.len() < per_page as usize;
        outcome.records.extend(records);
        if short {
            return outcome;
        }
    }
    debug!("{endpoint} hit the {max_pages}-page safety cap");
    outcome
}

/// Retrieve all pages from a cursor-based connection.
///
/// The `fetch` closure is called repeatedly with the current cursor until
/// the returned [`PageInfo`] reports no further pages.
///
/// # Errors
///
/// Propagates the first error the `fetch` closure yields; records from
/// earlier pages are discarded with it.
pub async fn paginate<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<(Vec<T>, PageInfo)>>,
{
    let mut items = Vec::new();
    let mut cursor = None;
    loop {
        let (mut page, info) = fetch(cursor.clone()).await?;
        items.append(&mut page);
        if !info.has_next_page {
            break;
        }
        match info.end_cursor {
            Some(next) => cursor = Some(next),
            None => {
                // A server claiming more pages without a cursor would loop
                // forever on the first page.
                return Err(CrawlError::BadResponse(
                    "pageInfo.hasNextPage set without endCursor".into(),
                ));
            }
        }
    }
    Ok(items)
}
