use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;

use super::{SearchError, Searcher};

const ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";
/// The API caps one page at 10 items.
const PAGE_SIZE: usize = 10;

/// Image search through the Google Custom Search JSON API, paginated
/// internally up to the requested result count.
pub struct GoogleSearcher {
    api_key: Option<String>,
    engine_id: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    link: String,
}

impl GoogleSearcher {
    pub fn new(api_key: Option<String>, engine_id: Option<String>) -> Self {
        Self { api_key, engine_id, timeout: Duration::from_secs(30) }
    }
}

impl Searcher for GoogleSearcher {
    fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>, SearchError> {
        let (Some(api_key), Some(engine_id)) = (&self.api_key, &self.engine_id) else {
            return Err(SearchError::MissingCredentials);
        };

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| SearchError::Request(e.to_string()))?;

        let mut urls = Vec::new();
        let mut start = 1usize;
        while urls.len() < max_results {
            let num = PAGE_SIZE.min(max_results - urls.len());
            debug!("search page start={start} num={num} query={query:?}");
            let response = client
                .get(ENDPOINT)
                .query(&[
                    ("q", query),
                    ("key", api_key),
                    ("cx", engine_id),
                    ("searchType", "image"),
                    ("num", &num.to_string()),
                    ("start", &start.to_string()),
                ])
                .send()
                .map_err(|e| SearchError::Request(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(SearchError::Status(status.as_u16()));
            }
            let page: SearchResponse =
                response.json().map_err(|e| SearchError::Malformed(e.to_string()))?;
            if page.items.is_empty() {
                break;
            }
            start += page.items.len();
            urls.extend(page.items.into_iter().map(|item| item.link));
        }

        urls.truncate(max_results);
        info!("search {query:?} returned {} urls", urls.len());
        Ok(urls)
    }
}
