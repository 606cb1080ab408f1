//! Client for the YouTube Data API v3.
//!
//! `VideoApi` is the seam the ingestion pipeline talks to; `YouTubeClient`
//! is the real implementation over blocking `ureq` calls. Every request
//! carries the API key, and transient failures (transport errors, 429, 5xx)
//! are retried with exponential backoff until the configured budget runs
//! out.

use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use crate::catalog::Category;
use crate::error::{CatalogError, CatalogResult};

/// The API accepts at most this many ids per `videos` request.
pub const MAX_IDS_PER_REQUEST: usize = 50;
pub const MAX_SEARCH_RESULTS: u32 = 50;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Metadata for one video as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSnippet {
    pub video_id: String,
    pub title: String,
    pub description: String,
    pub published: DateTime<Utc>,
    pub category_id: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewCountReport {
    pub video_id: String,
    pub views: i64,
}

pub trait VideoApi: Send + Sync {
    fn categories(&self, region: &str) -> CatalogResult<Vec<Category>>;

    /// External ids of embeddable videos in a category.
    fn search_by_category(&self, category_id: &str, max_results: u32)
    -> CatalogResult<Vec<String>>;

    /// Snippets for the given ids. Ids the API does not know are absent from
    /// the result; order follows the API's response.
    fn video_snippets(&self, video_ids: &[String]) -> CatalogResult<Vec<VideoSnippet>>;

    fn view_counts(&self, video_ids: &[String]) -> CatalogResult<Vec<ViewCountReport>>;
}

#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct CategoryItem {
    id: String,
    snippet: CategorySnippet,
}

#[derive(Debug, Deserialize)]
struct CategorySnippet {
    title: String,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnippetItem {
    id: String,
    snippet: RawSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSnippet {
    published_at: String,
    category_id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StatisticsItem {
    id: String,
    statistics: RawStatistics,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatistics {
    /// Sent as a decimal string by the API; absent when the owner hides it.
    #[serde(default, deserialize_with = "count_from_string_or_number")]
    view_count: Option<i64>,
}

fn count_from_string_or_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Number(i64),
        Text(String),
    }

    match Option::<Count>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Count::Number(value)) => Ok(Some(value)),
        Some(Count::Text(text)) => text.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

fn snippets_from(list: ItemList<SnippetItem>) -> CatalogResult<Vec<VideoSnippet>> {
    list.items
        .into_iter()
        .map(|item| -> CatalogResult<VideoSnippet> {
            let published = DateTime::parse_from_rfc3339(&item.snippet.published_at)
                .map_err(|err| {
                    CatalogError::Transport(format!(
                        "invalid publishedAt {:?} for {}: {err}",
                        item.snippet.published_at, item.id
                    ))
                })?
                .with_timezone(&Utc);
            Ok(VideoSnippet {
                video_id: item.id,
                title: item.snippet.title,
                description: item.snippet.description,
                published,
                category_id: item.snippet.category_id,
                tags: item.snippet.tags,
            })
        })
        .collect()
}

fn view_counts_from(list: ItemList<StatisticsItem>) -> Vec<ViewCountReport> {
    list.items
        .into_iter()
        .filter_map(|item| match item.statistics.view_count {
            Some(views) => Some(ViewCountReport {
                video_id: item.id,
                views,
            }),
            None => {
                log::warn!("no view count reported for {}", item.id);
                None
            }
        })
        .collect()
}

/// Pulls the upstream explanation out of an error body. The API nests it as
/// `{"error": {"message": ...}}`; anything else is passed through raw.
fn upstream_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|value| value.get("error"));
    match error {
        Some(serde_json::Value::String(message)) => message.clone(),
        Some(error) => error
            .get("message")
            .and_then(|message| message.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        None if body.trim().is_empty() => "not specified in api response".to_string(),
        None => body.trim().to_string(),
    }
}

fn is_transient(status: u16) -> bool {
    status == 429 || status >= 500
}

pub struct YouTubeClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    retry_budget: Duration,
}

impl YouTubeClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
            base_url,
            api_key: api_key.into(),
            retry_budget: Duration::from_secs(crate::config::DEFAULT_API_RETRY_SECONDS),
        }
    }

    /// Upper bound on the time spent retrying one request. Zero disables
    /// retries.
    pub fn with_retry_budget(mut self, budget: Duration) -> Self {
        self.retry_budget = budget;
        self
    }

    fn get<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, &str)]) -> CatalogResult<T> {
        let url = format!("{}{}", self.base_url, endpoint);
        let policy = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(self.retry_budget))
            .build();

        let attempt = || {
            let mut request = self.agent.get(&url).query("key", &self.api_key);
            for (name, value) in query {
                request = request.query(name, value);
            }
            match request.call() {
                Ok(response) => response.into_json::<T>().map_err(|err| {
                    backoff::Error::permanent(CatalogError::Transport(format!(
                        "decoding {endpoint} response: {err}"
                    )))
                }),
                Err(ureq::Error::Status(status, response)) => {
                    let body = response.into_string().unwrap_or_default();
                    let err = CatalogError::Api {
                        status,
                        message: upstream_message(&body),
                    };
                    if is_transient(status) {
                        Err(backoff::Error::transient(err))
                    } else {
                        Err(backoff::Error::permanent(err))
                    }
                }
                Err(ureq::Error::Transport(transport)) => Err(backoff::Error::transient(
                    CatalogError::Transport(transport.to_string()),
                )),
            }
        };

        backoff::retry_notify(policy, attempt, |err: CatalogError, wait: Duration| {
            log::warn!("{endpoint} request failed ({err}), retrying in {wait:?}");
        })
        .map_err(|err| match err {
            backoff::Error::Permanent(err) => err,
            backoff::Error::Transient { err, .. } => err,
        })
    }
}

impl VideoApi for YouTubeClient {
    fn categories(&self, region: &str) -> CatalogResult<Vec<Category>> {
        let list: ItemList<CategoryItem> = self.get(
            "videoCategories",
            &[("part", "snippet"), ("regionCode", region)],
        )?;
        Ok(list
            .items
            .into_iter()
            .map(|item| Category {
                id: item.id,
                title: item.snippet.title,
            })
            .collect())
    }

    fn search_by_category(
        &self,
        category_id: &str,
        max_results: u32,
    ) -> CatalogResult<Vec<String>> {
        let max_results = max_results.clamp(1, MAX_SEARCH_RESULTS).to_string();
        let list: ItemList<SearchItem> = self.get(
            "search",
            &[
                ("part", "id"),
                ("fields", "items/id/videoId"),
                ("maxResults", &max_results),
                ("safeSearch", "strict"),
                ("type", "video"),
                ("videoEmbeddable", "true"),
                ("videoCategoryId", category_id),
            ],
        )?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|item| item.id.video_id)
            .collect())
    }

    fn video_snippets(&self, video_ids: &[String]) -> CatalogResult<Vec<VideoSnippet>> {
        let mut snippets = Vec::with_capacity(video_ids.len());
        for chunk in video_ids.chunks(MAX_IDS_PER_REQUEST) {
            let ids = chunk.join(",");
            let list: ItemList<SnippetItem> = self.get(
                "videos",
                &[
                    ("part", "snippet"),
                    ("id", &ids),
                    (
                        "fields",
                        "items(id,snippet(publishedAt,categoryId,tags,title,description))",
                    ),
                ],
            )?;
            snippets.extend(snippets_from(list)?);
        }
        Ok(snippets)
    }

    fn view_counts(&self, video_ids: &[String]) -> CatalogResult<Vec<ViewCountReport>> {
        let mut counts = Vec::with_capacity(video_ids.len());
        for chunk in video_ids.chunks(MAX_IDS_PER_REQUEST) {
            let ids = chunk.join(",");
            let list: ItemList<StatisticsItem> = self.get(
                "videos",
                &[
                    ("part", "statistics"),
                    ("id", &ids),
                    ("fields", "items(id,statistics/viewCount)"),
                ],
            )?;
            counts.extend(view_counts_from(list));
        }
        Ok(counts)
    }
}
