use std::fmt;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use serde::de::{DeserializeOwned, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ArchiverConfig;
use crate::error::{ArchiveError, Result};

/// One page to archive, as reported by `list=allpages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRef {
    pub page_id: i64,
    pub title: String,
    pub namespace: i32,
}

/// Latest revision of a page together with its identifying metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageContent {
    pub page_id: i64,
    pub namespace: i32,
    pub title: String,
    pub text: String,
    pub revision_id: i64,
    pub parent_revision_id: i64,
    pub timestamp: String,
    pub sha1: String,
    pub size_bytes: i64,
    pub content_model: String,
    pub content_format: String,
}

/// Read-only view of a wiki. Implemented over HTTP by [`MediaWikiClient`].
pub trait WikiReadApi {
    /// Walks `list=allpages` for `namespace`, following continuation until the
    /// API stops returning a cursor or at least `limit` pages were collected.
    /// `limit <= 0` means no limit. The result may hold more than `limit` pages.
    fn list_pages(&mut self, namespace: i32, limit: i64) -> Result<Vec<PageRef>>;

    fn fetch_latest_revision(&mut self, title: &str) -> Result<PageContent>;

    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub rate_limit_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &ArchiverConfig) -> Self {
        Self {
            api_url: config.api_url.clone(),
            user_agent: config.user_agent.clone(),
            timeout_ms: config.http.timeout_ms,
            max_retries: config.http.max_retries,
            retry_delay_ms: config.http.retry_delay_ms,
            rate_limit_ms: config.http.rate_limit_ms,
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|source| ArchiveError::Network {
                url: config.api_url.clone(),
                source,
            })?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn request_text(&mut self, params: &[(&str, String)]) -> Result<String> {
        let mut pairs = Vec::with_capacity(params.len() + 1);
        pairs.push(("format", "json".to_string()));
        for (key, value) in params {
            pairs.push((*key, value.clone()));
        }

        let mut attempt = 0;
        loop {
            self.apply_rate_limit();
            let outcome = self.send_once(&pairs);
            match outcome {
                Ok(body) => return Ok(body),
                Err(error) if attempt < self.config.max_retries && error.is_transient() => {
                    debug!(attempt, error = %error, "retrying MediaWiki API request");
                    self.wait_before_retry(attempt);
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn send_once(&self, pairs: &[(&str, String)]) -> Result<String> {
        let network = |source| ArchiveError::Network {
            url: self.config.api_url.clone(),
            source,
        };

        let mut request = self.client.get(&self.config.api_url).query(pairs);
        if !self.config.user_agent.is_empty() {
            request = request.header(USER_AGENT, self.config.user_agent.as_str());
        }
        let response = request.send().map_err(network)?;
        let status = response.status();
        let body = response.text().map_err(network)?;
        if !status.is_success() {
            return Err(ArchiveError::Server {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = if base == 0 {
            0
        } else {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|duration| u64::from(duration.subsec_millis() % 100))
                .unwrap_or(0)
        };
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl WikiReadApi for MediaWikiClient {
    fn list_pages(&mut self, namespace: i32, limit: i64) -> Result<Vec<PageRef>> {
        let cap = usize::try_from(limit).ok().filter(|cap| *cap > 0);
        let mut pages = Vec::new();
        let mut cursor: Option<ContinuationCursor> = None;

        loop {
            debug!(namespace, cursor = ?cursor, "listing pages");
            let mut params = vec![
                ("action", "query".to_string()),
                ("list", "allpages".to_string()),
                ("apnamespace", namespace.to_string()),
                ("aplimit", "max".to_string()),
            ];
            if let Some(cursor) = &cursor {
                params.push(("continue", cursor.token.clone()));
                params.push(("apcontinue", cursor.apcontinue.clone().unwrap_or_default()));
            }

            let body = self.request_text(&params)?;
            let parsed: AllPagesResponse = decode(&body, "allpages API response")?;
            check_api_error(parsed.error)?;

            pages.extend(parsed.query.allpages.into_iter().map(|item| PageRef {
                page_id: item.pageid,
                title: item.title,
                namespace: item.ns,
            }));

            if cap.is_some_and(|cap| pages.len() >= cap) {
                break;
            }
            match parsed.continuation {
                Some(next) if next.is_resumable() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(pages)
    }

    fn fetch_latest_revision(&mut self, title: &str) -> Result<PageContent> {
        let params = vec![
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("prop", "revisions".to_string()),
            ("rvlimit", "1".to_string()),
            ("rvprop", "content|ids|timestamp|size|sha1".to_string()),
            ("rvslots", "*".to_string()),
        ];

        let body = self.request_text(&params)?;
        let parsed: PageQueryResponse = decode(&body, "page content API response")?;
        check_api_error(parsed.error)?;

        // Document order; the first page carrying a revision wins.
        for page in parsed.query.pages {
            let Some(revision) = page.revisions.into_iter().next() else {
                continue;
            };
            let slot = revision.slots.main;
            return Ok(PageContent {
                page_id: page.pageid,
                namespace: page.ns,
                title: page.title,
                text: slot.content,
                revision_id: revision.revid,
                parent_revision_id: revision.parentid,
                timestamp: revision.timestamp,
                sha1: revision.sha1,
                size_bytes: revision.size,
                content_model: slot.contentmodel,
                content_format: slot.contentformat,
            });
        }

        Err(ArchiveError::NotFound {
            title: title.to_string(),
        })
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn decode<T: DeserializeOwned>(body: &str, what: &'static str) -> Result<T> {
    serde_json::from_str(body).map_err(|source| ArchiveError::Decode { what, source })
}

fn check_api_error(error: Option<ApiErrorBody>) -> Result<()> {
    match error {
        Some(error) => Err(ArchiveError::Api {
            code: error.code.unwrap_or_else(|| "unknown_error".to_string()),
            info: error.info.unwrap_or_else(|| "unknown info".to_string()),
        }),
        None => Ok(()),
    }
}

/// Continuation pair handed back by the API; both halves are sent on the next request.
#[derive(Clone, Deserialize, Default)]
struct ContinuationCursor {
    #[serde(default, rename = "continue")]
    token: String,
    #[serde(default)]
    apcontinue: Option<String>,
}

impl ContinuationCursor {
    /// Resuming needs both tokens; a bare `continue` would restart the listing.
    fn is_resumable(&self) -> bool {
        !self.token.is_empty() && self.apcontinue.as_deref().is_some_and(|next| !next.is_empty())
    }
}

impl fmt::Debug for ContinuationCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}",
            self.token,
            self.apcontinue.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<String>,
    info: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AllPagesResponse {
    #[serde(default)]
    error: Option<ApiErrorBody>,
    #[serde(default)]
    query: AllPagesQuery,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationCursor>,
}

#[derive(Debug, Deserialize, Default)]
struct AllPagesQuery {
    #[serde(default)]
    allpages: Vec<AllPagesItem>,
}

#[derive(Debug, Deserialize)]
struct AllPagesItem {
    pageid: i64,
    title: String,
    #[serde(default)]
    ns: i32,
}

#[derive(Debug, Deserialize, Default)]
struct PageQueryResponse {
    #[serde(default)]
    error: Option<ApiErrorBody>,
    #[serde(default)]
    query: PageQuery,
}

#[derive(Debug, Deserialize, Default)]
struct PageQuery {
    #[serde(default, deserialize_with = "pages_in_document_order")]
    pages: Vec<QueryPage>,
}

#[derive(Debug, Deserialize)]
struct QueryPage {
    #[serde(default)]
    pageid: i64,
    #[serde(default)]
    ns: i32,
    #[serde(default)]
    title: String,
    #[serde(default)]
    revisions: Vec<QueryRevision>,
}

#[derive(Debug, Deserialize)]
struct QueryRevision {
    #[serde(default)]
    revid: i64,
    #[serde(default)]
    parentid: i64,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    sha1: String,
    #[serde(default)]
    slots: RevisionSlots,
}

#[derive(Debug, Deserialize, Default)]
struct RevisionSlots {
    #[serde(default)]
    main: MainSlot,
}

#[derive(Debug, Deserialize, Default)]
struct MainSlot {
    #[serde(default, rename = "*")]
    content: String,
    #[serde(default)]
    contentmodel: String,
    #[serde(default)]
    contentformat: String,
}

/// `query.pages` is an object keyed by page id; keep entries in the order the
/// server wrote them. A JSON array (formatversion=2) is accepted as well.
fn pages_in_document_order<'de, D>(deserializer: D) -> std::result::Result<Vec<QueryPage>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PagesVisitor;

    impl<'de> Visitor<'de> for PagesVisitor {
        type Value = Vec<QueryPage>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a map or list of pages")
        }

        fn visit_map<M>(self, mut map: M) -> std::result::Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            let mut pages = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((_, page)) = map.next_entry::<String, QueryPage>()? {
                pages.push(page);
            }
            Ok(pages)
        }

        fn visit_seq<S>(self, mut seq: S) -> std::result::Result<Self::Value, S::Error>
        where
            S: SeqAccess<'de>,
        {
            let mut pages = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(page) = seq.next_element::<QueryPage>()? {
                pages.push(page);
            }
            Ok(pages)
        }
    }

    deserializer.deserialize_any(PagesVisitor)
}
