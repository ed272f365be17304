//! Persisted notification history.
//!
//! [`HistoryStore`] is the REST collaborator (paged fetch plus the two read-state
//! mutations); [`RestHistoryStore`] implements it with `reqwest`.
//! [`HistoryCache`] holds the pages fetched for the current identity together
//! with the server's unread snapshot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

use crate::error::{NotifyError, Result};
use crate::record::{Identity, NotificationRecord};
use crate::unread::PersistedKeys;

const PROFILE_HEADER: &str = "X-Profile-Id";
const ERROR_BODY_LIMIT: usize = 256;

/// One page of the paginated history endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub results: Vec<NotificationRecord>,
    /// Cursor of the next page, absent on the last page
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub extra_data: PageExtra,
}

/// Server-side snapshot attached to every page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageExtra {
    #[serde(default)]
    pub unread_count: u64,
}

/// Persisted history backend.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Fetch a page; `None` fetches the first page.
    async fn fetch_page(&self, identity: &Identity, cursor: Option<&str>) -> Result<HistoryPage>;

    /// Mark one record as read. Idempotent on the server.
    async fn mark_read(&self, identity: &Identity, id: i64) -> Result<()>;

    /// Mark everything as read. Returns the server's (informational) unread count.
    async fn mark_all_read(&self, identity: &Identity) -> Result<u64>;
}

fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// `reqwest`-backed [`HistoryStore`].
#[derive(Debug, Clone)]
pub struct RestHistoryStore {
    client: reqwest::Client,
    base_url: Url,
}

#[derive(Deserialize)]
struct MarkAllResponse {
    #[serde(default)]
    unread_count: u64,
}

impl RestHistoryStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        install_rustls_provider();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("notify-stream/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn page_url(&self, cursor: Option<&str>) -> Result<Url> {
        match cursor {
            None => self.endpoint("notifications/"),
            // Paginators commonly hand back the absolute URL of the next page.
            Some(next) if next.starts_with("http://") || next.starts_with("https://") => {
                let url = Url::parse(next)?;
                if url.origin() == self.base_url.origin() {
                    return Ok(url);
                }
                // Credentials never leave the configured origin.
                let page = url
                    .query_pairs()
                    .find(|(key, _)| key == "page")
                    .map(|(_, value)| value.into_owned())
                    .ok_or_else(|| {
                        NotifyError::protocol(format!(
                            "next page on foreign origin {}",
                            url.origin().ascii_serialization()
                        ))
                    })?;
                debug!(%url, page = %page, "Rebasing foreign next-page link onto the configured origin");
                self.numbered_page_url(&page)
            }
            Some(page) => self.numbered_page_url(page),
        }
    }

    fn numbered_page_url(&self, page: &str) -> Result<Url> {
        let mut url = self.endpoint("notifications/")?;
        url.query_pairs_mut().append_pair("page", page);
        Ok(url)
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: Url,
        identity: &Identity,
    ) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(identity.token())
            .header(PROFILE_HEADER, identity.profile_id())
    }

    async fn send(builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_LIMIT {
            let mut end = ERROR_BODY_LIMIT;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(NotifyError::http(status.as_u16(), body))
    }
}

#[async_trait]
impl HistoryStore for RestHistoryStore {
    async fn fetch_page(&self, identity: &Identity, cursor: Option<&str>) -> Result<HistoryPage> {
        let url = self.page_url(cursor)?;
        trace!(%url, "Fetching notification page");
        let response = Self::send(self.request(reqwest::Method::GET, url, identity)).await?;
        let body = response.text().await?;
        serde_json::from_str::<HistoryPage>(&body)
            .map_err(|e| NotifyError::protocol(format!("unexpected history page: {e}")))
    }

    async fn mark_read(&self, identity: &Identity, id: i64) -> Result<()> {
        let url = self.endpoint(&format!("notifications/{id}/read/"))?;
        Self::send(self.request(reqwest::Method::POST, url, identity)).await?;
        Ok(())
    }

    async fn mark_all_read(&self, identity: &Identity) -> Result<u64> {
        let url = self.endpoint("notifications/read-all/")?;
        let response = Self::send(self.request(reqwest::Method::POST, url, identity)).await?;
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(0);
        }
        Ok(serde_json::from_str::<MarkAllResponse>(&body)
            .map(|r| r.unread_count)
            .unwrap_or(0))
    }
}

/// Pages fetched for the current identity.
#[derive(Debug, Clone, Default)]
pub struct HistoryCache {
    pages: Vec<Vec<NotificationRecord>>,
    next: Option<String>,
    persisted_unread: Option<u64>,
}

impl HistoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the first page has resolved at least once.
    pub fn is_loaded(&self) -> bool {
        self.persisted_unread.is_some()
    }

    /// Server unread snapshot taken from the most recent first page.
    pub fn persisted_unread(&self) -> Option<u64> {
        self.persisted_unread
    }

    pub fn next_cursor(&self) -> Option<&str> {
        self.next.as_deref()
    }

    pub fn has_more(&self) -> bool {
        self.next.is_some()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Replace everything with a freshly fetched first page.
    pub fn replace_first(&mut self, page: HistoryPage) {
        self.persisted_unread = Some(page.extra_data.unread_count);
        self.next = page.next;
        self.pages = vec![page.results];
    }

    /// Append a follow-up page. The unread snapshot only comes from the first page.
    pub fn append(&mut self, page: HistoryPage) {
        self.next = page.next;
        self.pages.push(page.results);
    }

    pub fn records(&self) -> impl Iterator<Item = &NotificationRecord> {
        self.pages.iter().flatten()
    }

    pub fn keys(&self) -> PersistedKeys {
        PersistedKeys::from_records(self.records())
    }

    /// Whether a cached persisted record with this id is still unread.
    pub fn is_unread(&self, id: i64) -> bool {
        self.records().any(|r| r.id == Some(id) && !r.is_read)
    }

    /// Flip the read flag of the cached record with this id.
    ///
    /// Decrements the unread snapshot by exactly one, and only when a cached
    /// unread record was actually flipped. Returns whether that happened.
    pub fn mark_read(&mut self, id: i64) -> bool {
        let mut flipped = false;
        for record in self
            .pages
            .iter_mut()
            .flatten()
            .filter(|r| r.id == Some(id) && !r.is_read)
        {
            record.is_read = true;
            flipped = true;
        }
        if flipped {
            self.persisted_unread = self.persisted_unread.map(|n| n.saturating_sub(1));
        }
        flipped
    }

    pub fn mark_all_read(&mut self) {
        for record in self.pages.iter_mut().flatten() {
            record.is_read = true;
        }
        self.persisted_unread = self.persisted_unread.map(|_| 0);
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.next = None;
        self.persisted_unread = None;
    }
}
