use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::pagination::PageCursor;

// ============================================================================
// Identifiers
// ============================================================================

/// Server-assigned opaque article id.
///
/// `Arc<str>` so the same id can sit in a page's `result` list, its entity
/// table, and the mutation ledger without copying the string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArticleId(Arc<str>);

impl ArticleId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ArticleId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl From<String> for ArticleId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl Borrow<str> for ArticleId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-defined stream name (reading list, a folder label, a single feed).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Every article the account is subscribed to.
    pub const READING_LIST: &'static str = "user/-/state/com.google/reading-list";
    /// Articles carrying the starred state tag.
    pub const STARRED: &'static str = "user/-/state/com.google/starred";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn reading_list() -> Self {
        Self::new(Self::READING_LIST)
    }

    pub fn starred() -> Self {
        Self::new(Self::STARRED)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache key: one entry per (stream, unread-only filter) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub stream: StreamId,
    pub unread_only: bool,
}

impl QueryKey {
    pub fn new(stream: impl Into<StreamId>, unread_only: bool) -> Self {
        Self {
            stream: stream.into(),
            unread_only,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unread_only {
            write!(f, "{} (unread)", self.stream)
        } else {
            write!(f, "{}", self.stream)
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Projected article record stored in a page's entity table.
///
/// Only `is_read` and `is_starred` change after normalization; everything
/// else is fixed by the response that created the record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Article {
    pub id: ArticleId,
    pub title: String,
    /// HTML body as delivered by the server.
    pub content: String,
    /// Plain-text excerpt derived from `content`.
    pub snippet: String,
    pub url: String,
    pub source_id: String,
    pub source_name: String,
    pub published: DateTime<Utc>,
    pub is_read: bool,
    pub is_starred: bool,
    /// First image in `content`, resolved against `url`.
    pub thumbnail: Option<String>,
}

/// The two mutable flags on an [`Article`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArticleField {
    Read,
    Starred,
}

impl ArticleField {
    pub fn get(self, article: &Article) -> bool {
        match self {
            Self::Read => article.is_read,
            Self::Starred => article.is_starred,
        }
    }

    pub fn set(self, article: &mut Article, value: bool) {
        match self {
            Self::Read => article.is_read = value,
            Self::Starred => article.is_starred = value,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Starred => "starred",
        }
    }
}

impl fmt::Display for ArticleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Pages and Snapshots
// ============================================================================

/// One fetched batch of articles in normalized form.
///
/// Membership (`result`) is fixed once the page is committed; the records in
/// `entities` are replaced copy-on-write by mutations.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub result: Vec<ArticleId>,
    pub entities: HashMap<ArticleId, Arc<Article>>,
    /// Continuation returned with this page. `None` marks the end of the stream.
    pub continuation: Option<String>,
}

impl Page {
    pub fn len(&self) -> usize {
        self.result.len()
    }

    pub fn is_empty(&self) -> bool {
        self.result.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Article>> {
        self.entities.get(id)
    }

    /// Articles in server order.
    pub fn articles(&self) -> impl Iterator<Item = &Arc<Article>> + '_ {
        self.result.iter().filter_map(|id| self.entities.get(id))
    }
}

/// Fetch bookkeeping exposed to the UI alongside the pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStatus {
    pub is_fetching: bool,
    pub has_next_page: bool,
    /// Message of the most recent failed fetch, cleared by the next success.
    pub error: Option<String>,
}

impl Default for EntryStatus {
    fn default() -> Self {
        Self {
            is_fetching: false,
            has_next_page: true,
            error: None,
        }
    }
}

/// Immutable view of one cache entry.
///
/// Readers hold an `Arc<QuerySnapshot>`; the cache never mutates a snapshot
/// that has been handed out, it swaps in a new one.
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    pub key: QueryKey,
    pub pages: Vec<Arc<Page>>,
    pub status: EntryStatus,
    /// When the first page of the current generation arrived.
    pub fetched_at: Option<DateTime<Utc>>,
    pub(crate) cursor: PageCursor,
    pub(crate) generation: u64,
}

impl QuerySnapshot {
    pub(crate) fn empty(key: QueryKey) -> Self {
        Self {
            key,
            pages: Vec::new(),
            status: EntryStatus::default(),
            fetched_at: None,
            cursor: PageCursor::default(),
            generation: 0,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Total number of articles across all pages.
    pub fn len(&self) -> usize {
        self.pages.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_next_page(&self) -> bool {
        self.cursor.has_next_page()
    }

    /// Denormalized rows in page order.
    pub fn articles(&self) -> Vec<Arc<Article>> {
        self.pages
            .iter()
            .flat_map(|p| p.articles().cloned())
            .collect()
    }

    /// First match scanning pages in insertion order.
    pub fn find(&self, id: &str) -> Option<&Arc<Article>> {
        self.pages.iter().find_map(|p| p.get(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Apply `update` to the article with `id` in every page holding it.
    ///
    /// Pages and records are cloned only when another snapshot still shares them.
    /// Returns false when the id is not in this entry.
    pub(crate) fn update_article(&mut self, id: &str, update: impl Fn(&mut Article)) -> bool {
        let mut found = false;
        for page in &mut self.pages {
            if !page.entities.contains_key(id) {
                continue;
            }
            let page = Arc::make_mut(page);
            if let Some(article) = page.entities.get_mut(id) {
                update(Arc::make_mut(article));
                found = true;
            }
        }
        found
    }
}
