use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

use super::normalize::{normalize, Normalized};
use super::query::{CacheError, Pinned, QueryCache};
use super::types::{Page, QueryKey, QuerySnapshot};
use crate::api::{ApiError, StreamContents, StreamQuery};

// ============================================================================
// Cursor
// ============================================================================

/// Position in a stream for one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PageCursor {
    /// Nothing fetched yet; the next request asks for the first page.
    #[default]
    Fresh,
    /// The last page returned this continuation.
    More(String),
    /// The last page returned no continuation.
    Exhausted,
}

impl PageCursor {
    /// Continuation to send with the next request (`""` for the first page),
    /// or `None` once the stream is exhausted.
    pub fn next_request(&self) -> Option<&str> {
        match self {
            PageCursor::Fresh => Some(""),
            PageCursor::More(cursor) => Some(cursor),
            PageCursor::Exhausted => None,
        }
    }

    pub fn has_next_page(&self) -> bool {
        !matches!(self, PageCursor::Exhausted)
    }

    /// Cursor after a page with `continuation` arrived.
    pub fn advance(&self, continuation: Option<&str>) -> PageCursor {
        match continuation {
            Some(c) if !c.is_empty() => PageCursor::More(c.to_string()),
            _ => PageCursor::Exhausted,
        }
    }
}

// ============================================================================
// Fetching
// ============================================================================

/// Outcome of a page request that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageFetch {
    /// A page was appended at `page_index` with `added` new articles.
    Appended { page_index: usize, added: usize },
    /// A request for this key is already pending; nothing was sent.
    AlreadyInFlight,
    /// The stream has no more pages; nothing was sent.
    Exhausted,
    /// The response arrived after the entry was invalidated, evicted or
    /// refetched, and was dropped.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    /// Continue from the current cursor.
    Next,
    /// Start over from the first page, replacing existing pages on success.
    Reload,
}

struct Ticket {
    query: StreamQuery,
    generation: u64,
}

impl QueryCache {
    /// Fetch and append the next page for `key`.
    ///
    /// No request is sent while another one for the same key is pending or
    /// after the stream is exhausted.
    ///
    /// # Errors
    ///
    /// [`CacheError::Fetch`] when the request fails. Existing pages are kept
    /// and `status.error` is set; nothing is retried.
    pub async fn fetch_next_page(&self, key: &QueryKey) -> Result<PageFetch, CacheError> {
        self.fetch_page(key, FetchMode::Next).await
    }

    /// Reload `key` from the first page (explicit sync).
    ///
    /// Pages already shown stay visible until the new first page arrives. Any
    /// request still pending for the key is superseded and its response
    /// discarded.
    pub async fn refetch(&self, key: &QueryKey) -> Result<PageFetch, CacheError> {
        self.fetch_page(key, FetchMode::Reload).await
    }

    async fn fetch_page(&self, key: &QueryKey, mode: FetchMode) -> Result<PageFetch, CacheError> {
        let ticket = match self.begin_fetch(key, mode) {
            Ok(ticket) => ticket,
            Err(outcome) => return Ok(outcome),
        };

        let result = self.api.list_stream(&key.stream, &ticket.query).await;
        self.commit(key, ticket.generation, mode, result)
    }

    /// Mark the entry in flight and decide what to request.
    fn begin_fetch(&self, key: &QueryKey, mode: FetchMode) -> Result<Ticket, PageFetch> {
        let mut entries = self.entries();
        let mut next = match entries.get(key) {
            Some(snapshot) => QuerySnapshot::clone(snapshot),
            None => {
                let mut snapshot = QuerySnapshot::empty(key.clone());
                snapshot.generation = self.issue_generation();
                snapshot
            }
        };

        let continuation = match mode {
            FetchMode::Next => {
                if next.status.is_fetching {
                    tracing::debug!(key = %key, "Page fetch already in flight");
                    return Err(PageFetch::AlreadyInFlight);
                }
                let Some(cursor) = next.cursor.next_request() else {
                    return Err(PageFetch::Exhausted);
                };
                (!cursor.is_empty()).then(|| cursor.to_string())
            }
            FetchMode::Reload => {
                next.generation = self.issue_generation();
                None
            }
        };

        next.status.is_fetching = true;
        let generation = next.generation;
        entries.put(key.clone(), Arc::new(next));

        Ok(Ticket {
            query: StreamQuery {
                unread_only: key.unread_only,
                continuation,
                count: self.page_size,
            },
            generation,
        })
    }

    fn commit(
        &self,
        key: &QueryKey,
        generation: u64,
        mode: FetchMode,
        result: Result<StreamContents, ApiError>,
    ) -> Result<PageFetch, CacheError> {
        let pinned = self.pinned();
        let mut entries = self.entries();
        let current = match entries.peek(key) {
            Some(current) if current.generation == generation => Arc::clone(current),
            _ => {
                tracing::debug!(
                    key = %key,
                    failed = result.is_err(),
                    "Discarding response for superseded request"
                );
                return Ok(PageFetch::Discarded);
            }
        };

        let mut next = QuerySnapshot::clone(&current);
        next.status.is_fetching = false;

        let contents = match result {
            Ok(contents) => contents,
            Err(source) => {
                tracing::warn!(key = %key, error = %source, "Page fetch failed, keeping cached pages");
                next.status.error = Some(source.to_string());
                entries.put(key.clone(), Arc::new(next));
                return Err(CacheError::Fetch {
                    key: key.clone(),
                    source,
                });
            }
        };

        if mode == FetchMode::Reload {
            next.pages.clear();
            next.fetched_at = None;
        }

        let mut page = build_page(&next.pages, &contents);
        apply_pinned(&mut page, &pinned);
        let added = page.len();
        let page_index = next.pages.len();

        next.cursor = next.cursor.advance(contents.continuation.as_deref());
        next.status.has_next_page = next.cursor.has_next_page();
        next.status.error = None;
        next.fetched_at.get_or_insert_with(Utc::now);
        next.pages.push(Arc::new(page));

        tracing::debug!(
            key = %key,
            page = page_index,
            added,
            has_next_page = next.status.has_next_page,
            "Page committed"
        );
        entries.put(key.clone(), Arc::new(next));

        Ok(PageFetch::Appended { page_index, added })
    }
}

/// Normalize a response into a page, dropping ids already present in an
/// earlier page (the stream can shift under the cursor between requests).
fn build_page(existing: &[Arc<Page>], contents: &StreamContents) -> Page {
    let Normalized {
        mut entities,
        result,
    } = normalize(&contents.items);

    let mut seen = HashSet::with_capacity(result.len());
    let result: Vec<_> = result
        .into_iter()
        .filter(|id| {
            !existing.iter().any(|p| p.entities.contains_key(id)) && seen.insert(id.clone())
        })
        .collect();

    let dropped = entities.len().saturating_sub(seen.len());
    if dropped > 0 {
        tracing::debug!(dropped, "Skipped articles already present in earlier pages");
    }
    entities.retain(|id, _| seen.contains(id));

    Page {
        result,
        entities,
        continuation: contents.continuation.clone().filter(|c| !c.is_empty()),
    }
}

/// Overwrite server values with those of writes still in flight.
fn apply_pinned(page: &mut Page, pinned: &Pinned) {
    for ((id, field), &value) in pinned {
        if let Some(article) = page.entities.get_mut(id) {
            if field.get(article) != value {
                field.set(Arc::make_mut(article), value);
            }
        }
    }
}
