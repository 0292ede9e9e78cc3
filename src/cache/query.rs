use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::types::{Article, ArticleField, ArticleId, QueryKey, QuerySnapshot};
use crate::api::{ApiError, FeedApi};

/// Default number of `(stream, filter)` entries kept before LRU eviction.
pub const DEFAULT_CAPACITY: usize = 32;
/// Default number of items requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Field values owned by a pending optimistic write.
pub(crate) type Pinned = HashMap<(ArticleId, ArticleField), bool>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The page request failed. Previously fetched pages are retained.
    #[error("Failed to load {key}: {source}")]
    Fetch {
        key: QueryKey,
        #[source]
        source: ApiError,
    },
}

impl CacheError {
    pub fn api_error(&self) -> &ApiError {
        match self {
            CacheError::Fetch { source, .. } => source,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.api_error().is_unauthorized()
    }
}

/// Key-addressed store of paginated, normalized stream results.
///
/// Each entry is an `Arc<QuerySnapshot>`. Every write builds a new snapshot
/// (sharing untouched pages) and swaps it in under the lock, so a reader
/// holding an older `Arc` never sees a half-applied update. The lock is never
/// held across an await.
pub struct QueryCache {
    pub(crate) api: Arc<dyn FeedApi>,
    entries: Mutex<LruCache<QueryKey, Arc<QuerySnapshot>>>,
    pub(crate) page_size: u32,
    generations: AtomicU64,
    /// Applied to every page committed while the pin is held, so a response
    /// fetched before a write landed cannot undo its optimistic value.
    pinned: Mutex<Pinned>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl QueryCache {
    pub fn new(api: Arc<dyn FeedApi>, capacity: usize, page_size: u32) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            api,
            entries: Mutex::new(LruCache::new(capacity)),
            page_size: page_size.max(1),
            generations: AtomicU64::new(0),
            pinned: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn entries(&self) -> MutexGuard<'_, LruCache<QueryKey, Arc<QuerySnapshot>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pins(&self) -> MutexGuard<'_, Pinned> {
        self.pinned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold `field` of article `id` at `value` in pages committed from now on.
    pub(crate) fn pin(&self, id: &ArticleId, field: ArticleField, value: bool) {
        self.pins().insert((id.clone(), field), value);
    }

    pub(crate) fn unpin(&self, id: &ArticleId, field: ArticleField) {
        self.pins().remove(&(id.clone(), field));
    }

    /// Copy of the current pins. Taken before the entries lock.
    pub(crate) fn pinned(&self) -> Pinned {
        self.pins().clone()
    }

    /// Fresh request generation; unique across entries and their re-creations.
    pub(crate) fn issue_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current pages and status for `key`, running the first page fetch if the
    /// key has no entry yet.
    ///
    /// # Errors
    ///
    /// Returns the fetch error when that initial fetch fails; the entry stays
    /// cached with `status.error` set so a later call does not refetch.
    pub async fn get(&self, key: &QueryKey) -> Result<Arc<QuerySnapshot>, CacheError> {
        if let Some(snapshot) = self.snapshot(key) {
            return Ok(snapshot);
        }

        tracing::debug!(key = %key, "Cache miss, fetching first page");
        self.fetch_next_page(key).await?;
        Ok(self
            .snapshot(key)
            .unwrap_or_else(|| Arc::new(QuerySnapshot::empty(key.clone()))))
    }

    /// Current snapshot without fetching. Counts as a use for LRU eviction.
    pub fn snapshot(&self, key: &QueryKey) -> Option<Arc<QuerySnapshot>> {
        self.entries().get(key).cloned()
    }

    /// Apply `update` to `key`'s snapshot and publish the result atomically.
    ///
    /// Returns the new snapshot, or `None` if the key is not cached.
    pub fn mutate(
        &self,
        key: &QueryKey,
        update: impl FnOnce(&mut QuerySnapshot),
    ) -> Option<Arc<QuerySnapshot>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(key)?;
        update(Arc::make_mut(entry));
        Some(Arc::clone(entry))
    }

    /// Apply `update` to article `id` in every cached entry that holds it.
    ///
    /// Returns the number of entries changed.
    pub fn mutate_article(&self, id: &str, update: impl Fn(&mut Article)) -> usize {
        let mut entries = self.entries();
        let mut changed = 0;
        for (_, snapshot) in entries.iter_mut() {
            if snapshot.contains(id) && Arc::make_mut(snapshot).update_article(id, &update) {
                changed += 1;
            }
        }
        changed
    }

    /// First match for `id` in `key`'s pages, scanning in insertion order.
    pub fn find_entity(&self, key: &QueryKey, id: &str) -> Option<Arc<Article>> {
        self.entries().peek(key)?.find(id).cloned()
    }

    /// Look `id` up in any cached entry, most recently used first.
    pub fn find_anywhere(&self, id: &str) -> Option<Arc<Article>> {
        self.entries()
            .iter()
            .find_map(|(_, snapshot)| snapshot.find(id).cloned())
    }

    /// Drop `key`'s entry. A fetch still in flight for it will be discarded.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        let removed = self.entries().pop(key).is_some();
        if removed {
            tracing::debug!(key = %key, "Cache entry invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
