//! Optimistic read/star updates with per-invocation rollback.
//!
//! Every mutation writes the new value into the cache before the remote call
//! is issued, so readers see it immediately. A ledger keyed by
//! `(article, field)` tracks the last value the server confirmed and which
//! invocation currently owns the cached value:
//!
//! - a failed write reverts to the confirmed value only if no newer mutation
//!   on the same field was issued since;
//! - a successful write becomes the confirmed value, and is shown again if a
//!   newer mutation has already failed and rolled back.
//!
//! Nothing is retried; failures are returned to the caller.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::query::QueryCache;
use super::types::{ArticleField, ArticleId, QueryKey, StreamId};
use crate::api::{ApiError, FeedApi};

#[derive(Debug, Error)]
pub enum MutationError {
    /// The article is not in any cached entry, so there is nothing to update.
    #[error("Article {0} is not cached")]
    NotFound(ArticleId),

    #[error("Failed to set {field} on {article_id}: {source}")]
    Remote {
        article_id: ArticleId,
        field: ArticleField,
        #[source]
        source: ApiError,
        /// Whether the cached value was rolled back.
        reverted: bool,
    },

    #[error("Failed to mark {count} articles read: {source}")]
    Batch {
        count: usize,
        #[source]
        source: ApiError,
        reverted: usize,
    },

    #[error("Failed to mark {stream} read: {source}")]
    Stream {
        stream: StreamId,
        #[source]
        source: ApiError,
        reverted: usize,
    },
}

impl MutationError {
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            MutationError::NotFound(_) => None,
            MutationError::Remote { source, .. }
            | MutationError::Batch { source, .. }
            | MutationError::Stream { source, .. } => Some(source),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.api_error().is_some_and(ApiError::is_unauthorized)
    }
}

/// A settled single-article mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    pub article_id: ArticleId,
    pub field: ArticleField,
    /// Value captured from the cache when the mutation was issued.
    pub previous: bool,
    pub value: bool,
    /// Number of cache entries that held the article.
    pub entries_updated: usize,
}

#[derive(Debug)]
struct LedgerEntry {
    /// Invocation whose optimistic value is in the cache; 0 once rolled back.
    latest: u64,
    /// Invocation that produced `base`.
    confirmed: u64,
    /// Last value known to be on the server.
    base: bool,
    pending: usize,
}

/// Bookkeeping for one applied optimistic write.
#[derive(Debug)]
struct Pending {
    id: ArticleId,
    field: ArticleField,
    seq: u64,
    previous: bool,
    value: bool,
    entries_updated: usize,
}

impl Pending {
    fn outcome(self) -> MutationOutcome {
        MutationOutcome {
            article_id: self.id,
            field: self.field,
            previous: self.previous,
            value: self.value,
            entries_updated: self.entries_updated,
        }
    }
}

type LedgerKey = (ArticleId, ArticleField);

/// Applies read/star changes optimistically to a [`QueryCache`] and mirrors
/// them to the server.
pub struct MutationController {
    cache: Arc<QueryCache>,
    api: Arc<dyn FeedApi>,
    ledger: Mutex<HashMap<LedgerKey, LedgerEntry>>,
    sequence: AtomicU64,
}

impl std::fmt::Debug for MutationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationController")
            .field("in_flight", &self.ledger().len())
            .finish()
    }
}

impl MutationController {
    /// Writes go to the same API the cache reads from.
    pub fn new(cache: Arc<QueryCache>) -> Self {
        let api = Arc::clone(&cache.api);
        Self {
            cache,
            api,
            ledger: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Number of `(article, field)` pairs with a write still pending.
    pub fn in_flight(&self) -> usize {
        self.ledger().len()
    }

    fn ledger(&self) -> MutexGuard<'_, HashMap<LedgerKey, LedgerEntry>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set `field` on article `id` to `value`.
    ///
    /// The cache is updated before this future first yields. On failure the
    /// value is rolled back (unless a newer mutation on the same field owns
    /// it) and the error is returned.
    pub async fn set_field(
        &self,
        id: &ArticleId,
        field: ArticleField,
        value: bool,
    ) -> Result<MutationOutcome, MutationError> {
        let pending = self.begin(id, field, value)?;

        let result = match field {
            ArticleField::Read => {
                self.api
                    .set_read_state(std::slice::from_ref(id), value)
                    .await
            }
            ArticleField::Starred => self.api.set_star_state(id, value).await,
        };

        let reverted = self.settle(&pending, result.is_ok());
        match result {
            Ok(()) => Ok(pending.outcome()),
            Err(source) => {
                tracing::warn!(
                    article_id = %id,
                    field = %field,
                    reverted,
                    error = %source,
                    "Mutation rejected by server"
                );
                Err(MutationError::Remote {
                    article_id: id.clone(),
                    field,
                    source,
                    reverted,
                })
            }
        }
    }

    pub async fn mark_read(&self, id: &ArticleId) -> Result<MutationOutcome, MutationError> {
        self.set_field(id, ArticleField::Read, true).await
    }

    pub async fn mark_unread(&self, id: &ArticleId) -> Result<MutationOutcome, MutationError> {
        self.set_field(id, ArticleField::Read, false).await
    }

    pub async fn toggle_read(&self, id: &ArticleId) -> Result<MutationOutcome, MutationError> {
        self.toggle(id, ArticleField::Read).await
    }

    pub async fn star(&self, id: &ArticleId) -> Result<MutationOutcome, MutationError> {
        self.set_field(id, ArticleField::Starred, true).await
    }

    pub async fn unstar(&self, id: &ArticleId) -> Result<MutationOutcome, MutationError> {
        self.set_field(id, ArticleField::Starred, false).await
    }

    pub async fn toggle_star(&self, id: &ArticleId) -> Result<MutationOutcome, MutationError> {
        self.toggle(id, ArticleField::Starred).await
    }

    async fn toggle(
        &self,
        id: &ArticleId,
        field: ArticleField,
    ) -> Result<MutationOutcome, MutationError> {
        let current = self
            .cache
            .find_anywhere(id.as_str())
            .map(|article| field.get(&article))
            .ok_or_else(|| MutationError::NotFound(id.clone()))?;
        self.set_field(id, field, !current).await
    }

    /// Mark several articles read with one remote call.
    ///
    /// Repeated ids are sent once. Ids that are not cached are still sent to
    /// the server. Returns how many cached articles changed from unread to read.
    pub async fn mark_many_read(&self, ids: &[ArticleId]) -> Result<usize, MutationError> {
        let mut seen = HashSet::with_capacity(ids.len());
        let ids: Vec<ArticleId> = ids
            .iter()
            .filter(|id| seen.insert(*id))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let pending: Vec<Pending> = ids
            .iter()
            .filter_map(|id| self.begin(id, ArticleField::Read, true).ok())
            .collect();
        let changed = pending.iter().filter(|p| !p.previous).count();

        let result = self.api.set_read_state(&ids, true).await;
        let reverted = self.settle_all(&pending, result.is_ok());
        match result {
            Ok(()) => Ok(changed),
            Err(source) => {
                tracing::warn!(count = ids.len(), reverted, error = %source, "Batch mark-read rejected");
                Err(MutationError::Batch {
                    count: ids.len(),
                    source,
                    reverted,
                })
            }
        }
    }

    /// Mark everything in `key`'s stream read on the server, flipping the
    /// cached unread articles of that entry immediately.
    ///
    /// Only items older than the entry's first fetch are marked, so articles
    /// that arrived after the view loaded stay unread.
    pub async fn mark_all_read(&self, key: &QueryKey) -> Result<usize, MutationError> {
        let snapshot = self.cache.snapshot(key);
        let older_than = snapshot
            .as_ref()
            .and_then(|s| s.fetched_at)
            .unwrap_or_else(Utc::now);

        let pending: Vec<Pending> = snapshot
            .iter()
            .flat_map(|s| s.articles())
            .filter(|article| !article.is_read)
            .filter_map(|article| self.begin(&article.id, ArticleField::Read, true).ok())
            .collect();
        let changed = pending.len();
        tracing::debug!(key = %key, changed, "Marking stream read");

        let result = self.api.mark_all_read(&key.stream, older_than).await;
        let reverted = self.settle_all(&pending, result.is_ok());
        match result {
            Ok(()) => Ok(changed),
            Err(source) => {
                tracing::warn!(key = %key, reverted, error = %source, "Mark-all-read rejected");
                Err(MutationError::Stream {
                    stream: key.stream.clone(),
                    source,
                    reverted,
                })
            }
        }
    }

    /// Capture the current value and apply `value` to every cached copy.
    fn begin(
        &self,
        id: &ArticleId,
        field: ArticleField,
        value: bool,
    ) -> Result<Pending, MutationError> {
        // Ledger before cache entries, everywhere
        let mut ledger = self.ledger();
        let previous = self
            .cache
            .find_anywhere(id.as_str())
            .map(|article| field.get(&article))
            .ok_or_else(|| MutationError::NotFound(id.clone()))?;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = ledger
            .entry((id.clone(), field))
            .or_insert(LedgerEntry {
                latest: 0,
                confirmed: 0,
                base: previous,
                pending: 0,
            });
        entry.latest = seq;
        entry.pending += 1;

        self.cache.pin(id, field, value);
        let entries_updated = self
            .cache
            .mutate_article(id.as_str(), |article| field.set(article, value));
        tracing::debug!(article_id = %id, field = %field, value, seq, "Optimistic update applied");

        Ok(Pending {
            id: id.clone(),
            field,
            seq,
            previous,
            value,
            entries_updated,
        })
    }

    /// Record the remote result. Returns true if a failure rolled the cached
    /// value back.
    fn settle(&self, pending: &Pending, succeeded: bool) -> bool {
        let mut ledger = self.ledger();
        let key = (pending.id.clone(), pending.field);
        let Some(entry) = ledger.get_mut(&key) else {
            return false;
        };
        entry.pending = entry.pending.saturating_sub(1);

        let restore = if succeeded {
            if pending.seq > entry.confirmed {
                entry.base = pending.value;
                entry.confirmed = pending.seq;
            }
            if entry.latest == pending.seq {
                // A page committed while the write was in flight may hold
                // the pre-write value
                Some(pending.value)
            } else {
                // A newer mutation failed and rolled back before this one landed
                (entry.latest == 0).then_some(entry.base)
            }
        } else if entry.latest == pending.seq {
            entry.latest = 0;
            Some(entry.base)
        } else {
            tracing::debug!(
                article_id = %pending.id,
                field = %pending.field,
                "Superseded mutation failed, keeping newer value"
            );
            None
        };

        if entry.pending == 0 {
            ledger.remove(&key);
            self.cache.unpin(&pending.id, pending.field);
        } else if let Some(value) = restore {
            self.cache.pin(&pending.id, pending.field, value);
        }

        if let Some(value) = restore {
            self.cache
                .mutate_article(pending.id.as_str(), |article| pending.field.set(article, value));
        }
        !succeeded && restore.is_some()
    }

    fn settle_all(&self, pending: &[Pending], succeeded: bool) -> usize {
        pending
            .iter()
            .filter(|p| self.settle(p, succeeded))
            .count()
    }
}
