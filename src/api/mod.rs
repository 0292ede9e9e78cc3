//! Remote feed-aggregation API.
//!
//! The cache and the mutation controller only see the [`FeedApi`] trait; the
//! concrete [`ReaderClient`] speaks the Google Reader compatible JSON API
//! offered by Inoreader, FreshRSS, Miniflux and friends.
//!
//! - [`types`] - serde schema for the wire format plus subscription/folder records
//! - [`client`] - reqwest-based client with ClientLogin auth and write tokens

mod client;
#[cfg(test)]
pub(crate) mod fake;
pub mod types;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::cache::{ArticleId, StreamId};

pub use client::{ApiError, ReaderClient, DEFAULT_TIMEOUT};
pub use types::{Folder, RawItem, StreamContents, Subscription, UnreadCount};

/// Parameters for one `list_stream` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamQuery {
    /// Exclude items carrying the read state.
    pub unread_only: bool,
    /// Continuation from the previous page; `None` requests the first page.
    pub continuation: Option<String>,
    /// Page size.
    pub count: u32,
}

/// Operations the client needs from the aggregation service.
///
/// Methods return boxed futures so the trait stays object safe and can be
/// shared as `Arc<dyn FeedApi>` between the cache, the mutation controller,
/// and the session.
pub trait FeedApi: Send + Sync {
    fn list_stream<'a>(
        &'a self,
        stream: &'a StreamId,
        query: &'a StreamQuery,
    ) -> BoxFuture<'a, Result<StreamContents, ApiError>>;

    fn set_read_state<'a>(
        &'a self,
        ids: &'a [ArticleId],
        read: bool,
    ) -> BoxFuture<'a, Result<(), ApiError>>;

    fn set_star_state<'a>(
        &'a self,
        id: &'a ArticleId,
        starred: bool,
    ) -> BoxFuture<'a, Result<(), ApiError>>;

    /// Mark every item in `stream` published before `older_than` as read.
    fn mark_all_read<'a>(
        &'a self,
        stream: &'a StreamId,
        older_than: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), ApiError>>;

    fn list_subscriptions(&self) -> BoxFuture<'_, Result<Vec<Subscription>, ApiError>>;

    fn list_folders(&self) -> BoxFuture<'_, Result<Vec<Folder>, ApiError>>;

    fn unread_counts(&self) -> BoxFuture<'_, Result<Vec<UnreadCount>, ApiError>>;
}
