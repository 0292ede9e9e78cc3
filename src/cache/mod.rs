//! Normalized, paginated article cache with optimistic updates.
//!
//! - [`normalize`] - flattens stream responses into entity tables
//! - [`pagination`] - continuation cursors and page fetching
//! - [`query`] - the keyed LRU store of query snapshots
//! - [`mutation`] - optimistic read/star updates with rollback

pub mod mutation;
pub mod normalize;
pub mod pagination;
pub mod query;
mod types;

pub use mutation::{MutationController, MutationError, MutationOutcome};
pub use normalize::{normalize, Normalized};
pub use pagination::{PageCursor, PageFetch};
pub use query::{CacheError, QueryCache, DEFAULT_CAPACITY, DEFAULT_PAGE_SIZE};
pub use types::{
    Article, ArticleField, ArticleId, EntryStatus, Page, QueryKey, QuerySnapshot, StreamId,
};
