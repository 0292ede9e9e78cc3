//! Client core for Google Reader compatible feed services.
//!
//! Articles are fetched a page at a time into a normalized [`cache::QueryCache`]
//! keyed by stream and filter. Read and star changes are applied to the cache
//! immediately by [`cache::MutationController`] and rolled back if the server
//! rejects them. [`session::Session`] ties the cache, the HTTP client and the
//! local settings store together for one signed-in account.

pub mod api;
pub mod cache;
pub mod config;
pub mod session;
pub mod storage;
pub mod util;

pub use cache::{Article, ArticleId, QueryCache, QueryKey, StreamId};
pub use session::{AuthState, Session, SessionError};
