//! Signed-in client state passed to every handler.
//!
//! A [`Session`] owns the API client, the query cache, the mutation
//! controller and the settings store for one login. It is created by
//! [`Session::login`] or [`Session::restore`] and ends with
//! [`Session::logout`] or when the server rejects the token, at which point
//! stored credentials are cleared and [`AuthState::SignedOut`] is published.

use secrecy::SecretString;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{watch, OnceCell};

use crate::api::{ApiError, FeedApi, Folder, ReaderClient, Subscription, UnreadCount};
use crate::cache::{
    Article, ArticleField, ArticleId, CacheError, MutationController, MutationError,
    MutationOutcome, PageFetch, QueryCache, QueryKey, QuerySnapshot, StreamId,
};
use crate::config::Config;
use crate::storage::{Credentials, Database, Settings, SETTINGS_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    SignedIn,
    SignedOut,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// The session ended; sign in again.
    #[error("Signed out")]
    SignedOut,
}

impl SessionError {
    pub fn is_unauthorized(&self) -> bool {
        match self {
            SessionError::Api(e) => e.is_unauthorized(),
            SessionError::Cache(e) => e.is_unauthorized(),
            SessionError::Mutation(e) => e.is_unauthorized(),
            SessionError::Storage(_) => false,
            SessionError::SignedOut => true,
        }
    }
}

pub struct Session {
    api: Arc<dyn FeedApi>,
    db: Database,
    cache: Arc<QueryCache>,
    mutations: MutationController,
    settings: RwLock<Settings>,
    subscriptions: OnceCell<Vec<Subscription>>,
    folders: OnceCell<Vec<Folder>>,
    auth: watch::Sender<AuthState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cache", &self.cache)
            .field("auth", &*self.auth.borrow())
            .finish()
    }
}

impl Session {
    pub fn new(api: Arc<dyn FeedApi>, db: Database, settings: Settings, capacity: usize) -> Self {
        let cache = Arc::new(QueryCache::new(
            Arc::clone(&api),
            capacity,
            settings.page_size,
        ));
        let (auth, _) = watch::channel(AuthState::SignedIn);

        Self {
            mutations: MutationController::new(Arc::clone(&cache)),
            api,
            db,
            cache,
            settings: RwLock::new(settings),
            subscriptions: OnceCell::new(),
            folders: OnceCell::new(),
            auth,
        }
    }

    /// Sign in against `config.server` and persist the token.
    pub async fn login(
        db: Database,
        config: &Config,
        username: &str,
        password: &SecretString,
    ) -> Result<Self, SessionError> {
        let client = ReaderClient::new(&config.server, config.request_timeout())?;
        let token = client.login(username, password).await?;

        db.save_credentials(&Credentials {
            server: client.base_url().to_string(),
            username: username.to_string(),
            token,
        })
        .await?;

        let settings = initial_settings(&db, config).await?;
        Ok(Self::new(
            Arc::new(client),
            db,
            settings,
            config.cache_capacity,
        ))
    }

    /// Resume from stored credentials; `None` if nobody is signed in.
    pub async fn restore(db: Database, config: &Config) -> Result<Option<Self>, SessionError> {
        let Some(credentials) = db.load_credentials().await? else {
            return Ok(None);
        };

        let client = ReaderClient::new(&credentials.server, config.request_timeout())?
            .with_token(credentials.token);
        tracing::debug!(
            server = %credentials.server,
            username = %credentials.username,
            "Restored session"
        );

        let settings = initial_settings(&db, config).await?;
        Ok(Some(Self::new(
            Arc::new(client),
            db,
            settings,
            config.cache_capacity,
        )))
    }

    /// End the session: forget the token and drop cached data.
    pub async fn logout(self) -> Result<(), SessionError> {
        self.cache.clear();
        self.db.clear_credentials().await?;
        self.auth.send_replace(AuthState::SignedOut);
        tracing::info!("Signed out");
        Ok(())
    }

    pub fn auth_state(&self) -> watch::Receiver<AuthState> {
        self.auth.subscribe()
    }

    pub fn is_signed_in(&self) -> bool {
        *self.auth.borrow() == AuthState::SignedIn
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    // ========================================================================
    // Articles
    // ========================================================================

    /// Current view of `key`, fetching the first page if it is not cached.
    pub async fn articles(&self, key: &QueryKey) -> Result<Arc<QuerySnapshot>, SessionError> {
        self.ensure_signed_in()?;
        let result = self.cache.get(key).await;
        self.check(result).await
    }

    pub async fn fetch_more(&self, key: &QueryKey) -> Result<PageFetch, SessionError> {
        self.ensure_signed_in()?;
        let result = self.cache.fetch_next_page(key).await;
        self.check(result).await
    }

    /// Reload `key` from the first page.
    pub async fn sync(&self, key: &QueryKey) -> Result<PageFetch, SessionError> {
        self.ensure_signed_in()?;
        let result = self.cache.refetch(key).await;
        self.check(result).await
    }

    /// Query for `stream` (default: the last stream viewed, then the reading
    /// list). `unread_only` falls back to the stored setting when not given.
    pub fn stream_key(&self, stream: Option<String>, unread_only: Option<bool>) -> QueryKey {
        let settings = self.settings();
        let stream = stream
            .or(settings.last_stream)
            .map(StreamId::new)
            .unwrap_or_else(StreamId::reading_list);
        QueryKey::new(stream, unread_only.unwrap_or(settings.unread_only))
    }

    /// Load `key` until it holds `pages` pages or the stream runs out.
    ///
    /// With `reload`, starts over from the first page instead of reusing
    /// cached pages.
    pub async fn load(
        &self,
        key: &QueryKey,
        pages: usize,
        reload: bool,
    ) -> Result<Arc<QuerySnapshot>, SessionError> {
        if reload {
            self.sync(key).await?;
        }
        let mut snapshot = self.articles(key).await?;

        while snapshot.page_count() < pages && snapshot.has_next_page() {
            match self.fetch_more(key).await? {
                PageFetch::Appended { .. } => {}
                outcome => {
                    tracing::debug!(key = %key, ?outcome, "Stopped loading pages");
                    break;
                }
            }
            snapshot = self.articles(key).await?;
        }
        Ok(snapshot)
    }

    /// Look an article up in `key`, then in any other cached view.
    pub fn article(&self, key: &QueryKey, id: &str) -> Option<Arc<Article>> {
        self.cache
            .find_entity(key, id)
            .or_else(|| self.cache.find_anywhere(id))
    }

    /// Return the article for display, marking it read when the
    /// `mark_read_on_open` setting is on.
    pub async fn open(
        &self,
        key: &QueryKey,
        id: &ArticleId,
    ) -> Result<Option<Arc<Article>>, SessionError> {
        let Some(article) = self.article(key, id.as_str()) else {
            return Ok(None);
        };
        if !article.is_read && self.settings().mark_read_on_open {
            self.mark_read(id).await?;
        }
        Ok(self.article(key, id.as_str()))
    }

    pub async fn mark_read(&self, id: &ArticleId) -> Result<MutationOutcome, SessionError> {
        self.ensure_signed_in()?;
        let result = self.mutations.mark_read(id).await;
        self.check(result).await
    }

    pub async fn set_read(
        &self,
        id: &ArticleId,
        read: bool,
    ) -> Result<MutationOutcome, SessionError> {
        self.ensure_signed_in()?;
        let result = self.mutations.set_field(id, ArticleField::Read, read).await;
        self.check(result).await
    }

    pub async fn set_starred(
        &self,
        id: &ArticleId,
        starred: bool,
    ) -> Result<MutationOutcome, SessionError> {
        self.ensure_signed_in()?;
        let result = self
            .mutations
            .set_field(id, ArticleField::Starred, starred)
            .await;
        self.check(result).await
    }

    pub async fn toggle_read(&self, id: &ArticleId) -> Result<MutationOutcome, SessionError> {
        self.ensure_signed_in()?;
        let result = self.mutations.toggle_read(id).await;
        self.check(result).await
    }

    pub async fn toggle_star(&self, id: &ArticleId) -> Result<MutationOutcome, SessionError> {
        self.ensure_signed_in()?;
        let result = self.mutations.toggle_star(id).await;
        self.check(result).await
    }

    pub async fn mark_all_read(&self, key: &QueryKey) -> Result<usize, SessionError> {
        self.ensure_signed_in()?;
        let result = self.mutations.mark_all_read(key).await;
        self.check(result).await
    }

    // ========================================================================
    // Account Data
    // ========================================================================

    /// Subscriptions, fetched once per session.
    pub async fn subscriptions(&self) -> Result<&[Subscription], SessionError> {
        self.ensure_signed_in()?;
        let result = self
            .subscriptions
            .get_or_try_init(|| self.api.list_subscriptions())
            .await;
        self.check(result).await.map(Vec::as_slice)
    }

    /// Folders, fetched once per session.
    pub async fn folders(&self) -> Result<&[Folder], SessionError> {
        self.ensure_signed_in()?;
        let result = self
            .folders
            .get_or_try_init(|| self.api.list_folders())
            .await;
        self.check(result).await.map(Vec::as_slice)
    }

    /// Unread counts are not memoized; they change with every mutation.
    pub async fn unread_counts(&self) -> Result<Vec<UnreadCount>, SessionError> {
        self.ensure_signed_in()?;
        let result = self.api.unread_counts().await;
        self.check(result).await
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `update` and persist the result. A new page size takes effect
    /// for views created after this session restarts.
    pub async fn update_settings(
        &self,
        update: impl FnOnce(&mut Settings),
    ) -> Result<Settings, SessionError> {
        let next = {
            let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
            update(&mut settings);
            settings.clone()
        };
        self.db.save_settings(&next).await?;
        Ok(next)
    }

    // ========================================================================
    // Authentication Failure
    // ========================================================================

    fn ensure_signed_in(&self) -> Result<(), SessionError> {
        if self.is_signed_in() {
            Ok(())
        } else {
            Err(SessionError::SignedOut)
        }
    }

    /// Convert an operation result, signing out when the server rejected the
    /// token.
    async fn check<T, E>(&self, result: Result<T, E>) -> Result<T, SessionError>
    where
        E: Into<SessionError>,
    {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e.into(),
        };
        if err.is_unauthorized() && self.is_signed_in() {
            self.sign_out_rejected().await;
        }
        Err(err)
    }

    async fn sign_out_rejected(&self) {
        tracing::warn!("Server rejected the session token, signing out");
        self.cache.clear();
        if let Err(e) = self.db.clear_credentials().await {
            tracing::error!(error = %e, "Failed to clear stored credentials");
        }
        self.auth.send_replace(AuthState::SignedOut);
    }
}

/// Stored settings, or defaults seeded from the config file on first run.
async fn initial_settings(db: &Database, config: &Config) -> Result<Settings, SessionError> {
    Ok(match db.get_preference(SETTINGS_KEY).await? {
        Some(json) => Settings::from_json(&json),
        None => Settings {
            page_size: config.page_size,
            ..Settings::default()
        },
    })
}
