use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::types::{
    sort_folders, sort_subscriptions, Folder, StreamContents, Subscription, SubscriptionList,
    TagList, UnreadCount, UnreadCountList, READ_TAG, STARRED_TAG,
};
use super::{FeedApi, StreamQuery};
use crate::cache::{ArticleId, StreamId};
use crate::util::validate_base_url;

const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_TOKEN_SIZE: usize = 4096;
/// Header the Google Reader API sets on a 401 caused by a stale `T` token
/// (as opposed to a revoked session).
const BAD_TOKEN_HEADER: &str = "X-Reader-Google-Bad-Token";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors returned by the remote API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    /// Non-2xx response other than 401
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Session token missing, expired or revoked. Not recoverable without signing in again.
    #[error("Not signed in or session expired")]
    Unauthorized,
    /// Response body did not match the expected schema
    #[error("Unexpected response from server: {0}")]
    Schema(String),
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    #[error("Invalid server URL: {0}")]
    InvalidBaseUrl(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }

    /// Network hiccups and 5xx responses; the caller may offer a retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Timeout(_) => true,
            ApiError::HttpStatus(status) => *status >= 500,
            ApiError::Unauthorized
            | ApiError::Schema(_)
            | ApiError::ResponseTooLarge(_)
            | ApiError::InvalidBaseUrl(_) => false,
        }
    }
}

/// Client for a Google Reader compatible aggregation service.
///
/// Holds the ClientLogin session token and the short-lived write token (`T`)
/// that every state-changing request must carry. A 401 clears the session
/// token; the owner decides how to re-authenticate.
pub struct ReaderClient {
    http: reqwest::Client,
    base: Url,
    timeout: Duration,
    auth: RwLock<Option<SecretString>>,
    write_token: tokio::sync::Mutex<Option<String>>,
}

impl std::fmt::Debug for ReaderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderClient")
            .field("base", &self.base.as_str())
            .field("timeout", &self.timeout)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl ReaderClient {
    /// Build a client for `base_url` (e.g. `https://www.inoreader.com` or
    /// `https://rss.example.org/api/greader.php`).
    ///
    /// # Errors
    ///
    /// [`ApiError::InvalidBaseUrl`] when the URL does not parse or uses plain
    /// HTTP against a non-local host.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base =
            validate_base_url(base_url).map_err(|e| ApiError::InvalidBaseUrl(e.to_string()))?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("feedstream/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base,
            timeout,
            auth: RwLock::new(None),
            write_token: tokio::sync::Mutex::new(None),
        })
    }

    /// Resume a session from a stored token.
    pub fn with_token(self, token: SecretString) -> Self {
        self.set_token(Some(token));
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn set_token(&self, token: Option<SecretString>) {
        *self.auth.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Exchange credentials for a session token (ClientLogin).
    ///
    /// The token is kept by the client and also returned so the caller can
    /// persist it.
    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<SecretString, ApiError> {
        let url = self.endpoint(&["accounts", "ClientLogin"])?;
        let body = encode_form(&[("Email", username), ("Passwd", password.expose_secret())]);
        let request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(body);
        let response = self.execute(request).await?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            tracing::warn!(username = %username, "Login rejected by server");
            return Err(ApiError::Unauthorized);
        }
        let response = check_status(response)?;
        let bytes = read_limited_bytes(response, MAX_TOKEN_SIZE).await?;
        let text = String::from_utf8_lossy(&bytes);

        let token = text
            .lines()
            .find_map(|line| line.strip_prefix("Auth="))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Schema("ClientLogin response has no Auth= line".into()))?
            .to_string();

        tracing::info!(username = %username, server = %self.base, "Signed in");
        self.set_token(Some(SecretString::from(token.clone())));
        *self.write_token.lock().await = None;
        Ok(SecretString::from(token))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn stream_contents(
        &self,
        stream: &StreamId,
        query: &StreamQuery,
    ) -> Result<StreamContents, ApiError> {
        let mut url =
            self.endpoint(&["reader", "api", "0", "stream", "contents", stream.as_str()])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("n", &query.count.to_string());
            if query.unread_only {
                pairs.append_pair("xt", READ_TAG);
            }
            if let Some(c) = query.continuation.as_deref().filter(|c| !c.is_empty()) {
                pairs.append_pair("c", c);
            }
        }

        let contents: StreamContents = self.get_json(url).await?;
        tracing::debug!(
            stream = %stream,
            items = contents.items.len(),
            has_more = contents.continuation.as_deref().is_some_and(|c| !c.is_empty()),
            "Fetched stream page"
        );
        Ok(contents)
    }

    pub async fn subscriptions(&self) -> Result<Vec<Subscription>, ApiError> {
        let url = self.json_endpoint(&["reader", "api", "0", "subscription", "list"])?;
        let list: SubscriptionList = self.get_json(url).await?;
        let mut subs: Vec<Subscription> =
            list.subscriptions.into_iter().map(Subscription::from).collect();
        sort_subscriptions(&mut subs);
        Ok(subs)
    }

    pub async fn folders(&self) -> Result<Vec<Folder>, ApiError> {
        let url = self.json_endpoint(&["reader", "api", "0", "tag", "list"])?;
        let list: TagList = self.get_json(url).await?;
        let mut folders: Vec<Folder> = list.tags.into_iter().filter_map(|t| t.into_folder()).collect();
        sort_folders(&mut folders);
        Ok(folders)
    }

    pub async fn unread_count_list(&self) -> Result<Vec<UnreadCount>, ApiError> {
        let url = self.json_endpoint(&["reader", "api", "0", "unread-count"])?;
        let list: UnreadCountList = self.get_json(url).await?;
        Ok(list
            .unreadcounts
            .into_iter()
            .map(|c| UnreadCount {
                stream_id: c.id,
                count: c.count,
            })
            .collect())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Add or remove a state tag on a batch of items.
    pub async fn edit_tag(&self, ids: &[ArticleId], tag: &str, add: bool) -> Result<(), ApiError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut params: Vec<(&str, &str)> = ids.iter().map(|id| ("i", id.as_str())).collect();
        params.push((if add { "a" } else { "r" }, tag));

        self.post_write(&["reader", "api", "0", "edit-tag"], &params)
            .await?;
        tracing::debug!(count = ids.len(), tag = %tag, add, "Edited item tags");
        Ok(())
    }

    pub async fn mark_stream_read(
        &self,
        stream: &StreamId,
        older_than: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        let ts = older_than.timestamp_micros().to_string();
        self.post_write(
            &["reader", "api", "0", "mark-all-as-read"],
            &[("s", stream.as_str()), ("ts", ts.as_str())],
        )
        .await?;
        tracing::info!(stream = %stream, "Marked stream as read");
        Ok(())
    }

    // ========================================================================
    // Transport
    // ========================================================================

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidBaseUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn json_endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.endpoint(segments)?;
        url.query_pairs_mut().append_pair("output", "json");
        Ok(url)
    }

    fn auth_header(&self) -> Option<String> {
        self.auth
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|token| format!("GoogleLogin auth={}", token.expose_secret()))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ApiError::Timeout(self.timeout))??;
        Ok(response)
    }

    /// Send with the session header. A 401 that is not a stale write token
    /// drops the session token before surfacing [`ApiError::Unauthorized`].
    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let Some(auth) = self.auth_header() else {
            return Err(ApiError::Unauthorized);
        };
        let response = self.execute(request.header(AUTHORIZATION, auth)).await?;

        if response.status() == StatusCode::UNAUTHORIZED
            && !response.headers().contains_key(BAD_TOKEN_HEADER)
        {
            tracing::warn!(url = %response.url().path(), "Server rejected session token");
            self.set_token(None);
            return Err(ApiError::Unauthorized);
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        let response = check_status(self.send(self.http.get(url)).await?)?;
        let bytes = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Schema(e.to_string()))
    }

    async fn write_token(&self, refresh: bool) -> Result<String, ApiError> {
        let mut cached = self.write_token.lock().await;
        if !refresh {
            if let Some(token) = cached.as_ref() {
                return Ok(token.clone());
            }
        }

        let url = self.endpoint(&["reader", "api", "0", "token"])?;
        let response = check_status(self.send(self.http.get(url)).await?)?;
        let bytes = read_limited_bytes(response, MAX_TOKEN_SIZE).await?;
        let token = String::from_utf8(bytes)
            .map_err(|_| ApiError::Schema("write token is not valid UTF-8".into()))?
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(ApiError::Schema("server returned an empty write token".into()));
        }

        *cached = Some(token.clone());
        Ok(token)
    }

    /// POST a state change, refreshing the write token once if the server
    /// reports it stale.
    async fn post_write(&self, segments: &[&str], params: &[(&str, &str)]) -> Result<(), ApiError> {
        for attempt in 0..2 {
            let token = self.write_token(attempt > 0).await?;
            let mut form = params.to_vec();
            form.push(("T", token.as_str()));

            let url = self.endpoint(segments)?;
            let request = self
                .http
                .post(url)
                .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
                .body(encode_form(&form));
            let response = self.send(request).await?;

            if response.status() == StatusCode::UNAUTHORIZED {
                tracing::debug!(attempt, "Write token rejected, refreshing");
                continue;
            }
            check_status(response)?;
            return Ok(());
        }
        Err(ApiError::Unauthorized)
    }
}

impl FeedApi for ReaderClient {
    fn list_stream<'a>(
        &'a self,
        stream: &'a StreamId,
        query: &'a StreamQuery,
    ) -> BoxFuture<'a, Result<StreamContents, ApiError>> {
        self.stream_contents(stream, query).boxed()
    }

    fn set_read_state<'a>(
        &'a self,
        ids: &'a [ArticleId],
        read: bool,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        self.edit_tag(ids, READ_TAG, read).boxed()
    }

    fn set_star_state<'a>(
        &'a self,
        id: &'a ArticleId,
        starred: bool,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        self.edit_tag(std::slice::from_ref(id), STARRED_TAG, starred)
            .boxed()
    }

    fn mark_all_read<'a>(
        &'a self,
        stream: &'a StreamId,
        older_than: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        self.mark_stream_read(stream, older_than).boxed()
    }

    fn list_subscriptions(&self) -> BoxFuture<'_, Result<Vec<Subscription>, ApiError>> {
        self.subscriptions().boxed()
    }

    fn list_folders(&self) -> BoxFuture<'_, Result<Vec<Folder>, ApiError>> {
        self.folders().boxed()
    }

    fn unread_counts(&self) -> BoxFuture<'_, Result<Vec<UnreadCount>, ApiError>> {
        self.unread_count_list().boxed()
    }
}

fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }
    if !status.is_success() {
        return Err(ApiError::HttpStatus(status.as_u16()));
    }
    Ok(response)
}

fn encode_form(pairs: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

async fn read_limited_bytes(response: Response, limit: usize) -> Result<Vec<u8>, ApiError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(ApiError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(ApiError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn signed_in(server: &MockServer) -> ReaderClient {
        ReaderClient::new(&server.uri(), Duration::from_secs(5))
            .unwrap()
            .with_token(SecretString::from("tok".to_string()))
    }

    async fn mount_write_token(server: &MockServer, token: &str) {
        Mock::given(method("GET"))
            .and(path("/reader/api/0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(token))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_login_extracts_auth_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/ClientLogin"))
            .and(body_string_contains("Email=me%40example.com"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("SID=x\nLSID=y\nAuth=abc123\n"),
            )
            .mount(&server)
            .await;

        let client = ReaderClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let token = client
            .login("me@example.com", &SecretString::from("pw".to_string()))
            .await
            .unwrap();

        assert_eq!(token.expose_secret(), "abc123");
        assert!(client.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/ClientLogin"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Error=BadAuthentication"))
            .mount(&server)
            .await;

        let client = ReaderClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let result = client
            .login("me", &SecretString::from("wrong".to_string()))
            .await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_stream_contents_sends_filter_and_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reader/api/0/stream/contents/root"))
            .and(query_param("n", "20"))
            .and(query_param("xt", READ_TAG))
            .and(query_param("c", "next-1"))
            .and(header("Authorization", "GoogleLogin auth=tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"items":[{"id":"a1","title":"One"}],"continuation":"next-2"}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = signed_in(&server).await;
        let query = StreamQuery {
            unread_only: true,
            continuation: Some("next-1".to_string()),
            count: 20,
        };
        let contents = client
            .stream_contents(&StreamId::from("root"), &query)
            .await
            .unwrap();

        assert_eq!(contents.items.len(), 1);
        assert_eq!(contents.continuation.as_deref(), Some("next-2"));
    }

    #[tokio::test]
    async fn test_stream_id_is_percent_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/reader/api/0/stream/contents/user%2F-%2Fstate%2Fcom.google%2Freading-list",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"items":[]}"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = signed_in(&server).await;
        let query = StreamQuery {
            unread_only: false,
            continuation: None,
            count: 10,
        };
        let contents = client
            .stream_contents(&StreamId::reading_list(), &query)
            .await
            .unwrap();
        assert!(contents.items.is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_clears_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = signed_in(&server).await;
        let result = client.subscriptions().await;

        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_request_without_token_is_unauthorized() {
        let server = MockServer::start().await;
        let client = ReaderClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let result = client.folders().await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_malformed_json_is_schema_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"items":[{"title":1}]}"#))
            .mount(&server)
            .await;

        let client = signed_in(&server).await;
        let query = StreamQuery {
            unread_only: false,
            continuation: None,
            count: 20,
        };
        let result = client.stream_contents(&StreamId::from("root"), &query).await;
        assert!(matches!(result, Err(ApiError::Schema(_))));
    }

    #[tokio::test]
    async fn test_server_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = signed_in(&server).await;
        let err = client.unread_count_list().await.unwrap_err();
        assert!(matches!(err, ApiError::HttpStatus(503)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_edit_tag_sends_write_token() {
        let server = MockServer::start().await;
        mount_write_token(&server, "wt-1").await;
        Mock::given(method("POST"))
            .and(path("/reader/api/0/edit-tag"))
            .and(body_string_contains("i=a1"))
            .and(body_string_contains("i=a2"))
            .and(body_string_contains("a=user%2F-%2Fstate%2Fcom.google%2Fread"))
            .and(body_string_contains("T=wt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        let client = signed_in(&server).await;
        client
            .edit_tag(&[ArticleId::from("a1"), ArticleId::from("a2")], READ_TAG, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_write_token_is_refreshed_once() {
        let server = MockServer::start().await;
        mount_write_token(&server, "wt").await;
        Mock::given(method("POST"))
            .and(path("/reader/api/0/edit-tag"))
            .respond_with(ResponseTemplate::new(401).insert_header(BAD_TOKEN_HEADER, "true"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/reader/api/0/edit-tag"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&server)
            .await;

        let client = signed_in(&server).await;
        client
            .edit_tag(&[ArticleId::from("a1")], STARRED_TAG, false)
            .await
            .unwrap();
        assert!(client.is_authenticated());
    }

    #[tokio::test]
    async fn test_edit_tag_empty_batch_is_noop() {
        let server = MockServer::start().await;
        let client = signed_in(&server).await;
        client.edit_tag(&[], READ_TAG, true).await.unwrap();
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_folders_skip_state_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reader/api/0/tag/list"))
            .and(query_param("output", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"tags":[{"id":"user/-/state/com.google/starred"},{"id":"user/-/label/Tech","sortid":"B"},{"id":"user/-/label/Art","sortid":"A"}]}"#,
            ))
            .mount(&server)
            .await;

        let client = signed_in(&server).await;
        let folders = client.folders().await.unwrap();
        let titles: Vec<_> = folders.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(titles, vec!["Art", "Tech"]);
    }

    #[test]
    fn test_insecure_base_url_rejected() {
        let result = ReaderClient::new("http://reader.example.com", DEFAULT_TIMEOUT);
        assert!(matches!(result, Err(ApiError::InvalidBaseUrl(_))));
    }

    #[test]
    fn test_debug_hides_token() {
        let client = ReaderClient::new("https://reader.example.com", DEFAULT_TIMEOUT)
            .unwrap()
            .with_token(SecretString::from("secret-token".to_string()));
        let debug = format!("{:?}", client);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("authenticated: true"));
    }
}
