//! Integration tests for the article lifecycle against a mock Reader API:
//! paginate a stream, mutate read/star state, and handle rejected sessions.
//!
//! Each test starts its own wiremock server and in-memory SQLite database.

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedstream::api::ReaderClient;
use feedstream::cache::{MutationController, MutationError, PageFetch, QueryCache};
use feedstream::config::Config;
use feedstream::storage::{Credentials, Database, Settings, SETTINGS_KEY};
use feedstream::{ArticleId, AuthState, QueryKey, Session};

const STREAM_PATH: &str = "/reader/api/0/stream/contents/root";

fn item(id: &str) -> Value {
    json!({
        "id": id,
        "title": format!("Article {id}"),
        "published": 1_700_000_000,
        "canonical": [{ "href": format!("https://blog.example.com/{id}") }],
        "summary": { "content": format!("<p>Body of {id}</p>") },
        "origin": { "streamId": "feed/https://blog.example.com/rss", "title": "Blog" },
        "categories": ["user/-/state/com.google/reading-list"]
    })
}

fn page(prefix: &str, count: usize, continuation: &str) -> Value {
    let items: Vec<Value> = (0..count).map(|i| item(&format!("{prefix}-{i}"))).collect();
    json!({ "items": items, "continuation": continuation })
}

fn client(server: &MockServer) -> Arc<ReaderClient> {
    Arc::new(
        ReaderClient::new(&server.uri(), Duration::from_secs(5))
            .unwrap()
            .with_token(SecretString::from("tok".to_string())),
    )
}

async fn mount_write_token(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/reader/api/0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("wtok"))
        .mount(server)
        .await;
}

async fn mount_single_page(server: &MockServer, ids: &[&str]) {
    let items: Vec<Value> = ids.iter().map(|id| item(id)).collect();
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "items": items, "continuation": "" })),
        )
        .mount(server)
        .await;
}

// ============================================================================
// Pagination
// ============================================================================

#[tokio::test]
async fn test_two_pages_of_twenty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .and(query_param("n", "20"))
        .and(header("Authorization", "GoogleLogin auth=tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page("p1", 20, "1")))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .and(query_param("c", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page("p2", 20, "")))
        .expect(1)
        .mount(&server)
        .await;

    let cache = QueryCache::new(client(&server), 8, 20);
    let key = QueryKey::new("root", false);

    cache.fetch_next_page(&key).await.unwrap();
    assert!(cache.snapshot(&key).unwrap().has_next_page());

    cache.fetch_next_page(&key).await.unwrap();
    let snapshot = cache.snapshot(&key).unwrap();
    assert!(!snapshot.has_next_page());
    assert_eq!(snapshot.page_count(), 2);
    assert_eq!(snapshot.articles().len(), 40);
    assert_eq!(snapshot.articles()[20].id.as_str(), "p2-0");

    assert_eq!(
        cache.fetch_next_page(&key).await.unwrap(),
        PageFetch::Exhausted
    );
}

#[tokio::test]
async fn test_unread_only_sends_exclude_filter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .and(query_param("xt", "user/-/state/com.google/read"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page("u", 3, "")))
        .expect(1)
        .mount(&server)
        .await;

    let cache = QueryCache::new(client(&server), 8, 20);
    let snapshot = cache.get(&QueryKey::new("root", true)).await.unwrap();

    assert_eq!(snapshot.len(), 3);
}

#[tokio::test]
async fn test_server_error_keeps_loaded_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(page("p1", 5, "1")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let cache = QueryCache::new(client(&server), 8, 20);
    let key = QueryKey::new("root", false);
    cache.fetch_next_page(&key).await.unwrap();

    let err = cache.fetch_next_page(&key).await.unwrap_err();
    assert!(!err.is_unauthorized());

    let snapshot = cache.snapshot(&key).unwrap();
    assert_eq!(snapshot.len(), 5);
    assert!(snapshot.status.error.is_some());
    assert!(snapshot.has_next_page());
}

#[tokio::test]
async fn test_malformed_item_is_schema_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "items": [{ "title": "no id" }] })),
        )
        .mount(&server)
        .await;

    let cache = QueryCache::new(client(&server), 8, 20);
    let err = cache.get(&QueryKey::new("root", false)).await.unwrap_err();

    assert!(matches!(
        err.api_error(),
        feedstream::api::ApiError::Schema(_)
    ));
}

// ============================================================================
// Mutations
// ============================================================================

#[tokio::test]
async fn test_star_rolls_back_when_server_rejects() {
    let server = MockServer::start().await;
    mount_single_page(&server, &["a1"]).await;
    mount_write_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/reader/api/0/edit-tag"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(QueryCache::new(client(&server), 8, 20));
    let key = QueryKey::new("root", false);
    cache.get(&key).await.unwrap();
    let controller = MutationController::new(Arc::clone(&cache));

    let err = controller
        .toggle_star(&ArticleId::from("a1"))
        .await
        .unwrap_err();

    assert!(matches!(err, MutationError::Remote { reverted: true, .. }));
    assert!(!cache.find_entity(&key, "a1").unwrap().is_starred);
}

#[tokio::test]
async fn test_mark_read_posts_edit_tag() {
    let server = MockServer::start().await;
    mount_single_page(&server, &["a1", "a2"]).await;
    mount_write_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/reader/api/0/edit-tag"))
        .and(body_string_contains("i=a1"))
        .and(body_string_contains("a=user%2F-%2Fstate%2Fcom.google%2Fread"))
        .and(body_string_contains("T=wtok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(QueryCache::new(client(&server), 8, 20));
    let key = QueryKey::new("root", false);
    cache.get(&key).await.unwrap();
    let controller = MutationController::new(Arc::clone(&cache));

    let outcome = controller.mark_read(&ArticleId::from("a1")).await.unwrap();

    assert!(!outcome.previous);
    assert!(cache.find_entity(&key, "a1").unwrap().is_read);
    assert!(!cache.find_entity(&key, "a2").unwrap().is_read);
}

#[tokio::test]
async fn test_mark_all_read_posts_stream() {
    let server = MockServer::start().await;
    mount_single_page(&server, &["a1", "a2"]).await;
    mount_write_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/reader/api/0/mark-all-as-read"))
        .and(body_string_contains("s=root"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(QueryCache::new(client(&server), 8, 20));
    let key = QueryKey::new("root", false);
    cache.get(&key).await.unwrap();
    let controller = MutationController::new(Arc::clone(&cache));

    assert_eq!(controller.mark_all_read(&key).await.unwrap(), 2);
    assert!(cache
        .snapshot(&key)
        .unwrap()
        .articles()
        .iter()
        .all(|a| a.is_read));
}

// ============================================================================
// Session
// ============================================================================

async fn stored_session(server: &MockServer) -> (Database, Session) {
    let db = Database::open(":memory:").await.unwrap();
    db.save_credentials(&Credentials {
        server: server.uri(),
        username: "reader".to_string(),
        token: SecretString::from("tok".to_string()),
    })
    .await
    .unwrap();

    let session = Session::restore(db.clone(), &Config::default())
        .await
        .unwrap()
        .unwrap();
    (db, session)
}

#[tokio::test]
async fn test_restore_requires_credentials() {
    let db = Database::open(":memory:").await.unwrap();
    let session = Session::restore(db, &Config::default()).await.unwrap();
    assert!(session.is_none());
}

#[tokio::test]
async fn test_restored_session_reads_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .and(header("Authorization", "GoogleLogin auth=tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page("s", 4, "")))
        .mount(&server)
        .await;

    let (_db, session) = stored_session(&server).await;
    let key = QueryKey::new("root", false);
    let snapshot = session.articles(&key).await.unwrap();

    assert_eq!(snapshot.len(), 4);
    assert_eq!(
        session.article(&key, "s-2").unwrap().source_name,
        "Blog"
    );
}

#[tokio::test]
async fn test_rejected_token_signs_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STREAM_PATH))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let (db, session) = stored_session(&server).await;
    let auth = session.auth_state();

    let err = session
        .articles(&QueryKey::new("root", false))
        .await
        .unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(*auth.borrow(), AuthState::SignedOut);
    assert!(db.load_credentials().await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_stored_settings_use_defaults() {
    let server = MockServer::start().await;
    let db = Database::open(":memory:").await.unwrap();
    db.set_preference(SETTINGS_KEY, "{\"theme\": ").await.unwrap();
    db.save_credentials(&Credentials {
        server: server.uri(),
        username: "reader".to_string(),
        token: SecretString::from("tok".to_string()),
    })
    .await
    .unwrap();

    let session = Session::restore(db, &Config::default())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(session.settings(), Settings::default());
}
