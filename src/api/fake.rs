//! Scripted in-memory [`FeedApi`] for unit tests.
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::types::RawItem;
use super::{ApiError, FeedApi, Folder, StreamContents, StreamQuery, Subscription, UnreadCount};
use crate::cache::{ArticleId, StreamId};

/// Holds a call open until the test releases it.
#[derive(Default)]
pub(crate) struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WriteCall {
    Read(Vec<String>, bool),
    Star(String, bool),
    MarkAll(String),
}

#[derive(Default)]
pub(crate) struct FakeApi {
    pages: Mutex<VecDeque<Result<StreamContents, ApiError>>>,
    writes: Mutex<VecDeque<Result<(), ApiError>>>,
    pub stream_calls: Mutex<Vec<StreamQuery>>,
    pub write_calls: Mutex<Vec<WriteCall>>,
    pub list_calls: AtomicUsize,
    stream_gate: Mutex<Option<Arc<Gate>>>,
    write_gate: Mutex<Option<Arc<Gate>>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_page(&self, ids: &[&str], continuation: &str) {
        let items = ids.iter().map(|id| raw_item(id)).collect();
        self.pages.lock().unwrap().push_back(Ok(StreamContents {
            items,
            continuation: Some(continuation.to_string()),
        }));
    }

    pub fn push_page_error(&self, error: ApiError) {
        self.pages.lock().unwrap().push_back(Err(error));
    }

    /// Writes succeed unless a result was queued.
    pub fn push_write_result(&self, result: Result<(), ApiError>) {
        self.writes.lock().unwrap().push_back(result);
    }

    pub fn gate_streams(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.stream_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn gate_writes(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.write_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn stream_call_count(&self) -> usize {
        self.stream_calls.lock().unwrap().len()
    }

    /// Results are assigned in call order; only the first call after
    /// `gate_writes` is held at the gate.
    async fn next_write(&self, call: WriteCall) -> Result<(), ApiError> {
        self.write_calls.lock().unwrap().push(call);
        let result = self.writes.lock().unwrap().pop_front().unwrap_or(Ok(()));
        let gate = self.write_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        result
    }
}

pub(crate) fn raw_item(id: &str) -> RawItem {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "title": format!("Title {id}"),
        "published": 1_700_000_000,
        "canonical": [{ "href": format!("https://example.com/{id}") }],
        "summary": { "content": format!("<p>Body of {id}</p>") },
        "origin": { "streamId": "feed/https://example.com/rss", "title": "Example" },
        "categories": ["user/-/state/com.google/reading-list"],
    }))
    .unwrap()
}

impl FeedApi for FakeApi {
    fn list_stream<'a>(
        &'a self,
        _stream: &'a StreamId,
        query: &'a StreamQuery,
    ) -> BoxFuture<'a, Result<StreamContents, ApiError>> {
        async move {
            self.stream_calls.lock().unwrap().push(query.clone());
            let gate = self.stream_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                gate.pass().await;
            }
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(StreamContents::default()))
        }
        .boxed()
    }

    fn set_read_state<'a>(
        &'a self,
        ids: &'a [ArticleId],
        read: bool,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        let ids = ids.iter().map(|id| id.to_string()).collect();
        self.next_write(WriteCall::Read(ids, read)).boxed()
    }

    fn set_star_state<'a>(
        &'a self,
        id: &'a ArticleId,
        starred: bool,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        self.next_write(WriteCall::Star(id.to_string(), starred))
            .boxed()
    }

    fn mark_all_read<'a>(
        &'a self,
        stream: &'a StreamId,
        _older_than: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        self.next_write(WriteCall::MarkAll(stream.to_string()))
            .boxed()
    }

    fn list_subscriptions(&self) -> BoxFuture<'_, Result<Vec<Subscription>, ApiError>> {
        async move {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Subscription {
                id: "feed/https://example.com/rss".to_string(),
                title: "Example".to_string(),
                url: "https://example.com/rss".to_string(),
                html_url: "https://example.com".to_string(),
                icon_url: None,
                folders: vec!["user/-/label/Tech".to_string()],
                sort_id: "A".to_string(),
            }])
        }
        .boxed()
    }

    fn list_folders(&self) -> BoxFuture<'_, Result<Vec<Folder>, ApiError>> {
        async move {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Folder {
                id: "user/-/label/Tech".to_string(),
                title: "Tech".to_string(),
                sort_id: "A".to_string(),
            }])
        }
        .boxed()
    }

    fn unread_counts(&self) -> BoxFuture<'_, Result<Vec<UnreadCount>, ApiError>> {
        async move { Ok(Vec::new()) }.boxed()
    }
}
