//! Wire schema for the Google Reader compatible JSON API.
//!
//! Required fields are plain (deserialization fails loudly when they are
//! missing); nested objects the server may omit are `#[serde(default)]`.
use serde::{Deserialize, Serialize};

/// State tag marking an item as read.
pub const READ_TAG: &str = "user/-/state/com.google/read";
/// State tag marking an item as starred.
pub const STARRED_TAG: &str = "user/-/state/com.google/starred";

// ============================================================================
// Stream Contents
// ============================================================================

/// Response of `stream/contents/{streamId}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamContents {
    #[serde(default)]
    pub items: Vec<RawItem>,
    /// Absent or empty on the last page.
    #[serde(default)]
    pub continuation: Option<String>,
}

/// A single item as returned by the server, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawItem {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Seconds since the epoch.
    #[serde(default)]
    pub published: Option<i64>,
    #[serde(default, rename = "crawlTimeMsec")]
    pub crawl_time_msec: Option<String>,
    #[serde(default)]
    pub canonical: Vec<Link>,
    #[serde(default)]
    pub alternate: Vec<Link>,
    #[serde(default)]
    pub summary: Option<ContentBody>,
    #[serde(default)]
    pub content: Option<ContentBody>,
    #[serde(default)]
    pub origin: Option<Origin>,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Link {
    #[serde(default)]
    pub href: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentBody {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Origin {
    #[serde(default, rename = "streamId")]
    pub stream_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "htmlUrl")]
    pub html_url: String,
}

impl RawItem {
    /// True when `categories` carries the given state, in either the `user/-/`
    /// shorthand or the numeric `user/<id>/` form some servers echo back.
    pub fn has_state(&self, tag: &str) -> bool {
        let Some(suffix) = tag.strip_prefix("user/-/") else {
            return self.categories.iter().any(|c| c == tag);
        };
        self.categories.iter().any(|c| {
            c == tag
                || c.strip_prefix("user/")
                    .and_then(|rest| rest.split_once('/'))
                    .is_some_and(|(_, state)| state == suffix)
        })
    }
}

// ============================================================================
// Subscriptions and Folders
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SubscriptionList {
    #[serde(default)]
    pub subscriptions: Vec<RawSubscription>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawSubscription {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "htmlUrl")]
    pub html_url: String,
    #[serde(default, rename = "iconUrl")]
    pub icon_url: String,
    #[serde(default)]
    pub sortid: String,
    #[serde(default)]
    pub categories: Vec<RawCategory>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawCategory {
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TagList {
    #[serde(default)]
    pub tags: Vec<RawTag>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawTag {
    pub id: String,
    #[serde(default)]
    pub sortid: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct UnreadCountList {
    #[serde(default)]
    pub unreadcounts: Vec<RawUnreadCount>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawUnreadCount {
    pub id: String,
    #[serde(default)]
    pub count: u64,
}

/// A feed the account is subscribed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: String,
    pub title: String,
    pub url: String,
    pub html_url: String,
    pub icon_url: Option<String>,
    /// Ids of the folders this feed is filed under.
    pub folders: Vec<String>,
    pub sort_id: String,
}

/// A user label grouping subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Folder {
    pub id: String,
    pub title: String,
    pub sort_id: String,
}

/// Unread total for one stream (feed, folder or reading list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadCount {
    pub stream_id: String,
    pub count: u64,
}

impl From<RawSubscription> for Subscription {
    fn from(raw: RawSubscription) -> Self {
        Self {
            id: raw.id,
            title: raw.title,
            url: raw.url,
            html_url: raw.html_url,
            icon_url: (!raw.icon_url.is_empty()).then_some(raw.icon_url),
            folders: raw.categories.into_iter().map(|c| c.id).collect(),
            sort_id: raw.sortid,
        }
    }
}

impl RawTag {
    /// Only `.../label/<name>` tags are folders; state tags are skipped, as are
    /// labels a server explicitly types as something other than a folder.
    pub(crate) fn into_folder(self) -> Option<Folder> {
        if matches!(self.kind.as_deref(), Some(kind) if kind != "folder") {
            return None;
        }
        let (_, title) = self.id.split_once("/label/")?;
        Some(Folder {
            title: title.to_string(),
            id: self.id,
            sort_id: self.sortid,
        })
    }
}

/// Sort by server sort key, then title, matching the order the web client shows.
pub(crate) fn sort_subscriptions(subs: &mut [Subscription]) {
    subs.sort_by(|a, b| {
        a.sort_id
            .cmp(&b.sort_id)
            .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
    });
}

pub(crate) fn sort_folders(folders: &mut [Folder]) {
    folders.sort_by(|a, b| {
        a.sort_id
            .cmp(&b.sort_id)
            .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
    });
}
