//! Flattens stream responses into an entity table plus an ordered id list.
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use super::types::{Article, ArticleId};
use crate::api::types::{RawItem, READ_TAG, STARRED_TAG};
use crate::util::{excerpt, first_image_src, is_web_url, strip_html};

/// Maximum snippet length in characters.
const SNIPPET_CHARS: usize = 256;

/// Result of [`normalize`]: records keyed by id and the ids in input order.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub entities: HashMap<ArticleId, Arc<Article>>,
    pub result: Vec<ArticleId>,
}

/// Project raw items into [`Article`] records.
///
/// `result` has one id per input item, in input order. When the same id
/// occurs twice in one response, the first occurrence's record is kept.
pub fn normalize(items: &[RawItem]) -> Normalized {
    let mut normalized = Normalized {
        entities: HashMap::with_capacity(items.len()),
        result: Vec::with_capacity(items.len()),
    };

    for item in items {
        let article = project(item);
        let id = article.id.clone();
        normalized
            .entities
            .entry(id.clone())
            .or_insert_with(|| Arc::new(article));
        normalized.result.push(id);
    }

    normalized
}

/// Build one [`Article`] from a raw item, substituting defaults for absent
/// nested objects.
pub fn project(item: &RawItem) -> Article {
    let content = item
        .summary
        .as_ref()
        .map(|s| s.content.as_str())
        .filter(|c| !c.is_empty())
        .or_else(|| item.content.as_ref().map(|c| c.content.as_str()))
        .unwrap_or_default()
        .to_string();

    let url = item
        .canonical
        .iter()
        .chain(item.alternate.iter())
        .map(|link| link.href.as_str())
        .find(|href| !href.is_empty())
        .unwrap_or_default()
        .to_string();

    let (source_id, source_name) = item
        .origin
        .as_ref()
        .map(|o| (o.stream_id.clone(), o.title.clone()))
        .unwrap_or_default();

    Article {
        id: ArticleId::from(item.id.as_str()),
        title: item.title.clone().unwrap_or_default(),
        snippet: excerpt(&strip_html(&content), SNIPPET_CHARS).into_owned(),
        thumbnail: thumbnail(&content, &url),
        published: published_at(item),
        is_read: item.has_state(READ_TAG),
        is_starred: item.has_state(STARRED_TAG),
        source_id,
        source_name,
        content,
        url,
    }
}

/// `published` seconds, falling back to the crawl time, then the epoch.
fn published_at(item: &RawItem) -> DateTime<Utc> {
    item.published
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .or_else(|| {
            item.crawl_time_msec
                .as_deref()
                .and_then(|ms| ms.parse::<i64>().ok())
                .and_then(DateTime::from_timestamp_millis)
        })
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// First image of the body, resolved against the article URL.
fn thumbnail(content: &str, article_url: &str) -> Option<String> {
    let src = first_image_src(content)?;
    let resolved = match Url::parse(article_url) {
        Ok(base) => base.join(&src).ok()?,
        Err(_) => Url::parse(&src).ok()?,
    };
    is_web_url(&resolved).then(|| resolved.to_string())
}
