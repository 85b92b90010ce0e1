//! Testing utilities for the story engine.
//!
//! This module provides a scripted stand-in for the portal:
//! - [`MockSite`] implements both collaborator traits from per-URL queues
//! - page builders (`story_page`, `chapter_page`, `busy_page`, ...) write
//!   the tiny line-oriented format the mock extractor reads
//!
//! Use it for deterministic tests without network access.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::builder::Discovery;
use crate::source::{FetchFailure, FieldExtractor, PageFetcher, PageField};

/// A scripted remote site.
///
/// Pages are queued per URL and served in order; fetching a URL with an
/// empty queue fails, so tests notice unexpected extra fetches. The mock
/// "markup" is one `key: value` line per field.
#[derive(Debug, Default)]
pub struct MockSite {
    pages: Mutex<HashMap<String, VecDeque<Result<String, String>>>>,
    fetches: Mutex<HashMap<String, usize>>,
}

impl MockSite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a page body to serve for `url`.
    pub fn queue_page(&self, url: impl Into<String>, body: impl Into<String>) {
        self.pages
            .lock()
            .expect("mock site lock")
            .entry(url.into())
            .or_default()
            .push_back(Ok(body.into()));
    }

    /// Queue a fetch failure for `url`.
    pub fn queue_failure(&self, url: impl Into<String>, message: impl Into<String>) {
        self.pages
            .lock()
            .expect("mock site lock")
            .entry(url.into())
            .or_default()
            .push_back(Err(message.into()));
    }

    /// How many times `url` has been fetched.
    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetches
            .lock()
            .expect("mock site lock")
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl PageFetcher for MockSite {
    async fn page(&self, url: &str) -> Result<String, FetchFailure> {
        *self
            .fetches
            .lock()
            .expect("mock site lock")
            .entry(url.to_string())
            .or_default() += 1;
        let next = self
            .pages
            .lock()
            .expect("mock site lock")
            .get_mut(url)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Ok(body)) => Ok(body),
            Some(Err(message)) => Err(FetchFailure::new(message)),
            None => Err(FetchFailure::new(format!("no scripted page for {url}"))),
        }
    }

    fn story_url(&self, item_id: u32) -> String {
        format!("mock://{item_id}")
    }

    fn outline_url(&self, item_id: u32) -> String {
        format!("mock://{item_id}/outline")
    }

    fn chapter_url(&self, item_id: u32, path: &[u8]) -> String {
        let segments = path
            .iter()
            .map(|c| (*c as u16 + 1).to_string())
            .collect::<Vec<_>>()
            .join("-");
        format!("mock://{item_id}/map/{segments}")
    }
}

impl FieldExtractor for MockSite {
    fn field(&self, page: &str, field: PageField) -> Option<String> {
        let key = match field {
            PageField::PageTitle => "page-title",
            PageField::StoryTitle => "story-title",
            PageField::Owner => "owner",
            PageField::Description => "description",
            PageField::InfoText => "info-text",
            PageField::ChapterAuthor => "chapter-author",
            PageField::ChapterText => "chapter-text",
        };
        line_value(page, key)
    }

    fn choice_labels(&self, page: &str) -> Vec<(u8, String)> {
        page.lines()
            .filter_map(|line| {
                let rest = line.trim().strip_prefix("choice ")?;
                let (slot, label) = rest.split_once(':')?;
                Some((slot.trim().parse().ok()?, label.trim().to_string()))
            })
            .collect()
    }

    fn outline(&self, page: &str) -> Vec<Discovery> {
        page.lines()
            .filter_map(|line| {
                let rest = line.trim().strip_prefix("outline ")?;
                let (path, title) = rest.split_once(':')?;
                let path = path
                    .trim()
                    .split('-')
                    .map(|seg| seg.parse().ok())
                    .collect::<Option<Vec<u8>>>()?;
                Some(Discovery::new(path, title.trim()))
            })
            .collect()
    }

    fn is_not_found(&self, page: &str) -> bool {
        page.contains("not-found")
    }

    fn requires_login(&self, page: &str) -> bool {
        page.contains("login-required")
    }
}

fn line_value(page: &str, key: &str) -> Option<String> {
    page.lines().find_map(|line| {
        line.trim()
            .strip_prefix(key)?
            .strip_prefix(':')
            .map(|value| value.trim().to_string())
    })
}

/// The tree's shape as a map from choice path to title.
///
/// Node indices depend on merge order, so two stories built from the same
/// records in different orders are "the same tree" only up to this
/// projection; compare shapes, not stores, in order-independence tests.
pub fn tree_shape(story: &crate::story::Story) -> std::collections::BTreeMap<Vec<u8>, String> {
    story
        .nodes
        .iter()
        .map(|(index, chapter)| {
            let path = story
                .choice_path(index)
                .expect("story tree is index-consistent");
            (path, chapter.title.clone())
        })
        .collect()
}

/// A story main page in the mock format.
pub fn story_page(title: &str, owner: &str, description: &str, info: &str) -> String {
    format!(
        "page-title: {title}\nstory-title: {title}\nowner: {owner}\n\
         description: {description}\ninfo-text: {info}\n"
    )
}

/// An outline page; `entries` are (0-based path, title).
pub fn outline_page(entries: &[(&[u8], &str)]) -> String {
    let mut page = String::from("page-title: Outline\n");
    for (path, title) in entries {
        let joined = path
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join("-");
        page.push_str(&format!("outline {joined}: {title}\n"));
    }
    page
}

/// A chapter page; `labels` are (0-based slot, label).
pub fn chapter_page(title: &str, author: &str, text: &str, labels: &[(u8, &str)]) -> String {
    let mut page = format!(
        "page-title: {title}\nchapter-author: {author}\nchapter-text: {text}\n"
    );
    for (slot, label) in labels {
        page.push_str(&format!("choice {slot}: {label}\n"));
    }
    page
}

/// The placeholder served while a chapter page is being regenerated.
pub fn busy_page() -> String {
    "page-title: Please wait - this story is being updated\n".to_string()
}

/// The portal's "no such story" page.
pub fn not_found_page() -> String {
    "page-title: not-found\n".to_string()
}

/// A login wall instead of the requested page.
pub fn login_required_page() -> String {
    "page-title: login-required\n".to_string()
}
