//! Interfaces to the remote story source.
//!
//! The engine never touches the network or parses markup itself: it sees a
//! [`PageFetcher`] that turns URLs into page text and a [`FieldExtractor`]
//! that turns page text into field values. The portal client implements
//! both; tests script them (see [`crate::testing`]).

use async_trait::async_trait;
use thiserror::Error;

use crate::builder::Discovery;

/// A failed page fetch or extraction for a single chapter.
///
/// Carries only a message: one chapter's failure is recorded in the batch
/// report and never aborts its siblings, so there is nothing to branch on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct FetchFailure(pub String);

impl FetchFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// One field the extractor can pull out of fetched markup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageField {
    /// The page's own title, used for busy-page and error detection.
    PageTitle,
    StoryTitle,
    Owner,
    Description,
    InfoText,
    ChapterAuthor,
    ChapterText,
}

/// Fetches raw page text for the engine.
///
/// Implementations own whatever session state the remote needs; fetches
/// must suspend rather than block, since the caller renders progress while
/// a fetch is outstanding.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn page(&self, url: &str) -> Result<String, FetchFailure>;

    /// URL of a story's main page.
    fn story_url(&self, item_id: u32) -> String;

    /// URL of a story's outline listing.
    fn outline_url(&self, item_id: u32) -> String;

    /// URL of the chapter addressed by a 0-based choice path.
    fn chapter_url(&self, item_id: u32, path: &[u8]) -> String;
}

/// Extracts field values from fetched page text.
pub trait FieldExtractor: Send + Sync {
    /// Extract one field, `None` when the page lacks it.
    fn field(&self, page: &str, field: PageField) -> Option<String>;

    /// Explicit choice labels on a chapter page, as (0-based slot, label).
    fn choice_labels(&self, page: &str) -> Vec<(u8, String)>;

    /// Discovery records from an outline listing.
    fn outline(&self, page: &str) -> Vec<Discovery>;

    /// Whether the page says the requested story does not exist.
    fn is_not_found(&self, page: &str) -> bool;

    /// Whether the page is a login wall instead of the requested content.
    fn requires_login(&self, page: &str) -> bool;
}

#[async_trait]
impl PageFetcher for portal::Portal {
    async fn page(&self, url: &str) -> Result<String, FetchFailure> {
        portal::Portal::page(self, url)
            .await
            .map_err(|e| FetchFailure::new(e.to_string()))
    }

    fn story_url(&self, item_id: u32) -> String {
        portal::Portal::story_url(self, item_id)
    }

    fn outline_url(&self, item_id: u32) -> String {
        portal::Portal::outline_url(self, item_id)
    }

    fn chapter_url(&self, item_id: u32, path: &[u8]) -> String {
        portal::Portal::chapter_url(self, item_id, path)
    }
}

/// Field extraction backed by the portal's markup patterns.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortalExtractor;

impl FieldExtractor for PortalExtractor {
    fn field(&self, page: &str, field: PageField) -> Option<String> {
        use portal::extract;
        match field {
            PageField::PageTitle => extract::page_title(page),
            PageField::StoryTitle => extract::story_title(page),
            PageField::Owner => extract::owner(page),
            PageField::Description => extract::description(page),
            PageField::InfoText => extract::info_text(page),
            PageField::ChapterAuthor => extract::chapter_author(page),
            PageField::ChapterText => extract::chapter_text(page),
        }
    }

    fn choice_labels(&self, page: &str) -> Vec<(u8, String)> {
        portal::extract::choice_labels(page)
    }

    fn outline(&self, page: &str) -> Vec<Discovery> {
        portal::extract::outline(page)
            .into_iter()
            .map(|entry| Discovery::new(entry.path, entry.title))
            .collect()
    }

    fn is_not_found(&self, page: &str) -> bool {
        portal::extract::is_item_not_found(page)
    }

    fn requires_login(&self, page: &str) -> bool {
        portal::extract::requires_login(page)
    }
}
