//! StorySession - the primary public API for archiving a story.
//!
//! A session wraps a page fetcher and field extractor (normally the portal
//! client) together with the story being worked on, and exposes the whole
//! workflow: log in, load a skeleton by id, download chapter bodies, save
//! and reload the archive file.

use std::path::Path;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::builder::BuildError;
use crate::chapter::{NodeIndex, StoreError};
use crate::fetch::{ChapterDownloader, DownloadOptions, DownloadProgress, DownloadReport};
use crate::persist::{self, CodecError};
use crate::source::{FetchFailure, FieldExtractor, PageFetcher, PageField};
use crate::story::Story;

/// Errors that abort a whole skeleton build.
///
/// No partial story escapes: when any of these occur the session keeps
/// whatever story it had before.
#[derive(Debug, Error)]
pub enum SkeletonError {
    #[error("story {item_id} not found")]
    NotFound { item_id: u32 },

    #[error("story {item_id} requires a logged-in session")]
    AuthRequired { item_id: u32 },

    #[error("failed to fetch story pages: {0}")]
    Fetch(#[from] FetchFailure),

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no story loaded")]
    NoStory,

    #[error(transparent)]
    Skeleton(#[from] SkeletonError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("portal error: {0}")]
    Portal(#[from] portal::Error),
}

/// A story archiving session over some page source.
///
/// Generic over the collaborator traits so tests can drive it with the
/// scripted [`crate::testing::MockSite`]; real use is [`PortalSession`].
pub struct StorySession<F, E> {
    fetcher: F,
    extractor: E,
    story: Option<Story>,
}

/// A session backed by the live portal.
pub type PortalSession = StorySession<portal::Portal, crate::source::PortalExtractor>;

impl StorySession<portal::Portal, crate::source::PortalExtractor> {
    /// Create a session talking to the portal with a fresh cookie session.
    pub fn new() -> Self {
        Self::with_source(portal::Portal::new(), crate::source::PortalExtractor)
    }

    /// Log in to the portal so member-only stories resolve.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), SessionError> {
        self.fetcher.login(username, password).await?;
        Ok(())
    }
}

impl Default for StorySession<portal::Portal, crate::source::PortalExtractor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: PageFetcher, E: FieldExtractor> StorySession<F, E> {
    /// Create a session over an arbitrary page source.
    pub fn with_source(fetcher: F, extractor: E) -> Self {
        Self {
            fetcher,
            extractor,
            story: None,
        }
    }

    /// The loaded story, if any.
    pub fn story(&self) -> Option<&Story> {
        self.story.as_ref()
    }

    /// Build a story skeleton from the portal: metadata from the story
    /// page, structure and titles from the outline listing. Bodies stay
    /// empty until downloaded.
    pub async fn load_skeleton(&mut self, item_id: u32) -> Result<&Story, SessionError> {
        let story = self.build_skeleton(item_id).await?;
        info!(
            item_id,
            chapters = story.nodes.len(),
            "loaded story skeleton"
        );
        Ok(self.story.insert(story))
    }

    async fn build_skeleton(&self, item_id: u32) -> Result<Story, SkeletonError> {
        let page = self.fetcher.page(&self.fetcher.story_url(item_id)).await?;
        if self.extractor.is_not_found(&page) {
            return Err(SkeletonError::NotFound { item_id });
        }

        let mut story = Story::new(item_id);
        let field = |f| self.extractor.field(&page, f).unwrap_or_default();
        story.title = field(PageField::StoryTitle);
        story.owner = field(PageField::Owner);
        story.description = field(PageField::Description);
        story.info_text = field(PageField::InfoText);

        let outline_page = self
            .fetcher
            .page(&self.fetcher.outline_url(item_id))
            .await?;
        if self.extractor.requires_login(&outline_page) {
            return Err(SkeletonError::AuthRequired { item_id });
        }
        let records = self.extractor.outline(&outline_page);
        story.merge_outline(records)?;
        Ok(story)
    }

    /// Download the given chapters into the loaded story.
    ///
    /// The caller supplies the cancellation token and progress handle so it
    /// can render progress and cancel while the batch runs.
    pub async fn download(
        &mut self,
        targets: &[NodeIndex],
        options: DownloadOptions,
        cancel: CancellationToken,
        progress: DownloadProgress,
    ) -> Result<DownloadReport, SessionError> {
        let Self {
            fetcher,
            extractor,
            story,
        } = self;
        let story = story.as_mut().ok_or(SessionError::NoStory)?;
        let downloader = ChapterDownloader::new(&*fetcher, &*extractor)
            .with_options(options)
            .with_cancel_token(cancel)
            .with_progress(progress);
        Ok(downloader.run(story, targets).await)
    }

    /// Download every chapter in the story.
    pub async fn download_all(
        &mut self,
        options: DownloadOptions,
        cancel: CancellationToken,
        progress: DownloadProgress,
    ) -> Result<DownloadReport, SessionError> {
        let targets = self
            .story
            .as_ref()
            .ok_or(SessionError::NoStory)?
            .all_nodes();
        self.download(&targets, options, cancel, progress).await
    }

    /// Download one chapter's subtree (the chapter and every descendant).
    pub async fn download_branch(
        &mut self,
        root: NodeIndex,
        options: DownloadOptions,
        cancel: CancellationToken,
        progress: DownloadProgress,
    ) -> Result<DownloadReport, SessionError> {
        let targets = self
            .story
            .as_ref()
            .ok_or(SessionError::NoStory)?
            .subtree_nodes(root)?;
        self.download(&targets, options, cancel, progress).await
    }

    /// Save the loaded story to a binary archive file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let story = self.story.as_ref().ok_or(SessionError::NoStory)?;
        persist::save_story(story, path).await?;
        Ok(())
    }

    /// Replace the loaded story with one from a binary archive file.
    pub async fn load(&mut self, path: impl AsRef<Path>) -> Result<&Story, SessionError> {
        let story = persist::load_story(path).await?;
        Ok(self.story.insert(story))
    }

    /// Write a human-readable JSON dump of the loaded story.
    pub async fn export_json(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let story = self.story.as_ref().ok_or(SessionError::NoStory)?;
        persist::export_json(story, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        chapter_page, login_required_page, not_found_page, outline_page, story_page, MockSite,
    };

    fn scripted_site() -> MockSite {
        let site = MockSite::new();
        site.queue_page(
            "mock://42",
            story_page("The Endless Cave", "cavewriter", "Spelunking", "Bring a lamp."),
        );
        site.queue_page(
            "mock://42/outline",
            outline_page(&[
                (&[0], "The Entrance"),
                (&[0, 0], "Down the shaft"),
                (&[0, 1], "Along the ledge"),
            ]),
        );
        site
    }

    #[tokio::test]
    async fn load_skeleton_builds_metadata_and_tree() {
        let mut session = StorySession::with_source(scripted_site(), scripted_site());
        // The fetcher half serves the pages; the extractor half is
        // stateless, so a second instance is fine.
        let story = session.load_skeleton(42).await.unwrap();

        assert_eq!(story.item_id, 42);
        assert_eq!(story.title, "The Endless Cave");
        assert_eq!(story.owner, "cavewriter");
        assert_eq!(story.nodes.len(), 3);
        assert_eq!(story.used_root_slot_count(), 1);
        assert!(story.nodes.iter().all(|(_, c)| !c.is_downloaded()));
    }

    #[tokio::test]
    async fn not_found_aborts_without_partial_story() {
        let site = MockSite::new();
        site.queue_page("mock://9", not_found_page());
        let mut session = StorySession::with_source(site, MockSite::new());

        let err = session.load_skeleton(9).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Skeleton(SkeletonError::NotFound { item_id: 9 })
        ));
        assert!(session.story().is_none());
    }

    #[tokio::test]
    async fn login_walled_outline_aborts() {
        let site = MockSite::new();
        site.queue_page("mock://9", story_page("Members Only", "o", "d", "i"));
        site.queue_page("mock://9/outline", login_required_page());
        let mut session = StorySession::with_source(site, MockSite::new());

        let err = session.load_skeleton(9).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Skeleton(SkeletonError::AuthRequired { item_id: 9 })
        ));
        assert!(session.story().is_none());
    }

    #[tokio::test]
    async fn download_all_then_save_and_reload() {
        let site = scripted_site();
        site.queue_page(
            "mock://42/map/1",
            chapter_page("The Entrance", "alice", "You stand at the mouth.", &[]),
        );
        site.queue_page(
            "mock://42/map/1-1",
            chapter_page("Down the shaft", "bob", "Down you go.", &[]),
        );
        site.queue_page(
            "mock://42/map/1-2",
            chapter_page("Along the ledge", "carol", "Careful now.", &[]),
        );
        let mut session = StorySession::with_source(site, MockSite::new());
        session.load_skeleton(42).await.unwrap();

        let report = session
            .download_all(
                DownloadOptions::default(),
                CancellationToken::new(),
                DownloadProgress::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.succeeded, 3);
        assert_eq!(session.story().unwrap().downloaded_count(), 3);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cave.story");
        session.save(&path).await.unwrap();

        let saved = session.story().unwrap().clone();
        let mut fresh = StorySession::with_source(MockSite::new(), MockSite::new());
        let loaded = fresh.load(&path).await.unwrap();
        assert_eq!(*loaded, saved);
    }

    #[tokio::test]
    async fn download_branch_limits_targets_to_subtree() {
        let site = scripted_site();
        site.queue_page(
            "mock://42/map/1-1",
            chapter_page("Down the shaft", "bob", "Down you go.", &[]),
        );
        let mut session = StorySession::with_source(site, MockSite::new());
        session.load_skeleton(42).await.unwrap();

        let root = session.story().unwrap().root_slot(0).unwrap();
        let shaft = session
            .story()
            .unwrap()
            .nodes
            .get(root)
            .unwrap()
            .child(0)
            .unwrap();

        let report = session
            .download_branch(
                shaft,
                DownloadOptions::default(),
                CancellationToken::new(),
                DownloadProgress::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn operations_without_a_story_fail() {
        let mut session = StorySession::with_source(MockSite::new(), MockSite::new());
        let err = session
            .download_all(
                DownloadOptions::default(),
                CancellationToken::new(),
                DownloadProgress::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NoStory));
        assert!(matches!(
            session.save("/tmp/nowhere.story").await.unwrap_err(),
            SessionError::NoStory
        ));
    }
}
