//! Batch chapter downloads with busy-page retry and cancellation.
//!
//! The portal regenerates chapter pages on demand; until a page is ready it
//! serves a placeholder whose title does not match the chapter. The
//! downloader handles that with an unbounded per-chapter retry loop: wait,
//! refetch, check again. Chapters are fetched one at a time; each outcome
//! is independent, and a cancelled batch still reports whatever it did.
//!
//! Per-chapter fetch states:
//! `Pending -> Fetching -> (BusyRetryWait -> Fetching)* ->
//! Succeeded | Failed | Cancelled`.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chapter::NodeIndex;
use crate::source::{FieldExtractor, PageFetcher, PageField};
use crate::story::Story;

/// How long to wait before refetching a busy page.
pub const DEFAULT_BUSY_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Options for one download batch.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Redownload chapters even when their text is already present.
    pub force: bool,
    /// Wait between busy-page retries.
    pub busy_retry_delay: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            force: false,
            busy_retry_delay: DEFAULT_BUSY_RETRY_DELAY,
        }
    }
}

/// Terminal outcome of one chapter in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterOutcome {
    Succeeded,
    Failed(String),
    /// Not attempted (or abandoned at a retry boundary) because the batch
    /// was cancelled.
    Cancelled,
}

/// What a download batch did.
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    /// Outcome per target, in batch order.
    pub outcomes: Vec<(NodeIndex, ChapterOutcome)>,
    pub succeeded: usize,
    pub failed: usize,
    /// Whether the batch was cancelled before finishing.
    pub cancelled: bool,
    /// Distinct failure messages, first-seen order; identical failures
    /// across chapters coalesce to one entry.
    pub failures: Vec<String>,
}

impl DownloadReport {
    fn record(&mut self, index: NodeIndex, outcome: ChapterOutcome) {
        match &outcome {
            ChapterOutcome::Succeeded => self.succeeded += 1,
            ChapterOutcome::Failed(message) => {
                self.failed += 1;
                if !self.failures.contains(message) {
                    self.failures.push(message.clone());
                }
            }
            ChapterOutcome::Cancelled => {}
        }
        self.outcomes.push((index, outcome));
    }

    /// One-line summary for display.
    pub fn summary(&self) -> String {
        let mut line = format!("{} downloaded, {} failed", self.succeeded, self.failed);
        if self.cancelled {
            line.push_str(" (cancelled)");
        }
        for message in &self.failures {
            line.push_str("\n  - ");
            line.push_str(message);
        }
        line
    }
}

/// Shared, cloneable view of a running batch, for progress rendering.
///
/// The retry counter is the per-chapter busy-wait count; it resets when a
/// new chapter starts.
#[derive(Debug, Clone, Default)]
pub struct DownloadProgress {
    inner: Arc<ProgressInner>,
}

#[derive(Debug)]
struct ProgressInner {
    /// Raw index of the chapter being fetched; `u32::MAX` = none.
    current: AtomicU32,
    retries: AtomicU32,
    completed: AtomicUsize,
    total: AtomicUsize,
}

impl Default for ProgressInner {
    fn default() -> Self {
        Self {
            current: AtomicU32::new(u32::MAX),
            retries: AtomicU32::new(0),
            completed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// The chapter currently being fetched, if any.
    pub fn current(&self) -> Option<NodeIndex> {
        let raw = self.inner.current.load(Ordering::Relaxed);
        u16::try_from(raw).ok().map(NodeIndex)
    }

    /// Busy-page retries for the current chapter.
    pub fn retries(&self) -> u32 {
        self.inner.retries.load(Ordering::Relaxed)
    }

    /// Chapters finished (in any terminal state) so far.
    pub fn completed(&self) -> usize {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Chapters in the batch after skip-if-present filtering.
    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::Relaxed)
    }

    fn start(&self, total: usize) {
        self.inner.total.store(total, Ordering::Relaxed);
        self.inner.completed.store(0, Ordering::Relaxed);
        self.inner.current.store(u32::MAX, Ordering::Relaxed);
        self.inner.retries.store(0, Ordering::Relaxed);
    }

    fn begin_chapter(&self, index: NodeIndex) {
        self.inner.current.store(index.0 as u32, Ordering::Relaxed);
        self.inner.retries.store(0, Ordering::Relaxed);
    }

    fn bump_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn finish_chapter(&self) {
        self.inner.current.store(u32::MAX, Ordering::Relaxed);
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Downloads chapter bodies into a story, one chapter at a time.
pub struct ChapterDownloader<'a, F, E> {
    fetcher: &'a F,
    extractor: &'a E,
    options: DownloadOptions,
    cancel: CancellationToken,
    progress: DownloadProgress,
}

impl<'a, F: PageFetcher, E: FieldExtractor> ChapterDownloader<'a, F, E> {
    pub fn new(fetcher: &'a F, extractor: &'a E) -> Self {
        Self {
            fetcher,
            extractor,
            options: DownloadOptions::default(),
            cancel: CancellationToken::new(),
            progress: DownloadProgress::new(),
        }
    }

    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    /// Cancel the batch through this token; checked before each chapter
    /// starts and at every busy-retry wait.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: DownloadProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> DownloadProgress {
        self.progress.clone()
    }

    /// Download the targets in order and write successful fetches into the
    /// story.
    ///
    /// Unless [`DownloadOptions::force`] is set, targets that already have
    /// text are dropped from the work list before the batch starts and do
    /// not appear in the report. The batch never fails as a whole: every
    /// outcome lands in the report, and cancellation stops new chapters
    /// without discarding finished ones.
    pub async fn run(&self, story: &mut Story, targets: &[NodeIndex]) -> DownloadReport {
        let work: Vec<NodeIndex> = targets
            .iter()
            .copied()
            .filter(|&index| {
                self.options.force
                    || !story.nodes.get(index).map(|c| c.is_downloaded()).unwrap_or(false)
            })
            .collect();

        self.progress.start(work.len());
        let mut report = DownloadReport::default();

        for index in work {
            if self.cancel.is_cancelled() {
                report.record(index, ChapterOutcome::Cancelled);
                continue;
            }
            self.progress.begin_chapter(index);
            let outcome = self.fetch_chapter(story, index).await;
            self.progress.finish_chapter();
            if let ChapterOutcome::Failed(message) = &outcome {
                warn!(chapter = %index, %message, "chapter download failed");
            }
            report.record(index, outcome);
        }

        report.cancelled = self.cancel.is_cancelled();
        report
    }

    /// Fetch one chapter page, retrying busy pages until the real page
    /// shows up or the batch is cancelled, then write its fields into the
    /// story.
    async fn fetch_chapter(&self, story: &mut Story, index: NodeIndex) -> ChapterOutcome {
        let (url, expected_title) = match self.chapter_request(story, index) {
            Ok(request) => request,
            Err(message) => return ChapterOutcome::Failed(message),
        };

        let mut page = match self.fetcher.page(&url).await {
            Ok(page) => page,
            Err(failure) => return ChapterOutcome::Failed(failure.to_string()),
        };

        // Busy loop: the placeholder page's title does not contain the
        // chapter title.
        loop {
            let page_title = self
                .extractor
                .field(&page, PageField::PageTitle)
                .unwrap_or_default();
            if page_title.contains(&expected_title) {
                break;
            }
            self.progress.bump_retry();
            debug!(
                chapter = %index,
                retries = self.progress.retries(),
                "busy page, waiting to refetch"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return ChapterOutcome::Cancelled,
                _ = sleep(self.options.busy_retry_delay) => {}
            }
            page = match self.fetcher.page(&url).await {
                Ok(page) => page,
                Err(failure) => return ChapterOutcome::Failed(failure.to_string()),
            };
        }

        let text = match self.extractor.field(&page, PageField::ChapterText) {
            Some(text) if !text.is_empty() => text,
            _ => return ChapterOutcome::Failed("chapter text not found".to_string()),
        };
        let author = self
            .extractor
            .field(&page, PageField::ChapterAuthor)
            .unwrap_or_default();
        let labels = self.extractor.choice_labels(&page);

        let chapter = match story.nodes.get_mut(index) {
            Ok(chapter) => chapter,
            Err(e) => return ChapterOutcome::Failed(e.to_string()),
        };
        chapter.text = text;
        if !author.is_empty() {
            chapter.author = author;
        }
        for (slot, label) in labels {
            if !label.is_empty() {
                chapter.choice_labels.insert(slot, label);
            }
        }
        ChapterOutcome::Succeeded
    }

    fn chapter_request(
        &self,
        story: &Story,
        index: NodeIndex,
    ) -> Result<(String, String), String> {
        let chapter = story.nodes.get(index).map_err(|e| e.to_string())?;
        let path = story.choice_path(index).map_err(|e| e.to_string())?;
        let url = self.fetcher.chapter_url(story.item_id, &path);
        Ok((url, chapter.title.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Discovery;
    use crate::testing::{busy_page, chapter_page, MockSite};

    fn skeleton() -> Story {
        let mut story = Story::new(7);
        for record in [
            Discovery::new(vec![0], "Start"),
            Discovery::new(vec![0, 0], "Left"),
            Discovery::new(vec![0, 1], "Right"),
        ] {
            story.merge_discovery(&record).unwrap();
        }
        story
    }

    #[tokio::test]
    async fn downloads_all_targets() {
        let mut story = skeleton();
        let site = MockSite::new();
        site.queue_page("mock://7/map/1", chapter_page("Start", "alice", "Body 0", &[]));
        site.queue_page("mock://7/map/1-1", chapter_page("Left", "bob", "Body 1", &[]));
        site.queue_page(
            "mock://7/map/1-2",
            chapter_page("Right", "carol", "Body 2", &[(0, "Onward")]),
        );

        let downloader = ChapterDownloader::new(&site, &site);
        let targets = story.all_nodes();
        let report = downloader.run(&mut story, &targets).await;

        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 0);
        assert!(!report.cancelled);
        assert_eq!(story.downloaded_count(), 3);

        let right = story.root_slot(0).and_then(|r| story.nodes.get(r).unwrap().child(1)).unwrap();
        let right_node = story.nodes.get(right).unwrap();
        assert_eq!(right_node.author, "carol");
        assert_eq!(right_node.text, "Body 2");
        assert_eq!(right_node.choice_labels.get(&0).unwrap(), "Onward");
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_siblings() {
        let mut story = skeleton();
        let site = MockSite::new();
        site.queue_page("mock://7/map/1", chapter_page("Start", "a", "Body 0", &[]));
        site.queue_failure("mock://7/map/1-1", "data not found");
        site.queue_page("mock://7/map/1-2", chapter_page("Right", "c", "Body 2", &[]));

        let downloader = ChapterDownloader::new(&site, &site);
        let targets = story.all_nodes();
        let report = downloader.run(&mut story, &targets).await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures, vec!["data not found".to_string()]);
        assert_eq!(story.downloaded_count(), 2);
    }

    #[tokio::test]
    async fn identical_failures_coalesce() {
        let mut story = skeleton();
        let site = MockSite::new();
        site.queue_failure("mock://7/map/1", "data not found");
        site.queue_failure("mock://7/map/1-1", "data not found");
        site.queue_failure("mock://7/map/1-2", "socket closed");

        let downloader = ChapterDownloader::new(&site, &site);
        let targets = story.all_nodes();
        let report = downloader.run(&mut story, &targets).await;

        assert_eq!(report.failed, 3);
        assert_eq!(
            report.failures,
            vec!["data not found".to_string(), "socket closed".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn busy_pages_retry_until_real_content() {
        let mut story = skeleton();
        let site = MockSite::new();
        site.queue_page("mock://7/map/1", busy_page());
        site.queue_page("mock://7/map/1", busy_page());
        site.queue_page("mock://7/map/1", chapter_page("Start", "a", "Body 0", &[]));

        let downloader = ChapterDownloader::new(&site, &site);
        let progress = downloader.progress();
        let report = downloader.run(&mut story, &[NodeIndex(0)]).await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(site.fetch_count("mock://7/map/1"), 3);
        // Two busy waits happened; the counter survives until the next
        // chapter begins.
        assert_eq!(progress.retries(), 2);
    }

    #[tokio::test]
    async fn skips_already_downloaded_unless_forced() {
        let mut story = skeleton();
        story.nodes.get_mut(NodeIndex(0)).unwrap().text = "already here".to_string();

        let site = MockSite::new();
        site.queue_page("mock://7/map/1-1", chapter_page("Left", "b", "Body 1", &[]));
        site.queue_page("mock://7/map/1-2", chapter_page("Right", "c", "Body 2", &[]));

        let downloader = ChapterDownloader::new(&site, &site);
        let targets = story.all_nodes();
        let report = downloader.run(&mut story, &targets).await;

        // The downloaded chapter never entered the work list.
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(story.nodes.get(NodeIndex(0)).unwrap().text, "already here");

        // Forcing redownloads it.
        site.queue_page("mock://7/map/1", chapter_page("Start", "a", "Fresh", &[]));
        let downloader = ChapterDownloader::new(&site, &site).with_options(DownloadOptions {
            force: true,
            ..DownloadOptions::default()
        });
        let report = downloader.run(&mut story, &[NodeIndex(0)]).await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(story.nodes.get(NodeIndex(0)).unwrap().text, "Fresh");
    }

    #[tokio::test]
    async fn cancellation_stops_new_chapters() {
        let mut story = skeleton();
        let site = MockSite::new();
        site.queue_page("mock://7/map/1", chapter_page("Start", "a", "Body 0", &[]));

        let downloader = ChapterDownloader::new(&site, &site);
        // Cancel before the batch starts its second chapter.
        downloader.cancel_token().cancel();
        let targets = story.all_nodes();
        let report = downloader.run(&mut story, &targets).await;

        assert!(report.cancelled);
        assert_eq!(report.succeeded, 0);
        assert!(report
            .outcomes
            .iter()
            .all(|(_, outcome)| *outcome == ChapterOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_breaks_busy_wait() {
        let mut story = skeleton();
        let site = MockSite::new();
        // Nothing but busy pages: without cancellation this would spin
        // forever.
        site.queue_page("mock://7/map/1", busy_page());
        site.queue_page("mock://7/map/1", busy_page());

        let downloader = ChapterDownloader::new(&site, &site);
        let cancel = downloader.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            cancel.cancel();
        });
        let report = downloader.run(&mut story, &[NodeIndex(0)]).await;

        assert!(report.cancelled);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].1, ChapterOutcome::Cancelled);
    }

    #[tokio::test]
    async fn reports_summary_line() {
        let mut report = DownloadReport::default();
        report.record(NodeIndex(0), ChapterOutcome::Succeeded);
        report.record(NodeIndex(1), ChapterOutcome::Failed("nope".to_string()));
        let summary = report.summary();
        assert!(summary.contains("1 downloaded"));
        assert!(summary.contains("1 failed"));
        assert!(summary.contains("nope"));
    }
}
