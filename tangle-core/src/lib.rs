//! Branching interactive-story engine.
//!
//! This crate provides:
//! - A flat, index-linked story tree built incrementally from outline
//!   discoveries, in any arrival order
//! - A compact binary archive format with lossless round-trips
//! - Cancellable, busy-page-aware chapter downloads
//! - A session facade wiring the portal client to all of the above
//!
//! # Quick Start
//!
//! ```ignore
//! use tangle_core::{DownloadOptions, DownloadProgress, PortalSession};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut session = PortalSession::new();
//!     session.load_skeleton(1_234_567).await?;
//!
//!     let report = session
//!         .download_all(
//!             DownloadOptions::default(),
//!             CancellationToken::new(),
//!             DownloadProgress::new(),
//!         )
//!         .await?;
//!     println!("{}", report.summary());
//!
//!     session.save("cave.story").await?;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod chapter;
pub mod fetch;
pub mod persist;
pub mod session;
pub mod source;
pub mod story;
pub mod testing;

// Primary public API
pub use builder::{BuildError, Discovery, OutlineMerge};
pub use chapter::{Chapter, NodeIndex, NodeStore, StoreError};
pub use fetch::{
    ChapterDownloader, ChapterOutcome, DownloadOptions, DownloadProgress, DownloadReport,
};
pub use persist::CodecError;
pub use session::{PortalSession, SessionError, SkeletonError, StorySession};
pub use source::{FetchFailure, FieldExtractor, PageFetcher, PageField, PortalExtractor};
pub use story::Story;
