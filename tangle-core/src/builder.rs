//! Incremental tree construction from outline discoveries.
//!
//! The portal's outline lists chapters in whatever order it likes, with
//! duplicates, so the builder merges rather than inserts: a record for a
//! chapter that already exists updates it in place, and re-processing the
//! same record is a no-op. Records whose ancestors have not arrived yet are
//! deferred and retried, so a shuffled outline still builds the same tree.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::warn;

use crate::chapter::{Chapter, NodeIndex, StoreError};
use crate::story::Story;

/// One outline discovery: the full choice path from a root slot down to a
/// chapter, plus the title the outline shows for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// Choice numbers from the root slot to the chapter; length 1 means a
    /// root-level chapter.
    pub path: Vec<u8>,
    pub title: String,
}

impl Discovery {
    pub fn new(path: Vec<u8>, title: impl Into<String>) -> Self {
        Self {
            path,
            title: title.into(),
        }
    }
}

/// Errors from merging discovery records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("discovery record has an empty choice path")]
    EmptyPath,

    #[error("ancestor at depth {depth} of path {path:?} has not been discovered yet")]
    MissingAncestor { path: Vec<u8>, depth: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a full outline merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutlineMerge {
    /// Records merged into the tree (including idempotent re-merges).
    pub merged: usize,
    /// Records whose ancestors never appeared; the tree does not contain
    /// them.
    pub unresolved: Vec<Discovery>,
}

impl Story {
    /// Merge one discovery record, creating or updating the addressed
    /// chapter.
    ///
    /// Root-level records grow the root-slot list as needed; deeper records
    /// walk existing links to the immediate parent, which must already have
    /// been discovered ([`BuildError::MissingAncestor`] otherwise — see
    /// [`Story::merge_outline`] for the deferring variant). Merging is
    /// idempotent: a record for an existing chapter only refreshes its
    /// title.
    pub fn merge_discovery(&mut self, record: &Discovery) -> Result<NodeIndex, BuildError> {
        let (&last, ancestors) = record.path.split_last().ok_or(BuildError::EmptyPath)?;

        if ancestors.is_empty() {
            return self.merge_root(last, &record.title);
        }

        // Walk existing links from the root slot to the immediate parent.
        let mut current = self
            .root_slot(record.path[0])
            .ok_or_else(|| BuildError::MissingAncestor {
                path: record.path.clone(),
                depth: 0,
            })?;
        for (depth, &choice) in ancestors[1..].iter().enumerate() {
            current = self.nodes.get(current)?.child(choice).ok_or_else(|| {
                BuildError::MissingAncestor {
                    path: record.path.clone(),
                    depth: depth + 1,
                }
            })?;
        }

        if let Some(existing) = self.nodes.get(current)?.child(last) {
            self.retitle(existing, &record.title)?;
            return Ok(existing);
        }

        let mut chapter = Chapter::new(record.title.clone(), last);
        chapter.parent = Some(current);
        let index = self.nodes.push(chapter)?;
        self.nodes.set_child(current, last, index)?;
        Ok(index)
    }

    /// Merge a whole outline, deferring records that arrive before their
    /// ancestors.
    ///
    /// Deferred records are retried after every pass that makes progress;
    /// once a pass resolves nothing the leftovers are returned as
    /// [`OutlineMerge::unresolved`] rather than guessed at. Records with an
    /// empty path are dropped (the outline is an unreliable source).
    pub fn merge_outline(
        &mut self,
        records: impl IntoIterator<Item = Discovery>,
    ) -> Result<OutlineMerge, BuildError> {
        let mut pending: VecDeque<Discovery> = records.into_iter().collect();
        let mut result = OutlineMerge::default();

        loop {
            let mut deferred = VecDeque::new();
            let mut progressed = false;

            while let Some(record) = pending.pop_front() {
                match self.merge_discovery(&record) {
                    Ok(_) => {
                        result.merged += 1;
                        progressed = true;
                    }
                    Err(BuildError::MissingAncestor { .. }) => deferred.push_back(record),
                    Err(BuildError::EmptyPath) => {
                        warn!("dropping outline record with empty path: {:?}", record.title);
                    }
                    Err(err @ BuildError::Store(_)) => return Err(err),
                }
            }

            if deferred.is_empty() {
                return Ok(result);
            }
            if !progressed {
                warn!(
                    unresolved = deferred.len(),
                    "outline records never resolved an ancestor"
                );
                result.unresolved = deferred.into_iter().collect();
                return Ok(result);
            }
            pending = deferred;
        }
    }

    fn merge_root(&mut self, slot: u8, title: &str) -> Result<NodeIndex, BuildError> {
        if self.root_slots.len() <= slot as usize {
            self.root_slots.resize(slot as usize + 1, None);
        }
        match self.root_slots[slot as usize] {
            Some(existing) => {
                self.retitle(existing, title)?;
                Ok(existing)
            }
            None => {
                let index = self.nodes.push(Chapter::new(title, slot))?;
                self.root_slots[slot as usize] = Some(index);
                Ok(index)
            }
        }
    }

    /// Title is the only field the outline knows; overwrite-if-nonempty.
    fn retitle(&mut self, index: NodeIndex, title: &str) -> Result<(), StoreError> {
        if !title.is_empty() {
            self.nodes.get_mut(index)?.title = title.to_string();
        }
        Ok(())
    }
}
