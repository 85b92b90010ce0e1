//! Chapter nodes and the append-only node arena.
//!
//! Chapters live in a single flat [`NodeStore`]; parent and child links are
//! arena indices, never owning references, so the tree is a forest by
//! construction and serializes trivially. Indices are assigned densely in
//! creation order and are never reused or removed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Index of a chapter in the [`NodeStore`] arena.
///
/// The persisted format stores indices as `u16` and reserves `0xFFFF` as
/// its on-disk "absent" sentinel, so a store holds at most `u16::MAX`
/// chapters. In memory "absent" is always `Option<NodeIndex>`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeIndex(pub u16);

impl NodeIndex {
    /// The index as a plain array position.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors from [`NodeStore`] misuse.
///
/// These indicate a violated invariant in calling code rather than a
/// recoverable runtime condition; callers should not retry them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("chapter index {index} out of range (store holds {len})")]
    OutOfRange { index: NodeIndex, len: usize },

    #[error("parent {parent} already has a different child at choice {choice}")]
    Conflict { parent: NodeIndex, choice: u8 },

    #[error("parent chain from {index} does not terminate")]
    Cycle { index: NodeIndex },

    #[error("node store is full")]
    Full,
}

/// One unit of narrative content plus its structural links.
///
/// An empty `text` means the chapter body has not been downloaded yet; the
/// skeleton built from the outline knows only titles and structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// Chapter title as seen in the outline or on the chapter page.
    pub title: String,
    /// Author of this chapter (stories are collaboratively written).
    pub author: String,
    /// The 0-based slot this chapter occupies under its parent.
    pub choice_number: Option<u8>,
    /// Parent chapter, `None` for a root chapter.
    pub parent: Option<NodeIndex>,
    /// Downloaded body text; empty until fetched.
    pub text: String,
    /// Children by choice slot. Sparse: unused slots are `None`, and the
    /// vector is only as long as the highest used slot + 1.
    pub children: Vec<Option<NodeIndex>>,
    /// Explicit label overrides by choice slot. A slot with no entry takes
    /// the child's title as its label.
    pub choice_labels: BTreeMap<u8, String>,
}

impl Chapter {
    /// Create a chapter known only by title and position.
    pub fn new(title: impl Into<String>, choice_number: u8) -> Self {
        Self {
            title: title.into(),
            choice_number: Some(choice_number),
            ..Self::default()
        }
    }

    /// Whether the chapter body has been downloaded.
    pub fn is_downloaded(&self) -> bool {
        !self.text.is_empty()
    }

    /// The child index at a choice slot, if that slot is used.
    pub fn child(&self, choice: u8) -> Option<NodeIndex> {
        self.children.get(choice as usize).copied().flatten()
    }

    /// Whether a choice slot holds a child.
    pub fn has_child(&self, choice: u8) -> bool {
        self.child(choice).is_some()
    }

    /// Choice slots that hold children, in slot order.
    pub fn used_choices(&self) -> impl Iterator<Item = (u8, NodeIndex)> + '_ {
        self.children
            .iter()
            .enumerate()
            .filter_map(|(slot, child)| child.map(|c| (slot as u8, c)))
    }

    /// Merge another view of the same chapter into this one.
    ///
    /// Fields fill in, never erase: an incoming value overwrites only when
    /// it is non-empty (strings), `Some` (options), or a used slot
    /// (children, labels).
    pub fn merge(&mut self, update: &Chapter) {
        if !update.title.is_empty() {
            self.title = update.title.clone();
        }
        if !update.author.is_empty() {
            self.author = update.author.clone();
        }
        if update.choice_number.is_some() {
            self.choice_number = update.choice_number;
        }
        if update.parent.is_some() {
            self.parent = update.parent;
        }
        if !update.text.is_empty() {
            self.text = update.text.clone();
        }
        if self.children.len() < update.children.len() {
            self.children.resize(update.children.len(), None);
        }
        for (slot, child) in update.children.iter().enumerate() {
            if child.is_some() {
                self.children[slot] = *child;
            }
        }
        for (slot, label) in &update.choice_labels {
            if !label.is_empty() {
                self.choice_labels.insert(*slot, label.clone());
            }
        }
    }
}

/// Flat, densely-indexed arena of chapters.
///
/// Append-only: chapters are never removed, so an index handed out once
/// stays valid for the life of the story (and across save/load cycles).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStore {
    nodes: Vec<Chapter>,
}

impl NodeStore {
    /// Highest number of chapters a store can hold; the persisted format
    /// reserves `0xFFFF` as an index sentinel.
    pub const MAX_NODES: usize = u16::MAX as usize;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All chapters with their indices, in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeIndex, &Chapter)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, chapter)| (NodeIndex(i as u16), chapter))
    }

    pub fn get(&self, index: NodeIndex) -> Result<&Chapter, StoreError> {
        self.nodes.get(index.as_usize()).ok_or(StoreError::OutOfRange {
            index,
            len: self.nodes.len(),
        })
    }

    pub fn get_mut(&mut self, index: NodeIndex) -> Result<&mut Chapter, StoreError> {
        let len = self.nodes.len();
        self.nodes
            .get_mut(index.as_usize())
            .ok_or(StoreError::OutOfRange { index, len })
    }

    /// Append a chapter, returning its newly assigned index.
    pub fn push(&mut self, chapter: Chapter) -> Result<NodeIndex, StoreError> {
        if self.nodes.len() >= Self::MAX_NODES {
            return Err(StoreError::Full);
        }
        let index = NodeIndex(self.nodes.len() as u16);
        self.nodes.push(chapter);
        Ok(index)
    }

    /// Whether `parent` has a child at `choice`. False when `parent` is out
    /// of range or the slot is beyond the current children length.
    pub fn has_child(&self, parent: NodeIndex, choice: u8) -> bool {
        self.get(parent).map(|c| c.has_child(choice)).unwrap_or(false)
    }

    /// Link `child` under `parent` at the given choice slot, growing the
    /// sparse children vector as needed and stamping the child's back
    /// links.
    ///
    /// Linking the same pair twice is a no-op; a slot already holding a
    /// *different* child, or a child already under a different parent, is a
    /// [`StoreError::Conflict`].
    pub fn set_child(
        &mut self,
        parent: NodeIndex,
        choice: u8,
        child: NodeIndex,
    ) -> Result<(), StoreError> {
        // Validate both ends before mutating either.
        self.get(child)?;
        let existing = self.get(parent)?.child(choice);
        match existing {
            Some(current) if current == child => return Ok(()),
            Some(_) => return Err(StoreError::Conflict { parent, choice }),
            None => {}
        }

        {
            let child_node = self.get(child)?;
            if child_node.parent.is_some_and(|p| p != parent) {
                return Err(StoreError::Conflict { parent, choice });
            }
        }

        let parent_node = self.get_mut(parent)?;
        if parent_node.children.len() <= choice as usize {
            parent_node.children.resize(choice as usize + 1, None);
        }
        parent_node.children[choice as usize] = Some(child);

        let child_node = self.get_mut(child)?;
        child_node.parent = Some(parent);
        child_node.choice_number = Some(choice);
        Ok(())
    }
}
