//! The story aggregate: metadata, root slots, and the chapter arena.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chapter::{NodeIndex, NodeStore, StoreError};

/// A branching interactive story.
///
/// A story fresh from the outline is a *skeleton*: structure and titles are
/// known but chapter bodies are empty until downloaded. Both skeletons and
/// fully downloaded stories round-trip through the binary save format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    /// The portal's numeric id for this story.
    pub item_id: u32,
    pub title: String,
    pub owner: String,
    pub description: String,
    pub info_text: String,
    /// Top-level chapters by root choice slot. Sparse, like a chapter's
    /// children: unused slots are `None`.
    pub root_slots: Vec<Option<NodeIndex>>,
    pub nodes: NodeStore,
}

impl Story {
    pub fn new(item_id: u32) -> Self {
        Self {
            item_id,
            ..Self::default()
        }
    }

    /// The chapter in a root slot, if that slot is used.
    pub fn root_slot(&self, slot: u8) -> Option<NodeIndex> {
        self.root_slots.get(slot as usize).copied().flatten()
    }

    /// Number of root slots that hold a chapter.
    pub fn used_root_slot_count(&self) -> usize {
        self.root_slots.iter().flatten().count()
    }

    /// Used root slots with their chapters, in slot order.
    pub fn root_chapters(&self) -> impl Iterator<Item = (u8, NodeIndex)> + '_ {
        self.root_slots
            .iter()
            .enumerate()
            .filter_map(|(slot, index)| index.map(|i| (slot as u8, i)))
    }

    /// Number of chapters whose body has been downloaded.
    pub fn downloaded_count(&self) -> usize {
        self.nodes.iter().filter(|(_, c)| c.is_downloaded()).count()
    }

    /// The full choice path addressing a chapter: choice numbers from its
    /// root slot down to the chapter itself.
    pub fn choice_path(&self, index: NodeIndex) -> Result<Vec<u8>, StoreError> {
        let mut path = Vec::new();
        let mut current = Some(index);
        let mut hops = 0usize;
        while let Some(idx) = current {
            if hops > self.nodes.len() {
                return Err(StoreError::Cycle { index });
            }
            let chapter = self.nodes.get(idx)?;
            if let Some(choice) = chapter.choice_number {
                path.push(choice);
            }
            current = chapter.parent;
            hops += 1;
        }
        path.reverse();
        Ok(path)
    }

    /// Every chapter reachable from `root` (including `root` itself), each
    /// exactly once, in depth-first order.
    pub fn subtree_nodes(&self, root: NodeIndex) -> Result<Vec<NodeIndex>, StoreError> {
        let mut visited = Vec::new();
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            let chapter = self.nodes.get(index)?;
            visited.push(index);
            // Reverse so children pop in slot order.
            for child in chapter.children.iter().rev().flatten() {
                stack.push(*child);
            }
        }
        Ok(visited)
    }

    /// Number of chapters in the subtree rooted at `root`.
    pub fn subtree_size(&self, root: NodeIndex) -> Result<usize, StoreError> {
        Ok(self.subtree_nodes(root)?.len())
    }

    /// Every chapter in the story, in creation order.
    pub fn all_nodes(&self) -> Vec<NodeIndex> {
        self.nodes.iter().map(|(index, _)| index).collect()
    }

    /// The label shown for picking `choice` under `parent`: the explicit
    /// override when the chapter page provided one, otherwise the child's
    /// title.
    pub fn choice_label(&self, parent: NodeIndex, choice: u8) -> Option<String> {
        let parent_node = self.nodes.get(parent).ok()?;
        if let Some(label) = parent_node.choice_labels.get(&choice) {
            return Some(label.clone());
        }
        let child = parent_node.child(choice)?;
        Some(self.nodes.get(child).ok()?.title.clone())
    }
}

impl fmt::Display for Story {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Item ID: {}", self.item_id)?;
        writeln!(f, "Title: {}", self.title)?;
        writeln!(f, "Owner: {}", self.owner)?;
        writeln!(f, "Description: {}", self.description)?;
        write!(
            f,
            "Chapters: {} ({} downloaded)",
            self.nodes.len(),
            self.downloaded_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Discovery;

    fn sample_story() -> Story {
        // Root 0 with children at slots 0 and 1; one grandchild.
        let mut story = Story::new(42);
        for record in [
            Discovery::new(vec![0], "Start"),
            Discovery::new(vec![0, 0], "Left"),
            Discovery::new(vec![0, 1], "Right"),
            Discovery::new(vec![0, 1, 2], "Right then third"),
            Discovery::new(vec![2], "Other beginning"),
        ] {
            story.merge_discovery(&record).unwrap();
        }
        story
    }

    #[test]
    fn choice_path_round_trips_discovery_path() {
        let story = sample_story();
        let grandchild = story
            .root_slot(0)
            .and_then(|root| story.nodes.get(root).unwrap().child(1))
            .and_then(|right| story.nodes.get(right).unwrap().child(2))
            .unwrap();
        assert_eq!(story.choice_path(grandchild).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn choice_path_for_deep_node_under_late_root_slot() {
        let mut story = Story::new(9);
        for record in [
            Discovery::new(vec![2], "Root at slot two"),
            Discovery::new(vec![2, 0], "First choice"),
            Discovery::new(vec![2, 0, 1], "Second choice"),
        ] {
            story.merge_discovery(&record).unwrap();
        }
        let leaf = story
            .root_slot(2)
            .and_then(|r| story.nodes.get(r).unwrap().child(0))
            .and_then(|c| story.nodes.get(c).unwrap().child(1))
            .unwrap();
        assert_eq!(story.choice_path(leaf).unwrap(), vec![2, 0, 1]);
    }

    #[test]
    fn used_root_slots_ignores_gaps() {
        let story = sample_story();
        assert_eq!(story.root_slots.len(), 3);
        assert_eq!(story.used_root_slot_count(), 2);
        let roots: Vec<_> = story.root_chapters().map(|(slot, _)| slot).collect();
        assert_eq!(roots, vec![0, 2]);
    }

    #[test]
    fn subtree_visits_every_descendant_once() {
        let story = sample_story();
        let root = story.root_slot(0).unwrap();
        let subtree = story.subtree_nodes(root).unwrap();
        assert_eq!(subtree.len(), 4);
        assert_eq!(story.subtree_size(root).unwrap(), 4);
        let mut deduped = subtree.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), subtree.len());

        // The other root is its own single-node subtree.
        let other = story.root_slot(2).unwrap();
        assert_eq!(story.subtree_size(other).unwrap(), 1);
    }

    #[test]
    fn choice_label_falls_back_to_child_title() {
        let mut story = sample_story();
        let root = story.root_slot(0).unwrap();
        assert_eq!(story.choice_label(root, 0).unwrap(), "Left");

        story
            .nodes
            .get_mut(root)
            .unwrap()
            .choice_labels
            .insert(0, "Take the left tunnel".to_string());
        assert_eq!(
            story.choice_label(root, 0).unwrap(),
            "Take the left tunnel"
        );
        assert_eq!(story.choice_label(root, 5), None);
    }
}
