//! Story persistence: the compact binary save format plus a JSON export.
//!
//! The binary layout is little-endian throughout, with no magic header:
//!
//! ```text
//! u32  item_id
//! str  title, owner, description, info_text    // str = u32 byte length + UTF-8
//! u8   root_slot_count
//!      root_slot_count x u16 root slot         // 0xFFFF = unused slot
//! u16  node_count
//!      node_count x chapter:
//!        str title, author
//!        u8  choice number                     // 0xFF = unset
//!        u16 parent index                      // 0xFFFF = none
//!        str text
//!        u8  child_count, child_count x u16    // 0xFFFF = unused slot
//!        u8  label_count, label_count x (u8 slot, str label)
//! ```
//!
//! Decoding is strict: short reads, invalid UTF-8, indices at or past the
//! declared node count, and trailing bytes all reject the whole buffer as
//! corrupt. `decode(encode(story))` is equal to `story` for every story the
//! builder can produce.

use std::path::Path;

use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::chapter::{Chapter, NodeIndex};
use crate::story::Story;

/// On-disk "absent" marker for u16 index fields.
const INDEX_SENTINEL: u16 = 0xFFFF;

/// On-disk "unset" marker for the choice-number byte.
const CHOICE_SENTINEL: u8 = 0xFF;

/// Errors from encoding or decoding a story.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("corrupt story data: {0}")]
    Corrupt(String),

    #[error("story does not fit the save format: {0}")]
    TooLarge(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a story into the binary save format.
pub fn encode(story: &Story) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    out.extend_from_slice(&story.item_id.to_le_bytes());
    put_string(&mut out, &story.title);
    put_string(&mut out, &story.owner);
    put_string(&mut out, &story.description);
    put_string(&mut out, &story.info_text);

    let root_count = small_count(story.root_slots.len(), "root slots")?;
    out.push(root_count);
    for slot in &story.root_slots {
        out.extend_from_slice(&encode_index(*slot).to_le_bytes());
    }

    let node_count = u16::try_from(story.nodes.len())
        .map_err(|_| CodecError::TooLarge(format!("{} chapters", story.nodes.len())))?;
    out.extend_from_slice(&node_count.to_le_bytes());
    for (_, chapter) in story.nodes.iter() {
        put_chapter(&mut out, chapter)?;
    }
    Ok(out)
}

/// Decode a story from the binary save format.
pub fn decode(bytes: &[u8]) -> Result<Story, CodecError> {
    let mut reader = Reader::new(bytes);

    let mut story = Story::new(reader.u32()?);
    story.title = reader.string()?;
    story.owner = reader.string()?;
    story.description = reader.string()?;
    story.info_text = reader.string()?;

    let root_count = reader.u8()? as usize;
    let mut raw_root_slots = Vec::with_capacity(root_count);
    for _ in 0..root_count {
        raw_root_slots.push(reader.u16()?);
    }

    let node_count = reader.u16()? as usize;
    let mut raw_chapters = Vec::with_capacity(node_count);
    for _ in 0..node_count {
        raw_chapters.push(read_chapter(&mut reader)?);
    }
    reader.finish()?;

    // Index validation needs the declared node count, so it runs after the
    // whole buffer has been read.
    story.root_slots = raw_root_slots
        .into_iter()
        .map(|raw| decode_index(raw, node_count, "root slot"))
        .collect::<Result<_, _>>()?;
    for raw in raw_chapters {
        let chapter = raw.validate(node_count)?;
        story
            .nodes
            .push(chapter)
            .map_err(|e| CodecError::Corrupt(e.to_string()))?;
    }
    Ok(story)
}

/// Write a story to a file in the binary save format.
pub async fn save_story(story: &Story, path: impl AsRef<Path>) -> Result<(), CodecError> {
    let bytes = encode(story)?;
    fs::write(path, bytes).await?;
    Ok(())
}

/// Read a story back from a binary save file.
pub async fn load_story(path: impl AsRef<Path>) -> Result<Story, CodecError> {
    let bytes = fs::read(path).await?;
    decode(&bytes)
}

/// Write a human-readable JSON dump of a story.
///
/// The binary format is the canonical one; the JSON export exists for
/// inspection and diffing, not for loading back.
pub async fn export_json(story: &Story, path: impl AsRef<Path>) -> Result<(), CodecError> {
    let content = serde_json::to_string_pretty(story)?;
    fs::write(path, content).await?;
    Ok(())
}

fn small_count(len: usize, what: &str) -> Result<u8, CodecError> {
    u8::try_from(len).map_err(|_| CodecError::TooLarge(format!("{len} {what}")))
}

fn encode_index(index: Option<NodeIndex>) -> u16 {
    index.map(|i| i.0).unwrap_or(INDEX_SENTINEL)
}

fn decode_index(
    raw: u16,
    node_count: usize,
    what: &str,
) -> Result<Option<NodeIndex>, CodecError> {
    if raw == INDEX_SENTINEL {
        return Ok(None);
    }
    if raw as usize >= node_count {
        debug!(raw, node_count, what, "rejecting out-of-range index");
        return Err(CodecError::Corrupt(format!(
            "{what} index {raw} out of range for {node_count} chapters"
        )));
    }
    Ok(Some(NodeIndex(raw)))
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_chapter(out: &mut Vec<u8>, chapter: &Chapter) -> Result<(), CodecError> {
    put_string(out, &chapter.title);
    put_string(out, &chapter.author);
    out.push(chapter.choice_number.unwrap_or(CHOICE_SENTINEL));
    out.extend_from_slice(&encode_index(chapter.parent).to_le_bytes());
    put_string(out, &chapter.text);

    let child_count = small_count(chapter.children.len(), "children")?;
    out.push(child_count);
    for child in &chapter.children {
        out.extend_from_slice(&encode_index(*child).to_le_bytes());
    }

    let label_count = small_count(chapter.choice_labels.len(), "choice labels")?;
    out.push(label_count);
    for (slot, label) in &chapter.choice_labels {
        out.push(*slot);
        put_string(out, label);
    }
    Ok(())
}

/// A chapter as read off the wire, before index validation.
struct RawChapter {
    chapter: Chapter,
    parent: u16,
    children: Vec<u16>,
}

impl RawChapter {
    fn validate(self, node_count: usize) -> Result<Chapter, CodecError> {
        let mut chapter = self.chapter;
        chapter.parent = decode_index(self.parent, node_count, "parent")?;
        chapter.children = self
            .children
            .into_iter()
            .map(|raw| decode_index(raw, node_count, "child"))
            .collect::<Result<_, _>>()?;
        Ok(chapter)
    }
}

fn read_chapter(reader: &mut Reader<'_>) -> Result<RawChapter, CodecError> {
    let mut chapter = Chapter {
        title: reader.string()?,
        author: reader.string()?,
        ..Chapter::default()
    };
    let choice = reader.u8()?;
    chapter.choice_number = (choice != CHOICE_SENTINEL).then_some(choice);
    let parent = reader.u16()?;
    chapter.text = reader.string()?;

    let child_count = reader.u8()? as usize;
    let mut children = Vec::with_capacity(child_count);
    for _ in 0..child_count {
        children.push(reader.u16()?);
    }

    let label_count = reader.u8()? as usize;
    for _ in 0..label_count {
        let slot = reader.u8()?;
        let label = reader.string()?;
        chapter.choice_labels.insert(slot, label);
    }

    Ok(RawChapter {
        chapter,
        parent,
        children,
    })
}

/// Bounds-checked little-endian reader over a byte buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                CodecError::Corrupt(format!(
                    "truncated: need {len} bytes at offset {}, have {}",
                    self.pos,
                    self.buf.len().saturating_sub(self.pos)
                ))
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::Corrupt("string is not valid UTF-8".to_string()))
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.pos != self.buf.len() {
            return Err(CodecError::Corrupt(format!(
                "{} trailing bytes after story data",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Discovery;

    fn downloaded_story() -> Story {
        let mut story = Story::new(987_654);
        story.title = "The Endless Cave".to_string();
        story.owner = "cavewriter".to_string();
        story.description = "A spelunking adventure".to_string();
        story.info_text = "Bring a lamp.".to_string();
        for record in [
            Discovery::new(vec![0], "Start"),
            Discovery::new(vec![0, 0], "Left"),
            Discovery::new(vec![0, 3], "Far right"),
            Discovery::new(vec![2], "Other opening"),
        ] {
            story.merge_discovery(&record).unwrap();
        }
        let root = story.root_slot(0).unwrap();
        let root_node = story.nodes.get_mut(root).unwrap();
        root_node.author = "alice".to_string();
        root_node.text = "You stand at the mouth of the cave.".to_string();
        root_node
            .choice_labels
            .insert(0, "Take the left tunnel".to_string());
        story
    }

    #[test]
    fn round_trips_full_story() {
        let story = downloaded_story();
        let bytes = encode(&story).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, story);
    }

    #[test]
    fn round_trips_empty_story() {
        let story = Story::new(1);
        let decoded = decode(&encode(&story).unwrap()).unwrap();
        assert_eq!(decoded, story);
    }

    #[test]
    fn preserves_sparse_children_and_root_slots() {
        let story = downloaded_story();
        let decoded = decode(&encode(&story).unwrap()).unwrap();

        let root = decoded.root_slot(0).unwrap();
        let children = &decoded.nodes.get(root).unwrap().children;
        assert_eq!(children.len(), 4);
        assert!(children[0].is_some());
        assert_eq!(children[1], None);
        assert_eq!(children[2], None);
        assert!(children[3].is_some());

        assert_eq!(decoded.root_slots.len(), 3);
        assert_eq!(decoded.root_slots[1], None);
    }

    #[test]
    fn rejects_truncated_buffers() {
        let bytes = encode(&downloaded_story()).unwrap();
        for len in [0, 3, 10, bytes.len() - 1] {
            let err = decode(&bytes[..len]).unwrap_err();
            assert!(matches!(err, CodecError::Corrupt(_)), "len {len}: {err}");
        }
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = encode(&downloaded_story()).unwrap();
        bytes.push(0);
        assert!(matches!(decode(&bytes).unwrap_err(), CodecError::Corrupt(_)));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let story = downloaded_story();
        let bytes = encode(&story).unwrap();
        // Corrupt the first root slot to point past the node count.
        let meta_len = 4
            + (4 + story.title.len())
            + (4 + story.owner.len())
            + (4 + story.description.len())
            + (4 + story.info_text.len());
        let slot_offset = meta_len + 1;
        let mut corrupted = bytes.clone();
        corrupted[slot_offset..slot_offset + 2].copy_from_slice(&9999u16.to_le_bytes());
        assert!(matches!(
            decode(&corrupted).unwrap_err(),
            CodecError::Corrupt(_)
        ));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        // title: length 2, invalid UTF-8 bytes
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Corrupt(_)));
    }

    #[test]
    fn sentinel_round_trip_for_absent_links() {
        let mut story = Story::new(5);
        story.merge_discovery(&Discovery::new(vec![1], "Lone root")).unwrap();
        let bytes = encode(&story).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.root_slots[0], None);
        let root = decoded.root_slot(1).unwrap();
        assert_eq!(decoded.nodes.get(root).unwrap().parent, None);
    }

    #[tokio::test]
    async fn save_and_load_file_round_trip() {
        let story = downloaded_story();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cave.story");
        save_story(&story, &path).await.unwrap();
        let loaded = load_story(&path).await.unwrap();
        assert_eq!(loaded, story);
    }

    #[tokio::test]
    async fn export_json_writes_readable_dump() {
        let story = downloaded_story();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cave.json");
        export_json(&story, &path).await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("The Endless Cave"));
        assert!(content.contains("item_id"));
    }
}
