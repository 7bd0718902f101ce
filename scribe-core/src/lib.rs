//! # scribe-core: document model for collaborative notes
//!
//! Holds the pieces every participant agrees on:
//!
//! - [`Block`]: the editor's native node representation
//! - [`Selection`] / [`TextPoint`]: logical positions inside the block list
//! - [`markdown`]: markdown-like text ⇄ blocks
//! - [`collab`]: the yrs-backed [`SharedDocument`] all participants merge into

use serde::{Deserialize, Serialize};

pub mod collab;
pub mod markdown;

pub use collab::{CollabError, SharedDocument, ROOT_KEY};

/// One top-level node of a note.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Heading { level: u8, text: String },
    Paragraph { text: String },
    BulletItem { text: String },
    NumberedItem { text: String },
    Quote { text: String },
    Code { language: Option<String>, text: String },
    Divider,
}

impl Block {
    pub fn heading(level: u8, text: impl Into<String>) -> Self {
        Block::Heading {
            level: level.clamp(1, 6),
            text: text.into(),
        }
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        Block::Paragraph { text: text.into() }
    }

    /// Plain text carried by the block (empty for dividers).
    pub fn text(&self) -> &str {
        match self {
            Block::Heading { text, .. }
            | Block::Paragraph { text }
            | Block::BulletItem { text }
            | Block::NumberedItem { text }
            | Block::Quote { text }
            | Block::Code { text, .. } => text,
            Block::Divider => "",
        }
    }

    /// Length of the text in characters, the unit of [`TextPoint::offset`].
    pub fn char_len(&self) -> u32 {
        self.text().chars().count() as u32
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Block::Heading { .. } => "heading",
            Block::Paragraph { .. } => "paragraph",
            Block::BulletItem { .. } => "bullet_item",
            Block::NumberedItem { .. } => "numbered_item",
            Block::Quote { .. } => "quote",
            Block::Code { .. } => "code",
            Block::Divider => "divider",
        }
    }
}

/// A position inside the block list: block index + character offset.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TextPoint {
    pub block: u32,
    pub offset: u32,
}

impl TextPoint {
    pub fn new(block: u32, offset: u32) -> Self {
        Self { block, offset }
    }
}

/// A selection in editor coordinates. `focus` is where the caret sits.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Selection {
    pub anchor: TextPoint,
    pub focus: TextPoint,
}

impl Selection {
    pub fn new(anchor: TextPoint, focus: TextPoint) -> Self {
        Self { anchor, focus }
    }

    /// Collapsed selection at a single point.
    pub fn caret(point: TextPoint) -> Self {
        Self {
            anchor: point,
            focus: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }

    /// Document-ordered (start, end) pair.
    pub fn ordered(&self) -> (TextPoint, TextPoint) {
        if self.anchor <= self.focus {
            (self.anchor, self.focus)
        } else {
            (self.focus, self.anchor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_text_and_kind() {
        let block = Block::heading(2, "Title");
        assert_eq!(block.text(), "Title");
        assert_eq!(block.kind(), "heading");
        assert_eq!(Block::Divider.text(), "");
    }

    #[test]
    fn test_heading_level_clamped() {
        match Block::heading(9, "x") {
            Block::Heading { level, .. } => assert_eq!(level, 6),
            _ => panic!("Wrong block type"),
        }
    }

    #[test]
    fn test_char_len_counts_chars() {
        assert_eq!(Block::paragraph("héllo").char_len(), 5);
    }

    #[test]
    fn test_block_json_shape() {
        let json = serde_json::to_string(&Block::paragraph("hi")).unwrap();
        assert_eq!(json, r#"{"type":"paragraph","text":"hi"}"#);
    }

    #[test]
    fn test_selection_ordering() {
        let sel = Selection::new(TextPoint::new(2, 1), TextPoint::new(0, 4));
        assert!(!sel.is_collapsed());
        assert_eq!(sel.ordered(), (TextPoint::new(0, 4), TextPoint::new(2, 1)));
        assert!(Selection::caret(TextPoint::new(1, 1)).is_collapsed());
    }
}
