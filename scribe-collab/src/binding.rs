//! Editor binding: the editor's block model backed by the room's
//! [`SharedDocument`].
//!
//! Local edits become CRDT mutations whose updates are queued for
//! broadcast; remote merges show up through [`EditorBinding::changes`]
//! and the next [`EditorBinding::children`] call re-reads the document.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use scribe_core::{markdown, Block, CollabError, Selection};

use crate::provider::RoomHandle;

/// Codec between the editor's text form and its native nodes.
pub trait EditorEngine: Send + Sync + 'static {
    fn deserialize(&self, source: &str) -> Vec<Block>;
    fn serialize(&self, blocks: &[Block]) -> String;
}

/// Markdown-like source ⇄ blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownEngine;

impl EditorEngine for MarkdownEngine {
    fn deserialize(&self, source: &str) -> Vec<Block> {
        markdown::parse(source)
    }

    fn serialize(&self, blocks: &[Block]) -> String {
        markdown::serialize(blocks)
    }
}

/// An edit made in the local editor.
///
/// Typing maps to `InsertText` / `DeleteText` so concurrent keystrokes in
/// the same block merge; `ReplaceBlock` diffs the block's text against the
/// document before writing. Offsets count characters.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorOp {
    InsertBlocks { index: u32, blocks: Vec<Block> },
    ReplaceBlock { index: u32, block: Block },
    RemoveBlocks { index: u32, count: u32 },
    InsertText { index: u32, offset: u32, text: String },
    DeleteText { index: u32, offset: u32, count: u32 },
    /// Replace everything with parsed source text.
    SetContent(String),
}

pub struct EditorBinding<E: EditorEngine> {
    handle: RoomHandle,
    engine: Arc<E>,
    // (document revision, blocks at that revision)
    cache: Mutex<Option<(u64, Arc<Vec<Block>>)>>,
}

impl<E: EditorEngine> EditorBinding<E> {
    pub fn attach(handle: RoomHandle, engine: Arc<E>) -> Self {
        log::debug!("Editor attached to room {}", handle.room());
        Self {
            handle,
            engine,
            cache: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> &RoomHandle {
        &self.handle
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Current top-level nodes, re-read only when the document changed.
    pub fn children(&self) -> Arc<Vec<Block>> {
        let revision = self.handle.document().revision();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.as_ref() {
            Some((cached, blocks)) if *cached == revision => blocks.clone(),
            _ => {
                let blocks = Arc::new(self.handle.document().blocks());
                *cache = Some((revision, blocks.clone()));
                blocks
            }
        }
    }

    /// Apply a local edit and queue its update for the room.
    pub fn apply(&self, op: EditorOp) -> Result<(), CollabError> {
        let document = self.handle.document();
        let update = match op {
            EditorOp::InsertBlocks { index, blocks } => document.insert_blocks(index, &blocks)?,
            EditorOp::ReplaceBlock { index, block } => document.replace_block(index, &block)?,
            EditorOp::RemoveBlocks { index, count } => document.remove_blocks(index, count)?,
            EditorOp::InsertText {
                index,
                offset,
                text,
            } => document.insert_text(index, offset, &text)?,
            EditorOp::DeleteText {
                index,
                offset,
                count,
            } => document.delete_text(index, offset, count)?,
            EditorOp::SetContent(source) => {
                document.set_blocks(&self.engine.deserialize(&source))?
            }
        };
        self.handle.submit_update(update);
        Ok(())
    }

    pub fn set_selection(&self, selection: Option<Selection>) {
        self.handle.publish_selection(selection);
    }

    pub fn selection(&self) -> Option<Selection> {
        self.handle.awareness().local().selection
    }

    /// Bumps whenever the content changes, locally or remotely.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.handle.changes()
    }

    /// Export the current content as text.
    pub fn markdown(&self) -> String {
        self.engine.serialize(&self.children())
    }
}
