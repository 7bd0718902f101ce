use std::sync::atomic::{AtomicU64, Ordering};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, OffsetKind, Options, Out,
    ReadTxn, StateVector, Text, TextPrelim, TextRef, Transact, TransactionMut, Update,
};

use crate::Block;

/// Root key of the block array.
///
/// The suffix is a compatibility boundary: bumping it yields a logically
/// distinct document even inside the same room.
pub const ROOT_KEY: &str = "scribe.blocks.v2";

// Per-block map keys
const KIND: &str = "kind";
const LEVEL: &str = "level";
const LANGUAGE: &str = "language";
const TEXT: &str = "text";

// Custom error type for collaboration operations
#[derive(Debug, Clone)]
pub enum CollabError {
    YrsError(String),
    InvalidOperation(String),
}

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CollabError::YrsError(e.to_string())
    }
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::YrsError(e) => write!(f, "CRDT error: {e}"),
            Self::InvalidOperation(e) => write!(f, "Invalid operation: {e}"),
        }
    }
}

impl std::error::Error for CollabError {}

/// The CRDT document every participant of a room merges into.
///
/// Blocks live in a yrs array under [`ROOT_KEY`]. Each element is a map
/// holding the block kind, its attributes (`level`, `language`) and a
/// shared text, so concurrent typing inside one block merges character by
/// character. Offsets in the public API count characters.
///
/// Every local mutation returns the encoded update so the caller can
/// broadcast it; remote updates come back in through [`apply_update`].
///
/// [`apply_update`]: SharedDocument::apply_update
pub struct SharedDocument {
    doc: Doc,
    root_key: String,
    // Bumped on every local or remote change
    revision: AtomicU64,
}

impl SharedDocument {
    pub fn new() -> Self {
        Self::with_root_key(ROOT_KEY)
    }

    pub fn with_root_key(root_key: impl Into<String>) -> Self {
        let root_key = root_key.into();
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        });
        doc.get_or_insert_array(root_key.as_str());
        Self {
            doc,
            root_key,
            revision: AtomicU64::new(0),
        }
    }

    pub fn root_key(&self) -> &str {
        &self.root_key
    }

    /// Monotonic change counter, used by views to detect staleness.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Number of top-level blocks.
    pub fn len(&self) -> u32 {
        let array = self.array();
        let txn = self.doc.transact();
        array.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current block list. Elements that do not decode are skipped.
    pub fn blocks(&self) -> Vec<Block> {
        let array = self.array();
        let txn = self.doc.transact();
        array
            .iter(&txn)
            .filter_map(|value| match value {
                Out::YMap(map) => {
                    let block = read_block(&txn, &map);
                    if block.is_none() {
                        log::warn!("Skipping undecodable block in {}", self.root_key);
                    }
                    block
                }
                other => {
                    log::warn!("Skipping foreign element in {}: {other:?}", self.root_key);
                    None
                }
            })
            .collect()
    }

    /// Insert blocks starting at `index` and return the update to broadcast.
    pub fn insert_blocks(&self, index: u32, blocks: &[Block]) -> Result<Vec<u8>, CollabError> {
        let array = self.array();
        let update = {
            let mut txn = self.doc.transact_mut();
            let len = array.len(&txn);
            if index > len {
                return Err(CollabError::InvalidOperation(format!(
                    "insert at {index} past end ({len})"
                )));
            }
            for (at, block) in (index..).zip(blocks) {
                insert_block(&array, &mut txn, at, block);
            }
            txn.encode_update_v1()
        };
        self.bump();
        Ok(update)
    }

    /// Replace the block at `index` in place.
    ///
    /// Attributes that differ are overwritten and the text is spliced, so
    /// only the changed characters conflict with concurrent edits.
    pub fn replace_block(&self, index: u32, block: &Block) -> Result<Vec<u8>, CollabError> {
        let array = self.array();
        let update = {
            let mut txn = self.doc.transact_mut();
            let len = array.len(&txn);
            if index >= len {
                return Err(CollabError::InvalidOperation(format!(
                    "replace at {index} out of bounds ({len})"
                )));
            }
            match array.get(&txn, index) {
                Some(Out::YMap(map)) => {
                    write_attributes(&map, &mut txn, block);
                    match map.get(&txn, TEXT) {
                        Some(Out::YText(text)) => splice_text(&text, &mut txn, block.text()),
                        _ => {
                            map.insert(&mut txn, TEXT, TextPrelim::new(block.text()));
                        }
                    }
                }
                _ => {
                    array.remove(&mut txn, index);
                    insert_block(&array, &mut txn, index, block);
                }
            }
            txn.encode_update_v1()
        };
        self.bump();
        Ok(update)
    }

    /// Insert `chunk` into block `index` at character `offset`.
    pub fn insert_text(
        &self,
        index: u32,
        offset: u32,
        chunk: &str,
    ) -> Result<Vec<u8>, CollabError> {
        let array = self.array();
        let update = {
            let mut txn = self.doc.transact_mut();
            let text = text_at(&txn, &array, index)?;
            let current = text.get_string(&txn);
            let at = byte_offset(&current, offset).ok_or_else(|| {
                CollabError::InvalidOperation(format!("offset {offset} past end of block {index}"))
            })?;
            text.insert(&mut txn, at, chunk);
            txn.encode_update_v1()
        };
        self.bump();
        Ok(update)
    }

    /// Delete `count` characters of block `index` starting at `offset`.
    pub fn delete_text(
        &self,
        index: u32,
        offset: u32,
        count: u32,
    ) -> Result<Vec<u8>, CollabError> {
        let array = self.array();
        let update = {
            let mut txn = self.doc.transact_mut();
            let text = text_at(&txn, &array, index)?;
            let current = text.get_string(&txn);
            let range = byte_offset(&current, offset)
                .zip(byte_offset(&current, offset.saturating_add(count)));
            let Some((start, end)) = range else {
                return Err(CollabError::InvalidOperation(format!(
                    "delete {count} at {offset} out of bounds in block {index}"
                )));
            };
            if end > start {
                text.remove_range(&mut txn, start, end - start);
            }
            txn.encode_update_v1()
        };
        self.bump();
        Ok(update)
    }

    /// Remove `count` blocks starting at `index`.
    pub fn remove_blocks(&self, index: u32, count: u32) -> Result<Vec<u8>, CollabError> {
        let array = self.array();
        let update = {
            let mut txn = self.doc.transact_mut();
            let len = array.len(&txn);
            if index.saturating_add(count) > len {
                return Err(CollabError::InvalidOperation(format!(
                    "remove {count} at {index} out of bounds ({len})"
                )));
            }
            array.remove_range(&mut txn, index, count);
            txn.encode_update_v1()
        };
        self.bump();
        Ok(update)
    }

    /// Replace the whole block list in a single transaction.
    pub fn set_blocks(&self, blocks: &[Block]) -> Result<Vec<u8>, CollabError> {
        let array = self.array();
        let update = {
            let mut txn = self.doc.transact_mut();
            let len = array.len(&txn);
            if len > 0 {
                array.remove_range(&mut txn, 0, len);
            }
            for (at, block) in (0..).zip(blocks) {
                insert_block(&array, &mut txn, at, block);
            }
            txn.encode_update_v1()
        };
        self.bump();
        Ok(update)
    }

    /// Merge an update produced by any participant. Idempotent.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), CollabError> {
        let update = Update::decode_v1(update)?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| CollabError::YrsError(e.to_string()))?;
        }
        self.bump();
        Ok(())
    }

    /// Encoded state vector, the first step of the sync handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this document has that the peer with `remote_sv` lacks.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, CollabError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    // Looked up per call; the struct keeps no type reference.
    fn array(&self) -> ArrayRef {
        self.doc.get_or_insert_array(self.root_key.as_str())
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("root_key", &self.root_key)
            .field("revision", &self.revision())
            .finish()
    }
}

fn insert_block(array: &ArrayRef, txn: &mut TransactionMut, index: u32, block: &Block) {
    let map = array.insert(txn, index, MapPrelim::default());
    write_attributes(&map, txn, block);
    map.insert(txn, TEXT, TextPrelim::new(block.text()));
}

/// Bring `kind`, `level` and `language` in line with `block`, touching only
/// the keys whose value changes.
fn write_attributes(map: &MapRef, txn: &mut TransactionMut, block: &Block) {
    let kind = block.kind();
    if !matches!(map.get(&*txn, KIND), Some(Out::Any(Any::String(current))) if &*current == kind) {
        map.insert(txn, KIND, kind);
    }

    let level = match block {
        Block::Heading { level, .. } => Some(f64::from(*level)),
        _ => None,
    };
    match (level, map.get(&*txn, LEVEL)) {
        (Some(level), Some(Out::Any(Any::Number(current)))) if current == level => {}
        (Some(level), _) => {
            map.insert(txn, LEVEL, level);
        }
        (None, Some(_)) => {
            map.remove(txn, LEVEL);
        }
        (None, None) => {}
    }

    let language = match block {
        Block::Code { language, .. } => language.as_deref(),
        _ => None,
    };
    match (language, map.get(&*txn, LANGUAGE)) {
        (Some(language), Some(Out::Any(Any::String(current)))) if &*current == language => {}
        (Some(language), _) => {
            map.insert(txn, LANGUAGE, language);
        }
        (None, Some(_)) => {
            map.remove(txn, LANGUAGE);
        }
        (None, None) => {}
    }
}

fn read_block<T: ReadTxn>(txn: &T, map: &MapRef) -> Option<Block> {
    let kind = match map.get(txn, KIND) {
        Some(Out::Any(Any::String(kind))) => kind,
        _ => return None,
    };
    let text = match map.get(txn, TEXT) {
        Some(Out::YText(text)) => text.get_string(txn),
        _ => String::new(),
    };
    let block = match &*kind {
        "heading" => {
            let level = match map.get(txn, LEVEL) {
                Some(Out::Any(Any::Number(level))) => level as u8,
                _ => 1,
            };
            Block::heading(level, text)
        }
        "paragraph" => Block::Paragraph { text },
        "bullet_item" => Block::BulletItem { text },
        "numbered_item" => Block::NumberedItem { text },
        "quote" => Block::Quote { text },
        "code" => {
            let language = match map.get(txn, LANGUAGE) {
                Some(Out::Any(Any::String(language))) => Some(language.to_string()),
                _ => None,
            };
            Block::Code { language, text }
        }
        "divider" => Block::Divider,
        _ => return None,
    };
    Some(block)
}

/// Shared text of a text-carrying block.
fn text_at<T: ReadTxn>(txn: &T, array: &ArrayRef, index: u32) -> Result<TextRef, CollabError> {
    let Some(Out::YMap(map)) = array.get(txn, index) else {
        return Err(CollabError::InvalidOperation(format!(
            "no block at {index} ({} blocks)",
            array.len(txn)
        )));
    };
    let is_divider =
        matches!(map.get(txn, KIND), Some(Out::Any(Any::String(kind))) if &*kind == "divider");
    match map.get(txn, TEXT) {
        Some(Out::YText(text)) if !is_divider => Ok(text),
        _ => Err(CollabError::InvalidOperation(format!(
            "block {index} carries no text"
        ))),
    }
}

/// Rewrite `text` into `target` by deleting and inserting only the middle
/// that differs.
fn splice_text(text: &TextRef, txn: &mut TransactionMut, target: &str) {
    let current = text.get_string(&*txn);
    if current == target {
        return;
    }
    let prefix = common_prefix(&current, target);
    let suffix = common_suffix(&current[prefix..], &target[prefix..]);
    let removed = current.len() - prefix - suffix;
    if removed > 0 {
        text.remove_range(txn, prefix as u32, removed as u32);
    }
    let inserted = &target[prefix..target.len() - suffix];
    if !inserted.is_empty() {
        text.insert(txn, prefix as u32, inserted);
    }
}

/// Byte length of the longest common prefix, on a char boundary.
fn common_prefix(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .take_while(|((_, x), y)| x == y)
        .last()
        .map_or(0, |((at, c), _)| at + c.len_utf8())
}

/// Byte length of the longest common suffix, on a char boundary.
fn common_suffix(a: &str, b: &str) -> usize {
    a.chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(x, y)| x == y)
        .map(|(c, _)| c.len_utf8())
        .sum()
}

/// Byte position of character `chars`; the end of the text counts.
fn byte_offset(text: &str, chars: u32) -> Option<u32> {
    let chars = chars as usize;
    text.char_indices()
        .map(|(at, _)| at)
        .chain(std::iter::once(text.len()))
        .nth(chars)
        .map(|at| at as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_both(a: &SharedDocument, b: &SharedDocument) {
        let to_b = a.encode_diff(&b.state_vector()).unwrap();
        let to_a = b.encode_diff(&a.state_vector()).unwrap();
        b.apply_update(&to_b).unwrap();
        a.apply_update(&to_a).unwrap();
    }

    #[test]
    fn test_new_document_is_empty() {
        let doc = SharedDocument::new();
        assert!(doc.is_empty());
        assert_eq!(doc.root_key(), ROOT_KEY);
        assert!(doc.blocks().is_empty());
    }

    #[test]
    fn test_insert_generates_delta() {
        let doc = SharedDocument::new();
        let delta = doc
            .insert_blocks(0, &[Block::heading(1, "Hello")])
            .expect("Failed to insert");
        assert!(!delta.is_empty());
        assert_eq!(doc.len(), 1);
        assert_eq!(doc.blocks(), vec![Block::heading(1, "Hello")]);
    }

    #[test]
    fn test_insert_past_end_rejected() {
        let doc = SharedDocument::new();
        assert!(doc.insert_blocks(3, &[Block::Divider]).is_err());
        assert!(doc.remove_blocks(0, 1).is_err());
        assert!(doc.replace_block(0, &Block::Divider).is_err());
    }

    #[test]
    fn test_replace_and_remove() {
        let doc = SharedDocument::new();
        doc.insert_blocks(0, &[Block::paragraph("a"), Block::paragraph("b")])
            .unwrap();
        doc.replace_block(1, &Block::paragraph("B")).unwrap();
        assert_eq!(doc.blocks(), vec![Block::paragraph("a"), Block::paragraph("B")]);
        doc.remove_blocks(0, 1).unwrap();
        assert_eq!(doc.blocks(), vec![Block::paragraph("B")]);
    }

    #[test]
    fn test_set_blocks_replaces_everything() {
        let doc = SharedDocument::new();
        doc.insert_blocks(0, &[Block::paragraph("old")]).unwrap();
        doc.set_blocks(&[Block::Divider, Block::paragraph("new")]).unwrap();
        assert_eq!(doc.blocks(), vec![Block::Divider, Block::paragraph("new")]);
    }

    #[test]
    fn test_revision_bumps() {
        let doc = SharedDocument::new();
        let before = doc.revision();
        doc.insert_blocks(0, &[Block::Divider]).unwrap();
        assert!(doc.revision() > before);
    }

    #[test]
    fn test_apply_remote_update_convergence() {
        let doc1 = SharedDocument::new();
        let doc2 = SharedDocument::new();

        let delta = doc1.insert_blocks(0, &[Block::paragraph("from one")]).unwrap();
        doc2.apply_update(&delta).unwrap();

        assert_eq!(doc2.blocks(), vec![Block::paragraph("from one")]);
    }

    #[test]
    fn test_concurrent_inserts_coexist_and_converge() {
        let doc1 = SharedDocument::new();
        let doc2 = SharedDocument::new();
        doc1.insert_blocks(0, &[Block::heading(1, "Hello")]).unwrap();
        doc2.insert_blocks(0, &[Block::heading(1, "Hello")]).unwrap();

        sync_both(&doc1, &doc2);

        assert_eq!(doc1.len(), 2);
        assert_eq!(doc1.blocks(), doc2.blocks());
    }

    #[test]
    fn test_apply_order_does_not_matter() {
        let origin = SharedDocument::new();
        let u1 = origin.insert_blocks(0, &[Block::paragraph("x")]).unwrap();
        let u2 = origin.insert_blocks(1, &[Block::paragraph("y")]).unwrap();

        let forward = SharedDocument::new();
        forward.apply_update(&u1).unwrap();
        forward.apply_update(&u2).unwrap();

        let backward = SharedDocument::new();
        backward.apply_update(&u2).unwrap();
        backward.apply_update(&u1).unwrap();

        assert_eq!(forward.blocks(), backward.blocks());
        assert_eq!(forward.blocks(), origin.blocks());
    }

    #[test]
    fn test_apply_update_is_idempotent() {
        let doc1 = SharedDocument::new();
        let doc2 = SharedDocument::new();
        let delta = doc1.insert_blocks(0, &[Block::Divider]).unwrap();
        doc2.apply_update(&delta).unwrap();
        doc2.apply_update(&delta).unwrap();
        assert_eq!(doc2.len(), 1);
    }

    #[test]
    fn test_root_key_is_compatibility_boundary() {
        let current = SharedDocument::new();
        let legacy = SharedDocument::with_root_key("scribe.blocks.v1");
        let delta = current.insert_blocks(0, &[Block::paragraph("v2 only")]).unwrap();
        legacy.apply_update(&delta).unwrap();
        assert!(legacy.is_empty());
    }

    #[test]
    fn test_full_state_bootstraps_new_peer() {
        let doc1 = SharedDocument::new();
        doc1.insert_blocks(0, &[Block::paragraph("a"), Block::Divider]).unwrap();

        let doc2 = SharedDocument::new();
        doc2.apply_update(&doc1.encode_state()).unwrap();
        assert_eq!(doc2.blocks(), doc1.blocks());
    }

    #[test]
    fn test_blocks_keep_attributes() {
        let doc = SharedDocument::new();
        let blocks = vec![
            Block::heading(3, "Title"),
            Block::Code {
                language: Some("rust".into()),
                text: "fn main() {}".into(),
            },
            Block::Code {
                language: None,
                text: "plain".into(),
            },
            Block::BulletItem { text: "item".into() },
            Block::NumberedItem { text: "first".into() },
            Block::Quote { text: "said".into() },
            Block::Divider,
        ];
        doc.set_blocks(&blocks).unwrap();

        let peer = SharedDocument::new();
        peer.apply_update(&doc.encode_state()).unwrap();
        assert_eq!(peer.blocks(), blocks);
    }

    #[test]
    fn test_concurrent_replace_merges_text() {
        let doc1 = SharedDocument::new();
        let doc2 = SharedDocument::new();
        doc1.insert_blocks(0, &[Block::paragraph("hello world")]).unwrap();
        sync_both(&doc1, &doc2);

        doc1.replace_block(0, &Block::paragraph("hello brave world")).unwrap();
        doc2.replace_block(0, &Block::paragraph("hello world!")).unwrap();
        sync_both(&doc1, &doc2);

        assert_eq!(doc1.blocks(), vec![Block::paragraph("hello brave world!")]);
        assert_eq!(doc1.blocks(), doc2.blocks());
    }

    #[test]
    fn test_replace_changes_kind_in_place() {
        let doc1 = SharedDocument::new();
        let doc2 = SharedDocument::new();
        doc1.insert_blocks(0, &[Block::paragraph("Title")]).unwrap();
        sync_both(&doc1, &doc2);

        doc1.replace_block(0, &Block::heading(2, "Title")).unwrap();
        doc2.insert_text(0, 5, "s").unwrap();
        sync_both(&doc1, &doc2);

        assert_eq!(doc1.len(), 1);
        assert_eq!(doc1.blocks(), vec![Block::heading(2, "Titles")]);
        assert_eq!(doc1.blocks(), doc2.blocks());
    }

    #[test]
    fn test_concurrent_text_inserts_converge() {
        let doc1 = SharedDocument::new();
        let doc2 = SharedDocument::new();
        doc1.insert_blocks(0, &[Block::paragraph("ac")]).unwrap();
        sync_both(&doc1, &doc2);

        doc1.insert_text(0, 1, "b").unwrap();
        doc2.insert_text(0, 2, "d").unwrap();
        sync_both(&doc1, &doc2);

        assert_eq!(doc1.blocks(), vec![Block::paragraph("abcd")]);
        assert_eq!(doc2.blocks(), vec![Block::paragraph("abcd")]);
    }

    #[test]
    fn test_text_offsets_count_characters() {
        let doc = SharedDocument::new();
        doc.insert_blocks(0, &[Block::paragraph("héllo wörld")]).unwrap();

        doc.insert_text(0, 5, "!").unwrap();
        assert_eq!(doc.blocks(), vec![Block::paragraph("héllo! wörld")]);

        doc.delete_text(0, 7, 5).unwrap();
        assert_eq!(doc.blocks(), vec![Block::paragraph("héllo! ")]);

        doc.replace_block(0, &Block::paragraph("héllo, ünïcode")).unwrap();
        assert_eq!(doc.blocks(), vec![Block::paragraph("héllo, ünïcode")]);
    }

    #[test]
    fn test_text_ops_out_of_range_rejected() {
        let doc = SharedDocument::new();
        doc.insert_blocks(0, &[Block::paragraph("abc"), Block::Divider]).unwrap();

        assert!(doc.insert_text(0, 4, "x").is_err());
        assert!(doc.insert_text(2, 0, "x").is_err());
        assert!(doc.insert_text(1, 0, "x").is_err());
        assert!(doc.delete_text(0, 2, 2).is_err());
        assert_eq!(doc.blocks(), vec![Block::paragraph("abc"), Block::Divider]);

        doc.insert_text(0, 3, "d").unwrap();
        doc.delete_text(0, 0, 0).unwrap();
        assert_eq!(doc.blocks()[0], Block::paragraph("abcd"));
    }

    #[test]
    fn test_splice_helpers() {
        assert_eq!(common_prefix("hello", "help"), 3);
        assert_eq!(common_prefix("é", "e"), 0);
        assert_eq!(common_suffix("wörld", "world"), 3);
        assert_eq!(byte_offset("hé!", 2), Some(3));
        assert_eq!(byte_offset("hé!", 3), Some(4));
        assert_eq!(byte_offset("hé!", 4), None);
    }

    #[test]
    fn test_garbage_update_rejected() {
        let doc = SharedDocument::new();
        assert!(doc.apply_update(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(doc.encode_diff(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
