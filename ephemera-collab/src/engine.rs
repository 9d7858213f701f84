//! CRDT text replica backed by yrs.
//!
//! A document is a single `yrs::Doc` holding one text container named
//! `"content"`. Every successful merge or local edit yields the incremental
//! update of that transaction, which the caller fans out and persists.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// Name of the shared text container.
pub const CONTENT: &str = "content";

/// v1 encoding of an update that carries no structs and no deletions.
const EMPTY_UPDATE: &[u8] = &[0, 0];

/// Errors raised while merging remote bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("undecodable update: {0}")]
    Decode(String),
    #[error("update rejected: {0}")]
    Apply(String),
}

/// One replica of a collaborative text document.
pub struct TextEngine {
    doc: Doc,
    text: TextRef,
}

impl TextEngine {
    /// Create an empty document with its `"content"` container.
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(CONTENT);
        Self { doc, text }
    }

    /// Rebuild a replica from a persisted full-state blob.
    ///
    /// An empty blob yields an empty document.
    pub fn from_state(state: &[u8]) -> Result<Self, MergeError> {
        let engine = Self::new();
        if !state.is_empty() {
            engine.apply_update(state)?;
        }
        Ok(engine)
    }

    /// Merge a remote v1 update.
    ///
    /// Returns the delta produced by the merge, or `None` when the update
    /// contained nothing this replica did not already have.
    pub fn apply_update(&self, update: &[u8]) -> Result<Option<Vec<u8>>, MergeError> {
        let update = Update::decode_v1(update).map_err(|e| MergeError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| MergeError::Apply(e.to_string()))?;
        Ok(non_empty(txn.encode_update_v1()))
    }

    /// Insert text at a character index, returning the delta.
    pub fn insert(&self, index: u32, chunk: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.text.insert(&mut txn, index, chunk);
        txn.encode_update_v1()
    }

    /// Append text at the end, returning the delta.
    pub fn push(&self, chunk: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let len = self.text.len(&txn);
        self.text.insert(&mut txn, len, chunk);
        txn.encode_update_v1()
    }

    /// Remove `len` characters starting at `index`, returning the delta.
    pub fn remove(&self, index: u32, len: u32) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.text.remove_range(&mut txn, index, len);
        txn.encode_update_v1()
    }

    /// Full document state as a single v1 update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| MergeError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Current text of the `"content"` container.
    pub fn text_content(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Length of the text in characters.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TextEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(update: Vec<u8>) -> Option<Vec<u8>> {
    if update.as_slice() == EMPTY_UPDATE {
        None
    } else {
        Some(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_engine_is_empty() {
        let engine = TextEngine::new();
        assert!(engine.is_empty());
        assert_eq!(engine.text_content(), "");
    }

    #[test]
    fn test_local_edits_replicate() {
        let a = TextEngine::new();
        let b = TextEngine::new();

        let d1 = a.insert(0, "hello");
        let d2 = a.push(" world");
        let d3 = a.remove(0, 1);

        for delta in [d1, d2, d3] {
            assert!(b.apply_update(&delta).unwrap().is_some());
        }
        assert_eq!(b.text_content(), "ello world");
        assert_eq!(a.text_content(), b.text_content());
    }

    #[test]
    fn test_duplicate_update_is_noop() {
        let a = TextEngine::new();
        let b = TextEngine::new();
        let delta = a.insert(0, "abc");

        assert!(b.apply_update(&delta).unwrap().is_some());
        assert_eq!(b.apply_update(&delta).unwrap(), None);
        assert_eq!(b.text_content(), "abc");
    }

    #[test]
    fn test_malformed_update_rejected() {
        let engine = TextEngine::new();
        assert!(engine.apply_update(&[0xFF, 0xFF, 0xFF]).is_err());
        assert_eq!(engine.text_content(), "");
    }

    #[test]
    fn test_full_state_roundtrip() {
        let a = TextEngine::new();
        a.insert(0, "persist me");
        let state = a.encode_full_state();

        let restored = TextEngine::from_state(&state).unwrap();
        assert_eq!(restored.text_content(), "persist me");
    }

    #[test]
    fn test_from_empty_state() {
        let restored = TextEngine::from_state(&[]).unwrap();
        assert!(restored.is_empty());
        let empty_doc_state = TextEngine::new().encode_full_state();
        assert!(TextEngine::from_state(&empty_doc_state).unwrap().is_empty());
    }

    #[test]
    fn test_merge_determinism() {
        let author = TextEngine::new();
        let updates = vec![
            author.insert(0, "The quick"),
            author.push(" brown fox"),
            author.remove(4, 6),
            author.insert(4, "slow "),
        ];

        let r1 = TextEngine::new();
        let r2 = TextEngine::new();
        for u in &updates {
            r1.apply_update(u).unwrap();
            r2.apply_update(u).unwrap();
        }
        assert_eq!(r1.encode_full_state(), r2.encode_full_state());
        assert_eq!(r1.text_content(), author.text_content());
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let a = TextEngine::new();
        let b = TextEngine::new();
        let base = a.insert(0, "base");
        b.apply_update(&base).unwrap();

        let from_a = a.push(" A");
        let from_b = b.insert(0, "B ");
        a.apply_update(&from_b).unwrap();
        b.apply_update(&from_a).unwrap();

        assert_eq!(a.text_content(), b.text_content());
        assert!(a.text_content().contains("base"));
    }

    #[test]
    fn test_diff_against_state_vector() {
        let server = TextEngine::new();
        server.insert(0, "shared");
        let client = TextEngine::new();
        client.apply_update(&server.encode_full_state()).unwrap();

        server.push(" + more");
        let diff = server.encode_diff(&client.state_vector()).unwrap();
        client.apply_update(&diff).unwrap();
        assert_eq!(client.text_content(), "shared + more");
    }
}
