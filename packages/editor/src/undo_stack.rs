//! # Undo/Redo Stack
//!
//! Local-only undo for a collaborative document.
//!
//! ## Design
//!
//! - Recorded changes are committed as tracked local steps; everything
//!   else (plain changes, imports) is treated as someone else's edit
//! - Undo reverts the latest step on top of whatever arrived since, so
//!   edits from other replicas are never reverted
//! - Redo reapplies the most recently undone step
//! - New changes clear the redo stack
//! - The stack keeps labels for display alongside the steps
//!
//! ## Example
//!
//! ```rust
//! use grove_editor::{Document, ReadDocument, UndoStack};
//!
//! let mut doc = Document::with_peer(1);
//! let mut stack = UndoStack::new();
//! let root = stack.change(&mut doc, |tx| tx.create_root_node("div")).unwrap();
//!
//! stack.change(&mut doc, |tx| tx.update_tag(&root, "section")).unwrap();
//! stack.undo(&mut doc).unwrap();
//! assert_eq!(doc.tag(&root).unwrap().as_deref(), Some("div"));
//!
//! stack.redo(&mut doc).unwrap();
//! assert_eq!(doc.tag(&root).unwrap().as_deref(), Some("section"));
//! ```

use grove_crdt::UndoHistory;

use crate::{Document, EditorError, Transaction};

/// Label of one undoable step
#[derive(Debug, Clone, Default)]
pub struct UndoEntry {
    pub description: Option<String>,
}

/// Undo/redo stack for one local replica
#[derive(Debug)]
pub struct UndoStack {
    /// Attached to the first document recorded into
    history: Option<UndoHistory>,

    /// Most recent last
    undo_stack: Vec<UndoEntry>,

    /// Most recent last
    redo_stack: Vec<UndoEntry>,

    /// Maximum number of undo levels (0 = unlimited)
    max_levels: usize,
}

impl UndoStack {
    /// Create a new undo stack with default max levels (100)
    pub fn new() -> Self {
        Self::with_max_levels(100)
    }

    pub fn with_max_levels(max_levels: usize) -> Self {
        Self {
            history: None,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            max_levels,
        }
    }

    /// Run one undoable transaction
    pub fn change<R>(
        &mut self,
        doc: &mut Document,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        self.record(doc, None, |doc| doc.change(f))
    }

    /// Run several changes as one undo step
    pub fn transaction<R>(
        &mut self,
        doc: &mut Document,
        f: impl FnOnce(&mut Document) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        self.record(doc, None, |doc| doc.batch(f))
    }

    /// Like [`UndoStack::transaction`], labelled for display
    pub fn transaction_with_description<R>(
        &mut self,
        doc: &mut Document,
        description: impl Into<String>,
        f: impl FnOnce(&mut Document) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        self.record(doc, Some(description.into()), |doc| doc.batch(f))
    }

    fn record<R>(
        &mut self,
        doc: &mut Document,
        description: Option<String>,
        f: impl FnOnce(&mut Document) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        if doc.in_transaction() {
            return Err(EditorError::InvalidOperation(
                "undoable changes cannot start inside an open transaction".to_string(),
            ));
        }
        let max_levels = self.max_levels;
        self.history.get_or_insert_with(|| {
            let mut history = UndoHistory::new(doc.tree());
            history.set_max_steps(if max_levels == 0 { usize::MAX } else { max_levels });
            history
        });

        let before = doc.version().clone();
        doc.track_undo = true;
        let result = f(doc);
        doc.track_undo = false;
        let result = result?;

        if doc.version() != &before {
            self.push_entry(UndoEntry { description });
            // new action invalidates the future
            self.redo_stack.clear();
        }
        Ok(result)
    }

    fn push_entry(&mut self, entry: UndoEntry) {
        self.undo_stack.push(entry);
        if self.max_levels > 0 && self.undo_stack.len() > self.max_levels {
            self.undo_stack.remove(0);
        }
    }

    /// Undo the most recent local change. Returns `false` if there was none.
    pub fn undo(&mut self, doc: &mut Document) -> Result<bool, EditorError> {
        doc.require_idle("undo")?;
        let (Some(history), Some(entry)) = (self.history.as_mut(), self.undo_stack.pop()) else {
            return Ok(false);
        };
        match history.undo(doc.tree_mut()) {
            Ok(true) => {
                tracing::debug!(levels = self.undo_stack.len(), "undo");
                self.redo_stack.push(entry);
                Ok(true)
            }
            Ok(false) => {
                // nothing left to revert locally
                self.undo_stack.clear();
                Ok(false)
            }
            Err(err) => {
                self.undo_stack.push(entry);
                Err(err.into())
            }
        }
    }

    /// Redo the most recently undone change. Returns `false` if there was none.
    pub fn redo(&mut self, doc: &mut Document) -> Result<bool, EditorError> {
        doc.require_idle("redo")?;
        let (Some(history), Some(entry)) = (self.history.as_mut(), self.redo_stack.pop()) else {
            return Ok(false);
        };
        match history.redo(doc.tree_mut()) {
            Ok(true) => {
                tracing::debug!(levels = self.redo_stack.len(), "redo");
                self.push_entry(entry);
                Ok(true)
            }
            Ok(false) => {
                self.redo_stack.clear();
                Ok(false)
            }
            Err(err) => {
                self.redo_stack.push(entry);
                Err(err.into())
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_levels(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_levels(&self) -> usize {
        self.redo_stack.len()
    }

    /// Clear all undo/redo history
    pub fn clear(&mut self) {
        self.history = None;
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.undo_stack
            .last()
            .and_then(|entry| entry.description.as_deref())
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.redo_stack
            .last()
            .and_then(|entry| entry.description.as_deref())
    }
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new()
    }
}
