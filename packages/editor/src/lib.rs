//! # Grove Editor
//!
//! Editing engine for collaborative element/value trees.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ grove-crdt: replicated tree substrate       │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ editor                                      │
//! │  - Document + Transaction (atomic changes)  │
//! │  - selection generalization + mass edits    │
//! │  - local-only undo/redo                     │
//! │  - history patches and replayable scripts   │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ grove-sync: rooms, client, server           │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **All writes are transactions**: a change commits whole or not at all
//! 2. **CRDT for convergence**: replicas merge without coordination
//! 3. **Undo is local**: undoing never reverts another replica's edit
//! 4. **Ids are stable**: node ids survive sync, reconnects and undo
//!
//! ## Usage
//!
//! ```rust
//! use grove_editor::{
//!     apply_generalized, generalize_selection, Document, GeneralizedEdit, ReadDocument,
//! };
//!
//! let mut doc = Document::with_peer(1);
//! let (ul, items) = doc
//!     .change(|tx| {
//!         let root = tx.create_root_node("section")?;
//!         let ul = tx.add_element_child_node(&root, "ul")?;
//!         let hello = tx.add_value_child_node(&ul, "Hello")?;
//!         let world = tx.add_value_child_node(&ul, "World")?;
//!         Ok((ul, vec![hello, world]))
//!     })
//!     .unwrap();
//!
//! let selection = generalize_selection(&doc, &items);
//! let wrap = GeneralizedEdit::Wrap { tag: "li".to_string() };
//! doc.change(|tx| apply_generalized(tx, &selection, &wrap)).unwrap();
//!
//! for li in doc.children(&ul) {
//!     assert_eq!(doc.tag(&li).unwrap().as_deref(), Some("li"));
//! }
//! ```

pub mod document;
pub mod errors;
pub mod history;
pub mod mass_edit;
pub mod mutations;
pub mod recorder;
pub mod selection;
pub mod undo_stack;

pub use document::{Document, ReadDocument};
pub use errors::EditorError;
pub use history::{
    apply_patches, patches_between, resolve_container, translate_diff, GeneralizedPatch,
    PatchAction, PathKey,
};
pub use mass_edit::{apply_generalized, GeneralizedEdit};
pub use mutations::{compute_splice, validate_tag, SpliceInfo, Transaction};
pub use recorder::{RecordedAction, Recorder, Script};
pub use selection::{generalize_selection, lowest_common_ancestor, SelectionInfo};
pub use undo_stack::{UndoEntry, UndoStack};

pub use grove_crdt::{
    CommitEvent, CommitOrigin, ImportStatus, NodeData, NodeKind, PeerId, Subscription, Value,
    VersionVector,
};

/// Stable node identifier (`counter@peer`)
pub type NodeId = grove_crdt::TreeId;
