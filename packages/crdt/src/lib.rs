//! # Grove CRDT
//!
//! Replicated element/value tree used as the storage substrate of the
//! editor.
//!
//! ## Model
//!
//! ```text
//! TreeDoc (one replica)
//!   ├─ LoroDoc           movable tree + per-node metadata maps and text
//!   ├─ TreeState         materialized view (children, tags, attrs, text)
//!   └─ VersionVector     committed frontier used for diffing and sync
//! ```
//!
//! - Nodes are `Element` (tag + attributes + children) or `Value` (text).
//! - Node ids are `counter@peer` pairs; they never collide across replicas.
//! - Concurrent edits converge the way Loro merges them: moves never form
//!   cycles, child order uses fractional indices, text merges character by
//!   character, tags and attributes are last-writer-wins.
//! - [`UndoHistory`] reverts only this replica's own tracked commits.
//!
//! ## Usage
//!
//! ```rust
//! use grove_crdt::{ExportMode, NodeKind, TreeDoc};
//!
//! let mut a = TreeDoc::with_peer(1);
//! let root = a.create_node(None, 0, NodeKind::Element).unwrap();
//! a.set_tag(&root, "section").unwrap();
//! a.commit();
//!
//! let mut b = TreeDoc::with_peer(2);
//! b.import(&a.export(ExportMode::Snapshot).unwrap()).unwrap();
//! assert_eq!(b.roots(), vec![root]);
//! ```

mod diff;
mod doc;
mod encoding;
mod error;
mod id;
mod state;
mod undo;

pub use diff::{diff_states, ContainerDiff, ContainerId, Diff, MapChange, TextDelta, TreeChange};
pub use doc::{CommitEvent, CommitOrigin, Subscription, TreeDoc};
pub use encoding::{ExportMode, ImportStatus};
pub use error::CrdtError;
pub use id::{OpId, PeerId, TreeId, VersionVector};
pub use state::{NodeData, NodeKind, TreeState};
pub use undo::UndoHistory;

// Attribute values are plain JSON
pub use serde_json::Value;
