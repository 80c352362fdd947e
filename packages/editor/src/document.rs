//! # Document Model
//!
//! A `Document` is one replica of a collaborative element/value tree.
//!
//! All writes go through [`Document::change`] (one closure, one
//! transaction) or [`Document::batch`] (several steps committed together).
//! A scope that returns an error leaves no trace: its ops are rolled back
//! before they are ever committed, so subscribers and remote replicas never
//! see a partial edit.
//!
//! Plain changes are not undoable; only scopes run through a
//! [`crate::UndoStack`] commit as local undo steps.
//!
//! ```rust
//! use grove_editor::{Document, ReadDocument};
//!
//! let mut doc = Document::with_peer(1);
//! let root = doc.change(|tx| tx.create_root_node("section")).unwrap();
//! let value = doc
//!     .change(|tx| tx.add_value_child_node(&root, "Hello"))
//!     .unwrap();
//! assert_eq!(doc.text(&value).unwrap(), "Hello");
//! ```

use std::collections::BTreeMap;

use grove_crdt::{
    CommitEvent, ExportMode, ImportStatus, NodeData, NodeKind, PeerId, Subscription, TreeDoc,
    TreeState, Value, VersionVector,
};
use serde_json::json;

use crate::{EditorError, NodeId, Transaction};

/// Read access shared by [`Document`] and [`Transaction`]
pub trait ReadDocument {
    fn tree_state(&self) -> &TreeState;

    /// The single top-level element, if the document has one
    fn root(&self) -> Option<NodeId> {
        self.tree_state().roots().first().copied()
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.tree_state().is_visible(id)
    }

    fn node(&self, id: &NodeId) -> Result<NodeData, EditorError> {
        self.tree_state()
            .get_node(id)
            .ok_or(EditorError::NotFound(*id))
    }

    fn kind(&self, id: &NodeId) -> Result<NodeKind, EditorError> {
        Ok(self.node(id)?.kind)
    }

    fn tag(&self, id: &NodeId) -> Result<Option<String>, EditorError> {
        Ok(self.node(id)?.tag)
    }

    fn text(&self, id: &NodeId) -> Result<String, EditorError> {
        Ok(self.node(id)?.text)
    }

    fn attrs(&self, id: &NodeId) -> Result<BTreeMap<String, Value>, EditorError> {
        Ok(self.node(id)?.attrs)
    }

    fn parent(&self, id: &NodeId) -> Option<NodeId> {
        self.tree_state().parent(id)
    }

    fn children(&self, id: &NodeId) -> Vec<NodeId> {
        self.tree_state().children(id)
    }

    fn index_of(&self, id: &NodeId) -> Option<usize> {
        if !self.contains(id) {
            return None;
        }
        self.tree_state().index_of(id)
    }

    /// Parent first, up to and including the root
    fn ancestors(&self, id: &NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(parent) = current {
            out.push(parent);
            current = self.parent(&parent);
        }
        out
    }

    /// Descendants of `id` in depth-first pre-order, excluding `id`
    fn descendants(&self, id: &NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).into_iter().rev().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(&next).into_iter().rev());
        }
        out
    }

    /// Nested JSON view of the visible tree, mostly for tests and debugging
    fn to_json(&self) -> Value {
        fn node_json(state: &TreeState, id: &NodeId) -> Value {
            let Some(data) = state.get_node(id) else {
                return Value::Null;
            };
            match data.kind {
                NodeKind::Element => {
                    let children: Vec<Value> =
                        state.children(id).iter().map(|c| node_json(state, c)).collect();
                    json!({
                        "id": id.to_string(),
                        "tag": data.tag,
                        "attrs": data.attrs,
                        "children": children,
                    })
                }
                NodeKind::Value => json!({
                    "id": id.to_string(),
                    "value": data.text,
                }),
            }
        }
        let state = self.tree_state();
        match self.root() {
            Some(root) => node_json(state, &root),
            None => Value::Null,
        }
    }
}

/// One replica of a collaborative document
#[derive(Debug)]
pub struct Document {
    tree: TreeDoc,
    /// Open `change`/`batch` scopes
    depth: usize,
    /// Commit the outermost scope as an undo step
    pub(crate) track_undo: bool,
}

impl Document {
    pub fn new() -> Self {
        Self::from_tree(TreeDoc::new())
    }

    pub fn with_peer(peer: PeerId) -> Self {
        Self::from_tree(TreeDoc::with_peer(peer))
    }

    pub fn from_tree(tree: TreeDoc) -> Self {
        Self {
            tree,
            depth: 0,
            track_undo: false,
        }
    }

    /// Build a replica from bytes produced by [`Document::export_snapshot`]
    pub fn from_snapshot(peer: PeerId, bytes: &[u8]) -> Result<Self, EditorError> {
        let mut doc = Self::with_peer(peer);
        doc.import(bytes)?;
        Ok(doc)
    }

    pub fn peer_id(&self) -> PeerId {
        self.tree.peer()
    }

    pub fn version(&self) -> &VersionVector {
        self.tree.version()
    }

    pub fn tree(&self) -> &TreeDoc {
        &self.tree
    }

    pub(crate) fn tree_mut(&mut self) -> &mut TreeDoc {
        &mut self.tree
    }

    /// Counter the next local op will get
    pub fn next_counter(&self) -> u32 {
        self.tree.next_counter()
    }

    /// True while a `change`/`batch` scope is open
    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Run one transaction. Commits on success (unless nested inside an
    /// outer scope), rolls back on error.
    pub fn change<R>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        self.scoped(|doc| {
            let mut tx = Transaction::new(&mut doc.tree);
            f(&mut tx)
        })
    }

    /// Group several `change` calls into one atomic unit
    pub fn batch<R>(
        &mut self,
        f: impl FnOnce(&mut Document) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        self.scoped(f)
    }

    fn scoped<R>(
        &mut self,
        f: impl FnOnce(&mut Document) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        let checkpoint = self.tree.checkpoint();
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;

        match result {
            Ok(value) => {
                if self.depth == 0 {
                    if self.track_undo {
                        self.tree.commit();
                    } else {
                        self.tree.commit_untracked();
                    }
                }
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(error = %err, "rolling back transaction");
                self.tree.rollback_to(checkpoint);
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    pub fn export_snapshot(&self) -> Result<Vec<u8>, EditorError> {
        self.require_idle("export")?;
        Ok(self.tree.export(ExportMode::Snapshot)?)
    }

    /// Committed ops the holder of `from` has not seen yet
    pub fn export_updates(&self, from: &VersionVector) -> Result<Vec<u8>, EditorError> {
        self.require_idle("export")?;
        Ok(self.tree.export(ExportMode::Updates { from })?)
    }

    pub fn import(&mut self, bytes: &[u8]) -> Result<ImportStatus, EditorError> {
        self.require_idle("import")?;
        Ok(self.tree.import(bytes)?)
    }

    pub(crate) fn require_idle(&self, action: &str) -> Result<(), EditorError> {
        if self.in_transaction() {
            return Err(EditorError::InvalidOperation(format!(
                "cannot {} while a transaction is open",
                action
            )));
        }
        Ok(())
    }

    /// Called after every commit, local or imported
    pub fn subscribe(
        &self,
        listener: impl Fn(&CommitEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.tree.subscribe(listener)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadDocument for Document {
    fn tree_state(&self) -> &TreeState {
        self.tree.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_change_commits_once() {
        let mut doc = Document::with_peer(1);
        let commits = Arc::new(AtomicUsize::new(0));
        let counter = commits.clone();
        let _sub = doc.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        doc.change(|tx| {
            let root = tx.create_root_node("section")?;
            tx.add_element_child_node(&root, "h1")?;
            tx.add_element_child_node(&root, "p")?;
            Ok(())
        })
        .unwrap();

        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(doc.tree_state().len(), 3);
    }

    #[test]
    fn test_failed_change_leaves_no_trace() {
        let mut doc = Document::with_peer(1);
        let root = doc.change(|tx| tx.create_root_node("section")).unwrap();
        let before = doc.to_json();

        let result = doc.change(|tx| {
            tx.add_element_child_node(&root, "p")?;
            tx.update_tag(&root, "")
        });

        assert!(matches!(result, Err(EditorError::Validation(_))));
        assert!(doc.children(&root).is_empty());
        assert_eq!(doc.to_json(), before);

        // a fresh replica built from the exported bytes agrees
        let copy = Document::from_snapshot(2, &doc.export_snapshot().unwrap()).unwrap();
        assert_eq!(copy.to_json(), before);
    }

    #[test]
    fn test_batch_is_atomic() {
        let mut doc = Document::with_peer(1);
        let root = doc.change(|tx| tx.create_root_node("ul")).unwrap();

        let result: Result<(), EditorError> = doc.batch(|doc| {
            doc.change(|tx| tx.add_element_child_node(&root, "li"))?;
            doc.change(|tx| tx.add_element_child_node(&root, "li"))?;
            Err(EditorError::InvalidOperation("abort".to_string()))
        });

        assert!(result.is_err());
        assert!(doc.children(&root).is_empty());
    }

    #[test]
    fn test_nested_failure_can_be_recovered() {
        let mut doc = Document::with_peer(1);
        let root = doc.change(|tx| tx.create_root_node("ul")).unwrap();

        doc.batch(|doc| {
            doc.change(|tx| tx.add_element_child_node(&root, "li"))?;
            let failed = doc.change(|tx| {
                tx.add_element_child_node(&root, "li")?;
                tx.delete_node(&NodeId::new(9, 9))
            });
            assert!(failed.is_err());
            Ok(())
        })
        .unwrap();

        assert_eq!(doc.children(&root).len(), 1);
    }

    #[test]
    fn test_import_rejected_inside_transaction() {
        let mut doc = Document::with_peer(1);
        let snapshot = Document::with_peer(2).export_snapshot().unwrap();
        let result = doc.batch(|doc| doc.import(&snapshot).map(|_| ()));
        assert!(matches!(result, Err(EditorError::InvalidOperation(_))));
    }

    #[test]
    fn test_export_rejected_inside_transaction() {
        let mut doc = Document::with_peer(1);
        let result = doc.change(|tx| {
            tx.create_root_node("section")?;
            Ok(())
        });
        assert!(result.is_ok());
        let result = doc.batch(|doc| doc.export_snapshot().map(|_| ()));
        assert!(matches!(result, Err(EditorError::InvalidOperation(_))));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut doc = Document::with_peer(1);
        doc.change(|tx| {
            let root = tx.create_root_node("section")?;
            tx.update_attribute(&root, "class", Some(json!("hero")))?;
            tx.add_value_child_node(&root, "Hello")?;
            Ok(())
        })
        .unwrap();

        let copy = Document::from_snapshot(2, &doc.export_snapshot().unwrap()).unwrap();
        assert_eq!(copy.to_json(), doc.to_json());
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let mut doc = Document::with_peer(1);
        let (root, ul, li) = doc
            .change(|tx| {
                let root = tx.create_root_node("section")?;
                let ul = tx.add_element_child_node(&root, "ul")?;
                let li = tx.add_element_child_node(&ul, "li")?;
                Ok((root, ul, li))
            })
            .unwrap();

        assert_eq!(doc.ancestors(&li), vec![ul, root]);
        assert_eq!(doc.descendants(&root), vec![ul, li]);
        assert!(doc.ancestors(&root).is_empty());
    }
}
