//! # Replicated Tree Document
//!
//! One replica of a shared element/value tree, stored in a [`LoroDoc`].
//!
//! ## Lifecycle of a local edit
//!
//! ```text
//! create_node / set_attr / insert_text ...   (pending, journaled)
//!                     ↓
//!       commit() / commit_untracked()        (listeners notified)
//!                     ↓
//!           export(Updates { from })         (bytes for other replicas)
//! ```
//!
//! Loro has no way to abort its open transaction, so every pending edit
//! records how to put things back. [`TreeDoc::rollback_to`] replays that
//! journal backwards and commits the net no-op under an origin the undo
//! history ignores. Deletes are the exception: a deleted Loro node cannot
//! be brought back under its own id, so they only hide the node here and
//! reach Loro at commit time.

use loro::{LoroDoc, LoroMap, LoroText, LoroTree, LoroValue};
use rand::Rng;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::state::{
    attrs_map, parent_id, read_children, text_container, ATTRS, KIND, SOURCE, TAG, TEXT,
};
use crate::{CrdtError, NodeData, NodeKind, PeerId, TreeId, TreeState, VersionVector};

const TREE: &str = "tree";

/// Commits under this origin prefix are never undoable
pub(crate) const UNDO_EXCLUDED_PREFIX: &str = "grove:";
const UNTRACKED_ORIGIN: &str = "grove:untracked";
const ROLLBACK_ORIGIN: &str = "grove:rollback";

/// Who produced a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOrigin {
    Local,
    Import,
}

/// Published to subscribers after every commit or successful import
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    pub origin: CommitOrigin,
    pub from: VersionVector,
    pub to: VersionVector,
}

type Listener = Box<dyn Fn(&CommitEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: BTreeMap<u64, Listener>,
}

/// Keeps a listener registered; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    /// Keep the listener for the lifetime of the document
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            let mut guard = listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard.entries.remove(&self.id);
        }
    }
}

/// How to put back one pending edit
#[derive(Debug, Clone)]
enum Inverse {
    Create(TreeId),
    /// Not applied to Loro yet
    Delete(TreeId),
    Move {
        id: TreeId,
        parent: Option<TreeId>,
        index: usize,
    },
    Tag {
        id: TreeId,
        old: Option<String>,
    },
    Attr {
        id: TreeId,
        key: String,
        old: Option<Value>,
    },
    InsertText {
        id: TreeId,
        index: usize,
        len: usize,
    },
    DeleteText {
        id: TreeId,
        index: usize,
        text: String,
    },
}

/// A replica of the shared tree
pub struct TreeDoc {
    pub(crate) doc: LoroDoc,
    tree: LoroTree,
    state: TreeState,
    /// Committed frontier
    version: VersionVector,
    journal: Vec<Inverse>,
    listeners: Arc<Mutex<Listeners>>,
}

impl fmt::Debug for TreeDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeDoc")
            .field("peer", &self.peer())
            .field("version", &self.version)
            .field("nodes", &self.state.len())
            .field("pending", &self.journal.len())
            .finish()
    }
}

impl Default for TreeDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeDoc {
    /// New empty replica with a random peer id
    pub fn new() -> Self {
        Self::with_peer(random_peer())
    }

    pub fn with_peer(peer: PeerId) -> Self {
        let doc = LoroDoc::new();
        if let Err(err) = doc.set_peer_id(peer) {
            tracing::warn!(peer, error = %err, "keeping generated peer id");
        }
        let tree = doc.get_tree(TREE);
        tree.enable_fractional_index(0);
        Self {
            doc,
            tree,
            state: TreeState::new(),
            version: VersionVector::new(),
            journal: Vec::new(),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.doc.peer_id()
    }

    /// Committed frontier
    pub fn version(&self) -> &VersionVector {
        &self.version
    }

    /// Next counter this replica will assign
    pub fn next_counter(&self) -> u32 {
        self.version.get(self.peer())
    }

    pub fn state(&self) -> &TreeState {
        &self.state
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Create a node at visible `index` under `parent` (`None` = top level)
    pub fn create_node(
        &mut self,
        parent: Option<TreeId>,
        index: usize,
        kind: NodeKind,
    ) -> Result<TreeId, CrdtError> {
        self.create_node_from(parent, index, kind, None)
    }

    /// Create a node that records `source` as the node it was copied from
    pub fn create_node_from(
        &mut self,
        parent: Option<TreeId>,
        index: usize,
        kind: NodeKind,
        source: Option<TreeId>,
    ) -> Result<TreeId, CrdtError> {
        if let Some(parent_id) = parent {
            self.require_visible(&parent_id)?;
        }
        let at = self.loro_index(parent, index, None);
        let id = TreeId::from_loro(self.tree.create_at(parent_id(parent), at)?);
        self.journal.push(Inverse::Create(id));

        let meta = self.tree.get_meta(id.to_loro())?;
        meta.insert(KIND, LoroValue::from(kind.as_str()))?;
        if let Some(source) = source {
            meta.insert(SOURCE, LoroValue::from(source.to_string().as_str()))?;
        }
        meta.insert_container(ATTRS, LoroMap::new())?;
        if kind == NodeKind::Value {
            meta.insert_container(TEXT, LoroText::new())?;
        }

        self.state.insert_node(
            NodeData {
                id,
                kind,
                tag: None,
                attrs: BTreeMap::new(),
                text: String::new(),
                source,
            },
            parent,
        );
        self.refresh_children(parent);
        Ok(id)
    }

    /// Move `id` to visible `index` among `parent`'s children
    pub fn move_node(
        &mut self,
        id: &TreeId,
        parent: Option<TreeId>,
        index: usize,
    ) -> Result<(), CrdtError> {
        self.require_visible(id)?;
        if let Some(parent_id) = parent {
            self.require_visible(&parent_id)?;
        }
        if self.state.would_cycle(*id, parent) {
            return Err(CrdtError::InvalidOperation(format!(
                "moving {} under {:?} would create a cycle",
                id, parent
            )));
        }
        let old_parent = self.state.parent(id);
        let old_index = read_children(&self.tree, old_parent)
            .iter()
            .position(|child| child == id)
            .unwrap_or(0);
        let at = self.loro_index(parent, index, Some(*id));

        self.tree.mov_to(id.to_loro(), parent_id(parent), at)?;
        self.journal.push(Inverse::Move {
            id: *id,
            parent: old_parent,
            index: old_index,
        });

        self.state.set_parent(*id, parent);
        self.refresh_children(old_parent);
        self.refresh_children(parent);
        Ok(())
    }

    /// Delete a node and, implicitly, its whole subtree
    pub fn delete_node(&mut self, id: &TreeId) -> Result<(), CrdtError> {
        self.require_visible(id)?;
        self.journal.push(Inverse::Delete(*id));
        self.state.remove_subtree(id);
        Ok(())
    }

    pub fn set_tag(&mut self, id: &TreeId, tag: &str) -> Result<(), CrdtError> {
        let old = self.require_visible(id)?.tag.clone();
        self.meta(id)?.insert(TAG, LoroValue::from(tag))?;
        self.journal.push(Inverse::Tag { id: *id, old });
        if let Some(node) = self.state.node_mut(id) {
            node.tag = Some(tag.to_string());
        }
        Ok(())
    }

    /// Set (`Some`) or remove (`None`) an attribute
    pub fn set_attr(
        &mut self,
        id: &TreeId,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), CrdtError> {
        let old = self.require_visible(id)?.attrs.get(key).cloned();
        if old == value {
            return Ok(());
        }
        self.write_attr(id, key, value.as_ref())?;
        self.journal.push(Inverse::Attr {
            id: *id,
            key: key.to_string(),
            old,
        });
        if let Some(node) = self.state.node_mut(id) {
            match value {
                Some(value) => {
                    node.attrs.insert(key.to_string(), value);
                }
                None => {
                    node.attrs.remove(key);
                }
            }
        }
        Ok(())
    }

    /// Insert text at a character index, clamped to the text length
    pub fn insert_text(&mut self, id: &TreeId, index: usize, text: &str) -> Result<(), CrdtError> {
        let current = self.require_visible(id)?.text.clone();
        if text.is_empty() {
            return Ok(());
        }
        let at = index.min(current.chars().count());
        self.text(id)?.insert(at, text)?;
        let len = text.chars().count();
        self.journal.push(Inverse::InsertText { id: *id, index: at, len });
        if let Some(node) = self.state.node_mut(id) {
            node.text = splice_chars(&current, at, 0, text);
        }
        Ok(())
    }

    /// Delete `len` characters starting at `index`
    pub fn delete_text(&mut self, id: &TreeId, index: usize, len: usize) -> Result<(), CrdtError> {
        let current = self.require_visible(id)?.text.clone();
        if len == 0 {
            return Ok(());
        }
        let length = current.chars().count();
        let end = index.checked_add(len).filter(|end| *end <= length).ok_or_else(|| {
            CrdtError::InvalidOperation(format!(
                "text range {}+{} out of bounds (length {})",
                index, len, length
            ))
        })?;
        self.text(id)?.delete(index, len)?;
        let removed: String = current.chars().skip(index).take(end - index).collect();
        self.journal.push(Inverse::DeleteText {
            id: *id,
            index,
            text: removed,
        });
        if let Some(node) = self.state.node_mut(id) {
            node.text = splice_chars(&current, index, len, "");
        }
        Ok(())
    }

    fn require_visible(&self, id: &TreeId) -> Result<&NodeData, CrdtError> {
        self.state.node(id).ok_or(CrdtError::NodeNotFound(*id))
    }

    fn meta(&self, id: &TreeId) -> Result<LoroMap, CrdtError> {
        Ok(self.tree.get_meta(id.to_loro())?)
    }

    fn text(&self, id: &TreeId) -> Result<LoroText, CrdtError> {
        text_container(&self.meta(id)?)
            .ok_or_else(|| CrdtError::InvalidOperation(format!("{} holds no text", id)))
    }

    fn write_attr(&self, id: &TreeId, key: &str, value: Option<&Value>) -> Result<(), CrdtError> {
        let meta = self.meta(id)?;
        let attrs = match attrs_map(&meta) {
            Some(attrs) => attrs,
            None => meta.insert_container(ATTRS, LoroMap::new())?,
        };
        match value {
            Some(value) => {
                let json =
                    serde_json::to_string(value).map_err(|e| CrdtError::Encode(e.to_string()))?;
                attrs.insert(key, LoroValue::from(json.as_str()))?;
            }
            None => attrs.delete(key)?,
        }
        Ok(())
    }

    /// Loro position for visible `index` under `parent`. Loro still lists
    /// nodes whose delete is pending, so visible positions are mapped onto
    /// its full child list (without `moving`, which is about to leave it).
    fn loro_index(&self, parent: Option<TreeId>, index: usize, moving: Option<TreeId>) -> usize {
        let all: Vec<TreeId> = read_children(&self.tree, parent)
            .into_iter()
            .filter(|child| Some(*child) != moving)
            .collect();
        let visible: Vec<TreeId> = self
            .state
            .children_of(parent)
            .into_iter()
            .filter(|child| Some(*child) != moving)
            .collect();
        match visible.get(index) {
            Some(anchor) => all.iter().position(|child| child == anchor).unwrap_or(all.len()),
            None => all.len(),
        }
    }

    /// Re-read one child list from Loro, hiding nodes deleted in this
    /// transaction
    fn refresh_children(&mut self, parent: Option<TreeId>) {
        let children: Vec<TreeId> = read_children(&self.tree, parent)
            .into_iter()
            .filter(|child| self.state.is_visible(child))
            .collect();
        self.state.set_children(parent, children);
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get_node(&self, id: &TreeId) -> Option<NodeData> {
        self.state.get_node(id)
    }

    pub fn children(&self, id: &TreeId) -> Vec<TreeId> {
        self.state.children(id)
    }

    pub fn parent(&self, id: &TreeId) -> Option<TreeId> {
        self.state.parent(id)
    }

    pub fn roots(&self) -> Vec<TreeId> {
        self.state.roots()
    }

    pub fn contains(&self, id: &TreeId) -> bool {
        self.state.is_visible(id)
    }

    /// Materialize the committed state at `version`
    pub fn checkout(&self, version: &VersionVector) -> Result<TreeState, CrdtError> {
        self.require_committed("checkout")?;
        if *version == self.version {
            return Ok(self.state.clone());
        }
        let view = self.doc.fork();
        let frontiers = view.vv_to_frontiers(&version.to_loro());
        view.checkout(&frontiers)?;
        TreeState::read(&view.get_tree(TREE))
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn pending_len(&self) -> usize {
        self.journal.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.journal.is_empty()
    }

    /// Loro commits its open transaction before exporting or forking,
    /// which would bypass the journal
    pub(crate) fn require_committed(&self, action: &str) -> Result<(), CrdtError> {
        if self.journal.is_empty() {
            return Ok(());
        }
        Err(CrdtError::InvalidOperation(format!(
            "cannot {} with {} uncommitted edits",
            action,
            self.journal.len()
        )))
    }

    /// Marker for [`TreeDoc::rollback_to`]
    pub fn checkpoint(&self) -> usize {
        self.journal.len()
    }

    /// Put back every pending edit recorded after `checkpoint`
    pub fn rollback_to(&mut self, checkpoint: usize) {
        if checkpoint >= self.journal.len() {
            return;
        }
        let undone: Vec<Inverse> = self.journal.drain(checkpoint..).collect();
        tracing::debug!(peer = self.peer(), edits = undone.len(), "rolling back pending edits");
        for inverse in undone.into_iter().rev() {
            if let Err(err) = self.apply_inverse(&inverse) {
                tracing::warn!(error = %err, inverse = ?inverse, "failed to roll back edit");
            }
        }
        if self.journal.is_empty() {
            self.doc.set_next_commit_origin(ROLLBACK_ORIGIN);
            self.doc.commit();
            self.version = VersionVector::from_loro(&self.doc.oplog_vv());
        }
        self.rebuild();
    }

    fn apply_inverse(&self, inverse: &Inverse) -> Result<(), CrdtError> {
        match inverse {
            Inverse::Create(id) => self.tree.delete(id.to_loro())?,
            Inverse::Delete(_) => {}
            Inverse::Move { id, parent, index } => {
                self.tree.mov_to(id.to_loro(), parent_id(*parent), *index)?
            }
            Inverse::Tag { id, old } => match old {
                Some(tag) => self.meta(id)?.insert(TAG, LoroValue::from(tag.as_str()))?,
                None => self.meta(id)?.delete(TAG)?,
            },
            Inverse::Attr { id, key, old } => self.write_attr(id, key, old.as_ref())?,
            Inverse::InsertText { id, index, len } => self.text(id)?.delete(*index, *len)?,
            Inverse::DeleteText { id, index, text } => self.text(id)?.insert(*index, text)?,
        }
        Ok(())
    }

    /// Publish pending edits as an undoable local change. Returns `None`
    /// when nothing was pending.
    pub fn commit(&mut self) -> Option<CommitEvent> {
        self.finish_commit(None)
    }

    /// Publish pending edits that undo history should not offer to revert
    pub fn commit_untracked(&mut self) -> Option<CommitEvent> {
        self.finish_commit(Some(UNTRACKED_ORIGIN))
    }

    fn finish_commit(&mut self, origin: Option<&str>) -> Option<CommitEvent> {
        if self.journal.is_empty() {
            return None;
        }
        for inverse in std::mem::take(&mut self.journal) {
            if let Inverse::Delete(id) = inverse {
                if let Err(err) = self.tree.delete(id.to_loro()) {
                    tracing::warn!(node = %id, error = %err, "failed to delete node");
                }
            }
        }
        self.doc.set_next_commit_origin(origin.unwrap_or(""));
        self.doc.commit();
        self.publish(CommitOrigin::Local)
    }

    /// Refresh after Loro changed the document on its own (undo, redo,
    /// import) and tell listeners about it
    pub(crate) fn publish(&mut self, origin: CommitOrigin) -> Option<CommitEvent> {
        let from = self.version.clone();
        self.version = VersionVector::from_loro(&self.doc.oplog_vv());
        self.rebuild();
        if from == self.version {
            return None;
        }
        let event = CommitEvent {
            origin,
            from,
            to: self.version.clone(),
        };
        self.notify(&event);
        Some(event)
    }

    fn rebuild(&mut self) {
        match TreeState::read(&self.tree) {
            Ok(state) => self.state = state,
            Err(err) => tracing::error!(error = %err, "failed to read tree state"),
        }
        for inverse in &self.journal {
            if let Inverse::Delete(id) = inverse {
                self.state.remove_subtree(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register a listener called after every commit and import
    pub fn subscribe(
        &self,
        listener: impl Fn(&CommitEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let id = guard.next_id;
        guard.next_id += 1;
        guard.entries.insert(id, Box::new(listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn notify(&self, event: &CommitEvent) {
        let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for listener in guard.entries.values() {
            listener(event);
        }
    }
}

fn random_peer() -> PeerId {
    rand::thread_rng().gen_range(1..PeerId::MAX)
}

fn splice_chars(text: &str, index: usize, delete: usize, insert: &str) -> String {
    let mut out: String = text.chars().take(index).collect();
    out.push_str(insert);
    out.extend(text.chars().skip(index + delete));
    out
}
