//! # Mutations
//!
//! The write surface of a [`Document`](crate::Document). A [`Transaction`]
//! is handed to the closure passed to `Document::change`; every method
//! validates its input before touching the tree so a failing call never
//! leaves half an edit behind.
//!
//! ## Semantics
//!
//! ### Structure
//! - Element nodes carry a tag, attributes and ordered children
//! - Value nodes carry text and never have children or attributes
//! - A document has at most one top-level element
//!
//! ### Delete
//! - Removes the node and its whole subtree
//!
//! ### Text
//! - `splice_value` is the primitive; `set_value` diffs old and new text and
//!   emits the smallest single splice, so concurrent edits elsewhere in the
//!   same value survive

use serde::Serialize;

use grove_crdt::{NodeKind, TreeDoc, TreeState, Value};

use crate::{EditorError, NodeId, ReadDocument};

/// Mutation handle scoped to one open transaction
pub struct Transaction<'a> {
    tree: &'a mut TreeDoc,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(tree: &'a mut TreeDoc) -> Self {
        Self { tree }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create the top-level element. Fails when the document already has one.
    pub fn create_root_node(&mut self, tag: &str) -> Result<NodeId, EditorError> {
        validate_tag(tag)?;
        let id = self.insert_node(None, 0, NodeKind::Element)?;
        self.tree.set_tag(&id, tag)?;
        Ok(id)
    }

    /// Append an element as the last child of `parent`
    pub fn add_element_child_node(
        &mut self,
        parent: &NodeId,
        tag: &str,
    ) -> Result<NodeId, EditorError> {
        validate_tag(tag)?;
        let index = self.require_element(parent)?;
        let id = self.insert_node(Some(*parent), index, NodeKind::Element)?;
        self.tree.set_tag(&id, tag)?;
        Ok(id)
    }

    /// Append a value node holding `text` as the last child of `parent`
    pub fn add_value_child_node(
        &mut self,
        parent: &NodeId,
        text: &str,
    ) -> Result<NodeId, EditorError> {
        let index = self.require_element(parent)?;
        let id = self.insert_node(Some(*parent), index, NodeKind::Value)?;
        self.tree.insert_text(&id, 0, text)?;
        Ok(id)
    }

    /// New element with `tag` right before `sibling`.
    /// `None` when `sibling` is the root and so has no siblings.
    pub fn add_sibling_before(
        &mut self,
        sibling: &NodeId,
        tag: &str,
    ) -> Result<Option<NodeId>, EditorError> {
        self.add_sibling(sibling, tag, 0)
    }

    /// New element with `tag` right after `sibling`.
    /// `None` when `sibling` is the root and so has no siblings.
    pub fn add_sibling_after(
        &mut self,
        sibling: &NodeId,
        tag: &str,
    ) -> Result<Option<NodeId>, EditorError> {
        self.add_sibling(sibling, tag, 1)
    }

    fn add_sibling(
        &mut self,
        sibling: &NodeId,
        tag: &str,
        offset: usize,
    ) -> Result<Option<NodeId>, EditorError> {
        validate_tag(tag)?;
        self.node(sibling)?;
        let Some(parent) = self.parent(sibling) else {
            return Ok(None);
        };
        let index = self.index_of(sibling).unwrap_or(0) + offset;
        let id = self.insert_node(Some(parent), index, NodeKind::Element)?;
        self.tree.set_tag(&id, tag)?;
        Ok(Some(id))
    }

    /// Low-level creation at an explicit position (`None` = top level).
    /// The new node has no tag, attributes or text yet.
    pub fn insert_node(
        &mut self,
        parent: Option<NodeId>,
        index: usize,
        kind: NodeKind,
    ) -> Result<NodeId, EditorError> {
        match parent {
            Some(parent) => {
                self.require_element(&parent)?;
            }
            None => {
                if self.root().is_some() {
                    return Err(EditorError::InvalidOperation(
                        "document already has a root node".to_string(),
                    ));
                }
                if kind == NodeKind::Value {
                    return Err(EditorError::InvalidOperation(
                        "the root node must be an element".to_string(),
                    ));
                }
            }
        }
        Ok(self.tree.create_node(parent, index, kind)?)
    }

    // ------------------------------------------------------------------
    // Element updates
    // ------------------------------------------------------------------

    /// Set (`Some`) or remove (`None`) an attribute on an element
    pub fn update_attribute(
        &mut self,
        id: &NodeId,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), EditorError> {
        if key.trim().is_empty() {
            return Err(EditorError::Validation(
                "attribute key cannot be empty".to_string(),
            ));
        }
        self.require_element(id)?;
        Ok(self.tree.set_attr(id, key, value)?)
    }

    /// Set an attribute from any serializable value. Values that do not
    /// serialize to JSON are rejected before anything is written.
    pub fn update_attribute_json<T: Serialize + ?Sized>(
        &mut self,
        id: &NodeId,
        key: &str,
        value: &T,
    ) -> Result<(), EditorError> {
        let value = serde_json::to_value(value).map_err(|e| {
            EditorError::Validation(format!("attribute {} is not serializable: {}", key, e))
        })?;
        self.update_attribute(id, key, Some(value))
    }

    pub fn update_tag(&mut self, id: &NodeId, tag: &str) -> Result<(), EditorError> {
        validate_tag(tag)?;
        self.require_element(id)?;
        Ok(self.tree.set_tag(id, tag)?)
    }

    // ------------------------------------------------------------------
    // Value updates
    // ------------------------------------------------------------------

    /// Delete `delete_count` characters at `index`, then insert `insert` there
    pub fn splice_value(
        &mut self,
        id: &NodeId,
        index: usize,
        delete_count: usize,
        insert: &str,
    ) -> Result<(), EditorError> {
        let length = self.require_value(id)?.chars().count();
        let in_bounds = index
            .checked_add(delete_count)
            .is_some_and(|end| end <= length);
        if !in_bounds {
            return Err(EditorError::InvalidOperation(format!(
                "splice of {} at {} out of bounds for value of length {}",
                delete_count, index, length
            )));
        }
        self.tree.delete_text(id, index, delete_count)?;
        self.tree.insert_text(id, index, insert)?;
        Ok(())
    }

    /// Replace the text of a value node through a minimal splice
    pub fn set_value(&mut self, id: &NodeId, text: &str) -> Result<(), EditorError> {
        let current = self.require_value(id)?;
        match compute_splice(&current, text) {
            Some(splice) => {
                self.splice_value(id, splice.index, splice.delete_count, &splice.insert)
            }
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Put a new `tag` element where `target` is and move `target` into it
    pub fn wrap_node(&mut self, target: &NodeId, tag: &str) -> Result<NodeId, EditorError> {
        validate_tag(tag)?;
        self.node(target)?;
        let parent = self.parent(target).ok_or_else(|| {
            EditorError::InvalidOperation("the root node cannot be wrapped".to_string())
        })?;
        let index = self.index_of(target).unwrap_or(0);
        let wrapper = self.tree.create_node(Some(parent), index, NodeKind::Element)?;
        self.tree.set_tag(&wrapper, tag)?;
        self.tree.move_node(target, Some(wrapper), 0)?;
        Ok(wrapper)
    }

    pub fn delete_node(&mut self, id: &NodeId) -> Result<(), EditorError> {
        Ok(self.tree.delete_node(id)?)
    }

    /// Move `id` to `index` among the children of `new_parent`
    pub fn move_node(
        &mut self,
        id: &NodeId,
        new_parent: &NodeId,
        index: usize,
    ) -> Result<(), EditorError> {
        self.node(id)?;
        self.require_element(new_parent)?;
        Ok(self.tree.move_node(id, Some(*new_parent), index)?)
    }

    /// Deep-copy `id` to `index` under `new_parent`. Each copied node
    /// remembers the node it was copied from.
    pub fn copy_node(
        &mut self,
        id: &NodeId,
        new_parent: &NodeId,
        index: usize,
    ) -> Result<NodeId, EditorError> {
        self.require_element(new_parent)?;
        self.node(id)?;
        // read from a frozen view so a copy into its own subtree terminates
        let snapshot = self.tree.state().clone();
        self.copy_from(&snapshot, id, new_parent, index)
    }

    fn copy_from(
        &mut self,
        snapshot: &TreeState,
        id: &NodeId,
        parent: &NodeId,
        index: usize,
    ) -> Result<NodeId, EditorError> {
        let data = snapshot.get_node(id).ok_or(EditorError::NotFound(*id))?;
        let copy = self
            .tree
            .create_node_from(Some(*parent), index, data.kind, Some(data.id))?;
        if let Some(tag) = &data.tag {
            self.tree.set_tag(&copy, tag)?;
        }
        for (key, value) in data.attrs {
            self.tree.set_attr(&copy, &key, Some(value))?;
        }
        self.tree.insert_text(&copy, 0, &data.text)?;
        for (position, child) in snapshot.children(id).iter().enumerate() {
            self.copy_from(snapshot, child, &copy, position)?;
        }
        Ok(copy)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Fails unless `id` is a visible element; returns its child count
    fn require_element(&self, id: &NodeId) -> Result<usize, EditorError> {
        match self.kind(id)? {
            NodeKind::Element => Ok(self.children(id).len()),
            NodeKind::Value => Err(EditorError::InvalidOperation(format!(
                "{} is a value node",
                id
            ))),
        }
    }

    /// Fails unless `id` is a visible value node; returns its text
    fn require_value(&self, id: &NodeId) -> Result<String, EditorError> {
        let node = self.node(id)?;
        match node.kind {
            NodeKind::Value => Ok(node.text),
            NodeKind::Element => Err(EditorError::InvalidOperation(format!(
                "{} is an element node",
                id
            ))),
        }
    }
}

impl ReadDocument for Transaction<'_> {
    fn tree_state(&self) -> &TreeState {
        self.tree.state()
    }
}

/// Tags are identifiers: a letter first, then letters, digits, `-`, `_`,
/// `:` or `.`
pub fn validate_tag(tag: &str) -> Result<(), EditorError> {
    let mut chars = tag.chars();
    let valid = match chars.next() {
        Some(first) if first.is_alphabetic() => {
            chars.all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(EditorError::Validation(format!("invalid tag name {:?}", tag)))
    }
}

/// One contiguous text replacement, in characters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpliceInfo {
    pub index: usize,
    pub delete_count: usize,
    pub insert: String,
}

/// Smallest single splice turning `old` into `new`, or `None` if equal
pub fn compute_splice(old: &str, new: &str) -> Option<SpliceInfo> {
    if old == new {
        return None;
    }
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();

    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    Some(SpliceInfo {
        index: prefix,
        delete_count: old.len() - prefix - suffix,
        insert: new[prefix..new.len() - suffix].iter().collect(),
    })
}
