//! # Materialized Tree State
//!
//! Plain read model of the visible tree. Loro stores the truth; a
//! `TreeState` is read back from it after imports and undo, patched in
//! place after local edits, and built from scratch for past versions.
//!
//! Every node hangs off a `LoroTree` node whose metadata map holds:
//!
//! | key      | content                                       |
//! |----------|-----------------------------------------------|
//! | `kind`   | `"element"` or `"value"`                      |
//! | `tag`    | element tag, last writer wins                 |
//! | `source` | id of the node this one was copied from       |
//! | `attrs`  | nested map, each attribute stored as JSON text |
//! | `text`   | nested `LoroText` (value nodes only)          |

use loro::{Container, LoroMap, LoroText, LoroTree, TreeParentId, ValueOrContainer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::{CrdtError, TreeId};

pub(crate) const KIND: &str = "kind";
pub(crate) const TAG: &str = "tag";
pub(crate) const SOURCE: &str = "source";
pub(crate) const ATTRS: &str = "attrs";
pub(crate) const TEXT: &str = "text";

/// Node variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Element,
    Value,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Element => "element",
            NodeKind::Value => "value",
        }
    }
}

/// Read-only view of one visible node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub id: TreeId,
    pub kind: NodeKind,
    pub tag: Option<String>,
    pub attrs: BTreeMap<String, Value>,
    pub text: String,
    pub source: Option<TreeId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeState {
    nodes: HashMap<TreeId, NodeData>,
    parents: HashMap<TreeId, Option<TreeId>>,
    /// Ordered children per parent; `None` holds the top level
    children: HashMap<Option<TreeId>, Vec<TreeId>>,
}

impl TreeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every visible node of `tree`
    pub(crate) fn read(tree: &LoroTree) -> Result<Self, CrdtError> {
        let mut state = Self::new();
        let mut queue = vec![None];
        while let Some(parent) = queue.pop() {
            let children = read_children(tree, parent);
            for child in &children {
                state.nodes.insert(*child, read_node(tree, *child)?);
                state.parents.insert(*child, parent);
                queue.push(Some(*child));
            }
            state.children.insert(parent, children);
        }
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn is_visible(&self, id: &TreeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get_node(&self, id: &TreeId) -> Option<NodeData> {
        self.nodes.get(id).cloned()
    }

    /// Borrowing variant of [`TreeState::get_node`]
    pub fn node(&self, id: &TreeId) -> Option<&NodeData> {
        self.nodes.get(id)
    }

    pub fn parent(&self, id: &TreeId) -> Option<TreeId> {
        self.parents.get(id).copied().flatten()
    }

    /// Visible children of `parent` (`None` = top-level nodes), in order
    pub fn children_of(&self, parent: Option<TreeId>) -> Vec<TreeId> {
        self.children.get(&parent).cloned().unwrap_or_default()
    }

    pub fn children(&self, id: &TreeId) -> Vec<TreeId> {
        if !self.is_visible(id) {
            return Vec::new();
        }
        self.children_of(Some(*id))
    }

    pub fn roots(&self) -> Vec<TreeId> {
        self.children_of(None)
    }

    /// Position of `id` among its parent's visible children
    pub fn index_of(&self, id: &TreeId) -> Option<usize> {
        let parent = self.parents.get(id)?;
        self.children.get(parent)?.iter().position(|child| child == id)
    }

    /// True when `target` is `parent` or one of its ancestors
    pub(crate) fn would_cycle(&self, target: TreeId, parent: Option<TreeId>) -> bool {
        let mut current = parent;
        while let Some(id) = current {
            if id == target {
                return true;
            }
            current = self.parent(&id);
        }
        false
    }

    /// Every visible node in depth-first pre-order
    pub fn visible_nodes(&self) -> Vec<TreeId> {
        let mut out = Vec::new();
        let mut stack: Vec<TreeId> = self.roots().into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children_of(Some(id)).into_iter().rev());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ------------------------------------------------------------------
    // Local patches
    // ------------------------------------------------------------------

    pub(crate) fn node_mut(&mut self, id: &TreeId) -> Option<&mut NodeData> {
        self.nodes.get_mut(id)
    }

    pub(crate) fn insert_node(&mut self, data: NodeData, parent: Option<TreeId>) {
        self.parents.insert(data.id, parent);
        self.children.entry(Some(data.id)).or_default();
        self.nodes.insert(data.id, data);
    }

    pub(crate) fn set_parent(&mut self, id: TreeId, parent: Option<TreeId>) {
        self.parents.insert(id, parent);
    }

    pub(crate) fn set_children(&mut self, parent: Option<TreeId>, children: Vec<TreeId>) {
        self.children.insert(parent, children);
    }

    /// Drop `id` and everything below it
    pub(crate) fn remove_subtree(&mut self, id: &TreeId) {
        if let Some(parent) = self.parents.get(id).copied() {
            if let Some(list) = self.children.get_mut(&parent) {
                list.retain(|child| child != id);
            }
        }
        let mut stack = vec![*id];
        while let Some(next) = stack.pop() {
            if let Some(children) = self.children.remove(&Some(next)) {
                stack.extend(children);
            }
            self.nodes.remove(&next);
            self.parents.remove(&next);
        }
    }
}

pub(crate) fn parent_id(parent: Option<TreeId>) -> TreeParentId {
    match parent {
        Some(id) => TreeParentId::Node(id.to_loro()),
        None => TreeParentId::Root,
    }
}

/// Live children of `parent` as Loro orders them
pub(crate) fn read_children(tree: &LoroTree, parent: Option<TreeId>) -> Vec<TreeId> {
    tree.children(parent_id(parent))
        .unwrap_or_default()
        .into_iter()
        .map(TreeId::from_loro)
        .collect()
}

pub(crate) fn read_node(tree: &LoroTree, id: TreeId) -> Result<NodeData, CrdtError> {
    let meta = tree.get_meta(id.to_loro())?;
    let kind = match read_string(&meta, KIND).as_deref() {
        Some("value") => NodeKind::Value,
        _ => NodeKind::Element,
    };
    Ok(NodeData {
        id,
        kind,
        tag: read_string(&meta, TAG),
        attrs: attrs_map(&meta).map(|map| read_attrs(&map)).unwrap_or_default(),
        text: text_container(&meta).map(|text| text.to_string()).unwrap_or_default(),
        source: read_string(&meta, SOURCE).and_then(|raw| raw.parse().ok()),
    })
}

fn read_string(map: &LoroMap, key: &str) -> Option<String> {
    match map.get(key)? {
        ValueOrContainer::Value(value) => value.as_string().map(|s| s.to_string()),
        ValueOrContainer::Container(_) => None,
    }
}

fn read_attrs(map: &LoroMap) -> BTreeMap<String, Value> {
    let mut attrs = BTreeMap::new();
    map.for_each(|key, value| {
        if let ValueOrContainer::Value(value) = value {
            let parsed = value
                .as_string()
                .and_then(|raw| serde_json::from_str::<Value>(raw.as_ref()).ok());
            match parsed {
                Some(parsed) => {
                    attrs.insert(key.to_string(), parsed);
                }
                None => tracing::debug!(key, "skipping attribute that is not JSON text"),
            }
        }
    });
    attrs
}

pub(crate) fn attrs_map(meta: &LoroMap) -> Option<LoroMap> {
    match meta.get(ATTRS) {
        Some(ValueOrContainer::Container(Container::Map(map))) => Some(map),
        _ => None,
    }
}

pub(crate) fn text_container(meta: &LoroMap) -> Option<LoroText> {
    match meta.get(TEXT) {
        Some(ValueOrContainer::Container(Container::Text(text))) => Some(text),
        _ => None,
    }
}
