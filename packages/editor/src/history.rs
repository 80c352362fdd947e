//! # History Translation
//!
//! Converts the difference between two versions of a document into a flat
//! list of path-addressed patches that can be inspected, sent somewhere
//! else, or replayed onto another copy of the earlier version.
//!
//! ## Paths
//!
//! | Target                  | Path                              |
//! |-------------------------|-----------------------------------|
//! | child slot              | `[parent, "children", index]`     |
//! | top-level slot          | `["children", index]`             |
//! | node (delete / move)    | `[node]`                          |
//! | tag                     | `[node, "tag"]`                   |
//! | attribute               | `[node, "attrs", key]`            |
//! | text cursor             | `[node, "text", index]`           |
//!
//! Node ids are rendered as `counter@peer`. Patches are ordered so that
//! applying them one after another to the `from` version reproduces the
//! `to` version.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use grove_crdt::{
    ContainerDiff, ContainerId, Diff, NodeKind, TextDelta, TreeChange, TreeState, Value,
    VersionVector,
};

use crate::{Document, EditorError, NodeId, ReadDocument, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchAction {
    Put,
    Del,
    Insert,
    Splice,
    Inc,
    Move,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathKey {
    Index(usize),
    Key(String),
}

impl From<&str> for PathKey {
    fn from(key: &str) -> Self {
        PathKey::Key(key.to_string())
    }
}

impl From<NodeId> for PathKey {
    fn from(id: NodeId) -> Self {
        PathKey::Key(id.to_string())
    }
}

impl From<usize> for PathKey {
    fn from(index: usize) -> Self {
        PathKey::Index(index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralizedPatch {
    pub action: PatchAction,
    pub path: Vec<PathKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

impl GeneralizedPatch {
    fn new(action: PatchAction, path: Vec<PathKey>) -> Self {
        Self {
            action,
            path,
            value: None,
            length: None,
        }
    }

    fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    fn with_length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }
}

/// Patches turning the document at `from` into the document at `to`
pub fn patches_between(
    doc: &Document,
    from: &VersionVector,
    to: &VersionVector,
) -> Result<Vec<GeneralizedPatch>, EditorError> {
    let diff = doc.tree().diff(from, to)?;
    let after = doc.tree().checkout(to)?;
    Ok(translate_diff(&diff, &after))
}

/// Node a container belongs to, if that node still exists in `after`
pub fn resolve_container(container: &ContainerId, after: &TreeState) -> Option<NodeId> {
    container.owner().filter(|id| after.is_visible(id))
}

/// Translate substrate diffs. `after` is the state the diff leads to; it
/// supplies the content of created nodes.
pub fn translate_diff(diffs: &[ContainerDiff], after: &TreeState) -> Vec<GeneralizedPatch> {
    let mut patches = Vec::new();
    for entry in diffs {
        match (&entry.container, &entry.diff) {
            (ContainerId::Tree, Diff::Tree(changes)) => {
                for change in changes {
                    translate_tree_change(change, after, &mut patches);
                }
            }
            (container, diff) => {
                let Some(owner) = resolve_container(container, after) else {
                    tracing::debug!(
                        container = %container,
                        "dropping diff for unresolvable container"
                    );
                    continue;
                };
                match (container, diff) {
                    (ContainerId::Meta(_), Diff::Map(changes)) => {
                        for change in changes {
                            let path = vec![owner.into(), change.key.as_str().into()];
                            patches.push(map_patch(path, change.value.clone()));
                        }
                    }
                    (ContainerId::Attrs(_), Diff::Map(changes)) => {
                        for change in changes {
                            let path =
                                vec![owner.into(), "attrs".into(), change.key.as_str().into()];
                            patches.push(map_patch(path, change.value.clone()));
                        }
                    }
                    (ContainerId::Text(_), Diff::Text(delta)) => {
                        translate_text(owner, delta, &mut patches);
                    }
                    _ => {
                        tracing::debug!(
                            container = %container,
                            "dropping diff of unexpected shape"
                        );
                    }
                }
            }
        }
    }
    patches
}

fn map_patch(path: Vec<PathKey>, value: Option<Value>) -> GeneralizedPatch {
    match value {
        Some(value) => GeneralizedPatch::new(PatchAction::Put, path).with_value(value),
        None => GeneralizedPatch::new(PatchAction::Del, path),
    }
}

fn slot_path(parent: Option<NodeId>, index: usize) -> Vec<PathKey> {
    let mut path = Vec::with_capacity(3);
    if let Some(parent) = parent {
        path.push(parent.into());
    }
    path.push("children".into());
    path.push(index.into());
    path
}

fn translate_tree_change(
    change: &TreeChange,
    after: &TreeState,
    patches: &mut Vec<GeneralizedPatch>,
) {
    match change {
        TreeChange::Create {
            target,
            parent,
            index,
            source,
        } => {
            let Some(node) = after.get_node(target) else {
                tracing::debug!(node = %target, "created node missing from target state");
                return;
            };
            let snapshot = json!({
                "id": target.to_string(),
                "kind": node.kind,
                "tag": node.tag,
                "attrs": node.attrs,
                "text": node.text,
                "sourceId": source.map(|s| s.to_string()),
            });
            patches.push(
                GeneralizedPatch::new(PatchAction::Insert, slot_path(*parent, *index))
                    .with_value(snapshot),
            );
        }
        TreeChange::Move {
            target,
            parent,
            index,
            ..
        } => {
            let destination = json!({
                "parent": parent.map(|p| p.to_string()),
                "index": index,
            });
            patches.push(
                GeneralizedPatch::new(PatchAction::Move, vec![(*target).into()])
                    .with_value(destination),
            );
        }
        TreeChange::Delete { target, .. } => {
            patches.push(GeneralizedPatch::new(PatchAction::Del, vec![(*target).into()]));
        }
    }
}

fn translate_text(owner: NodeId, delta: &[TextDelta], patches: &mut Vec<GeneralizedPatch>) {
    let mut cursor: usize = 0;
    for op in delta {
        match op {
            TextDelta::Retain(n) => cursor += *n,
            TextDelta::Delete(n) => {
                let path = vec![owner.into(), "text".into(), cursor.into()];
                patches.push(
                    GeneralizedPatch::new(PatchAction::Splice, path)
                        .with_value(Value::String(String::new()))
                        .with_length(*n),
                );
            }
            TextDelta::Insert(text) => {
                let path = vec![owner.into(), "text".into(), cursor.into()];
                patches.push(
                    GeneralizedPatch::new(PatchAction::Splice, path)
                        .with_value(Value::String(text.clone()))
                        .with_length(0),
                );
                cursor += text.chars().count();
            }
        }
    }
}

// ----------------------------------------------------------------------
// Replay
// ----------------------------------------------------------------------

/// Apply patches inside an open transaction.
///
/// Ids of nodes created by `insert` patches are remapped: later patches
/// naming the original id are redirected to the new node. Returns that
/// mapping (original id to replayed id).
pub fn apply_patches(
    tx: &mut Transaction<'_>,
    patches: &[GeneralizedPatch],
) -> Result<HashMap<NodeId, NodeId>, EditorError> {
    let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
    for patch in patches {
        apply_patch(tx, patch, &mut remap)?;
    }
    Ok(remap)
}

fn apply_patch(
    tx: &mut Transaction<'_>,
    patch: &GeneralizedPatch,
    remap: &mut HashMap<NodeId, NodeId>,
) -> Result<(), EditorError> {
    let path = patch.path.as_slice();
    match (patch.action, path) {
        (PatchAction::Insert, [PathKey::Key(children), PathKey::Index(index)])
            if children == "children" =>
        {
            insert_snapshot(tx, None, *index, patch, remap)
        }
        (PatchAction::Insert, [parent, PathKey::Key(children), PathKey::Index(index)])
            if children == "children" =>
        {
            let parent = node_key(parent, remap)?;
            insert_snapshot(tx, Some(parent), *index, patch, remap)
        }
        (PatchAction::Del, [node]) => tx.delete_node(&node_key(node, remap)?),
        (PatchAction::Move, [node]) => {
            let node = node_key(node, remap)?;
            let value = required_value(patch)?;
            let parent = value
                .get("parent")
                .and_then(Value::as_str)
                .map(|p| resolve_id(p, remap))
                .transpose()?
                .ok_or_else(|| malformed(patch, "move needs a parent"))?;
            let index = value
                .get("index")
                .and_then(Value::as_u64)
                .ok_or_else(|| malformed(patch, "move needs an index"))?;
            tx.move_node(&node, &parent, index as usize)
        }
        (PatchAction::Put, [node, PathKey::Key(tag)]) if tag == "tag" => {
            let tag = required_value(patch)?
                .as_str()
                .ok_or_else(|| malformed(patch, "tag must be a string"))?;
            tx.update_tag(&node_key(node, remap)?, tag)
        }
        (PatchAction::Put, [node, PathKey::Key(attrs), PathKey::Key(key)]) if attrs == "attrs" => {
            let value = required_value(patch)?.clone();
            tx.update_attribute(&node_key(node, remap)?, key, Some(value))
        }
        (PatchAction::Del, [node, PathKey::Key(attrs), PathKey::Key(key)]) if attrs == "attrs" => {
            tx.update_attribute(&node_key(node, remap)?, key, None)
        }
        (PatchAction::Inc, [node, PathKey::Key(attrs), PathKey::Key(key)]) if attrs == "attrs" => {
            let node = node_key(node, remap)?;
            let delta = required_value(patch)?;
            if !delta.is_number() {
                return Err(malformed(patch, "inc needs a number"));
            }
            let current = tx
                .attrs(&node)?
                .get(key.as_str())
                .cloned()
                .unwrap_or_else(|| json!(0));
            tx.update_attribute(&node, key, Some(increment(&current, delta)))
        }
        (PatchAction::Splice, [node, PathKey::Key(text), PathKey::Index(index)])
            if text == "text" =>
        {
            let insert = match &patch.value {
                Some(Value::String(s)) => s.as_str(),
                None => "",
                Some(_) => return Err(malformed(patch, "splice value must be a string")),
            };
            let length = patch.length.unwrap_or(0);
            tx.splice_value(&node_key(node, remap)?, *index, length, insert)
        }
        _ => Err(malformed(patch, "unsupported action/path combination")),
    }
}

fn insert_snapshot(
    tx: &mut Transaction<'_>,
    parent: Option<NodeId>,
    index: usize,
    patch: &GeneralizedPatch,
    remap: &mut HashMap<NodeId, NodeId>,
) -> Result<(), EditorError> {
    let snapshot = required_value(patch)?;
    let kind: NodeKind = snapshot
        .get("kind")
        .cloned()
        .map(serde_json::from_value::<NodeKind>)
        .transpose()?
        .ok_or_else(|| malformed(patch, "insert needs a node kind"))?;

    let id = tx.insert_node(parent, index, kind)?;
    if let Some(tag) = snapshot.get("tag").and_then(Value::as_str) {
        tx.update_tag(&id, tag)?;
    }
    if let Some(attrs) = snapshot.get("attrs").and_then(Value::as_object) {
        for (key, value) in attrs {
            tx.update_attribute(&id, key, Some(value.clone()))?;
        }
    }
    if kind == NodeKind::Value {
        if let Some(text) = snapshot.get("text").and_then(Value::as_str) {
            tx.splice_value(&id, 0, 0, text)?;
        }
    }
    if let Some(original) = snapshot.get("id").and_then(Value::as_str) {
        remap.insert(parse_id(original)?, id);
    }
    Ok(())
}

/// Integers stay integers unless the sum overflows; anything else is
/// summed as a float
fn increment(current: &Value, delta: &Value) -> Value {
    if let (Some(a), Some(b)) = (current.as_i64(), delta.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return json!(sum);
        }
    }
    let a = current.as_f64().unwrap_or(0.0);
    let b = delta.as_f64().unwrap_or(0.0);
    json!(a + b)
}

fn required_value(patch: &GeneralizedPatch) -> Result<&Value, EditorError> {
    patch
        .value
        .as_ref()
        .ok_or_else(|| malformed(patch, "missing value"))
}

fn node_key(key: &PathKey, remap: &HashMap<NodeId, NodeId>) -> Result<NodeId, EditorError> {
    match key {
        PathKey::Key(id) => resolve_id(id, remap),
        PathKey::Index(index) => Err(EditorError::Validation(format!(
            "expected a node id in patch path, got index {}",
            index
        ))),
    }
}

fn resolve_id(raw: &str, remap: &HashMap<NodeId, NodeId>) -> Result<NodeId, EditorError> {
    let id = parse_id(raw)?;
    Ok(remap.get(&id).copied().unwrap_or(id))
}

fn parse_id(raw: &str) -> Result<NodeId, EditorError> {
    raw.parse()
        .map_err(|_| EditorError::Validation(format!("invalid node id {:?} in patch", raw)))
}

fn malformed(patch: &GeneralizedPatch, reason: &str) -> EditorError {
    EditorError::Validation(format!(
        "malformed {:?} patch at {:?}: {}",
        patch.action, patch.path, reason
    ))
}
