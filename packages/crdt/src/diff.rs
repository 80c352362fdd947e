//! # Structural Diff
//!
//! Describes how to get from one version of the tree to another as an
//! ordered list of per-container changes:
//!
//! 1. `tree`: creates (pre-order of the target), moves, then deletes of
//!    the topmost vanished nodes. Indices are sequential: each change is
//!    relative to the tree with all earlier changes applied.
//! 2. `meta:<id>` / `attrs:<id>`: tag and attribute updates of nodes that
//!    exist on both sides.
//! 3. `text:<id>`: retain/delete/insert deltas of value text, aligned on
//!    the longest common subsequence of the two strings.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::{CrdtError, NodeKind, TreeDoc, TreeId, TreeState, VersionVector};

/// Identifies one container of the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerId {
    /// Parent/child structure
    Tree,
    /// Node metadata (the tag)
    Meta(TreeId),
    /// Node attributes
    Attrs(TreeId),
    /// Value text
    Text(TreeId),
}

impl ContainerId {
    /// Node that owns the container
    pub fn owner(&self) -> Option<TreeId> {
        match self {
            ContainerId::Tree => None,
            ContainerId::Meta(id) | ContainerId::Attrs(id) | ContainerId::Text(id) => Some(*id),
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerId::Tree => write!(f, "tree"),
            ContainerId::Meta(id) => write!(f, "meta:{}", id),
            ContainerId::Attrs(id) => write!(f, "attrs:{}", id),
            ContainerId::Text(id) => write!(f, "text:{}", id),
        }
    }
}

impl FromStr for ContainerId {
    type Err = CrdtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "tree" {
            return Ok(ContainerId::Tree);
        }
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| CrdtError::InvalidId(s.to_string()))?;
        let id: TreeId = id.parse()?;
        match kind {
            "meta" => Ok(ContainerId::Meta(id)),
            "attrs" => Ok(ContainerId::Attrs(id)),
            "text" => Ok(ContainerId::Text(id)),
            _ => Err(CrdtError::InvalidId(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TreeChange {
    Create {
        target: TreeId,
        parent: Option<TreeId>,
        index: usize,
        source: Option<TreeId>,
    },
    Move {
        target: TreeId,
        parent: Option<TreeId>,
        index: usize,
        old_parent: Option<TreeId>,
    },
    Delete {
        target: TreeId,
        old_parent: Option<TreeId>,
        old_index: usize,
    },
}

/// `value: None` means the key was removed
#[derive(Debug, Clone, PartialEq)]
pub struct MapChange {
    pub key: String,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextDelta {
    Retain(usize),
    Delete(usize),
    Insert(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    Tree(Vec<TreeChange>),
    Map(Vec<MapChange>),
    Text(Vec<TextDelta>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDiff {
    pub container: ContainerId,
    pub diff: Diff,
}

impl TreeDoc {
    /// Changes that turn the state at `from` into the state at `to`
    pub fn diff(
        &self,
        from: &VersionVector,
        to: &VersionVector,
    ) -> Result<Vec<ContainerDiff>, CrdtError> {
        let before = self.checkout(from)?;
        let after = self.checkout(to)?;
        Ok(diff_states(&before, &after))
    }
}

/// Diff two materialized states
pub fn diff_states(before: &TreeState, after: &TreeState) -> Vec<ContainerDiff> {
    let mut out = Vec::new();

    let tree = diff_tree(before, after);
    if !tree.is_empty() {
        out.push(ContainerDiff {
            container: ContainerId::Tree,
            diff: Diff::Tree(tree),
        });
    }

    for id in after.visible_nodes() {
        if !before.is_visible(&id) {
            continue;
        }
        let (Some(old), Some(new)) = (before.get_node(&id), after.get_node(&id)) else {
            continue;
        };

        if old.tag != new.tag {
            if let Some(tag) = new.tag.clone() {
                out.push(ContainerDiff {
                    container: ContainerId::Meta(id),
                    diff: Diff::Map(vec![MapChange {
                        key: "tag".to_string(),
                        value: Some(Value::String(tag)),
                    }]),
                });
            }
        }

        let keys: BTreeSet<&String> = old.attrs.keys().chain(new.attrs.keys()).collect();
        let changes: Vec<MapChange> = keys
            .into_iter()
            .filter(|key| old.attrs.get(*key) != new.attrs.get(*key))
            .map(|key| MapChange {
                key: key.clone(),
                value: new.attrs.get(key).cloned(),
            })
            .collect();
        if !changes.is_empty() {
            out.push(ContainerDiff {
                container: ContainerId::Attrs(id),
                diff: Diff::Map(changes),
            });
        }

        if new.kind == NodeKind::Value && old.text != new.text {
            let delta = diff_text(&old.text, &new.text);
            if !delta.is_empty() {
                out.push(ContainerDiff {
                    container: ContainerId::Text(id),
                    diff: Diff::Text(delta),
                });
            }
        }
    }

    out
}

/// Child lists as seen while replaying changes one after another
#[derive(Default)]
struct Simulation {
    parent: HashMap<TreeId, Option<TreeId>>,
    children: HashMap<Option<TreeId>, Vec<TreeId>>,
}

impl Simulation {
    fn from_state(state: &TreeState) -> Self {
        let mut sim = Simulation::default();
        sim.children.insert(None, state.roots());
        for id in state.roots() {
            sim.parent.insert(id, None);
        }
        for id in state.visible_nodes() {
            let kids = state.children(&id);
            for kid in &kids {
                sim.parent.insert(*kid, Some(id));
            }
            sim.children.insert(Some(id), kids);
        }
        sim
    }

    fn index_of(&self, id: &TreeId) -> Option<usize> {
        let parent = self.parent.get(id)?;
        self.children.get(parent)?.iter().position(|c| c == id)
    }

    fn remove(&mut self, id: &TreeId) {
        if let Some(parent) = self.parent.remove(id) {
            if let Some(list) = self.children.get_mut(&parent) {
                list.retain(|c| c != id);
            }
        }
    }

    fn insert(&mut self, parent: Option<TreeId>, index: usize, id: TreeId) {
        let list = self.children.entry(parent).or_default();
        let at = index.min(list.len());
        list.insert(at, id);
        self.parent.insert(id, parent);
    }
}

fn diff_tree(before: &TreeState, after: &TreeState) -> Vec<TreeChange> {
    let mut sim = Simulation::from_state(before);
    let mut changes = Vec::new();

    let parents = std::iter::once(None).chain(after.visible_nodes().into_iter().map(Some));
    for parent in parents {
        for (index, child) in after.children_of(parent).into_iter().enumerate() {
            match sim.parent.get(&child).copied() {
                None => {
                    let source = after.node(&child).and_then(|n| n.source);
                    changes.push(TreeChange::Create {
                        target: child,
                        parent,
                        index,
                        source,
                    });
                    sim.insert(parent, index, child);
                }
                Some(old_parent) => {
                    if old_parent != parent || sim.index_of(&child) != Some(index) {
                        changes.push(TreeChange::Move {
                            target: child,
                            parent,
                            index,
                            old_parent,
                        });
                        sim.remove(&child);
                        sim.insert(parent, index, child);
                    }
                }
            }
        }
    }

    for id in before.visible_nodes() {
        if after.is_visible(&id) {
            continue;
        }
        let Some(old_parent) = sim.parent.get(&id).copied() else {
            continue;
        };
        let parent_survives = old_parent.map_or(true, |p| after.is_visible(&p));
        if parent_survives {
            let old_index = sim.index_of(&id).unwrap_or(0);
            changes.push(TreeChange::Delete {
                target: id,
                old_parent,
                old_index,
            });
            sim.remove(&id);
        }
    }

    changes
}

/// Above this many LCS cells a changed run is replaced wholesale
const MAX_LCS_CELLS: usize = 1_000_000;

/// Character delta from `old` to `new`: common prefix and suffix are
/// retained, the middle is aligned by longest common subsequence.
fn diff_text(old: &str, new: &str) -> Vec<TextDelta> {
    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();
    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let a = &a[prefix..a.len() - suffix];
    let b = &b[prefix..b.len() - suffix];

    let mut delta = DeltaBuilder::default();
    delta.retain(prefix);
    if a.len().saturating_mul(b.len()) > MAX_LCS_CELLS {
        delta.delete(a.len());
        b.iter().for_each(|ch| delta.insert(*ch));
    } else {
        // lcs[i][j]: longest common subsequence of a[i..] and b[j..]
        let width = b.len() + 1;
        let mut lcs = vec![0u32; (a.len() + 1) * width];
        for i in (0..a.len()).rev() {
            for j in (0..b.len()).rev() {
                lcs[i * width + j] = if a[i] == b[j] {
                    lcs[(i + 1) * width + j + 1] + 1
                } else {
                    lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
                };
            }
        }
        let (mut i, mut j) = (0, 0);
        while i < a.len() || j < b.len() {
            if i < a.len() && j < b.len() && a[i] == b[j] {
                delta.retain(1);
                i += 1;
                j += 1;
            } else if j == b.len()
                || (i < a.len() && lcs[(i + 1) * width + j] >= lcs[i * width + j + 1])
            {
                delta.delete(1);
                i += 1;
            } else {
                delta.insert(b[j]);
                j += 1;
            }
        }
    }
    delta.finish()
}

/// Merges adjacent runs and keeps deletes ahead of inserts within a
/// changed run
#[derive(Default)]
struct DeltaBuilder {
    out: Vec<TextDelta>,
    deleted: usize,
    inserted: String,
}

impl DeltaBuilder {
    fn retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.flush();
        match self.out.last_mut() {
            Some(TextDelta::Retain(run)) => *run += n,
            _ => self.out.push(TextDelta::Retain(n)),
        }
    }

    fn delete(&mut self, n: usize) {
        self.deleted += n;
    }

    fn insert(&mut self, ch: char) {
        self.inserted.push(ch);
    }

    fn flush(&mut self) {
        if self.deleted > 0 {
            self.out.push(TextDelta::Delete(self.deleted));
            self.deleted = 0;
        }
        if !self.inserted.is_empty() {
            self.out.push(TextDelta::Insert(std::mem::take(&mut self.inserted)));
        }
    }

    fn finish(mut self) -> Vec<TextDelta> {
        self.flush();
        if matches!(self.out.last(), Some(TextDelta::Retain(_))) {
            self.out.pop();
        }
        self.out
    }
}
