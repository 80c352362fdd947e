//! # Selection Generalization
//!
//! Turns a handful of explicitly selected nodes into a selector over "all
//! nodes like these": find the lowest common ancestor, check whether the
//! selection is uniform in tag or in depth below that ancestor, and if so
//! collect every descendant matching the same criteria.
//!
//! A single selected node generalizes against its parent, so selecting one
//! list item selects the whole list. Mixed selections fall back to exactly
//! what was selected.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;

use grove_crdt::NodeKind;

use crate::{NodeId, ReadDocument};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionInfo {
    pub lca_id: Option<NodeId>,
    pub selector_tag: Option<String>,
    pub selector_depth: Option<usize>,
    pub selector_kind: Option<NodeKind>,
    /// Document order when generalized, selection order on fallback
    pub matching_node_ids: Vec<NodeId>,
}

impl SelectionInfo {
    pub fn is_empty(&self) -> bool {
        self.matching_node_ids.is_empty()
    }

    /// True when the selection was widened beyond the explicit nodes
    pub fn is_generalized(&self) -> bool {
        self.selector_tag.is_some() || self.selector_depth.is_some()
    }
}

/// Lowest common ancestor of `ids`. One node resolves to its parent (the
/// root to itself); unknown ids are ignored.
pub fn lowest_common_ancestor<D: ReadDocument>(doc: &D, ids: &[NodeId]) -> Option<NodeId> {
    let ids = known_unique(doc, ids);
    match ids.as_slice() {
        [] => None,
        [single] => Some(doc.parent(single).unwrap_or(*single)),
        [first, rest @ ..] => {
            let mut lca = *first;
            for id in rest {
                lca = pair_lca(doc, &lca, id)?;
            }
            Some(lca)
        }
    }
}

/// Self first, then each ancestor up to the root
fn chain<D: ReadDocument>(doc: &D, id: &NodeId) -> Vec<NodeId> {
    let mut out = vec![*id];
    out.extend(doc.ancestors(id));
    out
}

fn pair_lca<D: ReadDocument>(doc: &D, a: &NodeId, b: &NodeId) -> Option<NodeId> {
    let other: HashSet<NodeId> = chain(doc, b).into_iter().collect();
    chain(doc, a)
        .into_iter()
        .find(|id| other.contains(id))
        .or_else(|| doc.root())
}

fn known_unique<D: ReadDocument>(doc: &D, ids: &[NodeId]) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| {
            let known = doc.contains(id);
            if !known {
                tracing::debug!(node = %id, "ignoring unknown node in selection");
            }
            known && seen.insert(**id)
        })
        .copied()
        .collect()
}

/// Number of hops from `id` up to `ancestor`
fn depth_below<D: ReadDocument>(doc: &D, id: &NodeId, ancestor: &NodeId) -> Option<usize> {
    doc.ancestors(id)
        .iter()
        .position(|a| a == ancestor)
        .map(|p| p + 1)
}

pub fn generalize_selection<D: ReadDocument>(doc: &D, ids: &[NodeId]) -> SelectionInfo {
    let ids = known_unique(doc, ids);
    let Some(lca) = lowest_common_ancestor(doc, &ids) else {
        return SelectionInfo::default();
    };
    // matches are searched strictly below the ancestor, which would miss it
    if ids.contains(&lca) {
        return SelectionInfo {
            lca_id: Some(lca),
            matching_node_ids: ids,
            ..SelectionInfo::default()
        };
    }

    let mut tags: BTreeSet<String> = BTreeSet::new();
    let mut depths: BTreeSet<Option<usize>> = BTreeSet::new();
    let mut has_elements = false;
    let mut has_values = false;

    for id in &ids {
        let Ok(node) = doc.node(id) else {
            continue;
        };
        match node.kind {
            NodeKind::Element => {
                has_elements = true;
                if let Some(tag) = node.tag {
                    tags.insert(tag);
                }
            }
            NodeKind::Value => has_values = true,
        }
        depths.insert(depth_below(doc, id, &lca));
    }

    let selector_kind = match (has_elements, has_values) {
        (true, false) => Some(NodeKind::Element),
        (false, true) => Some(NodeKind::Value),
        _ => None,
    };
    let selector_tag = match (tags.len(), has_values) {
        (1, false) => tags.into_iter().next(),
        _ => None,
    };
    let selector_depth = match depths.len() {
        1 => depths.into_iter().next().flatten(),
        _ => None,
    };

    if selector_tag.is_none() && selector_depth.is_none() {
        tracing::debug!(
            selected = ids.len(),
            "selection not uniform, keeping explicit nodes"
        );
        return SelectionInfo {
            lca_id: Some(lca),
            matching_node_ids: ids,
            ..SelectionInfo::default()
        };
    }

    let mut matching = Vec::new();
    let mut stack: Vec<(NodeId, usize)> = doc
        .children(&lca)
        .into_iter()
        .rev()
        .map(|child| (child, 1))
        .collect();
    while let Some((id, depth)) = stack.pop() {
        if let Ok(node) = doc.node(&id) {
            let kind_ok = selector_kind.map_or(true, |kind| kind == node.kind);
            let tag_ok = selector_tag
                .as_ref()
                .map_or(true, |tag| node.tag.as_ref() == Some(tag));
            let depth_ok = selector_depth.map_or(true, |d| d == depth);
            if kind_ok && tag_ok && depth_ok {
                matching.push(id);
            }
        }
        if selector_depth.map_or(true, |d| depth < d) {
            stack.extend(
                doc.children(&id)
                    .into_iter()
                    .rev()
                    .map(|child| (child, depth + 1)),
            );
        }
    }

    SelectionInfo {
        lca_id: Some(lca),
        selector_tag,
        selector_depth,
        selector_kind,
        matching_node_ids: matching,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Document;

    /// section > [ul > [li > "A", li > "B", li > "C"], p > "D"]
    fn fixture() -> (Document, Vec<NodeId>) {
        let mut doc = Document::with_peer(1);
        let ids = doc
            .change(|tx| {
                let root = tx.create_root_node("section")?;
                let ul = tx.add_element_child_node(&root, "ul")?;
                let mut ids = vec![root, ul];
                for text in ["A", "B", "C"] {
                    let li = tx.add_element_child_node(&ul, "li")?;
                    let value = tx.add_value_child_node(&li, text)?;
                    ids.push(li);
                    ids.push(value);
                }
                let p = tx.add_element_child_node(&root, "p")?;
                let d = tx.add_value_child_node(&p, "D")?;
                ids.push(p);
                ids.push(d);
                Ok(ids)
            })
            .unwrap();
        (doc, ids)
    }

    #[test]
    fn test_empty_selection() {
        let (doc, _) = fixture();
        assert_eq!(generalize_selection(&doc, &[]), SelectionInfo::default());
        assert_eq!(lowest_common_ancestor(&doc, &[]), None);
    }

    #[test]
    fn test_lca() {
        let (doc, ids) = fixture();
        let (root, ul, li_a, a, li_b, d) = (ids[0], ids[1], ids[2], ids[3], ids[4], ids[9]);

        assert_eq!(lowest_common_ancestor(&doc, &[li_a]), Some(ul));
        assert_eq!(lowest_common_ancestor(&doc, &[root]), Some(root));
        assert_eq!(lowest_common_ancestor(&doc, &[li_a, li_b]), Some(ul));
        assert_eq!(lowest_common_ancestor(&doc, &[a, d]), Some(root));
        assert_eq!(lowest_common_ancestor(&doc, &[ul, a]), Some(ul));
    }

    #[test]
    fn test_single_element_selects_siblings_with_same_tag() {
        let (doc, ids) = fixture();
        let info = generalize_selection(&doc, &[ids[4]]);

        assert_eq!(info.lca_id, Some(ids[1]));
        assert_eq!(info.selector_tag.as_deref(), Some("li"));
        assert_eq!(info.matching_node_ids, vec![ids[2], ids[4], ids[6]]);
    }

    #[test]
    fn test_values_at_uniform_depth() {
        let (doc, ids) = fixture();
        // "A" and "B" both sit two levels below the list
        let info = generalize_selection(&doc, &[ids[3], ids[5]]);

        assert_eq!(info.lca_id, Some(ids[1]));
        assert_eq!(info.selector_tag, None);
        assert_eq!(info.selector_depth, Some(2));
        assert_eq!(info.selector_kind, Some(NodeKind::Value));
        assert_eq!(info.matching_node_ids, vec![ids[3], ids[5], ids[7]]);
    }

    #[test]
    fn test_mixed_selection_falls_back_to_explicit_nodes() {
        let (doc, ids) = fixture();
        // "A" is 3 levels below the root, p is 1; kinds and tags differ too
        let info = generalize_selection(&doc, &[ids[3], ids[8]]);

        assert_eq!(info.lca_id, Some(ids[0]));
        assert!(!info.is_generalized());
        assert_eq!(info.matching_node_ids, vec![ids[3], ids[8]]);
    }

    #[test]
    fn test_selecting_the_root_keeps_it() {
        let (doc, ids) = fixture();
        let info = generalize_selection(&doc, &[ids[0]]);

        assert_eq!(info.lca_id, Some(ids[0]));
        assert!(!info.is_generalized());
        assert_eq!(info.matching_node_ids, vec![ids[0]]);

        // an ancestor selected together with its descendant
        let info = generalize_selection(&doc, &[ids[1], ids[2]]);
        assert_eq!(info.matching_node_ids, vec![ids[1], ids[2]]);
    }

    #[test]
    fn test_unknown_and_duplicate_ids_ignored() {
        let (doc, ids) = fixture();
        let info = generalize_selection(&doc, &[ids[2], ids[2], NodeId::new(42, 0)]);
        assert_eq!(info.matching_node_ids.len(), 3);
    }
}
