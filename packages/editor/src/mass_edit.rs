//! Edits applied to every node of a generalized selection at once.
//!
//! All targets are edited inside the caller's transaction, so a failure on
//! any one of them rolls back the whole edit.

use serde::{Deserialize, Serialize};

use grove_crdt::Value;

use crate::{EditorError, NodeId, ReadDocument, SelectionInfo, Transaction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GeneralizedEdit {
    UpdateTag { tag: String },
    /// Wrap each node separately
    Wrap { tag: String },
    SetAttribute { key: String, value: Option<Value> },
    Delete,
}

/// Apply `edit` to every matching node. Returns the affected nodes; for
/// `Wrap` these are the new wrappers.
pub fn apply_generalized(
    tx: &mut Transaction<'_>,
    selection: &SelectionInfo,
    edit: &GeneralizedEdit,
) -> Result<Vec<NodeId>, EditorError> {
    let mut affected = Vec::with_capacity(selection.matching_node_ids.len());
    for id in &selection.matching_node_ids {
        match edit {
            GeneralizedEdit::UpdateTag { tag } => {
                tx.update_tag(id, tag)?;
                affected.push(*id);
            }
            GeneralizedEdit::Wrap { tag } => {
                affected.push(tx.wrap_node(id, tag)?);
            }
            GeneralizedEdit::SetAttribute { key, value } => {
                tx.update_attribute(id, key, value.clone())?;
                affected.push(*id);
            }
            GeneralizedEdit::Delete => {
                // already gone with a deleted ancestor
                if !tx.contains(id) {
                    continue;
                }
                tx.delete_node(id)?;
                affected.push(*id);
            }
        }
    }
    tracing::debug!(edit = ?edit, nodes = affected.len(), "applied generalized edit");
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{generalize_selection, Document};
    use serde_json::json;

    fn list() -> (Document, NodeId, Vec<NodeId>) {
        let mut doc = Document::with_peer(1);
        let (ul, items) = doc
            .change(|tx| {
                let root = tx.create_root_node("section")?;
                let ul = tx.add_element_child_node(&root, "ul")?;
                let mut items = Vec::new();
                for _ in 0..3 {
                    items.push(tx.add_element_child_node(&ul, "li")?);
                }
                Ok((ul, items))
            })
            .unwrap();
        (doc, ul, items)
    }

    #[test]
    fn test_update_tag_on_all_matches() {
        let (mut doc, _, items) = list();
        let selection = generalize_selection(&doc, &[items[0]]);
        let edit = GeneralizedEdit::UpdateTag { tag: "div".to_string() };

        let affected = doc.change(|tx| apply_generalized(tx, &selection, &edit)).unwrap();
        assert_eq!(affected, items);
        for id in &items {
            assert_eq!(doc.tag(id).unwrap().as_deref(), Some("div"));
        }
    }

    #[test]
    fn test_set_attribute_and_delete() {
        let (mut doc, ul, items) = list();
        let selection = generalize_selection(&doc, &items[..2]);

        let edit = GeneralizedEdit::SetAttribute {
            key: "class".to_string(),
            value: Some(json!("item")),
        };
        doc.change(|tx| apply_generalized(tx, &selection, &edit)).unwrap();
        assert_eq!(doc.attrs(&items[2]).unwrap()["class"], json!("item"));

        doc.change(|tx| apply_generalized(tx, &selection, &GeneralizedEdit::Delete))
            .unwrap();
        assert!(doc.children(&ul).is_empty());
    }

    #[test]
    fn test_failure_rolls_back_every_target() {
        let (mut doc, ul, items) = list();
        let mut selection = generalize_selection(&doc, &[items[0]]);
        // last target is unknown
        selection.matching_node_ids.push(NodeId::new(99, 0));
        let edit = GeneralizedEdit::UpdateTag { tag: "div".to_string() };

        let result = doc.change(|tx| apply_generalized(tx, &selection, &edit));
        assert!(matches!(result, Err(EditorError::NotFound(_))));
        for id in doc.children(&ul) {
            assert_eq!(doc.tag(&id).unwrap().as_deref(), Some("li"));
        }
    }
}
