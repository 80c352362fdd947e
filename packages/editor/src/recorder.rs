//! # Recorder / Replay
//!
//! Records structural edits relative to one start node so the same edit can
//! be replayed later against a different node.
//!
//! Concrete ids never appear in a script. The start node is `$0`, every node
//! created while recording gets the next variable (`$1`, `$2`, ...), and a
//! wrapper created around `$n` is named `w-$n` (or `$n_w` if that name is
//! already taken). Ids that were never bound are kept as absolute ids.
//!
//! ```rust
//! use grove_editor::{Document, NodeKind, ReadDocument, Recorder};
//!
//! let mut doc = Document::with_peer(1);
//! let (x, y) = doc
//!     .change(|tx| {
//!         let root = tx.create_root_node("main")?;
//!         Ok((tx.add_element_child_node(&root, "p")?, tx.add_element_child_node(&root, "p")?))
//!     })
//!     .unwrap();
//!
//! let mut recorder = Recorder::new(&x);
//! let value = doc.change(|tx| tx.add_value_child_node(&x, "X")).unwrap();
//! recorder.record_add_child(&x, &value, NodeKind::Value, "X");
//!
//! let script = recorder.finish();
//! script.replay(&mut doc, &y).unwrap();
//! assert_eq!(doc.text(&doc.children(&y)[0]).unwrap(), "X");
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use grove_crdt::NodeKind;

use crate::{Document, EditorError, NodeId, Transaction};

const START: &str = "$0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum RecordedAction {
    /// `content` is the tag for elements and the text for values
    #[serde(rename_all = "camelCase")]
    AddChild {
        parent: String,
        new_id: String,
        kind: NodeKind,
        content: String,
    },
    SetValue { target: String, value: String },
    #[serde(rename_all = "camelCase")]
    Wrap { target: String, wrapper_tag: String },
    #[serde(rename_all = "camelCase")]
    Rename { target: String, new_tag: String },
}

/// Builds a [`Script`] while the edits themselves are applied elsewhere
#[derive(Debug, Clone)]
pub struct Recorder {
    refs: HashMap<String, String>,
    next_var: usize,
    actions: Vec<RecordedAction>,
}

impl Recorder {
    pub fn new(start: &NodeId) -> Self {
        let mut refs = HashMap::new();
        refs.insert(start.to_string(), START.to_string());
        Self {
            refs,
            next_var: 1,
            actions: Vec::new(),
        }
    }

    /// Symbolic name for `id`, following the wrapper naming conventions
    pub fn get_ref(&self, id: &str) -> Option<String> {
        if let Some(name) = self.refs.get(id) {
            return Some(name.clone());
        }
        if let Some(target) = id.strip_prefix("w-") {
            return self.get_ref(target).map(|name| format!("w-{}", name));
        }
        if let Some(target) = id.strip_suffix("_w") {
            return self.get_ref(target).map(|name| format!("{}_w", name));
        }
        None
    }

    fn reference(&self, id: &NodeId) -> String {
        let raw = id.to_string();
        self.get_ref(&raw).unwrap_or(raw)
    }

    fn bind(&mut self, id: &NodeId) -> String {
        let name = format!("${}", self.next_var);
        self.next_var += 1;
        self.refs.insert(id.to_string(), name.clone());
        name
    }

    fn name_taken(&self, name: &str) -> bool {
        self.refs.values().any(|v| v == name)
    }

    pub fn record_add_child(
        &mut self,
        parent: &NodeId,
        new_id: &NodeId,
        kind: NodeKind,
        content: &str,
    ) {
        let parent = self.reference(parent);
        let new_id = self.bind(new_id);
        self.actions.push(RecordedAction::AddChild {
            parent,
            new_id,
            kind,
            content: content.to_string(),
        });
    }

    pub fn record_set_value(&mut self, target: &NodeId, value: &str) {
        let target = self.reference(target);
        self.actions.push(RecordedAction::SetValue {
            target,
            value: value.to_string(),
        });
    }

    /// `wrapper` is the node the wrap created
    pub fn record_wrap(&mut self, target: &NodeId, wrapper_tag: &str, wrapper: &NodeId) {
        let target = self.reference(target);
        let name = wrapper_name(&target, |name| self.name_taken(name));
        self.refs.insert(wrapper.to_string(), name);
        self.actions.push(RecordedAction::Wrap {
            target,
            wrapper_tag: wrapper_tag.to_string(),
        });
    }

    pub fn record_rename(&mut self, target: &NodeId, new_tag: &str) {
        let target = self.reference(target);
        self.actions.push(RecordedAction::Rename {
            target,
            new_tag: new_tag.to_string(),
        });
    }

    pub fn actions(&self) -> &[RecordedAction] {
        &self.actions
    }

    pub fn finish(self) -> Script {
        Script {
            actions: self.actions,
        }
    }
}

fn wrapper_name(target: &str, taken: impl Fn(&str) -> bool) -> String {
    let prefixed = format!("w-{}", target);
    if taken(&prefixed) {
        format!("{}_w", target)
    } else {
        prefixed
    }
}

/// A recorded edit, replayable against any start node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub actions: Vec<RecordedAction>,
}

impl Script {
    pub fn to_json(&self) -> Result<String, EditorError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, EditorError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Replay as one transaction. Returns the node bound to each variable.
    pub fn replay(
        &self,
        doc: &mut Document,
        start: &NodeId,
    ) -> Result<HashMap<String, NodeId>, EditorError> {
        doc.change(|tx| self.replay_in(tx, start))
    }

    /// Replay inside an already open transaction
    pub fn replay_in(
        &self,
        tx: &mut Transaction<'_>,
        start: &NodeId,
    ) -> Result<HashMap<String, NodeId>, EditorError> {
        let mut env = ReplayEnv::new(start);
        for action in &self.actions {
            match action {
                RecordedAction::AddChild {
                    parent,
                    new_id,
                    kind,
                    content,
                } => {
                    let parent = env.resolve(parent)?;
                    let id = match kind {
                        NodeKind::Element => tx.add_element_child_node(&parent, content)?,
                        NodeKind::Value => tx.add_value_child_node(&parent, content)?,
                    };
                    env.bindings.insert(new_id.clone(), id);
                }
                RecordedAction::SetValue { target, value } => {
                    tx.set_value(&env.resolve(target)?, value)?;
                }
                RecordedAction::Wrap { target, wrapper_tag } => {
                    let wrapper = tx.wrap_node(&env.resolve(target)?, wrapper_tag)?;
                    let name = wrapper_name(target, |name| env.bindings.contains_key(name));
                    env.bindings.insert(name, wrapper);
                }
                RecordedAction::Rename { target, new_tag } => {
                    tx.update_tag(&env.resolve(target)?, new_tag)?;
                }
            }
        }
        Ok(env.bindings)
    }
}

/// Variable bindings of one replay run
struct ReplayEnv {
    bindings: HashMap<String, NodeId>,
}

impl ReplayEnv {
    fn new(start: &NodeId) -> Self {
        let mut bindings = HashMap::new();
        bindings.insert(START.to_string(), *start);
        Self { bindings }
    }

    fn resolve(&self, name: &str) -> Result<NodeId, EditorError> {
        if let Some(id) = self.bindings.get(name) {
            return Ok(*id);
        }
        if name.starts_with('$') || name.starts_with("w-") || name.ends_with("_w") {
            return Err(EditorError::Validation(format!(
                "script refers to unbound variable {}",
                name
            )));
        }
        name.parse().map_err(|_| {
            EditorError::Validation(format!("invalid node reference {:?} in script", name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReadDocument;

    fn two_targets() -> (Document, NodeId, NodeId) {
        let mut doc = Document::with_peer(1);
        let (x, y) = doc
            .change(|tx| {
                let root = tx.create_root_node("main")?;
                let x = tx.add_element_child_node(&root, "div")?;
                let y = tx.add_element_child_node(&root, "div")?;
                Ok((x, y))
            })
            .unwrap();
        (doc, x, y)
    }

    #[test]
    fn test_get_ref_conventions() {
        let start = NodeId::new(1, 5);
        let recorder = Recorder::new(&start);
        assert_eq!(recorder.get_ref("5@1").as_deref(), Some("$0"));
        assert_eq!(recorder.get_ref("w-5@1").as_deref(), Some("w-$0"));
        assert_eq!(recorder.get_ref("5@1_w").as_deref(), Some("$0_w"));
        assert_eq!(recorder.get_ref("6@1"), None);
    }

    #[test]
    fn test_variables_are_sequential() {
        let (mut doc, x, _) = two_targets();
        let mut recorder = Recorder::new(&x);
        let (ul, li) = doc
            .change(|tx| {
                let ul = tx.add_element_child_node(&x, "ul")?;
                let li = tx.add_element_child_node(&ul, "li")?;
                Ok((ul, li))
            })
            .unwrap();
        recorder.record_add_child(&x, &ul, NodeKind::Element, "ul");
        recorder.record_add_child(&ul, &li, NodeKind::Element, "li");

        assert_eq!(
            recorder.actions()[1],
            RecordedAction::AddChild {
                parent: "$1".to_string(),
                new_id: "$2".to_string(),
                kind: NodeKind::Element,
                content: "li".to_string(),
            }
        );
    }

    #[test]
    fn test_replay_against_another_target() {
        let (mut doc, x, y) = two_targets();
        let mut recorder = Recorder::new(&x);

        let value = doc.change(|tx| tx.add_value_child_node(&x, "X")).unwrap();
        recorder.record_add_child(&x, &value, NodeKind::Value, "X");
        let wrapper = doc.change(|tx| tx.wrap_node(&value, "em")).unwrap();
        recorder.record_wrap(&value, "em", &wrapper);
        doc.change(|tx| tx.update_tag(&wrapper, "strong")).unwrap();
        recorder.record_rename(&wrapper, "strong");
        doc.change(|tx| tx.set_value(&value, "XY")).unwrap();
        recorder.record_set_value(&value, "XY");

        let script = recorder.finish();
        let bindings = script.replay(&mut doc, &y).unwrap();

        let strong = doc.children(&y)[0];
        assert_eq!(bindings["w-$1"], strong);
        assert_eq!(doc.tag(&strong).unwrap().as_deref(), Some("strong"));
        let copied = doc.children(&strong)[0];
        assert_eq!(doc.text(&copied).unwrap(), "XY");
        assert_ne!(copied, value);
    }

    #[test]
    fn test_wrapping_twice_uses_suffix() {
        let (mut doc, x, y) = two_targets();
        let mut recorder = Recorder::new(&x);

        let inner = doc.change(|tx| tx.wrap_node(&x, "section")).unwrap();
        recorder.record_wrap(&x, "section", &inner);
        let outer = doc.change(|tx| tx.wrap_node(&x, "article")).unwrap();
        recorder.record_wrap(&x, "article", &outer);
        doc.change(|tx| tx.update_tag(&outer, "aside")).unwrap();
        recorder.record_rename(&outer, "aside");

        assert_eq!(recorder.get_ref(&inner.to_string()).as_deref(), Some("w-$0"));
        assert_eq!(recorder.get_ref(&outer.to_string()).as_deref(), Some("$0_w"));

        let bindings = recorder.finish().replay(&mut doc, &y).unwrap();
        assert_eq!(doc.parent(&y), Some(bindings["$0_w"]));
        assert_eq!(doc.tag(&bindings["$0_w"]).unwrap().as_deref(), Some("aside"));
    }

    #[test]
    fn test_replays_are_independent() {
        let (mut doc, x, y) = two_targets();
        let mut recorder = Recorder::new(&x);
        let value = doc.change(|tx| tx.add_value_child_node(&x, "X")).unwrap();
        recorder.record_add_child(&x, &value, NodeKind::Value, "X");
        let script = recorder.finish();

        let first = script.replay(&mut doc, &y).unwrap();
        let second = script.replay(&mut doc, &y).unwrap();
        assert_ne!(first["$1"], second["$1"]);
        assert_eq!(doc.children(&y).len(), 2);
    }

    #[test]
    fn test_failed_replay_is_atomic() {
        let (mut doc, x, y) = two_targets();
        let script = Script {
            actions: vec![
                RecordedAction::AddChild {
                    parent: "$0".to_string(),
                    new_id: "$1".to_string(),
                    kind: NodeKind::Element,
                    content: "p".to_string(),
                },
                RecordedAction::Rename {
                    target: "$7".to_string(),
                    new_tag: "p".to_string(),
                },
            ],
        };
        let result = script.replay(&mut doc, &y);
        assert!(matches!(result, Err(EditorError::Validation(_))));
        assert!(doc.children(&y).is_empty());
        assert!(doc.children(&x).is_empty());
    }

    #[test]
    fn test_script_json() {
        let script = Script {
            actions: vec![RecordedAction::Wrap {
                target: "$0".to_string(),
                wrapper_tag: "li".to_string(),
            }],
        };
        let json = script.to_json().unwrap();
        assert_eq!(json, r#"{"actions":[{"action":"wrap","target":"$0","wrapperTag":"li"}]}"#);
        assert_eq!(Script::from_json(&json).unwrap(), script);
    }
}
