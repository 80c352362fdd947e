//! Integration tests for editor crate

use grove_editor::{
    apply_generalized, apply_patches, generalize_selection, patches_between, Document, EditorError,
    GeneralizedEdit, NodeId, NodeKind, ReadDocument, Recorder, UndoStack, Value,
};
use serde_json::json;

fn sync(from: &Document, to: &mut Document) {
    let bytes = from.export_updates(to.version()).unwrap();
    to.import(&bytes).unwrap();
}

/// Visible structure without ids
fn shape(doc: &Document) -> Value {
    fn strip(value: &mut Value) {
        if let Value::Object(map) = value {
            map.remove("id");
            if let Some(Value::Array(children)) = map.get_mut("children") {
                children.iter_mut().for_each(strip);
            }
        }
    }
    let mut json = doc.to_json();
    strip(&mut json);
    json
}

#[test]
fn test_n_undos_then_n_redos() {
    let mut doc = Document::with_peer(1);
    let mut stack = UndoStack::new();
    let root = doc.change(|tx| tx.create_root_node("section")).unwrap();
    let original = doc.to_json();

    let list = stack
        .change(&mut doc, |tx| tx.add_element_child_node(&root, "ul"))
        .unwrap();
    let item = stack
        .change(&mut doc, |tx| tx.add_value_child_node(&list, "Hello"))
        .unwrap();
    stack
        .change(&mut doc, |tx| tx.set_value(&item, "Hello World"))
        .unwrap();
    stack
        .change(&mut doc, |tx| tx.update_attribute(&root, "class", Some(json!("hero"))))
        .unwrap();
    stack.change(&mut doc, |tx| tx.update_tag(&list, "ol")).unwrap();
    stack.change(&mut doc, |tx| tx.wrap_node(&item, "li")).unwrap();
    let edited = doc.to_json();

    let n = stack.undo_levels();
    assert_eq!(n, 6);
    for _ in 0..n {
        assert!(stack.undo(&mut doc).unwrap());
    }
    assert_eq!(doc.to_json(), original);

    for _ in 0..n {
        assert!(stack.redo(&mut doc).unwrap());
    }
    assert_eq!(doc.to_json(), edited);
}

#[test]
fn test_undoing_every_tag_edit_restores_the_first_tag() {
    let mut doc = Document::with_peer(1);
    let mut stack = UndoStack::new();
    let root = doc.change(|tx| tx.create_root_node("a")).unwrap();

    stack.change(&mut doc, |tx| tx.update_tag(&root, "b")).unwrap();
    stack.change(&mut doc, |tx| tx.update_tag(&root, "c")).unwrap();
    assert!(stack.undo(&mut doc).unwrap());
    assert!(stack.undo(&mut doc).unwrap());

    assert_eq!(doc.tag(&root).unwrap().as_deref(), Some("a"));
}

#[test]
fn test_undoing_add_then_delete_leaves_no_children() {
    let mut doc = Document::with_peer(1);
    let mut stack = UndoStack::new();
    let root = doc.change(|tx| tx.create_root_node("section")).unwrap();

    let child = stack
        .change(&mut doc, |tx| tx.add_element_child_node(&root, "p"))
        .unwrap();
    stack.change(&mut doc, |tx| tx.delete_node(&child)).unwrap();
    assert!(doc.children(&root).is_empty());

    assert!(stack.undo(&mut doc).unwrap());
    assert_eq!(doc.children(&root), vec![child]);
    assert!(stack.undo(&mut doc).unwrap());
    assert!(doc.children(&root).is_empty());

    assert!(stack.redo(&mut doc).unwrap());
    assert_eq!(doc.children(&root), vec![child]);
    assert!(stack.redo(&mut doc).unwrap());
    assert!(doc.children(&root).is_empty());
}

#[test]
fn test_repeated_attribute_edits_undo_step_by_step() {
    let mut doc = Document::with_peer(1);
    let mut stack = UndoStack::new();
    let root = doc.change(|tx| tx.create_root_node("div")).unwrap();

    for n in 1..=5 {
        stack
            .change(&mut doc, |tx| tx.update_attribute(&root, "n", Some(json!(n))))
            .unwrap();
    }
    for expected in (1..5).rev() {
        assert!(stack.undo(&mut doc).unwrap());
        assert_eq!(doc.attrs(&root).unwrap().get("n"), Some(&json!(expected)));
    }
    assert!(stack.undo(&mut doc).unwrap());
    assert!(doc.attrs(&root).unwrap().is_empty());
    assert!(!stack.can_undo());

    for expected in 1..=5 {
        assert!(stack.redo(&mut doc).unwrap());
        assert_eq!(doc.attrs(&root).unwrap().get("n"), Some(&json!(expected)));
    }
}

#[test]
fn test_undo_keeps_concurrent_remote_edit() {
    let mut a = Document::with_peer(1);
    let mut b = Document::with_peer(2);
    let root = a.change(|tx| tx.create_root_node("section")).unwrap();
    sync(&a, &mut b);

    let mut stack = UndoStack::new();
    let local = stack
        .change(&mut a, |tx| {
            tx.update_attribute(&root, "class", Some(json!("local")))?;
            tx.add_element_child_node(&root, "h1")
        })
        .unwrap();

    let remote = b
        .change(|tx| {
            tx.update_attribute(&root, "title", Some(json!("remote")))?;
            tx.add_value_child_node(&root, "from b")
        })
        .unwrap();

    sync(&b, &mut a);
    sync(&a, &mut b);
    stack.undo(&mut a).unwrap();
    sync(&a, &mut b);

    for doc in [&a, &b] {
        assert!(!doc.contains(&local));
        assert_eq!(doc.children(&root), vec![remote]);
        let attrs = doc.attrs(&root).unwrap();
        assert_eq!(attrs.get("title"), Some(&json!("remote")));
        assert!(!attrs.contains_key("class"));
    }
    assert_eq!(a.to_json(), b.to_json());
}

#[test]
fn test_transaction_undoes_atomically() {
    let mut doc = Document::with_peer(1);
    let mut stack = UndoStack::new();
    let root = doc.change(|tx| tx.create_root_node("ul")).unwrap();

    stack
        .transaction(&mut doc, |doc| {
            for text in ["one", "two", "three"] {
                doc.change(|tx| {
                    let li = tx.add_element_child_node(&root, "li")?;
                    tx.add_value_child_node(&li, text)
                })?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(doc.children(&root).len(), 3);
    assert_eq!(stack.undo_levels(), 1);

    stack.undo(&mut doc).unwrap();
    assert!(doc.children(&root).is_empty());
    assert!(!stack.can_undo());
}

#[test]
fn test_selection_generalizes_value_siblings() {
    let mut doc = Document::with_peer(1);
    let (parent, values) = doc
        .change(|tx| {
            let parent = tx.create_root_node("p")?;
            let values = ["a", "b", "c"]
                .iter()
                .map(|text| tx.add_value_child_node(&parent, text))
                .collect::<Result<Vec<NodeId>, EditorError>>()?;
            Ok((parent, values))
        })
        .unwrap();

    let two = generalize_selection(&doc, &values[..2]);
    assert_eq!(two.lca_id, Some(parent));
    assert_eq!(two.matching_node_ids, values);

    let one = generalize_selection(&doc, &values[1..2]);
    assert_eq!(one.lca_id, Some(parent));
    assert_eq!(one.selector_kind, Some(NodeKind::Value));
    assert_eq!(one.matching_node_ids, values);
}

#[test]
fn test_history_round_trip() -> anyhow::Result<()> {
    let mut doc = Document::with_peer(1);
    let (root, intro, list) = doc
        .change(|tx| {
            let root = tx.create_root_node("article")?;
            let intro = tx.add_value_child_node(&root, "Intro text")?;
            let list = tx.add_element_child_node(&root, "ul")?;
            for text in ["a", "b", "c"] {
                let li = tx.add_element_child_node(&list, "li")?;
                tx.add_value_child_node(&li, text)?;
            }
            Ok((root, intro, list))
        })?;
    let v0 = doc.version().clone();
    let base = doc.export_snapshot()?;

    let items = doc.children(&list);
    doc.change(|tx| {
        tx.set_value(&intro, "Introductory text!")?;
        tx.delete_node(&items[1])?;
        tx.move_node(&items[2], &list, 0)?;
        tx.update_attribute(&items[0], "class", Some(json!("first")))?;
        let aside = tx.add_sibling_after(&list, "aside")?;
        if let Some(aside) = aside {
            tx.copy_node(&items[0], &aside, 0)?;
        }
        tx.wrap_node(&intro, "header")?;
        tx.update_tag(&root, "main")
    })?;

    let patches = patches_between(&doc, &v0, doc.version())?;
    assert!(!patches.is_empty());

    // patches survive a trip through JSON
    let wire = serde_json::to_string(&patches)?;
    let patches: Vec<grove_editor::GeneralizedPatch> = serde_json::from_str(&wire)?;

    let mut replica = Document::from_snapshot(2, &base)?;
    replica.change(|tx| apply_patches(tx, &patches))?;
    assert_eq!(shape(&replica), shape(&doc));
    Ok(())
}

#[test]
fn test_recorded_add_child_replays_under_other_node() {
    let mut doc = Document::with_peer(1);
    let (x, y) = doc
        .change(|tx| {
            let root = tx.create_root_node("main")?;
            let x = tx.add_element_child_node(&root, "div")?;
            let y = tx.add_element_child_node(&root, "div")?;
            Ok((x, y))
        })
        .unwrap();

    let mut recorder = Recorder::new(&x);
    let value = doc.change(|tx| tx.add_value_child_node(&x, "X")).unwrap();
    recorder.record_add_child(&x, &value, NodeKind::Value, "X");
    let script = recorder.finish();

    // scripts are stored as JSON and replayed later
    let script = grove_editor::Script::from_json(&script.to_json().unwrap()).unwrap();
    script.replay(&mut doc, &y).unwrap();

    let children = doc.children(&y);
    assert_eq!(children.len(), 1);
    assert_eq!(doc.kind(&children[0]).unwrap(), NodeKind::Value);
    assert_eq!(doc.text(&children[0]).unwrap(), "X");
    assert_eq!(doc.children(&x), vec![value]);
}

#[test]
fn test_section_list_scenario() {
    let mut doc = Document::with_peer(1);
    let root = doc.change(|tx| tx.create_root_node("section")).unwrap();
    assert!(doc.children(&root).is_empty());

    let ul = doc.change(|tx| tx.add_element_child_node(&root, "ul")).unwrap();
    let hello = doc.change(|tx| tx.add_value_child_node(&ul, "Hello")).unwrap();
    let world = doc.change(|tx| tx.add_value_child_node(&ul, "World")).unwrap();

    let selection = generalize_selection(&doc, &[hello, world]);
    assert_eq!(selection.matching_node_ids, vec![hello, world]);

    let before = doc.to_json();
    let rename = GeneralizedEdit::UpdateTag { tag: "li".to_string() };
    let result = doc.change(|tx| apply_generalized(tx, &selection, &rename));
    assert!(matches!(result, Err(EditorError::InvalidOperation(_))));
    assert_eq!(doc.to_json(), before);

    let wrap = GeneralizedEdit::Wrap { tag: "li".to_string() };
    let wrappers = doc.change(|tx| apply_generalized(tx, &selection, &wrap)).unwrap();

    assert_eq!(doc.children(&ul), wrappers);
    assert_eq!(doc.children(&wrappers[0]), vec![hello]);
    assert_eq!(doc.children(&wrappers[1]), vec![world]);
    assert_eq!(
        shape(&doc),
        json!({
            "tag": "section",
            "attrs": {},
            "children": [{
                "tag": "ul",
                "attrs": {},
                "children": [
                    { "tag": "li", "attrs": {}, "children": [{ "value": "Hello" }] },
                    { "tag": "li", "attrs": {}, "children": [{ "value": "World" }] },
                ],
            }],
        })
    );
}
