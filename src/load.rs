//! Import of live browser subtrees, for example server-prerendered containers, into a [`Document`].

use crate::dom::{Document, NodeId};
use wasm_bindgen::JsCast;
use web_sys::{CharacterData, Comment, Element, NamedNodeMap, Node, NodeList, Text};

/// Appends copies of `source`'s child nodes to `parent`.
///
/// Processing instructions and other node kinds without an arena counterpart are skipped.
pub fn load_child_nodes(document: &mut Document, parent: NodeId, source: &Element) {
	let node: &Node = source.as_ref();
	for child in load_nodes(document, &node.child_nodes()) {
		document.append_child(parent, child);
	}
}

/// Copies `source` with its subtree. The result is detached.
pub fn load_element(document: &mut Document, source: &Element) -> NodeId {
	let element = document.create_element(source.local_name(), load_attributes(&source.attributes()));
	load_child_nodes(document, element, source);
	element
}

fn load_nodes(document: &mut Document, nodes: &NodeList) -> Vec<NodeId> {
	(0..nodes.length())
		.filter_map(|i| nodes.item(i))
		.filter_map(|child| {
			if let Some(element) = child.dyn_ref::<Element>() {
				Some(load_element(document, element))
			} else if child.dyn_ref::<Text>().is_some() {
				child.dyn_ref::<CharacterData>().map(|text| document.create_text(text.data()))
			} else if child.dyn_ref::<Comment>().is_some() {
				child.dyn_ref::<CharacterData>().map(|comment| document.create_comment(comment.data()))
			} else {
				tracing::warn!(node_type = child.node_type(), "Skipping unsupported child node.");
				None
			}
		})
		.collect()
}

fn load_attributes(attributes: &NamedNodeMap) -> Vec<(String, String)> {
	(0..attributes.length())
		.filter_map(|i| attributes.item(i))
		.map(|attribute| (attribute.local_name(), attribute.value()))
		.collect()
}
