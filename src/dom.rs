//! The live document: a generational arena of elements, text and comments.
//!
//! Per-element bookkeeping that must never reach markup (pending lock clones, queued acknowledgements, unlock
//! callbacks) lives in a private side-table keyed by [`NodeId`]. Freeing a node drops its private data, so nothing
//! registered on an element outlives it.

use crate::{
	markup::{self, VElement, VNode},
	ref_ledger::Ref,
};
use core::fmt::{self, Debug, Formatter};
use hashbrown::HashMap;
use tracing::{trace, warn};

/// A generational handle to a node in a [`Document`].
///
/// Handles to freed nodes stay invalid even after their slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
	index: u32,
	generation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
	Element { tag: String, attributes: Vec<(String, String)> },
	Text(String),
	Comment(String),
}

#[derive(Debug)]
struct Entry {
	kind: NodeKind,
	parent: Option<NodeId>,
	children: Vec<NodeId>,
}

#[derive(Debug)]
struct Slot {
	generation: u32,
	entry: Option<Entry>,
}

/// Private, markup-invisible element state.
#[derive(Default)]
pub struct Private {
	/// Detached copy of a locked element that receives patches until the lock is released.
	pub(crate) lock_clone: Option<NodeId>,
	/// Acknowledgements that arrived while a newer ref blocked them.
	pub(crate) pending_refs: Vec<Ref>,
	pub(crate) unlock_callbacks: Vec<(Ref, Box<dyn FnOnce()>)>,
}
impl Debug for Private {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("Private")
			.field("lock_clone", &self.lock_clone)
			.field("pending_refs", &self.pending_refs)
			.field("unlock_callbacks", &self.unlock_callbacks.iter().map(|(r, _)| r).collect::<Vec<_>>())
			.finish()
	}
}
impl Private {
	fn is_empty(&self) -> bool {
		self.lock_clone.is_none() && self.pending_refs.is_empty() && self.unlock_callbacks.is_empty()
	}
}

#[derive(Default)]
pub struct Document {
	slots: Vec<Slot>,
	free: Vec<u32>,
	privates: HashMap<NodeId, Private>,
}
impl Debug for Document {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("Document")
			.field("live", &(self.slots.len() - self.free.len()))
			.field("free", &self.free.len())
			.field("privates", &self.privates.len())
			.finish()
	}
}

static NO_CHILDREN: [NodeId; 0] = [];

impl Document {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	fn alloc(&mut self, kind: NodeKind) -> NodeId {
		let entry = Entry {
			kind,
			parent: None,
			children: Vec::new(),
		};
		match self.free.pop() {
			Some(index) => {
				let slot = &mut self.slots[index as usize];
				slot.entry = Some(entry);
				NodeId {
					index,
					generation: slot.generation,
				}
			}
			None => {
				// More than `u32::MAX` nodes don't fit into memory anyway.
				#[allow(clippy::cast_possible_truncation)]
				let index = self.slots.len() as u32;
				self.slots.push(Slot {
					generation: 0,
					entry: Some(entry),
				});
				NodeId { index, generation: 0 }
			}
		}
	}

	fn entry(&self, id: NodeId) -> Option<&Entry> {
		self.slots
			.get(id.index as usize)
			.filter(|slot| slot.generation == id.generation)
			.and_then(|slot| slot.entry.as_ref())
	}

	fn entry_mut(&mut self, id: NodeId) -> Option<&mut Entry> {
		self.slots
			.get_mut(id.index as usize)
			.filter(|slot| slot.generation == id.generation)
			.and_then(|slot| slot.entry.as_mut())
	}

	pub fn create_element(&mut self, tag: impl Into<String>, attributes: Vec<(String, String)>) -> NodeId {
		self.alloc(NodeKind::Element {
			tag: tag.into(),
			attributes,
		})
	}

	pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
		self.alloc(NodeKind::Text(text.into()))
	}

	pub fn create_comment(&mut self, comment: impl Into<String>) -> NodeId {
		self.alloc(NodeKind::Comment(comment.into()))
	}

	/// Instantiates a detached copy of `node`.
	pub fn create_from_vnode(&mut self, node: &VNode) -> NodeId {
		match node {
			VNode::Text(text) => self.create_text(text.as_str()),
			VNode::Comment(comment) => self.create_comment(comment.as_str()),
			VNode::Element(element) => {
				let id = self.create_element(element.tag.as_str(), element.attributes.clone());
				for child in &element.children {
					let child = self.create_from_vnode(child);
					self.append_child(id, child);
				}
				id
			}
		}
	}

	#[must_use]
	pub fn contains(&self, id: NodeId) -> bool {
		self.entry(id).is_some()
	}

	#[must_use]
	pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
		self.entry(id).map(|entry| &entry.kind)
	}

	#[must_use]
	pub fn is_element(&self, id: NodeId) -> bool {
		matches!(self.kind(id), Some(NodeKind::Element { .. }))
	}

	#[must_use]
	pub fn tag(&self, id: NodeId) -> Option<&str> {
		match self.kind(id)? {
			NodeKind::Element { tag, .. } => Some(tag),
			NodeKind::Text(_) | NodeKind::Comment(_) => None,
		}
	}

	/// Character data of a text or comment node.
	#[must_use]
	pub fn data(&self, id: NodeId) -> Option<&str> {
		match self.kind(id)? {
			NodeKind::Text(data) | NodeKind::Comment(data) => Some(data),
			NodeKind::Element { .. } => None,
		}
	}

	/// Returns whether the data changed.
	pub fn set_data(&mut self, id: NodeId, new: &str) -> bool {
		match self.entry_mut(id).map(|entry| &mut entry.kind) {
			Some(NodeKind::Text(data) | NodeKind::Comment(data)) => {
				if data == new {
					false
				} else {
					new.clone_into(data);
					true
				}
			}
			_ => false,
		}
	}

	#[must_use]
	pub fn attributes(&self, id: NodeId) -> &[(String, String)] {
		match self.kind(id) {
			Some(NodeKind::Element { attributes, .. }) => attributes,
			_ => &[],
		}
	}

	#[must_use]
	pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
		self.attributes(id).iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
	}

	#[must_use]
	pub fn has_attribute(&self, id: NodeId, name: &str) -> bool {
		self.attribute(id, name).is_some()
	}

	/// Returns whether the attribute changed.
	pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) -> bool {
		let attributes = match self.entry_mut(id).map(|entry| &mut entry.kind) {
			Some(NodeKind::Element { attributes, .. }) => attributes,
			_ => {
				warn!("Tried to set attribute {:?} on a non-element or freed node.", name);
				return false;
			}
		};
		match attributes.iter_mut().find(|(n, _)| n == name) {
			Some((_, existing)) if existing == value => false,
			Some((_, existing)) => {
				value.clone_into(existing);
				true
			}
			None => {
				attributes.push((name.to_owned(), value.to_owned()));
				true
			}
		}
	}

	pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> Option<String> {
		match self.entry_mut(id).map(|entry| &mut entry.kind) {
			Some(NodeKind::Element { attributes, .. }) => {
				let position = attributes.iter().position(|(n, _)| n == name)?;
				Some(attributes.remove(position).1)
			}
			_ => None,
		}
	}

	#[must_use]
	pub fn parent(&self, id: NodeId) -> Option<NodeId> {
		self.entry(id).and_then(|entry| entry.parent)
	}

	#[must_use]
	pub fn children(&self, id: NodeId) -> &[NodeId] {
		self.entry(id).map_or(&NO_CHILDREN, |entry| &entry.children)
	}

	/// Removes `child` from its parent's child list without freeing it.
	pub fn detach(&mut self, child: NodeId) {
		let parent = match self.entry_mut(child) {
			Some(entry) => entry.parent.take(),
			None => return,
		};
		if let Some(parent) = parent.and_then(|parent| self.entry_mut(parent)) {
			parent.children.retain(|&c| c != child);
		}
	}

	pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
		let index = self.children(parent).len();
		self.insert_child(parent, index, child);
	}

	/// Inserts `child` at `index` (clamped) in `parent`'s child list, detaching it from wherever it was first.
	pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
		if !self.contains(parent) || !self.contains(child) || parent == child {
			warn!("Tried to insert a freed or self-referential node.");
			return;
		}
		self.detach(child);
		if let Some(entry) = self.entry_mut(child) {
			entry.parent = Some(parent);
		}
		if let Some(entry) = self.entry_mut(parent) {
			let index = index.min(entry.children.len());
			entry.children.insert(index, child);
		}
	}

	/// Replaces `parent`'s child list.
	///
	/// Nodes in `children` are detached from their previous parents.
	/// Previous children that aren't in `children` are left detached but allocated.
	pub fn replace_children(&mut self, parent: NodeId, children: Vec<NodeId>) {
		if !self.contains(parent) {
			return;
		}
		for &child in &children {
			if self.parent(child) != Some(parent) {
				self.detach(child);
			}
			if let Some(entry) = self.entry_mut(child) {
				entry.parent = Some(parent);
			}
		}
		let previous = match self.entry_mut(parent) {
			Some(entry) => core::mem::replace(&mut entry.children, children),
			None => return,
		};
		for old in previous {
			if self.parent(old) == Some(parent) && !self.children(parent).contains(&old) {
				if let Some(entry) = self.entry_mut(old) {
					entry.parent = None;
				}
			}
		}
	}

	/// Detaches and frees `id` and its subtree, including private data and pending lock clones.
	pub fn remove(&mut self, id: NodeId) {
		if !self.contains(id) {
			return;
		}
		self.detach(id);
		let mut stack = vec![id];
		let mut freed = 0_usize;
		while let Some(id) = stack.pop() {
			if let Some(private) = self.privates.remove(&id) {
				if let Some(clone) = private.lock_clone {
					stack.push(clone);
				}
				if !private.unlock_callbacks.is_empty() {
					trace!("Dropping {} unlock callback(s) of a freed element.", private.unlock_callbacks.len());
				}
			}
			let slot = &mut self.slots[id.index as usize];
			if let Some(entry) = slot.entry.take() {
				slot.generation = slot.generation.wrapping_add(1);
				self.free.push(id.index);
				stack.extend(entry.children);
				freed += 1;
			}
		}
		trace!("Freed {} node(s).", freed);
	}

	/// Deep copy of `id` as a detached subtree, without private data.
	pub fn clone_subtree(&mut self, id: NodeId) -> Option<NodeId> {
		let vnode = self.to_vnode(id)?;
		Some(self.create_from_vnode(&vnode))
	}

	#[must_use]
	pub fn to_vnode(&self, id: NodeId) -> Option<VNode> {
		Some(match self.kind(id)? {
			NodeKind::Text(text) => VNode::Text(text.clone()),
			NodeKind::Comment(comment) => VNode::Comment(comment.clone()),
			NodeKind::Element { tag, attributes } => VNode::Element(VElement {
				tag: tag.clone(),
				attributes: attributes.clone(),
				children: self.children(id).iter().filter_map(|&child| self.to_vnode(child)).collect(),
			}),
		})
	}

	/// Pre-order descendants of `root` (excluding `root`).
	///
	/// Nodes for which `prune` returns `true` are included, but not descended into.
	pub fn descendants(&self, root: NodeId, prune: impl Fn(&Self, NodeId) -> bool) -> Vec<NodeId> {
		let mut found = Vec::new();
		let mut stack: Vec<NodeId> = self.children(root).iter().rev().copied().collect();
		while let Some(id) = stack.pop() {
			found.push(id);
			if !prune(self, id) {
				stack.extend(self.children(id).iter().rev().copied());
			}
		}
		found
	}

	#[must_use]
	pub fn is_inclusive_ancestor(&self, ancestor: NodeId, mut node: NodeId) -> bool {
		loop {
			if node == ancestor {
				return true;
			}
			match self.parent(node) {
				Some(parent) => node = parent,
				None => return false,
			}
		}
	}

	#[must_use]
	pub fn outer_markup(&self, id: NodeId) -> String {
		let mut out = String::new();
		self.write_markup(&mut out, id);
		out
	}

	#[must_use]
	pub fn inner_markup(&self, id: NodeId) -> String {
		let mut out = String::new();
		for &child in self.children(id) {
			self.write_markup(&mut out, child);
		}
		out
	}

	fn write_markup(&self, out: &mut String, id: NodeId) {
		match self.kind(id) {
			None => (),
			Some(NodeKind::Text(text)) => out.push_str(text),
			Some(NodeKind::Comment(comment)) => {
				out.push_str("<!--");
				out.push_str(comment);
				out.push_str("-->");
			}
			Some(NodeKind::Element { tag, attributes }) => {
				markup::write_start_tag(out, tag, attributes);
				for &child in self.children(id) {
					self.write_markup(out, child);
				}
				markup::write_end_tag(out, tag);
			}
		}
	}

	#[must_use]
	pub fn private(&self, id: NodeId) -> Option<&Private> {
		self.privates.get(&id)
	}

	/// Private data of a live element, created on demand.
	pub fn private_mut(&mut self, id: NodeId) -> Option<&mut Private> {
		if self.is_element(id) {
			Some(self.privates.entry(id).or_default())
		} else {
			None
		}
	}

	/// Drops private data that no longer holds anything.
	pub(crate) fn compact_private(&mut self, id: NodeId) {
		if self.privates.get(&id).map_or(false, Private::is_empty) {
			self.privates.remove(&id);
		}
	}

	/// Number of live (allocated) nodes, attached or not.
	#[must_use]
	pub fn len(&self) -> usize {
		self.slots.len() - self.free.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
