//! Morphs live document nodes towards freshly rendered markup.
//!
//! Children are matched by `id`, else by [`MAGIC_ID`], else positionally among unkeyed siblings of the same kind.
//! Nodes that lose their place are parked until the end of the pass, so that a skip marker elsewhere can still claim
//! them, and are only freed (and reported) once nothing did.

use crate::{
	config::Config,
	dom::{Document, NodeId, NodeKind},
	markup::{parse_fragment, VElement, VNode},
	ref_ledger::{ElementRef, Ref},
	rendered::parse_component_magic_id,
	wire::{Cid, StreamOp},
	FRAGMENT, HOOK, MAGIC_ID, PLACEHOLDER, REF_ATTRIBUTES, REF_DISABLED, REF_SRC, SKIP, STREAM_REF, UPDATE,
};
use hashbrown::{HashMap, HashSet};
use tracing::{error, instrument, trace, warn};

/// A hook element that was removed and freed during the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedHook {
	pub hook: String,
	/// No longer valid in the document.
	pub element: NodeId,
}

/// What a pass did, in document order where that applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
	/// Newly created elements with a [`HOOK`].
	pub added: Vec<NodeId>,
	/// Hook elements whose subtree changed.
	pub updated: Vec<NodeId>,
	pub removed: Vec<RemovedHook>,
	/// Components whose root elements were freed.
	pub removed_cids: Vec<Cid>,
	/// Ref state of freed elements, by [`REF_SRC`].
	pub removed_refs: Vec<(String, ElementRef)>,
	/// Every nested fragment container the pass saw in the live document.
	pub fragments: Vec<(String, NodeId)>,
	/// Nested fragments whose containers were freed.
	pub fragments_removed: Vec<String>,
	/// Magic ids of skip markers without an element to stand for.
	pub missing_skips: Vec<String>,
}

impl PatchReport {
	pub fn merge(&mut self, other: Self) {
		self.added.extend(other.added);
		self.updated.extend(other.updated);
		self.removed.extend(other.removed);
		self.removed_cids.extend(other.removed_cids);
		self.removed_refs.extend(other.removed_refs);
		self.fragments.extend(other.fragments);
		self.fragments_removed.extend(other.fragments_removed);
		self.missing_skips.extend(other.missing_skips);
	}
}

#[derive(Debug, Clone)]
struct StreamInsert {
	stream_ref: String,
	at: i64,
	limit: Option<i64>,
	update_only: bool,
}

#[derive(Debug, Clone, Copy)]
struct Capture {
	root: NodeId,
}

/// One patch pass over a document.
pub struct Reconciler<'a> {
	document: &'a mut Document,
	depth_limit: usize,
	undo_ref: Option<Ref>,
	streams: Vec<StreamOp>,
	inserts: HashMap<String, StreamInsert>,
	/// The subtree skip markers may claim elements from.
	root: Option<NodeId>,
	capture: Option<Capture>,
	claimed: HashSet<NodeId>,
	parked: Vec<NodeId>,
	capture_parked: Vec<NodeId>,
	report: PatchReport,
}

impl<'a> Reconciler<'a> {
	#[must_use]
	pub fn new(document: &'a mut Document, config: &Config) -> Self {
		Self {
			document,
			depth_limit: config.depth_limit,
			undo_ref: None,
			streams: Vec::new(),
			inserts: HashMap::new(),
			root: None,
			capture: None,
			claimed: HashSet::new(),
			parked: Vec::new(),
			capture_parked: Vec::new(),
			report: PatchReport::default(),
		}
	}

	/// Patches with acknowledgement `undo_ref` in flight, so locks it releases don't capture.
	#[must_use]
	pub fn with_undo_ref(self, undo_ref: Ref) -> Self {
		Self {
			undo_ref: Some(undo_ref),
			..self
		}
	}

	#[must_use]
	pub fn with_streams(self, streams: Vec<StreamOp>) -> Self {
		Self { streams, ..self }
	}

	/// Morphs the children of `container` towards `markup`.
	#[instrument(skip(self, markup), fields(markup = markup.len()))]
	pub fn patch_inner(self, container: NodeId, markup: &str) -> PatchReport {
		let nodes = parse_fragment(markup);
		self.patch_children(container, &nodes)
	}

	pub fn patch_children(mut self, container: NodeId, nodes: &[VNode]) -> PatchReport {
		if !self.document.is_element(container) {
			error!("Patch target is not a live element.");
			return self.report;
		}
		self.root = Some(container);
		self.apply_stream_removals(container);
		self.morph_children(container, nodes, 0);
		self.finish()
	}

	/// Morphs `element` itself towards the single root element of `markup`.
	#[instrument(skip(self, markup), fields(markup = markup.len()))]
	pub fn patch_outer(self, element: NodeId, markup: &str) -> PatchReport {
		let mut roots = parse_fragment(markup).into_iter().filter(|node| match node {
			VNode::Text(text) => !text.trim().is_empty(),
			VNode::Comment(_) => false,
			VNode::Element(_) => true,
		});
		match (roots.next(), roots.next()) {
			(Some(VNode::Element(root)), None) => self.patch_element(element, &root),
			_ => {
				error!("Markup for an element patch must have a single element root.");
				self.report
			}
		}
	}

	pub fn patch_element(mut self, element: NodeId, root: &VElement) -> PatchReport {
		if !self.document.is_element(element) {
			error!("Patch target is not a live element.");
			return self.report;
		}
		let scope = self.fragment_scope(element);
		self.root = Some(scope);
		self.apply_stream_removals(scope);
		if self.compatible_element(element, root) {
			self.morph_element(element, root, 0);
		} else {
			warn!("Element patch changes the tag; leaving the element as it is.");
		}
		self.finish()
	}

	/// The outermost ancestor of `element` within the same fragment.
	fn fragment_scope(&self, element: NodeId) -> NodeId {
		let mut scope = element;
		while let Some(parent) = self.document.parent(scope) {
			if self.document.has_attribute(parent, FRAGMENT) {
				return parent;
			}
			scope = parent;
		}
		scope
	}

	fn apply_stream_removals(&mut self, scope: NodeId) {
		for stream in core::mem::take(&mut self.streams) {
			for insert in &stream.inserts {
				self.inserts.insert(
					insert.dom_id.clone(),
					StreamInsert {
						stream_ref: stream.stream_ref.clone(),
						at: insert.at,
						limit: insert.limit,
						update_only: insert.update_only,
					},
				);
			}
			let in_scope = self.document.descendants(scope, |document, node| document.has_attribute(node, FRAGMENT));
			if stream.reset {
				for &node in &in_scope {
					if self.document.attribute(node, STREAM_REF) == Some(stream.stream_ref.as_str()) {
						self.park(node);
					}
				}
			}
			for id in &stream.deletes {
				if let Some(&node) = in_scope.iter().find(|&&node| self.document.attribute(node, "id") == Some(id.as_str())) {
					self.park(node);
				}
			}
		}
	}

	fn park(&mut self, node: NodeId) {
		self.document.detach(node);
		if self.capture.is_some() {
			self.capture_parked.push(node);
		} else {
			self.parked.push(node);
		}
	}

	fn reporting(&self) -> bool {
		self.capture.is_none()
	}

	fn finish(mut self) -> PatchReport {
		for node in core::mem::take(&mut self.parked) {
			if self.document.contains(node) && self.document.parent(node).is_none() {
				self.collect_removed(node);
				self.document.remove(node);
			}
		}
		self.report.removed_cids.sort_unstable();
		self.report.removed_cids.dedup();
		trace!(
			added = self.report.added.len(),
			updated = self.report.updated.len(),
			removed = self.report.removed.len(),
			"Patch pass finished."
		);
		self.report
	}

	fn collect_removed(&mut self, node: NodeId) {
		let mut stack = vec![(node, false)];
		while let Some((node, nested)) = stack.pop() {
			if !self.document.is_element(node) {
				continue;
			}
			if let Some(hook) = self.document.attribute(node, HOOK) {
				self.report.removed.push(RemovedHook {
					hook: hook.to_owned(),
					element: node,
				});
			}
			if !nested {
				if let Some(cid) = self.document.attribute(node, MAGIC_ID).and_then(parse_component_magic_id) {
					self.report.removed_cids.push(cid);
				}
			}
			if let Some(source) = self.document.attribute(node, REF_SRC) {
				let source = source.to_owned();
				self.report.removed_refs.push((source, ElementRef::read(self.document, node)));
			}
			let fragment = self.document.attribute(node, FRAGMENT).map(str::to_owned);
			let nested = nested || fragment.is_some();
			if let Some(fragment) = fragment {
				self.report.fragments_removed.push(fragment);
			}
			stack.extend(self.document.children(node).iter().rev().map(|&child| (child, nested)));
		}
	}

	fn key_of(element: &VElement) -> Option<(&'static str, &str)> {
		element
			.attribute("id")
			.map(|id| ("id", id))
			.or_else(|| element.attribute(MAGIC_ID).map(|magic_id| (MAGIC_ID, magic_id)))
	}

	fn live_key(&self, node: NodeId) -> Option<(&'static str, &str)> {
		self.document
			.attribute(node, "id")
			.map(|id| ("id", id))
			.or_else(|| self.document.attribute(node, MAGIC_ID).map(|magic_id| (MAGIC_ID, magic_id)))
	}

	fn compatible_element(&self, node: NodeId, element: &VElement) -> bool {
		self.document.tag(node) == Some(element.tag.as_str())
	}

	fn compatible(&self, node: NodeId, vnode: &VNode) -> bool {
		match (self.document.kind(node), vnode) {
			(Some(NodeKind::Text(_)), VNode::Text(_)) | (Some(NodeKind::Comment(_)), VNode::Comment(_)) => true,
			(Some(NodeKind::Element { tag, .. }), VNode::Element(element)) => *tag == element.tag,
			_ => false,
		}
	}

	/// Finds the old sibling `vnode` continues, if any.
	fn match_sibling(&self, old: &[NodeId], used: &[bool], cursor: &mut usize, vnode: &VNode) -> Option<usize> {
		let available = |index: usize| !used[index] && !self.claimed.contains(&old[index]);
		if let VNode::Element(element) = vnode {
			if let Some((attribute, key)) = Self::key_of(element) {
				return (0..old.len()).find(|&index| {
					available(index)
						&& self.document.attribute(old[index], attribute) == Some(key)
						&& self.compatible(old[index], vnode)
				});
			}
		}
		while *cursor < old.len() {
			let index = *cursor;
			*cursor += 1;
			if available(index) && self.live_key(old[index]).is_none() && self.compatible(old[index], vnode) {
				return Some(index);
			}
		}
		None
	}

	fn morph_children(&mut self, parent: NodeId, vnodes: &[VNode], depth: usize) -> bool {
		let old = self.document.children(parent).to_vec();
		let mut used = vec![false; old.len()];
		let mut cursor = 0;
		let mut changed = false;
		let mut result = Vec::with_capacity(vnodes.len());
		for vnode in vnodes {
			match self.match_sibling(&old, &used, &mut cursor, vnode) {
				Some(index) => {
					used[index] = true;
					let node = old[index];
					self.claimed.insert(node);
					changed |= self.morph(node, vnode, depth + 1);
					result.push(node);
				}
				None => {
					if let Some(node) = self.create(vnode, parent, depth + 1) {
						result.push(node);
					}
					changed = true;
				}
			}
		}
		changed |= result != old;
		for (index, &node) in old.iter().enumerate() {
			if !used[index] && !result.contains(&node) && self.document.parent(node) == Some(parent) {
				self.park(node);
			}
		}
		self.document.replace_children(parent, result);
		changed
	}

	/// Stream containers keep children the markup no longer mentions.
	fn morph_stream_children(&mut self, parent: NodeId, vnodes: &[VNode], depth: usize) -> bool {
		let old = self.document.children(parent).to_vec();
		let mut used = vec![false; old.len()];
		let mut cursor = 0;
		let mut changed = false;
		let mut result = old.clone();
		let mut created = HashSet::new();
		let mut limits = Vec::new();
		for vnode in vnodes {
			let insert = Self::vnode_id(vnode).and_then(|id| self.inserts.get(id)).cloned();
			if let Some(limit) = insert.as_ref().and_then(|insert| insert.limit) {
				limits.push(limit);
			}
			if let Some(index) = self.match_sibling(&old, &used, &mut cursor, vnode) {
				used[index] = true;
				self.claimed.insert(old[index]);
				changed |= self.morph(old[index], vnode, depth + 1);
				continue;
			}
			if insert.as_ref().map_or(false, |insert| insert.update_only) {
				trace!("Skipping update-only stream insert of an absent child.");
				continue;
			}
			let Some(node) = self.create(vnode, parent, depth + 1) else {
				continue;
			};
			changed = true;
			created.insert(node);
			match insert.map_or(-1, |insert| insert.at) {
				0 => result.insert(0, node),
				at if at < 0 => result.push(node),
				at => {
					let at = usize::try_from(at).unwrap_or(usize::MAX).min(result.len());
					result.insert(at, node);
				}
			}
		}
		// Old children may have been claimed by skip markers elsewhere.
		result.retain(|node| created.contains(node) || self.document.parent(*node) == Some(parent));
		for limit in limits {
			changed |= self.trim_stream(&mut result, limit);
		}
		self.document.replace_children(parent, result);
		changed
	}

	fn trim_stream(&mut self, children: &mut Vec<NodeId>, limit: i64) -> bool {
		let elements: Vec<NodeId> = children.iter().copied().filter(|&node| self.document.is_element(node)).collect();
		let keep = usize::try_from(limit.unsigned_abs()).unwrap_or(usize::MAX);
		if elements.len() <= keep {
			return false;
		}
		let drop: Vec<NodeId> = if limit >= 0 {
			elements[keep..].to_vec()
		} else {
			elements[..elements.len() - keep].to_vec()
		};
		children.retain(|node| !drop.contains(node));
		for node in drop {
			self.park(node);
		}
		true
	}

	fn vnode_id(vnode: &VNode) -> Option<&str> {
		match vnode {
			VNode::Element(element) => element.attribute("id"),
			VNode::Text(_) | VNode::Comment(_) => None,
		}
	}

	fn morph(&mut self, node: NodeId, vnode: &VNode, depth: usize) -> bool {
		if depth > self.depth_limit {
			error!("Depth limit of {} exceeded while patching; leaving the subtree unchanged.", self.depth_limit);
			return false;
		}
		match vnode {
			VNode::Text(text) | VNode::Comment(text) => self.document.set_data(node, text),
			VNode::Element(element) => self.morph_element(node, element, depth),
		}
	}

	fn morph_element(&mut self, element: NodeId, vnode: &VElement, depth: usize) -> bool {
		if vnode.has_attribute(SKIP) {
			if let Some(magic_id) = vnode.attribute(MAGIC_ID) {
				self.document.set_attribute(element, MAGIC_ID, magic_id);
			}
			return false;
		}

		if self.capture.is_none() && ElementRef::read(self.document, element).is_locked_against(self.undo_ref) {
			self.capture_locked(element, vnode, depth);
			return false;
		}

		let mut changed = self.sync_attributes(element, vnode);
		if let Some(fragment) = vnode.attribute(FRAGMENT) {
			if self.reporting() {
				self.report.fragments.push((fragment.to_owned(), element));
			}
			return changed;
		}
		match vnode.attribute(UPDATE) {
			Some("ignore") => (),
			Some("stream") => changed |= self.morph_stream_children(element, &vnode.children, depth),
			_ => changed |= self.morph_children(element, &vnode.children, depth),
		}
		if changed && self.reporting() && self.document.has_attribute(element, HOOK) {
			self.report.updated.push(element);
		}
		changed
	}

	/// Applies the patch to the element's pending clone instead of the element.
	fn capture_locked(&mut self, element: NodeId, vnode: &VElement, depth: usize) {
		let existing = self
			.document
			.private(element)
			.and_then(|private| private.lock_clone)
			.filter(|&clone| self.document.contains(clone));
		let clone = match existing {
			Some(clone) => clone,
			None => {
				let Some(clone) = self.document.clone_subtree(element) else {
					return;
				};
				if let Some(private) = self.document.private_mut(element) {
					private.lock_clone = Some(clone);
				}
				clone
			}
		};
		trace!("Capturing patch of a locked element.");

		let outer_root = self.root.replace(clone);
		self.capture = Some(Capture { root: clone });
		self.morph_element(clone, vnode, depth);
		self.capture = None;
		self.root = outer_root;

		for node in core::mem::take(&mut self.capture_parked) {
			if self.document.contains(node) && self.document.parent(node).is_none() {
				self.document.remove(node);
			}
		}
	}

	fn sync_attributes(&mut self, element: NodeId, vnode: &VElement) -> bool {
		let live = self.document.attributes(element).to_vec();
		let guarded = live.iter().any(|(name, _)| name == REF_DISABLED);
		let mut changed = false;
		for (name, value) in &vnode.attributes {
			if REF_ATTRIBUTES.contains(&name.as_str()) || name == SKIP || name == STREAM_REF {
				continue;
			}
			if guarded && name == "disabled" {
				self.document.set_attribute(element, REF_DISABLED, "true");
				continue;
			}
			changed |= self.document.set_attribute(element, name, value);
		}
		for (name, _) in &live {
			if vnode.has_attribute(name) || REF_ATTRIBUTES.contains(&name.as_str()) || name == STREAM_REF {
				continue;
			}
			if guarded && name == "disabled" {
				self.document.set_attribute(element, REF_DISABLED, "false");
				continue;
			}
			self.document.remove_attribute(element, name);
			changed = true;
		}
		changed
	}

	/// Instantiates `vnode`, resolving skip markers and tagging stream children.
	fn create(&mut self, vnode: &VNode, parent: NodeId, depth: usize) -> Option<NodeId> {
		if depth > self.depth_limit {
			error!("Depth limit of {} exceeded while creating nodes; dropping the subtree.", self.depth_limit);
			return None;
		}
		let element = match vnode {
			VNode::Text(text) => return Some(self.document.create_text(text.as_str())),
			VNode::Comment(comment) => return Some(self.document.create_comment(comment.as_str())),
			VNode::Element(element) => element,
		};

		if element.has_attribute(SKIP) {
			return Some(self.resolve_skip(element, parent));
		}

		let insert = element.attribute("id").and_then(|id| self.inserts.get(id)).cloned();
		if insert.as_ref().map_or(false, |insert| insert.update_only) {
			return None;
		}

		let attributes = element
			.attributes
			.iter()
			.filter(|(name, _)| name != SKIP)
			.cloned()
			.collect();
		let node = self.document.create_element(element.tag.as_str(), attributes);
		self.claimed.insert(node);
		if let Some(insert) = insert {
			self.document.set_attribute(node, STREAM_REF, &insert.stream_ref);
		}

		if let Some(fragment) = element.attribute(FRAGMENT) {
			for child in &element.children {
				let child = self.document.create_from_vnode(child);
				self.document.append_child(node, child);
			}
			if self.reporting() {
				self.report.fragments.push((fragment.to_owned(), node));
			}
		} else {
			for child in &element.children {
				if let Some(child) = self.create(child, node, depth + 1) {
					self.document.append_child(node, child);
				}
			}
			if element.attribute(UPDATE) == Some("stream") {
				let limits: Vec<i64> = element
					.children
					.iter()
					.filter_map(|child| Self::vnode_id(child).and_then(|id| self.inserts.get(id)).and_then(|insert| insert.limit))
					.collect();
				let mut children = self.document.children(node).to_vec();
				for limit in limits {
					self.trim_stream(&mut children, limit);
				}
				self.document.replace_children(node, children);
			}
		}

		if self.reporting() && element.has_attribute(HOOK) {
			self.report.added.push(node);
		}
		Some(node)
	}

	/// Moves the element a skip marker stands for into place, or inserts a placeholder if there is none.
	fn resolve_skip(&mut self, marker: &VElement, parent: NodeId) -> NodeId {
		let magic_id = marker.attribute(MAGIC_ID).unwrap_or_default();
		if let Some(found) = self.find_magic(magic_id, parent) {
			trace!(magic_id, "Moving skipped element into place.");
			self.claimed.insert(found);
			self.document.detach(found);
			return found;
		}

		if cfg!(feature = "dangerous-logging") {
			warn!(magic_id, "Skip marker <{}> has no element to stand for.", marker.tag);
		} else {
			warn!(magic_id, "Skip marker has no element to stand for.");
		}
		if self.reporting() {
			self.report.missing_skips.push(magic_id.to_owned());
		}
		let mut attributes = vec![(PLACEHOLDER.to_owned(), String::new())];
		if !magic_id.is_empty() {
			attributes.insert(0, (MAGIC_ID.to_owned(), magic_id.to_owned()));
		}
		self.document.create_element("template", attributes)
	}

	fn find_magic(&self, magic_id: &str, parent: NodeId) -> Option<NodeId> {
		if magic_id.is_empty() {
			return None;
		}
		let matches = |node: &NodeId| {
			self.document.attribute(*node, MAGIC_ID) == Some(magic_id)
				&& !self.claimed.contains(node)
				&& !self.document.is_inclusive_ancestor(*node, parent)
		};
		let opaque = |document: &Document, node: NodeId| document.has_attribute(node, FRAGMENT);

		let root = self.capture.map(|capture| capture.root).or(self.root)?;
		if let Some(found) = self.document.descendants(root, opaque).into_iter().find(matches) {
			return Some(found);
		}
		let parked = if self.capture.is_some() { &self.capture_parked } else { &self.parked };
		parked.iter().find_map(|&parked| {
			let mut candidates = vec![parked];
			candidates.extend(self.document.descendants(parked, opaque));
			candidates.into_iter().find(matches)
		})
	}
}
