//! The merged model of one rendered fragment and its stringification.

use crate::{
	config::Config,
	markup::{self, annotate_root, leading_tag_name, skip_marker},
	wire::{Cid, DecodeError, DiffPayload, DynamicDiff, EntryDiff, NodeDiff, Statics, StreamOp},
	MAGIC_ID, PLACEHOLDER, SKIP,
};
use hashbrown::{HashMap, HashSet};
use std::{collections::BTreeMap, rc::Rc};
use tracing::{error, instrument, trace, trace_span, warn};

/// A static template with its current dynamic values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TemplateNode {
	statics: Rc<[String]>,
	slots: Vec<Dynamic>,
	/// Whether the output is a single element that can carry a magic id.
	root: bool,
	magic_id: Option<String>,
	/// Whether a merge touched this node since it was last rendered.
	new_render: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Dynamic {
	Empty,
	Text(String),
	Component(Cid),
	Template(Box<TemplateNode>),
	Keyed(Box<KeyedNode>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyedNode {
	/// Shared by all entries.
	statics: Rc<[String]>,
	entries: Vec<Entry>,
	stream: Option<StreamOp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
	slots: Vec<Dynamic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Component {
	node: TemplateNode,
	/// Render without change tracking next time.
	reset: bool,
}

/// Output of [`DiffTree::to_markup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendering {
	pub markup: String,
	/// Stream operations consumed by this render, to be applied by the reconciler.
	pub streams: Vec<StreamOp>,
}

/// Magic id of the root element of component `cid`.
#[must_use]
pub fn component_magic_id(cid: Cid) -> String {
	format!("c{}", cid)
}

#[must_use]
pub fn parse_component_magic_id(magic_id: &str) -> Option<Cid> {
	magic_id.strip_prefix('c')?.parse().ok()
}

fn slot_count(statics: &[String]) -> usize {
	statics.len().saturating_sub(1)
}

fn placeholder(magic_id: Option<&str>) -> String {
	let mut attributes = Vec::with_capacity(2);
	if let Some(magic_id) = magic_id {
		attributes.push((MAGIC_ID.to_owned(), magic_id.to_owned()));
	}
	attributes.push((PLACEHOLDER.to_owned(), String::new()));
	let mut out = String::new();
	markup::write_start_tag(&mut out, "template", &attributes);
	markup::write_end_tag(&mut out, "template");
	out
}

fn build(statics: Rc<[String]>, diff: NodeDiff) -> Dynamic {
	if diff.keyed.is_some() || diff.stream.is_some() {
		let mut keyed = KeyedNode {
			statics,
			entries: Vec::new(),
			stream: None,
		};
		merge_keyed(&mut keyed, diff);
		Dynamic::Keyed(Box::new(keyed))
	} else {
		Dynamic::Template(Box::new(build_template(statics, diff)))
	}
}

fn build_template(statics: Rc<[String]>, diff: NodeDiff) -> TemplateNode {
	if diff.keyed.is_some() || diff.stream.is_some() {
		warn!("Ignoring keyed entries on a node that must be a plain template.");
	}
	let mut node = TemplateNode {
		slots: vec![Dynamic::Empty; slot_count(&statics)],
		statics,
		root: diff.root.unwrap_or(false),
		magic_id: None,
		new_render: true,
	};
	merge_slots(&mut node.slots, diff.slots);
	node
}

fn merge_template(node: &mut TemplateNode, diff: NodeDiff) {
	if diff.keyed.is_some() || diff.stream.is_some() {
		warn!("Malformed diff: keyed entries for a plain template; ignoring them.");
	}
	if let Some(root) = diff.root {
		node.root = root;
	}
	node.new_render = true;
	merge_slots(&mut node.slots, diff.slots);
}

fn merge_slots(slots: &mut [Dynamic], diffs: BTreeMap<usize, DynamicDiff>) {
	for (index, diff) in diffs {
		match slots.get_mut(index) {
			Some(slot) => merge_dynamic(slot, diff),
			None => warn!("Malformed diff: slot {} is out of range ({} slots); skipping it.", index, slots.len()),
		}
	}
}

fn merge_dynamic(slot: &mut Dynamic, diff: DynamicDiff) {
	match diff {
		DynamicDiff::Text(text) => *slot = Dynamic::Text(text),
		DynamicDiff::Component(cid) => *slot = Dynamic::Component(cid),
		DynamicDiff::Empty => *slot = Dynamic::Empty,
		DynamicDiff::Node(diff) => match diff.statics.clone() {
			Some(Statics::Template(statics)) => *slot = build(statics, diff),
			Some(Statics::Component(_)) => warn!("Malformed diff: signed component id outside a component; skipping it."),
			None => match slot {
				Dynamic::Template(node) => merge_template(node, diff),
				Dynamic::Keyed(keyed) => merge_keyed(keyed, diff),
				Dynamic::Empty | Dynamic::Text(_) | Dynamic::Component(_) => {
					warn!("Malformed diff: template-less node for a slot without one; leaving the slot unchanged.");
				}
			},
		},
	}
}

fn merge_entry(entry: &mut Entry, diff: NodeDiff) {
	if diff.statics.is_some() {
		warn!("Ignoring a template on a keyed entry; entries share the template of their collection.");
	}
	merge_slots(&mut entry.slots, diff.slots);
}

fn merge_keyed(keyed: &mut KeyedNode, diff: NodeDiff) {
	if let Some(mut changes) = diff.keyed {
		let width = slot_count(&keyed.statics);
		let empty = || Entry {
			slots: vec![Dynamic::Empty; width],
		};
		let previous = core::mem::take(&mut keyed.entries);
		let old = |index: usize| {
			previous.get(index).cloned().unwrap_or_else(|| {
				trace!("No previous keyed entry {}; starting from an empty one.", index);
				empty()
			})
		};

		keyed.entries = (0..changes.count)
			.map(|index| match changes.entries.remove(&index) {
				None => old(index),
				Some(EntryDiff::Move(from)) => old(from),
				Some(EntryDiff::MoveWithDiff(from, diff)) => {
					let mut entry = old(from);
					merge_entry(&mut entry, diff);
					entry
				}
				Some(EntryDiff::Node(diff)) => {
					let mut entry = old(index);
					merge_entry(&mut entry, diff);
					entry
				}
			})
			.collect();

		if !changes.entries.is_empty() {
			warn!(
				"Malformed diff: {} keyed entries beyond the count of {}; dropping them.",
				changes.entries.len(),
				changes.count
			);
		}
	}
	if let Some(stream) = diff.stream {
		keyed.stream = Some(stream);
	}
}

/// Clears render tracking below a borrowed template, so it's stringified as new.
fn prune_magic_ids(node: &mut TemplateNode) {
	node.magic_id = None;
	node.new_render = false;
	for slot in &mut node.slots {
		prune_dynamic(slot);
	}
}

fn prune_dynamic(slot: &mut Dynamic) {
	match slot {
		Dynamic::Template(node) => prune_magic_ids(node),
		Dynamic::Keyed(keyed) => {
			for entry in &mut keyed.entries {
				for slot in &mut entry.slots {
					prune_dynamic(slot);
				}
			}
		}
		Dynamic::Empty | Dynamic::Text(_) | Dynamic::Component(_) => (),
	}
}

/// Mutable model of one rendered fragment.
#[derive(Debug)]
pub struct DiffTree {
	fragment: String,
	root: TemplateNode,
	components: HashMap<Cid, Component>,
	next_magic_id: u64,
	last_delivery: Option<u64>,
	force_full: bool,
	depth_limit: usize,
}

impl DiffTree {
	/// Builds the tree from the join diff of `fragment`.
	///
	/// # Errors
	///
	/// Iff the payload has no fragment diff with a template.
	#[instrument(skip(payload, config))]
	pub fn new(fragment: &str, payload: &DiffPayload, config: &Config) -> Result<Self, DecodeError> {
		let (statics, diff) = match &payload.fragment {
			Some(diff) => match &diff.statics {
				Some(Statics::Template(statics)) => (statics.clone(), diff.clone()),
				_ => return Err(DecodeError::MissingTemplate),
			},
			None => return Err(DecodeError::MissingTemplate),
		};
		let mut tree = Self {
			fragment: fragment.to_owned(),
			root: build_template(statics, diff),
			components: HashMap::new(),
			next_magic_id: 0,
			last_delivery: payload.delivery,
			force_full: false,
			depth_limit: config.depth_limit,
		};
		tree.merge_components(&payload.components);
		Ok(tree)
	}

	#[must_use]
	pub fn fragment(&self) -> &str {
		&self.fragment
	}

	/// Merges `payload` into the tree. Returns `false` iff its delivery id shows it was already merged.
	///
	/// Payloads without a delivery id always merge. Equal content is not a redelivery: keyed moves apply again.
	#[instrument(skip(self, payload), fields(fragment = %self.fragment, delivery = ?payload.delivery))]
	pub fn merge(&mut self, payload: &DiffPayload) -> bool {
		if let Some(delivery) = payload.delivery {
			if self.last_delivery.map_or(false, |last| delivery <= last) {
				trace!("Ignoring redelivered payload.");
				return false;
			}
			self.last_delivery = Some(delivery);
		}

		if let Some(diff) = &payload.fragment {
			match diff.statics.clone() {
				Some(Statics::Template(statics)) => self.root = build_template(statics, diff.clone()),
				Some(Statics::Component(_)) => warn!("Malformed diff: signed component id on the fragment; skipping it."),
				None => merge_template(&mut self.root, diff.clone()),
			}
		}
		self.merge_components(&payload.components);
		true
	}

	fn merge_components(&mut self, diffs: &BTreeMap<Cid, NodeDiff>) {
		if diffs.is_empty() {
			return;
		}
		let _span = trace_span!("merge_components", count = diffs.len()).entered();

		let mut resolved = HashMap::new();
		for &cid in diffs.keys() {
			self.resolve_component(cid, diffs, &mut resolved, &mut Vec::new());
		}
		for (cid, node) in resolved {
			match node {
				Some(node) => {
					let reset = self.components.get(&cid).map_or(false, |existing| existing.reset);
					self.components.insert(cid, Component { node, reset });
				}
				None => warn!("Malformed diff: component {} has no usable template; skipping it.", cid),
			}
		}
	}

	/// Resolves the merged node of `cid` against the component table as it was before this batch.
	fn resolve_component(
		&self,
		cid: Cid,
		diffs: &BTreeMap<Cid, NodeDiff>,
		resolved: &mut HashMap<Cid, Option<TemplateNode>>,
		resolving: &mut Vec<Cid>,
	) -> Option<TemplateNode> {
		if let Some(node) = resolved.get(&cid) {
			return node.clone();
		}
		if resolving.contains(&cid) {
			warn!("Component {} borrows its template from itself.", cid);
			return None;
		}
		let Some(diff) = diffs.get(&cid) else {
			warn!("Component {} is referenced as template source but not part of the batch.", cid);
			return None;
		};

		resolving.push(cid);
		let node = match diff.statics.clone() {
			Some(Statics::Template(statics)) => Some(build_template(statics, diff.clone())),
			Some(Statics::Component(source)) => {
				let source = if source > 0 {
					Cid::try_from(source)
						.ok()
						.and_then(|source| self.resolve_component(source, diffs, resolved, resolving))
				} else {
					source
						.checked_neg()
						.and_then(|source| Cid::try_from(source).ok())
						.and_then(|source| self.components.get(&source))
						.map(|source| source.node.clone())
				};
				source.map(|mut node| {
					prune_magic_ids(&mut node);
					let mut diff = diff.clone();
					diff.statics = None;
					merge_template(&mut node, diff);
					node
				})
			}
			None => self.components.get(&cid).map(|existing| {
				let mut node = existing.node.clone();
				merge_template(&mut node, diff.clone());
				node
			}),
		};
		resolving.pop();

		resolved.insert(cid, node.clone());
		node
	}

	/// Stringifies the tree.
	///
	/// With `only_cids`, components that aren't listed are emitted as skip markers.
	#[instrument(skip(self, only_cids), fields(fragment = %self.fragment))]
	pub fn to_markup(&mut self, only_cids: Option<&[Cid]>) -> Rendering {
		let only_cids: Option<HashSet<Cid>> = only_cids.map(|cids| cids.iter().copied().collect());
		let change_tracking = !core::mem::take(&mut self.force_full);
		let mut renderer = Renderer {
			fragment: &self.fragment,
			components: &mut self.components,
			only_cids: only_cids.as_ref(),
			next_magic_id: &mut self.next_magic_id,
			depth_limit: self.depth_limit,
			full: !change_tracking,
			streams: Vec::new(),
		};
		let mut markup = String::new();
		renderer.template(&mut self.root, &mut markup, change_tracking, 0);
		Rendering {
			markup,
			streams: renderer.streams,
		}
	}

	/// Stringifies one component, rooted at its magic-id element, for component-only patches.
	#[instrument(skip(self), fields(fragment = %self.fragment))]
	pub fn component_to_markup(&mut self, cid: Cid) -> Rendering {
		let full = core::mem::take(&mut self.force_full);
		let mut renderer = Renderer {
			fragment: &self.fragment,
			components: &mut self.components,
			only_cids: None,
			next_magic_id: &mut self.next_magic_id,
			depth_limit: self.depth_limit,
			full,
			streams: Vec::new(),
		};
		let mut markup = String::new();
		renderer.component(cid, &mut markup, 0);
		Rendering {
			markup,
			streams: renderer.streams,
		}
	}

	/// Drops components whose destruction the server confirmed.
	pub fn prune_cids(&mut self, cids: &[Cid]) {
		for cid in cids {
			if self.components.remove(cid).is_none() {
				trace!("Component {} was already pruned.", cid);
			}
		}
	}

	/// Disables change tracking for the next render of `cid`. Its elements may have been removed from the document.
	pub fn reset_render(&mut self, cid: Cid) {
		if let Some(component) = self.components.get_mut(&cid) {
			component.reset = true;
		}
	}

	/// The next render ignores change tracking.
	pub fn force_full_render(&mut self) {
		self.force_full = true;
	}

	#[must_use]
	pub fn is_component_only(payload: &DiffPayload) -> bool {
		payload.is_component_only()
	}

	#[must_use]
	pub fn component_cids(payload: &DiffPayload) -> Vec<Cid> {
		payload.component_cids()
	}

	#[must_use]
	pub fn has_component(&self, cid: Cid) -> bool {
		self.components.contains_key(&cid)
	}

	/// Ids of all components in the table, sorted.
	#[must_use]
	pub fn components(&self) -> Vec<Cid> {
		let mut cids: Vec<Cid> = self.components.keys().copied().collect();
		cids.sort_unstable();
		cids
	}
}

struct Renderer<'a> {
	fragment: &'a str,
	components: &'a mut HashMap<Cid, Component>,
	only_cids: Option<&'a HashSet<Cid>>,
	next_magic_id: &'a mut u64,
	depth_limit: usize,
	full: bool,
	streams: Vec<StreamOp>,
}

impl Renderer<'_> {
	fn next_magic_id(&mut self) -> String {
		*self.next_magic_id += 1;
		format!("m{}-{}", self.next_magic_id, self.fragment)
	}

	fn template(&mut self, node: &mut TemplateNode, out: &mut String, change_tracking: bool, depth: usize) {
		if depth > self.depth_limit {
			error!("Depth limit of {} exceeded while rendering; emitting a placeholder.", self.depth_limit);
			out.push_str(&placeholder(node.magic_id.as_deref()));
			return;
		}
		if !node.root {
			self.literals(node, out, change_tracking, depth);
			return;
		}

		if change_tracking && node.magic_id.is_none() {
			node.new_render = true;
			node.magic_id = Some(self.next_magic_id());
		}
		let skip = change_tracking && !node.new_render;
		node.new_render = false;

		if skip {
			if let (Some(magic_id), Some(tag)) = (&node.magic_id, node.statics.first().and_then(|s| leading_tag_name(s))) {
				trace!(magic_id = %magic_id, "Unchanged root.");
				out.push_str(&skip_marker(&tag, magic_id));
				return;
			}
		}

		let mut inner = String::new();
		self.literals(node, &mut inner, change_tracking, depth);
		let mut attributes = Vec::with_capacity(2);
		if let Some(magic_id) = &node.magic_id {
			attributes.push((MAGIC_ID, Some(magic_id.as_str())));
		}
		if skip {
			attributes.push((SKIP, None));
		}
		match annotate_root(&inner, &attributes, skip) {
			Ok(annotated) => out.push_str(&annotated),
			Err(error) => {
				if cfg!(feature = "dangerous-logging") {
					error!(magic_id = ?node.magic_id, "Malformed root ({}): {:?}", error, inner);
				} else {
					error!(magic_id = ?node.magic_id, "Malformed root ({}), {} bytes.", error, inner.len());
				}
				out.push_str(&placeholder(node.magic_id.as_deref()));
			}
		}
	}

	fn literals(&mut self, node: &mut TemplateNode, out: &mut String, change_tracking: bool, depth: usize) {
		let statics = node.statics.clone();
		self.interleave(&statics, &mut node.slots, out, change_tracking, depth);
	}

	fn interleave(&mut self, statics: &[String], slots: &mut [Dynamic], out: &mut String, change_tracking: bool, depth: usize) {
		let Some((first, rest)) = statics.split_first() else {
			return;
		};
		out.push_str(first);
		for (literal, slot) in rest.iter().zip(slots.iter_mut()) {
			self.dynamic(slot, out, change_tracking, depth + 1);
			out.push_str(literal);
		}
	}

	fn dynamic(&mut self, slot: &mut Dynamic, out: &mut String, change_tracking: bool, depth: usize) {
		match slot {
			Dynamic::Empty => (),
			Dynamic::Text(text) => out.push_str(text),
			Dynamic::Component(cid) => self.component(*cid, out, depth),
			Dynamic::Template(node) => self.template(node, out, change_tracking, depth),
			Dynamic::Keyed(keyed) => self.keyed(keyed, out, depth),
		}
	}

	fn keyed(&mut self, keyed: &mut KeyedNode, out: &mut String, depth: usize) {
		let statics = keyed.statics.clone();
		for entry in &mut keyed.entries {
			// Entries move around, so there's nothing to track them against.
			self.interleave(&statics, &mut entry.slots, out, false, depth);
		}
		let consumed = keyed.stream.as_ref().map_or(false, |stream| {
			!keyed.entries.is_empty() || !stream.deletes.is_empty() || stream.reset
		});
		if consumed {
			if let Some(stream) = keyed.stream.take() {
				self.streams.push(stream);
			}
			keyed.entries.clear();
		}
	}

	fn component(&mut self, cid: Cid, out: &mut String, depth: usize) {
		// Taken out while rendering, which also stops reference cycles.
		let Some(mut component) = self.components.remove(&cid) else {
			error!("Missing component {}; emitting a placeholder.", cid);
			out.push_str(&placeholder(None));
			return;
		};
		let skip = self.only_cids.map_or(false, |only| !only.contains(&cid));
		component.node.new_render = !skip;
		component.node.magic_id = Some(component_magic_id(cid));
		component.node.root = true;
		let change_tracking = !component.reset && !self.full;
		self.template(&mut component.node, out, change_tracking, depth);
		component.reset = false;
		self.components.insert(cid, component);
	}
}
