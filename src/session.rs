//! Fragment lifecycle: joining, diff routing, acknowledgements and destruction.
//!
//! Each fragment moves through [`JoinState::PendingJoin`], [`JoinState::Joined`] and finally
//! [`JoinState::Destroyed`]. A fragment whose join reply arrives while its parent hasn't applied its own join patch is
//! part of that parent's join batch: its patch is queued on the batch root and runs, in queue order, once every
//! fragment of the batch has replied. All other fragments (the root, rejoins, and children of joined parents) start a
//! batch of their own.
//!
//! Notifications and unlock callbacks are only surfaced after a pass completes.

use crate::{
	config::Config,
	dom::{Document, NodeId},
	markup::{parse_fragment, VElement, VNode},
	reconcile::{PatchReport, Reconciler},
	ref_ledger::{Ref, RefLedger, RefNotice, RefOptions, Undo},
	rendered::{component_magic_id, DiffTree, Rendering},
	wire::{Cid, DecodeError, DiffPayload, OutboundEvent, Reply},
	FRAGMENT, HOOK, MAGIC_ID, REF_ATTRIBUTES, REF_SRC,
};
use core::fmt::{self, Display, Formatter};
use hashbrown::HashMap;
use serde_json::Value;
use std::{collections::VecDeque, rc::Rc};
use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId(Rc<str>);
impl FragmentId {
	#[must_use]
	pub fn new(id: &str) -> Self {
		Self(id.into())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl From<&str> for FragmentId {
	fn from(id: &str) -> Self {
		Self::new(id)
	}
}
impl From<String> for FragmentId {
	fn from(id: String) -> Self {
		Self(id.into())
	}
}
impl Display for FragmentId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
	PendingJoin,
	Joined,
	Destroyed,
}

/// The connection to the server, as far as the session is concerned.
///
/// Replies are routed back through [`Session::handle_join_reply`] and [`Session::handle_reply`].
pub trait Transport {
	fn join(&mut self, fragment: &FragmentId, parent: Option<&FragmentId>);
	fn push(&mut self, fragment: &FragmentId, event: OutboundEvent);
	fn leave(&mut self, fragment: &FragmentId);
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
	Joined {
		fragment: FragmentId,
	},
	Mounted {
		fragment: FragmentId,
		element: NodeId,
		hook: String,
	},
	Updated {
		fragment: FragmentId,
		element: NodeId,
		hook: String,
	},
	/// `element` is no longer valid.
	Destroyed {
		fragment: FragmentId,
		element: NodeId,
		hook: String,
	},
	UndoLock {
		fragment: FragmentId,
		element: NodeId,
		r#ref: Ref,
	},
	UndoLoading {
		fragment: FragmentId,
		element: NodeId,
		r#ref: Ref,
	},
	/// No element holds these refs anymore.
	RefsSettled {
		fragment: FragmentId,
		refs: Vec<Ref>,
	},
	ServerEvent {
		fragment: FragmentId,
		name: String,
		payload: Value,
	},
	Reply {
		fragment: FragmentId,
		r#ref: Ref,
		payload: Value,
	},
	Title {
		fragment: FragmentId,
		title: String,
	},
}

#[derive(Debug, Error)]
pub enum SessionError {
	#[error("unknown fragment {0}")]
	UnknownFragment(FragmentId),
	#[error("fragment {0} is already mounted")]
	AlreadyMounted(FragmentId),
	#[error("fragment {0} is not joined")]
	NotJoined(FragmentId),
	#[error("fragment {0} isn't waiting for a join reply")]
	UnexpectedJoin(FragmentId),
	#[error("the container of fragment {0} is not a live element")]
	MissingContainer(FragmentId),
	#[error(transparent)]
	Decode(#[from] DecodeError),
}

#[derive(Debug)]
struct JoinOp {
	fragment: FragmentId,
	rendering: Rendering,
	events: Vec<(String, Value)>,
	title: Option<String>,
}

#[derive(Debug)]
struct Fragment {
	parent: Option<FragmentId>,
	children: Vec<FragmentId>,
	container: Option<NodeId>,
	state: JoinState,
	/// Whether the current join patch was applied.
	applied: bool,
	join_count: u32,
	tree: Option<DiffTree>,
	ledger: RefLedger,
	queued_diffs: VecDeque<DiffPayload>,
	batch_root: Option<FragmentId>,
	/// Children of the batch that haven't completed their join yet.
	child_joins: usize,
	/// Whether the parent waits for this fragment to complete its join.
	counted_by_parent: bool,
	/// Only used on batch roots.
	pending_ops: Vec<JoinOp>,
}

impl Fragment {
	fn new(id: &FragmentId, parent: Option<FragmentId>, container: Option<NodeId>, counted_by_parent: bool) -> Self {
		Self {
			parent,
			children: Vec::new(),
			container,
			state: JoinState::PendingJoin,
			applied: false,
			join_count: 0,
			tree: None,
			ledger: RefLedger::new(id.as_str()),
			queued_diffs: VecDeque::new(),
			batch_root: None,
			child_joins: 0,
			counted_by_parent,
			pending_ops: Vec::new(),
		}
	}
}

/// Nested fragment ids, without descending into their containers.
fn nested_fragments(nodes: &[VNode], found: &mut Vec<String>) {
	for node in nodes {
		if let VNode::Element(element) = node {
			match element.attribute(FRAGMENT) {
				Some(fragment) => found.push(fragment.to_owned()),
				None => nested_fragments(&element.children, found),
			}
		}
	}
}

fn component_elements(document: &Document, container: NodeId, cid: Cid) -> Vec<NodeId> {
	let magic_id = component_magic_id(cid);
	document
		.descendants(container, |document, node| document.has_attribute(node, FRAGMENT))
		.into_iter()
		.filter(|&node| document.attribute(node, MAGIC_ID) == Some(magic_id.as_str()))
		.collect()
}

/// Elements of `cids` that aren't inside an element of another of `cids`.
fn outermost_components(document: &Document, container: NodeId, cids: &[Cid]) -> Vec<(Cid, NodeId)> {
	let all: Vec<(Cid, NodeId)> = cids
		.iter()
		.flat_map(|&cid| component_elements(document, container, cid).into_iter().map(move |node| (cid, node)))
		.collect();
	all.iter()
		.copied()
		.filter(|&(_, node)| {
			!all.iter()
				.any(|&(_, other)| other != node && document.is_inclusive_ancestor(other, node))
		})
		.collect()
}

fn strip_ref_attributes(element: &mut VElement) {
	element.attributes.retain(|(name, _)| !REF_ATTRIBUTES.contains(&name.as_str()));
	for child in &mut element.children {
		if let VNode::Element(child) = child {
			strip_ref_attributes(child);
		}
	}
}

pub struct Session<T: Transport> {
	transport: T,
	document: Document,
	config: Config,
	fragments: HashMap<FragmentId, Fragment>,
	/// Recently destroyed fragments, oldest first.
	tombstones: VecDeque<FragmentId>,
	notifications: Vec<Notification>,
	deferred: Vec<Box<dyn FnOnce()>>,
}

impl<T: Transport> Session<T> {
	pub fn new(transport: T, config: Config) -> Self {
		Self::with_document(transport, Document::new(), config)
	}

	pub fn with_document(transport: T, document: Document, config: Config) -> Self {
		Self {
			transport,
			document,
			config,
			fragments: HashMap::new(),
			tombstones: VecDeque::new(),
			notifications: Vec::new(),
			deferred: Vec::new(),
		}
	}

	pub fn document(&self) -> &Document {
		&self.document
	}

	/// For host-side mutations between passes.
	pub fn document_mut(&mut self) -> &mut Document {
		&mut self.document
	}

	pub fn transport(&self) -> &T {
		&self.transport
	}

	pub fn transport_mut(&mut self) -> &mut T {
		&mut self.transport
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	#[must_use]
	pub fn state(&self, fragment: &FragmentId) -> Option<JoinState> {
		match self.fragments.get(fragment) {
			Some(fragment) => Some(fragment.state),
			None if self.tombstones.contains(fragment) => Some(JoinState::Destroyed),
			None => None,
		}
	}

	#[must_use]
	pub fn container(&self, fragment: &FragmentId) -> Option<NodeId> {
		self.fragments.get(fragment).and_then(|fragment| fragment.container)
	}

	#[must_use]
	pub fn tree(&self, fragment: &FragmentId) -> Option<&DiffTree> {
		self.fragments.get(fragment).and_then(|fragment| fragment.tree.as_ref())
	}

	#[must_use]
	pub fn children(&self, fragment: &FragmentId) -> &[FragmentId] {
		self.fragments.get(fragment).map_or(&[], |fragment| &fragment.children)
	}

	/// Notifications surfaced since the last call, in order.
	pub fn drain_notifications(&mut self) -> Vec<Notification> {
		core::mem::take(&mut self.notifications)
	}

	fn is_live(&self, fragment: &FragmentId) -> bool {
		self.fragments.get(fragment).map_or(false, |fragment| fragment.state != JoinState::Destroyed)
	}

	fn insert_fragment(&mut self, id: &FragmentId, fragment: Fragment) {
		self.tombstones.retain(|tombstone| tombstone != id);
		self.fragments.insert(id.clone(), fragment);
	}

	fn bury(&mut self, id: &FragmentId) {
		self.fragments.remove(id);
		if self.config.tombstone_limit == 0 {
			return;
		}
		if self.tombstones.len() >= self.config.tombstone_limit {
			self.tombstones.pop_front();
		}
		self.tombstones.push_back(id.clone());
	}

	fn flush(&mut self) {
		for callback in core::mem::take(&mut self.deferred) {
			callback();
		}
	}

	/// Mounts a root fragment into `container` and asks the transport to join it.
	///
	/// # Errors
	///
	/// Iff `fragment` is already live or `container` isn't a live element.
	#[instrument(skip(self))]
	pub fn mount(&mut self, fragment: &FragmentId, container: NodeId) -> Result<(), SessionError> {
		if self.is_live(fragment) {
			return Err(SessionError::AlreadyMounted(fragment.clone()));
		}
		if !self.document.is_element(container) {
			return Err(SessionError::MissingContainer(fragment.clone()));
		}
		self.document.set_attribute(container, FRAGMENT, fragment.as_str());
		self.insert_fragment(fragment, Fragment::new(fragment, None, Some(container), false));
		self.transport.join(fragment, None);
		Ok(())
	}

	/// # Errors
	///
	/// Iff `fragment` is unknown, isn't waiting for a join reply, or the payload can't be rendered.
	/// Replies for destroyed fragments are ignored.
	#[instrument(skip(self, payload))]
	pub fn handle_join_reply(&mut self, fragment: &FragmentId, payload: &DiffPayload) -> Result<(), SessionError> {
		let result = self.join_reply(fragment, payload);
		self.flush();
		result
	}

	fn join_reply(&mut self, id: &FragmentId, payload: &DiffPayload) -> Result<(), SessionError> {
		let batch_root = {
			match self.state(id) {
				None => return Err(SessionError::UnknownFragment(id.clone())),
				Some(JoinState::Destroyed) => {
					trace!("Ignoring the join reply of a destroyed fragment.");
					return Ok(());
				}
				Some(JoinState::Joined) => return Err(SessionError::UnexpectedJoin(id.clone())),
				Some(JoinState::PendingJoin) => (),
			}
			let fragment = self.fragments.get(id).ok_or_else(|| SessionError::UnknownFragment(id.clone()))?;
			let parent = fragment.parent.as_ref().and_then(|parent| self.fragments.get(parent).map(|p| (parent, p)));
			let batch_root = match parent {
				Some((parent_id, parent)) if fragment.join_count == 0 && parent.state == JoinState::PendingJoin && !parent.applied => {
					parent.batch_root.clone().unwrap_or_else(|| parent_id.clone())
				}
				_ => id.clone(),
			};
			batch_root
		};

		let config = self.config;
		let mut tree = match DiffTree::new(id.as_str(), payload, &config) {
			Ok(tree) => tree,
			Err(error) => {
				if batch_root != *id {
					self.abandon_join(id, &error);
				}
				return Err(error.into());
			}
		};
		let rendering = tree.to_markup(None);

		let mut found = Vec::new();
		nested_fragments(&parse_fragment(&rendering.markup), &mut found);
		let discovered: Vec<FragmentId> = found
			.into_iter()
			.map(FragmentId::from)
			.filter(|child| !self.is_live(child))
			.collect();
		debug!(children = discovered.len(), batch_root = %batch_root, "Join reply rendered.");

		if let Some(fragment) = self.fragments.get_mut(id) {
			fragment.tree = Some(tree);
			fragment.join_count += 1;
			fragment.batch_root = Some(batch_root.clone());
			fragment.child_joins = discovered.len();
			fragment.children.extend(discovered.iter().cloned());
		}
		if let Some(root) = self.fragments.get_mut(&batch_root) {
			root.pending_ops.push(JoinOp {
				fragment: id.clone(),
				rendering,
				events: payload.events.clone(),
				title: payload.title.clone(),
			});
		}

		for child in &discovered {
			self.insert_fragment(child, Fragment::new(child, Some(id.clone()), None, true));
			self.transport.join(child, Some(id));
		}
		if discovered.is_empty() {
			self.join_complete(id);
		}
		Ok(())
	}

	/// Lets the batch of `id` continue without it. Its container keeps whatever it holds.
	fn abandon_join(&mut self, id: &FragmentId, error: &DecodeError) {
		error!(fragment = %id, %error, "Unusable join reply; the rest of the batch is applied without it.");
		let parent = self.fragments.get_mut(id).and_then(|fragment| {
			if !core::mem::take(&mut fragment.counted_by_parent) {
				return None;
			}
			fragment.parent.clone()
		});
		if let Some(parent) = parent {
			self.child_finished(&parent);
		}
	}

	/// `id` and all of its batch children replied.
	fn join_complete(&mut self, id: &FragmentId) {
		let Some(fragment) = self.fragments.get_mut(id) else {
			return;
		};
		if fragment.batch_root.as_ref() == Some(id) {
			self.run_batch(id);
			return;
		}
		fragment.counted_by_parent = false;
		if let Some(parent) = fragment.parent.clone() {
			self.child_finished(&parent);
		}
	}

	fn child_finished(&mut self, parent: &FragmentId) {
		let Some(fragment) = self.fragments.get_mut(parent) else {
			return;
		};
		if fragment.state == JoinState::Destroyed || fragment.child_joins == 0 {
			return;
		}
		fragment.child_joins -= 1;
		if fragment.child_joins == 0 && fragment.tree.is_some() && !fragment.applied {
			self.join_complete(parent);
		}
	}

	fn run_batch(&mut self, root: &FragmentId) {
		let ops = match self.fragments.get_mut(root) {
			Some(fragment) => core::mem::take(&mut fragment.pending_ops),
			None => return,
		};
		info!(batch_root = %root, fragments = ops.len(), "Applying join batch.");
		for op in ops {
			if self.is_live(&op.fragment) {
				self.apply_join_patch(op);
			}
		}
	}

	fn apply_join_patch(&mut self, op: JoinOp) {
		let id = op.fragment;
		let Some(container) = self.container(&id).filter(|&container| self.document.is_element(container)) else {
			error!(fragment = %id, "No live container for the join patch; the fragment stays pending.");
			return;
		};

		let report = Reconciler::new(&mut self.document, &self.config)
			.with_streams(op.rendering.streams)
			.patch_inner(container, &op.rendering.markup);
		let queued = match self.fragments.get_mut(&id) {
			Some(fragment) => {
				fragment.state = JoinState::Joined;
				fragment.applied = true;
				core::mem::take(&mut fragment.queued_diffs)
			}
			None => return,
		};
		self.notifications.push(Notification::Joined { fragment: id.clone() });
		self.process_report(&id, report, false);
		self.surface(&id, op.events, op.title);

		for diff in queued {
			if self.state(&id) == Some(JoinState::Joined) {
				self.apply_diff(&id, &diff);
			}
		}
	}

	fn surface(&mut self, id: &FragmentId, events: Vec<(String, Value)>, title: Option<String>) {
		for (name, payload) in events {
			self.notifications.push(Notification::ServerEvent {
				fragment: id.clone(),
				name,
				payload,
			});
		}
		if let Some(title) = title {
			self.notifications.push(Notification::Title {
				fragment: id.clone(),
				title,
			});
		}
	}

	/// Merges and applies a server diff, or queues it while the fragment is joining.
	///
	/// # Errors
	///
	/// Iff `fragment` is unknown. Diffs for destroyed fragments are dropped.
	#[instrument(skip(self, payload))]
	pub fn handle_diff(&mut self, fragment: &FragmentId, payload: DiffPayload) -> Result<(), SessionError> {
		match self.state(fragment) {
			None => return Err(SessionError::UnknownFragment(fragment.clone())),
			Some(JoinState::Destroyed) => trace!("Dropping a diff for a destroyed fragment."),
			Some(JoinState::PendingJoin) => {
				if let Some(pending) = self.fragments.get_mut(fragment) {
					pending.queued_diffs.push_back(payload);
				}
			}
			Some(JoinState::Joined) => self.apply_diff(fragment, &payload),
		}
		self.flush();
		Ok(())
	}

	fn apply_diff(&mut self, id: &FragmentId, payload: &DiffPayload) {
		let config = self.config;
		let Some(fragment) = self.fragments.get_mut(id) else {
			return;
		};
		let (Some(container), Some(tree)) = (fragment.container, fragment.tree.as_mut()) else {
			warn!(fragment = %id, "Joined fragment without container or tree; dropping the diff.");
			return;
		};
		if !tree.merge(payload) {
			return;
		}

		let cids = payload.component_cids();
		let mut report = if payload.is_component_only() {
			let mut report = PatchReport::default();
			for (cid, element) in outermost_components(&self.document, container, &cids) {
				let rendering = tree.component_to_markup(cid);
				report.merge(
					Reconciler::new(&mut self.document, &config)
						.with_streams(rendering.streams)
						.patch_outer(element, &rendering.markup),
				);
			}
			report
		} else {
			let rendering = tree.to_markup(Some(&cids));
			Reconciler::new(&mut self.document, &config)
				.with_streams(rendering.streams)
				.patch_inner(container, &rendering.markup)
		};

		if !report.missing_skips.is_empty() && config.full_render_retry {
			warn!(
				fragment = %id,
				"{} skip marker(s) could not be resolved; rendering again without change tracking.",
				report.missing_skips.len()
			);
			tree.force_full_render();
			let rendering = tree.to_markup(None);
			let retry = Reconciler::new(&mut self.document, &config)
				.with_streams(rendering.streams)
				.patch_inner(container, &rendering.markup);
			report.missing_skips.clear();
			report.merge(retry);
		}

		self.process_report(id, report, true);
		self.surface(id, payload.events.clone(), payload.title.clone());
	}

	fn process_report(&mut self, id: &FragmentId, report: PatchReport, propose_destroy: bool) {
		for (source, element_ref) in report.removed_refs {
			match self.fragments.values_mut().find(|fragment| fragment.ledger.source() == source) {
				Some(fragment) => fragment.ledger.forget(element_ref),
				None => trace!("Removed element held refs of an unknown fragment."),
			}
		}

		for element in report.added {
			if let Some(hook) = self.document.attribute(element, HOOK) {
				self.notifications.push(Notification::Mounted {
					fragment: id.clone(),
					element,
					hook: hook.to_owned(),
				});
			}
		}
		for element in report.updated {
			if let Some(hook) = self.document.attribute(element, HOOK) {
				self.notifications.push(Notification::Updated {
					fragment: id.clone(),
					element,
					hook: hook.to_owned(),
				});
			}
		}
		for removed in report.removed {
			self.notifications.push(Notification::Destroyed {
				fragment: id.clone(),
				element: removed.element,
				hook: removed.hook,
			});
		}

		for child in report.fragments_removed {
			let child = FragmentId::from(child);
			if self.is_live(&child) {
				self.destroy_fragment(&child);
			}
		}
		for (child, container) in report.fragments {
			let child = FragmentId::from(child);
			if self.is_live(&child) {
				if let Some(fragment) = self.fragments.get_mut(&child) {
					fragment.container = Some(container);
				}
				continue;
			}
			trace!(child = %child, "Joining a newly added fragment.");
			self.insert_fragment(&child, Fragment::new(&child, Some(id.clone()), Some(container), false));
			if let Some(fragment) = self.fragments.get_mut(id) {
				fragment.children.push(child.clone());
			}
			self.transport.join(&child, Some(id));
		}

		if propose_destroy && !report.removed_cids.is_empty() {
			self.propose_destroy(id, &report.removed_cids);
		}
		self.settle(id);
	}

	fn settle(&mut self, id: &FragmentId) {
		if let Some(fragment) = self.fragments.get_mut(id) {
			let refs = fragment.ledger.settle();
			if !refs.is_empty() {
				self.notifications.push(Notification::RefsSettled {
					fragment: id.clone(),
					refs,
				});
			}
		}
	}

	fn absent_cids(&self, id: &FragmentId, cids: &[Cid]) -> Vec<Cid> {
		let Some(fragment) = self.fragments.get(id) else {
			return Vec::new();
		};
		let (Some(container), Some(tree)) = (fragment.container, fragment.tree.as_ref()) else {
			return Vec::new();
		};
		cids.iter()
			.copied()
			.filter(|&cid| tree.has_component(cid) && component_elements(&self.document, container, cid).is_empty())
			.collect()
	}

	fn propose_destroy(&mut self, id: &FragmentId, cids: &[Cid]) {
		let will_destroy = self.absent_cids(id, cids);
		if will_destroy.is_empty() {
			return;
		}
		if let Some(tree) = self.fragments.get_mut(id).and_then(|fragment| fragment.tree.as_mut()) {
			for &cid in &will_destroy {
				tree.reset_render(cid);
			}
		}
		debug!(fragment = %id, cids = ?will_destroy, "Proposing component destruction.");
		self.transport.push(id, OutboundEvent::cids_will_destroy(&will_destroy));
	}

	/// Puts a ref on `targets` and pushes `event` carrying it.
	///
	/// # Errors
	///
	/// Iff `fragment` is unknown or not joined.
	#[instrument(skip(self, targets, event), fields(targets = targets.len()))]
	pub fn push_event(
		&mut self,
		fragment: &FragmentId,
		targets: &[NodeId],
		event: OutboundEvent,
		options: RefOptions,
	) -> Result<Ref, SessionError> {
		let buried = self.tombstones.contains(fragment);
		let pending = match self.fragments.get_mut(fragment) {
			None if buried => return Err(SessionError::NotJoined(fragment.clone())),
			None => return Err(SessionError::UnknownFragment(fragment.clone())),
			Some(pending) if pending.state != JoinState::Joined => return Err(SessionError::NotJoined(fragment.clone())),
			Some(pending) => pending,
		};
		let r = pending.ledger.put_ref(&mut self.document, targets, options);
		self.transport.push(fragment, OutboundEvent { r#ref: Some(r), ..event });
		Ok(r)
	}

	/// # Errors
	///
	/// Iff `fragment` is unknown. Replies for destroyed or rejoining fragments are ignored.
	#[instrument(skip(self, reply))]
	pub fn handle_reply(&mut self, fragment: &FragmentId, reply: Reply) -> Result<(), SessionError> {
		match self.state(fragment) {
			None => return Err(SessionError::UnknownFragment(fragment.clone())),
			Some(JoinState::Joined) => (),
			Some(state) => {
				trace!(?state, "Ignoring a late reply.");
				return Ok(());
			}
		}
		match reply {
			Reply::Ack { r#ref, diff } => {
				self.undo(fragment, r#ref);
				if let Some(diff) = diff {
					self.apply_diff(fragment, &diff);
					if let Some(payload) = diff.reply {
						self.notifications.push(Notification::Reply {
							fragment: fragment.clone(),
							r#ref,
							payload,
						});
					}
				}
			}
			Reply::CidsWillDestroy { cids } => {
				let destroyed = self.absent_cids(fragment, &cids);
				if !destroyed.is_empty() {
					self.transport.push(fragment, OutboundEvent::cids_destroyed(&destroyed));
				}
			}
			Reply::CidsDestroyed { cids } => {
				if let Some(tree) = self.fragments.get_mut(fragment).and_then(|fragment| fragment.tree.as_mut()) {
					tree.prune_cids(&cids);
				}
			}
		}
		self.flush();
		Ok(())
	}

	fn undo(&mut self, id: &FragmentId, ack: Ref) {
		let Some(fragment) = self.fragments.get_mut(id) else {
			return;
		};
		let Some(container) = fragment.container else {
			return;
		};
		let undos = fragment.ledger.undo_refs(&mut self.document, container, ack);
		for undo in undos {
			self.apply_undo(id, undo, Some(ack));
		}
		self.settle(id);
	}

	/// Surfaces the notices of `undo` and, with `ack`, applies its captured clone.
	fn apply_undo(&mut self, id: &FragmentId, undo: Undo, ack: Option<Ref>) {
		let Undo {
			element,
			clone,
			notices,
			callbacks,
		} = undo;
		if let Some(element) = element {
			for notice in notices {
				self.notifications.push(match notice {
					RefNotice::UndoLock(r) => Notification::UndoLock {
						fragment: id.clone(),
						element,
						r#ref: r,
					},
					RefNotice::UndoLoading(r) => Notification::UndoLoading {
						fragment: id.clone(),
						element,
						r#ref: r,
					},
				});
			}
		}
		if let Some(clone) = clone {
			if let (Some(ack), Some(element)) = (ack, element.filter(|&element| self.document.contains(element))) {
				if let Some(VNode::Element(mut root)) = self.document.to_vnode(clone) {
					strip_ref_attributes(&mut root);
					let report = Reconciler::new(&mut self.document, &self.config)
						.with_undo_ref(ack)
						.patch_element(element, &root);
					self.process_report(id, report, true);
				}
			}
			self.document.remove(clone);
		}
		self.deferred.extend(callbacks);
	}

	/// Runs `callback` once `element` is unlocked, after the current pass at the earliest.
	pub fn on_unlock(&mut self, element: NodeId, callback: impl FnOnce() + 'static) {
		RefLedger::on_unlock(&mut self.document, element, callback);
	}

	/// Forces a reconnect of `fragment`: its children are destroyed, its refs released, and it waits for a new join
	/// reply.
	///
	/// # Errors
	///
	/// Iff `fragment` isn't live.
	#[instrument(skip(self))]
	pub fn rejoin(&mut self, fragment: &FragmentId) -> Result<(), SessionError> {
		if !self.is_live(fragment) {
			return Err(SessionError::UnknownFragment(fragment.clone()));
		}
		let children = self
			.fragments
			.get_mut(fragment)
			.map(|f| core::mem::take(&mut f.children))
			.unwrap_or_default();
		for child in &children {
			self.destroy_fragment(child);
		}

		let mut parent = None;
		let mut undos = Vec::new();
		if let Some(f) = self.fragments.get_mut(fragment) {
			if let Some(container) = f.container {
				undos = f.ledger.undo_refs(&mut self.document, container, Ref::MAX);
			}
			f.ledger.clear();
			f.state = JoinState::PendingJoin;
			f.applied = false;
			f.tree = None;
			f.queued_diffs.clear();
			f.pending_ops.clear();
			f.batch_root = None;
			f.child_joins = 0;
			parent = f.parent.clone();
		}
		for undo in undos {
			// The next join patch replaces whatever the clones captured.
			self.apply_undo(fragment, undo, None);
		}
		self.transport.join(fragment, parent.as_ref());
		self.flush();
		Ok(())
	}

	/// Destroys `fragment` and its descendants, cancelling their queued work.
	///
	/// # Errors
	///
	/// Iff `fragment` is unknown.
	#[instrument(skip(self))]
	pub fn destroy(&mut self, fragment: &FragmentId) -> Result<(), SessionError> {
		match self.state(fragment) {
			None => return Err(SessionError::UnknownFragment(fragment.clone())),
			Some(JoinState::Destroyed) => trace!("Fragment is already destroyed."),
			Some(_) => self.destroy_fragment(fragment),
		}
		self.flush();
		Ok(())
	}

	fn destroy_fragment(&mut self, id: &FragmentId) {
		let Some(fragment) = self.fragments.get_mut(id) else {
			return;
		};
		if fragment.state == JoinState::Destroyed {
			return;
		}
		let was_counted = fragment.counted_by_parent && !fragment.applied;
		fragment.state = JoinState::Destroyed;
		fragment.tree = None;
		fragment.queued_diffs.clear();
		fragment.pending_ops.clear();
		fragment.counted_by_parent = false;
		let children = core::mem::take(&mut fragment.children);
		let parent = fragment.parent.clone();
		let container = fragment.container;
		let batch_root = fragment.batch_root.clone();
		debug!(fragment = %id, children = children.len(), "Destroying fragment.");

		if let Some(container) = container.filter(|&container| self.document.contains(container)) {
			let mut elements = vec![container];
			elements.extend(self.document.descendants(container, |_, _| false));
			let mut clones = Vec::new();
			for element in elements {
				if self.document.attribute(element, REF_SRC) == Some(id.as_str()) {
					if let Some(private) = self.document.private_mut(element) {
						private.unlock_callbacks.clear();
						private.pending_refs.clear();
						clones.extend(private.lock_clone.take());
					}
					self.document.compact_private(element);
				}
			}
			for clone in clones {
				self.document.remove(clone);
			}
		}
		if let Some(root) = batch_root.filter(|root| root != id) {
			if let Some(root) = self.fragments.get_mut(&root) {
				root.pending_ops.retain(|op| op.fragment != *id);
			}
		}
		self.transport.leave(id);

		for child in &children {
			self.destroy_fragment(child);
		}
		if let Some(parent) = parent {
			if let Some(fragment) = self.fragments.get_mut(&parent) {
				fragment.children.retain(|child| child != id);
			}
			if was_counted {
				self.child_finished(&parent);
			}
		}
		self.bury(id);
	}
}
