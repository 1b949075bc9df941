//! Optimistic loading and lock refs on elements, and their release by acknowledgements.
//!
//! An element carries at most one loading ref and one lock ref, as [`REF_LOADING`] and [`REF_LOCK`] attributes.
//! A field is released by any acknowledgement at least as large as its ref. While both fields are newer than an
//! incoming acknowledgement, that acknowledgement is queued on the element and replayed by the next release that gets
//! through, so listeners waiting for the older ref aren't left hanging.

use crate::{
	dom::{Document, NodeId},
	rc_hash_map::RcHashMap,
	REF_DISABLED, REF_LOADING, REF_LOCK, REF_SRC,
};
use core::fmt::{self, Debug, Formatter};
use tracing::{error, instrument, trace, warn};

/// Monotonic per-fragment sequence number of an optimistic interaction.
pub type Ref = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefOptions {
	/// Freeze the elements against server patches until acknowledged.
	pub lock: bool,
	/// Disable the elements until acknowledged.
	pub disable: bool,
}

/// The ref fields of one element, as read from its attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElementRef {
	pub loading: Option<Ref>,
	pub lock: Option<Ref>,
}

fn read_ref(document: &Document, element: NodeId, name: &str) -> Option<Ref> {
	let value = document.attribute(element, name)?;
	match value.parse() {
		Ok(r) => Some(r),
		Err(_) => {
			warn!("Ignoring unparsable {} value.", name);
			None
		}
	}
}

impl ElementRef {
	#[must_use]
	pub fn read(document: &Document, element: NodeId) -> Self {
		Self {
			loading: read_ref(document, element, REF_LOADING),
			lock: read_ref(document, element, REF_LOCK),
		}
	}

	/// Whether `ack` may release anything here, i.e. it isn't blocked by newer refs in both fields.
	#[must_use]
	pub fn is_within(self, ack: Ref) -> bool {
		!(self.loading.map_or(false, |r| r > ack) && self.lock.map_or(false, |r| r > ack))
	}

	#[must_use]
	pub fn is_loading_undone_by(self, ack: Ref) -> bool {
		self.loading.map_or(false, |r| r <= ack)
	}

	#[must_use]
	pub fn is_lock_undone_by(self, ack: Ref) -> bool {
		self.lock.map_or(false, |r| r <= ack)
	}

	/// Loading is only released together with or after the lock.
	#[must_use]
	pub fn can_undo_loading(self, ack: Ref) -> bool {
		self.lock.map_or(true, |r| r <= ack)
	}

	#[must_use]
	pub fn is_fully_resolved_by(self, ack: Ref) -> bool {
		self.loading.map_or(true, |r| r <= ack) && self.lock.map_or(true, |r| r <= ack)
	}

	/// Whether a patch must be captured instead of applied, given the ref currently being undone (if any).
	#[must_use]
	pub fn is_locked_against(self, undo_ref: Option<Ref>) -> bool {
		self.lock.is_some() && undo_ref.map_or(true, |undo_ref| !self.is_lock_undone_by(undo_ref))
	}

	#[must_use]
	pub fn is_idle(self) -> bool {
		self.loading.is_none() && self.lock.is_none()
	}

	fn held(self) -> impl Iterator<Item = Ref> {
		let lock = self.lock.filter(|&lock| Some(lock) != self.loading);
		self.loading.into_iter().chain(lock)
	}

	fn holds(self, r: Ref) -> bool {
		self.loading == Some(r) || self.lock == Some(r)
	}
}

/// Notifications owed to listeners of a ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefNotice {
	UndoLock(Ref),
	UndoLoading(Ref),
}

/// Result of releasing one element.
#[derive(Default)]
pub struct Undo {
	pub element: Option<NodeId>,
	/// Detached subtree with the patches captured while the element was locked.
	pub clone: Option<NodeId>,
	pub notices: Vec<RefNotice>,
	/// Unlock callbacks that became due. These must run after the current pass.
	pub callbacks: Vec<Box<dyn FnOnce()>>,
}
impl Debug for Undo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("Undo")
			.field("element", &self.element)
			.field("clone", &self.clone)
			.field("notices", &self.notices)
			.field("callbacks", &self.callbacks.len())
			.finish()
	}
}

/// Ref bookkeeping of one fragment.
#[derive(Debug)]
pub struct RefLedger {
	source: String,
	last_ref: Ref,
	/// Elements holding each outstanding ref.
	holders: RcHashMap<Ref, u32>,
}

impl RefLedger {
	/// `source` is written to [`REF_SRC`] and identifies this ledger's elements.
	#[must_use]
	pub fn new(source: &str) -> Self {
		Self {
			source: source.to_owned(),
			last_ref: 0,
			holders: RcHashMap::new(),
		}
	}

	#[must_use]
	pub fn source(&self) -> &str {
		&self.source
	}

	#[must_use]
	pub fn last_ref(&self) -> Ref {
		self.last_ref
	}

	/// Whether any element still holds `r`.
	#[must_use]
	pub fn is_outstanding(&self, r: Ref) -> bool {
		self.holders.count(&r).map_or(false, |&count| count > 0)
	}

	/// Assigns the next ref to `elements`.
	#[instrument(skip(self, document, elements), fields(source = %self.source, elements = elements.len()))]
	pub fn put_ref(&mut self, document: &mut Document, elements: &[NodeId], options: RefOptions) -> Ref {
		self.last_ref += 1;
		let r = self.last_ref;
		let value = r.to_string();
		for &element in elements {
			if !document.is_element(element) {
				warn!("Can't put a ref on a non-element or freed node.");
				continue;
			}
			let before = ElementRef::read(document, element);
			document.set_attribute(element, REF_SRC, &self.source);
			document.set_attribute(element, REF_LOADING, &value);
			if options.lock {
				document.set_attribute(element, REF_LOCK, &value);
			}
			if options.disable {
				if !document.has_attribute(element, REF_DISABLED) {
					let disabled = if document.has_attribute(element, "disabled") { "true" } else { "false" };
					document.set_attribute(element, REF_DISABLED, disabled);
				}
				document.set_attribute(element, "disabled", "");
			}
			self.track(before, ElementRef::read(document, element));
		}
		trace!(r, "Put ref.");
		r
	}

	fn track(&mut self, before: ElementRef, after: ElementRef) {
		for r in before.held().filter(|&r| !after.holds(r)) {
			self.release_holder(r);
		}
		for r in after.held().filter(|&r| !before.holds(r)) {
			if self.holders.increment(r).is_err() {
				error!(r, "Holder count saturated.");
			}
		}
	}

	fn release_holder(&mut self, r: Ref) {
		match self.holders.weak_decrement(&r) {
			Ok(Some(_)) => (),
			Ok(None) => trace!(r, "Ref wasn't tracked."),
			Err(_) => error!(r, "Holder count underflow."),
		}
	}

	/// Releases the refs of an element that left the document.
	pub fn forget(&mut self, element_ref: ElementRef) {
		for r in element_ref.held() {
			self.release_holder(r);
		}
	}

	/// Applies acknowledgement `ack` to one element.
	pub fn maybe_undo(&mut self, document: &mut Document, element: NodeId, ack: Ref) -> Undo {
		let before = ElementRef::read(document, element);
		let mut undo = Undo {
			element: Some(element),
			..Undo::default()
		};

		if !before.is_within(ack) {
			trace!(ack, "Queueing blocked acknowledgement.");
			if let Some(private) = document.private_mut(element) {
				private.pending_refs.push(ack);
			}
			return undo;
		}

		if before.is_lock_undone_by(ack) {
			if let Some(private) = document.private_mut(element) {
				undo.clone = private.lock_clone.take();
				let (due, waiting) = core::mem::take(&mut private.unlock_callbacks)
					.into_iter()
					.partition::<Vec<_>, _>(|(r, _)| *r <= ack);
				private.unlock_callbacks = waiting;
				undo.callbacks.extend(due.into_iter().map(|(_, callback)| callback));
			}
			document.remove_attribute(element, REF_LOCK);
			if let Some(lock) = before.lock {
				undo.notices.push(RefNotice::UndoLock(lock));
			}
		}

		if before.is_loading_undone_by(ack) && before.can_undo_loading(ack) {
			document.remove_attribute(element, REF_LOADING);
			match document.remove_attribute(element, REF_DISABLED).as_deref() {
				Some("true") => {
					document.set_attribute(element, "disabled", "");
				}
				Some(_) => {
					document.remove_attribute(element, "disabled");
				}
				None => (),
			}
			if let Some(loading) = before.loading {
				undo.notices.push(RefNotice::UndoLoading(loading));
			}
		}

		if let Some(private) = document.private_mut(element) {
			let pending = core::mem::take(&mut private.pending_refs);
			for &p in &pending {
				if before.loading.map_or(false, |loading| loading > p) {
					undo.notices.push(RefNotice::UndoLoading(p));
				}
				if before.lock.map_or(false, |lock| lock > p) {
					undo.notices.push(RefNotice::UndoLock(p));
				}
			}
			private.pending_refs = pending.into_iter().filter(|&p| p > ack).collect();
		}

		if before.is_fully_resolved_by(ack) {
			document.remove_attribute(element, REF_SRC);
		}
		document.compact_private(element);
		self.track(before, ElementRef::read(document, element));
		undo
	}

	/// Applies `ack` to every element of this ledger within `scope`, descendants before their ancestors.
	#[instrument(skip(self, document), fields(source = %self.source))]
	pub fn undo_refs(&mut self, document: &mut Document, scope: NodeId, ack: Ref) -> Vec<Undo> {
		let mut elements = vec![scope];
		elements.extend(document.descendants(scope, |_, _| false));
		elements.retain(|&element| document.attribute(element, REF_SRC) == Some(self.source.as_str()));
		elements
			.into_iter()
			.rev()
			.map(|element| self.maybe_undo(document, element, ack))
			.collect()
	}

	/// Runs `callback` now if `element` isn't locked, otherwise once its current lock is released.
	///
	/// Pending callbacks are dropped with the element.
	pub fn on_unlock(document: &mut Document, element: NodeId, callback: impl FnOnce() + 'static) {
		match ElementRef::read(document, element).lock {
			None => callback(),
			Some(lock) => match document.private_mut(element) {
				Some(private) => private.unlock_callbacks.push((lock, Box::new(callback))),
				None => warn!("Can't wait for the unlock of a non-element or freed node."),
			},
		}
	}

	/// Refs that no element holds anymore, sorted. Each is reported once.
	pub fn settle(&mut self) -> Vec<Ref> {
		let mut settled: Vec<Ref> = self.holders.drain_weak().collect();
		settled.sort_unstable();
		settled
	}

	/// Forgets all holders, for example after the fragment's elements were replaced wholesale.
	pub fn clear(&mut self) {
		self.holders.clear();
	}
}
