use live_fragment::{
	ref_ledger::{ElementRef, RefNotice},
	Document, RefLedger, RefOptions, REF_DISABLED, REF_LOADING, REF_LOCK, REF_SRC,
};
use std::{cell::Cell, rc::Rc};

const LOCK: RefOptions = RefOptions {
	lock: true,
	disable: false,
};

fn init() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn refs_are_monotonic() {
	init();
	let mut document = Document::new();
	let a = document.create_element("button", vec![]);
	let b = document.create_element("button", vec![]);
	let mut ledger = RefLedger::new("f");

	assert_eq!(ledger.put_ref(&mut document, &[a], RefOptions::default()), 1);
	assert_eq!(ledger.put_ref(&mut document, &[a, b], LOCK), 2);
	assert_eq!(ledger.last_ref(), 2);

	assert_eq!(document.attribute(a, REF_SRC), Some("f"));
	assert_eq!(document.attribute(a, REF_LOADING), Some("2"));
	assert_eq!(document.attribute(b, REF_LOCK), Some("2"));
	assert!(ledger.is_outstanding(2));
	assert!(!ledger.is_outstanding(1));
	assert_eq!(ledger.settle(), vec![1]);
	assert!(ledger.settle().is_empty());
}

#[test]
fn acknowledgement_releases_both_fields() {
	init();
	let mut document = Document::new();
	let element = document.create_element("button", vec![]);
	let mut ledger = RefLedger::new("f");
	let r = ledger.put_ref(&mut document, &[element], LOCK);

	let undo = ledger.maybe_undo(&mut document, element, r);
	assert_eq!(undo.notices, vec![RefNotice::UndoLock(r), RefNotice::UndoLoading(r)]);
	assert!(undo.clone.is_none());
	assert!(document.attributes(element).is_empty());
	assert_eq!(ledger.settle(), vec![r]);
}

#[test]
fn blocked_acknowledgements_are_replayed_once() {
	init();
	let mut document = Document::new();
	let element = document.create_element("input", vec![]);
	let mut ledger = RefLedger::new("f");
	let first = ledger.put_ref(&mut document, &[element], LOCK);
	let second = ledger.put_ref(&mut document, &[element], LOCK);

	let blocked = ledger.maybe_undo(&mut document, element, first);
	assert!(blocked.notices.is_empty());
	assert_eq!(document.attribute(element, REF_LOCK), Some("2"));

	let undo = ledger.maybe_undo(&mut document, element, second);
	let locks: Vec<_> = undo
		.notices
		.iter()
		.filter_map(|notice| match notice {
			RefNotice::UndoLock(r) => Some(*r),
			RefNotice::UndoLoading(_) => None,
		})
		.collect();
	assert_eq!(locks, vec![second, first]);
	assert!(undo.notices.contains(&RefNotice::UndoLoading(first)));
	assert!(undo.notices.contains(&RefNotice::UndoLoading(second)));
	assert!(!document.has_attribute(element, REF_SRC));

	let late = ledger.maybe_undo(&mut document, element, second);
	assert!(late.notices.is_empty());
}

#[test]
fn disabled_state_is_restored() {
	init();
	let mut document = Document::new();
	let enabled = document.create_element("button", vec![]);
	let disabled = document.create_element("button", vec![("disabled".to_owned(), String::new())]);
	let mut ledger = RefLedger::new("f");
	let r = ledger.put_ref(
		&mut document,
		&[enabled, disabled],
		RefOptions {
			lock: false,
			disable: true,
		},
	);
	assert!(document.has_attribute(enabled, "disabled"));
	assert_eq!(document.attribute(enabled, REF_DISABLED), Some("false"));
	assert_eq!(document.attribute(disabled, REF_DISABLED), Some("true"));

	ledger.maybe_undo(&mut document, enabled, r);
	ledger.maybe_undo(&mut document, disabled, r);
	assert!(!document.has_attribute(enabled, "disabled"));
	assert!(!document.has_attribute(enabled, REF_DISABLED));
	assert!(document.has_attribute(disabled, "disabled"));
	assert!(!document.has_attribute(disabled, REF_DISABLED));
}

#[test]
fn descendants_are_released_first() {
	init();
	let mut document = Document::new();
	let root = document.create_element("div", vec![]);
	let parent = document.create_element("form", vec![]);
	let child = document.create_element("input", vec![]);
	document.append_child(root, parent);
	document.append_child(parent, child);
	let mut ledger = RefLedger::new("f");
	let r = ledger.put_ref(&mut document, &[parent, child], RefOptions::default());

	let undos = ledger.undo_refs(&mut document, root, r);
	let order: Vec<_> = undos.iter().filter_map(|undo| undo.element).collect();
	assert_eq!(order, vec![child, parent]);
}

#[test]
fn other_ledgers_are_left_alone() {
	init();
	let mut document = Document::new();
	let root = document.create_element("div", vec![]);
	let element = document.create_element("button", vec![]);
	document.append_child(root, element);
	let mut mine = RefLedger::new("a");
	let mut theirs = RefLedger::new("b");
	let r = theirs.put_ref(&mut document, &[element], RefOptions::default());

	assert!(mine.undo_refs(&mut document, root, r).is_empty());
	assert_eq!(document.attribute(element, REF_LOADING), Some("1"));
}

#[test]
fn unlock_callbacks() {
	init();
	let mut document = Document::new();
	let element = document.create_element("div", vec![]);
	let mut ledger = RefLedger::new("f");

	let immediate = Rc::new(Cell::new(false));
	RefLedger::on_unlock(&mut document, element, {
		let immediate = Rc::clone(&immediate);
		move || immediate.set(true)
	});
	assert!(immediate.get());

	let r = ledger.put_ref(&mut document, &[element], LOCK);
	let deferred = Rc::new(Cell::new(false));
	RefLedger::on_unlock(&mut document, element, {
		let deferred = Rc::clone(&deferred);
		move || deferred.set(true)
	});
	assert!(!deferred.get());

	let undo = ledger.maybe_undo(&mut document, element, r);
	assert!(!deferred.get());
	assert_eq!(undo.callbacks.len(), 1);
	for callback in undo.callbacks {
		callback();
	}
	assert!(deferred.get());
}

#[test]
fn forgetting_removed_elements() {
	init();
	let mut document = Document::new();
	let element = document.create_element("div", vec![]);
	let mut ledger = RefLedger::new("f");
	let r = ledger.put_ref(&mut document, &[element], LOCK);

	let element_ref = ElementRef::read(&document, element);
	document.remove(element);
	ledger.forget(element_ref);
	assert!(!ledger.is_outstanding(r));
	assert_eq!(ledger.settle(), vec![r]);
}

#[test]
fn element_ref_predicates() {
	let split = ElementRef {
		loading: Some(1),
		lock: Some(2),
	};
	assert!(split.is_within(1));
	assert!(split.is_loading_undone_by(1));
	assert!(!split.can_undo_loading(1));
	assert!(!split.is_fully_resolved_by(1));
	assert!(split.is_fully_resolved_by(2));
	assert!(split.is_locked_against(None));
	assert!(split.is_locked_against(Some(1)));
	assert!(!split.is_locked_against(Some(2)));

	let newer = ElementRef {
		loading: Some(3),
		lock: Some(3),
	};
	assert!(!newer.is_within(2));
	assert!(ElementRef::default().is_idle());
}
