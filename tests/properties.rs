use live_fragment::{ref_ledger::ElementRef, Config, DiffPayload, DiffTree, Document, NodeId, Reconciler, RefLedger, RefOptions};
use proptest::prelude::*;

fn payload(json: &str) -> DiffPayload {
	DiffPayload::from_json(json).unwrap()
}

const NESTED: &str = r#"{"s":["<main>","","</main>"],"0":{"s":["<p>","</p>"],"0":"a","r":1},"1":"x"}"#;

#[derive(Debug, Clone)]
enum Update {
	Nested(String),
	Sibling(String),
}

fn update() -> impl Strategy<Value = Update> {
	prop_oneof![
		"[a-z]{0,4}".prop_map(Update::Nested),
		"[a-z]{0,4}".prop_map(Update::Sibling),
	]
}

impl Update {
	fn json(&self) -> String {
		match self {
			Self::Nested(text) => format!(r#"{{"0":{{"0":"{}"}}}}"#, text),
			Self::Sibling(text) => format!(r#"{{"1":"{}"}}"#, text),
		}
	}
}

type Group = (Vec<bool>, bool, bool);

/// Three buttons, each group putting one ref on the buttons it selects.
fn with_refs(groups: &[Group]) -> (Document, Vec<NodeId>, RefLedger) {
	let mut document = Document::new();
	let elements: Vec<_> = (0..3).map(|_| document.create_element("button", vec![])).collect();
	let mut ledger = RefLedger::new("f");
	for (selected, lock, disable) in groups {
		let targets: Vec<_> = elements
			.iter()
			.zip(selected)
			.filter_map(|(&element, &selected)| selected.then_some(element))
			.collect();
		ledger.put_ref(&mut document, &targets, RefOptions { lock: *lock, disable: *disable });
	}
	(document, elements, ledger)
}

fn released(before: Option<u64>, after: Option<u64>) -> bool {
	before.is_some() && after.is_none()
}

proptest! {
	#[test]
	fn refs_increase_from_one(groups in prop::collection::vec((0usize..3, any::<bool>(), any::<bool>()), 1..20)) {
		let mut document = Document::new();
		let elements: Vec<_> = (0..3).map(|_| document.create_element("button", vec![])).collect();
		let mut ledger = RefLedger::new("f");
		let mut last = 0;
		for (count, lock, disable) in groups {
			let r = ledger.put_ref(&mut document, &elements[..count], RefOptions { lock, disable });
			prop_assert_eq!(r, last + 1);
			last = r;
		}
	}

	#[test]
	fn larger_acknowledgements_release_at_least_as_much(
		groups in prop::collection::vec((prop::collection::vec(any::<bool>(), 3), any::<bool>(), any::<bool>()), 1..12),
		first in 0u64..14,
		extra in 0u64..14,
	) {
		let second = first + extra;
		let (mut lower, elements, mut lower_ledger) = with_refs(&groups);
		let (mut higher, _, mut higher_ledger) = with_refs(&groups);
		let before: Vec<_> = elements.iter().map(|&element| ElementRef::read(&lower, element)).collect();

		for &element in &elements {
			lower_ledger.maybe_undo(&mut lower, element, first);
			higher_ledger.maybe_undo(&mut higher, element, second);
		}
		for (&element, before) in elements.iter().zip(before) {
			let (by_first, by_second) = (ElementRef::read(&lower, element), ElementRef::read(&higher, element));
			if released(before.loading, by_first.loading) {
				prop_assert!(by_second.loading.is_none());
			}
			if released(before.lock, by_first.lock) {
				prop_assert!(by_second.lock.is_none());
			}
		}
	}

	#[test]
	fn keyed_merges_keep_the_count(counts in prop::collection::vec(0usize..8, 1..10)) {
		let mut tree = DiffTree::new(
			"f",
			&payload(r#"{"s":["<ul>","</ul>"],"0":{"s":["<li>","</li>"],"k":{"kc":0}}}"#),
			&Config::default(),
		)
		.unwrap();
		for (step, count) in counts.into_iter().enumerate() {
			let entries: Vec<String> = (0..count)
				.filter(|index| (index + step) % 2 == 0)
				.map(|index| format!(r#""{}":{{"0":"{}"}}"#, index, step))
				.collect();
			let mut keyed = entries.join(",");
			if !keyed.is_empty() {
				keyed.push(',');
			}
			tree.merge(&payload(&format!(r#"{{"0":{{"k":{{{}"kc":{}}}}}}}"#, keyed, count)));
			prop_assert_eq!(tree.to_markup(None).markup.matches("<li>").count(), count);
		}
	}

	#[test]
	fn repeated_value_updates_change_nothing(updates in prop::collection::vec(update(), 1..10)) {
		let mut once = DiffTree::new("f", &payload(NESTED), &Config::default()).unwrap();
		let mut twice = DiffTree::new("f", &payload(NESTED), &Config::default()).unwrap();
		for update in updates {
			let diff = payload(&update.json());
			once.merge(&diff);
			twice.merge(&diff);
			twice.merge(&diff);
			once.force_full_render();
			twice.force_full_render();
			prop_assert_eq!(once.to_markup(None), twice.to_markup(None));
		}
	}

	#[test]
	fn redelivered_moves_change_nothing(swaps in prop::collection::vec(any::<bool>(), 1..10)) {
		let join = r#"{"s":["<ul>","</ul>"],"0":{"s":["<li>","</li>"],"k":{"0":{"0":"A"},"1":{"0":"B"},"2":{"0":"C"},"kc":3}}}"#;
		let mut once = DiffTree::new("f", &payload(join), &Config::default()).unwrap();
		let mut twice = DiffTree::new("f", &payload(join), &Config::default()).unwrap();
		for (delivery, rotate) in (1..).zip(swaps) {
			let json = if rotate {
				r#"{"0":{"k":{"0":1,"1":2,"2":0,"kc":3}}}"#
			} else {
				r#"{"0":{"k":{"0":1,"1":0,"kc":3}}}"#
			};
			let diff = payload(json).with_delivery(delivery);
			prop_assert!(once.merge(&diff));
			prop_assert!(twice.merge(&diff));
			prop_assert!(!twice.merge(&diff));
			prop_assert_eq!(once.to_markup(None), twice.to_markup(None));
		}
	}

	#[test]
	fn skip_markers_never_reach_the_document(updates in prop::collection::vec(update(), 1..12)) {
		let config = Config::default();
		let mut tracked = DiffTree::new("f", &payload(NESTED), &config).unwrap();
		let mut full = DiffTree::new("f", &payload(NESTED), &config).unwrap();
		let mut document = Document::new();
		let container = document.create_element("div", vec![]);
		Reconciler::new(&mut document, &config).patch_inner(container, &tracked.to_markup(None).markup);
		full.to_markup(None);

		for update in updates {
			let diff = payload(&update.json());
			tracked.merge(&diff);
			full.merge(&diff);
			let report = Reconciler::new(&mut document, &config).patch_inner(container, &tracked.to_markup(Some(&[])).markup);
			prop_assert!(report.missing_skips.is_empty());

			full.force_full_render();
			let markup = document.inner_markup(container);
			prop_assert!(!markup.contains("data-skip"));
			prop_assert_eq!(markup, full.to_markup(None).markup);
		}
	}
}
