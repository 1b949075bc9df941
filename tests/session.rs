use live_fragment::{
	Config, DiffPayload, FragmentId, JoinState, NodeId, Notification, OutboundEvent, RefOptions, Reply, Session,
	SessionError, Transport, FRAGMENT,
};
use serde_json::json;

#[derive(Debug, Default)]
struct Recorder {
	joins: Vec<(FragmentId, Option<FragmentId>)>,
	pushes: Vec<(FragmentId, OutboundEvent)>,
	leaves: Vec<FragmentId>,
}

impl Transport for Recorder {
	fn join(&mut self, fragment: &FragmentId, parent: Option<&FragmentId>) {
		self.joins.push((fragment.clone(), parent.cloned()));
	}

	fn push(&mut self, fragment: &FragmentId, event: OutboundEvent) {
		self.pushes.push((fragment.clone(), event));
	}

	fn leave(&mut self, fragment: &FragmentId) {
		self.leaves.push(fragment.clone());
	}
}

const LOCK: RefOptions = RefOptions {
	lock: true,
	disable: false,
};

fn payload(json: &str) -> DiffPayload {
	DiffPayload::from_json(json).unwrap()
}

fn mounted(join: &str) -> (Session<Recorder>, FragmentId, NodeId) {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
	let mut session = Session::new(Recorder::default(), Config::default());
	let container = session.document_mut().create_element("div", vec![]);
	let root = FragmentId::new("root");
	session.mount(&root, container).unwrap();
	session.handle_join_reply(&root, &payload(join)).unwrap();
	(session, root, container)
}

fn click() -> OutboundEvent {
	OutboundEvent::new("click", "save", json!({}))
}

#[test]
fn join_and_update() {
	let (mut session, root, container) = mounted(r#"{"s":["<p data-hook=\"Talk\">","</p>"],"0":"hi","e":[["greeted",{"n":1}]],"t":"Hello"}"#);
	assert_eq!(session.state(&root), Some(JoinState::Joined));
	assert_eq!(session.document().inner_markup(container), r#"<p data-hook="Talk">hi</p>"#);
	assert_eq!(session.document().attribute(container, FRAGMENT), Some("root"));

	let p = session.document().children(container)[0];
	assert_eq!(
		session.drain_notifications(),
		vec![
			Notification::Joined { fragment: root.clone() },
			Notification::Mounted {
				fragment: root.clone(),
				element: p,
				hook: "Talk".to_owned(),
			},
			Notification::ServerEvent {
				fragment: root.clone(),
				name: "greeted".to_owned(),
				payload: json!({"n": 1}),
			},
			Notification::Title {
				fragment: root.clone(),
				title: "Hello".to_owned(),
			},
		]
	);

	session.handle_diff(&root, payload(r#"{"0":"bye"}"#)).unwrap();
	assert_eq!(session.document().inner_markup(container), r#"<p data-hook="Talk">bye</p>"#);
	assert_eq!(
		session.drain_notifications(),
		vec![Notification::Updated {
			fragment: root,
			element: p,
			hook: "Talk".to_owned(),
		}]
	);
}

#[test]
fn mount_errors() {
	let (mut session, root, container) = mounted(r#"{"s":["<p></p>"]}"#);
	assert!(matches!(session.mount(&root, container), Err(SessionError::AlreadyMounted(_))));

	let text = session.document_mut().create_text("x");
	assert!(matches!(
		session.mount(&FragmentId::new("other"), text),
		Err(SessionError::MissingContainer(_))
	));
	assert!(matches!(
		session.handle_diff(&FragmentId::new("nope"), DiffPayload::default()),
		Err(SessionError::UnknownFragment(_))
	));
	assert!(matches!(
		session.handle_join_reply(&root, &payload(r#"{"s":["<p></p>"]}"#)),
		Err(SessionError::UnexpectedJoin(_))
	));
}

#[test]
fn nested_joins_apply_parent_first() {
	let (mut session, root, container) = mounted(r#"{"s":["<main><div data-fragment=\"child\"></div></main>"]}"#);
	let child = FragmentId::new("child");
	assert_eq!(session.transport().joins, vec![(root.clone(), None), (child.clone(), Some(root.clone()))]);
	assert_eq!(session.state(&root), Some(JoinState::PendingJoin));
	assert_eq!(session.document().inner_markup(container), "");
	assert!(session.drain_notifications().is_empty());

	session.handle_diff(&child, payload(r#"{"0":"b"}"#)).unwrap();
	session
		.handle_join_reply(&child, &payload(r#"{"s":["<p>","</p>"],"0":"a"}"#))
		.unwrap();

	assert_eq!(
		session.document().inner_markup(container),
		r#"<main><div data-fragment="child"><p>b</p></div></main>"#
	);
	assert_eq!(session.state(&root), Some(JoinState::Joined));
	assert_eq!(session.state(&child), Some(JoinState::Joined));
	assert_eq!(session.children(&root), [child.clone()]);
	assert_eq!(
		session.drain_notifications(),
		vec![Notification::Joined { fragment: root }, Notification::Joined { fragment: child }]
	);
}

#[test]
fn children_of_joined_parents_join_on_their_own() {
	let (mut session, root, container) = mounted(r#"{"s":["<main>","</main>"],"0":""}"#);
	session
		.handle_diff(&root, payload(r#"{"0":{"s":["<div data-fragment=\"late\"></div>"]}}"#))
		.unwrap();
	let late = FragmentId::new("late");
	assert_eq!(session.transport().joins.last(), Some(&(late.clone(), Some(root.clone()))));

	session.handle_join_reply(&late, &payload(r#"{"s":["<i>late</i>"]}"#)).unwrap();
	assert_eq!(
		session.document().inner_markup(container),
		r#"<main><div data-fragment="late"><i>late</i></div></main>"#
	);

	session.handle_diff(&root, payload(r#"{"0":""}"#)).unwrap();
	assert_eq!(session.state(&late), Some(JoinState::Destroyed));
	assert_eq!(session.transport().leaves, vec![late]);
}

#[test]
fn destroy_cancels_pending_work() {
	let (mut session, root, _) = mounted(r#"{"s":["<div data-fragment=\"child\"></div>"]}"#);
	let child = FragmentId::new("child");
	session.destroy(&root).unwrap();
	assert_eq!(session.state(&root), Some(JoinState::Destroyed));
	assert_eq!(session.state(&child), Some(JoinState::Destroyed));
	assert_eq!(session.transport().leaves, vec![root.clone(), child.clone()]);

	session.handle_join_reply(&child, &payload(r#"{"s":["<p>x</p>"]}"#)).unwrap();
	session.handle_diff(&root, payload(r#"{"0":"x"}"#)).unwrap();
	assert!(session.drain_notifications().is_empty());
}

#[test]
fn acknowledged_locks_apply_captured_patches() {
	let (mut session, root, container) = mounted(r#"{"s":["<button id=\"b\">","</button>"],"0":"Save"}"#);
	let button = session.document().children(container)[0];
	session.drain_notifications();

	let r = session.push_event(&root, &[button], click(), LOCK).unwrap();
	assert_eq!(r, 1);
	let (_, pushed) = &session.transport().pushes[0];
	assert_eq!(pushed.r#ref, Some(1));
	assert_eq!(pushed.event.as_deref(), Some("save"));

	session.handle_diff(&root, payload(r#"{"0":"Saved"}"#)).unwrap();
	assert_eq!(session.document().inner_markup(button), "Save");

	session.handle_reply(&root, Reply::Ack { r#ref: r, diff: None }).unwrap();
	assert_eq!(session.document().inner_markup(container), r#"<button id="b">Saved</button>"#);
	let notifications = session.drain_notifications();
	assert!(notifications.contains(&Notification::UndoLock {
		fragment: root.clone(),
		element: button,
		r#ref: r,
	}));
	assert!(notifications.contains(&Notification::RefsSettled {
		fragment: root,
		refs: vec![r],
	}));
}

#[test]
fn each_lock_is_released_once() {
	let (mut session, root, container) = mounted(r#"{"s":["<button>","</button>"],"0":"Go"}"#);
	let button = session.document().children(container)[0];
	let first = session.push_event(&root, &[button], click(), LOCK).unwrap();
	let second = session.push_event(&root, &[button], click(), LOCK).unwrap();
	session.drain_notifications();

	session.handle_reply(&root, Reply::Ack { r#ref: first, diff: None }).unwrap();
	session
		.handle_reply(
			&root,
			Reply::Ack {
				r#ref: second,
				diff: Some(payload(r#"{"0":"Done","r":{"ok":true}}"#)),
			},
		)
		.unwrap();

	let notifications = session.drain_notifications();
	for r in [first, second] {
		let locks = notifications
			.iter()
			.filter(|notification| matches!(notification, Notification::UndoLock { r#ref, .. } if *r#ref == r))
			.count();
		assert_eq!(locks, 1, "ref {}", r);
	}
	assert!(notifications.contains(&Notification::Reply {
		fragment: root,
		r#ref: second,
		payload: json!({"ok": true}),
	}));
	assert_eq!(session.document().inner_markup(container), "<button>Done</button>");
}

#[test]
fn events_need_a_joined_fragment() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
	let mut session = Session::new(Recorder::default(), Config::default());
	let container = session.document_mut().create_element("div", vec![]);
	let root = FragmentId::new("root");
	session.mount(&root, container).unwrap();
	assert!(matches!(
		session.push_event(&root, &[container], click(), RefOptions::default()),
		Err(SessionError::NotJoined(_))
	));
}

#[test]
fn removed_components_are_destroyed_by_handshake() {
	let (mut session, root, _) = mounted(r#"{"s":["<div>","</div>"],"0":1,"c":{"1":{"s":["<span>","</span>"],"0":"a"}}}"#);

	session.handle_diff(&root, payload(r#"{"0":""}"#)).unwrap();
	let (_, proposal) = session.transport().pushes.last().unwrap();
	assert_eq!(proposal.kind, "cids_will_destroy");
	assert_eq!(proposal.payload, json!({"cids": [1]}));

	session.handle_reply(&root, Reply::CidsWillDestroy { cids: vec![1] }).unwrap();
	let (_, confirmation) = session.transport().pushes.last().unwrap();
	assert_eq!(confirmation.kind, "cids_destroyed");

	assert!(session.tree(&root).unwrap().has_component(1));
	session.handle_reply(&root, Reply::CidsDestroyed { cids: vec![1] }).unwrap();
	assert!(!session.tree(&root).unwrap().has_component(1));
}

#[test]
fn components_patch_in_place() {
	let (mut session, root, container) =
		mounted(r#"{"s":["<div>","","</div>"],"0":"t","1":1,"c":{"1":{"s":["<span>","</span>"],"0":"a"}}}"#);
	let div = session.document().children(container)[0];
	let span = session.document().children(div)[1];

	session.handle_diff(&root, payload(r#"{"c":{"1":{"0":"b"}}}"#)).unwrap();
	assert_eq!(session.document().inner_markup(container), r#"<div>t<span data-magic="c1">b</span></div>"#);
	assert_eq!(session.document().children(div)[1], span);

	session.handle_diff(&root, payload(r#"{"0":"u"}"#)).unwrap();
	assert_eq!(session.document().inner_markup(container), r#"<div>u<span data-magic="c1">b</span></div>"#);
}

#[test]
fn lost_skip_targets_render_again_in_full() {
	let (mut session, root, container) = mounted(r#"{"s":["<main>","","</main>"],"0":{"s":["<p>","</p>"],"0":"a","r":1},"1":"x"}"#);
	assert_eq!(
		session.document().inner_markup(container),
		r#"<main><p data-magic="m1-root">a</p>x</main>"#
	);

	let main = session.document().children(container)[0];
	let p = session.document().children(main)[0];
	session.document_mut().detach(p);
	session.document_mut().remove(p);

	session.handle_diff(&root, payload(r#"{"1":"y"}"#)).unwrap();
	assert_eq!(
		session.document().inner_markup(container),
		r#"<main><p data-magic="m1-root">a</p>y</main>"#
	);
}

#[test]
fn rejoin_starts_over() {
	let (mut session, root, container) = mounted(r#"{"s":["<b>","</b>"],"0":"one"}"#);
	let element = session.document().children(container)[0];
	session.push_event(&root, &[element], click(), LOCK).unwrap();
	session.drain_notifications();

	session.rejoin(&root).unwrap();
	assert_eq!(session.state(&root), Some(JoinState::PendingJoin));
	assert_eq!(session.transport().joins.len(), 2);
	assert!(session
		.drain_notifications()
		.iter()
		.any(|notification| matches!(notification, Notification::UndoLock { .. })));

	session.handle_join_reply(&root, &payload(r#"{"s":["<b>","</b>"],"0":"two"}"#)).unwrap();
	assert_eq!(session.document().inner_markup(container), "<b>two</b>");
}

#[test]
fn unlock_callbacks_run_after_the_pass() {
	use std::{cell::Cell, rc::Rc};

	let (mut session, root, container) = mounted(r#"{"s":["<button>","</button>"],"0":"Go"}"#);
	let button = session.document().children(container)[0];
	let r = session.push_event(&root, &[button], click(), LOCK).unwrap();

	let ran = Rc::new(Cell::new(false));
	session.on_unlock(button, {
		let ran = Rc::clone(&ran);
		move || ran.set(true)
	});
	assert!(!ran.get());
	session.handle_reply(&root, Reply::Ack { r#ref: r, diff: None }).unwrap();
	assert!(ran.get());
}

#[test]
fn repeated_diffs_apply_every_time() {
	let (mut session, root, container) =
		mounted(r#"{"s":["<ul>","</ul>"],"0":{"s":["<li>","</li>"],"k":{"0":{"0":"A"},"1":{"0":"B"},"kc":2}}}"#);
	session.drain_notifications();

	let ping = r#"{"e":[["ping",{}]]}"#;
	session.handle_diff(&root, payload(ping)).unwrap();
	session.handle_diff(&root, payload(ping)).unwrap();
	let pings = session
		.drain_notifications()
		.into_iter()
		.filter(|notification| matches!(notification, Notification::ServerEvent { name, .. } if name == "ping"))
		.count();
	assert_eq!(pings, 2);

	let swap = r#"{"0":{"k":{"0":1,"1":0,"kc":2}}}"#;
	session.handle_diff(&root, payload(swap)).unwrap();
	assert_eq!(session.document().inner_markup(container), "<ul><li>B</li><li>A</li></ul>");
	session.handle_diff(&root, payload(swap)).unwrap();
	assert_eq!(session.document().inner_markup(container), "<ul><li>A</li><li>B</li></ul>");

	session.handle_diff(&root, payload(swap).with_delivery(7)).unwrap();
	session.handle_diff(&root, payload(swap).with_delivery(7)).unwrap();
	assert_eq!(session.document().inner_markup(container), "<ul><li>B</li><li>A</li></ul>");
}

#[test]
fn unusable_child_joins_do_not_stall_the_batch() {
	let (mut session, root, container) =
		mounted(r#"{"s":["<main><div data-fragment=\"child\"></div><p>root</p></main>"]}"#);
	let child = FragmentId::new("child");
	assert_eq!(session.document().inner_markup(container), "");

	assert!(matches!(
		session.handle_join_reply(&child, &payload(r#"{"0":"x"}"#)),
		Err(SessionError::Decode(_))
	));
	assert_eq!(session.state(&root), Some(JoinState::Joined));
	assert_eq!(session.state(&child), Some(JoinState::PendingJoin));
	assert_eq!(
		session.document().inner_markup(container),
		r#"<main><div data-fragment="child"></div><p>root</p></main>"#
	);

	session.handle_join_reply(&child, &payload(r#"{"s":["<i>ok</i>"]}"#)).unwrap();
	assert_eq!(session.state(&child), Some(JoinState::Joined));
	assert_eq!(
		session.document().inner_markup(container),
		r#"<main><div data-fragment="child"><i>ok</i></div><p>root</p></main>"#
	);
}

#[test]
fn destroyed_fragments_free_their_lock_clones() {
	let (mut session, root, container) = mounted(r#"{"s":["<button>","</button>"],"0":"Save"}"#);
	let button = session.document().children(container)[0];
	session.push_event(&root, &[button], click(), LOCK).unwrap();
	let before = session.document().len();

	session.handle_diff(&root, payload(r#"{"0":"Saved"}"#)).unwrap();
	let captured = session.document().len();
	assert!(captured > before);

	session.destroy(&root).unwrap();
	assert!(session.document().len() < captured);
	assert!(session.tree(&root).is_none());
	assert_eq!(session.state(&root), Some(JoinState::Destroyed));
	session.destroy(&root).unwrap();
}

#[test]
fn tombstones_are_bounded() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
	let mut session = Session::new(Recorder::default(), Config::default().with_tombstone_limit(1));
	let [first, second] = [FragmentId::new("first"), FragmentId::new("second")];
	for fragment in [&first, &second] {
		let container = session.document_mut().create_element("div", vec![]);
		session.mount(fragment, container).unwrap();
		session.destroy(fragment).unwrap();
	}

	assert_eq!(session.state(&second), Some(JoinState::Destroyed));
	session.handle_diff(&second, payload(r#"{"0":"x"}"#)).unwrap();
	assert_eq!(session.state(&first), None);
	assert!(matches!(
		session.handle_diff(&first, payload(r#"{"0":"x"}"#)),
		Err(SessionError::UnknownFragment(_))
	));

	let container = session.document_mut().create_element("div", vec![]);
	session.mount(&second, container).unwrap();
	assert_eq!(session.state(&second), Some(JoinState::PendingJoin));
}
