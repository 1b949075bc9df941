//! Typed view of the payloads exchanged with the server.
//!
//! Decoding is lenient below the top level: a key that doesn't fit the node shape is logged and dropped, so a
//! malformed subtree never takes its siblings down with it.

use crate::ref_ledger::Ref;
use serde::Serialize;
use serde_json::{Map, Value};
use std::{collections::BTreeMap, rc::Rc};
use thiserror::Error;
use tracing::{trace_span, warn};

/// Component id.
pub type Cid = u32;

pub const STATICS: &str = "s";
pub const ROOT: &str = "r";
pub const KEYED: &str = "k";
pub const KEYED_COUNT: &str = "kc";
pub const STREAM: &str = "stream";
pub const TEMPLATES: &str = "p";
pub const COMPONENTS: &str = "c";
pub const EVENTS: &str = "e";
pub const REPLY: &str = "r";
pub const TITLE: &str = "t";

#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("payload is not valid JSON")]
	Json(#[from] serde_json::Error),
	#[error("payload is not a JSON object")]
	NotAnObject,
	#[error("the fragment diff carries no template")]
	MissingTemplate,
}

/// The `p` table of one payload. It's only valid while that payload is decoded.
#[derive(Debug, Default)]
pub struct TemplateTable(BTreeMap<String, Rc<[String]>>);
impl TemplateTable {
	fn decode(value: Option<&Value>) -> Self {
		let mut table = BTreeMap::new();
		match value {
			None => (),
			Some(Value::Object(entries)) => {
				for (key, literals) in entries {
					match decode_literals(literals) {
						Some(literals) => {
							table.insert(key.clone(), literals);
						}
						None => warn!("Template table entry {:?} is not a list of strings; skipping.", key),
					}
				}
			}
			Some(_) => warn!("Template table is not an object; ignoring it."),
		}
		Self(table)
	}

	#[must_use]
	pub fn get(&self, index: u64) -> Option<Rc<[String]>> {
		self.0.get(&index.to_string()).cloned()
	}
}

fn decode_literals(value: &Value) -> Option<Rc<[String]>> {
	value
		.as_array()?
		.iter()
		.map(|literal| literal.as_str().map(str::to_owned))
		.collect::<Option<Vec<_>>>()
		.map(Into::into)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statics {
	Template(Rc<[String]>),
	/// Borrowed from another component: positive means a component in the same payload, zero or negative the
	/// previously rendered component `-s`.
	Component(i64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeDiff {
	pub statics: Option<Statics>,
	pub root: Option<bool>,
	pub slots: BTreeMap<usize, DynamicDiff>,
	pub keyed: Option<KeyedDiff>,
	pub stream: Option<StreamOp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynamicDiff {
	Text(String),
	Component(Cid),
	Node(NodeDiff),
	Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyedDiff {
	pub entries: BTreeMap<usize, EntryDiff>,
	/// Number of entries after the merge.
	pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryDiff {
	Node(NodeDiff),
	/// The entry previously at this index, unchanged.
	Move(usize),
	MoveWithDiff(usize, NodeDiff),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOp {
	pub stream_ref: String,
	pub inserts: Vec<StreamInsert>,
	pub deletes: Vec<String>,
	pub reset: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInsert {
	pub dom_id: String,
	/// `-1` appends, `0` prepends, anything else is an index.
	pub at: i64,
	/// Positive keeps the first `limit` children, negative the last `-limit`.
	pub limit: Option<i64>,
	pub update_only: bool,
}

/// One decoded server payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffPayload {
	/// [`None`] iff the payload has no fragment keys at all.
	pub fragment: Option<NodeDiff>,
	pub components: BTreeMap<Cid, NodeDiff>,
	pub events: Vec<(String, Value)>,
	pub reply: Option<Value>,
	pub title: Option<String>,
	/// Transport-assigned message id, increasing per fragment. Payloads at or below the last merged id are
	/// redeliveries.
	pub delivery: Option<u64>,
}

impl DiffPayload {
	/// # Errors
	///
	/// Iff `json` isn't a JSON object.
	pub fn from_json(json: &str) -> Result<Self, DecodeError> {
		Self::decode(&serde_json::from_str(json)?)
	}

	/// # Errors
	///
	/// Iff `value` isn't an object.
	pub fn decode(value: &Value) -> Result<Self, DecodeError> {
		let object = value.as_object().ok_or(DecodeError::NotAnObject)?;
		let _span = trace_span!("decode", keys = object.len()).entered();

		let templates = TemplateTable::decode(object.get(TEMPLATES));

		let mut fragment = Map::new();
		for (key, value) in object {
			if ![TEMPLATES, COMPONENTS, EVENTS, REPLY, TITLE].contains(&key.as_str()) {
				fragment.insert(key.clone(), value.clone());
			}
		}
		let fragment = if fragment.is_empty() {
			None
		} else {
			Some(decode_node(&fragment, &templates, false))
		};

		let mut components = BTreeMap::new();
		match object.get(COMPONENTS) {
			None => (),
			Some(Value::Object(entries)) => {
				for (cid, diff) in entries {
					match (cid.parse::<Cid>(), diff) {
						(Ok(cid), Value::Object(diff)) => {
							components.insert(cid, decode_node(diff, &templates, true));
						}
						_ => warn!("Skipping malformed component diff {:?}.", cid),
					}
				}
			}
			Some(_) => warn!("Component diffs are not an object; ignoring them."),
		}

		let mut events = Vec::new();
		if let Some(list) = object.get(EVENTS) {
			for event in list.as_array().map_or(&[][..], Vec::as_slice) {
				match event.as_array().map(Vec::as_slice) {
					Some([Value::String(name), payload]) => events.push((name.clone(), payload.clone())),
					_ => warn!("Skipping malformed server event."),
				}
			}
		}

		Ok(Self {
			fragment,
			components,
			events,
			reply: object.get(REPLY).cloned(),
			title: object.get(TITLE).and_then(Value::as_str).map(str::to_owned),
			delivery: None,
		})
	}

	#[must_use]
	pub fn with_delivery(self, delivery: u64) -> Self {
		Self {
			delivery: Some(delivery),
			..self
		}
	}

	/// Whether this payload touches components only.
	#[must_use]
	pub fn is_component_only(&self) -> bool {
		self.fragment.is_none() && !self.components.is_empty()
	}

	#[must_use]
	pub fn component_cids(&self) -> Vec<Cid> {
		self.components.keys().copied().collect()
	}
}

fn decode_node(object: &Map<String, Value>, templates: &TemplateTable, component_root: bool) -> NodeDiff {
	let mut node = NodeDiff::default();
	for (key, value) in object {
		match key.as_str() {
			STATICS => {
				node.statics = match value {
					Value::Array(_) => decode_literals(value).map(Statics::Template),
					Value::Number(n) if component_root => n.as_i64().map(Statics::Component),
					Value::Number(n) => n.as_u64().and_then(|index| templates.get(index)).map(Statics::Template),
					_ => None,
				};
				if node.statics.is_none() {
					warn!("Unusable template reference; the node is treated as template-less.");
				}
			}
			ROOT => node.root = value.as_bool().or_else(|| value.as_u64().map(|r| r != 0)),
			KEYED => match value {
				Value::Object(entries) => node.keyed = Some(decode_keyed(entries, templates)),
				_ => warn!("Keyed entries are not an object; ignoring them."),
			},
			STREAM => {
				node.stream = decode_stream(value);
				if node.stream.is_none() {
					warn!("Skipping malformed stream operation.");
				}
			}
			slot => match slot.parse::<usize>() {
				Ok(index) => {
					node.slots.insert(index, decode_dynamic(value, templates));
				}
				Err(_) => warn!("Skipping unknown node key {:?}.", slot),
			},
		}
	}
	node
}

fn decode_dynamic(value: &Value, templates: &TemplateTable) -> DynamicDiff {
	match value {
		Value::String(text) => DynamicDiff::Text(text.clone()),
		Value::Number(n) => match n.as_u64().and_then(|cid| Cid::try_from(cid).ok()) {
			Some(cid) => DynamicDiff::Component(cid),
			None => {
				warn!("Component reference {} is out of range; rendering nothing.", n);
				DynamicDiff::Empty
			}
		},
		Value::Object(object) => DynamicDiff::Node(decode_node(object, templates, false)),
		Value::Null => DynamicDiff::Empty,
		Value::Bool(_) | Value::Array(_) => {
			warn!("Unexpected slot value; rendering nothing.");
			DynamicDiff::Empty
		}
	}
}

fn decode_keyed(object: &Map<String, Value>, templates: &TemplateTable) -> KeyedDiff {
	let mut keyed = KeyedDiff::default();
	for (key, value) in object {
		if key == KEYED_COUNT {
			match value.as_u64().and_then(|count| usize::try_from(count).ok()) {
				Some(count) => keyed.count = count,
				None => warn!("Keyed count is not a non-negative integer."),
			}
			continue;
		}
		let Ok(index) = key.parse::<usize>() else {
			warn!("Skipping unknown keyed key {:?}.", key);
			continue;
		};
		let entry = match value {
			Value::Object(diff) => EntryDiff::Node(decode_node(diff, templates, false)),
			Value::Number(old) => match old.as_u64().and_then(|old| usize::try_from(old).ok()) {
				Some(old) => EntryDiff::Move(old),
				None => {
					warn!("Skipping keyed move with an invalid source index.");
					continue;
				}
			},
			Value::Array(pair) => match pair.as_slice() {
				[Value::Number(old), Value::Object(diff)] => match old.as_u64().and_then(|old| usize::try_from(old).ok()) {
					Some(old) => EntryDiff::MoveWithDiff(old, decode_node(diff, templates, false)),
					None => {
						warn!("Skipping keyed move with an invalid source index.");
						continue;
					}
				},
				_ => {
					warn!("Skipping malformed keyed move.");
					continue;
				}
			},
			_ => {
				warn!("Skipping malformed keyed entry {}.", index);
				continue;
			}
		};
		keyed.entries.insert(index, entry);
	}
	keyed
}

fn decode_stream(value: &Value) -> Option<StreamOp> {
	let parts = value.as_array()?;
	let stream_ref = match parts.first()? {
		Value::String(stream_ref) => stream_ref.clone(),
		Value::Number(stream_ref) => stream_ref.to_string(),
		_ => return None,
	};
	let mut inserts = Vec::new();
	for insert in parts.get(1).and_then(Value::as_array).map_or(&[][..], Vec::as_slice) {
		let insert = insert.as_array()?;
		inserts.push(StreamInsert {
			dom_id: insert.first()?.as_str()?.to_owned(),
			at: insert.get(1).and_then(Value::as_i64).unwrap_or(-1),
			limit: insert.get(2).and_then(Value::as_i64),
			update_only: insert.get(3).and_then(Value::as_bool).unwrap_or(false),
		});
	}
	let deletes = parts
		.get(2)
		.and_then(Value::as_array)
		.map_or(&[][..], Vec::as_slice)
		.iter()
		.filter_map(|id| id.as_str().map(str::to_owned))
		.collect();
	Some(StreamOp {
		stream_ref,
		inserts,
		deletes,
		reset: parts.get(3).and_then(Value::as_bool).unwrap_or(false),
	})
}

/// Acknowledgements and handshake replies, as routed back by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
	Ack { r#ref: Ref, diff: Option<DiffPayload> },
	CidsWillDestroy { cids: Vec<Cid> },
	CidsDestroyed { cids: Vec<Cid> },
}

/// An event pushed to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub event: Option<String>,
	pub payload: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub target_component_id: Option<Cid>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub r#ref: Option<Ref>,
}

impl OutboundEvent {
	#[must_use]
	pub fn new(kind: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
		Self {
			kind: kind.into(),
			event: Some(event.into()),
			payload,
			target_component_id: None,
			r#ref: None,
		}
	}

	#[must_use]
	pub fn cids_will_destroy(cids: &[Cid]) -> Self {
		Self::handshake("cids_will_destroy", cids)
	}

	#[must_use]
	pub fn cids_destroyed(cids: &[Cid]) -> Self {
		Self::handshake("cids_destroyed", cids)
	}

	fn handshake(kind: &str, cids: &[Cid]) -> Self {
		Self {
			kind: kind.to_owned(),
			event: None,
			payload: serde_json::json!({ "cids": cids }),
			target_component_id: None,
			r#ref: None,
		}
	}

	#[must_use]
	pub fn with_target(self, cid: Option<Cid>) -> Self {
		Self {
			target_component_id: cid,
			..self
		}
	}

	/// # Errors
	///
	/// Only if serialization of the payload fails, which doesn't happen for [`Value`]s.
	pub fn to_json(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}
}
