//! A small, lenient tokenizer and tree builder for the markup produced by [`DiffTree`](`crate::rendered::DiffTree`),
//! plus the root-tag annotation used for structural skips.
//!
//! Text and attribute values are kept exactly as written (no entity decoding), so that markup can be compared and
//! written back byte by byte.

use core::fmt::Write as _;
use thiserror::Error;
use tracing::trace;

/// A parsed, detached node. This is what the [`Reconciler`](`crate::reconcile::Reconciler`) morphs live nodes towards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VNode {
	Element(VElement),
	Text(String),
	Comment(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VElement {
	pub tag: String,
	pub attributes: Vec<(String, String)>,
	pub children: Vec<VNode>,
}
impl VElement {
	#[must_use]
	pub fn new(tag: impl Into<String>) -> Self {
		Self {
			tag: tag.into(),
			..Self::default()
		}
	}

	#[must_use]
	pub fn attribute(&self, name: &str) -> Option<&str> {
		self.attributes.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
	}

	#[must_use]
	pub fn has_attribute(&self, name: &str) -> bool {
		self.attribute(name).is_some()
	}
}

/// Elements that never have content or an end tag.
#[must_use]
pub fn is_void(tag: &str) -> bool {
	matches!(
		tag,
		"area" | "base" | "br" | "col" | "embed" | "hr" | "img" | "input" | "link" | "meta" | "source" | "track" | "wbr"
	)
}

fn is_raw_text(tag: &str) -> bool {
	matches!(tag, "script" | "style" | "textarea" | "title")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token<'a> {
	Text(&'a str),
	Comment(&'a str),
	Doctype,
	StartTag {
		name: String,
		attributes: Vec<(String, String)>,
		self_closing: bool,
		/// `false` if the source ended inside the tag.
		terminated: bool,
	},
	EndTag {
		name: String,
	},
}

/// Yields `(start, end, token)` with byte offsets into the source.
pub(crate) struct Tokenizer<'a> {
	source: &'a str,
	position: usize,
	raw_text: Option<String>,
}
impl<'a> Tokenizer<'a> {
	pub(crate) fn new(source: &'a str) -> Self {
		Self {
			source,
			position: 0,
			raw_text: None,
		}
	}

	fn starts_tag(rest: &[u8]) -> bool {
		match rest {
			[b'<', b'!', ..] | [b'<', b'?', ..] => true,
			[b'<', b'/', c, ..] | [b'<', c, ..] => c.is_ascii_alphabetic(),
			_ => false,
		}
	}

	fn read_name(&mut self) -> String {
		let source = self.source;
		let bytes = source.as_bytes();
		let start = self.position;
		while self.position < bytes.len() && !matches!(bytes[self.position], b'>' | b'/' | b'=' | b' ' | b'\t' | b'\n' | b'\r' | b'\x0c') {
			self.position += 1;
		}
		source[start..self.position].to_ascii_lowercase()
	}

	fn skip_whitespace(&mut self) {
		let source = self.source;
		let bytes = source.as_bytes();
		while self.position < bytes.len() && bytes[self.position].is_ascii_whitespace() {
			self.position += 1;
		}
	}

	fn read_value(&mut self) -> String {
		let source = self.source;
		let bytes = source.as_bytes();
		match bytes.get(self.position) {
			Some(&quote) if quote == b'"' || quote == b'\'' => {
				let start = self.position + 1;
				let end = source[start..].bytes().position(|b| b == quote).map_or(bytes.len(), |i| start + i);
				self.position = (end + 1).min(bytes.len());
				source[start..end].to_owned()
			}
			_ => {
				let start = self.position;
				while self.position < bytes.len() && !bytes[self.position].is_ascii_whitespace() && bytes[self.position] != b'>' {
					self.position += 1;
				}
				source[start..self.position].to_owned()
			}
		}
	}

	fn read_start_tag(&mut self) -> Token<'a> {
		let source = self.source;
		let bytes = source.as_bytes();
		self.position += 1;
		let name = self.read_name();
		let mut attributes: Vec<(String, String)> = Vec::new();
		let mut self_closing = false;
		let mut terminated = false;
		while self.position < bytes.len() {
			self.skip_whitespace();
			match bytes.get(self.position) {
				None => break,
				Some(b'>') => {
					self.position += 1;
					terminated = true;
					break;
				}
				Some(b'/') => {
					self.position += 1;
					if bytes.get(self.position) == Some(&b'>') {
						self.position += 1;
						self_closing = true;
						terminated = true;
						break;
					}
				}
				Some(_) => {
					let attribute_name = self.read_name();
					if attribute_name.is_empty() {
						// Stray `=`.
						self.position += 1;
						continue;
					}
					self.skip_whitespace();
					let value = if bytes.get(self.position) == Some(&b'=') {
						self.position += 1;
						self.skip_whitespace();
						self.read_value()
					} else {
						String::new()
					};
					if attributes.iter().any(|(n, _)| *n == attribute_name) {
						trace!("Ignoring duplicate attribute {:?} on <{}>.", attribute_name, name);
					} else {
						attributes.push((attribute_name, value));
					}
				}
			}
		}
		if terminated && !self_closing && is_raw_text(&name) {
			self.raw_text = Some(name.clone());
		}
		Token::StartTag {
			name,
			attributes,
			self_closing,
			terminated,
		}
	}
}
impl<'a> Iterator for Tokenizer<'a> {
	type Item = (usize, usize, Token<'a>);

	fn next(&mut self) -> Option<Self::Item> {
		let source = self.source;
		let start = self.position;
		let rest = &source[start..];
		if rest.is_empty() {
			return None;
		}

		if let Some(raw) = self.raw_text.take() {
			let closing = format!("</{}", raw);
			let end = rest.to_ascii_lowercase().find(&closing).unwrap_or(rest.len());
			if end > 0 {
				self.position += end;
				return Some((start, self.position, Token::Text(&rest[..end])));
			}
		}

		let bytes = rest.as_bytes();
		let token = if rest.starts_with("<!--") {
			let (body_end, end) = rest[4..].find("-->").map_or((rest.len(), rest.len()), |i| (4 + i, 4 + i + 3));
			self.position += end;
			Token::Comment(&rest[4..body_end])
		} else if rest.starts_with("<!") || rest.starts_with("<?") {
			self.position += rest.find('>').map_or(rest.len(), |i| i + 1);
			Token::Doctype
		} else if Self::starts_tag(bytes) && bytes[1] == b'/' {
			self.position += 2;
			let name = self.read_name();
			let at = self.position;
			self.position = source[at..].find('>').map_or(source.len(), |i| at + i + 1);
			Token::EndTag { name }
		} else if Self::starts_tag(bytes) {
			self.read_start_tag()
		} else {
			let mut end = 1;
			while end < bytes.len() && !(bytes[end] == b'<' && Self::starts_tag(&bytes[end..])) {
				end += 1;
			}
			self.position += end;
			Token::Text(&rest[..end])
		};
		Some((start, self.position, token))
	}
}

fn is_trivia(token: &Token<'_>) -> bool {
	match token {
		Token::Text(text) => text.trim().is_empty(),
		Token::Comment(_) | Token::Doctype => true,
		Token::StartTag { .. } | Token::EndTag { .. } => false,
	}
}

/// Parses a markup fragment into detached nodes.
///
/// This never fails: stray end tags are dropped and unclosed elements are closed at the end of input.
#[must_use]
pub fn parse_fragment(source: &str) -> Vec<VNode> {
	fn close(stack: &mut Vec<VElement>, roots: &mut Vec<VNode>) {
		if let Some(element) = stack.pop() {
			push(stack, roots, VNode::Element(element));
		}
	}

	fn push(stack: &mut [VElement], roots: &mut Vec<VNode>, node: VNode) {
		match stack.last_mut() {
			Some(parent) => parent.children.push(node),
			None => roots.push(node),
		}
	}

	let mut roots = Vec::new();
	let mut stack: Vec<VElement> = Vec::new();
	for (_, _, token) in Tokenizer::new(source) {
		match token {
			Token::Text(text) => push(&mut stack, &mut roots, VNode::Text(text.to_owned())),
			Token::Comment(comment) => push(&mut stack, &mut roots, VNode::Comment(comment.to_owned())),
			Token::Doctype => (),
			Token::StartTag {
				name, attributes, self_closing, ..
			} => {
				let element = VElement {
					tag: name,
					attributes,
					children: Vec::new(),
				};
				if self_closing || is_void(&element.tag) {
					push(&mut stack, &mut roots, VNode::Element(element));
				} else {
					stack.push(element);
				}
			}
			Token::EndTag { name } => match stack.iter().rposition(|e| e.tag == name) {
				Some(position) => {
					while stack.len() > position {
						close(&mut stack, &mut roots);
					}
				}
				None => trace!("Dropping stray </{}>.", name),
			},
		}
	}
	while !stack.is_empty() {
		close(&mut stack, &mut roots);
	}
	roots
}

pub(crate) fn write_start_tag(out: &mut String, tag: &str, attributes: &[(String, String)]) {
	out.push('<');
	out.push_str(tag);
	for (name, value) in attributes {
		write_attribute(out, name, Some(value));
	}
	out.push('>');
}

fn write_attribute(out: &mut String, name: &str, value: Option<&str>) {
	out.push(' ');
	out.push_str(name);
	match value {
		Some(value) if !value.is_empty() => {
			out.push_str("=\"");
			for c in value.chars() {
				match c {
					'"' => out.push_str("&quot;"),
					c => out.push(c),
				}
			}
			out.push('"');
		}
		_ => (),
	}
}

pub(crate) fn write_end_tag(out: &mut String, tag: &str) {
	if !is_void(tag) {
		// Writing into a `String` can't fail.
		let _ = write!(out, "</{}>", tag);
	}
}

/// Serializes detached nodes back to markup.
pub fn write_nodes(out: &mut String, nodes: &[VNode]) {
	for node in nodes {
		match node {
			VNode::Element(element) => {
				write_start_tag(out, &element.tag, &element.attributes);
				write_nodes(out, &element.children);
				write_end_tag(out, &element.tag);
			}
			VNode::Text(text) => out.push_str(text),
			VNode::Comment(comment) => {
				out.push_str("<!--");
				out.push_str(comment);
				out.push_str("-->");
			}
		}
	}
}

/// The tag name of the first element in `literal`, skipping leading whitespace and comments.
///
/// The start tag doesn't need to be complete, so this works on the first literal of a template whose root tag carries
/// dynamic attributes.
#[must_use]
pub fn leading_tag_name(literal: &str) -> Option<String> {
	Tokenizer::new(literal).find(|(_, _, token)| !is_trivia(token)).and_then(|(_, _, token)| match token {
		Token::StartTag { name, .. } => Some(name),
		_ => None,
	})
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RootError {
	#[error("markup does not start with an element")]
	NoElement,
	#[error("root element <{0}> is never closed")]
	Unclosed(String),
	#[error("content follows the root element <{0}>")]
	TrailingContent(String),
}

/// Inserts `attributes` into the start tag of the single root element of `html`, optionally dropping its content.
///
/// Whitespace and comments may surround the root. Anything else is a [`RootError`].
pub fn annotate_root(html: &str, attributes: &[(&str, Option<&str>)], clear_inner: bool) -> Result<String, RootError> {
	let mut tokens = Tokenizer::new(html);

	let (open_end, name, self_closing, terminated) = loop {
		match tokens.next() {
			None => return Err(RootError::NoElement),
			Some((_, _, ref token)) if is_trivia(token) => continue,
			Some((
				_,
				end,
				Token::StartTag {
					name,
					self_closing,
					terminated,
					..
				},
			)) => break (end, name, self_closing, terminated),
			Some(_) => return Err(RootError::NoElement),
		}
	};
	if !terminated {
		return Err(RootError::Unclosed(name));
	}

	let (close_start, close_end) = if self_closing || is_void(&name) {
		(open_end, open_end)
	} else {
		let mut open = vec![name.clone()];
		loop {
			match tokens.next() {
				None => return Err(RootError::Unclosed(name)),
				Some((_, _, Token::StartTag { name: inner, self_closing, .. })) => {
					if !self_closing && !is_void(&inner) {
						open.push(inner);
					}
				}
				Some((start, end, Token::EndTag { name: inner })) => {
					if let Some(position) = open.iter().rposition(|n| *n == inner) {
						open.truncate(position);
						if open.is_empty() {
							break (start, end);
						}
					}
				}
				Some(_) => (),
			}
		}
	};

	if tokens.any(|(_, _, token)| !is_trivia(&token)) {
		return Err(RootError::TrailingContent(name));
	}

	let insert_at = if self_closing { open_end - 2 } else { open_end - 1 };
	let mut out = String::with_capacity(html.len() + 32);
	out.push_str(&html[..insert_at]);
	for &(attribute, value) in attributes {
		write_attribute(&mut out, attribute, value);
	}
	out.push_str(&html[insert_at..open_end]);
	if !clear_inner {
		out.push_str(&html[open_end..close_start]);
	}
	out.push_str(&html[close_start..close_end]);
	out.push_str(&html[close_end..]);
	Ok(out)
}

/// `<tag data-magic="…" data-skip></tag>`, the constant-size stand-in for an unchanged root.
#[must_use]
pub fn skip_marker(tag: &str, magic_id: &str) -> String {
	let mut out = String::with_capacity(tag.len() * 2 + magic_id.len() + 32);
	out.push('<');
	out.push_str(tag);
	write_attribute(&mut out, crate::MAGIC_ID, Some(magic_id));
	write_attribute(&mut out, crate::SKIP, None);
	out.push('>');
	write_end_tag(&mut out, tag);
	out
}
