use std::collections::HashMap;

use quick_xml::{
	events::{BytesStart, Event},
	Reader,
};

use super::{
	object_type_id, DeclarativeGraph, Entry, ObjectNode, PendingReference, PropertyData, PropertyNode,
	RawValue, ReadContext, FORMAT_VERSION, ROOT_ELEMENT,
};
use crate::{Diagnostic, DiagnosticKind, Diagnostics, Error, Registry, Result, Serializable, TypeTag};

fn xml_error(err: impl std::fmt::Display) -> Error {
	Error::Xml(err.to_string())
}

/// An element of the document, with its attributes.
struct Element {
	name: String,
	attrs: Vec<(String, String)>,
}

impl Element {
	fn read(start: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Self> {
		let name = std::str::from_utf8(start.name().as_ref()).map_err(xml_error)?.to_string();
		let mut attrs = Vec::new();
		for attr in start.attributes() {
			let attr = attr.map_err(xml_error)?;
			let key = std::str::from_utf8(attr.key.as_ref()).map_err(xml_error)?.to_string();
			let value = attr
				.decode_and_unescape_value(reader.decoder())
				.map_err(xml_error)?
				.into_owned();
			attrs.push((key, value));
		}
		Ok(Self { name, attrs })
	}

	fn attr(&self, key: &str) -> Option<&str> {
		self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
	}

	fn take(&mut self, key: &str) -> Option<String> {
		let index = self.attrs.iter().position(|(k, _)| k == key)?;
		Some(self.attrs.remove(index).1)
	}

	/// `value` or `ref` attribute.
	fn raw_value(&mut self) -> Option<RawValue> {
		if let Some(value) = self.take("value") {
			return Some(RawValue::Text(value));
		}
		self.take("ref").map(RawValue::Ref)
	}
}

/// Element being parsed.
enum Frame {
	Root(Vec<ObjectNode>),
	Object(ObjectNode),
	Property {
		element: Element,
		entries: Vec<Entry>,
		items: Vec<RawValue>,
	},
	/// `Entry` or `Item` element, already added to its property
	Leaf,
}

/// Parse document into object nodes.
pub(crate) fn parse_document(text: &str) -> Result<Vec<ObjectNode>> {
	let mut reader = Reader::from_str(text);
	reader.config_mut().trim_text(true);

	let mut stack: Vec<Frame> = Vec::new();
	let mut document = None;

	loop {
		let (start, is_empty) = match reader.read_event().map_err(xml_error)? {
			Event::Start(start) => (start, false),
			Event::Empty(start) => (start, true),
			Event::End(_) => {
				let frame = stack.pop().ok_or_else(|| xml_error("unbalanced end tag"))?;
				if let Some(objects) = close(frame, &mut stack)? {
					document = Some(objects);
				}
				continue;
			}
			Event::Eof => break,
			// Declaration, comments, whitespace
			_ => continue,
		};

		let element = Element::read(&start, &reader)?;
		if document.is_some() {
			return Err(xml_error(format!("element `{}` after end of document", element.name)));
		}
		let frame = open(element, &mut stack)?;
		if is_empty {
			if let Some(objects) = close(frame, &mut stack)? {
				document = Some(objects);
			}
		} else {
			stack.push(frame);
		}
	}

	if !stack.is_empty() {
		return Err(xml_error("unexpected end of document"));
	}
	document.ok_or_else(|| xml_error(format!("missing `{ROOT_ELEMENT}` element")))
}

/// Start a new element, given the elements enclosing it.
fn open(mut element: Element, stack: &mut [Frame]) -> Result<Frame> {
	let in_root = matches!(stack.last(), Some(Frame::Root(_)));
	match stack.last_mut() {
		None => {
			if element.name != ROOT_ELEMENT {
				return Err(xml_error(format!("expected `{ROOT_ELEMENT}`, found `{}`", element.name)));
			}
			let version = element.attr("version").unwrap_or("");
			if version != FORMAT_VERSION.to_string() {
				return Err(Error::FormatMismatch(format!(
					"document version `{version}`, expected `{FORMAT_VERSION}`"
				)));
			}
			Ok(Frame::Root(Vec::new()))
		}
		Some(Frame::Root(_)) | Some(Frame::Object(_)) => match element.take("id") {
			Some(id) => {
				let id = id
					.parse()
					.map_err(|_| Error::FormatMismatch(format!("invalid object id `{id}`")))?;
				Ok(Frame::Object(ObjectNode {
					type_name: element.name,
					id,
					properties: Vec::new(),
					children: Vec::new(),
				}))
			}
			None if in_root => {
				Err(xml_error(format!("object element `{}` without `id`", element.name)))
			}
			None => Ok(Frame::Property {
				element,
				entries: Vec::new(),
				items: Vec::new(),
			}),
		},
		Some(Frame::Property { entries, items, .. }) => {
			let name = element.name.clone();
			let value = element.raw_value().unwrap_or(RawValue::Text(String::new()));
			match name.as_str() {
				"Entry" => entries.push(Entry {
					index: element.take("index"),
					first: element.take("first"),
					second: element.take("second"),
					value,
				}),
				"Item" => items.push(value),
				_ => return Err(xml_error(format!("unexpected element `{name}` in property"))),
			}
			Ok(Frame::Leaf)
		}
		Some(Frame::Leaf) => Err(xml_error(format!("unexpected element `{}`", element.name))),
	}
}

/// Finish an element, adding it to the one enclosing it.
/// Returns the document's objects when the root element closes.
fn close(frame: Frame, stack: &mut [Frame]) -> Result<Option<Vec<ObjectNode>>> {
	match frame {
		Frame::Root(objects) => Ok(Some(objects)),
		Frame::Object(node) => {
			match stack.last_mut() {
				Some(Frame::Root(objects)) => objects.push(node),
				Some(Frame::Object(owner)) => owner.children.push(node),
				_ => return Err(xml_error("object element in unexpected position")),
			}
			Ok(None)
		}
		Frame::Property {
			mut element,
			entries,
			items,
		} => {
			let data = if let Some(value) = element.raw_value() {
				PropertyData::Value(value)
			} else if let (Some(min), Some(max)) = (element.take("min"), element.take("max")) {
				PropertyData::Range { min, max }
			} else if let Some(count) = element.take("count") {
				PropertyData::Collection { count, items }
			} else if !items.is_empty() {
				// Items without a count
				PropertyData::Collection {
					count: String::new(),
					items,
				}
			} else {
				PropertyData::Entries(entries)
			};
			match stack.last_mut() {
				Some(Frame::Object(owner)) => owner.properties.push(PropertyNode {
					name: element.name,
					data,
				}),
				_ => return Err(xml_error("property element outside an object")),
			}
			Ok(None)
		}
		Frame::Leaf => Ok(None),
	}
}

/// Create objects from document nodes, then set references between them.
pub(crate) fn build_objects(registry: &Registry, nodes: &[ObjectNode]) -> Result<DeclarativeGraph> {
	let mut builder = Builder {
		registry,
		objects: Vec::new(),
		index: HashMap::new(),
		pending: Vec::new(),
		diagnostics: Diagnostics::new(),
	};
	for node in nodes {
		builder.build(node, false)?;
	}
	builder.resolve_references()?;

	for summary in builder.diagnostics.by_object() {
		tracing::debug!(
			tag = summary.tag.get(),
			id = summary.id,
			diagnostics = summary.count,
			skipped = summary.skipped,
			"object loaded with diagnostics"
		);
	}
	tracing::debug!(
		objects = builder.objects.len(),
		diagnostics = builder.diagnostics.len(),
		"loaded declarative document"
	);
	Ok(DeclarativeGraph {
		objects: builder.objects,
		diagnostics: builder.diagnostics,
	})
}

struct Builder<'r> {
	registry: &'r Registry,
	objects: Vec<(u64, Box<dyn Serializable>)>,
	/// Identity -> (index in `objects`, tag)
	index: HashMap<u64, (usize, TypeTag)>,
	pending: Vec<PendingReference>,
	diagnostics: Diagnostics,
}

impl<'r> Builder<'r> {
	fn build(&mut self, node: &ObjectNode, has_owner: bool) -> Result<()> {
		let (tag, serializer) = self
			.registry
			.declarative_by_name(&node.type_name)
			.ok_or_else(|| Error::FormatMismatch(format!("unknown type `{}`", node.type_name)))?;

		if serializer.is_subordinate() && !has_owner {
			self.diagnostics.push(
				Diagnostic::new(
					DiagnosticKind::SubordinateWithoutOwner,
					tag,
					format!("`{}` outside any owner, not loaded", node.type_name),
				)
				.with_id(node.id),
			);
			return Ok(());
		}
		if node.id == 0 || self.index.contains_key(&node.id) {
			return Err(Error::FormatMismatch(format!("invalid or duplicate object id {}", node.id)));
		}

		let mut ctx = ReadContext {
			tag,
			id: node.id,
			diagnostics: &mut self.diagnostics,
			pending: &mut self.pending,
		};
		let object = serializer.file_to_object(node, &mut ctx)?;
		if object.type_tag() != tag {
			return Err(Error::InvalidArgument(format!(
				"`{}` created object with tag {}, registered as {tag}",
				node.type_name,
				object.type_tag()
			)));
		}

		self.index.insert(node.id, (self.objects.len(), tag));
		self.objects.push((node.id, object));

		for child in &node.children {
			self.build(child, true)?;
		}
		Ok(())
	}

	fn resolve_references(&mut self) -> Result<()> {
		for pending in std::mem::take(&mut self.pending) {
			let malformed = |message: String| {
				Diagnostic::new(DiagnosticKind::MalformedProperty, pending.tag, message)
					.with_id(pending.source)
					.with_field(pending.property.as_str())
			};

			let Some(&(target_index, _)) = self.index.get(&pending.target) else {
				self.diagnostics.push(malformed(format!("references unknown object {}", pending.target)));
				continue;
			};
			let Some(&(source_index, _)) = self.index.get(&pending.source) else {
				continue;
			};
			let serializer = self
				.registry
				.declarative(pending.tag)
				.ok_or(Error::UnregisteredType(pending.tag))?;

			let target = self.objects[target_index].1.as_ref();
			if serializer.reference_type(&pending.property) != Some(object_type_id(target)) {
				self.diagnostics.push(malformed(format!(
					"object {} is not of the type this property links to",
					pending.target
				)));
				continue;
			}
			let addr = target.addr();

			serializer.set_reference(self.objects[source_index].1.as_mut(), &pending.property, addr)?;
		}
		Ok(())
	}
}
