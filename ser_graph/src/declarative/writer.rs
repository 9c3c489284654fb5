use std::collections::{HashMap, HashSet};

use quick_xml::{
	events::{BytesDecl, BytesEnd, BytesStart, Event},
	Writer,
};

use super::{
	DeclarativeSerializer, Entry, ObjectNode, PropertyData, PropertyNode, RawValue, WriteContext,
	FORMAT_VERSION, ROOT_ELEMENT,
};
use crate::{Collection, Error, Registry, Result, Serializable};

fn declarative_for<'r>(registry: &'r Registry, object: &dyn Serializable) -> Result<&'r dyn DeclarativeSerializer> {
	let tag = object.type_tag();
	registry.declarative(tag).ok_or(Error::UnregisteredType(tag))
}

/// Build document nodes for collection members and their subordinates.
///
/// Subordinates which are also collection members are only written nested
/// inside their owner.
pub(crate) fn build_nodes(registry: &Registry, collection: &Collection<'_>) -> Result<Vec<ObjectNode>> {
	let mut ids: HashMap<usize, u64> = collection.iter().map(|(id, obj)| (obj.addr(), id)).collect();
	let mut next_id = collection.max_id() + 1;
	let mut nested = HashSet::new();

	// Assign identities to subordinates, depth first
	let mut stack: Vec<&dyn Serializable> = collection.iter().map(|(_, obj)| obj).collect();
	while let Some(object) = stack.pop() {
		for sub in declarative_for(registry, object)?.subordinates(object) {
			if !nested.insert(sub.addr()) {
				return Err(Error::InvalidArgument(format!(
					"object {} is a subordinate of more than one owner",
					ids.get(&sub.addr()).copied().unwrap_or(0)
				)));
			}
			ids.entry(sub.addr()).or_insert_with(|| {
				let id = next_id;
				next_id += 1;
				id
			});
			stack.push(sub);
		}
	}

	collection
		.iter()
		.filter(|(_, obj)| !nested.contains(&obj.addr()))
		.map(|(id, obj)| build_node(registry, obj, id, &ids))
		.collect()
}

fn build_node(
	registry: &Registry,
	object: &dyn Serializable,
	id: u64,
	ids: &HashMap<usize, u64>,
) -> Result<ObjectNode> {
	let serializer = declarative_for(registry, object)?;
	let ctx = WriteContext {
		tag: object.type_tag(),
		id,
		ids,
	};
	let properties = serializer.write_all_properties(object, &ctx)?;

	let mut children = Vec::new();
	for sub in serializer.subordinates(object) {
		let sub_id = ids.get(&sub.addr()).copied().ok_or(Error::UnresolvedReference {
			tag: object.type_tag(),
			source_id: id,
		})?;
		children.push(build_node(registry, sub, sub_id, ids)?);
	}

	Ok(ObjectNode {
		type_name: serializer.type_name().to_string(),
		id,
		properties,
		children,
	})
}

fn xml_error(err: impl std::fmt::Display) -> Error {
	Error::Xml(err.to_string())
}

/// Write nodes as an XML document.
pub(crate) fn write_document(nodes: &[ObjectNode]) -> Result<String> {
	let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
	writer
		.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
		.map_err(xml_error)?;

	let version = FORMAT_VERSION.to_string();
	let mut root = BytesStart::new(ROOT_ELEMENT);
	root.push_attribute(("version", version.as_str()));
	writer.write_event(Event::Start(root)).map_err(xml_error)?;
	for node in nodes {
		write_object(&mut writer, node)?;
	}
	writer
		.write_event(Event::End(BytesEnd::new(ROOT_ELEMENT)))
		.map_err(xml_error)?;

	String::from_utf8(writer.into_inner()).map_err(xml_error)
}

fn write_object(writer: &mut Writer<Vec<u8>>, node: &ObjectNode) -> Result<()> {
	let id = node.id.to_string();
	let mut start = BytesStart::new(node.type_name.as_str());
	start.push_attribute(("id", id.as_str()));

	if node.properties.is_empty() && node.children.is_empty() {
		return writer.write_event(Event::Empty(start)).map_err(xml_error);
	}

	writer.write_event(Event::Start(start)).map_err(xml_error)?;
	for property in &node.properties {
		write_property(writer, property)?;
	}
	for child in &node.children {
		write_object(writer, child)?;
	}
	writer
		.write_event(Event::End(BytesEnd::new(node.type_name.as_str())))
		.map_err(xml_error)
}

fn push_value(element: &mut BytesStart<'_>, value: &RawValue) {
	match value {
		RawValue::Text(text) => element.push_attribute(("value", text.as_str())),
		RawValue::Ref(id) => element.push_attribute(("ref", id.as_str())),
	}
}

fn write_property(writer: &mut Writer<Vec<u8>>, property: &PropertyNode) -> Result<()> {
	let name = property.name.as_str();
	let mut start = BytesStart::new(name);

	let children: Vec<BytesStart<'_>> = match &property.data {
		PropertyData::Value(value) => {
			push_value(&mut start, value);
			Vec::new()
		}
		PropertyData::Range { min, max } => {
			start.push_attribute(("min", min.as_str()));
			start.push_attribute(("max", max.as_str()));
			Vec::new()
		}
		PropertyData::Entries(entries) => entries.iter().map(entry_element).collect(),
		PropertyData::Collection { count, items } => {
			start.push_attribute(("count", count.as_str()));
			items
				.iter()
				.map(|item| {
					let mut element = BytesStart::new("Item");
					push_value(&mut element, item);
					element
				})
				.collect()
		}
	};

	if children.is_empty() {
		return writer.write_event(Event::Empty(start)).map_err(xml_error);
	}
	writer.write_event(Event::Start(start)).map_err(xml_error)?;
	for child in children {
		writer.write_event(Event::Empty(child)).map_err(xml_error)?;
	}
	writer.write_event(Event::End(BytesEnd::new(name))).map_err(xml_error)
}

fn entry_element(entry: &Entry) -> BytesStart<'_> {
	let mut element = BytesStart::new("Entry");
	if let Some(index) = &entry.index {
		element.push_attribute(("index", index.as_str()));
	}
	if let Some(first) = &entry.first {
		element.push_attribute(("first", first.as_str()));
	}
	if let Some(second) = &entry.second {
		element.push_attribute(("second", second.as_str()));
	}
	push_value(&mut element, &entry.value);
	element
}
