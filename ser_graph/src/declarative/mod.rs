//! Declarative serialization: objects as named property lists in an XML
//! document.
//!
//! Each type registers a [`DeclarativeSerializer`], normally a
//! [`TypedDeclarative`] driven by a [`PropertyTable`]. Document layout:
//!
//! ```xml
//! <SerGraph version="1">
//!   <Body id="1">
//!     <mass value="2.5"/>
//!     <limits min="-1.0" max="1.0"/>
//!     <weights><Entry index="0" value="0.5"/></weights>
//!     <springs><Entry first="0" second="1" value="3.0"/></springs>
//!     <tags count="2"><Item value="a"/><Item value="b"/></tags>
//!     <parent ref="3"/>
//!     <Shape id="2">
//!       ...
//!     </Shape>
//!   </Body>
//! </SerGraph>
//! ```
//!
//! Object elements carry an `id` attribute, property elements never do.
//! Subordinate objects are nested inside their owner's element.

use std::{
	any::{Any, TypeId},
	collections::HashMap,
	io,
};

use crate::{Collection, Diagnostic, DiagnosticKind, Diagnostics, Error, Registry, Result, Serializable, TypeTag};

pub mod property;
mod reader;
pub mod value;
mod writer;

pub use property::{Access, Property, PropertyShape, PropertyTable};
use property::Accessor;
pub use value::{PropertyType, PropertyValue, ValueKind};

/// Version written to, and required of, the root element.
pub const FORMAT_VERSION: u32 = 1;

/// Name of the root element.
pub const ROOT_ELEMENT: &str = "SerGraph";

/// One object in a document, before conversion to a live object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectNode {
	pub type_name: String,
	pub id: u64,
	pub properties: Vec<PropertyNode>,
	/// Subordinate objects owned by this one
	pub children: Vec<ObjectNode>,
}

impl ObjectNode {
	/// Get property by name.
	pub fn property(&self, name: &str) -> Option<&PropertyNode> {
		self.properties.iter().find(|p| p.name == name)
	}
}

/// One property of an object in a document.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyNode {
	pub name: String,
	pub data: PropertyData,
}

/// Property data as written in a document. Values are unparsed text.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyData {
	Value(RawValue),
	Range { min: String, max: String },
	/// Entries of an indexed or dual-indexed property
	Entries(Vec<Entry>),
	Collection { count: String, items: Vec<RawValue> },
}

/// Entry of an indexed (`index`) or dual-indexed (`first` and `second`)
/// property.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
	pub index: Option<String>,
	pub first: Option<String>,
	pub second: Option<String>,
	pub value: RawValue,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
	/// `value` attribute
	Text(String),
	/// `ref` attribute: identity of another object
	Ref(String),
}

/// Context for writing properties of one object.
pub struct WriteContext<'w> {
	tag: TypeTag,
	id: u64,
	/// Object address -> identity, for every object in the document
	ids: &'w HashMap<usize, u64>,
}

impl<'w> WriteContext<'w> {
	#[inline]
	pub fn id(&self) -> u64 {
		self.id
	}

	/// Identity of object at `addr`, or 0 if `addr` is 0.
	///
	/// Fails with [`Error::UnresolvedReference`] if the object is not part of
	/// the document.
	pub fn id_of_addr(&self, addr: usize) -> Result<u64> {
		if addr == 0 {
			return Ok(0);
		}
		self.ids.get(&addr).copied().ok_or(Error::UnresolvedReference {
			tag: self.tag,
			source_id: self.id,
		})
	}
}

/// A link to be set once every object of a document exists.
#[derive(Clone, Debug)]
pub(crate) struct PendingReference {
	source: u64,
	tag: TypeTag,
	property: String,
	target: u64,
}

/// Context for reading properties of one object.
pub struct ReadContext<'r> {
	tag: TypeTag,
	id: u64,
	diagnostics: &'r mut Diagnostics,
	pending: &'r mut Vec<PendingReference>,
}

impl<'r> ReadContext<'r> {
	#[inline]
	pub fn id(&self) -> u64 {
		self.id
	}

	#[inline]
	pub fn tag(&self) -> TypeTag {
		self.tag
	}

	/// Report a property which could not be loaded. Property keeps its current
	/// value.
	pub fn malformed(&mut self, property: &str, message: impl Into<String>) {
		self.diagnostics.push(
			Diagnostic::new(DiagnosticKind::MalformedProperty, self.tag, message)
				.with_id(self.id)
				.with_field(property),
		);
	}

	/// Set a reference property to object `target` once all objects exist.
	pub fn defer_reference(&mut self, property: &str, target: u64) {
		self.pending.push(PendingReference {
			source: self.id,
			tag: self.tag,
			property: property.to_string(),
			target,
		});
	}
}

/// Declarative serializer of one type, registered in a [`Registry`] with
/// [`Registry::register_declarative`].
pub trait DeclarativeSerializer: Send + Sync {
	/// Name of the type's elements in documents.
	fn type_name(&self) -> &str;

	/// Whether objects of this type can only be loaded nested inside an owner.
	fn is_subordinate(&self) -> bool {
		false
	}

	/// Get a ready-made instance to load properties into. `None` if
	/// [`construct`](DeclarativeSerializer::construct) builds the object.
	fn allocate_object(&self) -> Option<Box<dyn Serializable>>;

	/// Build object from its document node. Only called when
	/// [`allocate_object`](DeclarativeSerializer::allocate_object) returns
	/// `None`.
	fn construct(&self, node: &ObjectNode, ctx: &mut ReadContext<'_>) -> Result<Box<dyn Serializable>>;

	/// Create object from its document node, and load its properties.
	fn file_to_object(&self, node: &ObjectNode, ctx: &mut ReadContext<'_>) -> Result<Box<dyn Serializable>> {
		let mut object = match self.allocate_object() {
			Some(object) => object,
			None => self.construct(node, ctx)?,
		};
		self.read_all_properties(node, object.as_mut(), ctx)?;
		Ok(object)
	}

	/// Load every writable property present in `node` into `object`.
	///
	/// Properties which fail to parse are reported with
	/// [`ReadContext::malformed`] and keep their value. Only an object of the
	/// wrong type is an error.
	fn read_all_properties(
		&self,
		node: &ObjectNode,
		object: &mut dyn Serializable,
		ctx: &mut ReadContext<'_>,
	) -> Result<()>;

	/// Get every readable property of `object`.
	fn write_all_properties(&self, object: &dyn Serializable, ctx: &WriteContext<'_>) -> Result<Vec<PropertyNode>>;

	/// Subordinate objects owned by `object`, written nested inside it.
	#[allow(unused_variables)]
	fn subordinates<'a>(&self, object: &'a dyn Serializable) -> Vec<&'a dyn Serializable> {
		Vec::new()
	}

	/// Type of object which reference property `property` links to.
	fn reference_type(&self, property: &str) -> Option<TypeId>;

	/// Point reference property `property` at the object at `addr`, whose type
	/// has been checked against [`reference_type`].
	///
	/// [`reference_type`]: DeclarativeSerializer::reference_type
	fn set_reference(&self, object: &mut dyn Serializable, property: &str, addr: usize) -> Result<()>;
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Constructor<T> = Box<dyn Fn(&ObjectNode) -> Result<T> + Send + Sync>;
type Subordinates<T> = Box<dyn for<'a> Fn(&'a T) -> Vec<&'a dyn Serializable> + Send + Sync>;

/// [`DeclarativeSerializer`] for any type, driven by a [`PropertyTable`].
pub struct TypedDeclarative<T: Serializable> {
	name: String,
	properties: PropertyTable<T>,
	factory: Option<Factory<T>>,
	constructor: Option<Constructor<T>>,
	subordinates: Option<Subordinates<T>>,
	subordinate: bool,
}

impl<T: Serializable> TypedDeclarative<T> {
	pub fn new(name: impl Into<String>, properties: PropertyTable<T>) -> Self {
		Self {
			name: name.into(),
			properties,
			factory: None,
			constructor: None,
			subordinates: None,
			subordinate: false,
		}
	}

	/// Create objects with `factory` before loading their properties.
	pub fn with_factory<F>(mut self, factory: F) -> Self
	where
		F: Fn() -> T + Send + Sync + 'static,
	{
		self.factory = Some(Box::new(factory));
		self
	}

	/// Build objects from their document node with `constructor`, when there's
	/// no factory.
	pub fn with_constructor<F>(mut self, constructor: F) -> Self
	where
		F: Fn(&ObjectNode) -> Result<T> + Send + Sync + 'static,
	{
		self.constructor = Some(Box::new(constructor));
		self
	}

	/// Objects owned by each object, written nested inside it.
	pub fn with_subordinates<F>(mut self, subordinates: F) -> Self
	where
		F: for<'a> Fn(&'a T) -> Vec<&'a dyn Serializable> + Send + Sync + 'static,
	{
		self.subordinates = Some(Box::new(subordinates));
		self
	}

	/// Mark type as subordinate.
	pub fn subordinate(mut self) -> Self {
		self.subordinate = true;
		self
	}

	pub fn properties(&self) -> &PropertyTable<T> {
		&self.properties
	}

	pub fn boxed(self) -> Box<dyn DeclarativeSerializer> {
		Box::new(self)
	}

	fn typed<'a>(&self, object: &'a dyn Serializable) -> Result<&'a T> {
		object.downcast_ref::<T>().ok_or_else(|| self.wrong_type(object.type_tag()))
	}

	fn typed_mut<'a>(&self, object: &'a mut dyn Serializable) -> Result<&'a mut T> {
		let tag = object.type_tag();
		object.downcast_mut::<T>().ok_or_else(|| self.wrong_type(tag))
	}

	fn wrong_type(&self, tag: TypeTag) -> Error {
		Error::InvalidArgument(format!(
			"object with tag {tag} passed to declarative serializer for `{}`",
			self.name
		))
	}
}

impl<T: Serializable> DeclarativeSerializer for TypedDeclarative<T> {
	fn type_name(&self) -> &str {
		&self.name
	}

	fn is_subordinate(&self) -> bool {
		self.subordinate
	}

	fn allocate_object(&self) -> Option<Box<dyn Serializable>> {
		self
			.factory
			.as_ref()
			.map(|factory| Box::new(factory()) as Box<dyn Serializable>)
	}

	fn construct(&self, node: &ObjectNode, _ctx: &mut ReadContext<'_>) -> Result<Box<dyn Serializable>> {
		match &self.constructor {
			Some(constructor) => Ok(Box::new(constructor(node)?)),
			None => Err(Error::InvalidArgument(format!(
				"`{}` has neither factory nor constructor",
				self.name
			))),
		}
	}

	fn read_all_properties(
		&self,
		node: &ObjectNode,
		object: &mut dyn Serializable,
		ctx: &mut ReadContext<'_>,
	) -> Result<()> {
		let object = self.typed_mut(object)?;

		for prop in &node.properties {
			match self.properties.get(&prop.name) {
				Some(property) if property.access().can_write() => {
					if let Err(message) = read_property(property, &prop.data, object, ctx) {
						ctx.malformed(&prop.name, message);
					}
				}
				// Read-only properties are in output for information only
				Some(_) => {}
				None => ctx.malformed(&prop.name, format!("`{}` has no such property", self.name)),
			}
		}
		Ok(())
	}

	fn write_all_properties(&self, object: &dyn Serializable, ctx: &WriteContext<'_>) -> Result<Vec<PropertyNode>> {
		let object = self.typed(object)?;
		let mut out = Vec::with_capacity(self.properties.len());
		for property in self.properties.iter().filter(|p| p.access().can_read()) {
			out.push(PropertyNode {
				name: property.name().to_string(),
				data: write_property(property, object, ctx)?,
			});
		}
		Ok(out)
	}

	fn subordinates<'a>(&self, object: &'a dyn Serializable) -> Vec<&'a dyn Serializable> {
		match (&self.subordinates, object.downcast_ref::<T>()) {
			(Some(subordinates), Some(object)) => subordinates(object),
			_ => Vec::new(),
		}
	}

	fn reference_type(&self, property: &str) -> Option<TypeId> {
		match self.properties.get(property)?.accessor {
			Accessor::Reference { target, .. } => Some(target),
			_ => None,
		}
	}

	fn set_reference(&self, object: &mut dyn Serializable, property: &str, addr: usize) -> Result<()> {
		let object = self.typed_mut(object)?;
		match self.properties.get(property).map(|p| &p.accessor) {
			Some(Accessor::Reference { set, .. }) => {
				set(object, addr);
				Ok(())
			}
			_ => Err(Error::InvalidArgument(format!(
				"`{}` has no reference property `{property}`",
				self.name
			))),
		}
	}
}

fn parse_u32(text: &str, what: &str) -> std::result::Result<u32, String> {
	text.trim().parse().map_err(|_| format!("`{text}` is not a valid {what}"))
}

fn text_value(property_kind: ValueKind, value: &RawValue) -> std::result::Result<PropertyValue, String> {
	match value {
		RawValue::Text(text) => PropertyValue::parse(property_kind, text),
		RawValue::Ref(_) => Err("object reference where a value was expected".into()),
	}
}

/// Load one property into `object`. Errors describe why the property is
/// malformed.
fn read_property<T>(
	property: &Property<T>,
	data: &PropertyData,
	object: &mut T,
	ctx: &mut ReadContext<'_>,
) -> std::result::Result<(), String> {
	let kind = property.kind();
	match (&property.accessor, data) {
		(Accessor::Basic { set, .. }, PropertyData::Value(value)) => set(object, text_value(kind, value)?),
		(Accessor::Reference { set, .. }, PropertyData::Value(RawValue::Ref(text))) => {
			let target: u64 = text
				.trim()
				.parse()
				.map_err(|_| format!("`{text}` is not a valid object reference"))?;
			if target == 0 {
				set(object, 0);
			} else {
				ctx.defer_reference(property.name(), target);
			}
			Ok(())
		}
		(Accessor::Ranged { set, .. }, PropertyData::Range { min, max }) => set(
			object,
			(PropertyValue::parse(kind, min)?, PropertyValue::parse(kind, max)?),
		),
		(Accessor::Indexed { set, .. }, PropertyData::Entries(entries)) => {
			// Parse all entries before setting any
			let mut values = Vec::with_capacity(entries.len());
			for entry in entries {
				let index = entry.index.as_deref().ok_or("entry without `index`")?;
				values.push((parse_u32(index, "index")?, text_value(kind, &entry.value)?));
			}
			set(object, values)
		}
		(Accessor::DualIndexed { set, .. }, PropertyData::Entries(entries)) => {
			let mut values = Vec::with_capacity(entries.len());
			for entry in entries {
				let (Some(first), Some(second)) = (entry.first.as_deref(), entry.second.as_deref()) else {
					return Err("entry without `first` and `second`".into());
				};
				values.push((
					parse_u32(first, "index")?,
					parse_u32(second, "index")?,
					text_value(kind, &entry.value)?,
				));
			}
			set(object, values)
		}
		(Accessor::Collection { set, .. }, PropertyData::Collection { count, items }) => {
			let count = parse_u32(count, "count")? as usize;
			if count != items.len() {
				return Err(format!("count is {count}, found {} items", items.len()));
			}
			let values = items
				.iter()
				.map(|item| text_value(kind, item))
				.collect::<std::result::Result<Vec<_>, _>>()?;
			set(object, values)
		}
		(_, data) => Err(format!(
			"expected {:?} property, found {}",
			property.shape(),
			describe(data)
		)),
	}
}

fn describe(data: &PropertyData) -> &'static str {
	match data {
		PropertyData::Value(RawValue::Text(_)) => "a single value",
		PropertyData::Value(RawValue::Ref(_)) => "an object reference",
		PropertyData::Range { .. } => "a range",
		PropertyData::Entries(_) => "indexed entries",
		PropertyData::Collection { .. } => "a collection",
	}
}

fn write_property<T>(property: &Property<T>, object: &T, ctx: &WriteContext<'_>) -> Result<PropertyData> {
	let data = match &property.accessor {
		Accessor::Basic { get, .. } => PropertyData::Value(RawValue::Text(get(object).to_text())),
		Accessor::Reference { get, .. } => {
			let id = ctx.id_of_addr(get(object))?;
			PropertyData::Value(RawValue::Ref(id.to_string()))
		}
		Accessor::Ranged { get, .. } => {
			let (min, max) = get(object);
			PropertyData::Range {
				min: min.to_text(),
				max: max.to_text(),
			}
		}
		Accessor::Indexed { get, .. } => PropertyData::Entries(
			get(object)
				.into_iter()
				.map(|(index, value)| Entry {
					index: Some(index.to_string()),
					first: None,
					second: None,
					value: RawValue::Text(value.to_text()),
				})
				.collect(),
		),
		Accessor::DualIndexed { get, .. } => PropertyData::Entries(
			get(object)
				.into_iter()
				.map(|(first, second, value)| Entry {
					index: None,
					first: Some(first.to_string()),
					second: Some(second.to_string()),
					value: RawValue::Text(value.to_text()),
				})
				.collect(),
		),
		Accessor::Collection { get, .. } => {
			let items: Vec<RawValue> = get(object).iter().map(|v| RawValue::Text(v.to_text())).collect();
			PropertyData::Collection {
				count: items.len().to_string(),
				items,
			}
		}
	};
	Ok(data)
}

/// Objects loaded from a document. Each is boxed, and owns its memory.
pub struct DeclarativeGraph {
	/// `(identity, object)` in document order, owners before their
	/// subordinates
	objects: Vec<(u64, Box<dyn Serializable>)>,
	diagnostics: Diagnostics,
}

impl DeclarativeGraph {
	#[inline]
	pub fn len(&self) -> usize {
		self.objects.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}

	pub fn get(&self, id: u64) -> Option<&dyn Serializable> {
		self.objects.iter().find(|(obj_id, _)| *obj_id == id).map(|(_, obj)| obj.as_ref())
	}

	pub fn get_mut(&mut self, id: u64) -> Option<&mut dyn Serializable> {
		self
			.objects
			.iter_mut()
			.find(|(obj_id, _)| *obj_id == id)
			.map(|(_, obj)| obj.as_mut())
	}

	pub fn iter(&self) -> impl Iterator<Item = (u64, &dyn Serializable)> + '_ {
		self.objects.iter().map(|(id, obj)| (*id, obj.as_ref()))
	}

	/// Collection of all loaded objects, with their document identities.
	pub fn collection(&self) -> Collection<'_> {
		let mut collection = Collection::new();
		for (id, object) in self.iter() {
			collection.insert_loaded(id, object);
		}
		collection
	}

	#[inline]
	pub fn diagnostics(&self) -> &Diagnostics {
		&self.diagnostics
	}

	/// Take ownership of the objects.
	///
	/// Objects link to each other with [`ObjPtr`](crate::ObjPtr)s, so must be
	/// kept alive together.
	pub fn into_objects(self) -> Vec<(u64, Box<dyn Serializable>)> {
		self.objects
	}
}

impl std::fmt::Debug for DeclarativeGraph {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DeclarativeGraph")
			.field("objects", &self.objects.len())
			.field("diagnostics", &self.diagnostics.len())
			.finish()
	}
}

/// Write collection members, and their subordinates, as a document.
pub fn serialize(registry: &Registry, collection: &Collection<'_>) -> Result<String> {
	let nodes = writer::build_nodes(registry, collection)?;
	writer::write_document(&nodes)
}

/// Write document to an `io::Write`.
pub fn serialize_to<W: io::Write>(registry: &Registry, collection: &Collection<'_>, out: &mut W) -> Result<()> {
	out.write_all(serialize(registry, collection)?.as_bytes())?;
	Ok(())
}

/// Load objects from a document.
///
/// Malformed properties, unknown properties, and subordinate objects
/// outside any owner are reported in the graph's diagnostics. Malformed XML,
/// a wrong version, and unregistered type names are errors.
pub fn deserialize(registry: &Registry, text: &str) -> Result<DeclarativeGraph> {
	let nodes = reader::parse_document(text)?;
	reader::build_objects(registry, &nodes)
}

/// Load objects from a document read from an `io::Read`.
pub fn deserialize_from<R: io::Read>(registry: &Registry, input: &mut R) -> Result<DeclarativeGraph> {
	let mut text = String::new();
	input.read_to_string(&mut text)?;
	deserialize(registry, &text)
}

/// Type of a loaded object, for checking reference targets.
#[inline]
fn object_type_id(object: &dyn Serializable) -> TypeId {
	Any::type_id(object.as_any())
}
