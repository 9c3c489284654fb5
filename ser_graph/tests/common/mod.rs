#![allow(dead_code)]

use ser_graph::{
	binary::{ExportContext, ImportContext},
	declarative::{PropertyData, PropertyTable, RawValue, TypedDeclarative},
	Error, ExtraPtr, GraphObject, HasLayout, Layout, ObjPtr, ObjectHeader, Registry, Result, Serializable,
	TypeTag, TypedSerializer,
};

/// Rigid body. Links to a parent body, and owns a subordinate shape.
#[derive(Serializable, Layout, Debug)]
#[repr(C)]
pub struct Body {
	pub header: ObjectHeader,
	pub mass: f64,
	pub parent: ObjPtr<Body>,
	pub shape: ObjPtr<Shape>,
	pub index: u32,
	pub enabled: u32,
}

impl Body {
	pub fn new(mass: f64, index: u32) -> Self {
		Self {
			header: ObjectHeader::new(Self::TAG),
			mass,
			parent: ObjPtr::null(),
			shape: ObjPtr::null(),
			index,
			enabled: 1,
		}
	}

	pub fn with_parent(mut self, parent: &Body) -> Self {
		self.parent = unsafe { ObjPtr::new(parent) };
		self
	}

	pub fn with_shape(mut self, shape: &Shape) -> Self {
		self.shape = unsafe { ObjPtr::new(shape) };
		self
	}
}

impl GraphObject for Body {
	const TAG: TypeTag = TypeTag::user(1);
	const NAME: &'static str = "Body";

	fn dependencies(&self) -> Vec<&dyn Serializable> {
		self.parent.get_dyn().into_iter().chain(self.shape.get_dyn()).collect()
	}
}

/// Collision shape. Only loadable as part of the body which owns it.
#[derive(Serializable, Layout, Debug)]
#[repr(C)]
pub struct Shape {
	pub header: ObjectHeader,
	pub radius: f32,
	pub sides: u32,
}

impl Shape {
	pub fn new(radius: f32, sides: u32) -> Self {
		Self {
			header: ObjectHeader::new(Self::TAG),
			radius,
			sides,
		}
	}
}

impl GraphObject for Shape {
	const TAG: TypeTag = TypeTag::user(2);
	const NAME: &'static str = "Shape";

	fn is_subordinate(&self) -> bool {
		true
	}
}

/// Mesh with vertex data and material attached as extra data.
#[derive(Serializable, Layout, Debug)]
#[repr(C)]
pub struct Mesh {
	pub header: ObjectHeader,
	#[layout(count = "vertex_count")]
	pub vertices: ExtraPtr<[f32; 3]>,
	pub vertex_count: u64,
	#[layout(extra)]
	pub material: ExtraPtr<u32>,
}

impl Mesh {
	pub fn new(vertices: Vec<[f32; 3]>, material: u32) -> Self {
		let (vertices, len) = ExtraPtr::from_vec(vertices);
		Self {
			header: ObjectHeader::new(Self::TAG),
			vertices,
			vertex_count: len as u64,
			material: ExtraPtr::from_box(Box::new(material)),
		}
	}

	pub fn vertices(&self) -> &[[f32; 3]] {
		unsafe { self.vertices.as_slice(self.vertex_count as usize) }
	}

	pub fn material(&self) -> Option<u32> {
		unsafe { self.material.as_ref() }.copied()
	}
}

impl Clone for Mesh {
	fn clone(&self) -> Self {
		Mesh::new(self.vertices().to_vec(), self.material().unwrap_or(0))
	}
}

impl GraphObject for Mesh {
	const TAG: TypeTag = TypeTag::user(3);
	const NAME: &'static str = "Mesh";

	fn export_extra(&self, ctx: &mut ExportContext<'_>) -> Result<()> {
		ctx.export_slice(self.vertices());
		if let Some(material) = self.material() {
			ctx.export_value(&material);
		}
		Ok(())
	}

	fn import_extra(&mut self, ctx: &mut ImportContext<'_>) -> Result<()> {
		let (vertices, len) = ctx.import_slice::<[f32; 3]>()?;
		if len as u64 != self.vertex_count {
			return Err(Error::FormatMismatch(format!(
				"mesh has {} vertices, extra data holds {len}",
				self.vertex_count
			)));
		}
		self.vertices = vertices;
		self.material = if ctx.remaining_extra_blocks() > 0 {
			ctx.import_value::<u32>()?
		} else {
			ExtraPtr::null()
		};
		Ok(())
	}
}

impl Drop for Mesh {
	fn drop(&mut self) {
		if self.header.owns_memory() {
			unsafe {
				self.vertices.release_slice(self.vertex_count as usize);
				self.material.release();
			}
		}
	}
}

/// Joint between two bodies. Has no layout table, so is written raw.
#[derive(Serializable, Debug)]
#[repr(C)]
pub struct Joint {
	pub header: ObjectHeader,
	pub a: ObjPtr<Body>,
	pub b: ObjPtr<Body>,
	pub stiffness: f64,
}

impl Joint {
	pub fn new(a: &Body, b: &Body, stiffness: f64) -> Self {
		Self {
			header: ObjectHeader::new(Self::TAG),
			a: unsafe { ObjPtr::new(a) },
			b: unsafe { ObjPtr::new(b) },
			stiffness,
		}
	}
}

impl GraphObject for Joint {
	const TAG: TypeTag = TypeTag::user(4);
	const NAME: &'static str = "Joint";

	fn dependencies(&self) -> Vec<&dyn Serializable> {
		self.a.get_dyn().into_iter().chain(self.b.get_dyn()).collect()
	}

	fn resolve_pointers(&mut self, ctx: &ImportContext<'_>) -> Result<()> {
		ctx.resolve(&mut self.a)?;
		ctx.resolve(&mut self.b)
	}
	fn pointer_fields(&self) -> Option<Vec<(&'static str, usize)>> {
		Some(vec![("a", self.a.addr()), ("b", self.b.addr())])
	}
}

/// Text label. Declarative only, built from its document node.
#[derive(Serializable, Clone, Debug)]
#[repr(C)]
pub struct Label {
	pub header: ObjectHeader,
	pub text: String,
	pub aliases: Vec<String>,
	pub weights: Vec<i32>,
}

impl Label {
	pub const TAG: TypeTag = TypeTag::user(5);

	pub fn new(text: &str) -> Self {
		Self {
			header: ObjectHeader::new(Self::TAG),
			text: text.to_string(),
			aliases: Vec::new(),
			weights: Vec::new(),
		}
	}
}

/// Registry with binary serializers and layouts for all fixture types.
pub fn binary_registry() -> Registry {
	let mut registry = Registry::new();
	registry.register_serializer(Body::TAG, TypedSerializer::<Body>::boxed()).unwrap();
	registry.register_layout(Body::TAG, Body::layout).unwrap();
	registry.register_serializer(Shape::TAG, TypedSerializer::<Shape>::boxed()).unwrap();
	registry.register_layout(Shape::TAG, Shape::layout).unwrap();
	registry.register_serializer(Mesh::TAG, TypedSerializer::<Mesh>::boxed()).unwrap();
	registry.register_layout(Mesh::TAG, Mesh::layout).unwrap();
	registry.register_serializer(Joint::TAG, TypedSerializer::<Joint>::boxed()).unwrap();
	registry
}

fn body_subordinates(body: &Body) -> Vec<&dyn Serializable> {
	body.shape.get_dyn().into_iter().collect()
}

pub fn body_properties() -> PropertyTable<Body> {
	PropertyTable::new()
		.basic("mass", |b: &Body| b.mass, |b, v| b.mass = v)
		.basic("index", |b: &Body| b.index, |b, v| b.index = v)
		.basic("enabled", |b: &Body| b.enabled != 0, |b, v: bool| b.enabled = v as u32)
		.reference("parent", |b: &Body| &b.parent, |b: &mut Body| &mut b.parent)
		.reference("shape", |b: &Body| &b.shape, |b: &mut Body| &mut b.shape)
}

fn shape_properties() -> PropertyTable<Shape> {
	PropertyTable::new()
		.basic("radius", |s: &Shape| s.radius, |s, v| s.radius = v)
		.basic("sides", |s: &Shape| s.sides, |s, v| s.sides = v)
}

fn mesh_properties() -> PropertyTable<Mesh> {
	PropertyTable::new()
		.dual_indexed(
			"vertices",
			|m: &Mesh| {
				m.vertices()
					.iter()
					.enumerate()
					.flat_map(|(i, v)| (0..3).map(move |axis| (i as u32, axis as u32, v[axis])))
					.collect()
			},
			|m: &mut Mesh, i, axis, value: f32| {
				// Vertices are replaced wholesale; grow to fit
				let mut vertices = m.vertices().to_vec();
				let (i, axis) = (i as usize, axis as usize);
				if axis > 2 {
					return Err(format!("axis {axis} out of range"));
				}
				if vertices.len() <= i {
					vertices.resize(i + 1, [0.0; 3]);
				}
				vertices[i][axis] = value;
				let material = m.material().unwrap_or(0);
				*m = Mesh::new(vertices, material);
				Ok(())
			},
		)
		.basic(
			"material",
			|m: &Mesh| m.material().unwrap_or(0),
			|m, v: u32| {
				let vertices = m.vertices().to_vec();
				*m = Mesh::new(vertices, v);
			},
		)
}

fn label_properties() -> PropertyTable<Label> {
	PropertyTable::new()
		.basic("text", |l: &Label| l.text.clone(), |l, v| l.text = v)
		.collection("aliases", |l: &Label| l.aliases.clone(), |l, v| l.aliases = v)
		.indexed(
			"weights",
			|l: &Label| l.weights.iter().enumerate().map(|(i, w)| (i as u32, *w)).collect(),
			|l: &mut Label, i, w: i32| {
				let i = i as usize;
				if i > 1000 {
					return Err(format!("index {i} out of range"));
				}
				if l.weights.len() <= i {
					l.weights.resize(i + 1, 0);
				}
				l.weights[i] = w;
				Ok(())
			},
		)
}

/// Registry with declarative serializers for all fixture types.
pub fn declarative_registry() -> Registry {
	let mut registry = Registry::new();
	registry
		.register_declarative(
			Body::TAG,
			TypedDeclarative::new("Body", body_properties())
				.with_factory(|| Body::new(0.0, 0))
				.with_subordinates(body_subordinates)
				.boxed(),
		)
		.unwrap();
	registry
		.register_declarative(
			Shape::TAG,
			TypedDeclarative::new("Shape", shape_properties())
				.with_factory(|| Shape::new(0.0, 0))
				.subordinate()
				.boxed(),
		)
		.unwrap();
	registry
		.register_declarative(
			Mesh::TAG,
			TypedDeclarative::new("Mesh", mesh_properties())
				.with_factory(|| Mesh::new(Vec::new(), 0))
				.boxed(),
		)
		.unwrap();
	registry
		.register_declarative(
			Label::TAG,
			TypedDeclarative::new("Label", label_properties())
				.with_constructor(|node| {
					let text = match node.property("text").map(|p| &p.data) {
						Some(PropertyData::Value(RawValue::Text(text))) => text.as_str(),
						_ => "",
					};
					Ok(Label::new(text))
				})
				.boxed(),
		)
		.unwrap();
	registry
}

/// Unregister everything registered by `binary_registry` and
/// `declarative_registry`.
pub fn teardown(mut registry: Registry) {
	for tag in [Body::TAG, Shape::TAG, Mesh::TAG, Joint::TAG, Label::TAG] {
		let _ = registry.unregister_serializer(tag);
		let _ = registry.unregister_layout(tag);
		let _ = registry.unregister_declarative(tag);
	}
}
