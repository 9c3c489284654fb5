use ser_graph::{
	declarative::{self, Access, DeclarativeSerializer, PropertyTable, TypedDeclarative},
	Collection, DiagnosticKind, Error, GraphObject, Registry, Serializable,
};

mod common;
use common::{body_properties, declarative_registry, teardown, Body, Joint, Label, Mesh, Shape};

fn body(object: &dyn Serializable) -> &Body {
	object.downcast_ref::<Body>().unwrap()
}

fn document(objects: &str) -> String {
	format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<SerGraph version=\"1\">\n{objects}\n</SerGraph>\n")
}

#[test]
fn round_trip_with_subordinate_and_references() {
	let registry = declarative_registry();
	let shape = Shape::new(0.25, 5);
	let a = Body::new(1.5, 1).with_shape(&shape);
	let b = Body::new(2.0, 2).with_parent(&a);

	let mut collection = Collection::new();
	collection.add(&a);
	collection.add(&b);
	let xml = declarative::serialize(&registry, &collection).unwrap();
	assert!(xml.contains("<SerGraph version=\"1\">"));
	assert!(xml.contains("<Body id=\"1\">"));
	assert!(xml.contains("<Shape id=\"3\">"));
	assert!(xml.contains("<mass value=\"1.5\"/>"));
	assert!(xml.contains("<shape ref=\"3\"/>"));
	assert!(xml.contains("<parent ref=\"1\"/>"));
	// Subordinate is nested inside its owner
	assert!(xml.find("<Shape id=\"3\">").unwrap() < xml.find("<Body id=\"2\">").unwrap());

	let loaded = declarative::deserialize(&registry, &xml).unwrap();
	assert!(loaded.diagnostics().is_empty());
	assert_eq!(loaded.len(), 3);

	let loaded_a = body(loaded.get(1).unwrap());
	assert_eq!(loaded_a.mass, 1.5);
	assert_eq!(loaded_a.enabled, 1);
	assert!(loaded_a.parent.is_null());
	let loaded_shape = loaded_a.shape.get().unwrap();
	assert_eq!(loaded_shape.radius, 0.25);
	assert_eq!(loaded_shape.sides, 5);
	assert_eq!(loaded.get(3).unwrap().addr(), loaded_shape as *const Shape as usize);

	let loaded_b = body(loaded.get(2).unwrap());
	assert_eq!(loaded_b.index, 2);
	assert_eq!(loaded_b.parent.get().unwrap() as *const Body, loaded_a as *const Body);
	assert!(loaded_b.shape.is_null());

	// Loaded objects own their memory
	assert!(loaded.iter().all(|(_, object)| object.header().owns_memory()));

	// Writing loaded objects gives the same document
	let rewritten = declarative::serialize(&registry, &loaded.collection()).unwrap();
	assert_eq!(rewritten, xml);

	drop(loaded);
	teardown(registry);
}

#[test]
fn indexed_and_collection_properties() {
	let registry = declarative_registry();
	let mesh = Mesh::new(vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.5]], 9);
	let mut label = Label::new("x < y & \"z\"");
	label.aliases = vec!["first".into(), "second".into()];
	label.weights = vec![3, -1, 0];

	let mut collection = Collection::new();
	let mesh_id = collection.add(&mesh);
	let label_id = collection.add(&label);
	let xml = declarative::serialize(&registry, &collection).unwrap();
	assert!(xml.contains("<Entry first=\"1\" second=\"2\" value=\"6.5\"/>"));
	assert!(xml.contains("<aliases count=\"2\">"));
	assert!(xml.contains("<Entry index=\"1\" value=\"-1\"/>"));

	let loaded = declarative::deserialize(&registry, &xml).unwrap();
	assert!(loaded.diagnostics().is_empty());

	let loaded_mesh = loaded.get(mesh_id).unwrap().downcast_ref::<Mesh>().unwrap();
	assert_eq!(loaded_mesh.vertices(), mesh.vertices());
	assert_eq!(loaded_mesh.material(), Some(9));

	let loaded_label = loaded.get(label_id).unwrap().downcast_ref::<Label>().unwrap();
	assert_eq!(loaded_label.text, "x < y & \"z\"");
	assert_eq!(loaded_label.aliases, vec!["first", "second"]);
	assert_eq!(loaded_label.weights, vec![3, -1, 0]);
	teardown(registry);
}

#[test]
fn empty_collection_property() {
	let registry = declarative_registry();
	let label = Label::new("empty");
	let mut collection = Collection::new();
	collection.add(&label);
	let xml = declarative::serialize(&registry, &collection).unwrap();
	assert!(xml.contains("<aliases count=\"0\"/>"));

	let loaded = declarative::deserialize(&registry, &xml).unwrap();
	assert!(loaded.diagnostics().is_empty());
	let loaded_label = loaded.get(1).unwrap().downcast_ref::<Label>().unwrap();
	assert!(loaded_label.aliases.is_empty());
	assert!(loaded_label.weights.is_empty());
	teardown(registry);
}

#[test]
fn malformed_properties_keep_their_value() {
	let registry = declarative_registry();
	let xml = document(
		r#"<Body id="1">
			<mass min="1.0" max="2.0"/>
			<index value="7"/>
			<enabled value="maybe"/>
			<colour value="red"/>
		</Body>"#,
	);

	let loaded = declarative::deserialize(&registry, &xml).unwrap();
	let diagnostics = loaded.diagnostics();
	assert_eq!(diagnostics.len(), 3);
	assert_eq!(diagnostics.count(DiagnosticKind::MalformedProperty), 3);
	assert!(!diagnostics.has_errors());
	for field in ["mass", "enabled", "colour"] {
		let diagnostic = diagnostics.iter().find(|d| d.field.as_deref() == Some(field)).unwrap();
		assert_eq!(diagnostic.id, Some(1));
		assert_eq!(diagnostic.tag, Body::TAG);
	}
	let summaries = diagnostics.by_object();
	assert_eq!(summaries.len(), 1);
	assert_eq!(summaries[0].id, 1);
	assert_eq!(summaries[0].tag, Body::TAG);
	assert_eq!(summaries[0].count, 3);
	assert_eq!(summaries[0].fields, vec!["mass", "enabled", "colour"]);
	assert!(!summaries[0].skipped);
	assert_eq!(diagnostics.for_object(1).count(), 3);
	assert_eq!(diagnostics.for_object(2).count(), 0);
	let mass = diagnostics.iter().find(|d| d.field.as_deref() == Some("mass")).unwrap();
	assert!(mass.message.contains("expected Basic property, found a range"));

	let loaded_body = body(loaded.get(1).unwrap());
	assert_eq!(loaded_body.mass, 0.0);
	assert_eq!(loaded_body.index, 7);
	assert_eq!(loaded_body.enabled, 1);
	teardown(registry);
}

#[test]
fn out_of_range_values_are_malformed() {
	let registry = declarative_registry();
	let xml = document(
		r#"<Body id="1">
			<index value="-3"/>
			<mass value="4.0"/>
		</Body>
		<Label id="2">
			<text value="t"/>
			<aliases count="3"><Item value="a"/></aliases>
			<weights><Entry index="2000" value="1"/></weights>
		</Label>"#,
	);

	let loaded = declarative::deserialize(&registry, &xml).unwrap();
	let fields: Vec<_> = loaded.diagnostics().iter().filter_map(|d| d.field.as_deref()).collect();
	assert_eq!(fields, vec!["index", "aliases", "weights"]);

	assert_eq!(body(loaded.get(1).unwrap()).mass, 4.0);
	let label = loaded.get(2).unwrap().downcast_ref::<Label>().unwrap();
	assert_eq!(label.text, "t");
	assert!(label.aliases.is_empty());
	assert!(label.weights.is_empty());
	teardown(registry);
}

#[test]
fn failed_entry_leaves_indexed_property_unchanged() {
	let registry = declarative_registry();
	let xml = document(
		r#"<Label id="1">
			<text value="t"/>
			<weights><Entry index="0" value="5"/><Entry index="2000" value="1"/></weights>
		</Label>
		<Mesh id="2">
			<vertices><Entry first="0" second="0" value="1.5"/><Entry first="0" second="5" value="2"/></vertices>
			<material value="3"/>
		</Mesh>
		<Label id="3">
			<weights><Entry index="1" value="5"/><Entry index="0" value="-2"/></weights>
		</Label>"#,
	);

	let loaded = declarative::deserialize(&registry, &xml).unwrap();
	let fields: Vec<_> = loaded.diagnostics().iter().filter_map(|d| d.field.as_deref()).collect();
	assert_eq!(fields, vec!["weights", "vertices"]);

	let label = loaded.get(1).unwrap().downcast_ref::<Label>().unwrap();
	assert!(label.weights.is_empty());
	let mesh = loaded.get(2).unwrap().downcast_ref::<Mesh>().unwrap();
	assert!(mesh.vertices().is_empty());
	assert_eq!(mesh.material(), Some(3));

	// All entries applied when every one is valid
	let label = loaded.get(3).unwrap().downcast_ref::<Label>().unwrap();
	assert_eq!(label.weights, vec![-2, 5]);
	teardown(registry);
}

#[test]
fn bad_references() {
	let registry = declarative_registry();
	let xml = document(
		r#"<Body id="1">
			<Shape id="2"><sides value="4"/></Shape>
		</Body>
		<Body id="3">
			<parent ref="2"/>
			<shape ref="99"/>
		</Body>
		<Body id="4">
			<parent ref="3"/>
		</Body>"#,
	);

	let loaded = declarative::deserialize(&registry, &xml).unwrap();
	assert_eq!(loaded.len(), 4);
	assert_eq!(loaded.diagnostics().count(DiagnosticKind::MalformedProperty), 2);
	assert!(loaded.diagnostics().iter().all(|d| d.id == Some(3)));

	let third = body(loaded.get(3).unwrap());
	assert!(third.parent.is_null());
	assert!(third.shape.is_null());
	let fourth = body(loaded.get(4).unwrap());
	assert_eq!(fourth.parent.get().unwrap() as *const Body, third as *const Body);
	teardown(registry);
}

#[test]
fn subordinate_outside_owner() {
	let registry = declarative_registry();
	let xml = document(
		r#"<Shape id="1"><radius value="1.0"/></Shape>
		<Body id="2"><mass value="3.0"/></Body>"#,
	);

	let loaded = declarative::deserialize(&registry, &xml).unwrap();
	assert_eq!(loaded.len(), 1);
	assert!(loaded.get(1).is_none());
	let diagnostics: Vec<_> = loaded.diagnostics().of_kind(DiagnosticKind::SubordinateWithoutOwner).collect();
	assert_eq!(diagnostics.len(), 1);
	assert_eq!(diagnostics[0].id, Some(1));
	assert_eq!(diagnostics[0].tag, Shape::TAG);
	assert!(loaded.diagnostics().has_errors());
	assert_eq!(body(loaded.get(2).unwrap()).mass, 3.0);
	teardown(registry);
}

#[test]
fn invalid_documents() {
	let registry = declarative_registry();

	let wrong_version = "<SerGraph version=\"2\"><Body id=\"1\"/></SerGraph>";
	assert!(matches!(
		declarative::deserialize(&registry, wrong_version),
		Err(Error::FormatMismatch(_))
	));

	let unknown_type = document("<Widget id=\"1\"/>");
	assert!(matches!(
		declarative::deserialize(&registry, &unknown_type),
		Err(Error::FormatMismatch(_))
	));

	let duplicate_id = document("<Body id=\"1\"/><Body id=\"1\"/>");
	assert!(matches!(
		declarative::deserialize(&registry, &duplicate_id),
		Err(Error::FormatMismatch(_))
	));

	let wrong_root = "<Graph version=\"1\"/>";
	assert!(matches!(declarative::deserialize(&registry, wrong_root), Err(Error::Xml(_))));

	let unclosed = "<SerGraph version=\"1\"><Body id=\"1\">";
	assert!(matches!(declarative::deserialize(&registry, unclosed), Err(Error::Xml(_))));

	let object_without_id = document("<Body/>");
	assert!(matches!(
		declarative::deserialize(&registry, &object_without_id),
		Err(Error::Xml(_))
	));

	let empty = declarative::deserialize(&registry, &document("")).unwrap();
	assert!(empty.is_empty());
	teardown(registry);
}

#[test]
fn write_errors() {
	let registry = declarative_registry();
	let a = Body::new(1.0, 1);
	let b = Body::new(2.0, 2).with_parent(&a);

	// Reference to an object not in the document
	let mut collection = Collection::new();
	collection.add(&b);
	assert!(matches!(
		declarative::serialize(&registry, &collection),
		Err(Error::UnresolvedReference { source_id: 1, .. })
	));

	let joint = Joint::new(&a, &b, 1.0);
	let mut collection = Collection::new();
	collection.add(&joint);
	assert!(matches!(
		declarative::serialize(&registry, &collection),
		Err(Error::UnregisteredType(tag)) if tag == Joint::TAG
	));
	teardown(registry);
}

#[test]
fn read_only_and_custom_properties() {
	let mut registry = Registry::new();
	let custom = PropertyTable::new()
		.basic("mass", |b: &Body| b.mass * 10.0, |b, v: f64| b.mass = v / 10.0)
		.basic("density", |b: &Body| b.mass * 2.0, |_, _: f64| {})
		.access(Access::ReadOnly);
	let properties = PropertyTable::merged(body_properties(), custom);
	registry
		.register_declarative(
			Body::TAG,
			TypedDeclarative::new("Body", properties)
				.with_factory(|| Body::new(0.0, 0))
				.boxed(),
		)
		.unwrap();

	let original = Body::new(1.5, 4);
	let mut collection = Collection::new();
	collection.add(&original);
	let xml = declarative::serialize(&registry, &collection).unwrap();
	assert!(xml.contains("<mass value=\"15.0\"/>"));
	assert!(xml.contains("<density value=\"3.0\"/>"));
	// Custom property takes the generated one's place
	assert!(xml.find("<mass").unwrap() < xml.find("<index").unwrap());

	// Read-only property is skipped on load, without complaint
	let loaded = declarative::deserialize(&registry, &xml).unwrap();
	assert!(loaded.diagnostics().is_empty());
	let loaded_body = body(loaded.get(1).unwrap());
	assert_eq!(loaded_body.mass, 1.5);
	assert_eq!(loaded_body.index, 4);

	// Type names must be unique
	let duplicate_name = TypedDeclarative::new("Body", PropertyTable::<Shape>::new())
		.with_factory(|| Shape::new(0.0, 0))
		.boxed();
	assert!(matches!(
		registry.register_declarative(Shape::TAG, duplicate_name),
		Err(Error::InvalidArgument(_))
	));
	assert!(registry.declarative(Shape::TAG).is_none());

	let (tag, serializer) = registry.declarative_by_name("Body").unwrap();
	assert_eq!(tag, Body::TAG);
	assert_eq!(serializer.type_name(), "Body");
	teardown(registry);
}

#[test]
fn io_round_trip() {
	let registry = declarative_registry();
	let label = Label::new("io");
	let mut collection = Collection::new();
	collection.add(&label);

	let mut out = Vec::new();
	declarative::serialize_to(&registry, &collection, &mut out).unwrap();
	let loaded = declarative::deserialize_from(&registry, &mut out.as_slice()).unwrap();
	let objects = loaded.into_objects();
	assert_eq!(objects.len(), 1);
	assert_eq!(objects[0].0, 1);
	assert_eq!(objects[0].1.downcast_ref::<Label>().unwrap().text, "io");
	teardown(registry);
}
