//! Property descriptor tables.
//!
//! A [`PropertyTable`] lists the named properties of a type, each with a
//! shape, a value kind, read/write capability, and accessors. Tables are
//! built with a typed builder:
//!
//! ```ignore
//! let table = PropertyTable::<Body>::new()
//! 	.basic("mass", |b| b.mass, |b, v| b.mass = v)
//! 	.ranged("limits", |b| (b.lower, b.upper), |b, lo, hi| (b.lower, b.upper) = (lo, hi))
//! 	.reference("parent", |b| &b.parent, |b| &mut b.parent)
//! 	.access(Access::ReadOnly);
//! ```

use std::any::TypeId;

use super::value::{PropertyType, PropertyValue, ValueKind};
use crate::{ObjPtr, Serializable};

/// Shape of a property.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PropertyShape {
	/// Single value
	Basic,
	/// Pair of values: minimum and maximum
	Ranged,
	/// Values keyed by one index
	Indexed,
	/// Values keyed by two indexes
	DualIndexed,
	/// Variable-length list of values
	Collection,
}

/// Read/write capability of a property.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Access {
	ReadOnly,
	WriteOnly,
	#[default]
	ReadWrite,
}

impl Access {
	/// Whether property can be read from an object (and so written to output).
	#[inline]
	pub fn can_read(self) -> bool {
		self != Self::WriteOnly
	}

	/// Whether property can be set on an object (and so loaded from input).
	#[inline]
	pub fn can_write(self) -> bool {
		self != Self::ReadOnly
	}
}

type Getter<T, V> = Box<dyn Fn(&T) -> V + Send + Sync>;
type Setter<T, V> = Box<dyn Fn(&mut T, V) -> Result<(), String> + Send + Sync>;

/// Type-erased accessors of a property.
pub(crate) enum Accessor<T> {
	Basic {
		get: Getter<T, PropertyValue>,
		set: Setter<T, PropertyValue>,
	},
	Ranged {
		get: Getter<T, (PropertyValue, PropertyValue)>,
		set: Setter<T, (PropertyValue, PropertyValue)>,
	},
	/// Setter takes every entry, and leaves object unchanged if any fails.
	Indexed {
		get: Getter<T, Vec<(u32, PropertyValue)>>,
		set: Setter<T, Vec<(u32, PropertyValue)>>,
	},
	DualIndexed {
		get: Getter<T, Vec<(u32, u32, PropertyValue)>>,
		set: Setter<T, Vec<(u32, u32, PropertyValue)>>,
	},
	Collection {
		get: Getter<T, Vec<PropertyValue>>,
		set: Setter<T, Vec<PropertyValue>>,
	},
	/// Object pointer. Getter returns address of target (0 for null), setter
	/// takes address of a target of type `target`.
	Reference {
		target: TypeId,
		get: Getter<T, usize>,
		set: Box<dyn Fn(&mut T, usize) + Send + Sync>,
	},
}

/// Descriptor of one property of a `T`.
pub struct Property<T> {
	name: String,
	kind: ValueKind,
	access: Access,
	pub(crate) accessor: Accessor<T>,
}

impl<T> Property<T> {
	#[inline]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[inline]
	pub fn kind(&self) -> ValueKind {
		self.kind
	}

	#[inline]
	pub fn access(&self) -> Access {
		self.access
	}

	pub fn shape(&self) -> PropertyShape {
		match self.accessor {
			Accessor::Basic { .. } | Accessor::Reference { .. } => PropertyShape::Basic,
			Accessor::Ranged { .. } => PropertyShape::Ranged,
			Accessor::Indexed { .. } => PropertyShape::Indexed,
			Accessor::DualIndexed { .. } => PropertyShape::DualIndexed,
			Accessor::Collection { .. } => PropertyShape::Collection,
		}
	}
}

impl<T> std::fmt::Debug for Property<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Property")
			.field("name", &self.name)
			.field("shape", &self.shape())
			.field("kind", &self.kind)
			.field("access", &self.access)
			.finish()
	}
}

fn convert<V: PropertyType>(value: PropertyValue) -> Result<V, String> {
	let kind = value.kind();
	V::from_value(value).ok_or_else(|| format!("{kind} value out of range or of wrong kind, expected {}", V::KIND))
}

/// Ordered table of property descriptors for type `T`.
pub struct PropertyTable<T> {
	properties: Vec<Property<T>>,
}

impl<T: 'static> PropertyTable<T> {
	pub fn new() -> Self {
		Self {
			properties: Vec::new(),
		}
	}

	fn push(mut self, name: &str, kind: ValueKind, accessor: Accessor<T>) -> Self {
		self.properties.push(Property {
			name: name.to_string(),
			kind,
			access: Access::ReadWrite,
			accessor,
		});
		self
	}

	/// Add a single-valued property.
	pub fn basic<V, G, S>(self, name: &str, get: G, set: S) -> Self
	where
		V: PropertyType + 'static,
		G: Fn(&T) -> V + Send + Sync + 'static,
		S: Fn(&mut T, V) + Send + Sync + 'static,
	{
		self.push(name, V::KIND, Accessor::Basic {
			get: Box::new(move |obj: &T| get(obj).to_value()),
			set: Box::new(move |obj: &mut T, value: PropertyValue| {
				set(obj, convert(value)?);
				Ok(())
			}),
		})
	}

	/// Add a property holding a minimum and maximum.
	pub fn ranged<V, G, S>(self, name: &str, get: G, set: S) -> Self
	where
		V: PropertyType + 'static,
		G: Fn(&T) -> (V, V) + Send + Sync + 'static,
		S: Fn(&mut T, V, V) + Send + Sync + 'static,
	{
		self.push(name, V::KIND, Accessor::Ranged {
			get: Box::new(move |obj: &T| {
				let (min, max) = get(obj);
				(min.to_value(), max.to_value())
			}),
			set: Box::new(move |obj: &mut T, (min, max): (PropertyValue, PropertyValue)| {
				set(obj, convert(min)?, convert(max)?);
				Ok(())
			}),
		})
	}

	/// Add a property holding values keyed by one index.
	///
	/// Getter returns all entries. Setter is called once per entry, on a copy
	/// of the object which replaces it only once every entry is set.
	pub fn indexed<V, G, S>(self, name: &str, get: G, set: S) -> Self
	where
		T: Clone,
		V: PropertyType + 'static,
		G: Fn(&T) -> Vec<(u32, V)> + Send + Sync + 'static,
		S: Fn(&mut T, u32, V) -> Result<(), String> + Send + Sync + 'static,
	{
		self.push(name, V::KIND, Accessor::Indexed {
			get: Box::new(move |obj: &T| {
				get(obj)
					.into_iter()
					.map(|(index, value)| (index, value.to_value()))
					.collect()
			}),
			set: Box::new(move |obj: &mut T, entries: Vec<(u32, PropertyValue)>| {
				let mut scratch = obj.clone();
				for (index, value) in entries {
					set(&mut scratch, index, convert(value)?)?;
				}
				*obj = scratch;
				Ok(())
			}),
		})
	}

	/// Add a property holding values keyed by two indexes. Set like
	/// [`indexed`](Self::indexed).
	pub fn dual_indexed<V, G, S>(self, name: &str, get: G, set: S) -> Self
	where
		T: Clone,
		V: PropertyType + 'static,
		G: Fn(&T) -> Vec<(u32, u32, V)> + Send + Sync + 'static,
		S: Fn(&mut T, u32, u32, V) -> Result<(), String> + Send + Sync + 'static,
	{
		self.push(name, V::KIND, Accessor::DualIndexed {
			get: Box::new(move |obj: &T| {
				get(obj)
					.into_iter()
					.map(|(first, second, value)| (first, second, value.to_value()))
					.collect()
			}),
			set: Box::new(move |obj: &mut T, entries: Vec<(u32, u32, PropertyValue)>| {
				let mut scratch = obj.clone();
				for (first, second, value) in entries {
					set(&mut scratch, first, second, convert(value)?)?;
				}
				*obj = scratch;
				Ok(())
			}),
		})
	}

	/// Add a property holding a list of values.
	///
	/// Setter is called once with the whole list.
	pub fn collection<V, G, S>(self, name: &str, get: G, set: S) -> Self
	where
		V: PropertyType + 'static,
		G: Fn(&T) -> Vec<V> + Send + Sync + 'static,
		S: Fn(&mut T, Vec<V>) + Send + Sync + 'static,
	{
		self.push(name, V::KIND, Accessor::Collection {
			get: Box::new(move |obj: &T| get(obj).iter().map(PropertyType::to_value).collect()),
			set: Box::new(move |obj: &mut T, values: Vec<PropertyValue>| {
				let values = values.into_iter().map(convert).collect::<Result<Vec<V>, String>>()?;
				set(obj, values);
				Ok(())
			}),
		})
	}

	/// Add a property linking to another object through an [`ObjPtr`] field.
	///
	/// On load, link is set once every object exists. A target which is not of
	/// type `U` leaves the field unchanged, with a diagnostic.
	pub fn reference<U, G, S>(self, name: &str, get: G, set: S) -> Self
	where
		U: Serializable,
		G: Fn(&T) -> &ObjPtr<U> + Send + Sync + 'static,
		S: Fn(&mut T) -> &mut ObjPtr<U> + Send + Sync + 'static,
	{
		self.push(name, ValueKind::Ref, Accessor::Reference {
			target: TypeId::of::<U>(),
			get: Box::new(move |obj: &T| get(obj).addr()),
			set: Box::new(move |obj: &mut T, addr: usize| *set(obj) = ObjPtr::from_addr(addr)),
		})
	}

	/// Set capability of the most recently added property.
	pub fn access(mut self, access: Access) -> Self {
		if let Some(property) = self.properties.last_mut() {
			property.access = access;
		}
		self
	}

	/// Merge a generated table with hand-written custom properties.
	///
	/// Custom properties replace generated properties of the same name, in the
	/// generated property's position. Other custom properties follow the
	/// generated ones.
	pub fn merged(generated: PropertyTable<T>, custom: PropertyTable<T>) -> Self {
		let mut properties = generated.properties;
		for property in custom.properties {
			match properties.iter().position(|p| p.name == property.name) {
				Some(index) => properties[index] = property,
				None => properties.push(property),
			}
		}
		Self { properties }
	}
}

impl<T> PropertyTable<T> {
	pub fn get(&self, name: &str) -> Option<&Property<T>> {
		self.properties.iter().find(|p| p.name == name)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Property<T>> {
		self.properties.iter()
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.properties.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.properties.is_empty()
	}
}

impl<T: 'static> Default for PropertyTable<T> {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Default)]
	struct Spring {
		stiffness: f32,
		rest: (f32, f32),
		coils: Vec<u32>,
	}

	fn generated() -> PropertyTable<Spring> {
		PropertyTable::new()
			.basic("stiffness", |s: &Spring| s.stiffness, |s, v| s.stiffness = v)
			.ranged("rest", |s: &Spring| s.rest, |s, lo, hi| s.rest = (lo, hi))
			.collection("coils", |s: &Spring| s.coils.clone(), |s, v| s.coils = v)
	}

	#[test]
	fn shapes_and_kinds() {
		let table = generated();
		assert_eq!(table.len(), 3);
		let rest = table.get("rest").unwrap();
		assert_eq!(rest.shape(), PropertyShape::Ranged);
		assert_eq!(rest.kind(), ValueKind::Float);
		assert_eq!(table.get("coils").unwrap().shape(), PropertyShape::Collection);
		assert_eq!(table.get("coils").unwrap().kind(), ValueKind::Int);
	}

	#[test]
	fn access_applies_to_last_property() {
		let table = generated().basic("label", |_: &Spring| 1i32, |_, _| {}).access(Access::ReadOnly);
		assert_eq!(table.get("label").unwrap().access(), Access::ReadOnly);
		assert_eq!(table.get("stiffness").unwrap().access(), Access::ReadWrite);
		assert!(!Access::ReadOnly.can_write());
		assert!(!Access::WriteOnly.can_read());
	}

	#[test]
	fn custom_takes_precedence() {
		let custom = PropertyTable::new()
			.basic("stiffness", |_: &Spring| 99.0f64, |_, _| {})
			.basic("extra", |_: &Spring| true, |_, _| {});
		let merged = PropertyTable::merged(generated(), custom);
		let names: Vec<_> = merged.iter().map(Property::name).collect();
		assert_eq!(names, vec!["stiffness", "rest", "coils", "extra"]);

		let Accessor::Basic { get, .. } = &merged.get("stiffness").unwrap().accessor else {
			panic!("expected basic property");
		};
		assert_eq!(get(&Spring::default()), PropertyValue::Float(99.0));
	}

	#[test]
	fn setter_rejects_wrong_kind() {
		let table = generated();
		let Accessor::Basic { set, .. } = &table.get("stiffness").unwrap().accessor else {
			panic!("expected basic property");
		};
		let mut spring = Spring::default();
		assert!(set(&mut spring, PropertyValue::Text("x".into())).is_err());
		set(&mut spring, PropertyValue::Float(2.0)).unwrap();
		assert_eq!(spring.stiffness, 2.0);
	}
}
