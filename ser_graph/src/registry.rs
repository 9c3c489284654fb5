use std::collections::HashMap;

use crate::{
	declarative::DeclarativeSerializer,
	layout::{LayoutCallback, LayoutTable, NATIVE_PTR_WIDTH},
	Error, ObjectSerializer, Result, TypeTag,
};

/// Maps type tags to per-type serializers, layout tables and declarative
/// serializers.
///
/// Registry is read-only during a serialize or deserialize pass, so can be
/// shared between threads running independent passes. Registering and
/// unregistering takes `&mut self`, so can't overlap with a pass.
///
/// Bindings should be unregistered by whoever installed them. Dropping a
/// registry with bindings still in place logs a warning.
#[derive(Default)]
pub struct Registry {
	serializers: HashMap<TypeTag, Box<dyn ObjectSerializer>>,
	layouts: HashMap<TypeTag, LayoutTable>,
	declarative: HashMap<TypeTag, Box<dyn DeclarativeSerializer>>,
	/// Declarative type name -> tag
	declarative_names: HashMap<String, TypeTag>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register serializer for type `tag`.
	///
	/// Fails with [`Error::DuplicateTypeTag`] if a serializer is already
	/// registered for `tag`, leaving the existing registration in place.
	/// Fails with [`Error::InvalidArgument`] if the serializer is tied to a
	/// different tag.
	pub fn register_serializer(&mut self, tag: TypeTag, serializer: Box<dyn ObjectSerializer>) -> Result<()> {
		check_tag(tag)?;
		if let Some(own_tag) = serializer.type_tag().filter(|&own_tag| own_tag != tag) {
			return Err(Error::InvalidArgument(format!(
				"serializer for `{}` ({own_tag}) registered as {tag}",
				serializer.type_name()
			)));
		}
		if self.serializers.contains_key(&tag) {
			return Err(Error::DuplicateTypeTag(tag));
		}
		tracing::debug!(tag = tag.get(), name = serializer.type_name(), "registered serializer");
		self.serializers.insert(tag, serializer);
		Ok(())
	}

	/// Unregister serializer for type `tag`, handing it back to the caller.
	pub fn unregister_serializer(&mut self, tag: TypeTag) -> Result<Box<dyn ObjectSerializer>> {
		self.serializers.remove(&tag).ok_or(Error::UnknownTypeTag(tag))
	}

	/// Register layout table for type `tag`.
	///
	/// `callback` is called once, and the table it returns is validated and
	/// cached. Table is immutable after registration.
	pub fn register_layout(&mut self, tag: TypeTag, callback: LayoutCallback) -> Result<()> {
		check_tag(tag)?;
		if self.layouts.contains_key(&tag) {
			return Err(Error::DuplicateTypeTag(tag));
		}
		let layout = callback();
		layout
			.validate(NATIVE_PTR_WIDTH)
			.map_err(|msg| Error::InvalidArgument(format!("layout of {tag}: {msg}")))?;
		if let Some(serializer) = self.serializers.get(&tag) {
			if serializer.fixed_size() != layout.size {
				return Err(Error::InvalidArgument(format!(
					"layout of {tag} is {} bytes, serializer `{}` says {}",
					layout.size,
					serializer.type_name(),
					serializer.fixed_size()
				)));
			}
		}
		self.layouts.insert(tag, layout);
		Ok(())
	}

	pub fn unregister_layout(&mut self, tag: TypeTag) -> Result<LayoutTable> {
		self.layouts.remove(&tag).ok_or(Error::UnknownTypeTag(tag))
	}

	/// Register declarative serializer for type `tag`.
	///
	/// The serializer's type name must also be unique, as it names the type's
	/// elements in declarative output.
	pub fn register_declarative(&mut self, tag: TypeTag, serializer: Box<dyn DeclarativeSerializer>) -> Result<()> {
		check_tag(tag)?;
		if self.declarative.contains_key(&tag) {
			return Err(Error::DuplicateTypeTag(tag));
		}
		let name = serializer.type_name().to_string();
		if let Some(&other) = self.declarative_names.get(&name) {
			return Err(Error::InvalidArgument(format!(
				"declarative type name `{name}` already used by {other}"
			)));
		}
		self.declarative_names.insert(name, tag);
		self.declarative.insert(tag, serializer);
		Ok(())
	}

	pub fn unregister_declarative(&mut self, tag: TypeTag) -> Result<Box<dyn DeclarativeSerializer>> {
		let serializer = self.declarative.remove(&tag).ok_or(Error::UnknownTypeTag(tag))?;
		self.declarative_names.remove(serializer.type_name());
		Ok(serializer)
	}

	#[inline]
	pub fn serializer(&self, tag: TypeTag) -> Option<&dyn ObjectSerializer> {
		self.serializers.get(&tag).map(|s| s.as_ref())
	}

	#[inline]
	pub fn layout(&self, tag: TypeTag) -> Option<&LayoutTable> {
		self.layouts.get(&tag)
	}

	#[inline]
	pub fn declarative(&self, tag: TypeTag) -> Option<&dyn DeclarativeSerializer> {
		self.declarative.get(&tag).map(|s| s.as_ref())
	}

	/// Find declarative serializer by type name.
	pub fn declarative_by_name(&self, name: &str) -> Option<(TypeTag, &dyn DeclarativeSerializer)> {
		let tag = *self.declarative_names.get(name)?;
		self.declarative(tag).map(|s| (tag, s))
	}

	/// Whether any binding exists for `tag`.
	pub fn is_registered(&self, tag: TypeTag) -> bool {
		self.serializers.contains_key(&tag)
			|| self.layouts.contains_key(&tag)
			|| self.declarative.contains_key(&tag)
	}

	pub(crate) fn layouts(&self) -> impl Iterator<Item = (TypeTag, &LayoutTable)> {
		self.layouts.iter().map(|(&tag, layout)| (tag, layout))
	}

	fn binding_count(&self) -> usize {
		self.serializers.len() + self.layouts.len() + self.declarative.len()
	}
}

impl Drop for Registry {
	fn drop(&mut self) {
		let remaining = self.binding_count();
		if remaining > 0 {
			tracing::warn!(remaining, "registry dropped with bindings still registered");
		}
	}
}

fn check_tag(tag: TypeTag) -> Result<()> {
	if tag.is_none() {
		return Err(Error::InvalidArgument("type tag 0 is reserved".into()));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::{mem, ptr::NonNull};

	use super::*;
	use crate::{
		binary::{ExportContext, ImportContext, ReferenceContext},
		layout::FieldKind,
		Serializable,
	};

	struct Dummy(&'static str, usize);

	impl ObjectSerializer for Dummy {
		fn type_name(&self) -> &str {
			self.0
		}

		fn fixed_size(&self) -> usize {
			self.1
		}

		fn fixed_align(&self) -> usize {
			8
		}

		fn enumerate_dependencies<'a>(&self, _: &'a dyn Serializable) -> Result<Vec<&'a dyn Serializable>> {
			Ok(Vec::new())
		}

		fn register_references(&self, _: &dyn Serializable, _: &mut ReferenceContext<'_>) -> Result<()> {
			Ok(())
		}

		fn export_extra_data(&self, _: &dyn Serializable, _: &mut ExportContext<'_>) -> Result<()> {
			Ok(())
		}

		unsafe fn create_object(
			&self,
			_: NonNull<u8>,
			ctx: &mut ImportContext<'_>,
		) -> Result<NonNull<dyn Serializable>> {
			Err(Error::UnregisteredType(ctx.tag()))
		}

		fn is_subordinate(&self, _: &dyn Serializable) -> Result<bool> {
			Ok(false)
		}
	}

	const TAG: TypeTag = TypeTag::user(1);

	fn layout() -> LayoutTable {
		LayoutTable::new("Dummy", 16, 8)
			.field("a", 8, 8, FieldKind::Plain)
	}

	#[test]
	fn duplicate_tag_keeps_first() {
		let mut registry = Registry::new();
		registry.register_serializer(TAG, Box::new(Dummy("first", 16))).unwrap();
		let err = registry.register_serializer(TAG, Box::new(Dummy("second", 16))).unwrap_err();
		assert!(matches!(err, Error::DuplicateTypeTag(tag) if tag == TAG));
		assert_eq!(registry.serializer(TAG).unwrap().type_name(), "first");

		let first = registry.unregister_serializer(TAG).unwrap();
		assert_eq!(first.type_name(), "first");
		assert!(registry.serializer(TAG).is_none());
		assert!(!registry.is_registered(TAG));
	}

	#[test]
	fn unregister_unknown() {
		let mut registry = Registry::new();
		assert!(matches!(
			registry.unregister_serializer(TAG),
			Err(Error::UnknownTypeTag(_))
		));
		assert!(matches!(registry.unregister_layout(TAG), Err(Error::UnknownTypeTag(_))));
	}

	#[test]
	fn reserved_tag() {
		let mut registry = Registry::new();
		assert!(matches!(
			registry.register_serializer(TypeTag::NONE, Box::new(Dummy("none", 0))),
			Err(Error::InvalidArgument(_))
		));
	}

	#[test]
	fn layout_registration() {
		let mut registry = Registry::new();
		registry.register_layout(TAG, layout).unwrap();
		assert_eq!(registry.layout(TAG), Some(&layout()));
		assert!(matches!(
			registry.register_layout(TAG, layout),
			Err(Error::DuplicateTypeTag(_))
		));
		registry.unregister_layout(TAG).unwrap();
	}

	#[test]
	fn layout_must_match_serializer_size() {
		let mut registry = Registry::new();
		registry.register_serializer(TAG, Box::new(Dummy("dummy", 24))).unwrap();
		assert!(matches!(
			registry.register_layout(TAG, layout),
			Err(Error::InvalidArgument(_))
		));
		registry.unregister_serializer(TAG).unwrap();
	}

	#[test]
	fn invalid_layout_rejected() {
		fn overlapping() -> LayoutTable {
			LayoutTable::new("Bad", 8, 8)
				.field("a", 0, 8, FieldKind::Plain)
				.field("b", 4, 4, FieldKind::Plain)
		}
		let mut registry = Registry::new();
		assert!(registry.register_layout(TAG, overlapping).is_err());
		assert!(registry.layout(TAG).is_none());
		mem::drop(registry);
	}
}
