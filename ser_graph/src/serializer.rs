use std::{marker::PhantomData, mem, ptr::NonNull};

use crate::{
	binary::{ExportContext, ImportContext, ReferenceContext},
	Error, ReferenceKind, Result, Serializable, TypeTag,
};

/// Per-type serializer, registered in a [`Registry`](crate::Registry) against
/// a [`TypeTag`].
///
/// The binary engine dispatches to the implementation registered for each
/// object's tag. Objects themselves carry no serialization behavior.
///
/// Most types don't implement this directly, but implement [`GraphObject`]
/// and register a [`TypedSerializer`].
pub trait ObjectSerializer: Send + Sync {
	/// Name of the type, for diagnostics.
	fn type_name(&self) -> &str;

	/// Tag of the type this serializer handles, if it is tied to one.
	/// Registering it against any other tag fails.
	fn type_tag(&self) -> Option<TypeTag> {
		None
	}

	/// Size of the type's fixed-size state, in the current build.
	fn fixed_size(&self) -> usize;

	/// Alignment of the type, in the current build.
	fn fixed_align(&self) -> usize;

	/// Get every object which `object` needs present before it can be
	/// reconstructed. Must include every object referenced by pointer fields.
	fn enumerate_dependencies<'a>(&self, object: &'a dyn Serializable) -> Result<Vec<&'a dyn Serializable>>;

	/// Register a reference with `ctx` for every dependency of `object`.
	fn register_references(&self, object: &dyn Serializable, ctx: &mut ReferenceContext<'_>) -> Result<()>;

	/// Write variable-length data attached to `object` which is not part of its
	/// fixed-size state.
	fn export_extra_data(&self, object: &dyn Serializable, ctx: &mut ExportContext<'_>) -> Result<()>;

	/// Construct object in place at `address`.
	///
	/// Implementation must copy the fixed-size state to `address`, resolve
	/// pointer fields via `ctx`, and import exactly the extra-data blocks it
	/// exported, in the same order.
	///
	/// # Safety
	///
	/// `address` must be valid for writes of [`fixed_size`] bytes and aligned
	/// to [`fixed_align`].
	///
	/// [`fixed_size`]: ObjectSerializer::fixed_size
	/// [`fixed_align`]: ObjectSerializer::fixed_align
	unsafe fn create_object(
		&self,
		address: NonNull<u8>,
		ctx: &mut ImportContext<'_>,
	) -> Result<NonNull<dyn Serializable>>;

	/// Whether `object` can only be reconstructed as part of a single owner.
	fn is_subordinate(&self, object: &dyn Serializable) -> Result<bool>;

	/// Field name and address of every object pointer in `object`, for types
	/// without a layout table.
	///
	/// Such records are written raw, so this is the only way to check their
	/// pointers. `None` means unknown, and the object can't be written.
	#[allow(unused_variables)]
	fn raw_pointers(&self, object: &dyn Serializable) -> Result<Option<Vec<(&'static str, usize)>>> {
		Ok(None)
	}
}

/// Typed hooks for a serializable type, from which [`TypedSerializer`] builds
/// an [`ObjectSerializer`].
///
/// Implementing types must be `#[repr(C)]` with an
/// [`ObjectHeader`](crate::ObjectHeader) as first field, and every field must
/// be either plain data (valid for any bit pattern written by the same type),
/// an [`ObjPtr`](crate::ObjPtr), or an [`ExtraPtr`](crate::ExtraPtr).
pub trait GraphObject: Serializable + Sized {
	const TAG: TypeTag;
	const NAME: &'static str;

	/// Objects this object depends on.
	fn dependencies(&self) -> Vec<&dyn Serializable> {
		Vec::new()
	}

	/// References from this object. Defaults to an object reference to each
	/// dependency.
	fn references(&self) -> Vec<(ReferenceKind, &dyn Serializable)> {
		self
			.dependencies()
			.into_iter()
			.map(|dep| (ReferenceKind::OBJECT, dep))
			.collect()
	}

	/// Write extra data. Default: none.
	#[allow(unused_variables)]
	fn export_extra(&self, ctx: &mut ExportContext<'_>) -> Result<()> {
		Ok(())
	}

	/// Read back extra data written by `export_extra`, re-pointing extra-data
	/// fields into the load buffer. Default: none.
	#[allow(unused_variables)]
	fn import_extra(&mut self, ctx: &mut ImportContext<'_>) -> Result<()> {
		Ok(())
	}

	/// Re-point object pointer fields at reconstructed objects.
	///
	/// Default uses the layout table registered for the type. Types without a
	/// layout table must override this, calling
	/// [`ImportContext::resolve`] on each `ObjPtr` field.
	fn resolve_pointers(&mut self, ctx: &ImportContext<'_>) -> Result<()> {
		// `self` is a valid `Self`, and layout describes `Self`
		unsafe { ctx.resolve_layout_pointers((self as *mut Self).cast::<u8>()) }
	}

	/// Whether this object is subordinate to an owner.
	fn is_subordinate(&self) -> bool {
		false
	}

	/// Name and address of each object pointer field. Types without a layout
	/// table must override this to be written.
	fn pointer_fields(&self) -> Option<Vec<(&'static str, usize)>> {
		None
	}
}

/// [`ObjectSerializer`] for any [`GraphObject`].
pub struct TypedSerializer<T: GraphObject> {
	_marker: PhantomData<fn() -> T>,
}

impl<T: GraphObject> TypedSerializer<T> {
	pub fn new() -> Self {
		Self {
			_marker: PhantomData,
		}
	}

	/// Create boxed serializer, ready for registering.
	pub fn boxed() -> Box<dyn ObjectSerializer> {
		Box::new(Self::new())
	}

	fn typed<'a>(&self, object: &'a dyn Serializable) -> Result<&'a T> {
		object.downcast_ref::<T>().ok_or_else(|| {
			Error::InvalidArgument(format!(
				"object with tag {} dispatched to serializer for `{}`",
				object.type_tag(),
				T::NAME
			))
		})
	}
}

impl<T: GraphObject> Default for TypedSerializer<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: GraphObject> ObjectSerializer for TypedSerializer<T> {
	fn type_name(&self) -> &str {
		T::NAME
	}

	fn type_tag(&self) -> Option<TypeTag> {
		Some(T::TAG)
	}

	#[inline]
	fn fixed_size(&self) -> usize {
		mem::size_of::<T>()
	}

	#[inline]
	fn fixed_align(&self) -> usize {
		mem::align_of::<T>()
	}

	fn enumerate_dependencies<'a>(&self, object: &'a dyn Serializable) -> Result<Vec<&'a dyn Serializable>> {
		Ok(self.typed(object)?.dependencies())
	}

	fn register_references(&self, object: &dyn Serializable, ctx: &mut ReferenceContext<'_>) -> Result<()> {
		for (kind, target) in self.typed(object)?.references() {
			ctx.register_reference(object, kind, target)?;
		}
		Ok(())
	}

	fn export_extra_data(&self, object: &dyn Serializable, ctx: &mut ExportContext<'_>) -> Result<()> {
		self.typed(object)?.export_extra(ctx)
	}

	unsafe fn create_object(
		&self,
		address: NonNull<u8>,
		ctx: &mut ImportContext<'_>,
	) -> Result<NonNull<dyn Serializable>> {
		let ptr = ctx.place::<T>(address)?;
		let object = &mut *ptr.as_ptr();
		object.resolve_pointers(ctx)?;
		object.import_extra(ctx)?;
		Ok(NonNull::from(object as &mut dyn Serializable))
	}

	fn is_subordinate(&self, object: &dyn Serializable) -> Result<bool> {
		Ok(self.typed(object)?.is_subordinate())
	}

	fn raw_pointers(&self, object: &dyn Serializable) -> Result<Option<Vec<(&'static str, usize)>>> {
		Ok(self.typed(object)?.pointer_fields())
	}
}
