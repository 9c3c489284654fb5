//! Serializable objects and the handles they use to point at each other.

use std::{any::Any, fmt, marker::PhantomData, ptr, slice};

use crate::TypeTag;

/// Per-object flag set.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ObjectFlags(u32);

impl ObjectFlags {
	/// Object owns its backing memory (and that of its extra data).
	/// Cleared on objects reconstructed inside a load buffer.
	pub const OWNS_MEMORY: ObjectFlags = ObjectFlags(1 << 0);
	/// Object may be released by the framework.
	pub const RELEASABLE: ObjectFlags = ObjectFlags(1 << 1);

	pub const fn empty() -> Self {
		Self(0)
	}

	/// Flags of an object constructed by the application.
	pub const fn owned() -> Self {
		Self(Self::OWNS_MEMORY.0 | Self::RELEASABLE.0)
	}

	/// Flags of an object reconstructed in place inside a load buffer.
	pub const fn in_buffer() -> Self {
		Self::RELEASABLE
	}

	#[inline]
	pub const fn bits(self) -> u32 {
		self.0
	}

	#[inline]
	pub const fn contains(self, other: ObjectFlags) -> bool {
		self.0 & other.0 == other.0
	}

	#[inline]
	pub fn insert(&mut self, other: ObjectFlags) {
		self.0 |= other.0;
	}

	#[inline]
	pub fn remove(&mut self, other: ObjectFlags) {
		self.0 &= !other.0;
	}
}

impl fmt::Debug for ObjectFlags {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ObjectFlags")
			.field("owns_memory", &self.contains(Self::OWNS_MEMORY))
			.field("releasable", &self.contains(Self::RELEASABLE))
			.finish()
	}
}

/// Common header which every serializable type embeds as its first field.
///
/// Types must be `#[repr(C)]` so the header sits at offset 0.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct ObjectHeader {
	tag: TypeTag,
	flags: ObjectFlags,
}

impl ObjectHeader {
	/// Header for an object constructed by the application.
	#[inline]
	pub const fn new(tag: TypeTag) -> Self {
		Self {
			tag,
			flags: ObjectFlags::owned(),
		}
	}

	#[inline]
	pub const fn tag(&self) -> TypeTag {
		self.tag
	}

	#[inline]
	pub const fn flags(&self) -> ObjectFlags {
		self.flags
	}

	#[inline]
	pub fn flags_mut(&mut self) -> &mut ObjectFlags {
		&mut self.flags
	}

	#[inline]
	pub const fn owns_memory(&self) -> bool {
		self.flags.contains(ObjectFlags::OWNS_MEMORY)
	}

	#[inline]
	pub const fn is_releasable(&self) -> bool {
		self.flags.contains(ObjectFlags::RELEASABLE)
	}
}

/// Trait for objects which can be persisted.
///
/// Serializer behavior is not part of this trait. It lives in an
/// [`ObjectSerializer`](crate::ObjectSerializer) registered against the
/// object's [`TypeTag`].
///
/// Usually implemented with `#[derive(Serializable)]`.
pub trait Serializable: Any {
	fn header(&self) -> &ObjectHeader;

	fn header_mut(&mut self) -> &mut ObjectHeader;

	fn as_any(&self) -> &dyn Any;

	fn as_any_mut(&mut self) -> &mut dyn Any;

	#[inline]
	fn type_tag(&self) -> TypeTag {
		self.header().tag()
	}

	/// Whether this object is an instance of kind `tag`.
	///
	/// Types which specialize a more general kind override this to also answer
	/// `true` for the general kind's tag.
	#[inline]
	fn is_kind(&self, tag: TypeTag) -> bool {
		self.type_tag() == tag
	}
}

impl<'a> dyn Serializable + 'a {
	#[inline]
	pub fn downcast_ref<T: Serializable>(&self) -> Option<&T> {
		self.as_any().downcast_ref()
	}

	#[inline]
	pub fn downcast_mut<T: Serializable>(&mut self) -> Option<&mut T> {
		self.as_any_mut().downcast_mut()
	}

	/// Memory address of this object. Used as its identity key during a pass.
	#[inline]
	pub fn addr(&self) -> usize {
		self as *const Self as *const () as usize
	}
}

/// Non-owning, nullable pointer from one object to another.
///
/// Same size as a `usize`. Layout kind is pointer-to-object.
///
/// In serialized output the pointer is replaced by the identity of its target,
/// and on load it is re-pointed at the reconstructed target.
#[repr(transparent)]
pub struct ObjPtr<T> {
	ptr: *const T,
}

impl<T> ObjPtr<T> {
	/// Null pointer.
	#[inline]
	pub const fn null() -> Self {
		Self { ptr: ptr::null() }
	}

	/// Create pointer to `target`.
	///
	/// # Safety
	///
	/// `target` must not move, and must outlive every use of this pointer
	/// (and of any copy of it).
	#[inline]
	pub unsafe fn new(target: &T) -> Self {
		Self { ptr: target }
	}

	#[inline]
	pub fn is_null(&self) -> bool {
		self.ptr.is_null()
	}

	/// Get reference to target, or `None` if null.
	#[inline]
	pub fn get(&self) -> Option<&T> {
		// Validity of the target is the contract of `ObjPtr::new`
		// and of the engine for pointers it resolves on load
		unsafe { self.ptr.as_ref() }
	}

	/// Raw bits of this pointer.
	#[inline]
	pub fn addr(&self) -> usize {
		self.ptr as usize
	}

	#[inline]
	pub(crate) fn from_addr(addr: usize) -> Self {
		Self {
			ptr: addr as *const T,
		}
	}
}

impl<T: Serializable> ObjPtr<T> {
	/// Get target as a `&dyn Serializable`.
	#[inline]
	pub fn get_dyn(&self) -> Option<&dyn Serializable> {
		self.get().map(|target| target as &dyn Serializable)
	}

}

impl<T> Clone for ObjPtr<T> {
	#[inline]
	fn clone(&self) -> Self {
		*self
	}
}

impl<T> Copy for ObjPtr<T> {}

impl<T> Default for ObjPtr<T> {
	#[inline]
	fn default() -> Self {
		Self::null()
	}
}

impl<T> PartialEq for ObjPtr<T> {
	#[inline]
	fn eq(&self, other: &Self) -> bool {
		self.ptr == other.ptr
	}
}

impl<T> Eq for ObjPtr<T> {}

impl<T> fmt::Debug for ObjPtr<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ObjPtr({:#x})", self.addr())
	}
}

/// Thin pointer to extra data attached to an object.
///
/// Either a single `T` (layout kind pointer-to-extra-data) or an array of `T`
/// whose length is held in a separate count field (layout kind
/// extra-data-array-with-count-field).
///
/// `ExtraPtr` does not free its target on drop. Whether the target is owned
/// is a property of the containing object: only objects with
/// [`ObjectFlags::OWNS_MEMORY`] may release their extra data.
#[repr(transparent)]
pub struct ExtraPtr<T: Copy> {
	ptr: *mut T,
	_marker: PhantomData<T>,
}

impl<T: Copy> ExtraPtr<T> {
	#[inline]
	pub const fn null() -> Self {
		Self {
			ptr: ptr::null_mut(),
			_marker: PhantomData,
		}
	}

	/// Take ownership of a boxed value.
	/// Release with [`ExtraPtr::release`].
	pub fn from_box(value: Box<T>) -> Self {
		Self {
			ptr: Box::into_raw(value),
			_marker: PhantomData,
		}
	}

	/// Take ownership of a vector's contents.
	/// Returns the pointer and the length to store in the count field.
	/// Release with [`ExtraPtr::release_slice`].
	pub fn from_vec(vec: Vec<T>) -> (Self, usize) {
		let boxed = vec.into_boxed_slice();
		let len = boxed.len();
		let ptr = Box::into_raw(boxed) as *mut T;
		(
			Self {
				ptr,
				_marker: PhantomData,
			},
			len,
		)
	}

	#[inline]
	pub fn is_null(&self) -> bool {
		self.ptr.is_null()
	}

	/// Get reference to the single value pointed to.
	///
	/// # Safety
	///
	/// Pointer must be null, or point to a live `T`.
	#[inline]
	pub unsafe fn as_ref(&self) -> Option<&T> {
		self.ptr.as_ref()
	}

	/// Get the array pointed to.
	///
	/// # Safety
	///
	/// Pointer must point to at least `len` live `T`s, or be null with
	/// `len == 0`.
	#[inline]
	pub unsafe fn as_slice(&self, len: usize) -> &[T] {
		if self.ptr.is_null() || len == 0 {
			return &[];
		}
		slice::from_raw_parts(self.ptr, len)
	}

	/// Free a value created with [`ExtraPtr::from_box`], leaving this pointer
	/// null.
	///
	/// # Safety
	///
	/// Pointer must have been created by [`ExtraPtr::from_box`] and not
	/// released already. Never call on data inside a load buffer.
	pub unsafe fn release(&mut self) {
		if !self.ptr.is_null() {
			drop(Box::from_raw(self.ptr));
			self.ptr = ptr::null_mut();
		}
	}

	/// Free an array created with [`ExtraPtr::from_vec`], leaving this pointer
	/// null.
	///
	/// # Safety
	///
	/// Pointer must have been created by [`ExtraPtr::from_vec`] with this
	/// `len`, and not released already. Never call on data inside a load
	/// buffer.
	pub unsafe fn release_slice(&mut self, len: usize) {
		if !self.ptr.is_null() {
			let slice = ptr::slice_from_raw_parts_mut(self.ptr, len);
			drop(Box::from_raw(slice));
			self.ptr = ptr::null_mut();
		}
	}

	#[inline]
	pub fn addr(&self) -> usize {
		self.ptr as usize
	}

	#[inline]
	pub(crate) fn from_addr(addr: usize) -> Self {
		Self {
			ptr: addr as *mut T,
			_marker: PhantomData,
		}
	}
}

impl<T: Copy> Default for ExtraPtr<T> {
	#[inline]
	fn default() -> Self {
		Self::null()
	}
}

impl<T: Copy> fmt::Debug for ExtraPtr<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ExtraPtr({:#x})", self.addr())
	}
}
