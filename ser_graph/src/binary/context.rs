//! Contexts passed to [`ObjectSerializer`](crate::ObjectSerializer) methods
//! during a binary pass.

use std::{collections::HashMap, mem, ptr, ptr::NonNull, slice};

use crate::{
	layout::{LayoutTable, NATIVE_PTR_WIDTH},
	storage::{AlignedBuf, ByteStorage},
	util::is_aligned_to,
	Error, ExtraPtr, ObjPtr, ReferenceKind, Result, Serializable, TypeTag,
};

/// A directed edge from one object to another.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reference {
	pub source: u64,
	pub kind: ReferenceKind,
	pub target: u64,
}

/// Context for registering references of one object, at write time.
pub struct ReferenceContext<'p> {
	/// Object address -> identity, for every object in the graph
	ids: &'p HashMap<usize, u64>,
	tag: TypeTag,
	source_id: u64,
	references: &'p mut Vec<Reference>,
}

impl<'p> ReferenceContext<'p> {
	pub(crate) fn new(
		ids: &'p HashMap<usize, u64>,
		tag: TypeTag,
		source_id: u64,
		references: &'p mut Vec<Reference>,
	) -> Self {
		Self {
			ids,
			tag,
			source_id,
			references,
		}
	}

	/// Identity of the object whose references are being registered.
	#[inline]
	pub fn source_id(&self) -> u64 {
		self.source_id
	}

	/// Identity of an object in the graph being written.
	#[inline]
	pub fn id_of(&self, object: &dyn Serializable) -> Option<u64> {
		self.ids.get(&object.addr()).copied()
	}

	/// Record a reference from `source` to `target`.
	///
	/// Fails with [`Error::UnresolvedReference`] if either object is not part of
	/// the graph, i.e. wasn't a collection member and wasn't reported by any
	/// `enumerate_dependencies` call.
	pub fn register_reference(
		&mut self,
		source: &dyn Serializable,
		kind: ReferenceKind,
		target: &dyn Serializable,
	) -> Result<()> {
		let unresolved = || Error::UnresolvedReference {
			tag: self.tag,
			source_id: self.source_id,
		};
		let source = self.id_of(source).ok_or_else(unresolved)?;
		let target = self.id_of(target).ok_or_else(unresolved)?;
		self.references.push(Reference {
			source,
			kind,
			target,
		});
		Ok(())
	}
}

/// Context for writing extra data of one object.
///
/// Each block is written as its length (`u64`, 8-byte aligned), followed by
/// its bytes aligned to the stream's extra-data alignment.
pub struct ExportContext<'p> {
	storage: &'p mut ByteStorage,
	alignment: usize,
	blocks: u32,
	bytes: u64,
}

impl<'p> ExportContext<'p> {
	pub(crate) fn new(storage: &'p mut ByteStorage, alignment: usize) -> Self {
		Self {
			storage,
			alignment,
			blocks: 0,
			bytes: 0,
		}
	}

	/// Alignment of extra-data blocks.
	#[inline]
	pub fn alignment(&self) -> usize {
		self.alignment
	}

	/// Write a block of extra data.
	pub fn export_extra_data(&mut self, bytes: &[u8]) {
		self.storage.align(mem::align_of::<u64>());
		self.storage.push_u64(bytes.len() as u64);
		self.storage.align(self.alignment);
		self.storage.push_bytes(bytes);
		self.blocks += 1;
		self.bytes += bytes.len() as u64;
	}

	/// Write a slice of values as a block of extra data.
	pub fn export_slice<T: Copy>(&mut self, values: &[T]) {
		// Any initialized `&[T]` can be viewed as bytes of the same total size
		let bytes = unsafe { slice::from_raw_parts(values.as_ptr().cast::<u8>(), mem::size_of_val(values)) };
		self.export_extra_data(bytes);
	}

	/// Write a single value as a block of extra data.
	#[inline]
	pub fn export_value<T: Copy>(&mut self, value: &T) {
		self.export_slice(slice::from_ref(value));
	}

	pub(crate) fn totals(&self) -> (u32, u64) {
		(self.blocks, self.bytes)
	}
}

/// An extra-data block, in the stream being read.
#[derive(Copy, Clone, Debug)]
pub(crate) struct ExtraBlock {
	pub offset: usize,
	pub len: usize,
}

/// Mapping from raw pointer bits found in records to reconstructed addresses.
pub(crate) struct AddressTable {
	/// Identity -> address of reconstructed object, or 0 if object was not
	/// constructed
	pub by_id: HashMap<u64, usize>,
	/// Address of object at write time -> identity
	pub by_original_addr: HashMap<u64, u64>,
}

/// Context for reconstructing one object in place, at read time.
pub struct ImportContext<'p> {
	tag: TypeTag,
	id: u64,
	/// Fixed-size state, in the current build's layout
	record: &'p [u8],
	layout: Option<&'p LayoutTable>,
	/// Whether pointer fields in `record` hold identities (layout-described
	/// records) or original addresses (raw records)
	ptrs_are_ids: bool,
	addresses: &'p AddressTable,
	references: &'p [Reference],
	stream: &'p [u8],
	blocks: &'p [ExtraBlock],
	next_block: usize,
	buffer: &'p mut AlignedBuf,
	alignment: usize,
}

impl<'p> ImportContext<'p> {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		tag: TypeTag,
		id: u64,
		record: &'p [u8],
		layout: Option<&'p LayoutTable>,
		ptrs_are_ids: bool,
		addresses: &'p AddressTable,
		references: &'p [Reference],
		stream: &'p [u8],
		blocks: &'p [ExtraBlock],
		buffer: &'p mut AlignedBuf,
		alignment: usize,
	) -> Self {
		Self {
			tag,
			id,
			record,
			layout,
			ptrs_are_ids,
			addresses,
			references,
			stream,
			blocks,
			next_block: 0,
			buffer,
			alignment,
		}
	}

	/// Identity of the object being reconstructed.
	#[inline]
	pub fn id(&self) -> u64 {
		self.id
	}

	#[inline]
	pub fn tag(&self) -> TypeTag {
		self.tag
	}

	/// Fixed-size state of the object, converted to the current build's layout
	/// where a layout table is available.
	#[inline]
	pub fn fixed_state(&self) -> &[u8] {
		self.record
	}

	/// Layout table of the type in the current build, if registered.
	#[inline]
	pub fn layout(&self) -> Option<&LayoutTable> {
		self.layout
	}

	/// References registered from this object at write time, including any of
	/// kinds other than [`ReferenceKind::OBJECT`].
	pub fn references(&self) -> impl Iterator<Item = &Reference> + '_ {
		let id = self.id;
		self.references.iter().filter(move |r| r.source == id)
	}

	/// Copy fixed-size state to `address`, and return it as a pointer to `T`.
	///
	/// # Safety
	///
	/// `address` must be valid for writes of `size_of::<T>()` bytes.
	/// Fixed-size state must be a valid `T` once its pointer fields have been
	/// resolved.
	pub unsafe fn place<T>(&self, address: NonNull<u8>) -> Result<NonNull<T>> {
		if self.record.len() != mem::size_of::<T>() {
			return Err(Error::FormatMismatch(format!(
				"object {} ({}) has {} bytes of fixed state, type is {} bytes",
				self.id,
				self.tag,
				self.record.len(),
				mem::size_of::<T>()
			)));
		}
		if !is_aligned_to(address.as_ptr() as usize, mem::align_of::<T>()) {
			return Err(Error::InvalidArgument(format!(
				"address for object {} is not aligned to {}",
				self.id,
				mem::align_of::<T>()
			)));
		}

		ptr::copy_nonoverlapping(self.record.as_ptr(), address.as_ptr(), self.record.len());
		Ok(address.cast::<T>())
	}

	/// Map raw pointer bits found in a record to the address of the
	/// reconstructed target. Returns 0 for null, or for a target which was not
	/// constructed.
	pub fn resolve_raw(&self, raw: u64) -> Result<usize> {
		if raw == 0 {
			return Ok(0);
		}

		let id = if self.ptrs_are_ids {
			raw
		} else {
			match self.addresses.by_original_addr.get(&raw) {
				Some(&id) => id,
				None => return Err(self.dangling(raw)),
			}
		};

		self.addresses.by_id.get(&id).copied().ok_or_else(|| self.dangling(raw))
	}

	/// Re-point an [`ObjPtr`] field at its reconstructed target.
	pub fn resolve<T>(&self, ptr: &mut ObjPtr<T>) -> Result<()> {
		let addr = self.resolve_raw(ptr.addr() as u64)?;
		*ptr = ObjPtr::from_addr(addr);
		Ok(())
	}

	/// Re-point every object pointer field described by the layout table.
	/// No-op if no layout table is registered for the type.
	///
	/// # Safety
	///
	/// `base` must point to an object of the type the layout table describes.
	pub unsafe fn resolve_layout_pointers(&self, base: *mut u8) -> Result<()> {
		let Some(layout) = self.layout else {
			return Ok(());
		};

		for field in layout.object_ptrs() {
			debug_assert_eq!(field.size, NATIVE_PTR_WIDTH);
			let field_ptr = base.add(field.offset).cast::<usize>();
			let raw = field_ptr.read_unaligned();
			let addr = self.resolve_raw(raw as u64)?;
			field_ptr.write_unaligned(addr);
		}
		Ok(())
	}

	/// Number of extra-data blocks not yet imported.
	#[inline]
	pub fn remaining_extra_blocks(&self) -> usize {
		self.blocks.len() - self.next_block
	}

	/// Import next extra-data block into the load buffer.
	/// Returns pointer to the block in the buffer and its length.
	///
	/// Block is aligned to the stream's extra-data alignment.
	pub fn import_extra_data(&mut self) -> Result<(NonNull<u8>, usize)> {
		let Some(block) = self.blocks.get(self.next_block).copied() else {
			return Err(Error::FormatMismatch(format!(
				"object {} ({}) imported more extra-data blocks than were exported",
				self.id, self.tag
			)));
		};
		self.next_block += 1;

		let bytes = self.stream.get(block.offset..block.offset + block.len).ok_or_else(|| {
			Error::FormatMismatch(format!("extra data of object {} out of bounds", self.id))
		})?;
		let offset = self.buffer.alloc(block.len, self.alignment)?;
		self.buffer.write_at(offset, bytes);
		Ok((self.buffer.ptr_at(offset), block.len))
	}

	/// Import next extra-data block as an array of `T`.
	/// Returns pointer to the array and its length.
	pub fn import_slice<T: Copy>(&mut self) -> Result<(ExtraPtr<T>, usize)> {
		if mem::align_of::<T>() > self.alignment {
			return Err(Error::InvalidArgument(format!(
				"extra data of alignment {} exceeds stream alignment {}",
				mem::align_of::<T>(),
				self.alignment
			)));
		}

		let (ptr, len) = self.import_extra_data()?;
		let size = mem::size_of::<T>();
		if size == 0 || len % size != 0 {
			return Err(Error::FormatMismatch(format!(
				"extra data of object {} is {len} bytes, not a whole number of {size}-byte values",
				self.id
			)));
		}
		Ok((ExtraPtr::from_addr(ptr.as_ptr() as usize), len / size))
	}

	/// Import next extra-data block as a single `T`.
	pub fn import_value<T: Copy>(&mut self) -> Result<ExtraPtr<T>> {
		let (ptr, count) = self.import_slice::<T>()?;
		if count != 1 {
			return Err(Error::FormatMismatch(format!(
				"expected 1 extra-data value for object {}, found {count}",
				self.id
			)));
		}
		Ok(ptr)
	}

	fn dangling(&self, raw: u64) -> Error {
		Error::FormatMismatch(format!(
			"object {} ({}) has pointer {raw:#x} to an object not in the stream",
			self.id, self.tag
		))
	}
}
