//! Byte storage used by the binary engine.
//!
//! [`ByteStorage`] is the growable output buffer the writer assembles a stream
//! in. [`AlignedBuf`] is the fixed-capacity, aligned arena that a loaded graph
//! lives in.

use std::{
	alloc::{self, Layout},
	ptr::{self, NonNull},
	slice,
};

use crate::{
	util::{align_up_to, aligned_max_capacity},
	Error, Result,
};

/// Default alignment of load buffers and of extra-data blocks.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Growable output buffer with explicit alignment padding and random access
/// writes, for patching values once they're known.
#[derive(Debug, Default, Clone)]
pub struct ByteStorage {
	bytes: Vec<u8>,
}

impl ByteStorage {
	pub fn new() -> Self {
		Self { bytes: Vec::new() }
	}

	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			bytes: Vec::with_capacity(capacity),
		}
	}

	/// Current position in storage.
	#[inline]
	pub fn pos(&self) -> usize {
		self.bytes.len()
	}

	#[inline]
	pub fn push_bytes(&mut self, bytes: &[u8]) {
		self.bytes.extend_from_slice(bytes);
	}

	#[inline]
	pub fn push_u8(&mut self, value: u8) {
		self.bytes.push(value);
	}

	#[inline]
	pub fn push_u16(&mut self, value: u16) {
		self.push_bytes(&value.to_le_bytes());
	}

	#[inline]
	pub fn push_u32(&mut self, value: u32) {
		self.push_bytes(&value.to_le_bytes());
	}

	#[inline]
	pub fn push_u64(&mut self, value: u64) {
		self.push_bytes(&value.to_le_bytes());
	}

	/// Push a string, prefixed with its length as a `u16`.
	pub fn push_str(&mut self, s: &str) -> Result<()> {
		let len = u16::try_from(s.len())
			.map_err(|_| Error::InvalidArgument(format!("name too long: `{s}`")))?;
		self.push_u16(len);
		self.push_bytes(s.as_bytes());
		Ok(())
	}

	/// Push `len` zero bytes.
	#[inline]
	pub fn push_zeros(&mut self, len: usize) {
		self.bytes.resize(self.bytes.len() + len, 0);
	}

	/// Pad with zeros to a multiple of `alignment`.
	///
	/// `alignment` must be a power of 2.
	#[inline]
	pub fn align(&mut self, alignment: usize) {
		let new_pos = align_up_to(self.pos(), alignment);
		self.bytes.resize(new_pos, 0);
	}

	/// Overwrite bytes at a position already written.
	///
	/// # Panics
	///
	/// Panics if `pos + bytes.len()` exceeds current position.
	#[inline]
	pub fn write_at(&mut self, pos: usize, bytes: &[u8]) {
		self.bytes[pos..pos + bytes.len()].copy_from_slice(bytes);
	}

	#[inline]
	pub fn as_slice(&self) -> &[u8] {
		&self.bytes
	}

	pub fn into_vec(mut self) -> Vec<u8> {
		self.bytes.shrink_to_fit();
		self.bytes
	}
}

/// Aligned, fixed-capacity memory buffer, used as the arena which loaded
/// objects are constructed inside.
///
/// Capacity is set when the buffer is created and can never grow, so
/// addresses inside it stay valid for the buffer's whole lifetime.
/// Memory is zero-initialized.
///
/// Space is handed out by bump allocation with [`AlignedBuf::alloc`].
///
/// # Const parameters
///
/// `ALIGNMENT` is the alignment of the buffer's memory, and the maximum
/// alignment of any value allocated in it.
///
/// * Must be a power of 2.
///
/// Default: 16
pub struct AlignedBuf<const ALIGNMENT: usize = DEFAULT_ALIGNMENT> {
	ptr: NonNull<u8>,
	capacity: usize,
	len: usize,
}

impl<const ALIGNMENT: usize> AlignedBuf<ALIGNMENT> {
	/// Alignment of buffer's memory.
	pub const ALIGNMENT: usize = ALIGNMENT;

	/// Assertions for validity of `ALIGNMENT`.
	/// Referenced in all code paths creating an `AlignedBuf`, so produces a
	/// compile-time error if assertions fail.
	const ASSERT_ALIGNMENT_VALID: () = {
		assert!(ALIGNMENT > 0, "ALIGNMENT cannot be 0");
		assert!(ALIGNMENT.is_power_of_two(), "ALIGNMENT must be a power of 2");
		assert!(
			ALIGNMENT < isize::MAX as usize,
			"ALIGNMENT must be less than isize::MAX"
		);
	};

	/// Create new [`AlignedBuf`] with no allocated memory.
	pub fn new() -> Self {
		// Ensure (at compile time) that const param is valid
		let _ = Self::ASSERT_ALIGNMENT_VALID;

		Self {
			ptr: Self::dangling(),
			capacity: 0,
			len: 0,
		}
	}

	/// Create new [`AlignedBuf`] with capacity of `capacity` bytes, rounded up
	/// to a multiple of `ALIGNMENT`.
	///
	/// Returns an error if capacity exceeds maximum for an allocation.
	pub fn with_capacity(capacity: usize) -> Result<Self> {
		let _ = Self::ASSERT_ALIGNMENT_VALID;

		if capacity == 0 {
			return Ok(Self::new());
		}

		let max = aligned_max_capacity(ALIGNMENT);
		if capacity > max {
			return Err(Error::InsufficientBuffer {
				needed: capacity,
				available: max,
			});
		}
		let capacity = align_up_to(capacity, ALIGNMENT);

		// `capacity` is non-zero and within bounds checked above
		let layout = Self::layout(capacity);
		let ptr = unsafe { alloc::alloc_zeroed(layout) };
		let ptr = match NonNull::new(ptr) {
			Some(ptr) => ptr,
			None => alloc::handle_alloc_error(layout),
		};

		Ok(Self {
			ptr,
			capacity,
			len: 0,
		})
	}

	/// Returns capacity of buffer in bytes.
	#[inline]
	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Returns number of bytes allocated so far.
	#[inline]
	pub fn len(&self) -> usize {
		self.len
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Allocate `size` bytes aligned to `alignment`.
	/// Returns offset of the allocation from start of buffer.
	///
	/// `alignment` must be a power of 2, and no greater than `ALIGNMENT`.
	pub fn alloc(&mut self, size: usize, alignment: usize) -> Result<usize> {
		if !alignment.is_power_of_two() || alignment > ALIGNMENT {
			return Err(Error::InvalidArgument(format!(
				"alignment {alignment} not supported by buffer aligned to {ALIGNMENT}"
			)));
		}

		// `len <= capacity`, which cannot exceed `isize::MAX`, so can't overflow
		let offset = align_up_to(self.len, alignment);
		let end = offset.checked_add(size).ok_or(Error::InsufficientBuffer {
			needed: usize::MAX,
			available: self.capacity,
		})?;
		if end > self.capacity {
			return Err(Error::InsufficientBuffer {
				needed: end,
				available: self.capacity,
			});
		}

		self.len = end;
		Ok(offset)
	}

	/// Get pointer to a position in the buffer.
	///
	/// # Panics
	///
	/// Panics if `offset` is out of bounds.
	#[inline]
	pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
		assert!(offset <= self.capacity, "offset out of bounds");
		// In bounds of allocation, so cannot be null
		unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
	}

	/// Copy `bytes` into the buffer at `offset`.
	///
	/// # Panics
	///
	/// Panics if write would exceed capacity.
	pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
		assert!(
			offset <= self.capacity && self.capacity - offset >= bytes.len(),
			"write out of bounds"
		);
		// Bounds checked above
		unsafe {
			ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
		}
	}

	/// Returns a raw pointer to the buffer, or a dangling pointer if nothing
	/// was allocated.
	///
	/// The pointer is valid for as long as the buffer is alive.
	#[inline]
	pub fn as_ptr(&self) -> *const u8 {
		self.ptr.as_ptr()
	}

	/// Slice of the whole buffer, including any space not yet allocated.
	#[inline]
	pub fn as_slice(&self) -> &[u8] {
		// Memory is zero-initialized on creation, so all `capacity` bytes are
		// initialized
		unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
	}

	/// Whether `addr` lies within this buffer.
	#[inline]
	pub fn contains_addr(&self, addr: usize) -> bool {
		let start = self.ptr.as_ptr() as usize;
		addr >= start && addr < start + self.capacity
	}

	#[inline]
	fn layout(capacity: usize) -> Layout {
		// `with_capacity` ensures `capacity` does not exceed max for `ALIGNMENT`
		unsafe { Layout::from_size_align_unchecked(capacity, ALIGNMENT) }
	}

	#[inline]
	fn dangling() -> NonNull<u8> {
		// `ALIGNMENT` is non-zero, so this is a valid non-null, aligned address
		unsafe { NonNull::new_unchecked(ALIGNMENT as *mut u8) }
	}
}

impl<const ALIGNMENT: usize> Default for AlignedBuf<ALIGNMENT> {
	fn default() -> Self {
		Self::new()
	}
}

impl<const ALIGNMENT: usize> Drop for AlignedBuf<ALIGNMENT> {
	fn drop(&mut self) {
		if self.capacity > 0 {
			// Allocated in `with_capacity` with same layout
			unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout(self.capacity)) };
		}
	}
}
