//! Binary stream format.
//!
//! ```text
//! header        fixed size, see `Header`
//! layouts       `layout_count` embedded layout tables
//! directory     one `DirEntry` per object, in write order
//! (align)
//! records       per object: fixed-size state, then extra-data blocks
//! (align 8)
//! references    `reference_count` x (source u64, kind u32, pad u32, target u64, target offset u64)
//! ```
//!
//! Header, layout tables, directory and reference table are little-endian.
//! Fixed-size state and extra data are in the writing platform's native byte
//! order and pointer width, both of which are recorded in the header.

use crate::{
	layout::{FieldKind, FieldLayout, LayoutTable},
	storage::ByteStorage,
	Error, Result, TypeTag,
};

pub const MAGIC: [u8; 4] = *b"SGRF";
pub const VERSION: u16 = 1;

pub const HEADER_SIZE: usize = 48;
pub const DIR_ENTRY_SIZE: usize = 48;
pub const REFERENCE_SIZE: usize = 32;
/// Smallest possible embedded layout table: tag, size, align, field count,
/// and an empty type name.
pub const MIN_LAYOUT_SIZE: usize = 18;
/// Smallest possible extra-data block: its length, with no data.
pub const MIN_EXTRA_BLOCK_SIZE: usize = 8;

/// Header flag: layout tables are embedded.
pub const FLAG_LAYOUTS: u32 = 1 << 0;

/// Record flag: pointer fields hold identities, not addresses.
pub const RECORD_PTRS_ARE_IDS: u32 = 1 << 0;
/// Record flag: object is subordinate.
pub const RECORD_SUBORDINATE: u32 = 1 << 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Endian {
	Little = 0,
	Big = 1,
}

impl Endian {
	pub const NATIVE: Endian = if cfg!(target_endian = "big") {
		Endian::Big
	} else {
		Endian::Little
	};
}

/// Stream header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
	pub version: u16,
	pub endian: Endian,
	pub ptr_width: u8,
	pub alignment: u32,
	pub flags: u32,
	pub object_count: u32,
	pub layout_count: u32,
	pub reference_count: u32,
	/// Offset of records section from start of stream
	pub records_offset: u64,
	/// Offset of reference table from start of stream
	pub references_offset: u64,
}

impl Header {
	pub fn write(&self, out: &mut ByteStorage) {
		out.push_bytes(&MAGIC);
		out.push_u16(self.version);
		out.push_u8(self.endian as u8);
		out.push_u8(self.ptr_width);
		out.push_u32(self.alignment);
		out.push_u32(self.flags);
		out.push_u32(self.object_count);
		out.push_u32(self.layout_count);
		out.push_u32(self.reference_count);
		// Reserved
		out.push_u32(0);
		out.push_u64(self.records_offset);
		out.push_u64(self.references_offset);
	}

	pub fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
		if cursor.bytes(4)? != MAGIC {
			return Err(Error::FormatMismatch("not a ser_graph stream".into()));
		}
		let version = cursor.u16()?;
		if version != VERSION {
			return Err(Error::FormatMismatch(format!(
				"unsupported version {version}, expected {VERSION}"
			)));
		}
		let endian = match cursor.u8()? {
			0 => Endian::Little,
			1 => Endian::Big,
			other => return Err(Error::FormatMismatch(format!("invalid byte order {other}"))),
		};
		let ptr_width = cursor.u8()?;
		if ptr_width != 4 && ptr_width != 8 {
			return Err(Error::FormatMismatch(format!("invalid pointer width {ptr_width}")));
		}
		let alignment = cursor.u32()?;
		if !alignment.is_power_of_two() {
			return Err(Error::FormatMismatch(format!("invalid alignment {alignment}")));
		}

		let flags = cursor.u32()?;
		let object_count = cursor.u32()?;
		let layout_count = cursor.u32()?;
		let reference_count = cursor.u32()?;
		let _reserved = cursor.u32()?;

		Ok(Self {
			version,
			endian,
			ptr_width,
			alignment,
			flags,
			object_count,
			layout_count,
			reference_count,
			records_offset: cursor.u64()?,
			references_offset: cursor.u64()?,
		})
	}

	#[inline]
	pub fn has_layouts(&self) -> bool {
		self.flags & FLAG_LAYOUTS != 0
	}
}

/// Directory entry describing one object record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
	pub tag: TypeTag,
	pub flags: u32,
	pub id: u64,
	/// Address of object at write time
	pub original_addr: u64,
	/// Offset of record from start of stream
	pub record_offset: u64,
	/// Size of fixed-size state
	pub record_size: u32,
	pub extra_count: u32,
	/// Total bytes of extra data, excluding padding
	pub extra_bytes: u64,
}

impl DirEntry {
	pub fn write(&self, out: &mut ByteStorage) {
		out.push_u32(self.tag.get());
		out.push_u32(self.flags);
		out.push_u64(self.id);
		out.push_u64(self.original_addr);
		out.push_u64(self.record_offset);
		out.push_u32(self.record_size);
		out.push_u32(self.extra_count);
		out.push_u64(self.extra_bytes);
	}

	pub fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
		Ok(Self {
			tag: TypeTag::new(cursor.u32()?),
			flags: cursor.u32()?,
			id: cursor.u64()?,
			original_addr: cursor.u64()?,
			record_offset: cursor.u64()?,
			record_size: cursor.u32()?,
			extra_count: cursor.u32()?,
			extra_bytes: cursor.u64()?,
		})
	}

	#[inline]
	pub fn ptrs_are_ids(&self) -> bool {
		self.flags & RECORD_PTRS_ARE_IDS != 0
	}

	#[inline]
	pub fn is_subordinate(&self) -> bool {
		self.flags & RECORD_SUBORDINATE != 0
	}
}

/// Write an embedded layout table.
pub fn write_layout(out: &mut ByteStorage, tag: TypeTag, layout: &LayoutTable) -> Result<()> {
	out.push_u32(tag.get());
	out.push_u32(to_u32(layout.size)?);
	out.push_u32(to_u32(layout.align)?);
	out.push_u32(to_u32(layout.fields.len())?);
	out.push_str(&layout.type_name)?;
	for field in &layout.fields {
		out.push_str(&field.name)?;
		out.push_u32(to_u32(field.offset)?);
		out.push_u32(to_u32(field.size)?);
		out.push_u8(field.kind.code());
		if let FieldKind::ExtraArray { count_field } = &field.kind {
			out.push_str(count_field)?;
		}
	}
	Ok(())
}

/// Read an embedded layout table.
pub fn read_layout(cursor: &mut Cursor<'_>) -> Result<(TypeTag, LayoutTable)> {
	let tag = TypeTag::new(cursor.u32()?);
	let size = cursor.u32()? as usize;
	let align = cursor.u32()? as usize;
	let field_count = cursor.u32()? as usize;
	let type_name = cursor.str()?;

	let mut layout = LayoutTable::new(type_name, size, align);
	for _ in 0..field_count {
		let name = cursor.str()?;
		let offset = cursor.u32()? as usize;
		let size = cursor.u32()? as usize;
		let kind = match cursor.u8()? {
			0 => FieldKind::Plain,
			1 => FieldKind::ObjectPtr,
			2 => FieldKind::ExtraPtr,
			3 => FieldKind::ExtraArray {
				count_field: cursor.str()?,
			},
			other => {
				return Err(Error::FormatMismatch(format!(
					"invalid field kind {other} in layout of {tag}"
				)))
			}
		};
		layout.fields.push(FieldLayout {
			name,
			offset,
			size,
			kind,
		});
	}
	Ok((tag, layout))
}

pub(crate) fn to_u32(value: usize) -> Result<u32> {
	u32::try_from(value).map_err(|_| Error::InvalidArgument(format!("value {value} exceeds u32")))
}

/// Bounds-checked reader over a byte slice.
/// Running out of input is a [`Error::FormatMismatch`].
pub struct Cursor<'a> {
	bytes: &'a [u8],
	pos: usize,
}

impl<'a> Cursor<'a> {
	pub fn new(bytes: &'a [u8]) -> Self {
		Self { bytes, pos: 0 }
	}

	pub fn at(bytes: &'a [u8], pos: usize) -> Self {
		Self { bytes, pos }
	}

	#[inline]
	pub fn pos(&self) -> usize {
		self.pos
	}

	/// Bytes left after current position.
	#[inline]
	pub fn remaining(&self) -> usize {
		self.bytes.len().saturating_sub(self.pos)
	}

	/// Check that `count` items of at least `item_size` bytes each can fit in
	/// the rest of the input. Guards allocations sized from counts in the
	/// stream.
	pub fn check_count(&self, count: u32, item_size: usize, what: &str) -> Result<()> {
		let fits = (count as usize)
			.checked_mul(item_size)
			.is_some_and(|needed| needed <= self.remaining());
		if !fits {
			return Err(Error::FormatMismatch(format!(
				"{count} {what} cannot fit in {} remaining bytes",
				self.remaining()
			)));
		}
		Ok(())
	}

	pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
		let end = self.pos.checked_add(len).filter(|&end| end <= self.bytes.len());
		let Some(end) = end else {
			return Err(Error::FormatMismatch(format!(
				"unexpected end of stream at {} reading {len} bytes",
				self.pos
			)));
		};
		let out = &self.bytes[self.pos..end];
		self.pos = end;
		Ok(out)
	}

	/// Skip to a multiple of `alignment`. Past the end of input, reads after
	/// this fail.
	pub fn align(&mut self, alignment: usize) {
		self.pos = match self.pos.checked_add(alignment - 1) {
			Some(end) => end & !(alignment - 1),
			None => usize::MAX,
		};
	}

	pub fn u8(&mut self) -> Result<u8> {
		Ok(self.bytes(1)?[0])
	}

	pub fn u16(&mut self) -> Result<u16> {
		let b = self.bytes(2)?;
		Ok(u16::from_le_bytes([b[0], b[1]]))
	}

	pub fn u32(&mut self) -> Result<u32> {
		let b = self.bytes(4)?;
		Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
	}

	pub fn u64(&mut self) -> Result<u64> {
		let mut buf = [0u8; 8];
		buf.copy_from_slice(self.bytes(8)?);
		Ok(u64::from_le_bytes(buf))
	}

	pub fn str(&mut self) -> Result<String> {
		let len = self.u16()? as usize;
		let bytes = self.bytes(len)?;
		String::from_utf8(bytes.to_vec())
			.map_err(|_| Error::FormatMismatch("invalid utf-8 in name".into()))
	}
}
