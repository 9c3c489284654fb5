//! Layout metadata tables.
//!
//! A [`LayoutTable`] describes the in-memory layout of one type: its size and
//! alignment, and for each field its offset, size and [`FieldKind`].
//!
//! Tables are embedded in binary output, and compared against the tables of
//! the build which loads it ([`verify`]). Records can be converted from one
//! layout to another ([`convert`]), which is how loading tolerates layout
//! drift, and how [`retarget`](crate::binary::retarget) works.
//!
//! Tables are normally generated with `#[derive(Layout)]`.

use std::{fmt, mem};

pub mod convert;
pub mod verify;

/// Semantic kind of a field.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldKind {
	/// Plain data, copied byte-for-byte.
	Plain,
	/// [`ObjPtr`](crate::ObjPtr) to another object.
	/// Written as the target's identity.
	ObjectPtr,
	/// [`ExtraPtr`](crate::ExtraPtr) to a single extra-data value.
	/// Written as zero. Re-pointed into the load buffer on load.
	ExtraPtr,
	/// [`ExtraPtr`](crate::ExtraPtr) to an array of extra-data values, whose
	/// length is held in field `count_field`.
	ExtraArray { count_field: String },
}

impl FieldKind {
	/// Code of this kind in serialized layout tables.
	pub(crate) fn code(&self) -> u8 {
		match self {
			Self::Plain => 0,
			Self::ObjectPtr => 1,
			Self::ExtraPtr => 2,
			Self::ExtraArray { .. } => 3,
		}
	}

	/// Whether field holds a pointer, and so has the platform's pointer width.
	#[inline]
	pub fn is_pointer(&self) -> bool {
		!matches!(self, Self::Plain)
	}
}

impl fmt::Display for FieldKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Plain => f.write_str("plain"),
			Self::ObjectPtr => f.write_str("object pointer"),
			Self::ExtraPtr => f.write_str("extra-data pointer"),
			Self::ExtraArray { count_field } => write!(f, "extra-data array (count `{count_field}`)"),
		}
	}
}

/// Layout of a single field.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldLayout {
	pub name: String,
	pub offset: usize,
	pub size: usize,
	pub kind: FieldKind,
}

impl FieldLayout {
	#[inline]
	pub fn end(&self) -> usize {
		self.offset + self.size
	}
}

/// Layout of a type.
///
/// Immutable once registered.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LayoutTable {
	pub type_name: String,
	pub size: usize,
	pub align: usize,
	pub fields: Vec<FieldLayout>,
}

impl LayoutTable {
	/// Create empty table for a type of given size and alignment.
	pub fn new(type_name: impl Into<String>, size: usize, align: usize) -> Self {
		Self {
			type_name: type_name.into(),
			size,
			align,
			fields: Vec::new(),
		}
	}

	/// Create empty table with size and alignment of `T`.
	pub fn of<T>(type_name: impl Into<String>) -> Self {
		Self::new(type_name, mem::size_of::<T>(), mem::align_of::<T>())
	}

	/// Add a field.
	pub fn field(mut self, name: impl Into<String>, offset: usize, size: usize, kind: FieldKind) -> Self {
		self.fields.push(FieldLayout {
			name: name.into(),
			offset,
			size,
			kind,
		});
		self
	}

	pub fn get(&self, name: &str) -> Option<&FieldLayout> {
		self.fields.iter().find(|field| field.name == name)
	}

	/// Fields holding pointers to other objects.
	pub fn object_ptrs(&self) -> impl Iterator<Item = &FieldLayout> {
		self.fields.iter().filter(|field| field.kind == FieldKind::ObjectPtr)
	}

	/// Check table is internally consistent: fields lie within the type, don't
	/// overlap, pointer fields have pointer size `ptr_width`, and
	/// extra-data arrays name an existing plain count field.
	pub fn validate(&self, ptr_width: usize) -> Result<(), String> {
		if !self.align.is_power_of_two() {
			return Err(format!("`{}`: alignment {} is not a power of 2", self.type_name, self.align));
		}

		let mut sorted: Vec<&FieldLayout> = self.fields.iter().collect();
		sorted.sort_by_key(|field| field.offset);
		let mut end = 0;
		for field in sorted {
			if field.offset < end {
				return Err(format!("`{}`: field `{}` overlaps previous field", self.type_name, field.name));
			}
			if field.offset.checked_add(field.size).map_or(true, |end| end > self.size) {
				return Err(format!("`{}`: field `{}` exceeds type size", self.type_name, field.name));
			}
			if field.kind.is_pointer() && field.size != ptr_width {
				return Err(format!(
					"`{}`: pointer field `{}` has size {}, expected {ptr_width}",
					self.type_name, field.name, field.size
				));
			}
			if let FieldKind::ExtraArray { count_field } = &field.kind {
				match self.get(count_field) {
					Some(count) if count.kind == FieldKind::Plain => {}
					_ => {
						return Err(format!(
							"`{}`: count field `{count_field}` of `{}` missing or not plain",
							self.type_name, field.name
						))
					}
				}
			}
			end = field.end();
		}

		Ok(())
	}
}

/// Trait for types with a layout metadata table.
///
/// Implemented by `#[derive(Layout)]`. `T::layout` can be passed directly to
/// [`Registry::register_layout`](crate::Registry::register_layout).
pub trait HasLayout {
	fn layout() -> LayoutTable;
}

/// Callback producing the layout table of a type.
pub type LayoutCallback = fn() -> LayoutTable;

/// Pointer width of the current build.
pub const NATIVE_PTR_WIDTH: usize = mem::size_of::<usize>();
