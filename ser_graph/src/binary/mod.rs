//! Binary serialization engine.
//!
//! [`serialize`] walks the dependency graph from a [`Collection`]'s members
//! and writes every reachable object once, in first-discovered order.
//! [`deserialize`] reconstructs the objects in place inside a single
//! [`AlignedBuf`] arena, owned by the returned [`LoadedGraph`].
//!
//! Stream layout is described in [`format`].

use std::{io, ptr::NonNull};

use crate::{storage::AlignedBuf, Collection, Diagnostics, Error, Result, Serializable};

mod context;
pub mod format;
mod reader;
mod retarget;
mod writer;

pub use context::{ExportContext, ImportContext, Reference, ReferenceContext};
pub(crate) use context::{AddressTable, ExtraBlock};
pub use reader::deserialize;
pub use retarget::{retarget, TargetLayouts};
pub use writer::serialize;

use crate::storage::DEFAULT_ALIGNMENT;

/// Options for writing a binary stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteOptions {
	/// Alignment of extra-data blocks and of object records.
	/// Must be a power of 2.
	pub alignment: usize,
	/// Embed layout tables, so a reader can verify and convert records.
	pub embed_layouts: bool,
}

impl Default for WriteOptions {
	fn default() -> Self {
		Self {
			alignment: DEFAULT_ALIGNMENT,
			embed_layouts: true,
		}
	}
}

impl WriteOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_alignment(mut self, alignment: usize) -> Self {
		self.alignment = alignment;
		self
	}

	pub fn with_embed_layouts(mut self, embed_layouts: bool) -> Self {
		self.embed_layouts = embed_layouts;
		self
	}

	pub(crate) fn validate(&self) -> Result<()> {
		if !self.alignment.is_power_of_two() || self.alignment > u32::MAX as usize {
			return Err(Error::InvalidArgument(format!(
				"alignment {} is not a power of 2",
				self.alignment
			)));
		}
		Ok(())
	}
}

/// Options for reading a binary stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadOptions {
	/// Compare embedded layout tables against the registered ones, reporting
	/// differences and converting records which differ.
	///
	/// Default: on in debug builds, off in release builds.
	pub verify_layouts: bool,
}

impl Default for ReadOptions {
	fn default() -> Self {
		Self {
			verify_layouts: cfg!(debug_assertions),
		}
	}
}

impl ReadOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_verify_layouts(mut self, verify_layouts: bool) -> Self {
		self.verify_layouts = verify_layouts;
		self
	}
}

/// Write binary stream to an `io::Write`.
pub fn serialize_to<W: io::Write>(
	registry: &crate::Registry,
	collection: &Collection<'_>,
	options: &WriteOptions,
	out: &mut W,
) -> Result<Diagnostics> {
	let (bytes, diagnostics) = serialize(registry, collection, options)?;
	out.write_all(&bytes)?;
	Ok(diagnostics)
}

/// Read binary stream from an `io::Read`.
pub fn deserialize_from<R: io::Read>(
	registry: &crate::Registry,
	input: &mut R,
	options: &ReadOptions,
) -> Result<LoadedGraph> {
	let mut bytes = Vec::new();
	input.read_to_end(&mut bytes)?;
	deserialize(registry, &bytes, options)
}

/// Objects reconstructed from a binary stream, and the buffer they live in.
///
/// Objects are flagged as not owning their memory. They're never dropped
/// individually: dropping the `LoadedGraph` releases the whole buffer at
/// once, and any `Drop` impls of the objects' types do not run.
///
/// References to objects borrow the `LoadedGraph`, so it can't be dropped
/// while any of them is still in use.
pub struct LoadedGraph {
	/// `(identity, object)` in write order. Objects point into `buffer`.
	objects: Vec<(u64, NonNull<dyn Serializable>)>,
	diagnostics: Diagnostics,
	buffer: AlignedBuf,
}

impl LoadedGraph {
	pub(crate) fn new(
		objects: Vec<(u64, NonNull<dyn Serializable>)>,
		diagnostics: Diagnostics,
		buffer: AlignedBuf,
	) -> Self {
		Self {
			objects,
			diagnostics,
			buffer,
		}
	}

	/// Number of objects reconstructed.
	#[inline]
	pub fn len(&self) -> usize {
		self.objects.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}

	pub fn get(&self, id: u64) -> Option<&dyn Serializable> {
		self
			.objects
			.iter()
			.find(|(obj_id, _)| *obj_id == id)
			// Objects live in `buffer`, which lives as long as `self`
			.map(|(_, ptr)| unsafe { ptr.as_ref() })
	}

	pub fn get_mut(&mut self, id: u64) -> Option<&mut dyn Serializable> {
		self
			.objects
			.iter_mut()
			.find(|(obj_id, _)| *obj_id == id)
			// `&mut self` guarantees no other reference to the object is live
			.map(|(_, ptr)| unsafe { ptr.as_mut() })
	}

	/// Iterate over `(identity, object)` pairs, in write order.
	pub fn iter(&self) -> impl Iterator<Item = (u64, &dyn Serializable)> + '_ {
		self
			.objects
			.iter()
			.map(|(id, ptr)| (*id, unsafe { ptr.as_ref() }))
	}

	/// Collection of all reconstructed objects, with their original
	/// identities, in write order.
	pub fn collection(&self) -> Collection<'_> {
		let mut collection = Collection::new();
		for (id, object) in self.iter() {
			collection.insert_loaded(id, object);
		}
		collection
	}

	/// Non-fatal problems found while loading.
	#[inline]
	pub fn diagnostics(&self) -> &Diagnostics {
		&self.diagnostics
	}

	/// Size of the load buffer in bytes.
	#[inline]
	pub fn buffer_size(&self) -> usize {
		self.buffer.capacity()
	}

	/// Whether an object lives in this graph's load buffer.
	#[inline]
	pub fn contains(&self, object: &dyn Serializable) -> bool {
		self.buffer.contains_addr(object.addr())
	}
}

impl std::fmt::Debug for LoadedGraph {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LoadedGraph")
			.field("objects", &self.objects.len())
			.field("buffer_size", &self.buffer.capacity())
			.field("diagnostics", &self.diagnostics.len())
			.finish()
	}
}
