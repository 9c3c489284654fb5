use std::{
	borrow::Cow,
	collections::{HashMap, HashSet},
	mem,
	ptr::NonNull,
};

use super::{
	format::{
		read_layout, Cursor, DirEntry, Endian, Header, DIR_ENTRY_SIZE, MIN_EXTRA_BLOCK_SIZE, MIN_LAYOUT_SIZE,
		REFERENCE_SIZE,
	},
	AddressTable, ExtraBlock, ImportContext, LoadedGraph, ReadOptions, Reference,
};
use crate::{
	layout::{convert::ConversionPlan, verify::diff_layouts, LayoutTable, NATIVE_PTR_WIDTH},
	storage::{AlignedBuf, DEFAULT_ALIGNMENT},
	Diagnostic, DiagnosticKind, Diagnostics, Error, ObjectFlags, ObjectHeader, ObjectSerializer,
	ReferenceKind, Registry, Result, TypeTag,
};

/// Reconstruct objects from a binary stream.
///
/// All objects are constructed inside one buffer, sized from the stream's
/// directory before anything is placed in it. Addresses for every object are
/// reserved before any object is constructed, so pointers can be resolved
/// regardless of order, including cycles.
///
/// Fails if the header is invalid or incompatible, if any object's type tag
/// is not registered, or if the stream is malformed. Subordinate objects
/// without exactly one owner are skipped and reported in the graph's
/// diagnostics. Pointers to them are null.
pub fn deserialize(registry: &Registry, bytes: &[u8], options: &ReadOptions) -> Result<LoadedGraph> {
	let mut diagnostics = Diagnostics::new();
	let StreamContents {
		header,
		layouts,
		entries,
		references,
	} = StreamContents::read(bytes)?;
	let ptr_width = header.ptr_width as usize;

	// Work out how to load each type
	let mut types: HashMap<TypeTag, TypePlan> = HashMap::new();
	for entry in &entries {
		if !types.contains_key(&entry.tag) {
			let embedded = layouts.iter().find(|(tag, _)| *tag == entry.tag).map(|(_, layout)| layout);
			let plan = TypePlan::new(registry, entry.tag, embedded, ptr_width, options, &mut diagnostics)?;
			types.insert(entry.tag, plan);
		}
	}

	// Records and extra-data blocks, located before anything is constructed
	let alignment = header.alignment as usize;
	let mut records = Vec::with_capacity(entries.len());
	for entry in &entries {
		let plan = &types[&entry.tag];
		if entry.ptrs_are_ids() && plan.layout.is_none() {
			return Err(Error::FormatMismatch(format!(
				"object {} ({}) needs a layout table to resolve its pointers, none available",
				entry.id, entry.tag
			)));
		}
		if !entry.ptrs_are_ids() && ptr_width != NATIVE_PTR_WIDTH {
			return Err(Error::FormatMismatch(format!(
				"raw record of object {} ({}) was written with {ptr_width}-byte pointers",
				entry.id, entry.tag
			)));
		}
		let (record, blocks) = locate_record(bytes, entry, alignment)?;
		let record = match &plan.conversion {
			Some(conversion) => Cow::Owned(conversion.apply(record, entry.id, &mut diagnostics)?),
			None => Cow::Borrowed(record),
		};
		records.push((record, blocks));
	}

	let constructed = check_subordinates(&entries, &references, &mut diagnostics);

	// Buffer size from directory: fixed-size state of every object and every
	// extra-data block, each with worst-case alignment padding
	let block_alignment = alignment.min(DEFAULT_ALIGNMENT);
	let mut size: usize = 0;
	for (entry, (_, blocks)) in entries.iter().zip(&records) {
		let plan = &types[&entry.tag];
		size = size
			.checked_add(plan.serializer.fixed_size() + plan.serializer.fixed_align())
			.and_then(|size| size.checked_add(blocks.iter().map(|b| b.len + block_alignment).sum()))
			.ok_or_else(|| Error::FormatMismatch("stream too large".into()))?;
	}
	let mut buffer = AlignedBuf::with_capacity(size)?;
	tracing::debug!(objects = entries.len(), buffer_size = buffer.capacity(), "allocated load buffer");

	// Pass 1: reserve address for every object
	let mut addresses = AddressTable {
		by_id: HashMap::with_capacity(entries.len()),
		by_original_addr: HashMap::with_capacity(entries.len()),
	};
	for entry in &entries {
		addresses.by_original_addr.insert(entry.original_addr, entry.id);
		let address = if constructed.contains(&entry.id) {
			let serializer = types[&entry.tag].serializer;
			let offset = buffer.alloc(serializer.fixed_size(), serializer.fixed_align())?;
			buffer.ptr_at(offset).as_ptr() as usize
		} else {
			0
		};
		addresses.by_id.insert(entry.id, address);
	}

	// Pass 2: construct objects in write order
	let mut objects = Vec::with_capacity(constructed.len());
	for (entry, (record, blocks)) in entries.iter().zip(&records) {
		if !constructed.contains(&entry.id) {
			continue;
		}
		let plan = &types[&entry.tag];
		let address = addresses.by_id[&entry.id];

		let mut record = record.to_vec();
		patch_header(&mut record, entry)?;

		let mut ctx = ImportContext::new(
			entry.tag,
			entry.id,
			&record,
			plan.layout,
			entry.ptrs_are_ids(),
			&addresses,
			&references,
			bytes,
			blocks,
			&mut buffer,
			block_alignment,
		);
		let address = NonNull::new(address as *mut u8)
			.ok_or_else(|| Error::FormatMismatch(format!("no address for object {}", entry.id)))?;
		// `address` was allocated in pass 1 with this serializer's size and alignment
		let mut object = unsafe { plan.serializer.create_object(address, &mut ctx)? };
		if ctx.remaining_extra_blocks() != 0 {
			return Err(Error::FormatMismatch(format!(
				"object {} ({}) left {} extra-data blocks unread",
				entry.id,
				entry.tag,
				ctx.remaining_extra_blocks()
			)));
		}

		// Object was just constructed, and nothing else refers to it yet
		unsafe { *object.as_mut().header_mut().flags_mut() = ObjectFlags::in_buffer() };
		objects.push((entry.id, object));
	}

	tracing::debug!(
		objects = objects.len(),
		skipped = entries.len() - objects.len(),
		diagnostics = diagnostics.len(),
		"deserialized graph"
	);
	Ok(LoadedGraph::new(objects, diagnostics, buffer))
}

/// Header, layout tables, directory and reference table of a stream.
///
/// Every count in the header is checked against the size of the stream before
/// anything is allocated from it, and every embedded layout table is
/// validated, so a corrupt stream fails here with [`Error::FormatMismatch`].
pub(crate) struct StreamContents {
	pub header: Header,
	/// Embedded layout tables, in stream order
	pub layouts: Vec<(TypeTag, LayoutTable)>,
	/// Directory, in write order
	pub entries: Vec<DirEntry>,
	pub references: Vec<Reference>,
}

impl StreamContents {
	pub fn read(bytes: &[u8]) -> Result<Self> {
		let mut cursor = Cursor::new(bytes);
		let header = Header::read(&mut cursor)?;
		if header.endian != Endian::NATIVE {
			return Err(Error::FormatMismatch(format!(
				"stream byte order {:?} does not match this platform",
				header.endian
			)));
		}
		// Records start aligned, so a stream is at least as long as its alignment
		if header.alignment as usize > bytes.len() {
			return Err(Error::FormatMismatch(format!(
				"alignment {} exceeds stream length {}",
				header.alignment,
				bytes.len()
			)));
		}
		let ptr_width = header.ptr_width as usize;

		cursor.check_count(header.layout_count, MIN_LAYOUT_SIZE, "layout tables")?;
		let mut layouts: Vec<(TypeTag, LayoutTable)> = Vec::with_capacity(header.layout_count as usize);
		for _ in 0..header.layout_count {
			let (tag, layout) = read_layout(&mut cursor)?;
			layout
				.validate(ptr_width)
				.map_err(|msg| Error::FormatMismatch(format!("embedded layout of {tag}: {msg}")))?;
			if layouts.iter().any(|(other, _)| *other == tag) {
				return Err(Error::FormatMismatch(format!("layout of {tag} embedded twice")));
			}
			layouts.push((tag, layout));
		}

		cursor.align(mem::align_of::<u64>());
		cursor.check_count(header.object_count, DIR_ENTRY_SIZE, "directory entries")?;
		let mut entries = Vec::with_capacity(header.object_count as usize);
		let mut seen_ids = HashSet::with_capacity(header.object_count as usize);
		for _ in 0..header.object_count {
			let entry = DirEntry::read(&mut cursor)?;
			if entry.id == 0 || !seen_ids.insert(entry.id) {
				return Err(Error::FormatMismatch(format!("invalid or duplicate identity {}", entry.id)));
			}
			entries.push(entry);
		}

		let references = read_references(bytes, &header)?;

		Ok(Self {
			header,
			layouts,
			entries,
			references,
		})
	}
}

/// How records of one type are loaded.
struct TypePlan<'r> {
	serializer: &'r dyn ObjectSerializer,
	/// Layout used to resolve pointer fields
	layout: Option<&'r LayoutTable>,
	/// Conversion from embedded to current layout, if they differ
	conversion: Option<ConversionPlan>,
}

impl<'r> TypePlan<'r> {
	fn new(
		registry: &'r Registry,
		tag: TypeTag,
		embedded: Option<&'r LayoutTable>,
		ptr_width: usize,
		options: &ReadOptions,
		diagnostics: &mut Diagnostics,
	) -> Result<Self> {
		let serializer = registry.serializer(tag).ok_or(Error::UnknownTypeTag(tag))?;
		if serializer.fixed_align() > DEFAULT_ALIGNMENT {
			return Err(Error::InvalidArgument(format!(
				"`{}` ({tag}) is aligned to {}, load buffer only to {DEFAULT_ALIGNMENT}",
				serializer.type_name(),
				serializer.fixed_align()
			)));
		}
		let current = registry.layout(tag);
		let must_convert = ptr_width != NATIVE_PTR_WIDTH;

		let (layout, conversion) = match (embedded, current) {
			(Some(embedded), Some(current)) if options.verify_layouts || must_convert => {
				let conversion = ConversionPlan::build(tag, embedded, ptr_width, current, NATIVE_PTR_WIDTH);
				if options.verify_layouts {
					for diff in diff_layouts(tag, embedded, ptr_width, current, NATIVE_PTR_WIDTH) {
						diagnostics.push(diff);
					}
				} else {
					for note in conversion.notes() {
						diagnostics.push(note.clone());
					}
				}
				let conversion = (!conversion.is_identity()).then_some(conversion);
				(Some(current), conversion)
			}
			(Some(_), None) if must_convert => {
				return Err(Error::FormatMismatch(format!(
					"{tag} was written with {ptr_width}-byte pointers and has no layout in this build"
				)))
			}
			(Some(embedded), None) => {
				if options.verify_layouts {
					diagnostics.push(Diagnostic::new(
						DiagnosticKind::LayoutMismatch,
						tag,
						format!("no layout registered for `{}`, using layout from data", embedded.type_name),
					));
				}
				(Some(embedded), None)
			}
			(None, _) if must_convert => {
				return Err(Error::FormatMismatch(format!(
					"{tag} was written with {ptr_width}-byte pointers and its layout was not embedded"
				)))
			}
			(_, current) => (current, None),
		};

		// Pointer fields are re-pointed inside the constructed object, so the
		// layout used must describe an object of exactly its size
		if let Some(layout) = layout {
			if layout.size != serializer.fixed_size() {
				return Err(Error::FormatMismatch(format!(
					"layout of {tag} is {} bytes, `{}` is {}",
					layout.size,
					serializer.type_name(),
					serializer.fixed_size()
				)));
			}
		}

		Ok(Self {
			serializer,
			layout,
			conversion,
		})
	}
}

fn read_references(bytes: &[u8], header: &Header) -> Result<Vec<Reference>> {
	let offset = usize::try_from(header.references_offset)
		.map_err(|_| Error::FormatMismatch("reference table out of bounds".into()))?;
	let mut cursor = Cursor::at(bytes, offset);
	cursor.check_count(header.reference_count, REFERENCE_SIZE, "references")?;
	let mut references = Vec::with_capacity(header.reference_count as usize);
	for _ in 0..header.reference_count {
		let start = cursor.pos();
		let source = cursor.u64()?;
		let kind = ReferenceKind(cursor.u32()?);
		cursor.u32()?;
		let target = cursor.u64()?;
		cursor.u64()?;
		debug_assert_eq!(cursor.pos() - start, REFERENCE_SIZE);
		references.push(Reference {
			source,
			kind,
			target,
		});
	}
	Ok(references)
}

/// Get record's fixed-size state, and locate its extra-data blocks.
pub(crate) fn locate_record<'b>(
	bytes: &'b [u8],
	entry: &DirEntry,
	alignment: usize,
) -> Result<(&'b [u8], Vec<ExtraBlock>)> {
	let offset = usize::try_from(entry.record_offset)
		.map_err(|_| Error::FormatMismatch(format!("record of object {} out of bounds", entry.id)))?;
	let mut cursor = Cursor::at(bytes, offset);
	let record = cursor.bytes(entry.record_size as usize)?;

	cursor.check_count(entry.extra_count, MIN_EXTRA_BLOCK_SIZE, "extra-data blocks")?;
	let mut blocks = Vec::with_capacity(entry.extra_count as usize);
	let mut total = 0u64;
	for _ in 0..entry.extra_count {
		cursor.align(mem::align_of::<u64>());
		let len = usize::try_from(cursor.u64()?)
			.map_err(|_| Error::FormatMismatch(format!("extra data of object {} too large", entry.id)))?;
		cursor.align(alignment);
		let offset = cursor.pos();
		cursor.bytes(len)?;
		blocks.push(ExtraBlock { offset, len });
		total += len as u64;
	}
	if total != entry.extra_bytes {
		return Err(Error::FormatMismatch(format!(
			"extra data of object {} is {total} bytes, directory says {}",
			entry.id, entry.extra_bytes
		)));
	}

	Ok((record, blocks))
}

/// Find which objects can be constructed.
///
/// A subordinate object needs exactly one owner: a constructed object other
/// than itself which references it. Skipping one subordinate can leave
/// another without its owner, so repeat until nothing changes.
fn check_subordinates(
	entries: &[DirEntry],
	references: &[Reference],
	diagnostics: &mut Diagnostics,
) -> HashSet<u64> {
	let mut constructed: HashSet<u64> = entries.iter().map(|e| e.id).collect();

	loop {
		let mut changed = false;
		for entry in entries.iter().filter(|e| e.is_subordinate()) {
			if !constructed.contains(&entry.id) {
				continue;
			}
			let owners: HashSet<u64> = references
				.iter()
				.filter(|r| {
					r.target == entry.id
						&& r.source != entry.id
						&& r.kind == ReferenceKind::OBJECT
						&& constructed.contains(&r.source)
				})
				.map(|r| r.source)
				.collect();
			if owners.len() != 1 {
				constructed.remove(&entry.id);
				changed = true;
				diagnostics.push(
					Diagnostic::new(
						DiagnosticKind::SubordinateWithoutOwner,
						entry.tag,
						format!("subordinate object has {} owners, not constructed", owners.len()),
					)
					.with_id(entry.id),
				);
			}
		}
		if !changed {
			return constructed;
		}
	}
}

/// Set header of record to object's tag, flagged as living in a load buffer.
fn patch_header(record: &mut [u8], entry: &DirEntry) -> Result<()> {
	let header_size = mem::size_of::<ObjectHeader>();
	if record.len() < header_size {
		return Err(Error::FormatMismatch(format!(
			"record of object {} is smaller than an object header",
			entry.id
		)));
	}
	record[..4].copy_from_slice(&entry.tag.get().to_ne_bytes());
	record[4..header_size].copy_from_slice(&ObjectFlags::in_buffer().bits().to_ne_bytes());
	Ok(())
}

const _: () = assert!(mem::size_of::<ObjectHeader>() == 8);
