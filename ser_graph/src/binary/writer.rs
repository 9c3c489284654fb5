use std::{
	collections::{HashMap, HashSet, VecDeque},
	mem, slice,
};

use super::{
	format::{
		to_u32, write_layout, DirEntry, Endian, Header, DIR_ENTRY_SIZE, FLAG_LAYOUTS,
		RECORD_PTRS_ARE_IDS, RECORD_SUBORDINATE, REFERENCE_SIZE, VERSION,
	},
	ExportContext, Reference, ReferenceContext, WriteOptions,
};
use crate::{
	layout::{convert::write_uint, FieldKind, LayoutTable, NATIVE_PTR_WIDTH},
	storage::ByteStorage,
	Collection, Diagnostic, DiagnosticKind, Diagnostics, Error, ObjectHeader, ObjectSerializer,
	ReferenceKind, Registry, Result, Serializable, TypeTag,
};

/// Serialize every object reachable from `collection`'s members.
///
/// Returns the stream, and diagnostics about objects which will not load
/// cleanly (subordinate objects without exactly one owner).
///
/// Fails if any object's type has no registered serializer, if a reference is
/// registered to an object outside the graph, or if a pointer field points to
/// an object which its owner didn't register a reference to.
pub fn serialize(
	registry: &Registry,
	collection: &Collection<'_>,
	options: &WriteOptions,
) -> Result<(Vec<u8>, Diagnostics)> {
	options.validate()?;
	let mut diagnostics = Diagnostics::new();

	let graph = Graph::walk(registry, collection)?;
	let references = graph.references(registry)?;
	check_subordinates(registry, &graph, &references, &mut diagnostics)?;

	// Layout tables for every type in the graph, in order of first appearance
	let mut layouts: Vec<(TypeTag, &LayoutTable)> = Vec::new();
	for &(_, object) in &graph.order {
		let tag = object.type_tag();
		if layouts.iter().all(|&(t, _)| t != tag) {
			if let Some(layout) = registry.layout(tag) {
				layouts.push((tag, layout));
			}
		}
	}
	let embedded: &[(TypeTag, &LayoutTable)] = if options.embed_layouts { &layouts } else { &[] };

	let mut stream = StreamWriter::new(options.alignment, NATIVE_PTR_WIDTH, graph.order.len(), embedded)?;

	// Identities each object registered a reference to
	let mut targets: HashMap<u64, HashSet<u64>> = HashMap::new();
	for reference in &references {
		targets.entry(reference.source).or_default().insert(reference.target);
	}
	let no_targets = HashSet::new();

	for &(id, object) in &graph.order {
		let tag = object.type_tag();
		let serializer = serializer_for(registry, tag)?;
		let layout = registry.layout(tag);
		let size = serializer.fixed_size();
		if size < mem::size_of::<ObjectHeader>() {
			return Err(Error::InvalidArgument(format!(
				"`{}` ({tag}) is smaller than an object header",
				serializer.type_name()
			)));
		}

		let mut flags = 0;
		if serializer.is_subordinate(object)? {
			flags |= RECORD_SUBORDINATE;
		}
		let fixed = match layout {
			Some(layout) => {
				if layout.size != size {
					return Err(Error::InvalidArgument(format!(
						"layout of `{}` ({tag}) is {} bytes, type is {size}",
						serializer.type_name(),
						layout.size
					)));
				}
				flags |= RECORD_PTRS_ARE_IDS;
				let registered = targets.get(&id).unwrap_or(&no_targets);
				// Serializer guarantees `object` is `size` bytes, as described by `layout`
				unsafe { layout_record(object, id, layout, &graph.ids, registered)? }
			}
			// Type without layout table is written raw. Pointer fields keep their
			// original addresses, which the reader maps back to identities.
			None => {
				let pointers = serializer.raw_pointers(object)?.ok_or_else(|| {
					Error::InvalidArgument(format!(
						"`{}` ({tag}) has no layout table and doesn't report its pointers",
						serializer.type_name()
					))
				})?;
				let registered = targets.get(&id).unwrap_or(&no_targets);
				check_raw_pointers(object, id, &pointers, &graph.ids, registered)?;
				// Serializer guarantees `object` is `size` bytes
				unsafe { object_bytes(object, size) }.to_vec()
			}
		};

		stream.write_record(tag, flags, id, object.addr() as u64, &fixed, |ctx| {
			serializer.export_extra_data(object, ctx)
		})?;
	}

	let bytes = stream.finish(&references)?;
	tracing::debug!(
		objects = graph.order.len(),
		references = references.len(),
		bytes = bytes.len(),
		"serialized graph"
	);
	Ok((bytes, diagnostics))
}

fn serializer_for(registry: &Registry, tag: TypeTag) -> Result<&dyn ObjectSerializer> {
	registry.serializer(tag).ok_or(Error::UnregisteredType(tag))
}

/// All objects reachable from a collection, with their identities.
struct Graph<'c> {
	/// `(identity, object)` in write order
	order: Vec<(u64, &'c dyn Serializable)>,
	/// Object address -> identity
	ids: HashMap<usize, u64>,
}

impl<'c> Graph<'c> {
	/// Breadth-first walk from each collection member in turn.
	///
	/// Collection members keep their identities. Objects reached only as
	/// dependencies get fresh identities above the collection's highest.
	fn walk(registry: &Registry, collection: &Collection<'c>) -> Result<Self> {
		let mut order = Vec::with_capacity(collection.len());
		let mut ids = HashMap::with_capacity(collection.len());
		let mut next_id = collection.max_id() + 1;
		let mut queue = VecDeque::new();

		for (root_id, root) in collection.iter() {
			if ids.contains_key(&root.addr()) {
				continue;
			}
			ids.insert(root.addr(), root_id);
			queue.push_back((root_id, root));

			while let Some((id, object)) = queue.pop_front() {
				order.push((id, object));
				let serializer = serializer_for(registry, object.type_tag())?;
				for dep in serializer.enumerate_dependencies(object)? {
					if ids.contains_key(&dep.addr()) {
						continue;
					}
					let dep_id = match collection.id_of(dep) {
						Some(dep_id) => dep_id,
						None => {
							let dep_id = next_id;
							next_id += 1;
							dep_id
						}
					};
					ids.insert(dep.addr(), dep_id);
					queue.push_back((dep_id, dep));
				}
			}
		}

		Ok(Self { order, ids })
	}

	fn references(&self, registry: &Registry) -> Result<Vec<Reference>> {
		let mut references = Vec::new();
		for &(id, object) in &self.order {
			let tag = object.type_tag();
			let mut ctx = ReferenceContext::new(&self.ids, tag, id, &mut references);
			serializer_for(registry, tag)?.register_references(object, &mut ctx)?;
		}
		Ok(references)
	}
}

/// Warn about subordinate objects which are not the target of object
/// references from exactly one other object. They will fail to load.
fn check_subordinates(
	registry: &Registry,
	graph: &Graph<'_>,
	references: &[Reference],
	diagnostics: &mut Diagnostics,
) -> Result<()> {
	for &(id, object) in &graph.order {
		if !serializer_for(registry, object.type_tag())?.is_subordinate(object)? {
			continue;
		}

		let owners: HashSet<u64> = references
			.iter()
			.filter(|r| r.target == id && r.source != id && r.kind == ReferenceKind::OBJECT)
			.map(|r| r.source)
			.collect();
		if owners.len() != 1 {
			diagnostics.push(
				Diagnostic::new(
					DiagnosticKind::SubordinateWithoutOwner,
					object.type_tag(),
					format!("subordinate object has {} owners, will not load", owners.len()),
				)
				.with_id(id),
			);
		}
	}
	Ok(())
}

/// Get bytes of an object's fixed-size state.
///
/// # Safety
///
/// `object` must be at least `size` bytes, all initialized.
unsafe fn object_bytes(object: &dyn Serializable, size: usize) -> &[u8] {
	let base = object as *const _ as *const u8;
	slice::from_raw_parts(base, size)
}

/// Check every non-null pointer of a raw record targets an object in the
/// graph which its owner registered a reference to.
fn check_raw_pointers(
	object: &dyn Serializable,
	id: u64,
	pointers: &[(&'static str, usize)],
	ids: &HashMap<usize, u64>,
	registered: &HashSet<u64>,
) -> Result<()> {
	for &(field, addr) in pointers.iter().filter(|&&(_, addr)| addr != 0) {
		let target = ids.get(&addr);
		if !target.is_some_and(|target| registered.contains(target)) {
			return Err(Error::DanglingPointer {
				tag: object.type_tag(),
				id,
				field: field.to_owned(),
			});
		}
	}
	Ok(())
}

/// Build record for an object with a layout table.
///
/// Header and plain fields are copied. Object pointers are replaced by the
/// identity of their target. Extra-data pointers and padding are zeroed.
///
/// # Safety
///
/// `object` must be of the type `layout` describes.
unsafe fn layout_record(
	object: &dyn Serializable,
	id: u64,
	layout: &LayoutTable,
	ids: &HashMap<usize, u64>,
	registered: &HashSet<u64>,
) -> Result<Vec<u8>> {
	let base = object as *const _ as *const u8;
	let mut record = vec![0u8; layout.size];

	let header_size = mem::size_of::<ObjectHeader>();
	record[..header_size].copy_from_slice(slice::from_raw_parts(base, header_size));

	for field in &layout.fields {
		let dst = &mut record[field.offset..field.end()];
		match field.kind {
			FieldKind::Plain => {
				dst.copy_from_slice(slice::from_raw_parts(base.add(field.offset), field.size));
			}
			FieldKind::ObjectPtr => {
				let addr = base.add(field.offset).cast::<usize>().read_unaligned();
				if addr == 0 {
					continue;
				}
				let dangling = || Error::DanglingPointer {
					tag: object.type_tag(),
					id,
					field: field.name.clone(),
				};
				let target = *ids.get(&addr).ok_or_else(dangling)?;
				if !registered.contains(&target) {
					return Err(dangling());
				}
				if !write_uint(dst, target)? {
					return Err(Error::InvalidArgument(format!(
						"identity {target} does not fit in a {}-byte pointer",
						field.size
					)));
				}
			}
			FieldKind::ExtraPtr | FieldKind::ExtraArray { .. } => {}
		}
	}

	Ok(record)
}

/// Assembles a stream: header, layout tables, directory, records, reference
/// table. Directory and header are patched once all records are written.
pub(crate) struct StreamWriter {
	out: ByteStorage,
	alignment: usize,
	ptr_width: usize,
	flags: u32,
	layout_count: u32,
	object_count: usize,
	directory_pos: usize,
	records_pos: usize,
	entries: Vec<DirEntry>,
}

impl StreamWriter {
	pub fn new(
		alignment: usize,
		ptr_width: usize,
		object_count: usize,
		layouts: &[(TypeTag, &LayoutTable)],
	) -> Result<Self> {
		let mut out = ByteStorage::with_capacity(4096);

		// Header is patched in `finish`
		out.push_zeros(super::format::HEADER_SIZE);
		for &(tag, layout) in layouts {
			write_layout(&mut out, tag, layout)?;
		}
		out.align(mem::align_of::<u64>());
		let directory_pos = out.pos();
		out.push_zeros(object_count * DIR_ENTRY_SIZE);
		out.align(alignment.max(mem::align_of::<u64>()));
		let records_pos = out.pos();

		Ok(Self {
			out,
			alignment,
			ptr_width,
			flags: if layouts.is_empty() { 0 } else { FLAG_LAYOUTS },
			layout_count: to_u32(layouts.len())?,
			object_count,
			directory_pos,
			records_pos,
			entries: Vec::with_capacity(object_count),
		})
	}

	/// Write one object record: fixed-size state, then extra-data blocks
	/// written by `export`.
	pub fn write_record<F>(
		&mut self,
		tag: TypeTag,
		flags: u32,
		id: u64,
		original_addr: u64,
		fixed: &[u8],
		export: F,
	) -> Result<()>
	where
		F: FnOnce(&mut ExportContext<'_>) -> Result<()>,
	{
		if self.entries.len() == self.object_count {
			return Err(Error::InvalidArgument("more records than declared".into()));
		}

		self.out.align(self.alignment.max(mem::align_of::<u64>()));
		let record_offset = self.out.pos() as u64;
		self.out.push_bytes(fixed);

		let mut ctx = ExportContext::new(&mut self.out, self.alignment);
		export(&mut ctx)?;
		let (extra_count, extra_bytes) = ctx.totals();

		tracing::trace!(
			tag = tag.get(),
			id,
			offset = record_offset,
			size = fixed.len(),
			extra_count,
			"wrote record"
		);

		self.entries.push(DirEntry {
			tag,
			flags,
			id,
			original_addr,
			record_offset,
			record_size: to_u32(fixed.len())?,
			extra_count,
			extra_bytes,
		});
		Ok(())
	}

	/// Write reference table, patch header and directory, and return the
	/// complete stream.
	pub fn finish(mut self, references: &[Reference]) -> Result<Vec<u8>> {
		if self.entries.len() != self.object_count {
			return Err(Error::InvalidArgument(format!(
				"{} records written, {} declared",
				self.entries.len(),
				self.object_count
			)));
		}

		let offsets: HashMap<u64, u64> = self.entries.iter().map(|e| (e.id, e.record_offset)).collect();

		self.out.align(mem::align_of::<u64>());
		let references_pos = self.out.pos();
		for reference in references {
			let target_offset = offsets.get(&reference.target).copied().unwrap_or(0);
			self.out.push_u64(reference.source);
			self.out.push_u32(reference.kind.0);
			self.out.push_u32(0);
			self.out.push_u64(reference.target);
			self.out.push_u64(target_offset);
		}
		debug_assert_eq!(self.out.pos() - references_pos, references.len() * REFERENCE_SIZE);

		let mut directory = ByteStorage::with_capacity(self.entries.len() * DIR_ENTRY_SIZE);
		for entry in &self.entries {
			entry.write(&mut directory);
		}
		self.out.write_at(self.directory_pos, directory.as_slice());

		let mut header = ByteStorage::with_capacity(super::format::HEADER_SIZE);
		Header {
			version: VERSION,
			endian: Endian::NATIVE,
			ptr_width: self.ptr_width as u8,
			alignment: to_u32(self.alignment)?,
			flags: self.flags,
			object_count: to_u32(self.object_count)?,
			layout_count: self.layout_count,
			reference_count: to_u32(references.len())?,
			records_offset: self.records_pos as u64,
			references_offset: references_pos as u64,
		}
		.write(&mut header);
		self.out.write_at(0, header.as_slice());

		Ok(self.out.into_vec())
	}
}
