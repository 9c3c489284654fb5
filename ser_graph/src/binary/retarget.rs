//! Rewriting a stream for a build with different layouts or pointer width.

use std::collections::HashMap;

use super::{
	reader::{locate_record, StreamContents},
	writer::StreamWriter,
};
use crate::{
	layout::{convert::ConversionPlan, LayoutTable, NATIVE_PTR_WIDTH},
	Diagnostics, Error, Registry, Result, TypeTag,
};

/// Layout tables and pointer width of the build a stream is retargeted for.
#[derive(Clone, Debug)]
pub struct TargetLayouts {
	pub ptr_width: usize,
	pub layouts: HashMap<TypeTag, LayoutTable>,
}

impl TargetLayouts {
	/// Empty set of layouts for a target with pointer width `ptr_width`.
	pub fn new(ptr_width: usize) -> Self {
		Self {
			ptr_width,
			layouts: HashMap::new(),
		}
	}

	/// Layouts registered in this build.
	pub fn native(registry: &Registry) -> Self {
		Self {
			ptr_width: NATIVE_PTR_WIDTH,
			layouts: registry.layouts().map(|(tag, layout)| (tag, layout.clone())).collect(),
		}
	}

	pub fn with_layout(mut self, tag: TypeTag, layout: LayoutTable) -> Self {
		self.layouts.insert(tag, layout);
		self
	}
}

/// Convert a stream into the layouts of `target`.
///
/// Every record must be described by a layout table embedded in the stream.
/// Target layouts must be valid for the target's pointer width.
/// Records of types with a target layout are converted to it; others are
/// kept as they are, which is only possible if pointer width is unchanged.
/// Extra data is copied unchanged.
///
/// Output embeds the target layouts. Returns it with a diagnostic for every
/// field which could not be converted safely.
pub fn retarget(bytes: &[u8], target: &TargetLayouts) -> Result<(Vec<u8>, Diagnostics)> {
	if target.ptr_width != 4 && target.ptr_width != 8 {
		return Err(Error::InvalidArgument(format!("invalid pointer width {}", target.ptr_width)));
	}
	for (tag, layout) in &target.layouts {
		layout
			.validate(target.ptr_width)
			.map_err(|msg| Error::InvalidArgument(format!("target layout of {tag}: {msg}")))?;
	}

	let mut diagnostics = Diagnostics::new();
	let StreamContents {
		header,
		layouts: embedded,
		entries,
		references,
	} = StreamContents::read(bytes)?;
	if !header.has_layouts() {
		return Err(Error::FormatMismatch("stream has no embedded layouts to retarget from".into()));
	}
	let src_ptr_width = header.ptr_width as usize;

	// Conversion plan and output layout for each type
	let mut plans: HashMap<TypeTag, ConversionPlan> = HashMap::new();
	let mut out_layouts: Vec<(TypeTag, &LayoutTable)> = Vec::with_capacity(embedded.len());
	for (tag, src) in &embedded {
		match target.layouts.get(tag) {
			Some(dst) => {
				let plan = ConversionPlan::build(*tag, src, src_ptr_width, dst, target.ptr_width);
				for note in plan.notes() {
					diagnostics.push(note.clone());
				}
				plans.insert(*tag, plan);
				out_layouts.push((*tag, dst));
			}
			None if src_ptr_width == target.ptr_width => out_layouts.push((*tag, src)),
			None => {
				return Err(Error::FormatMismatch(format!(
					"no target layout for {tag}, cannot change its pointer width"
				)))
			}
		}
	}

	for entry in &entries {
		if !entry.ptrs_are_ids() || !embedded.iter().any(|(tag, _)| *tag == entry.tag) {
			return Err(Error::FormatMismatch(format!(
				"object {} ({}) has no embedded layout, cannot retarget",
				entry.id, entry.tag
			)));
		}
	}

	let alignment = header.alignment as usize;
	let mut stream = StreamWriter::new(alignment, target.ptr_width, entries.len(), &out_layouts)?;
	for entry in &entries {
		let (record, blocks) = locate_record(bytes, entry, alignment)?;
		let record = match plans.get(&entry.tag) {
			Some(plan) => plan.apply(record, entry.id, &mut diagnostics)?,
			None => record.to_vec(),
		};

		stream.write_record(entry.tag, entry.flags, entry.id, entry.original_addr, &record, |ctx| {
			for block in &blocks {
				// Located within `bytes` by `locate_record`
				ctx.export_extra_data(&bytes[block.offset..block.offset + block.len]);
			}
			Ok(())
		})?;
	}

	let out = stream.finish(&references)?;
	tracing::debug!(
		objects = entries.len(),
		from_ptr_width = src_ptr_width,
		to_ptr_width = target.ptr_width,
		diagnostics = diagnostics.len(),
		"retargeted stream"
	);
	Ok((out, diagnostics))
}
