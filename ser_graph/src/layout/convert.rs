//! Conversion of fixed-size records between two layouts of the same type.
//!
//! Fields are matched by name:
//!
//! * Plain fields of equal size are copied.
//! * Plain integer-sized fields (1, 2, 4 or 8 bytes) of different sizes are
//!   zero-extended or truncated.
//! * Other plain fields of different sizes are copied as far as the shorter
//!   one goes, and zero-padded.
//! * Object pointer fields (which hold target identities) are converted
//!   between pointer widths.
//! * Extra-data pointer fields are zeroed. They're re-pointed on load.
//! * Fields only in the source are dropped. Fields only in the target, or
//!   whose kind differs, are zero-filled.
//!
//! Every conversion which may lose data is reported.

use std::ops::Range;

use super::{FieldKind, LayoutTable};
use crate::{Diagnostic, DiagnosticKind, Diagnostics, Error, Result, TypeTag};

#[derive(Clone, Debug)]
enum Step {
	Copy {
		src: usize,
		dst: usize,
		len: usize,
	},
	Resize {
		src: usize,
		src_len: usize,
		dst: usize,
		dst_len: usize,
	},
	Pointer {
		field: String,
		src: usize,
		src_width: usize,
		dst: usize,
		dst_width: usize,
	},
}

/// Precomputed plan for converting records of one type from a source layout
/// to a destination layout.
#[derive(Clone, Debug)]
pub struct ConversionPlan {
	tag: TypeTag,
	src_size: usize,
	dst_size: usize,
	steps: Vec<Step>,
	notes: Vec<Diagnostic>,
}

impl ConversionPlan {
	/// Build plan for converting records laid out per `src` (on a platform with
	/// pointer width `src_ptr_width`) into `dst` layout (pointer width
	/// `dst_ptr_width`).
	pub fn build(
		tag: TypeTag,
		src: &LayoutTable,
		src_ptr_width: usize,
		dst: &LayoutTable,
		dst_ptr_width: usize,
	) -> Self {
		let mut steps = Vec::with_capacity(dst.fields.len());
		let mut notes = Vec::new();
		let mut note = |field: &str, message: String| {
			notes.push(Diagnostic::new(DiagnosticKind::LayoutMismatch, tag, message).with_field(field));
		};

		for field in &dst.fields {
			let Some(old) = src.get(&field.name) else {
				note(&field.name, "field absent from source layout, zero-filled".into());
				continue;
			};

			if old.kind != field.kind {
				note(
					&field.name,
					format!("cannot convert {} to {}, value dropped", old.kind, field.kind),
				);
				continue;
			}

			match &field.kind {
				FieldKind::Plain => {
					if old.size == field.size {
						steps.push(Step::Copy {
							src: old.offset,
							dst: field.offset,
							len: field.size,
						});
					} else if is_int_size(old.size) && is_int_size(field.size) {
						if field.size < old.size {
							note(
								&field.name,
								format!("integer narrowed from {} to {} bytes", old.size, field.size),
							);
						}
						steps.push(Step::Resize {
							src: old.offset,
							src_len: old.size,
							dst: field.offset,
							dst_len: field.size,
						});
					} else {
						note(
							&field.name,
							format!(
								"size changed from {} to {} bytes, copied {} bytes",
								old.size,
								field.size,
								old.size.min(field.size)
							),
						);
						steps.push(Step::Copy {
							src: old.offset,
							dst: field.offset,
							len: old.size.min(field.size),
						});
					}
				}
				FieldKind::ObjectPtr => steps.push(Step::Pointer {
					field: field.name.clone(),
					src: old.offset,
					src_width: src_ptr_width.min(old.size),
					dst: field.offset,
					dst_width: dst_ptr_width.min(field.size),
				}),
				// Extra-data pointers are meaningless outside a load buffer. Leave zeroed.
				FieldKind::ExtraPtr | FieldKind::ExtraArray { .. } => {}
			}
		}

		for old in &src.fields {
			if dst.get(&old.name).is_none() {
				note(&old.name, "field absent from target layout, dropped".into());
			}
		}

		Self {
			tag,
			src_size: src.size,
			dst_size: dst.size,
			steps,
			notes,
		}
	}

	/// Size of records this plan converts from.
	#[inline]
	pub fn src_size(&self) -> usize {
		self.src_size
	}

	/// Size of records this plan converts to.
	#[inline]
	pub fn dst_size(&self) -> usize {
		self.dst_size
	}

	/// Problems found building the plan (fields which will be dropped or
	/// altered). Same for every record the plan converts.
	pub fn notes(&self) -> &[Diagnostic] {
		&self.notes
	}

	/// Whether conversion is a plain copy.
	pub fn is_identity(&self) -> bool {
		self.src_size == self.dst_size
			&& self.notes.is_empty()
			&& self.steps.iter().all(|step| match step {
				Step::Copy { src, dst, .. } => src == dst,
				Step::Resize { .. } => false,
				Step::Pointer {
					src,
					src_width,
					dst,
					dst_width,
					..
				} => src == dst && src_width == dst_width,
			})
	}

	/// Convert one record.
	///
	/// Pointer values which don't fit in the destination pointer width are
	/// dropped (set to null), and reported in `diagnostics` against object
	/// `id`.
	///
	/// Layouts the plan was built from are expected to be validated. If they
	/// weren't, and a field lies outside its record, fails with
	/// [`Error::FormatMismatch`].
	pub fn apply(&self, src: &[u8], id: u64, diagnostics: &mut Diagnostics) -> Result<Vec<u8>> {
		if src.len() != self.src_size {
			return Err(Error::FormatMismatch(format!(
				"record of object {id} ({}) is {} bytes, layout says {}",
				self.tag,
				src.len(),
				self.src_size
			)));
		}

		let mut out = vec![0u8; self.dst_size];
		for step in &self.steps {
			match *step {
				Step::Copy { src: s, dst: d, len } => {
					let (s, d) = (self.range(s, len, self.src_size)?, self.range(d, len, self.dst_size)?);
					out[d].copy_from_slice(&src[s]);
				}
				Step::Resize {
					src: s,
					src_len,
					dst: d,
					dst_len,
				} => {
					let value = read_uint(&src[self.range(s, src_len, self.src_size)?])?;
					write_uint(&mut out[self.range(d, dst_len, self.dst_size)?], value)?;
				}
				Step::Pointer {
					ref field,
					src: s,
					src_width,
					dst: d,
					dst_width,
				} => {
					let value = read_uint(&src[self.range(s, src_width, self.src_size)?])?;
					let d = self.range(d, dst_width, self.dst_size)?;
					if !write_uint(&mut out[d.clone()], value)? {
						out[d].fill(0);
						diagnostics.push(
							Diagnostic::new(
								DiagnosticKind::LayoutMismatch,
								self.tag,
								format!("identity {value} does not fit in {dst_width}-byte pointer, dropped"),
							)
							.with_id(id)
							.with_field(field.as_str()),
						);
					}
				}
			}
		}

		Ok(out)
	}

	fn range(&self, offset: usize, len: usize, size: usize) -> Result<Range<usize>> {
		match offset.checked_add(len) {
			Some(end) if end <= size => Ok(offset..end),
			_ => Err(Error::FormatMismatch(format!(
				"field at offset {offset} of {len} bytes lies outside {size}-byte record of {}",
				self.tag
			))),
		}
	}
}

#[inline]
fn is_int_size(size: usize) -> bool {
	matches!(size, 1 | 2 | 4 | 8)
}

/// Read unsigned integer of 1, 2, 4 or 8 bytes, native byte order.
fn read_uint(bytes: &[u8]) -> Result<u64> {
	let value = match bytes.len() {
		1 => bytes[0] as u64,
		2 => u16::from_ne_bytes([bytes[0], bytes[1]]) as u64,
		4 => u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
		8 => {
			let mut buf = [0u8; 8];
			buf.copy_from_slice(bytes);
			u64::from_ne_bytes(buf)
		}
		len => return Err(unsupported_int(len)),
	};
	Ok(value)
}

/// Write unsigned integer of 1, 2, 4 or 8 bytes, native byte order.
/// Truncates if `value` doesn't fit, and returns `false` in that case.
pub(crate) fn write_uint(dst: &mut [u8], value: u64) -> Result<bool> {
	match dst.len() {
		1 => dst.copy_from_slice(&(value as u8).to_ne_bytes()),
		2 => dst.copy_from_slice(&(value as u16).to_ne_bytes()),
		4 => dst.copy_from_slice(&(value as u32).to_ne_bytes()),
		8 => dst.copy_from_slice(&value.to_ne_bytes()),
		len => return Err(unsupported_int(len)),
	}
	Ok(dst.len() == 8 || value >> (dst.len() * 8) == 0)
}

fn unsupported_int(len: usize) -> Error {
	Error::FormatMismatch(format!("unsupported integer size {len}"))
}

#[cfg(test)]
mod tests {
	use super::*;

	const TAG: TypeTag = TypeTag::user(7);

	fn record(fields: &[(usize, &[u8])], size: usize) -> Vec<u8> {
		let mut out = vec![0; size];
		for (offset, bytes) in fields {
			out[*offset..*offset + bytes.len()].copy_from_slice(bytes);
		}
		out
	}

	#[test]
	fn identical_layouts_copy() {
		let layout = LayoutTable::new("T", 8, 4)
			.field("a", 0, 4, FieldKind::Plain)
			.field("b", 4, 4, FieldKind::Plain);
		let plan = ConversionPlan::build(TAG, &layout, 8, &layout, 8);
		assert!(plan.is_identity());

		let src = record(&[(0, &1u32.to_ne_bytes()[..]), (4, &2u32.to_ne_bytes()[..])], 8);
		let mut diags = Diagnostics::new();
		assert_eq!(plan.apply(&src, 1, &mut diags).unwrap(), src);
		assert!(diags.is_empty());
	}

	#[test]
	fn reordered_and_padded() {
		let src_layout = LayoutTable::new("T", 8, 4)
			.field("a", 0, 4, FieldKind::Plain)
			.field("b", 4, 4, FieldKind::Plain);
		let dst_layout = LayoutTable::new("T", 16, 8)
			.field("b", 0, 4, FieldKind::Plain)
			.field("a", 8, 4, FieldKind::Plain);
		let plan = ConversionPlan::build(TAG, &src_layout, 8, &dst_layout, 8);
		assert!(plan.notes().is_empty());

		let src = record(&[(0, &1u32.to_ne_bytes()[..]), (4, &2u32.to_ne_bytes()[..])], 8);
		let out = plan.apply(&src, 1, &mut Diagnostics::new()).unwrap();
		assert_eq!(out, record(&[(0, &2u32.to_ne_bytes()[..]), (8, &1u32.to_ne_bytes()[..])], 16));
	}

	#[test]
	fn dropped_and_added_fields() {
		let src_layout = LayoutTable::new("T", 8, 4)
			.field("a", 0, 4, FieldKind::Plain)
			.field("old", 4, 4, FieldKind::Plain);
		let dst_layout = LayoutTable::new("T", 8, 4)
			.field("a", 0, 4, FieldKind::Plain)
			.field("new", 4, 4, FieldKind::Plain);
		let plan = ConversionPlan::build(TAG, &src_layout, 8, &dst_layout, 8);
		let fields: Vec<_> = plan.notes().iter().filter_map(|n| n.field.as_deref()).collect();
		assert_eq!(fields, vec!["new", "old"]);

		let src = record(&[(0, &5u32.to_ne_bytes()[..]), (4, &9u32.to_ne_bytes()[..])], 8);
		let out = plan.apply(&src, 1, &mut Diagnostics::new()).unwrap();
		assert_eq!(out, record(&[(0, &5u32.to_ne_bytes()[..])], 8));
	}

	#[test]
	fn integer_widening() {
		let src_layout = LayoutTable::new("T", 4, 2).field("n", 0, 2, FieldKind::Plain);
		let dst_layout = LayoutTable::new("T", 8, 8).field("n", 0, 8, FieldKind::Plain);
		let plan = ConversionPlan::build(TAG, &src_layout, 8, &dst_layout, 8);
		assert!(plan.notes().is_empty());

		let src = record(&[(0, &300u16.to_ne_bytes()[..])], 4);
		let out = plan.apply(&src, 1, &mut Diagnostics::new()).unwrap();
		assert_eq!(out, 300u64.to_ne_bytes().to_vec());
	}

	#[test]
	fn pointer_width_conversion() {
		let wide = LayoutTable::new("T", 16, 8)
			.field("id", 0, 4, FieldKind::Plain)
			.field("next", 8, 8, FieldKind::ObjectPtr);
		let narrow = LayoutTable::new("T", 8, 4)
			.field("id", 0, 4, FieldKind::Plain)
			.field("next", 4, 4, FieldKind::ObjectPtr);

		let plan = ConversionPlan::build(TAG, &wide, 8, &narrow, 4);
		assert!(plan.notes().is_empty());
		let src = record(&[(0, &7u32.to_ne_bytes()[..]), (8, &3u64.to_ne_bytes()[..])], 16);
		let mut diags = Diagnostics::new();
		let out = plan.apply(&src, 1, &mut diags).unwrap();
		assert_eq!(out, record(&[(0, &7u32.to_ne_bytes()[..]), (4, &3u32.to_ne_bytes()[..])], 8));
		assert!(diags.is_empty());

		// Identity too large for narrow pointer is dropped
		let src = record(&[(8, &(u32::MAX as u64 + 1).to_ne_bytes()[..])], 16);
		let out = plan.apply(&src, 2, &mut diags).unwrap();
		assert_eq!(out, vec![0; 8]);
		assert_eq!(diags.count(DiagnosticKind::LayoutMismatch), 1);
	}

	#[test]
	fn kind_change_is_unmappable() {
		let src_layout = LayoutTable::new("T", 8, 8).field("x", 0, 8, FieldKind::Plain);
		let dst_layout = LayoutTable::new("T", 8, 8).field("x", 0, 8, FieldKind::ObjectPtr);
		let plan = ConversionPlan::build(TAG, &src_layout, 8, &dst_layout, 8);
		assert_eq!(plan.notes().len(), 1);
		let out = plan.apply(&[0xff; 8], 1, &mut Diagnostics::new()).unwrap();
		assert_eq!(out, vec![0; 8]);
	}

	#[test]
	fn unvalidated_layouts_fail_cleanly() {
		let layout = LayoutTable::new("T", 8, 8).field("x", 0, 8, FieldKind::Plain);
		let outside = LayoutTable::new("T", 8, 8).field("x", 10_000, 8, FieldKind::Plain);
		let plan = ConversionPlan::build(TAG, &outside, 8, &layout, 8);
		assert!(matches!(
			plan.apply(&[0; 8], 1, &mut Diagnostics::new()),
			Err(Error::FormatMismatch(_))
		));

		let odd_ptr = LayoutTable::new("T", 8, 8).field("p", 0, 3, FieldKind::ObjectPtr);
		let ptr = LayoutTable::new("T", 8, 8).field("p", 0, 8, FieldKind::ObjectPtr);
		let plan = ConversionPlan::build(TAG, &odd_ptr, 8, &ptr, 8);
		assert!(matches!(
			plan.apply(&[0; 8], 1, &mut Diagnostics::new()),
			Err(Error::FormatMismatch(_))
		));
	}

	#[test]
	fn uint_sizes() {
		let mut out = [0u8; 2];
		assert!(write_uint(&mut out, 0x1234).unwrap());
		assert_eq!(read_uint(&out).unwrap(), 0x1234);
		assert!(!write_uint(&mut out, 0x10000).unwrap());
		assert!(read_uint(&[0; 3]).is_err());
		assert!(write_uint(&mut [0; 5], 1).is_err());
	}

	#[test]
	fn wrong_record_size() {
		let layout = LayoutTable::new("T", 8, 8).field("x", 0, 8, FieldKind::Plain);
		let plan = ConversionPlan::build(TAG, &layout, 8, &layout, 8);
		assert!(matches!(
			plan.apply(&[0; 4], 1, &mut Diagnostics::new()),
			Err(Error::FormatMismatch(_))
		));
	}
}
