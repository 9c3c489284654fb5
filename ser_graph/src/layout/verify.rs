//! Comparison of the layout table embedded in a stream with the table the
//! current build has registered.

use super::LayoutTable;
use crate::{Diagnostic, DiagnosticKind, TypeTag};

/// Compare `embedded` layout (from a stream) against `current` layout.
///
/// Returns one [`DiagnosticKind::LayoutMismatch`] diagnostic per difference.
/// Empty if the layouts are identical.
///
/// Pointer fields which differ in size only by the difference between
/// `embedded_ptr_width` and the native pointer width are not reported,
/// as that conversion is always safe.
pub fn diff_layouts(
	tag: TypeTag,
	embedded: &LayoutTable,
	embedded_ptr_width: usize,
	current: &LayoutTable,
	current_ptr_width: usize,
) -> Vec<Diagnostic> {
	let mut diffs = Vec::new();
	let mismatch = |message: String| Diagnostic::new(DiagnosticKind::LayoutMismatch, tag, message);

	if embedded.size != current.size {
		diffs.push(mismatch(format!(
			"`{}` size differs: {} in data, {} in this build",
			current.type_name, embedded.size, current.size
		)));
	}
	if embedded.align != current.align {
		diffs.push(mismatch(format!(
			"`{}` alignment differs: {} in data, {} in this build",
			current.type_name, embedded.align, current.align
		)));
	}

	for field in &current.fields {
		let Some(old) = embedded.get(&field.name) else {
			diffs.push(
				mismatch("field missing from data, will be zero-filled".into()).with_field(&field.name),
			);
			continue;
		};

		if old.kind != field.kind {
			diffs.push(
				mismatch(format!("kind differs: {} in data, {} in this build", old.kind, field.kind))
					.with_field(&field.name),
			);
			continue;
		}

		if old.offset != field.offset {
			diffs.push(
				mismatch(format!(
					"offset differs: {} in data, {} in this build",
					old.offset, field.offset
				))
				.with_field(&field.name),
			);
		}

		let expected_size = if field.kind.is_pointer() {
			old.size == embedded_ptr_width && field.size == current_ptr_width
		} else {
			old.size == field.size
		};
		if !expected_size {
			diffs.push(
				mismatch(format!(
					"size differs: {} in data, {} in this build",
					old.size, field.size
				))
				.with_field(&field.name),
			);
		}
	}

	for old in &embedded.fields {
		if current.get(&old.name).is_none() {
			diffs.push(
				mismatch("field not present in this build, will be dropped".into()).with_field(&old.name),
			);
		}
	}

	diffs
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::layout::FieldKind;

	const TAG: TypeTag = TypeTag::user(1);

	fn base() -> LayoutTable {
		LayoutTable::new("Thing", 16, 8)
			.field("a", 0, 4, FieldKind::Plain)
			.field("b", 8, 8, FieldKind::ObjectPtr)
	}

	#[test]
	fn identical_layouts() {
		assert!(diff_layouts(TAG, &base(), 8, &base(), 8).is_empty());
	}

	#[test]
	fn pointer_width_change_alone_is_not_a_mismatch() {
		let narrow = LayoutTable::new("Thing", 16, 8)
			.field("a", 0, 4, FieldKind::Plain)
			.field("b", 8, 4, FieldKind::ObjectPtr);
		assert!(diff_layouts(TAG, &narrow, 4, &base(), 8).is_empty());
	}

	#[test]
	fn added_and_removed_fields() {
		let old = LayoutTable::new("Thing", 16, 8)
			.field("a", 0, 4, FieldKind::Plain)
			.field("gone", 4, 4, FieldKind::Plain)
			.field("b", 8, 8, FieldKind::ObjectPtr);
		let new = base().field("c", 4, 2, FieldKind::Plain);

		let diffs = diff_layouts(TAG, &old, 8, &new, 8);
		let fields: Vec<_> = diffs.iter().filter_map(|d| d.field.as_deref()).collect();
		assert_eq!(fields, vec!["c", "gone"]);
		assert!(diffs.iter().all(|d| d.kind == DiagnosticKind::LayoutMismatch));
	}

	#[test]
	fn changed_kind_and_size() {
		let old = LayoutTable::new("Thing", 24, 8)
			.field("a", 0, 8, FieldKind::Plain)
			.field("b", 8, 8, FieldKind::Plain);
		let diffs = diff_layouts(TAG, &old, 8, &base(), 8);
		// Type size, `a` size, `b` kind
		assert_eq!(diffs.len(), 3);
	}
}
