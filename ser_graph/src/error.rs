use std::{fmt, io};

use thiserror::Error;

use crate::TypeTag;

/// Fatal errors. Any of these aborts the whole save or load.
#[derive(Debug, Error)]
pub enum Error {
	#[error("type tag {0} is already registered")]
	DuplicateTypeTag(TypeTag),
	#[error("type tag {0} is not registered")]
	UnknownTypeTag(TypeTag),
	#[error("no serializer registered for type tag {0}")]
	UnregisteredType(TypeTag),
	#[error("object {source_id} ({tag}) references an object which is not reachable from the collection")]
	UnresolvedReference { tag: TypeTag, source_id: u64 },
	#[error("pointer field `{field}` of object {id} ({tag}) points to an object which was never registered as a reference")]
	DanglingPointer {
		tag: TypeTag,
		id: u64,
		field: String,
	},
	#[error("format mismatch: {0}")]
	FormatMismatch(String),
	#[error("insufficient buffer space: need {needed} bytes, {available} available")]
	InsufficientBuffer { needed: usize, available: usize },
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("xml error: {0}")]
	Xml(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Kind of a non-fatal diagnostic.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
	/// Layout metadata tables disagree. Load proceeds with best-effort
	/// conversion.
	LayoutMismatch,
	/// Declarative property value failed to parse. Property keeps its
	/// constructed value.
	MalformedProperty,
	/// Subordinate object without exactly one owner. That object is not
	/// constructed, the rest of the load proceeds.
	SubordinateWithoutOwner,
}

impl fmt::Display for DiagnosticKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::LayoutMismatch => "layout mismatch",
			Self::MalformedProperty => "malformed property",
			Self::SubordinateWithoutOwner => "subordinate without owner",
		};
		f.write_str(name)
	}
}

/// A non-fatal problem found during a save or load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
	pub kind: DiagnosticKind,
	pub tag: TypeTag,
	/// Identity of the object concerned, if the problem concerns one object.
	pub id: Option<u64>,
	/// Name of field or property concerned.
	pub field: Option<String>,
	pub message: String,
}

impl Diagnostic {
	pub fn new(kind: DiagnosticKind, tag: TypeTag, message: impl Into<String>) -> Self {
		Self {
			kind,
			tag,
			id: None,
			field: None,
			message: message.into(),
		}
	}

	pub fn with_id(mut self, id: u64) -> Self {
		self.id = Some(id);
		self
	}

	pub fn with_field(mut self, field: impl Into<String>) -> Self {
		self.field = Some(field.into());
		self
	}
}

impl fmt::Display for Diagnostic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({}", self.kind, self.tag)?;
		if let Some(id) = self.id {
			write!(f, ", object {id}")?;
		}
		if let Some(field) = &self.field {
			write!(f, ", `{field}`")?;
		}
		write!(f, "): {}", self.message)
	}
}

/// Diagnostics collected over one pass.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
	entries: Vec<Diagnostic>,
}

impl Diagnostics {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a diagnostic, and emit it as a `tracing` warning.
	pub fn push(&mut self, diagnostic: Diagnostic) {
		tracing::warn!(
			kind = %diagnostic.kind,
			tag = diagnostic.tag.get(),
			id = diagnostic.id,
			field = diagnostic.field.as_deref(),
			"{}",
			diagnostic.message
		);
		self.entries.push(diagnostic);
	}

	pub fn extend(&mut self, other: Diagnostics) {
		self.entries.extend(other.entries);
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
		self.entries.iter()
	}

	pub fn of_kind(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
		self.entries.iter().filter(move |d| d.kind == kind)
	}

	pub fn count(&self, kind: DiagnosticKind) -> usize {
		self.of_kind(kind).count()
	}

	/// Whether any object failed to load entirely.
	pub fn has_errors(&self) -> bool {
		self
			.entries
			.iter()
			.any(|d| d.kind == DiagnosticKind::SubordinateWithoutOwner)
	}

	/// Diagnostics concerning object `id`.
	pub fn for_object(&self, id: u64) -> impl Iterator<Item = &Diagnostic> {
		self.entries.iter().filter(move |d| d.id == Some(id))
	}

	/// One summary per object with diagnostics, in order of first report.
	/// Diagnostics not concerning a single object are left out.
	pub fn by_object(&self) -> Vec<ObjectSummary> {
		let mut summaries: Vec<ObjectSummary> = Vec::new();
		for diagnostic in &self.entries {
			let Some(id) = diagnostic.id else {
				continue;
			};
			let index = match summaries.iter().position(|s| s.id == id) {
				Some(index) => index,
				None => {
					summaries.push(ObjectSummary {
						id,
						tag: diagnostic.tag,
						count: 0,
						fields: Vec::new(),
						skipped: false,
					});
					summaries.len() - 1
				}
			};
			let summary = &mut summaries[index];
			summary.count += 1;
			if let Some(field) = &diagnostic.field {
				summary.fields.push(field.clone());
			}
			if diagnostic.kind == DiagnosticKind::SubordinateWithoutOwner {
				summary.skipped = true;
			}
		}
		summaries
	}

	pub fn into_vec(self) -> Vec<Diagnostic> {
		self.entries
	}
}

/// Diagnostics of one object, rolled up by [`Diagnostics::by_object`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSummary {
	pub id: u64,
	pub tag: TypeTag,
	pub count: usize,
	/// Fields or properties concerned, in order reported
	pub fields: Vec<String>,
	/// Object was not loaded
	pub skipped: bool,
}

impl<'a> IntoIterator for &'a Diagnostics {
	type Item = &'a Diagnostic;
	type IntoIter = std::slice::Iter<'a, Diagnostic>;

	fn into_iter(self) -> Self::IntoIter {
		self.entries.iter()
	}
}
