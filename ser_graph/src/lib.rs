//! Persistence for graphs of heterogeneous objects which point at each other.
//!
//! Two formats:
//!
//! * [`binary`]: fixed-size state of each object copied as-is, with pointers
//!   replaced by identities. Loading reconstructs every object in place inside
//!   a single buffer, then re-points pointers in a second pass.
//! * [`declarative`]: objects as named property lists in an XML document.
//!
//! Per-type behavior is registered in a [`Registry`] against each type's
//! [`TypeTag`]. Objects to save are gathered in a [`Collection`].

#[cfg(feature = "derive")]
pub use ser_graph_derive::{Layout, Serializable};

mod tag;
pub use tag::{ReferenceKind, TypeTag};

mod object;
pub use object::{ExtraPtr, ObjPtr, ObjectFlags, ObjectHeader, Serializable};

mod error;
pub use error::{Diagnostic, DiagnosticKind, Diagnostics, Error, ObjectSummary, Result};

mod registry;
pub use registry::Registry;

mod collection;
pub use collection::Collection;

mod serializer;
pub use serializer::{GraphObject, ObjectSerializer, TypedSerializer};

pub mod layout;
pub use layout::{FieldKind, FieldLayout, HasLayout, LayoutCallback, LayoutTable};

mod storage;
pub use storage::{AlignedBuf, DEFAULT_ALIGNMENT};

pub mod binary;
pub mod declarative;

mod util;
