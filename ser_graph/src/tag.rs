use std::fmt;

/// Stable numeric identifier of a registered type.
///
/// Tags below [`TypeTag::FIRST_USER`] are reserved for types built into this
/// crate. Extenders pick their own tags at or above it.
/// [`TypeTag::NONE`] is never a valid tag for a registered type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TypeTag(u32);

impl TypeTag {
	/// Invalid tag. Marks a missing / unset tag.
	pub const NONE: TypeTag = TypeTag(0);

	/// First tag available to user extension types.
	pub const FIRST_USER: TypeTag = TypeTag(0x1000);

	/// Create a tag from its raw value.
	#[inline]
	pub const fn new(raw: u32) -> Self {
		Self(raw)
	}

	/// Create a tag in the user extension range, `offset` above
	/// [`TypeTag::FIRST_USER`].
	#[inline]
	pub const fn user(offset: u32) -> Self {
		Self(Self::FIRST_USER.0 + offset)
	}

	/// Raw value of this tag.
	#[inline]
	pub const fn get(self) -> u32 {
		self.0
	}

	#[inline]
	pub const fn is_none(self) -> bool {
		self.0 == 0
	}
}

impl fmt::Display for TypeTag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{:#x}", self.0)
	}
}

impl From<u32> for TypeTag {
	#[inline]
	fn from(raw: u32) -> Self {
		Self(raw)
	}
}

/// Kind of a reference between two objects.
///
/// Only [`ReferenceKind::OBJECT`] has meaning to the engine. Other kinds are
/// carried through serialization unchanged.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ReferenceKind(pub u32);

impl ReferenceKind {
	/// Object-to-object reference.
	pub const OBJECT: ReferenceKind = ReferenceKind(1);
}
