//! Alignment helpers shared by the binary writer, reader and load arena.

/// Round up `pos` to alignment of `alignment`.
///
/// `alignment` must be a power of 2.
///
/// Caller must ensure `pos + alignment` cannot overflow `usize`.
/// This is satisfied if both `pos` and `alignment` are less than `isize::MAX`.
pub const fn align_up_to(pos: usize, alignment: usize) -> usize {
	debug_assert!(alignment.is_power_of_two());
	(pos + alignment - 1) & !(alignment - 1)
}

/// Check if `pos` is a multiple of `alignment`.
///
/// `alignment` must be a power of 2.
pub const fn is_aligned_to(pos: usize, alignment: usize) -> bool {
	debug_assert!(alignment.is_power_of_two());
	pos & (alignment - 1) == 0
}

/// Maximum capacity of an allocation with the given alignment.
///
/// [`std::alloc::Layout`] requires that size rounded up to `alignment` does
/// not exceed `isize::MAX`.
pub const fn aligned_max_capacity(alignment: usize) -> usize {
	isize::MAX as usize - (alignment - 1)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn align_up() {
		assert_eq!(align_up_to(0, 8), 0);
		assert_eq!(align_up_to(1, 8), 8);
		assert_eq!(align_up_to(8, 8), 8);
		assert_eq!(align_up_to(9, 16), 16);
		assert_eq!(align_up_to(17, 16), 32);
	}

	#[test]
	fn aligned() {
		assert!(is_aligned_to(0, 4));
		assert!(is_aligned_to(32, 16));
		assert!(!is_aligned_to(33, 16));
	}
}
