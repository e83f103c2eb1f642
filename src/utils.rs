//! Rounding helpers shared by the block engine, the slab mapper and the bump arenas.

/// Rounds `to_be_aligned` up to the next multiple of `alignment`.
///
/// Used to round slab sizes up to [`crate::kernel::PlatformMemory::page_size`],
/// block sizes up to the header alignment and bump pointers up to the
/// alignment the caller asked for. `alignment` must be a power of two.
#[inline]
pub fn align(to_be_aligned: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Pointer version of [`align`]. Keeps the provenance of `ptr`.
#[inline]
pub fn align_ptr(ptr: *mut u8, alignment: usize) -> *mut u8 {
    let addr = ptr as usize;
    ptr.wrapping_add(align(addr, alignment) - addr)
}

/// Normalizes a caller supplied alignment. Zero means "no constraint".
#[inline]
pub fn normalize_alignment(alignment: usize) -> usize {
    if alignment == 0 { 1 } else { alignment }
}
