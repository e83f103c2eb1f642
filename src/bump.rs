use std::{mem, ptr::{self, NonNull}};

use crate::{
    slab::Slab,
    utils::{align_ptr, normalize_alignment},
};

/// Where a [`BumpArena`] gets its slabs from.
///
/// The memory manager implements this on top of its OS mapper so that stub
/// and data slabs are placed near the code slabs.
pub trait SlabSource {
    /// Returns a fresh slab of at least `size` bytes. Failure is fatal, so
    /// this always returns a slab.
    fn allocate_slab(&mut self, size: usize) -> Slab;
}

/// A bump pointer allocator with its own cache of slabs.
///
/// Stubs and globals are small, numerous and never freed one by one, so
/// they don't go through the free list. Every allocation just moves a
/// pointer forward; slabs are only given back when the whole arena is.
///
/// ```text
///      slab                                        slab
/// +------------------------------------+      +---------------------------+
/// | stub | stub |pad| stub |   unused  |      | stub | stub |             |
/// +------------------------------------+      +---------------------------+
///                                                            ^            ^
///                                                         cur_ptr        end
/// ```
///
/// Requests larger than the size threshold get a slab of their own so they
/// don't waste the rest of the current one.
#[derive(Debug)]
pub struct BumpArena {
    /// Size of the next regular slab.
    slab_size: usize,
    /// Requests above this many bytes get a dedicated slab.
    size_threshold: usize,
    /// Every slab this arena owns, in allocation order.
    slabs: Vec<Slab>,
    /// Next free byte of the current slab. Null until the first slab.
    cur_ptr: *mut u8,
    /// End of the current slab.
    end: *mut u8,
    /// Bytes handed out so far, padding excluded.
    bytes_allocated: usize,
}

impl BumpArena {
    /// Slab size doubles every time this many slabs' worth of bytes was handed out.
    const GROWTH_FACTOR: usize = 128;

    pub fn new(slab_size: usize, size_threshold: usize) -> Self {
        assert!(slab_size > 0, "bump arena slabs can't be empty");

        Self {
            slab_size,
            size_threshold,
            slabs: Vec::new(),
            cur_ptr: ptr::null_mut(),
            end: ptr::null_mut(),
            bytes_allocated: 0,
        }
    }

    /// Allocates `size` bytes aligned to `alignment` (zero means one).
    pub fn allocate(&mut self, size: usize, alignment: usize, source: &mut impl SlabSource) -> NonNull<u8> {
        let alignment = normalize_alignment(alignment);
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");

        if self.cur_ptr.is_null() {
            self.start_new_slab(source);
        }

        self.bytes_allocated = self.bytes_allocated.saturating_add(size);

        if let Some(ptr) = self.bump(size, alignment) {
            return ptr;
        }

        // An overflowing size asks for a slab no platform can map, which is
        // reported by the source.
        let padded_size = size.saturating_add(alignment - 1);
        if padded_size <= self.size_threshold {
            self.start_new_slab(source);
            if let Some(ptr) = self.bump(size, alignment) {
                return ptr;
            }
        }

        // Big requests get their own slab. The current one stays current.
        let slab = source.allocate_slab(padded_size);
        self.slabs.push(slab);

        nonnull(align_ptr(slab.as_ptr(), alignment))
    }

    /// Carves `size` bytes out of the current slab if they fit.
    fn bump(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        let ptr = align_ptr(self.cur_ptr, alignment);
        let fits = (ptr as usize)
            .checked_add(size)
            .is_some_and(|end| end <= self.end as usize);

        if !fits {
            return None;
        }

        self.cur_ptr = ptr.wrapping_add(size);
        Some(nonnull(ptr))
    }

    fn start_new_slab(&mut self, source: &mut impl SlabSource) {
        // An arena that already handed out a lot is likely to keep going.
        // Bigger slabs mean fewer mappings.
        if self.bytes_allocated >= self.slab_size * Self::GROWTH_FACTOR {
            self.slab_size *= 2;
        }

        let slab = source.allocate_slab(self.slab_size);
        self.slabs.push(slab);
        self.cur_ptr = slab.as_ptr();
        self.end = slab.end();
    }

    /// Every slab owned by this arena.
    pub fn slabs(&self) -> &[Slab] {
        &self.slabs
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    /// Gives up ownership of every slab so the caller can release them.
    /// The arena starts over empty.
    pub fn take_slabs(&mut self) -> Vec<Slab> {
        self.cur_ptr = ptr::null_mut();
        self.end = ptr::null_mut();
        mem::take(&mut self.slabs)
    }
}

#[inline]
fn nonnull(ptr: *mut u8) -> NonNull<u8> {
    // Every pointer handed out lies inside a mapped slab.
    unsafe { NonNull::new_unchecked(ptr) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_memory::heap_slab;

    /// Hands out heap backed slabs and keeps them alive.
    #[derive(Default)]
    struct HeapSlabs {
        buffers: Vec<Vec<u64>>,
        requests: Vec<usize>,
    }

    impl SlabSource for HeapSlabs {
        fn allocate_slab(&mut self, size: usize) -> Slab {
            let (buf, slab) = heap_slab(size);
            self.buffers.push(buf);
            self.requests.push(size);
            slab
        }
    }

    #[test]
    fn consecutive_allocations_are_adjacent() {
        let mut source = HeapSlabs::default();
        let mut arena = BumpArena::new(256, 128);

        let first = arena.allocate(16, 8, &mut source);
        let second = arena.allocate(16, 8, &mut source);

        assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 16);
        assert_eq!(arena.slabs().len(), 1);
        assert_eq!(arena.bytes_allocated(), 32);
    }

    #[test]
    fn alignment_is_honoured() {
        let mut source = HeapSlabs::default();
        let mut arena = BumpArena::new(256, 128);

        arena.allocate(3, 1, &mut source);
        let aligned = arena.allocate(8, 16, &mut source);
        let unaligned = arena.allocate(1, 0, &mut source);

        assert_eq!(aligned.as_ptr() as usize % 16, 0);
        assert_eq!(unaligned.as_ptr() as usize, aligned.as_ptr() as usize + 8);
    }

    #[test]
    fn full_slab_starts_a_new_one() {
        let mut source = HeapSlabs::default();
        let mut arena = BumpArena::new(64, 64);

        let first = arena.allocate(48, 8, &mut source);
        let second = arena.allocate(48, 8, &mut source);

        assert_eq!(arena.slabs().len(), 2);
        assert!(arena.slabs()[0].contains(first.as_ptr()));
        assert!(arena.slabs()[1].contains(second.as_ptr()));
    }

    #[test]
    fn oversized_requests_get_a_dedicated_slab() {
        let mut source = HeapSlabs::default();
        let mut arena = BumpArena::new(256, 128);

        let small = arena.allocate(16, 8, &mut source);
        let big = arena.allocate(1000, 8, &mut source);
        let after = arena.allocate(16, 8, &mut source);

        assert_eq!(source.requests, vec![256, 1007]);
        assert!(arena.slabs()[1].contains(big.as_ptr()));
        // The regular slab keeps serving small requests.
        assert_eq!(after.as_ptr() as usize - small.as_ptr() as usize, 16);
    }

    #[test]
    fn slab_size_grows_with_usage() {
        let mut source = HeapSlabs::default();
        let mut arena = BumpArena::new(64, 128);

        for _ in 0..(BumpArena::GROWTH_FACTOR + 1) {
            arena.allocate(64, 8, &mut source);
        }

        assert_eq!(arena.slab_size(), 128);
        assert_eq!(source.requests.last(), Some(&128));
    }

    #[test]
    fn take_slabs_resets_the_arena() {
        let mut source = HeapSlabs::default();
        let mut arena = BumpArena::new(64, 64);
        arena.allocate(8, 8, &mut source);

        let slabs = arena.take_slabs();

        assert_eq!(slabs.len(), 1);
        assert!(arena.slabs().is_empty());
        arena.allocate(8, 8, &mut source);
        assert_eq!(arena.slabs().len(), 1);
    }
}
