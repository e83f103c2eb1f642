use std::ptr::NonNull;

use crate::block::{Block, FreeBlock, HEADER_SIZE, MIN_BLOCK_SIZE, MemoryRangeHeader};

/// Number of bytes at the end of every code slab taken by the permanent
/// sentinel blocks (see [`seed_code_slab`]).
pub(crate) const SLAB_SENTINEL_SIZE: usize = HEADER_SIZE + MIN_BLOCK_SIZE + HEADER_SIZE;

/// Smallest code slab that can hold the sentinels and one usable free block.
pub(crate) const MIN_CODE_SLAB_SIZE: usize = SLAB_SENTINEL_SIZE + MIN_BLOCK_SIZE;

/// Byte pattern written over fresh slabs and released blocks when poisoning
/// is enabled, so stale pointers into JIT memory are easy to spot.
pub const POISON_BYTE: u8 = 0xCD;

/// A single mapping obtained from a [`crate::kernel::PlatformMemory`].
///
/// A slab is only a record of where the mapping lives. It does not unmap
/// anything on drop: the [`crate::JitMemoryManager`] that requested it hands
/// it back explicitly when it is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slab {
    /// Start of the mapping.
    base: NonNull<u8>,
    /// Size of the mapping in bytes.
    size: usize,
}

impl Slab {
    /// Builds a slab record for `size` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base..base + size` must be a single live allocation, valid for reads
    /// and writes, aligned to at least a machine word.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, size: usize) -> Self {
        debug_assert_eq!(base.as_ptr() as usize % align_of::<usize>(), 0);
        Self { base, size }
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte of the slab.
    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.base.as_ptr().wrapping_add(self.size)
    }

    /// Whether `ptr` points into this slab.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.base.as_ptr() as usize <= addr && addr < self.end() as usize
    }

    /// Overwrites the whole slab with [`POISON_BYTE`].
    ///
    /// # Safety
    ///
    /// The slab must be writable and nothing in it may be in use.
    pub unsafe fn poison(&self) {
        unsafe { self.base.as_ptr().write_bytes(POISON_BYTE, self.size) };
    }
}

/// Lays out the block structure of a fresh code slab and links its free
/// blocks into `free_list`. When `free_list` is `None` the slab starts a
/// new list.
///
/// Every code slab is carved into four blocks:
///
/// ```text
/// +----------------------+ <- slab base
/// |   Free #0            |    the space functions are allocated from
/// |         ...          |
/// +----------------------+
/// |   Allocated #1       |    header only, keeps #2 from being coalesced
/// +----------------------+
/// |   Free #2            |    minimum sized, keeps the free list non-empty
/// +----------------------+
/// |   Allocated #3       |    header only, nothing is read past it
/// +----------------------+ <- slab end
/// ```
///
/// Blocks #1 to #3 are never handed out nor freed. Returns block #0.
///
/// # Safety
///
/// `slab` must be writable, at least [`MIN_CODE_SLAB_SIZE`] bytes long, its
/// size a multiple of the header alignment, and not otherwise in use.
/// `free_list` must be a valid free block of a list owned by the caller.
pub(crate) unsafe fn seed_code_slab(slab: &Slab, free_list: Option<FreeBlock>) -> FreeBlock {
    assert!(
        slab.size() >= MIN_CODE_SLAB_SIZE,
        "code slab of {} bytes is too small",
        slab.size()
    );

    unsafe {
        let end = slab.base().add(slab.size());

        // Block #3: an allocated header flush with the end of the slab.
        let end_block = Block::from_addr(end.sub(HEADER_SIZE));
        end_block.write(MemoryRangeHeader::new(HEADER_SIZE, true, false));

        // Block #2: the tombstone.
        let tombstone = Block::from_addr(end_block.addr().sub(MIN_BLOCK_SIZE)).as_free();
        tombstone.block().write(MemoryRangeHeader::new(MIN_BLOCK_SIZE, false, true));
        tombstone.set_end_of_block_size_marker();
        match free_list {
            Some(list) => tombstone.add_to_free_list(list),
            None => tombstone.make_singleton_list(),
        }

        // Block #1: separates #0 from the tombstone.
        let separator = Block::from_addr(tombstone.block().addr().sub(HEADER_SIZE));
        separator.write(MemoryRangeHeader::new(HEADER_SIZE, true, false));

        // Block #0: everything else. The block "before" it is reported as
        // allocated so nothing ever looks below the slab base.
        let first = Block::from_addr(slab.base()).as_free();
        let size = separator.addr().as_ptr() as usize - slab.as_ptr() as usize;
        first.block().write(MemoryRangeHeader::new(size, false, true));
        first.set_end_of_block_size_marker();
        first.add_to_free_list(tombstone);

        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_memory::heap_slab;

    #[test]
    fn contains_is_half_open() {
        let (_buf, slab) = heap_slab(64);

        assert!(slab.contains(slab.as_ptr()));
        assert!(slab.contains(slab.end().wrapping_sub(1)));
        assert!(!slab.contains(slab.end()));
    }

    #[test]
    fn seeded_slab_has_four_blocks() {
        let (_buf, slab) = heap_slab(512);

        unsafe {
            let first = seed_code_slab(&slab, None);
            assert_eq!(first.block().addr(), slab.base());
            assert_eq!(first.size(), 512 - SLAB_SENTINEL_SIZE);

            let separator = first.block().block_after();
            assert!(separator.is_allocated());
            assert!(!separator.is_prev_allocated());
            assert_eq!(separator.size(), HEADER_SIZE);

            let tombstone = separator.block_after();
            assert!(!tombstone.is_allocated());
            assert_eq!(tombstone.size(), MIN_BLOCK_SIZE);

            let end_block = tombstone.block_after();
            assert!(end_block.is_allocated());
            assert_eq!(end_block.addr().as_ptr().add(HEADER_SIZE), slab.end());

            // The list holds the big block and the tombstone.
            assert_eq!(first.next(), tombstone.as_free());
            assert_eq!(tombstone.as_free().next(), first);
        }
    }

    #[test]
    fn second_slab_joins_existing_list() {
        let (_a, first_slab) = heap_slab(256);
        let (_b, second_slab) = heap_slab(256);

        unsafe {
            let list = seed_code_slab(&first_slab, None);
            let second = seed_code_slab(&second_slab, Some(list));

            let mut count = 0;
            let mut node = list;
            loop {
                count += 1;
                node = node.next();
                if node == list {
                    break;
                }
            }
            assert_eq!(count, 4);
            assert!(second_slab.contains(second.block().addr().as_ptr()));
        }
    }

    #[test]
    #[should_panic(expected = "too small")]
    fn tiny_slab_is_rejected() {
        let (_buf, slab) = heap_slab(MIN_CODE_SLAB_SIZE - 8);
        unsafe {
            seed_code_slab(&slab, None);
        }
    }

    #[test]
    fn poison_fills_the_slab() {
        let (buf, slab) = heap_slab(32);
        unsafe { slab.poison() };

        assert!(buf.iter().all(|word| *word == u64::from_ne_bytes([POISON_BYTE; 8])));
    }
}
