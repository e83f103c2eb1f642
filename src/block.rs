use std::{fmt, mem, ptr::NonNull};

/// Set in a header when its block is handed out.
const THIS_ALLOCATED: usize = 0b01;
/// Set in a header when the block right before it (in address order) is handed out.
const PREV_ALLOCATED: usize = 0b10;
const FLAG_MASK: usize = THIS_ALLOCATED | PREV_ALLOCATED;
const FLAG_BITS: u32 = 2;

/// Largest block size a header can encode.
pub const MAX_BLOCK_SIZE: usize = usize::MAX >> FLAG_BITS;

/// Overhead of an allocated block.
pub const HEADER_SIZE: usize = mem::size_of::<MemoryRangeHeader>();

/// Every block starts at a multiple of this and every block size is one.
pub const HEADER_ALIGN: usize = mem::align_of::<FreeRangeHeader>();

/// No block is ever smaller than this: a free block needs room for its
/// header, both list links and the end-of-block size marker.
pub const MIN_BLOCK_SIZE: usize = mem::size_of::<FreeRangeHeader>() + mem::size_of::<usize>();

/// The boundary tag placed at the start of every block, free or allocated.
///
/// It is a single machine word:
///
/// ```text
///  word_bits - 1                    2   1   0
/// +-----------------------------------+---+---+
/// |            block size             | P | A |
/// +-----------------------------------+---+---+
///
///  A: this block is allocated
///  P: the previous block is allocated
/// ```
///
/// The size covers the whole block, header included. When `P` is clear the
/// word right before this header is the size of the (free) previous block.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MemoryRangeHeader {
    tag: usize,
}

impl MemoryRangeHeader {
    pub const fn new(size: usize, this_allocated: bool, prev_allocated: bool) -> Self {
        debug_assert!(size <= MAX_BLOCK_SIZE);
        let mut tag = size << FLAG_BITS;
        if this_allocated {
            tag |= THIS_ALLOCATED;
        }
        if prev_allocated {
            tag |= PREV_ALLOCATED;
        }
        Self { tag }
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.tag >> FLAG_BITS
    }

    #[inline]
    pub const fn is_allocated(&self) -> bool {
        self.tag & THIS_ALLOCATED != 0
    }

    #[inline]
    pub const fn is_prev_allocated(&self) -> bool {
        self.tag & PREV_ALLOCATED != 0
    }

    #[inline]
    fn set_size(&mut self, size: usize) {
        debug_assert!(size <= MAX_BLOCK_SIZE);
        self.tag = (size << FLAG_BITS) | (self.tag & FLAG_MASK);
    }

    #[inline]
    fn set_flag(&mut self, flag: usize, value: bool) {
        if value {
            self.tag |= flag;
        } else {
            self.tag &= !flag;
        }
    }
}

impl fmt::Debug for MemoryRangeHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRangeHeader")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .field("prev_allocated", &self.is_prev_allocated())
            .finish()
    }
}

/// Layout of a block while it is free. The links live in the payload, which
/// nobody else is using at that point.
///
/// ```text
/// +------------------------+ <- block start
/// |   MemoryRangeHeader    |
/// +------------------------+
/// |   prev free block      |
/// +------------------------+
/// |   next free block      |
/// +------------------------+
/// |         ...            |
/// +------------------------+
/// |   block size           | <- end-of-block size marker (last word)
/// +------------------------+ <- next block start
/// ```
#[repr(C)]
pub struct FreeRangeHeader {
    header: MemoryRangeHeader,
    prev: NonNull<FreeRangeHeader>,
    next: NonNull<FreeRangeHeader>,
}

/// Handle to a block header living inside a slab.
///
/// All the accessors are `unsafe`: the handle does not know whether the
/// memory it points to is still mapped nor whether a header is really there.
/// Callers uphold that by only building handles from seeded slabs and from
/// traversal of other valid handles.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block(NonNull<MemoryRangeHeader>);

impl Block {
    /// # Safety
    ///
    /// `addr` must be aligned to [`HEADER_ALIGN`] and point into a slab.
    #[inline]
    pub unsafe fn from_addr(addr: NonNull<u8>) -> Self {
        debug_assert_eq!(addr.as_ptr() as usize % HEADER_ALIGN, 0, "misaligned block");
        Self(addr.cast())
    }

    /// Recovers the block from the pointer [`Block::payload`] handed out.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by [`Block::payload`].
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        unsafe { Self::from_addr(payload.sub(HEADER_SIZE)) }
    }

    /// Address of the header, which is also the start of the block.
    #[inline]
    pub fn addr(self) -> NonNull<u8> {
        self.0.cast()
    }

    /// First byte past the header. This is what callers get to write into.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        // A block is never smaller than its header, so this stays in bounds.
        unsafe { self.0.add(1).cast() }
    }

    #[inline]
    pub unsafe fn header(self) -> MemoryRangeHeader {
        unsafe { self.0.read() }
    }

    #[inline]
    pub unsafe fn write(self, header: MemoryRangeHeader) {
        unsafe { self.0.write(header) }
    }

    #[inline]
    pub unsafe fn size(self) -> usize {
        unsafe { self.header().size() }
    }

    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        unsafe { self.header().is_allocated() }
    }

    #[inline]
    pub unsafe fn is_prev_allocated(self) -> bool {
        unsafe { self.header().is_prev_allocated() }
    }

    #[inline]
    pub unsafe fn set_size(self, size: usize) {
        unsafe { (*self.0.as_ptr()).set_size(size) }
    }

    #[inline]
    pub unsafe fn set_allocated(self, allocated: bool) {
        unsafe { (*self.0.as_ptr()).set_flag(THIS_ALLOCATED, allocated) }
    }

    #[inline]
    pub unsafe fn set_prev_allocated(self, allocated: bool) {
        unsafe { (*self.0.as_ptr()).set_flag(PREV_ALLOCATED, allocated) }
    }

    /// The block starting right where this one ends.
    ///
    /// Slabs end with an allocated header-only block, so for any block that
    /// is not that terminator the result is a valid header.
    #[inline]
    pub unsafe fn block_after(self) -> Block {
        unsafe { Block(self.0.cast::<u8>().add(self.size()).cast()) }
    }

    /// The block right before this one, if it is free.
    ///
    /// Reads the end-of-block size marker the free block left in the word
    /// preceding this header.
    #[inline]
    pub unsafe fn free_block_before(self) -> Option<FreeBlock> {
        unsafe {
            if self.is_prev_allocated() {
                return None;
            }
            let prev_size = self.0.cast::<usize>().sub(1).read();

            Some(FreeBlock(self.0.cast::<u8>().sub(prev_size).cast()))
        }
    }

    /// Views this block through the free layout. Does not check or change
    /// the allocation bit.
    #[inline]
    pub fn as_free(self) -> FreeBlock {
        FreeBlock(self.0.cast())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:p})", self.0)
    }
}

/// Handle to a block using the [`FreeRangeHeader`] layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FreeBlock(NonNull<FreeRangeHeader>);

impl FreeBlock {
    #[inline]
    pub fn block(self) -> Block {
        Block(self.0.cast())
    }

    #[inline]
    pub unsafe fn size(self) -> usize {
        unsafe { self.block().size() }
    }

    #[inline]
    pub unsafe fn prev(self) -> FreeBlock {
        unsafe { FreeBlock((*self.0.as_ptr()).prev) }
    }

    #[inline]
    pub unsafe fn next(self) -> FreeBlock {
        unsafe { FreeBlock((*self.0.as_ptr()).next) }
    }

    #[inline]
    pub(crate) unsafe fn set_prev(self, prev: FreeBlock) {
        unsafe { (*self.0.as_ptr()).prev = prev.0 }
    }

    #[inline]
    pub(crate) unsafe fn set_next(self, next: FreeBlock) {
        unsafe { (*self.0.as_ptr()).next = next.0 }
    }

    /// Makes this block a list of its own.
    #[inline]
    pub(crate) unsafe fn make_singleton_list(self) {
        unsafe {
            self.set_prev(self);
            self.set_next(self);
        }
    }

    /// Location of the end-of-block size marker: the last word of the block.
    #[inline]
    fn marker_ptr(self, size: usize) -> *mut usize {
        self.0.as_ptr().cast::<u8>().wrapping_add(size).cast::<usize>().wrapping_sub(1)
    }

    #[inline]
    pub unsafe fn end_of_block_marker(self) -> usize {
        unsafe { self.marker_ptr(self.size()).read() }
    }

    /// Copies the block size into the last word of the block so the block
    /// after this one can find where this one starts.
    #[inline]
    pub unsafe fn set_end_of_block_size_marker(self) {
        unsafe {
            let size = self.size();
            self.marker_ptr(size).write(size);
        }
    }
}

impl fmt::Debug for FreeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeBlock({:p})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_memory::heap_slab;

    #[test]
    fn header_packs_flags_and_size() {
        let header = MemoryRangeHeader::new(4096, true, false);

        assert_eq!(header.size(), 4096);
        assert!(header.is_allocated());
        assert!(!header.is_prev_allocated());

        let header = MemoryRangeHeader::new(MAX_BLOCK_SIZE, false, true);
        assert_eq!(header.size(), MAX_BLOCK_SIZE);
        assert!(!header.is_allocated());
        assert!(header.is_prev_allocated());
    }

    #[test]
    fn setters_leave_other_fields_alone() {
        let mut header = MemoryRangeHeader::new(64, true, true);

        header.set_size(128);
        assert_eq!(header, MemoryRangeHeader::new(128, true, true));

        header.set_flag(THIS_ALLOCATED, false);
        assert_eq!(header, MemoryRangeHeader::new(128, false, true));

        header.set_flag(PREV_ALLOCATED, false);
        assert_eq!(header, MemoryRangeHeader::new(128, false, false));
    }

    #[test]
    fn sizes_are_word_multiples() {
        assert_eq!(HEADER_SIZE, mem::size_of::<usize>());
        assert_eq!(MIN_BLOCK_SIZE % HEADER_ALIGN, 0);
        assert_eq!(MIN_BLOCK_SIZE, 4 * mem::size_of::<usize>());
    }

    #[test]
    fn traversal_in_both_directions() {
        let (_buf, slab) = heap_slab(128);

        unsafe {
            let free = Block::from_addr(slab.base()).as_free();
            free.block().write(MemoryRangeHeader::new(64, false, true));
            free.set_end_of_block_size_marker();

            let next = free.block().block_after();
            next.write(MemoryRangeHeader::new(64, true, false));

            assert_eq!(next.addr().as_ptr(), slab.as_ptr().add(64));
            assert_eq!(free.end_of_block_marker(), 64);
            assert_eq!(next.free_block_before(), Some(free));

            // Once the predecessor is allocated there is no marker to read.
            free.block().set_allocated(true);
            next.set_prev_allocated(true);
            assert_eq!(next.free_block_before(), None);
        }
    }

    #[test]
    fn payload_round_trip() {
        let (_buf, slab) = heap_slab(64);

        unsafe {
            let block = Block::from_addr(slab.base());
            assert_eq!(block.payload().as_ptr(), slab.as_ptr().add(HEADER_SIZE));
            assert_eq!(Block::from_payload(block.payload()), block);
        }
    }

    #[test]
    fn debug_output_names_fields() {
        let header = MemoryRangeHeader::new(32, false, true);
        let text = format!("{header:?}");

        assert!(text.contains("size: 32"));
        assert!(text.contains("prev_allocated: true"));
    }
}
