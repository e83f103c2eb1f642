//! The free list and the operations that move blocks in and out of it.
//!
//! Free blocks of every code slab are chained into one circular doubly
//! linked list. The links live inside the free blocks themselves (see
//! [`crate::block::FreeRangeHeader`]), so the list needs no storage of its own
//! and any free block can be used as its head.
//!
//! ```text
//!        +--------------------------------------------------+
//!        v                                                  |
//! +------------+     +------------+     +------------+      |
//! | Free block | --> | Free block | --> | Tombstone  | -----+
//! +------------+     +------------+     +------------+
//! ```
//!
//! Every code slab contributes a minimum sized tombstone that is never
//! allocated, so the list is never empty and none of the operations below
//! need an empty-list case.

use crate::{
    block::{Block, FreeBlock, HEADER_ALIGN, MIN_BLOCK_SIZE, MemoryRangeHeader},
    utils::align,
};

impl FreeBlock {
    /// Unlinks this block and returns the block that followed it.
    pub unsafe fn remove_from_free_list(self) -> FreeBlock {
        unsafe {
            let prev = self.prev();
            let next = self.next();
            debug_assert!(
                next.prev() == self && prev.next() == self,
                "free list broken"
            );

            next.set_prev(prev);
            prev.set_next(next);

            next
        }
    }

    /// Links this block right before `free_list`.
    pub unsafe fn add_to_free_list(self, free_list: FreeBlock) {
        unsafe {
            let prev = free_list.prev();

            self.set_next(free_list);
            self.set_prev(prev);
            prev.set_next(self);
            free_list.set_prev(self);
        }
    }

    /// Hands out this whole block.
    ///
    /// Returns a block that is still in the free list, to be used as the new
    /// head: this block may have been the one the caller was holding.
    pub unsafe fn allocate_block(self) -> FreeBlock {
        unsafe {
            let block = self.block();
            let following = block.block_after();
            debug_assert!(
                !block.is_allocated() && !following.is_prev_allocated(),
                "cannot allocate an allocated block"
            );

            block.set_allocated(true);
            following.set_prev_allocated(true);

            let next = self.remove_from_free_list();
            debug_assert!(next != self, "allocated the last free block");
            next
        }
    }

    /// Extends this block up to `new_size`, swallowing whatever follows it.
    pub unsafe fn grow_block(self, new_size: usize) {
        unsafe {
            debug_assert!(new_size > self.size(), "not growing block");

            self.block().set_size(new_size);
            self.set_end_of_block_size_marker();
            self.block().block_after().set_prev_allocated(false);
        }
    }
}

impl Block {
    /// Returns this allocated block to the free list, coalescing it with a
    /// free block on either side.
    ///
    /// Returns the block to use as the free list head from now on, which may
    /// differ from `free_list` if `free_list` was merged away.
    pub unsafe fn free_block(self, mut free_list: FreeBlock) -> FreeBlock {
        unsafe {
            assert!(self.is_allocated(), "this block is already free");

            let mut following = self.block_after();
            debug_assert!(following.is_prev_allocated(), "flags out of sync");

            let mut free_list_to_return = Some(free_list);

            // If the block after this one is free, merge it into this block.
            if !following.is_allocated() {
                let following_free = following.as_free();

                // The head has to stay a valid free block. If it is the one
                // being absorbed, move to its neighbour.
                if following_free == free_list {
                    free_list = following_free.next();
                    free_list_to_return = None;
                    debug_assert!(following_free != free_list, "no tombstone block");
                }
                following_free.remove_from_free_list();

                self.set_size(self.size() + following_free.size());
                following = self.block_after();
                following.set_prev_allocated(true);
            }

            debug_assert!(following.is_allocated(), "missed coalescing");

            // If the block before is free, it simply grows over this one.
            if let Some(prev_free) = self.free_block_before() {
                prev_free.grow_block(prev_free.size() + self.size());
                return free_list_to_return.unwrap_or(prev_free);
            }

            let free = self.as_free();
            following.set_prev_allocated(false);
            self.set_allocated(false);

            free.add_to_free_list(free_list);
            free.set_end_of_block_size_marker();

            free_list_to_return.unwrap_or(free)
        }
    }

    /// Shrinks this allocated block to `new_size` bytes (header included),
    /// turning the tail into a new free block.
    ///
    /// Nothing happens when the tail would not be larger than a minimum
    /// block. If the block after this one was freed in the meantime, the
    /// tail absorbs it. Returns the free list head to use from now on.
    pub unsafe fn trim_allocation_to_size(self, mut free_list: FreeBlock, new_size: usize) -> FreeBlock {
        unsafe {
            assert!(
                self.is_allocated() && self.block_after().is_prev_allocated(),
                "cannot trim a block that is not allocated"
            );

            let new_size = align(new_size.max(MIN_BLOCK_SIZE), HEADER_ALIGN);
            assert!(
                new_size <= self.size(),
                "trimming to {} bytes a block of {} bytes",
                new_size,
                self.size()
            );

            if self.size() <= new_size + MIN_BLOCK_SIZE {
                return free_list;
            }

            let mut following = self.block_after();
            if !following.is_allocated() {
                let following_free = following.as_free();
                if following_free == free_list {
                    free_list = following_free.next();
                    debug_assert!(following_free != free_list, "no tombstone block");
                }
                following_free.remove_from_free_list();
                following = following.block_after();
            }

            self.set_size(new_size);

            let tail = self.block_after().as_free();
            let tail_size = following.addr().as_ptr() as usize - tail.block().addr().as_ptr() as usize;
            tail.block().write(MemoryRangeHeader::new(tail_size, false, true));
            tail.set_end_of_block_size_marker();
            following.set_prev_allocated(false);
            tail.add_to_free_list(free_list);

            tail
        }
    }
}

/// Walks every block of a free list once, starting at `head`.
pub struct FreeListIter {
    head: FreeBlock,
    current: Option<FreeBlock>,
}

impl Iterator for FreeListIter {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        let next = unsafe { current.next() };
        self.current = (next != self.head).then_some(next);

        Some(current)
    }
}

/// # Safety
///
/// `head` must belong to a well formed free list that stays untouched while
/// the iterator is alive.
pub unsafe fn iter(head: FreeBlock) -> FreeListIter {
    FreeListIter {
        head,
        current: Some(head),
    }
}

/// Finds the biggest block of the list. This is a linear scan.
///
/// # Safety
///
/// Same as [`iter`].
pub unsafe fn largest_free_block(head: FreeBlock) -> FreeBlock {
    let mut candidate = head;
    let mut largest = unsafe { head.size() };

    for block in unsafe { iter(head) } {
        let size = unsafe { block.size() };
        if size > largest {
            largest = size;
            candidate = block;
        }
    }

    candidate
}
