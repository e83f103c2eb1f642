//! Consistency checks over the code slabs and the free list.
//!
//! Nothing here mutates memory. These walks are what the tests use to check
//! the engine, and what [`crate::JitMemoryManager::check_invariants`] exposes.

use rustc_hash::FxHashSet;

use crate::{
    block::{Block, FreeBlock, HEADER_SIZE},
    slab::Slab,
};

/// One block as seen by an address ordered walk of a slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub address: usize,
    /// Size of the block, header included.
    pub size: usize,
    pub allocated: bool,
}

/// Lists the blocks of a seeded slab in address order.
///
/// # Safety
///
/// `slab` must be a seeded code slab whose headers are consistent.
pub unsafe fn walk_slab(slab: &Slab) -> Vec<BlockInfo> {
    let mut blocks = Vec::new();
    let mut block = unsafe { Block::from_addr(slab.base()) };

    while slab.contains(block.addr().as_ptr()) {
        let header = unsafe { block.header() };
        blocks.push(BlockInfo {
            address: block.addr().as_ptr() as usize,
            size: header.size(),
            allocated: header.is_allocated(),
        });
        block = unsafe { block.block_after() };
    }

    blocks
}

fn slab_of(slabs: &[Slab], ptr: *const u8) -> Option<&Slab> {
    slabs.iter().find(|slab| slab.contains(ptr))
}

/// Checks every structural invariant of the allocator and describes the
/// first one that does not hold.
///
/// - every free list node lies inside one of `slabs` and `next.prev` points
///   back to it;
/// - walking each slab block by block, every free block is in the free list
///   and its end-of-block marker equals its size;
/// - the `prev allocated` bit of every block matches the allocation bit of
///   the block before it, and the first block of a slab claims an allocated
///   predecessor;
/// - no two free blocks are next to each other.
///
/// # Safety
///
/// `slabs` must be the live code slabs and `free_list` a block inside them.
/// Corruption is detected as long as it does not send the walk through
/// pointers outside `slabs`, which the walk checks before following them.
pub unsafe fn check_invariants(slabs: &[Slab], free_list: FreeBlock) -> Result<(), String> {
    let mut free_set = FxHashSet::default();

    let head = free_list;
    let mut node = head;
    loop {
        let addr = node.block().addr().as_ptr();
        if slab_of(slabs, addr).is_none() {
            return Err(format!("corrupt free list; points to {addr:p}"));
        }
        if !free_set.insert(addr as usize) {
            return Err(format!("free list loops back to {addr:p} without reaching its head"));
        }

        let next = unsafe { node.next() };
        let next_addr = next.block().addr().as_ptr();
        if slab_of(slabs, next_addr).is_none() {
            return Err(format!("corrupt free list; {addr:p} links to {next_addr:p}"));
        }
        if unsafe { next.prev() } != node {
            return Err(format!("next and prev links of {addr:p} do not match"));
        }

        node = next;
        if node == head {
            break;
        }
    }

    for slab in slabs {
        let mut block = unsafe { Block::from_addr(slab.base()) };
        let mut last_allocated: Option<bool> = None;

        while slab.contains(block.addr().as_ptr()) {
            let header = unsafe { block.header() };
            let addr = block.addr().as_ptr();

            if header.size() < HEADER_SIZE {
                return Err(format!(
                    "block at {addr:p} has size {} smaller than a header",
                    header.size()
                ));
            }
            if header.size() > slab.end() as usize - addr as usize {
                return Err(format!("size of block at {addr:p} points out of its slab"));
            }

            if !header.is_allocated() {
                if !free_set.contains(&(addr as usize)) {
                    return Err(format!("found free block at {addr:p} that is not in the free list"));
                }

                let marker = unsafe { block.as_free().end_of_block_marker() };
                if marker != header.size() {
                    return Err(format!(
                        "end-of-block size marker ({marker}) and block size ({}) don't match at {addr:p}",
                        header.size()
                    ));
                }
            }

            match last_allocated {
                Some(last) if last != header.is_prev_allocated() => {
                    return Err(format!(
                        "block at {addr:p} has prev_allocated {} but the block before it has allocated {}",
                        header.is_prev_allocated(),
                        last
                    ));
                }
                Some(false) if !header.is_allocated() => {
                    return Err(format!("free block at {addr:p} follows another free block"));
                }
                None if !header.is_prev_allocated() => {
                    return Err(format!("first block of slab at {addr:p} should have prev_allocated set"));
                }
                _ => {}
            }

            last_allocated = Some(header.is_allocated());
            block = unsafe { block.block_after() };
        }
    }

    Ok(())
}
