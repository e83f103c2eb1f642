//! Heap backed stand-ins for OS mappings, so tests get slabs of any size.

use std::{
    alloc::{self, Layout},
    cell::RefCell,
    ptr::NonNull,
    rc::Rc,
};

use crate::{error::AllocError, kernel::PlatformMemory, slab::Slab};

/// A zeroed, word aligned buffer of `size` bytes and the slab covering it.
/// The buffer must outlive every use of the slab.
pub(crate) fn heap_slab(size: usize) -> (Vec<u64>, Slab) {
    let mut buf = vec![0u64; size.div_ceil(8)];
    let base = NonNull::new(buf.as_mut_ptr().cast::<u8>()).expect("vec pointer is never null");
    let slab = unsafe { Slab::from_raw_parts(base, size) };

    (buf, slab)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protection {
    Writable,
    Executable,
}

#[derive(Debug, Default)]
pub(crate) struct HeapState {
    /// Slabs handed out and not released yet.
    pub live: Vec<Slab>,
    /// Sizes requested, in order.
    pub requests: Vec<usize>,
    /// How many requests carried a placement hint.
    pub hinted: usize,
    /// Protection changes, in order.
    pub protections: Vec<(usize, Protection)>,
    /// Refuse every mapping request from now on.
    pub fail: bool,
}

/// [`PlatformMemory`] over the global allocator. Sizes are only rounded to
/// 16 bytes and every call is recorded in a state shared with the test.
#[derive(Debug, Clone, Default)]
pub(crate) struct HeapMemory {
    pub state: Rc<RefCell<HeapState>>,
}

const HEAP_ALIGN: usize = 16;

impl HeapMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlatformMemory for HeapMemory {
    fn allocate_rwx(&self, size: usize, near: Option<&Slab>) -> Result<Slab, AllocError> {
        let mut state = self.state.borrow_mut();
        state.requests.push(size);
        if near.is_some() {
            state.hinted += 1;
        }
        if state.fail {
            return Err(AllocError::MapFailed {
                size,
                reason: "refused by test".to_string(),
            });
        }

        let len = size.max(1).checked_next_multiple_of(HEAP_ALIGN).unwrap_or(usize::MAX);
        let layout = Layout::from_size_align(len, HEAP_ALIGN).map_err(|err| AllocError::MapFailed {
            size,
            reason: err.to_string(),
        })?;
        let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or_else(|| AllocError::MapFailed {
            size,
            reason: "global allocator returned null".to_string(),
        })?;

        let slab = unsafe { Slab::from_raw_parts(base, len) };
        state.live.push(slab);
        Ok(slab)
    }

    unsafe fn release(&self, slab: Slab) -> Result<(), AllocError> {
        let mut state = self.state.borrow_mut();
        let Some(index) = state.live.iter().position(|live| *live == slab) else {
            return Err(AllocError::ReleaseFailed {
                base: slab.as_ptr() as usize,
                size: slab.size(),
                reason: "not a live slab".to_string(),
            });
        };
        state.live.swap_remove(index);

        unsafe {
            alloc::dealloc(
                slab.as_ptr(),
                Layout::from_size_align_unchecked(slab.size(), HEAP_ALIGN),
            );
        }
        Ok(())
    }

    unsafe fn set_writable(&self, slab: &Slab) -> Result<(), AllocError> {
        self.state
            .borrow_mut()
            .protections
            .push((slab.as_ptr() as usize, Protection::Writable));
        Ok(())
    }

    unsafe fn set_executable(&self, slab: &Slab) -> Result<(), AllocError> {
        self.state
            .borrow_mut()
            .protections
            .push((slab.as_ptr() as usize, Protection::Executable));
        Ok(())
    }

    fn page_size(&self) -> usize {
        HEAP_ALIGN
    }
}
