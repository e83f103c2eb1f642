use std::sync::OnceLock;

use crate::{error::AllocError, slab::Slab};

/// Virtual memory page size of the computer. This is usually 4096.
/// We don't know the value at compile time so it is queried once and cached.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// This trait provides an abstraction over the low level memory operations
/// the JIT memory manager needs. The manager itself has nothing to do with
/// the concrete syscalls offered by each kernel, it only asks for slabs,
/// flips their protection and hands them back on teardown.
///
/// Implementations own nothing: the manager keeps track of every [`Slab`]
/// it obtained and releases each of them exactly once.
pub trait PlatformMemory {
    /// Maps at least `size` bytes of readable, writable and executable memory.
    ///
    /// When `near` is given, the mapping should be placed right after that
    /// slab if the platform allows it. The hint is advisory.
    fn allocate_rwx(&self, size: usize, near: Option<&Slab>) -> Result<Slab, AllocError>;

    /// Returns `slab` to the OS.
    ///
    /// # Safety
    ///
    /// `slab` must come from [`PlatformMemory::allocate_rwx`] on this same
    /// implementation and nothing may reference its memory afterwards.
    unsafe fn release(&self, slab: Slab) -> Result<(), AllocError>;

    /// Makes `slab` readable and writable (not executable).
    ///
    /// # Safety
    ///
    /// No code inside `slab` may be running or called until it is made
    /// executable again.
    unsafe fn set_writable(&self, slab: &Slab) -> Result<(), AllocError>;

    /// Makes `slab` readable and executable (not writable).
    ///
    /// # Safety
    ///
    /// Nothing may write into `slab` until it is made writable again.
    unsafe fn set_executable(&self, slab: &Slab) -> Result<(), AllocError>;

    /// Returns the granularity mappings are rounded up to.
    fn page_size(&self) -> usize;
}

/// The system implementation of [`PlatformMemory`]: `mmap` and friends on
/// unix, `VirtualAlloc` and friends on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct Kernel;

impl Kernel {
    pub const fn new() -> Self {
        Self
    }
}

/// Wrapper to calculate the computer's page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe { platform::page_size() })
}

impl PlatformMemory for Kernel {
    fn allocate_rwx(&self, size: usize, near: Option<&Slab>) -> Result<Slab, AllocError> {
        let len = size
            .max(1)
            .checked_next_multiple_of(self.page_size())
            .ok_or_else(|| AllocError::MapFailed {
                size,
                reason: "size overflows the address space".to_string(),
            })?;
        let hint = near.map(|slab| slab.end() as usize);

        if let Some(base) = unsafe { platform::request_memory(len, hint) } {
            return Ok(unsafe { Slab::from_raw_parts(base, len) });
        }

        // The hint may be unusable (already mapped, misaligned for the
        // platform). Try again anywhere before giving up.
        if hint.is_some() {
            tracing::debug!(len, "near mapping failed, retrying without placement hint");
            if let Some(base) = unsafe { platform::request_memory(len, None) } {
                return Ok(unsafe { Slab::from_raw_parts(base, len) });
            }
        }

        Err(AllocError::MapFailed {
            size: len,
            reason: std::io::Error::last_os_error().to_string(),
        })
    }

    unsafe fn release(&self, slab: Slab) -> Result<(), AllocError> {
        if unsafe { platform::return_memory(slab.as_ptr(), slab.size()) } {
            Ok(())
        } else {
            Err(AllocError::ReleaseFailed {
                base: slab.as_ptr() as usize,
                size: slab.size(),
                reason: std::io::Error::last_os_error().to_string(),
            })
        }
    }

    unsafe fn set_writable(&self, slab: &Slab) -> Result<(), AllocError> {
        unsafe { platform::make_writable(slab.as_ptr(), slab.size()) }.map_err(|reason| {
            AllocError::ProtectFailed {
                base: slab.as_ptr() as usize,
                size: slab.size(),
                reason,
            }
        })
    }

    unsafe fn set_executable(&self, slab: &Slab) -> Result<(), AllocError> {
        unsafe { platform::make_executable(slab.as_ptr(), slab.size()) }.map_err(|reason| {
            AllocError::ProtectFailed {
                base: slab.as_ptr() as usize,
                size: slab.size(),
                reason,
            }
        })
    }

    fn page_size(&self) -> usize {
        page_size()
    }
}

#[cfg(unix)]
mod platform {
    use libc::{mmap, mprotect, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::{self, NonNull},
    };

    /// Request a memory region of `len` bytes, optionally at `hint`.
    pub(super) unsafe fn request_memory(len: usize, hint: Option<usize>) -> Option<NonNull<u8>> {
        // Read-Write-Execute memory.
        const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
        const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        const FD: c_int = -1;
        const OFFSET: off_t = 0;

        let addr = hint.map_or(ptr::null_mut(), |hint| hint as *mut c_void);

        unsafe {
            let addr = mmap(addr, len as size_t, PROT, FLAGS, FD, OFFSET);

            if addr == libc::MAP_FAILED {
                None
            } else {
                NonNull::new(addr.cast::<u8>())
            }
        }
    }

    pub(super) unsafe fn return_memory(addr: *mut u8, len: usize) -> bool {
        unsafe { munmap(addr as *mut c_void, len as size_t) == 0 }
    }

    pub(super) unsafe fn make_writable(addr: *mut u8, len: usize) -> Result<(), String> {
        protect(addr, len, libc::PROT_READ | libc::PROT_WRITE)
    }

    pub(super) unsafe fn make_executable(addr: *mut u8, len: usize) -> Result<(), String> {
        protect(addr, len, libc::PROT_READ | libc::PROT_EXEC)
    }

    fn protect(addr: *mut u8, len: usize, prot: c_int) -> Result<(), String> {
        match unsafe { mprotect(addr as *mut c_void, len as size_t, prot) } {
            0 => Ok(()),
            _ => Err(std::io::Error::last_os_error().to_string()),
        }
    }

    pub(super) unsafe fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
    }
}

#[cfg(windows)]
mod platform {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use windows::Win32::System::{Diagnostics::Debug, Memory, SystemInformation, Threading};

    use crate::utils::align;

    pub(super) unsafe fn request_memory(len: usize, hint: Option<usize>) -> Option<NonNull<u8>> {
        let protection = Memory::PAGE_EXECUTE_READWRITE;
        let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

        // Reservations start on allocation granularity boundaries, so round
        // the hint up or VirtualAlloc would overlap the previous slab.
        let addr = hint.map(|hint| align(hint, allocation_granularity()) as *const c_void);

        unsafe {
            let addr = Memory::VirtualAlloc(addr, len, flags, protection);

            NonNull::new(addr.cast())
        }
    }

    pub(super) unsafe fn return_memory(addr: *mut u8, _len: usize) -> bool {
        unsafe { Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE).is_ok() }
    }

    pub(super) unsafe fn make_writable(addr: *mut u8, len: usize) -> Result<(), String> {
        let mut old = Memory::PAGE_PROTECTION_FLAGS(0);
        unsafe {
            Memory::VirtualProtect(addr as *const c_void, len, Memory::PAGE_READWRITE, &mut old)
                .map_err(|err| err.to_string())
        }
    }

    pub(super) unsafe fn make_executable(addr: *mut u8, len: usize) -> Result<(), String> {
        let mut old = Memory::PAGE_PROTECTION_FLAGS(0);
        unsafe {
            Memory::VirtualProtect(addr as *const c_void, len, Memory::PAGE_EXECUTE_READ, &mut old)
                .map_err(|err| err.to_string())?;

            Debug::FlushInstructionCache(
                Threading::GetCurrentProcess(),
                Some(addr as *const c_void),
                len,
            )
            .map_err(|err| err.to_string())
        }
    }

    fn system_info() -> SystemInformation::SYSTEM_INFO {
        unsafe {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init()
        }
    }

    fn allocation_granularity() -> usize {
        system_info().dwAllocationGranularity as usize
    }

    pub(super) unsafe fn page_size() -> usize {
        system_info().dwPageSize as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert_eq!(Kernel.page_size(), page_size());
    }

    #[test]
    fn mappings_are_rounded_to_pages() {
        let kernel = Kernel::new();
        let slab = kernel.allocate_rwx(100, None).expect("mmap failed");

        assert_eq!(slab.size(), page_size());
        assert_eq!(slab.as_ptr() as usize % page_size(), 0);

        unsafe {
            // Fresh mappings are writable.
            slab.as_ptr().write(0xC3);
            assert_eq!(slab.as_ptr().read(), 0xC3);

            kernel.release(slab).expect("munmap failed");
        }
    }

    #[test]
    fn oversized_mappings_are_refused() {
        let err = Kernel::new().allocate_rwx(usize::MAX, None).unwrap_err();

        assert!(matches!(err, AllocError::MapFailed { size: usize::MAX, .. }), "{err}");
    }

    #[test]
    fn near_hint_still_yields_a_mapping() {
        let kernel = Kernel::new();
        let first = kernel.allocate_rwx(page_size(), None).expect("mmap failed");
        let second = kernel
            .allocate_rwx(page_size() * 2, Some(&first))
            .expect("mmap failed");

        assert_eq!(second.size(), page_size() * 2);
        assert!(!first.contains(second.as_ptr()));

        unsafe {
            kernel.release(second).expect("munmap failed");
            kernel.release(first).expect("munmap failed");
        }
    }

    #[test]
    fn protection_round_trip() {
        let kernel = Kernel::new();
        let slab = kernel.allocate_rwx(1, None).expect("mmap failed");

        unsafe {
            kernel.set_executable(&slab).expect("mprotect RX failed");
            kernel.set_writable(&slab).expect("mprotect RW failed");
            slab.as_ptr().write(0x90);
            assert_eq!(slab.as_ptr().read(), 0x90);

            kernel.release(slab).expect("munmap failed");
        }
    }
}
