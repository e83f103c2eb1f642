//! Executable memory management for JIT compilers.
//!
//! A [`JitMemoryManager`] maps slabs of memory from the OS and hands out
//! pieces of them to a code generator:
//!
//! - function bodies and exception tables come from *code slabs*, managed by
//!   an in-place free list with boundary tags so that freeing a function
//!   coalesces its block with free neighbours in constant time;
//! - stubs and globals come from two bump arenas and are only released when
//!   the manager is dropped.
//!
//! ```text
//!           code slab                       code slab
//! +-------------------------------+   +---------------------------+
//! | fn | free | fn | table | free |   | fn            | free      |
//! +-------------------------------+   +---------------------------+
//!        |             ^     |  ^          ^       |
//!        +-------------+     +--+----------+-------+
//!                    circular free list
//! ```
//!
//! Slabs are mapped readable, writable and executable. The manager can flip
//! its code slabs between writable and executable with
//! [`JitMemoryManager::set_memory_writable`] and
//! [`JitMemoryManager::set_memory_executable`].
//!
//! The lower level pieces are public as well: [`block`] and [`freelist`]
//! implement the free list over raw memory, [`bump`] the arenas and
//! [`kernel`] the OS abstraction.

pub mod block;
pub mod bump;
mod config;
mod error;
pub mod freelist;
pub mod invariants;
pub mod kernel;
mod manager;
pub mod slab;
mod utils;

#[cfg(test)]
mod test_memory;

pub use config::{DEFAULT_CODE_SLAB_SIZE, DEFAULT_SIZE_THRESHOLD, DEFAULT_SLAB_SIZE, MemoryManagerConfig};
pub use error::AllocError;
pub use invariants::BlockInfo;
pub use kernel::{Kernel, PlatformMemory};
pub use manager::{FunctionId, GOT_ENTRIES, JitMemoryManager};
pub use slab::{POISON_BYTE, Slab};
