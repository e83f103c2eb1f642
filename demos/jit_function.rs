//! Emits a tiny function into JIT memory and calls it.
//!
//! The machine code is x86_64 only. On other targets the example just
//! allocates, prints and releases.

use std::ptr::NonNull;

use jitalloc::{FunctionId, JitMemoryManager};

/// `mov eax, 42; ret`
const RETURN_42: [u8; 6] = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];

fn log_blocks(jit: &JitMemoryManager) {
    for block in jit.blocks() {
        let state = if block.allocated { "allocated" } else { "free" };
        println!("  {:#x}: {} bytes, {state}", block.address, block.size);
    }
}

fn main() {
    let mut jit = JitMemoryManager::new();
    let function = FunctionId(42);

    let (start, available) = jit.start_function_body(function, RETURN_42.len());
    println!("Requested {} bytes of code memory", RETURN_42.len());
    println!("Received {available} bytes at {start:?}");

    let end: NonNull<u8> = unsafe {
        start
            .as_ptr()
            .copy_from_nonoverlapping(RETURN_42.as_ptr(), RETURN_42.len());
        start.add(RETURN_42.len())
    };
    jit.end_function_body(function, start, end);

    println!("Code slabs after emitting:");
    log_blocks(&jit);

    jit.set_memory_executable().expect("failed to make JIT memory executable");

    #[cfg(target_arch = "x86_64")]
    {
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(start.as_ptr()) };
        println!("JIT function returned {}", f());
    }

    jit.set_memory_writable().expect("failed to make JIT memory writable");
    jit.deallocate_mem_for_function(function);

    println!("Code slabs after releasing:");
    log_blocks(&jit);

    jit.check_invariants().expect("JIT memory is corrupted");
}
