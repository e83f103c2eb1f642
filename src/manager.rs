use std::{fmt, ptr::NonNull};

use rustc_hash::FxHashMap;

use crate::{
    block::{Block, FreeBlock, HEADER_SIZE, MIN_BLOCK_SIZE},
    bump::{BumpArena, SlabSource},
    config::MemoryManagerConfig,
    error::AllocError,
    freelist,
    invariants::{self, BlockInfo},
    kernel::{Kernel, PlatformMemory},
    slab::{self, POISON_BYTE, SLAB_SENTINEL_SIZE, Slab},
    utils::{align_ptr, normalize_alignment},
};

/// Number of pointer sized entries in the global offset table.
pub const GOT_ENTRIES: usize = 8192;

/// Identifies a function of the code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u64);

impl From<u64> for FunctionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// What a slab is going to be used for. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabKind {
    Code,
    Stub,
    Data,
}

/// The block being filled between a start and an end call.
#[derive(Debug, Clone, Copy)]
enum Emission {
    Function(FunctionId, Block),
    ExceptionTable(FunctionId, Block),
}

/// Maps slabs for the manager and its arenas.
///
/// Borrows only the fields involved so an arena can be borrowed mutably
/// at the same time.
struct SlabMapper<'a, M: PlatformMemory> {
    memory: &'a M,
    last_slab: &'a mut Option<Slab>,
    total_slabs: &'a mut usize,
    poison: bool,
    kind: SlabKind,
}

impl<M: PlatformMemory> SlabMapper<'_, M> {
    /// Maps a new slab right after the last one. Failing to map memory is fatal.
    fn map(&mut self, size: usize) -> Slab {
        let near = *self.last_slab;
        let slab = match self.memory.allocate_rwx(size, near.as_ref()) {
            Ok(slab) => slab,
            Err(err) => fatal(err),
        };

        *self.last_slab = Some(slab);
        *self.total_slabs += 1;

        tracing::debug!(
            kind = ?self.kind,
            size = slab.size(),
            base = ?slab.base(),
            "mapped new JIT slab"
        );

        if self.poison {
            unsafe { slab.poison() };
        }

        slab
    }
}

impl<M: PlatformMemory> SlabSource for SlabMapper<'_, M> {
    fn allocate_slab(&mut self, size: usize) -> Slab {
        self.map(size)
    }
}

fn too_big(size: usize) -> AllocError {
    AllocError::MapFailed {
        size,
        reason: "size overflows the address space".to_string(),
    }
}

fn fatal(err: AllocError) -> ! {
    tracing::error!(%err, "out of JIT memory");
    panic!("Allocation failed when allocating new memory in the JIT: {err}");
}

/// Hands out executable memory to a JIT code generator.
///
/// Function bodies and exception tables come out of code slabs managed by a
/// boundary tagged, coalescing free list, so they can be released one by
/// one. Stubs and globals come out of two bump arenas and live until the
/// manager is dropped.
///
/// Emitting a function follows a start/end protocol. The manager cannot
/// know up front how much code will be generated, so it reserves the
/// largest free block and trims it once the real size is known:
///
/// ```
/// use jitalloc::{FunctionId, JitMemoryManager};
///
/// let mut jit = JitMemoryManager::new();
/// let function = FunctionId(1);
///
/// let (start, available) = jit.start_function_body(function, 64);
/// assert!(available >= 64);
/// let code = [0xC3u8];
/// unsafe { start.as_ptr().copy_from_nonoverlapping(code.as_ptr(), code.len()) };
/// let end = unsafe { start.add(code.len()) };
/// jit.end_function_body(function, start, end);
///
/// jit.deallocate_mem_for_function(function);
/// assert_eq!(jit.check_invariants(), Ok(()));
/// ```
///
/// The manager is not thread safe. It hands out raw pointers and is neither
/// `Send` nor `Sync`; every mutating operation takes `&mut self`.
pub struct JitMemoryManager<M: PlatformMemory = Kernel> {
    memory: M,
    config: MemoryManagerConfig,
    /// Any block of the free list.
    free_memory_list: FreeBlock,
    /// Set between a start call and the matching end call.
    current: Option<Emission>,
    code_slabs: Vec<Slab>,
    /// Most recently mapped slab, of any kind. New slabs are placed near it.
    last_slab: Option<Slab>,
    total_slabs: usize,
    stub_allocator: BumpArena,
    data_allocator: BumpArena,
    function_blocks: FxHashMap<FunctionId, Block>,
    table_blocks: FxHashMap<FunctionId, Block>,
    got: Option<Box<[usize]>>,
    dlsym_table: Option<NonNull<u8>>,
}

impl JitMemoryManager<Kernel> {
    /// A manager with the default configuration, mapping memory from the OS.
    pub fn new() -> Self {
        Self::with_config(MemoryManagerConfig::default(), Kernel::new())
    }
}

impl Default for JitMemoryManager<Kernel> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: PlatformMemory> JitMemoryManager<M> {
    /// Builds a manager on top of `memory`. The first code slab is mapped
    /// right away.
    pub fn with_config(config: MemoryManagerConfig, memory: M) -> Self {
        let mut last_slab = None;
        let mut total_slabs = 0;

        let first_slab = SlabMapper {
            memory: &memory,
            last_slab: &mut last_slab,
            total_slabs: &mut total_slabs,
            poison: config.poison_memory,
            kind: SlabKind::Code,
        }
        .map(config.code_slab_size.max(slab::MIN_CODE_SLAB_SIZE));

        let free_memory_list = unsafe { slab::seed_code_slab(&first_slab, None) };

        Self {
            stub_allocator: BumpArena::new(config.stub_slab_size, config.size_threshold),
            data_allocator: BumpArena::new(config.data_slab_size, config.size_threshold),
            memory,
            config,
            free_memory_list,
            current: None,
            code_slabs: vec![first_slab],
            last_slab,
            total_slabs,
            function_blocks: FxHashMap::default(),
            table_blocks: FxHashMap::default(),
            got: None,
            dlsym_table: None,
        }
    }

    fn mapper(&mut self, kind: SlabKind) -> SlabMapper<'_, M> {
        SlabMapper {
            memory: &self.memory,
            last_slab: &mut self.last_slab,
            total_slabs: &mut self.total_slabs,
            poison: self.config.poison_memory,
            kind,
        }
    }

    /// Maps a code slab big enough for a block of `min_size` usable bytes
    /// and adds its free blocks to the free list. Returns the big block.
    fn allocate_new_code_slab(&mut self, min_size: usize) -> FreeBlock {
        // Room for the header, the sentinels and rounding `min_size` up to
        // the header size.
        let Some(padded_min) = min_size
            .checked_add(HEADER_SIZE - 1 + HEADER_SIZE + SLAB_SENTINEL_SIZE)
            .map(|size| size & !(HEADER_SIZE - 1))
        else {
            fatal(too_big(min_size));
        };
        let slab_size = self.config.code_slab_size.max(padded_min);

        let slab = self.mapper(SlabKind::Code).map(slab_size);
        self.code_slabs.push(slab);

        let block = unsafe { slab::seed_code_slab(&slab, Some(self.free_memory_list)) };
        debug_assert!(
            unsafe { block.size() } - HEADER_SIZE >= min_size,
            "the block was too small"
        );

        block
    }

    /// Takes the largest free block out of the free list, mapping a new code
    /// slab first if that block can't hold `size_hint` bytes.
    fn reserve_largest_block(&mut self, size_hint: usize) -> Block {
        let mut candidate = unsafe { freelist::largest_free_block(self.free_memory_list) };
        let largest = unsafe { candidate.size() } - HEADER_SIZE;

        if largest < size_hint || largest <= MIN_BLOCK_SIZE {
            tracing::debug!(size_hint, largest, "allocating another code slab");
            candidate = self.allocate_new_code_slab(size_hint.max(MIN_BLOCK_SIZE + HEADER_SIZE));
        }

        self.free_memory_list = unsafe { candidate.allocate_block() };
        candidate.block()
    }

    fn assert_idle(&self, operation: &str) {
        assert!(
            self.current.is_none(),
            "{operation} called while {:?} is still being emitted",
            self.current
        );
    }

    /// Starts emitting the body of `function`.
    ///
    /// Returns where to write the code and how many bytes are available
    /// there. That is usually much more than `size_hint`, which only decides
    /// when a new slab is needed. Must be followed by
    /// [`JitMemoryManager::end_function_body`] before anything else is
    /// allocated from the code slabs.
    pub fn start_function_body(&mut self, function: FunctionId, size_hint: usize) -> (NonNull<u8>, usize) {
        self.assert_idle("start_function_body");

        let block = self.reserve_largest_block(size_hint);
        self.current = Some(Emission::Function(function, block));

        let actual_size = unsafe { block.size() } - HEADER_SIZE;
        tracing::trace!(%function, size_hint, actual_size, "start function body");

        (block.payload(), actual_size)
    }

    /// Finishes the body started by [`JitMemoryManager::start_function_body`].
    ///
    /// `start` must be the pointer it returned and `end` one past the last
    /// byte written. The unused tail goes back to the free list.
    pub fn end_function_body(&mut self, function: FunctionId, start: NonNull<u8>, end: NonNull<u8>) {
        let Some(Emission::Function(current, block)) = self.current else {
            panic!("end_function_body without a matching start_function_body");
        };
        assert_eq!(current, function, "mismatched function start/end");

        self.finish_emission(block, start, end);
        if self.function_blocks.insert(function, block).is_some() {
            tracing::warn!(%function, "function emitted again without being deallocated first");
        }
        tracing::trace!(%function, size = unsafe { block.size() }, "end function body");
    }

    /// Starts emitting the exception table of `function`. Same protocol as
    /// [`JitMemoryManager::start_function_body`].
    pub fn start_exception_table(&mut self, function: FunctionId, size_hint: usize) -> (NonNull<u8>, usize) {
        self.assert_idle("start_exception_table");

        let block = self.reserve_largest_block(size_hint);
        self.current = Some(Emission::ExceptionTable(function, block));

        let actual_size = unsafe { block.size() } - HEADER_SIZE;
        tracing::trace!(%function, size_hint, actual_size, "start exception table");

        (block.payload(), actual_size)
    }

    /// Finishes the table started by [`JitMemoryManager::start_exception_table`].
    pub fn end_exception_table(&mut self, function: FunctionId, start: NonNull<u8>, end: NonNull<u8>) {
        let Some(Emission::ExceptionTable(current, block)) = self.current else {
            panic!("end_exception_table without a matching start_exception_table");
        };
        assert_eq!(current, function, "mismatched table start/end");

        self.finish_emission(block, start, end);
        if self.table_blocks.insert(function, block).is_some() {
            tracing::warn!(%function, "exception table emitted again without being deallocated first");
        }
        tracing::trace!(%function, size = unsafe { block.size() }, "end exception table");
    }

    fn finish_emission(&mut self, block: Block, start: NonNull<u8>, end: NonNull<u8>) {
        assert!(end > start, "emission must end after it starts");
        assert_eq!(start, block.payload(), "mismatched start/end");

        self.current = None;

        let block_size = end.as_ptr() as usize - block.addr().as_ptr() as usize;
        self.free_memory_list = unsafe { block.trim_allocation_to_size(self.free_memory_list, block_size) };
    }

    /// Allocates `size` bytes aligned to `alignment` (zero means one) from the
    /// code slabs in one step. The block is trimmed right away and is never
    /// associated with a function.
    pub fn allocate_space(&mut self, size: usize, alignment: usize) -> NonNull<u8> {
        self.assert_idle("allocate_space");
        let alignment = normalize_alignment(alignment);
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");

        let Some(padded_size) = size.checked_add(alignment - 1) else {
            fatal(too_big(size));
        };
        let block = self.reserve_largest_block(padded_size);
        let result = align_ptr(block.payload().as_ptr(), alignment);

        let block_size = result as usize + size - block.addr().as_ptr() as usize;
        self.free_memory_list = unsafe { block.trim_allocation_to_size(self.free_memory_list, block_size) };

        // `result` lies inside `block`, past its header.
        unsafe { NonNull::new_unchecked(result) }
    }

    /// Allocates a call stub for `owner`. Stubs are never freed individually.
    pub fn allocate_stub(&mut self, owner: FunctionId, size: usize, alignment: usize) -> NonNull<u8> {
        let mut source = SlabMapper {
            memory: &self.memory,
            last_slab: &mut self.last_slab,
            total_slabs: &mut self.total_slabs,
            poison: self.config.poison_memory,
            kind: SlabKind::Stub,
        };
        let stub = self.stub_allocator.allocate(size, alignment, &mut source);
        tracing::trace!(%owner, size, stub = ?stub, "allocated stub");

        stub
    }

    /// Allocates storage for a global. Globals are never freed individually.
    pub fn allocate_global(&mut self, size: usize, alignment: usize) -> NonNull<u8> {
        let mut source = SlabMapper {
            memory: &self.memory,
            last_slab: &mut self.last_slab,
            total_slabs: &mut self.total_slabs,
            poison: self.config.poison_memory,
            kind: SlabKind::Data,
        };

        self.data_allocator.allocate(size, alignment, &mut source)
    }

    /// Releases the body and the exception table of `function`, if any.
    ///
    /// Freeing writes block headers and free list links into the code slabs,
    /// and poisoning overwrites the released bytes, so the code slabs must
    /// be writable.
    pub fn deallocate_mem_for_function(&mut self, function: FunctionId) {
        if let Some(block) = self.function_blocks.remove(&function) {
            tracing::trace!(%function, "deallocating function body");
            self.release_block(block);
        }

        if let Some(block) = self.table_blocks.remove(&function) {
            tracing::trace!(%function, "deallocating exception table");
            self.release_block(block);
        }
    }

    /// Releases a function body given the pointer
    /// [`JitMemoryManager::start_function_body`] returned for it.
    pub fn deallocate_function_body(&mut self, body: NonNull<u8>) {
        let block = self.block_of(body);
        self.function_blocks.retain(|_, recorded| *recorded != block);
        self.release_block(block);
    }

    /// Releases an exception table given the pointer
    /// [`JitMemoryManager::start_exception_table`] returned for it.
    pub fn deallocate_exception_table(&mut self, table: NonNull<u8>) {
        let block = self.block_of(table);
        self.table_blocks.retain(|_, recorded| *recorded != block);
        self.release_block(block);
    }

    fn block_of(&self, payload: NonNull<u8>) -> Block {
        assert!(
            self.code_slabs.iter().any(|slab| slab.contains(payload.as_ptr())),
            "{payload:p} was not allocated from a code slab"
        );
        if let Some(Emission::Function(_, block) | Emission::ExceptionTable(_, block)) = self.current {
            assert!(block.payload() != payload, "{payload:p} is still being emitted");
        }

        unsafe { Block::from_payload(payload) }
    }

    fn release_block(&mut self, block: Block) {
        unsafe {
            assert!(block.is_allocated(), "block isn't allocated");

            if self.config.poison_memory {
                block
                    .payload()
                    .as_ptr()
                    .write_bytes(POISON_BYTE, block.size() - HEADER_SIZE);
            }

            self.free_memory_list = block.free_block(self.free_memory_list);
        }
    }

    /// Makes every code slab writable (and not executable).
    pub fn set_memory_writable(&mut self) -> Result<(), AllocError> {
        for slab in &self.code_slabs {
            unsafe { self.memory.set_writable(slab)? };
        }
        Ok(())
    }

    /// Makes every code slab executable (and not writable).
    pub fn set_memory_executable(&mut self) -> Result<(), AllocError> {
        for slab in &self.code_slabs {
            unsafe { self.memory.set_executable(slab)? };
        }
        Ok(())
    }

    /// Checks the free list and the block structure of every code slab.
    /// Returns a description of the first problem found.
    pub fn check_invariants(&self) -> Result<(), String> {
        unsafe { invariants::check_invariants(&self.code_slabs, self.free_memory_list) }
    }

    /// Every block of every code slab, in address order.
    pub fn blocks(&self) -> Vec<BlockInfo> {
        self.code_slabs
            .iter()
            .flat_map(|slab| unsafe { invariants::walk_slab(slab) })
            .collect()
    }

    /// Every block of the free list, starting at the current head.
    pub fn free_blocks(&self) -> Vec<BlockInfo> {
        unsafe {
            freelist::iter(self.free_memory_list)
                .map(|free| BlockInfo {
                    address: free.block().addr().as_ptr() as usize,
                    size: free.size(),
                    allocated: false,
                })
                .collect()
        }
    }

    /// Allocates the global offset table.
    pub fn allocate_got(&mut self) {
        assert!(self.got.is_none(), "cannot allocate the GOT multiple times");
        self.got = Some(vec![0; GOT_ENTRIES].into_boxed_slice());
    }

    /// Base of the global offset table, once allocated.
    pub fn got_base(&mut self) -> Option<NonNull<u8>> {
        self.got
            .as_mut()
            .map(|got| NonNull::from(&mut got[..]).cast::<u8>())
    }

    pub fn needs_got(&self) -> bool {
        self.got.is_some()
    }

    pub fn set_dlsym_table(&mut self, table: Option<NonNull<u8>>) {
        self.dlsym_table = table;
    }

    pub fn dlsym_table(&self) -> Option<NonNull<u8>> {
        self.dlsym_table
    }

    pub fn set_poison_memory(&mut self, poison: bool) {
        self.config.poison_memory = poison;
    }

    pub fn poison_memory(&self) -> bool {
        self.config.poison_memory
    }

    pub fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Whether a function body or table is between its start and end calls.
    pub fn is_emitting(&self) -> bool {
        self.current.is_some()
    }

    pub fn code_slabs(&self) -> &[Slab] {
        &self.code_slabs
    }

    pub fn num_code_slabs(&self) -> usize {
        self.code_slabs.len()
    }

    pub fn num_stub_slabs(&self) -> usize {
        self.stub_allocator.slabs().len()
    }

    pub fn num_data_slabs(&self) -> usize {
        self.data_allocator.slabs().len()
    }

    /// Slabs mapped over the lifetime of this manager, of every kind.
    pub fn total_slabs_mapped(&self) -> usize {
        self.total_slabs
    }
}

impl<M: PlatformMemory> Drop for JitMemoryManager<M> {
    fn drop(&mut self) {
        let slabs = self
            .code_slabs
            .drain(..)
            .chain(self.stub_allocator.take_slabs())
            .chain(self.data_allocator.take_slabs());

        for slab in slabs {
            if let Err(err) = unsafe { self.memory.release(slab) } {
                tracing::warn!(%err, "failed to release JIT slab");
            }
        }
    }
}

impl<M: PlatformMemory> fmt::Debug for JitMemoryManager<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitMemoryManager")
            .field("config", &self.config)
            .field("code_slabs", &self.code_slabs.len())
            .field("stub_slabs", &self.stub_allocator.slabs().len())
            .field("data_slabs", &self.data_allocator.slabs().len())
            .field("functions", &self.function_blocks.len())
            .field("tables", &self.table_blocks.len())
            .field("current", &self.current)
            .finish()
    }
}
