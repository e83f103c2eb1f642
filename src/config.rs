/// Default size of a code slab.
pub const DEFAULT_CODE_SLAB_SIZE: usize = 512 * 1024;

/// Default size of the slabs backing the stub and global arenas.
pub const DEFAULT_SLAB_SIZE: usize = 64 * 1024;

/// Stub and global requests above this size get a slab of their own.
pub const DEFAULT_SIZE_THRESHOLD: usize = 16 * 1024;

/// Tunables of a [`crate::JitMemoryManager`].
///
/// ```
/// use jitalloc::MemoryManagerConfig;
///
/// let config = MemoryManagerConfig::default()
///     .with_code_slab_size(1 << 20)
///     .with_poison_memory(true);
///
/// assert_eq!(config.code_slab_size, 1 << 20);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryManagerConfig {
    /// Size of every code slab, unless a function needs more.
    pub code_slab_size: usize,
    /// Size of the regular slabs of the stub arena.
    pub stub_slab_size: usize,
    /// Size of the regular slabs of the global data arena.
    pub data_slab_size: usize,
    /// Stub and global requests above this size get a dedicated slab.
    pub size_threshold: usize,
    /// Fill fresh slabs and released blocks with [`crate::POISON_BYTE`].
    pub poison_memory: bool,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            code_slab_size: DEFAULT_CODE_SLAB_SIZE,
            stub_slab_size: DEFAULT_SLAB_SIZE,
            data_slab_size: DEFAULT_SLAB_SIZE,
            size_threshold: DEFAULT_SIZE_THRESHOLD,
            poison_memory: cfg!(debug_assertions),
        }
    }
}

impl MemoryManagerConfig {
    pub fn with_code_slab_size(mut self, size: usize) -> Self {
        self.code_slab_size = size;
        self
    }

    pub fn with_stub_slab_size(mut self, size: usize) -> Self {
        self.stub_slab_size = size;
        self
    }

    pub fn with_data_slab_size(mut self, size: usize) -> Self {
        self.data_slab_size = size;
        self
    }

    pub fn with_size_threshold(mut self, size: usize) -> Self {
        self.size_threshold = size;
        self
    }

    pub fn with_poison_memory(mut self, poison: bool) -> Self {
        self.poison_memory = poison;
        self
    }
}
