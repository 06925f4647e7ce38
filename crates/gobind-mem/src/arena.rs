//! Thread-safe bump arena for permanent metadata.
//!
//! Everything the object runtime registers once and never unregisters (type
//! nodes, signal nodes, property names, vtable slots) is allocated here. The
//! arena hands out `&'static` references when used through [`global_arena`]:
//! memory is never returned to the system allocator and destructors of
//! arena values never run.
//!
//! # Architecture
//!
//! - [`Chunk`]: a fixed block with an atomic bump pointer
//! - [`GlobalArena`]: a growing list of chunks guarded by a mutex that is
//!   only taken when a chunk runs out
//!
//! # Examples
//!
//! ```
//! use gobind_mem::arena::global_arena;
//!
//! let arena = global_arena();
//! let value = arena.alloc(42u32);
//! let name = arena.alloc_str("GObject");
//!
//! assert_eq!(*value, 42);
//! assert_eq!(name, "GObject");
//! ```

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

/// Default alignment for arena allocations.
const DEFAULT_ALIGNMENT: usize = 8;

/// Smallest chunk the arena will request.
const MIN_CHUNK_SIZE: usize = 4096;

/// Largest chunk size reached by doubling.
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Arena allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes handed out across all chunks.
    pub total_allocated: usize,
    /// Number of chunks owned by the arena.
    pub chunk_count: usize,
    /// Capacity of all chunks in bytes.
    pub total_capacity: usize,
}

/// A fixed-size block with an atomic bump pointer.
///
/// Chunks are leaked on creation and live until process exit.
pub struct Chunk {
    /// Current bump pointer.
    ptr: AtomicPtr<u8>,
    /// One past the last usable byte.
    end: usize,
    /// Capacity in bytes.
    capacity: usize,
}

impl Chunk {
    fn new(size: usize) -> &'static Self {
        let layout = match Layout::from_size_align(size, DEFAULT_ALIGNMENT) {
            Ok(layout) => layout,
            Err(_) => panic!("arena chunk of {size} bytes has an invalid layout"),
        };

        // SAFETY: layout has a non-zero size (size >= MIN_CHUNK_SIZE).
        let start = unsafe { alloc::alloc(layout) };
        if start.is_null() {
            alloc::handle_alloc_error(layout);
        }

        Box::leak(Box::new(Chunk {
            ptr: AtomicPtr::new(start),
            end: start.addr() + size,
            capacity: size,
        }))
    }

    /// Bumps the pointer by `size` bytes at `align`, or returns `None` when
    /// the chunk is exhausted.
    #[inline]
    fn try_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut current = self.ptr.load(Ordering::Acquire);

        loop {
            let aligned = (current.addr() + align - 1) & !(align - 1);
            let next = aligned.checked_add(size)?;
            if next > self.end {
                return None;
            }

            match self.ptr.compare_exchange_weak(
                current,
                current.with_addr(next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return NonNull::new(current.with_addr(aligned)),
                Err(observed) => current = observed,
            }
        }
    }
}

/// Thread-safe arena for allocations that live for the rest of the process.
///
/// # Thread Safety
///
/// Allocation from the current chunk is a CAS loop; only growing the arena
/// takes the chunk-list mutex.
///
/// # Examples
///
/// ```
/// use gobind_mem::arena::GlobalArena;
///
/// let arena = GlobalArena::new(8192);
/// let a = arena.alloc(1u64);
/// let b = arena.alloc(2u64);
///
/// assert_eq!(*a + *b, 3);
/// assert_eq!(arena.stats().chunk_count, 1);
/// ```
pub struct GlobalArena {
    chunks: Mutex<Vec<&'static Chunk>>,
    current: AtomicPtr<Chunk>,
    chunk_size: AtomicUsize,
    total_allocated: AtomicUsize,
}

impl GlobalArena {
    /// Creates an arena whose first chunk holds at least `chunk_size` bytes.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        let size = chunk_size.max(MIN_CHUNK_SIZE).next_power_of_two();
        let first = Chunk::new(size);

        GlobalArena {
            chunks: Mutex::new(vec![first]),
            current: AtomicPtr::new(std::ptr::from_ref(first).cast_mut()),
            chunk_size: AtomicUsize::new(size),
            total_allocated: AtomicUsize::new(0),
        }
    }

    /// Moves `value` into the arena.
    ///
    /// The value's destructor never runs.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T>(&self, value: T) -> &mut T {
        let size = std::mem::size_of::<T>();
        let align = std::mem::align_of::<T>().max(DEFAULT_ALIGNMENT);
        let ptr = self.alloc_raw(size, align).cast::<T>();

        // SAFETY: ptr is freshly bumped, aligned for T, sized for T and
        // never handed out again.
        unsafe {
            ptr.as_ptr().write(value);
            &mut *ptr.as_ptr()
        }
    }

    /// Copies `s` into the arena.
    pub fn alloc_str(&self, s: &str) -> &str {
        if s.is_empty() {
            return "";
        }

        let ptr = self.alloc_raw(s.len(), 1);

        // SAFETY: the destination holds s.len() bytes and does not overlap
        // the source; the bytes are valid UTF-8 because they came from a str.
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr(), ptr.as_ptr(), s.len());
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(
                ptr.as_ptr(),
                s.len(),
            ))
        }
    }

    fn alloc_raw(&self, size: usize, align: usize) -> NonNull<u8> {
        loop {
            let current = self.current.load(Ordering::Acquire);

            // SAFETY: current always points at a leaked chunk.
            let chunk = unsafe { &*current };
            if let Some(ptr) = chunk.try_alloc(size, align) {
                self.total_allocated.fetch_add(size, Ordering::Relaxed);
                return ptr;
            }

            self.grow(current, size + align);
        }
    }

    #[cold]
    fn grow(&self, exhausted: *mut Chunk, min_size: usize) {
        let mut chunks = match self.chunks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Another thread grew the arena while we waited for the lock.
        if self.current.load(Ordering::Acquire) != exhausted {
            return;
        }

        let doubled = (self.chunk_size.load(Ordering::Relaxed) * 2).min(MAX_CHUNK_SIZE);
        let size = doubled.max(min_size.next_power_of_two());
        self.chunk_size.store(doubled, Ordering::Relaxed);

        let chunk = Chunk::new(size);
        chunks.push(chunk);
        self.current
            .store(std::ptr::from_ref(chunk).cast_mut(), Ordering::Release);
    }

    /// Returns allocation statistics for this arena.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let chunks = match self.chunks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        ArenaStats {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            chunk_count: chunks.len(),
            total_capacity: chunks.iter().map(|c| c.capacity).sum(),
        }
    }
}

// SAFETY: chunks are leaked and only mutated through atomics; the chunk list
// is behind a mutex.
unsafe impl Send for GlobalArena {}
// SAFETY: see above.
unsafe impl Sync for GlobalArena {}

/// Returns the process-wide arena.
#[must_use]
pub fn global_arena() -> &'static GlobalArena {
    static ARENA: OnceLock<GlobalArena> = OnceLock::new();
    ARENA.get_or_init(|| GlobalArena::new(64 * 1024))
}
