// registry.rs — book-keeping of what each device buffer holds.
//
// A device buffer is just bytes. To bring one back to the host without the
// caller describing it again, we remember the shape and element type of
// every buffer the memory manager creates or writes to. The most recent
// write wins: transferring a 4×4 f32 array into a buffer that was allocated
// as 16 i32 elements re-describes it as 4×4 f32.
//
// The registry is an ordinary value, owned by whoever needs it and shared
// via `Arc`. There is no process-wide table, so two device contexts in the
// same process keep separate books.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::array::DType;

// ---------------------------------------------------------------------------
// BufferId
// ---------------------------------------------------------------------------

/// Opaque handle to a device buffer.
///
/// Plain value semantics: copy it, compare it, hash it. The number means
/// nothing outside the backend that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub const fn from_raw(raw: u64) -> Self {
        BufferId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Mints increasing buffer ids, starting at 1.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub(crate) const fn new() -> Self {
        IdAllocator { next: AtomicU64::new(1) }
    }

    pub(crate) fn next(&self) -> BufferId {
        BufferId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        IdAllocator::new()
    }
}

// ---------------------------------------------------------------------------
// BufferInfo
// ---------------------------------------------------------------------------

/// What the registry knows about one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    /// Declared shape. For an untyped buffer this is `[nbytes]`.
    pub shape: Vec<usize>,
    /// Element type, or `None` when the buffer was allocated by byte size
    /// and its contents cannot be inferred.
    pub dtype: Option<DType>,
}

impl BufferInfo {
    pub fn typed(shape: &[usize], dtype: DType) -> Self {
        BufferInfo { shape: shape.to_vec(), dtype: Some(dtype) }
    }

    pub fn untyped(nbytes: u64) -> Self {
        BufferInfo { shape: vec![nbytes as usize], dtype: None }
    }
}

// ---------------------------------------------------------------------------
// BufferRegistry
// ---------------------------------------------------------------------------

/// Map from buffer handle to declared shape and element type.
///
/// All methods take `&self`; a single mutex serialises concurrent
/// allocate/release calls from several threads.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    entries: Mutex<HashMap<BufferId, BufferInfo>>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or overwrite) the entry for `id`.
    pub fn record(&self, id: BufferId, info: BufferInfo) {
        self.entries.lock().insert(id, info);
    }

    /// The entry for `id`, or `None` if the buffer is unknown.
    pub fn lookup(&self, id: BufferId) -> Option<BufferInfo> {
        self.entries.lock().get(&id).cloned()
    }

    /// Remove the entry for `id`, returning it if there was one.
    /// Forgetting an unknown id is not an error.
    pub fn forget(&self, id: BufferId) -> Option<BufferInfo> {
        self.entries.lock().remove(&id)
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
