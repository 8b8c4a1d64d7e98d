// backend.rs — the compute-device seam.
//
// Everything above this trait (memory manager, dispatcher, pipeline) is
// backend-agnostic. Two implementations live in this crate:
//
//   host::HostBackend     — buffers in host memory, kernels run on the CPU.
//                           Deterministic, counts every dispatch; used as
//                           the test double.
//   gpu::WgpuBackend      — the real thing, on wgpu.
//
// ARGUMENT CONVENTION
// ───────────────────
// Kernels receive an ordered argument list. Buffer arguments bind, in order
// of appearance, to @group(0) @binding(0), @binding(1), ... All scalar
// arguments are packed, in order, as 32-bit words into a single uniform
// block bound right after the last buffer:
//
//   args:  (src, dst, weights, ksize, width, height, depth)
//   WGSL:  @binding(0) src, @binding(1) dst, @binding(2) weights,
//          @binding(3) var<uniform> params: Params   // 4 × i32
//
// ORDERING
// ────────
// Each backend owns a single in-order queue. A dispatch returns as soon as
// the work is queued; pass N+1 sees the writes of pass N because the queue
// executes them in submission order. `read` is the only call that blocks.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::registry::BufferId;

/// Access hint for a new device buffer, from the kernels' point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl AccessMode {
    pub fn kernel_writable(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// A kernel argument after 32-bit narrowing, as the backend receives it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceArg {
    Buffer(BufferId),
    I32(i32),
    U32(u32),
    F32(f32),
}

impl DeviceArg {
    /// The raw 32-bit word of a scalar argument; `None` for buffers.
    pub fn word(&self) -> Option<u32> {
        match *self {
            DeviceArg::Buffer(_) => None,
            DeviceArg::I32(v) => Some(v as u32),
            DeviceArg::U32(v) => Some(v),
            DeviceArg::F32(v) => Some(v.to_bits()),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Completion handle for one queued operation (transfer or dispatch).
///
/// Cheap to clone. When the backend runs with profiling enabled the queue
/// stamps the completion instant, and [`Event::duration`] reports the
/// latency from submission to completion as observed by the host.
#[derive(Clone)]
pub struct Event {
    label: Arc<str>,
    submitted: Instant,
    completed: Arc<OnceLock<Instant>>,
}

impl Event {
    /// An event whose completion will be stamped later via [`Event::completer`].
    pub fn pending(label: &str) -> Self {
        Event {
            label: Arc::from(label),
            submitted: Instant::now(),
            completed: Arc::new(OnceLock::new()),
        }
    }

    /// An event for work that already finished (synchronous backends).
    pub fn completed(label: &str) -> Self {
        let ev = Self::pending(label);
        ev.mark_complete();
        ev
    }

    /// A callback that stamps this event as complete. Safe to call more
    /// than once; only the first call counts.
    pub fn completer(&self) -> impl FnOnce() + Send + 'static {
        let completed = Arc::clone(&self.completed);
        move || {
            let _ = completed.set(Instant::now());
        }
    }

    pub(crate) fn mark_complete(&self) {
        let _ = self.completed.set(Instant::now());
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.completed.get().copied()
    }

    pub fn is_complete(&self) -> bool {
        self.completed.get().is_some()
    }

    /// Submission-to-completion latency, once complete.
    pub fn duration(&self) -> Option<Duration> {
        self.completed_at().map(|end| end.saturating_duration_since(self.submitted))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("label", &self.label)
            .field("complete", &self.is_complete())
            .field("duration", &self.duration())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ComputeBackend
// ---------------------------------------------------------------------------

/// Raw device primitives: allocate, copy, release, compile, enqueue.
///
/// Implementations keep their own table from [`BufferId`] to native buffer;
/// any call naming an id that is not in the table fails with
/// `Error::InvalidHandle`.
pub trait ComputeBackend: Send + Sync {
    /// A compiled program exposing named entry points.
    type Program: Send + Sync;

    /// Human-readable device description for logs.
    fn name(&self) -> String;

    /// Reserve `nbytes` of uninitialised device memory.
    fn allocate(&self, nbytes: u64, access: AccessMode) -> Result<BufferId>;

    /// Fill the whole buffer with zero bytes, on the device.
    fn fill_zero(&self, id: BufferId) -> Result<Event>;

    /// Byte size the buffer was allocated with.
    fn buffer_size(&self, id: BufferId) -> Result<u64>;

    /// Copy `bytes` into the start of the buffer.
    fn write(&self, id: BufferId, bytes: &[u8]) -> Result<Event>;

    /// Copy the first `out.len()` bytes of the buffer to `out`. Blocks until
    /// the copy has landed; the returned event is already complete.
    fn read(&self, id: BufferId, out: &mut [u8]) -> Result<Event>;

    /// Free the buffer. The id is invalid afterwards.
    fn release(&self, id: BufferId) -> Result<()>;

    /// Compile program source text.
    fn compile(&self, source: &str) -> Result<Self::Program>;

    /// Queue one invocation of `entry` over `grid` work-items.
    ///
    /// `block` is the workgroup shape (same rank as `grid`, which is already
    /// a whole number of blocks). `None` leaves the choice to the backend.
    fn dispatch(
        &self,
        program: &Self::Program,
        entry: &str,
        grid: &[usize],
        block: Option<&[usize]>,
        args: &[DeviceArg],
    ) -> Result<Event>;

    /// Block until `event` and all work queued before it have completed.
    fn wait(&self, event: &Event) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Program source helpers
// ---------------------------------------------------------------------------

/// Names of all `@compute` entry points in WGSL source, in source order.
pub fn compute_entry_points(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find("@compute") {
        rest = &rest[pos + "@compute".len()..];
        let Some(fn_pos) = rest.find("fn ") else { break };
        let after = rest[fn_pos + 3..].trim_start();
        let name: String = after
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() {
            names.push(name);
        }
        rest = &rest[fn_pos + 3..];
    }
    names
}

/// Bake a workgroup shape into WGSL source.
///
/// naga does not accept `override` expressions inside `@workgroup_size()`,
/// so the source carries `{{WG_X}}`, `{{WG_Y}}`, `{{WG_Z}}` placeholders
/// that are replaced textually before compilation.
pub fn specialize_workgroup(source: &str, wg: [u32; 3]) -> String {
    source
        .replace("{{WG_X}}", &wg[0].to_string())
        .replace("{{WG_Y}}", &wg[1].to_string())
        .replace("{{WG_Z}}", &wg[2].to_string())
}
