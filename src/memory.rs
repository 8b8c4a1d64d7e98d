// memory.rs — device memory manager.
//
// Allocates, zero-fills, transfers and releases device buffers, keeping the
// buffer registry in step with every operation:
//
//   allocate / allocate_like / allocate_zeroed   → record(shape, dtype)
//   allocate_bytes                               → record([nbytes], unknown)
//   to_device                                    → record(array shape, dtype)
//   release                                      → forget
//
// Every host→device transfer goes through `array::normalize`, so the device
// only ever sees contiguous 32-bit data.
//
// All precondition checks (byte sizes, known buffers) happen here, on the
// host, before the backend is asked to do anything.

use std::sync::Arc;

use log::{debug, warn};

use crate::array::{normalize, DType, DeviceArray, HostArray};
use crate::backend::{AccessMode, ComputeBackend, Event};
use crate::error::{Error, Result};
use crate::registry::{BufferId, BufferInfo, BufferRegistry};

/// Allocates and tracks device buffers on one backend.
pub struct MemoryManager<B: ComputeBackend> {
    backend: Arc<B>,
    registry: Arc<BufferRegistry>,
}

impl<B: ComputeBackend> Clone for MemoryManager<B> {
    fn clone(&self) -> Self {
        MemoryManager {
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<B: ComputeBackend> MemoryManager<B> {
    /// A manager with its own, empty registry.
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_registry(backend, Arc::new(BufferRegistry::new()))
    }

    /// A manager that books into an existing registry.
    pub fn with_registry(backend: Arc<B>, registry: Arc<BufferRegistry>) -> Self {
        MemoryManager { backend, registry }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<BufferRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate an uninitialised buffer for `shape` elements of `dtype`.
    pub fn allocate(&self, shape: &[usize], dtype: DType, access: AccessMode) -> Result<BufferId> {
        let nbytes = dtype.nbytes(shape);
        let id = self.backend.allocate(nbytes, access)?;
        self.registry.record(id, BufferInfo::typed(shape, dtype));
        debug!("allocate {id}: {shape:?} {dtype} ({nbytes} bytes, {access:?})");
        Ok(id)
    }

    /// Allocate `nbytes` of untyped memory. Fetching it later requires an
    /// explicit destination array.
    pub fn allocate_bytes(&self, nbytes: u64, access: AccessMode) -> Result<BufferId> {
        let id = self.backend.allocate(nbytes, access)?;
        self.registry.record(id, BufferInfo::untyped(nbytes));
        debug!("allocate {id}: {nbytes} untyped bytes ({access:?})");
        Ok(id)
    }

    /// Allocate a buffer matching the normalized shape and type of `reference`.
    pub fn allocate_like(&self, reference: &HostArray, access: AccessMode) -> Result<BufferId> {
        let dtype = reference.element_type().device_type()?;
        self.allocate(reference.shape(), dtype, access)
    }

    /// Allocate a buffer whose contents are zero. The fill runs on the
    /// device; nothing is copied from the host.
    pub fn allocate_zeroed(
        &self,
        shape: &[usize],
        dtype: DType,
        access: AccessMode,
    ) -> Result<BufferId> {
        let id = self.allocate(shape, dtype, access)?;
        if let Err(e) = self.backend.fill_zero(id) {
            self.discard(id);
            return Err(e);
        }
        Ok(id)
    }

    /// [`allocate_zeroed`](Self::allocate_zeroed) with the shape and type of `reference`.
    pub fn allocate_zeroed_like(
        &self,
        reference: &HostArray,
        access: AccessMode,
    ) -> Result<BufferId> {
        let dtype = reference.element_type().device_type()?;
        self.allocate_zeroed(reference.shape(), dtype, access)
    }

    // -----------------------------------------------------------------------
    // Transfers
    // -----------------------------------------------------------------------

    /// Copy `array` to the device.
    ///
    /// Without `dest`, a new buffer is allocated with `access` and returned.
    /// With `dest`, the buffer's byte size must equal the normalized array's
    /// byte size exactly; otherwise nothing is transferred. Either way the
    /// registry afterwards describes the buffer by the array's shape and type.
    pub fn to_device(
        &self,
        array: &HostArray,
        dest: Option<BufferId>,
        access: AccessMode,
    ) -> Result<BufferId> {
        let normalized = normalize(array)?;
        self.upload(&normalized, dest, access)
    }

    /// Copy an already-normalized array to the device.
    pub fn upload(
        &self,
        array: &DeviceArray,
        dest: Option<BufferId>,
        access: AccessMode,
    ) -> Result<BufferId> {
        let nbytes = array.nbytes();
        let (id, fresh) = match dest {
            Some(id) => {
                let size = self.backend.buffer_size(id)?;
                if size != nbytes {
                    return Err(Error::SizeMismatch { array: nbytes, buffer: size });
                }
                (id, false)
            }
            None => (self.backend.allocate(nbytes, access)?, true),
        };

        if let Err(e) = self.backend.write(id, array.as_bytes()) {
            if fresh {
                self.discard(id);
            }
            return Err(e);
        }
        self.registry.record(id, BufferInfo::typed(array.shape(), array.dtype()));
        debug!("to_device {id}: {:?} {} ({nbytes} bytes)", array.shape(), array.dtype());
        Ok(id)
    }

    /// Copy a buffer back to the host, inferring shape and type from the
    /// registry.
    pub fn fetch(&self, id: BufferId) -> Result<DeviceArray> {
        self.fetch_with_event(id).map(|(array, _)| array)
    }

    /// [`fetch`](Self::fetch), also returning the transfer event.
    pub fn fetch_with_event(&self, id: BufferId) -> Result<(DeviceArray, Event)> {
        let info = self.registry.lookup(id).ok_or(Error::UnknownBuffer(id))?;
        let dtype = info.dtype.ok_or(Error::UntypedBuffer(id))?;
        let mut dest = DeviceArray::zeros(&info.shape, dtype);
        let event = self.fetch_into(id, &mut dest)?;
        Ok((dest, event))
    }

    /// Copy a buffer into `dest`, whose shape and type define the transfer.
    /// The registry is not consulted.
    pub fn fetch_into(&self, id: BufferId, dest: &mut DeviceArray) -> Result<Event> {
        let size = self.backend.buffer_size(id)?;
        let nbytes = dest.nbytes();
        if nbytes > size {
            return Err(Error::SizeMismatch { array: nbytes, buffer: size });
        }
        let event = self.backend.read(id, dest.as_bytes_mut())?;
        debug!("fetch {id}: {:?} {} ({nbytes} bytes)", dest.shape(), dest.dtype());
        Ok(event)
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Release a buffer.
    ///
    /// The registry entry is dropped if there is one, and the device memory
    /// is freed either way. Releasing a buffer the backend no longer holds
    /// (already released) logs a warning and does nothing, unless the
    /// registry still listed it: then the handle is corrupt and the release
    /// fails, as does any other backend rejection.
    pub fn release(&self, id: BufferId) -> Result<()> {
        let booked = self.registry.forget(id).is_some();
        match self.backend.release(id) {
            Ok(()) => {
                debug!("release {id}");
                Ok(())
            }
            Err(Error::InvalidHandle(_)) if !booked => {
                warn!("release {id}: buffer already released or unknown; ignoring");
                Ok(())
            }
            Err(e) => Err(Error::Release { id, reason: e.to_string() }),
        }
    }

    /// Drop a buffer after a failed operation, without masking that failure.
    fn discard(&self, id: BufferId) {
        self.registry.forget(id);
        if let Err(e) = self.backend.release(id) {
            warn!("discarding {id} after a failed operation: {e}");
        }
    }
}
