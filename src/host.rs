// host.rs — in-process compute backend.
//
// Buffers live in host memory and the three convolution entry points run on
// the CPU, one work-item at a time, exactly as the WGSL shader would run
// them: same argument layout, same bounds guard, same clamp-to-edge reads.
// Every call completes before it returns, so every event comes back already
// complete.
//
// The backend also counts what it is asked to do. Tests use the probes to
// check that a rejected call never reached the device:
//
//   dispatch_count()  — dispatch calls received, successful or not
//   transfer_count()  — write + read + fill_zero calls that moved data
//   live_buffers()    — allocated and not yet released
//
// NEW RUST CONCEPTS:
// - `AtomicUsize` counters — the trait takes `&self`, so mutation goes
//   through atomics or the mutex, never `&mut self`.
// - `bytemuck::cast_slice_mut` — views the `Vec<u32>` storage as bytes for
//   copies. Storing words instead of bytes keeps every buffer 4-byte
//   aligned, so reinterpreting as `f32` is always valid.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::backend::{compute_entry_points, AccessMode, ComputeBackend, DeviceArg, Event};
use crate::convolution::{convolve_sample, Axis};
use crate::error::{Error, Result};
use crate::registry::{BufferId, IdAllocator};

struct HostBuffer {
    words: Vec<u32>,
    nbytes: u64,
    access: AccessMode,
}

impl HostBuffer {
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.nbytes as usize]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let n = self.nbytes as usize;
        &mut bytemuck::cast_slice_mut(&mut self.words)[..n]
    }

    fn as_f32(&self) -> &[f32] {
        bytemuck::cast_slice(&self.words)
    }
}

/// A program "compiled" for the host: the entry points found in its source.
#[derive(Debug, Clone)]
pub struct HostProgram {
    entry_points: Vec<String>,
}

impl HostProgram {
    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }

    pub fn has_entry_point(&self, name: &str) -> bool {
        self.entry_points.iter().any(|e| e == name)
    }
}

/// One dispatch as the backend received it.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub entry: String,
    pub grid: Vec<usize>,
    pub block: Option<Vec<usize>>,
    pub args: Vec<DeviceArg>,
}

/// CPU backend with dispatch and transfer probes.
#[derive(Default)]
pub struct HostBackend {
    ids: IdAllocator,
    buffers: Mutex<HashMap<BufferId, HostBuffer>>,
    dispatches: AtomicUsize,
    transfers: AtomicUsize,
    history: Mutex<Vec<DispatchRecord>>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch calls received so far, including rejected ones.
    pub fn dispatch_count(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    /// Data-moving calls (write, read, fill_zero) received so far.
    pub fn transfer_count(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    /// Buffers allocated and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Every dispatch received so far, oldest first.
    pub fn dispatch_history(&self) -> Vec<DispatchRecord> {
        self.history.lock().clone()
    }

    fn run_convolution(
        &self,
        entry: &str,
        axis: Axis,
        grid: &[usize],
        args: &[DeviceArg],
    ) -> Result<()> {
        let (src, dst, weights, params) = match *args {
            [DeviceArg::Buffer(src), DeviceArg::Buffer(dst), DeviceArg::Buffer(weights), DeviceArg::I32(ksize), DeviceArg::I32(w), DeviceArg::I32(h), DeviceArg::I32(d)] => {
                (src, dst, weights, [ksize, w, h, d])
            }
            _ => {
                return Err(Error::dispatch(
                    entry,
                    "expected (src, dst, weights, ksize: i32, width: i32, height: i32, depth: i32)",
                ))
            }
        };
        if params.iter().any(|&p| p < 0) {
            return Err(Error::dispatch(entry, format!("negative scalar argument in {params:?}")));
        }
        let [ksize, w, h, d] = params.map(|p| p as usize);
        let extent = [w, h, d];
        let len = w * h * d;

        let mut buffers = self.buffers.lock();

        let weights_buf = buffers.get(&weights).ok_or(Error::InvalidHandle(weights))?;
        if weights_buf.nbytes < (ksize * 4) as u64 || ksize % 2 == 0 {
            return Err(Error::dispatch(
                entry,
                format!("weights buffer {weights} does not hold an odd kernel of {ksize} taps"),
            ));
        }
        let weights: Vec<f32> = weights_buf.as_f32()[..ksize].to_vec();

        let src_buf = buffers.get(&src).ok_or(Error::InvalidHandle(src))?;
        if src_buf.nbytes < (len * 4) as u64 {
            return Err(Error::dispatch(entry, format!("source {src} is smaller than {extent:?}")));
        }
        let src_data: Vec<f32> = src_buf.as_f32()[..len].to_vec();

        let dst_buf = buffers.get_mut(&dst).ok_or(Error::InvalidHandle(dst))?;
        if !dst_buf.access.kernel_writable() {
            return Err(Error::dispatch(entry, format!("destination {dst} is read-only")));
        }
        if dst_buf.nbytes < (len * 4) as u64 {
            return Err(Error::dispatch(entry, format!("destination {dst} is smaller than {extent:?}")));
        }

        let gx = grid.first().copied().unwrap_or(1);
        let gy = grid.get(1).copied().unwrap_or(1);
        let gz = grid.get(2).copied().unwrap_or(1);
        let out: &mut [f32] = bytemuck::cast_slice_mut(&mut dst_buf.words);
        for z in 0..gz {
            for y in 0..gy {
                for x in 0..gx {
                    if x >= w || y >= h || z >= d {
                        continue;
                    }
                    out[(z * h + y) * w + x] =
                        convolve_sample(&src_data, extent, &weights, axis, x, y, z);
                }
            }
        }
        Ok(())
    }
}

impl ComputeBackend for HostBackend {
    type Program = HostProgram;

    fn name(&self) -> String {
        "host (CPU)".to_string()
    }

    fn allocate(&self, nbytes: u64, access: AccessMode) -> Result<BufferId> {
        let words = usize::try_from(nbytes.div_ceil(4)).map_err(|_| Error::Allocation {
            nbytes,
            reason: "exceeds host address space".to_string(),
        })?;
        let id = self.ids.next();
        self.buffers.lock().insert(
            id,
            HostBuffer { words: vec![0; words], nbytes, access },
        );
        Ok(id)
    }

    fn fill_zero(&self, id: BufferId) -> Result<Event> {
        let mut buffers = self.buffers.lock();
        let buf = buffers.get_mut(&id).ok_or(Error::InvalidHandle(id))?;
        buf.words.fill(0);
        self.transfers.fetch_add(1, Ordering::SeqCst);
        Ok(Event::completed("fill_zero"))
    }

    fn buffer_size(&self, id: BufferId) -> Result<u64> {
        self.buffers
            .lock()
            .get(&id)
            .map(|b| b.nbytes)
            .ok_or(Error::InvalidHandle(id))
    }

    fn write(&self, id: BufferId, bytes: &[u8]) -> Result<Event> {
        let mut buffers = self.buffers.lock();
        let buf = buffers.get_mut(&id).ok_or(Error::InvalidHandle(id))?;
        if bytes.len() as u64 > buf.nbytes {
            return Err(Error::Transfer(format!(
                "write of {} bytes overruns {id} ({} bytes)",
                bytes.len(),
                buf.nbytes
            )));
        }
        buf.bytes_mut()[..bytes.len()].copy_from_slice(bytes);
        self.transfers.fetch_add(1, Ordering::SeqCst);
        Ok(Event::completed("write"))
    }

    fn read(&self, id: BufferId, out: &mut [u8]) -> Result<Event> {
        let buffers = self.buffers.lock();
        let buf = buffers.get(&id).ok_or(Error::InvalidHandle(id))?;
        if out.len() as u64 > buf.nbytes {
            return Err(Error::Transfer(format!(
                "read of {} bytes overruns {id} ({} bytes)",
                out.len(),
                buf.nbytes
            )));
        }
        out.copy_from_slice(&buf.bytes()[..out.len()]);
        self.transfers.fetch_add(1, Ordering::SeqCst);
        Ok(Event::completed("read"))
    }

    fn release(&self, id: BufferId) -> Result<()> {
        self.buffers
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::InvalidHandle(id))
    }

    fn compile(&self, source: &str) -> Result<HostProgram> {
        let entry_points = compute_entry_points(source);
        if entry_points.is_empty() {
            return Err(Error::Compile("program has no @compute entry points".to_string()));
        }
        Ok(HostProgram { entry_points })
    }

    fn dispatch(
        &self,
        program: &HostProgram,
        entry: &str,
        grid: &[usize],
        block: Option<&[usize]>,
        args: &[DeviceArg],
    ) -> Result<Event> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        self.history.lock().push(DispatchRecord {
            entry: entry.to_string(),
            grid: grid.to_vec(),
            block: block.map(<[usize]>::to_vec),
            args: args.to_vec(),
        });

        if !program.has_entry_point(entry) {
            return Err(Error::dispatch(entry, "unknown entry point"));
        }
        if let Some(block) = block {
            if block.len() != grid.len() || grid.iter().zip(block).any(|(&g, &b)| b == 0 || g % b != 0) {
                return Err(Error::dispatch(
                    entry,
                    format!("grid {grid:?} is not a whole number of blocks {block:?}"),
                ));
            }
        }
        let axis = Axis::from_entry_point(entry)
            .ok_or_else(|| Error::dispatch(entry, "no host implementation"))?;
        self.run_convolution(entry, axis, grid, args)?;
        Ok(Event::completed(entry))
    }

    fn wait(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRAM: &str = r#"
        @compute @workgroup_size(1)
        fn horizontal_convolution() {}
        @compute @workgroup_size(1)
        fn blend() {}
    "#;

    fn upload_f32(b: &HostBackend, data: &[f32], access: AccessMode) -> BufferId {
        let id = b.allocate((data.len() * 4) as u64, access).unwrap();
        b.write(id, bytemuck::cast_slice(data)).unwrap();
        id
    }

    fn read_f32(b: &HostBackend, id: BufferId, len: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; len];
        b.read(id, bytemuck::cast_slice_mut(&mut out)).unwrap();
        out
    }

    #[test]
    fn test_write_read_round_trip() {
        let b = HostBackend::new();
        let id = upload_f32(&b, &[1.0, -2.0, 3.5], AccessMode::default());
        assert_eq!(read_f32(&b, id, 3), vec![1.0, -2.0, 3.5]);
        assert_eq!(b.transfer_count(), 2);
    }

    #[test]
    fn test_unaligned_sizes() {
        let b = HostBackend::new();
        let id = b.allocate(6, AccessMode::default()).unwrap();
        b.write(id, &[1, 2, 3, 4, 5, 6]).unwrap();
        let mut out = [0u8; 6];
        b.read(id, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);
        assert!(matches!(b.write(id, &[0; 7]), Err(Error::Transfer(_))));
    }

    #[test]
    fn test_release_invalidates_handle() {
        let b = HostBackend::new();
        let id = b.allocate(16, AccessMode::default()).unwrap();
        assert_eq!(b.live_buffers(), 1);
        b.release(id).unwrap();
        assert_eq!(b.live_buffers(), 0);
        assert!(matches!(b.release(id), Err(Error::InvalidHandle(_))));
        assert!(matches!(b.buffer_size(id), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_compile_requires_entry_points() {
        let b = HostBackend::new();
        let p = b.compile(PROGRAM).unwrap();
        assert_eq!(p.entry_points(), &["horizontal_convolution", "blend"]);
        assert!(matches!(b.compile("fn f() {}"), Err(Error::Compile(_))));
    }

    #[test]
    fn test_horizontal_pass() {
        let b = HostBackend::new();
        let p = b.compile(PROGRAM).unwrap();
        let src = upload_f32(&b, &[10.0, 20.0, 30.0], AccessMode::ReadOnly);
        let dst = b.allocate(12, AccessMode::WriteOnly).unwrap();
        let k = upload_f32(&b, &[0.25, 0.5, 0.25], AccessMode::ReadOnly);
        let args = [
            DeviceArg::Buffer(src),
            DeviceArg::Buffer(dst),
            DeviceArg::Buffer(k),
            DeviceArg::I32(3),
            DeviceArg::I32(3),
            DeviceArg::I32(1),
            DeviceArg::I32(1),
        ];
        // Grid rounded up to 4×4: the extra work-items are skipped.
        let ev = b
            .dispatch(&p, "horizontal_convolution", &[4, 4], Some(&[4usize, 4][..]), &args)
            .unwrap();
        assert!(ev.is_complete());
        assert_eq!(read_f32(&b, dst, 3), vec![12.5, 20.0, 27.5]);
        assert_eq!(b.dispatch_count(), 1);
        assert_eq!(b.dispatch_history()[0].grid, vec![4, 4]);
    }

    #[test]
    fn test_dispatch_errors_come_from_the_backend() {
        let b = HostBackend::new();
        let p = b.compile(PROGRAM).unwrap();
        let err = b.dispatch(&p, "missing", &[1], None, &[]).unwrap_err();
        assert!(matches!(err, Error::Dispatch { .. }));
        let err = b.dispatch(&p, "blend", &[1], None, &[]).unwrap_err();
        assert!(err.to_string().contains("no host implementation"));
        let err = b.dispatch(&p, "horizontal_convolution", &[1], None, &[DeviceArg::I32(1)]).unwrap_err();
        assert!(!err.is_validation());
        // Rejected dispatches still count.
        assert_eq!(b.dispatch_count(), 3);
    }

    #[test]
    fn test_read_only_destination_rejected() {
        let b = HostBackend::new();
        let p = b.compile(PROGRAM).unwrap();
        let src = upload_f32(&b, &[1.0], AccessMode::ReadOnly);
        let k = upload_f32(&b, &[1.0], AccessMode::ReadOnly);
        let args = [
            DeviceArg::Buffer(src),
            DeviceArg::Buffer(src),
            DeviceArg::Buffer(k),
            DeviceArg::I32(1),
            DeviceArg::I32(1),
            DeviceArg::I32(1),
            DeviceArg::I32(1),
        ];
        let err = b.dispatch(&p, "horizontal_convolution", &[1], None, &args).unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }
}
