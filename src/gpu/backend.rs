// gpu/backend.rs — `ComputeBackend` on wgpu.
//
// Buffers are plain storage buffers (STORAGE | COPY_SRC | COPY_DST). A
// `BufferId` maps to an `Arc<wgpu::Buffer>` so a buffer can be cloned out of
// the table and used without holding the lock across a submission.
//
// ERROR SCOPES
// ────────────
// wgpu reports most faults asynchronously through its uncaptured-error
// handler, which panics by default. Every operation that can fail on the
// device runs inside `push_error_scope` / `pop_error_scope`, and the popped
// error becomes a crate `Error`:
//
//   allocate            OutOfMemory   → Error::Allocation
//   write / read / fill Validation    → Error::Transfer
//   compile             Validation    → Error::Compile
//   dispatch            Validation    → Error::Dispatch
//
// PIPELINES
// ─────────
// The workgroup size is baked into the WGSL text, so one program yields one
// compute pipeline per (entry point, workgroup size). They are created on
// first use and cached on the program. Bind group layouts are derived from
// the shader (`layout: None`), binding i ↔ i-th buffer argument, scalars in
// one uniform block after the last buffer.
//
// READBACK
// ────────
// device → staging (MAP_READ | COPY_DST) → map_async → poll(Wait) → memcpy.
// The only blocking call in the backend, besides `wait`.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::backend::{
    compute_entry_points, specialize_workgroup, AccessMode, ComputeBackend, DeviceArg, Event,
};
use crate::error::{Error, Result};
use crate::gpu::device::{GpuDevice, GpuOptions, WorkgroupSize};
use crate::registry::{BufferId, IdAllocator};

/// wgpu requires copy sizes and offsets to be multiples of this.
const COPY_ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

struct GpuBuffer {
    buffer: Arc<wgpu::Buffer>,
    /// Size requested by the caller; the wgpu buffer may be padded.
    size: u64,
}

/// A WGSL program: validated source plus lazily created pipelines.
pub struct WgpuProgram {
    source: String,
    entry_points: Vec<String>,
    pipelines: Mutex<HashMap<(String, [u32; 3]), Arc<wgpu::ComputePipeline>>>,
}

impl WgpuProgram {
    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }

    /// Pipelines created so far.
    pub fn cached_pipelines(&self) -> usize {
        self.pipelines.lock().len()
    }
}

pub struct WgpuBackend {
    gpu: GpuDevice,
    ids: IdAllocator,
    buffers: Mutex<HashMap<BufferId, GpuBuffer>>,
    profiling: bool,
}

impl WgpuBackend {
    /// Open the default device.
    pub fn new() -> Result<Self> {
        Self::with_options(GpuOptions::default())
    }

    pub fn with_options(options: GpuOptions) -> Result<Self> {
        let gpu = GpuDevice::with_options(options)?;
        Ok(Self::from_device(gpu, options.profiling))
    }

    /// Wrap an already opened device.
    pub fn from_device(gpu: GpuDevice, profiling: bool) -> Self {
        WgpuBackend {
            gpu,
            ids: IdAllocator::new(),
            buffers: Mutex::new(HashMap::new()),
            profiling,
        }
    }

    pub fn gpu(&self) -> &GpuDevice {
        &self.gpu
    }

    pub fn profiling(&self) -> bool {
        self.profiling
    }

    fn buffer(&self, id: BufferId) -> Result<(Arc<wgpu::Buffer>, u64)> {
        self.buffers
            .lock()
            .get(&id)
            .map(|b| (Arc::clone(&b.buffer), b.size))
            .ok_or(Error::InvalidHandle(id))
    }

    /// Run `f` inside an error scope and return its value with the captured
    /// device error, if any.
    fn scoped<T>(&self, filter: wgpu::ErrorFilter, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.gpu.device.push_error_scope(filter);
        let value = f();
        let error = pollster::block_on(self.gpu.device.pop_error_scope());
        (value, error)
    }

    fn submit(&self, encoder: Option<wgpu::CommandEncoder>, label: &str) -> Event {
        let event = Event::pending(label);
        match encoder {
            Some(encoder) => self.gpu.queue.submit(std::iter::once(encoder.finish())),
            None => self.gpu.queue.submit(std::iter::empty::<wgpu::CommandBuffer>()),
        };
        if self.profiling {
            self.gpu.queue.on_submitted_work_done(event.completer());
        }
        event
    }

    fn pipeline(
        &self,
        program: &WgpuProgram,
        entry: &str,
        wg: WorkgroupSize,
    ) -> Result<Arc<wgpu::ComputePipeline>> {
        let key = (entry.to_string(), wg.as_array());
        if let Some(p) = program.pipelines.lock().get(&key) {
            return Ok(Arc::clone(p));
        }

        let source = specialize_workgroup(&program.source, wg.as_array());
        let (pipeline, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            let module = self.gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(entry),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            self.gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: None,
                module: &module,
                entry_point: entry,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        });
        if let Some(e) = error {
            return Err(Error::dispatch(entry, format!("pipeline creation failed: {e}")));
        }
        debug!("pipeline {entry} created for workgroup {wg}");
        let pipeline = Arc::new(pipeline);
        program.pipelines.lock().insert(key, Arc::clone(&pipeline));
        Ok(pipeline)
    }
}

impl ComputeBackend for WgpuBackend {
    type Program = WgpuProgram;

    fn name(&self) -> String {
        self.gpu.adapter_info.to_string()
    }

    fn allocate(&self, nbytes: u64, access: AccessMode) -> Result<BufferId> {
        let padded = nbytes.max(COPY_ALIGN).next_multiple_of(COPY_ALIGN);
        if padded > self.gpu.limits.max_buffer_size {
            return Err(Error::Allocation {
                nbytes,
                reason: format!("exceeds max_buffer_size of {}", self.gpu.limits.max_buffer_size),
            });
        }
        let id = self.ids.next();
        let (buffer, error) = self.scoped(wgpu::ErrorFilter::OutOfMemory, || {
            self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("sepconv buffer"),
                size: padded,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        if let Some(e) = error {
            return Err(Error::Allocation { nbytes, reason: e.to_string() });
        }
        self.buffers.lock().insert(
            id,
            GpuBuffer { buffer: Arc::new(buffer), size: nbytes },
        );
        // Access is declared by the shader bindings; the hint is advisory here.
        debug!("allocate {id}: {padded} bytes on device ({access:?})");
        Ok(id)
    }

    fn fill_zero(&self, id: BufferId) -> Result<Event> {
        let (buffer, _) = self.buffer(id)?;
        let (event, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            let mut encoder = self
                .gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("fill_zero") });
            encoder.clear_buffer(&buffer, 0, None);
            self.submit(Some(encoder), "fill_zero")
        });
        match error {
            Some(e) => Err(Error::Transfer(e.to_string())),
            None => Ok(event),
        }
    }

    fn buffer_size(&self, id: BufferId) -> Result<u64> {
        self.buffer(id).map(|(_, size)| size)
    }

    fn write(&self, id: BufferId, bytes: &[u8]) -> Result<Event> {
        let (buffer, size) = self.buffer(id)?;
        if bytes.len() as u64 > size {
            return Err(Error::Transfer(format!(
                "write of {} bytes overruns {id} ({size} bytes)",
                bytes.len()
            )));
        }
        // write_buffer needs a 4-byte multiple; the buffer itself is padded.
        let padded;
        let data: &[u8] = if bytes.len() as u64 % COPY_ALIGN == 0 {
            bytes
        } else {
            let mut v = bytes.to_vec();
            v.resize((bytes.len() as u64).next_multiple_of(COPY_ALIGN) as usize, 0);
            padded = v;
            &padded
        };
        let (event, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            self.gpu.queue.write_buffer(&buffer, 0, data);
            self.submit(None, "write")
        });
        match error {
            Some(e) => Err(Error::Transfer(e.to_string())),
            None => Ok(event),
        }
    }

    fn read(&self, id: BufferId, out: &mut [u8]) -> Result<Event> {
        let (buffer, size) = self.buffer(id)?;
        let len = out.len() as u64;
        if len > size {
            return Err(Error::Transfer(format!("read of {len} bytes overruns {id} ({size} bytes)")));
        }
        if len == 0 {
            return Ok(Event::completed("read"));
        }
        let copy_len = len.next_multiple_of(COPY_ALIGN);

        let (staging, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            let staging = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("sepconv readback"),
                size: copy_len,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self
                .gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("read") });
            encoder.copy_buffer_to_buffer(&buffer, 0, &staging, 0, copy_len);
            self.gpu.queue.submit(std::iter::once(encoder.finish()));
            staging
        });
        if let Some(e) = error {
            return Err(Error::Transfer(e.to_string()));
        }

        let event = Event::pending("read");
        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| Error::Transfer("readback callback never fired".to_string()))?
            .map_err(|e| Error::Transfer(format!("readback map failed: {e}")))?;

        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(&mapped[..out.len()]);
        }
        staging.unmap();
        event.mark_complete();
        Ok(event)
    }

    fn release(&self, id: BufferId) -> Result<()> {
        // Dropping the last Arc lets wgpu free the memory once queued work
        // that uses it has finished.
        self.buffers
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::InvalidHandle(id))
    }

    fn compile(&self, source: &str) -> Result<WgpuProgram> {
        let entry_points = compute_entry_points(source);
        if entry_points.is_empty() {
            return Err(Error::Compile("program has no @compute entry points".to_string()));
        }
        let text = specialize_workgroup(source, self.gpu.workgroup_size.as_array());
        let (_, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            self.gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("sepconv program"),
                source: wgpu::ShaderSource::Wgsl(text.into()),
            })
        });
        if let Some(e) = error {
            return Err(Error::Compile(e.to_string()));
        }
        debug!("compiled program with entry points {entry_points:?}");
        Ok(WgpuProgram {
            source: source.to_string(),
            entry_points,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    fn dispatch(
        &self,
        program: &WgpuProgram,
        entry: &str,
        grid: &[usize],
        block: Option<&[usize]>,
        args: &[DeviceArg],
    ) -> Result<Event> {
        if !program.entry_points.iter().any(|e| e == entry) {
            return Err(Error::dispatch(entry, "unknown entry point"));
        }
        let wg = match block {
            Some(block) => WorkgroupSize::from_block(block)
                .ok_or_else(|| Error::dispatch(entry, format!("unsupported block shape {block:?}")))?,
            None => self.gpu.workgroup_size,
        };
        self.gpu
            .validate_workgroup_size(wg)
            .map_err(|e| Error::dispatch(entry, e.to_string()))?;
        let counts = workgroup_counts(grid, wg).map_err(|reason| Error::dispatch(entry, reason))?;

        let mut buffers = Vec::new();
        for arg in args {
            if let DeviceArg::Buffer(id) = *arg {
                buffers.push(self.buffer(id)?.0);
            }
        }
        let words = pack_uniform(args);
        let pipeline = self.pipeline(program, entry, wg)?;

        let (event, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            let uniform = (!words.is_empty()).then(|| {
                self.gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("sepconv scalars"),
                    contents: bytemuck::cast_slice(&words),
                    usage: wgpu::BufferUsages::UNIFORM,
                })
            });
            let mut entries: Vec<wgpu::BindGroupEntry> = buffers
                .iter()
                .enumerate()
                .map(|(i, b)| wgpu::BindGroupEntry {
                    binding: i as u32,
                    resource: b.as_entire_binding(),
                })
                .collect();
            if let Some(u) = &uniform {
                entries.push(wgpu::BindGroupEntry {
                    binding: buffers.len() as u32,
                    resource: u.as_entire_binding(),
                });
            }
            let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(entry),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &entries,
            });

            let mut encoder = self
                .gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(entry) });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(entry),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(counts[0], counts[1], counts[2]);
            }
            self.submit(Some(encoder), entry)
        });
        if let Some(e) = error {
            return Err(Error::dispatch(entry, e.to_string()));
        }
        debug!("dispatch {entry}: {counts:?} workgroups of {wg}");
        Ok(event)
    }

    fn wait(&self, event: &Event) -> Result<()> {
        self.gpu.device.poll(wgpu::Maintain::Wait);
        event.mark_complete();
        Ok(())
    }
}

/// Scalar arguments as one uniform block: 32-bit words in argument order,
/// zero-padded to a 16-byte multiple. Empty when there are no scalars.
pub(crate) fn pack_uniform(args: &[DeviceArg]) -> Vec<u32> {
    let mut words: Vec<u32> = args.iter().filter_map(DeviceArg::word).collect();
    if !words.is_empty() {
        words.resize(words.len().next_multiple_of(4), 0);
    }
    words
}

/// Number of workgroups per axis covering `grid`.
pub(crate) fn workgroup_counts(grid: &[usize], wg: WorkgroupSize) -> std::result::Result<[u32; 3], String> {
    if grid.is_empty() || grid.len() > 3 {
        return Err(format!("grid {grid:?} must have rank 1 to 3"));
    }
    let dims = wg.as_array();
    let mut counts = [1u32; 3];
    for (i, &extent) in grid.iter().enumerate() {
        let n = extent.div_ceil(dims[i] as usize);
        counts[i] = u32::try_from(n).map_err(|_| format!("grid {grid:?} needs too many workgroups"))?;
    }
    Ok(counts)
}
