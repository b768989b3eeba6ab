//! GPU (Metal/Vulkan via wgpu) implementation of the accelerator capabilities.
//!
//! `WgpuDevice` backs device-domain allocations with wgpu storage buffers and
//! renderer buffers with `VERTEX | STORAGE` buffers the render pass can bind
//! directly. Registration and mapping hand the kernels a synthetic address
//! that resolves to the renderer buffer only while it is mapped, so the
//! sharing protocol is enforced the same way the CPU reference does.
//!
//! # Kernels
//! Each kernel is one command-buffer submission, in issue order:
//!
//! 1. `integrate`: gravity, damping, wall reflection
//! 2. `compute_hash`: per-particle cell hash + identity index
//! 3. `sort_by_key`: bitonic sort of `(hash, index)` pairs, padded to a power
//!    of two (pack, `log2(n)*(log2(n)+1)/2` compare passes, unpack)
//! 4. `find_cell_bounds`: clear cells, then mark run starts/ends
//! 5. `collide`: DEM contact forces over the 27 neighbouring cells
//!
//! `synchronize` waits for the queue with `device.poll(Maintain::Wait)`.

mod buffers;

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::device::{BufferHandle, CollideArgs, ComputeKernels, GraphicsApi, InteropApi, InteropToken, MappedRange};
use crate::error::{KernelError, Result};
use crate::memory::{zeroed_bytes, Address, MemoryDomain, MemorySource};
use crate::params::SimParams;
use buffers::{align4, create_uniform, create_zeroed_buf, graphics_usage, read_bytes, storage_usage, write_bytes};

/// Workgroup size baked into every kernel (`@workgroup_size(256)`).
const WORKGROUP_SIZE: u32 = 256;

const ADDRESS_ALIGN: u64 = 256;
const ADDRESS_BASE: u64 = 0x1000_0000;

/// Per-launch uniform. Must match `Launch` in `shaders/common.wgsl`.
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct LaunchParams {
    count: u32,
    num_cells: u32,
    dt: f32,
    _pad: u32,
}

/// One bitonic stage. Must match `SortStage` in `shaders/sort.wgsl`.
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct SortStage {
    k: u32,
    j: u32,
    padded: u32,
    count: u32,
}

enum Block {
    Host(Vec<u8>),
    Device(Arc<wgpu::Buffer>),
}

impl Block {
    fn domain(&self) -> MemoryDomain {
        match self {
            Block::Host(_) => MemoryDomain::Host,
            Block::Device(_) => MemoryDomain::Device,
        }
    }

    fn len(&self) -> usize {
        match self {
            Block::Host(bytes) => bytes.len(),
            Block::Device(buffer) => buffer.size() as usize,
        }
    }
}

struct GraphicsBuffer {
    buffer: Option<Arc<wgpu::Buffer>>,
    size: usize,
    registered: Option<InteropToken>,
}

struct Registration {
    handle: BufferHandle,
    mapped_at: Option<Address>,
}

struct WgpuState {
    next_address: u64,
    blocks: HashMap<Address, Block>,
    next_handle: u32,
    buffers: HashMap<BufferHandle, GraphicsBuffer>,
    next_token: u64,
    registrations: HashMap<InteropToken, Registration>,
    params: Option<SimParams>,
}

impl WgpuState {
    fn fresh_address(&mut self, size: usize) -> Address {
        let address = Address::new(self.next_address);
        self.next_address += (size as u64).max(1).div_ceil(ADDRESS_ALIGN) * ADDRESS_ALIGN;
        address
    }

    fn params(&self) -> Result<SimParams> {
        self.params
            .ok_or_else(|| KernelError::accelerator("kernel launched before parameters were uploaded"))
    }

    fn block(&self, domain: MemoryDomain, address: Address) -> Result<&Block> {
        match self.blocks.get(&address) {
            Some(block) if block.domain() == domain => Ok(block),
            _ => Err(KernelError::InvalidPointer { address, domain }),
        }
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&GraphicsBuffer> {
        self.buffers
            .get(&handle)
            .ok_or_else(|| KernelError::registration(format!("unknown {handle}")))
    }

    /// Storage the renderer may touch right now.
    fn renderer_buffer(&self, handle: BufferHandle) -> Result<(Arc<wgpu::Buffer>, usize)> {
        let entry = self.buffer(handle)?;
        let mapped = entry
            .registered
            .and_then(|token| self.registrations.get(&token))
            .is_some_and(|r| r.mapped_at.is_some());
        if mapped {
            return Err(KernelError::accelerator(format!(
                "renderer access to {handle} while it is mapped for compute"
            )));
        }
        let buffer = entry
            .buffer
            .clone()
            .ok_or_else(|| KernelError::invalid_argument(format!("{handle} has no storage")))?;
        Ok((buffer, entry.size))
    }

    /// Device block or mapped renderer buffer at `address`.
    fn kernel_buffer(&self, address: Address) -> Result<Arc<wgpu::Buffer>> {
        if let Some(Block::Device(buffer)) = self.blocks.get(&address) {
            return Ok(Arc::clone(buffer));
        }
        self.registrations
            .values()
            .find(|r| r.mapped_at == Some(address))
            .and_then(|r| self.buffers.get(&r.handle))
            .and_then(|b| b.buffer.clone())
            .ok_or_else(|| {
                KernelError::accelerator(format!(
                    "{address} is neither device memory nor a mapped interop resource"
                ))
            })
    }
}

struct Pipelines {
    integrate_bgl: wgpu::BindGroupLayout,
    integrate: wgpu::ComputePipeline,
    hash_bgl: wgpu::BindGroupLayout,
    hash: wgpu::ComputePipeline,
    sort_bgl: wgpu::BindGroupLayout,
    sort_pack: wgpu::ComputePipeline,
    sort_step: wgpu::ComputePipeline,
    sort_unpack: wgpu::ComputePipeline,
    cells_bgl: wgpu::BindGroupLayout,
    cells_clear: wgpu::ComputePipeline,
    cells_find: wgpu::ComputePipeline,
    collide_bgl: wgpu::BindGroupLayout,
    collide: wgpu::ComputePipeline,
}

impl Pipelines {
    fn new(device: &wgpu::Device) -> Self {
        let integrate_shader = shader(device, "integrate", include_str!("shaders/integrate.wgsl"));
        let hash_shader = shader(device, "hash", include_str!("shaders/hash.wgsl"));
        let sort_shader = shader(device, "sort", include_str!("shaders/sort.wgsl"));
        let cells_shader = shader(device, "cells", include_str!("shaders/cells.wgsl"));
        let collide_shader = shader(device, "collide", include_str!("shaders/collide.wgsl"));

        let integrate_bgl = layout(
            device,
            "integrate_bgl",
            &[bgl_uniform(0), bgl_uniform(1), bgl_storage_rw(2), bgl_storage_rw(3)],
        );
        let hash_bgl = layout(
            device,
            "hash_bgl",
            &[bgl_uniform(0), bgl_uniform(1), bgl_storage_ro(2), bgl_storage_rw(3), bgl_storage_rw(4)],
        );
        let sort_bgl = layout(
            device,
            "sort_bgl",
            &[bgl_uniform(0), bgl_storage_rw(1), bgl_storage_rw(2), bgl_storage_rw(3)],
        );
        let cells_bgl = layout(
            device,
            "cells_bgl",
            &[bgl_uniform(0), bgl_storage_ro(1), bgl_storage_rw(2), bgl_storage_rw(3)],
        );
        let collide_bgl = layout(
            device,
            "collide_bgl",
            &[
                bgl_uniform(0),    // params
                bgl_uniform(1),    // launch
                bgl_storage_ro(2), // positions
                bgl_storage_ro(3), // velocities
                bgl_storage_ro(4), // grid_index
                bgl_storage_ro(5), // cell_start
                bgl_storage_ro(6), // cell_end
                bgl_storage_rw(7), // new_velocities
            ],
        );

        Self {
            integrate: pipeline(device, "integrate", &integrate_shader, "integrate", &integrate_bgl),
            hash: pipeline(device, "compute_hash", &hash_shader, "compute_hash", &hash_bgl),
            sort_pack: pipeline(device, "sort_pack", &sort_shader, "pack_pairs", &sort_bgl),
            sort_step: pipeline(device, "sort_step", &sort_shader, "bitonic_step", &sort_bgl),
            sort_unpack: pipeline(device, "sort_unpack", &sort_shader, "unpack_pairs", &sort_bgl),
            cells_clear: pipeline(device, "cells_clear", &cells_shader, "clear_cells", &cells_bgl),
            cells_find: pipeline(device, "cells_find", &cells_shader, "find_bounds", &cells_bgl),
            collide: pipeline(device, "collide", &collide_shader, "collide", &collide_bgl),
            integrate_bgl,
            hash_bgl,
            sort_bgl,
            cells_bgl,
            collide_bgl,
        }
    }
}

/// Check whether a GPU adapter is available.
pub fn gpu_available() -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }));
    adapter.is_some()
}

/// Accelerator running the particle kernels as wgpu compute shaders.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: Pipelines,
    params_buffer: wgpu::Buffer,
    state: Mutex<WgpuState>,
}

impl WgpuDevice {
    /// Open the default high-performance adapter.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| KernelError::accelerator("no suitable GPU adapter found"))?;

        tracing::info!("GPU adapter: {:?}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("particle_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| KernelError::accelerator(format!("failed to create device: {e}")))?;

        Self::from_device(device, queue)
    }

    /// Wrap a device the renderer already owns, so both sides share buffers.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Result<Self> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipelines = Pipelines::new(&device);
        let params_buffer = create_uniform(&device, "sim_params", &SimParams::new([1, 1, 1]));
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(KernelError::accelerator(format!("pipeline creation failed: {err}")));
        }

        Ok(Self {
            device,
            queue,
            pipelines,
            params_buffer,
            state: Mutex::new(WgpuState {
                next_address: ADDRESS_BASE,
                blocks: HashMap::new(),
                next_handle: 1,
                buffers: HashMap::new(),
                next_token: 1,
                registrations: HashMap::new(),
                params: None,
            }),
        })
    }

    /// The wgpu device.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The wgpu queue.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The wgpu buffer behind a renderer handle, for binding in a render pass.
    ///
    /// Only draw with it while the owning interop buffer is not mapped.
    pub fn graphics_buffer(&self, handle: BufferHandle) -> Option<Arc<wgpu::Buffer>> {
        self.state.lock().buffers.get(&handle).and_then(|b| b.buffer.clone())
    }

    /// Run `f` inside a validation error scope.
    fn checked<T>(&self, label: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let result = f();
        let scope = pollster::block_on(self.device.pop_error_scope());
        match (result, scope) {
            (Err(e), _) => Err(e),
            (Ok(_), Some(err)) => Err(KernelError::accelerator(format!("{label}: {err}"))),
            (Ok(value), None) => Ok(value),
        }
    }

    fn bind_group(&self, label: &str, layout: &wgpu::BindGroupLayout, buffers: &[&wgpu::Buffer]) -> wgpu::BindGroup {
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, buffer)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &entries,
        })
    }

    /// Encode `passes` as consecutive compute passes and submit once.
    fn submit(&self, label: &str, passes: &[(&wgpu::ComputePipeline, &wgpu::BindGroup, u32)]) {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(label),
        });
        for &(pipeline, bind_group, workgroups) in passes {
            if workgroups == 0 {
                continue;
            }
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn workgroups(&self, items: usize) -> Result<u32> {
        let groups = items.div_ceil(WORKGROUP_SIZE as usize);
        let max = self.device.limits().max_compute_workgroups_per_dimension as usize;
        if groups > max {
            return Err(KernelError::invalid_argument(format!(
                "{items} work items need {groups} workgroups, device allows {max}"
            )));
        }
        Ok(groups as u32)
    }

    fn launch_params(&self, label: &str, count: usize, num_cells: usize, dt: f32) -> Result<wgpu::Buffer> {
        let to_u32 = |n: usize, what: &str| {
            u32::try_from(n).map_err(|_| KernelError::invalid_argument(format!("{what} {n} exceeds u32")))
        };
        let launch = LaunchParams {
            count: to_u32(count, "count")?,
            num_cells: to_u32(num_cells, "cell count")?,
            dt,
            _pad: 0,
        };
        Ok(create_uniform(&self.device, label, &launch))
    }
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("WgpuDevice")
            .field("blocks", &s.blocks.len())
            .field("buffers", &s.buffers.len())
            .field("registrations", &s.registrations.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

impl MemorySource for WgpuDevice {
    fn reserve(&self, domain: MemoryDomain, size: usize) -> Result<Address> {
        let block = match domain {
            MemoryDomain::Host => Block::Host(zeroed_bytes(domain, size)?),
            MemoryDomain::Device => {
                Block::Device(Arc::new(create_zeroed_buf(&self.device, "device_alloc", size, storage_usage())?))
            }
        };
        let mut s = self.state.lock();
        let address = s.fresh_address(size);
        s.blocks.insert(address, block);
        Ok(address)
    }

    fn release(&self, domain: MemoryDomain, address: Address) -> Result<()> {
        let mut s = self.state.lock();
        s.block(domain, address)?;
        if let Some(Block::Device(buffer)) = s.blocks.remove(&address) {
            buffer.destroy();
        }
        Ok(())
    }

    fn zero(&self, domain: MemoryDomain, address: Address, len: usize) -> Result<()> {
        let mut s = self.state.lock();
        match s.blocks.get_mut(&address) {
            Some(Block::Host(bytes)) if domain == MemoryDomain::Host => {
                let len = len.min(bytes.len());
                bytes[..len].fill(0);
                Ok(())
            }
            Some(Block::Device(buffer)) if domain == MemoryDomain::Device => {
                let buffer = Arc::clone(buffer);
                drop(s);
                let size = align4(len).min(buffer.size());
                let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("zero"),
                });
                encoder.clear_buffer(&buffer, 0, Some(size));
                self.queue.submit(std::iter::once(encoder.finish()));
                Ok(())
            }
            _ => Err(KernelError::InvalidPointer { address, domain }),
        }
    }

    fn write(&self, domain: MemoryDomain, address: Address, offset: usize, data: &[u8]) -> Result<()> {
        let mut s = self.state.lock();
        match s.blocks.get_mut(&address) {
            Some(Block::Host(bytes)) if domain == MemoryDomain::Host => {
                let end = offset
                    .checked_add(data.len())
                    .filter(|&end| end <= bytes.len())
                    .ok_or_else(|| KernelError::invalid_argument("host write out of range"))?;
                bytes[offset..end].copy_from_slice(data);
                Ok(())
            }
            Some(Block::Device(buffer)) if domain == MemoryDomain::Device => {
                write_bytes(&self.queue, buffer, offset, data)
            }
            _ => Err(KernelError::InvalidPointer { address, domain }),
        }
    }

    fn read(&self, domain: MemoryDomain, address: Address, offset: usize, out: &mut [u8]) -> Result<()> {
        let s = self.state.lock();
        let buffer = match s.block(domain, address)? {
            Block::Host(bytes) => {
                let end = offset
                    .checked_add(out.len())
                    .filter(|&end| end <= bytes.len())
                    .ok_or_else(|| KernelError::invalid_argument("host read out of range"))?;
                out.copy_from_slice(&bytes[offset..end]);
                return Ok(());
            }
            Block::Device(buffer) => Arc::clone(buffer),
        };
        drop(s);
        read_bytes(&self.device, &self.queue, &buffer, offset, out)
    }
}

// ---------------------------------------------------------------------------
// Renderer side
// ---------------------------------------------------------------------------

impl GraphicsApi for WgpuDevice {
    fn create_buffer(&self) -> Result<BufferHandle> {
        let mut s = self.state.lock();
        let handle = BufferHandle::new(s.next_handle);
        s.next_handle += 1;
        s.buffers.insert(handle, GraphicsBuffer { buffer: None, size: 0, registered: None });
        Ok(handle)
    }

    fn buffer_storage(&self, handle: BufferHandle, size: usize) -> Result<()> {
        if let Some(token) = self.state.lock().buffer(handle)?.registered {
            return Err(KernelError::registration(format!(
                "cannot respecify storage of {handle} while registered as {token}"
            )));
        }
        let buffer = Arc::new(create_zeroed_buf(&self.device, "graphics_buffer", size, graphics_usage())?);

        let mut s = self.state.lock();
        let entry = s
            .buffers
            .get_mut(&handle)
            .ok_or_else(|| KernelError::registration(format!("unknown {handle}")))?;
        if let Some(old) = entry.buffer.replace(buffer) {
            old.destroy();
        }
        entry.size = size;
        Ok(())
    }

    fn write_buffer(&self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let (buffer, size) = self.state.lock().renderer_buffer(handle)?;
        if offset.checked_add(data.len()).map_or(true, |end| end > size) {
            return Err(KernelError::invalid_argument(format!(
                "write of {} bytes at offset {offset} exceeds {handle} ({size} bytes)",
                data.len()
            )));
        }
        write_bytes(&self.queue, &buffer, offset, data)
    }

    fn read_buffer(&self, handle: BufferHandle, offset: usize, out: &mut [u8]) -> Result<()> {
        let (buffer, size) = self.state.lock().renderer_buffer(handle)?;
        if offset.checked_add(out.len()).map_or(true, |end| end > size) {
            return Err(KernelError::invalid_argument(format!(
                "read of {} bytes at offset {offset} exceeds {handle} ({size} bytes)",
                out.len()
            )));
        }
        read_bytes(&self.device, &self.queue, &buffer, offset, out)
    }

    fn delete_buffer(&self, handle: BufferHandle) -> Result<()> {
        let mut s = self.state.lock();
        if let Some(token) = s.buffer(handle)?.registered {
            return Err(KernelError::registration(format!(
                "cannot delete {handle} while registered as {token}"
            )));
        }
        if let Some(buffer) = s.buffers.remove(&handle).and_then(|b| b.buffer) {
            buffer.destroy();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Interop
// ---------------------------------------------------------------------------

impl InteropApi for WgpuDevice {
    fn register_buffer(&self, handle: BufferHandle) -> Result<InteropToken> {
        let mut s = self.state.lock();
        let token = InteropToken::new(s.next_token);
        let entry = s
            .buffers
            .get_mut(&handle)
            .ok_or_else(|| KernelError::registration(format!("unknown {handle}")))?;
        if let Some(existing) = entry.registered {
            return Err(KernelError::registration(format!("{handle} is already registered as {existing}")));
        }
        if entry.buffer.is_none() {
            return Err(KernelError::registration(format!("{handle} has no storage")));
        }
        entry.registered = Some(token);
        s.next_token += 1;
        s.registrations.insert(token, Registration { handle, mapped_at: None });
        Ok(token)
    }

    fn unregister_buffer(&self, token: InteropToken) -> Result<()> {
        let mut s = self.state.lock();
        let registration = s
            .registrations
            .get(&token)
            .ok_or_else(|| KernelError::registration(format!("unknown {token}")))?;
        if registration.mapped_at.is_some() {
            return Err(KernelError::registration(format!("{token} is still mapped")));
        }
        let handle = registration.handle;
        s.registrations.remove(&token);
        if let Some(entry) = s.buffers.get_mut(&handle) {
            entry.registered = None;
        }
        Ok(())
    }

    fn map_resource(&self, token: InteropToken) -> Result<MappedRange> {
        let mut s = self.state.lock();
        let (handle, already) = match s.registrations.get(&token) {
            Some(r) => (r.handle, r.mapped_at.is_some()),
            None => return Err(KernelError::registration(format!("unknown {token}"))),
        };
        if already {
            return Err(KernelError::accelerator(format!("{token} is already mapped")));
        }
        let size = s.buffer(handle)?.size;
        let address = s.fresh_address(size);
        if let Some(r) = s.registrations.get_mut(&token) {
            r.mapped_at = Some(address);
        }
        Ok(MappedRange { address, size })
    }

    fn unmap_resource(&self, token: InteropToken) -> Result<()> {
        let mut s = self.state.lock();
        let registration = s
            .registrations
            .get_mut(&token)
            .ok_or_else(|| KernelError::registration(format!("unknown {token}")))?;
        if registration.mapped_at.take().is_none() {
            return Err(KernelError::accelerator(format!("{token} is not mapped")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

impl ComputeKernels for WgpuDevice {
    fn set_parameters(&self, params: &SimParams) -> Result<()> {
        params.validate()?;
        self.queue.write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(params));
        self.state.lock().params = Some(*params);
        Ok(())
    }

    fn integrate(&self, positions: Address, velocities: Address, dt: f32, count: usize) -> Result<()> {
        let (params, pos, vel) = {
            let s = self.state.lock();
            (s.params()?, s.kernel_buffer(positions)?, s.kernel_buffer(velocities)?)
        };
        let launch = self.launch_params("integrate_launch", count, params.cell_count(), dt)?;
        let groups = self.workgroups(count)?;
        let p = &self.pipelines;
        self.checked("integrate", || {
            let bg = self.bind_group("integrate", &p.integrate_bgl, &[&self.params_buffer, &launch, &pos, &vel]);
            self.submit("integrate", &[(&p.integrate, &bg, groups)]);
            Ok(())
        })
    }

    fn compute_hash(&self, grid_hash: Address, grid_index: Address, positions: Address, count: usize) -> Result<()> {
        let (params, hash, index, pos) = {
            let s = self.state.lock();
            (
                s.params()?,
                s.kernel_buffer(grid_hash)?,
                s.kernel_buffer(grid_index)?,
                s.kernel_buffer(positions)?,
            )
        };
        let launch = self.launch_params("hash_launch", count, params.cell_count(), 0.0)?;
        let groups = self.workgroups(count)?;
        let p = &self.pipelines;
        self.checked("compute_hash", || {
            let bg = self.bind_group("compute_hash", &p.hash_bgl, &[&self.params_buffer, &launch, &pos, &hash, &index]);
            self.submit("compute_hash", &[(&p.hash, &bg, groups)]);
            Ok(())
        })
    }

    fn sort_by_key(&self, grid_hash: Address, grid_index: Address, count: usize) -> Result<()> {
        let (hash, index) = {
            let s = self.state.lock();
            (s.kernel_buffer(grid_hash)?, s.kernel_buffer(grid_index)?)
        };
        if count < 2 {
            return Ok(());
        }
        let padded = count.next_power_of_two();
        let count_u32 = u32::try_from(count)
            .map_err(|_| KernelError::invalid_argument(format!("count {count} exceeds u32")))?;
        let padded_u32 = u32::try_from(padded)
            .map_err(|_| KernelError::invalid_argument(format!("padded count {padded} exceeds u32")))?;

        let mut stages = vec![SortStage { k: 0, j: 0, padded: padded_u32, count: count_u32 }];
        let mut k = 2u32;
        while k <= padded_u32 {
            let mut j = k / 2;
            while j > 0 {
                stages.push(SortStage { k, j, padded: padded_u32, count: count_u32 });
                j /= 2;
            }
            k *= 2;
        }
        stages.push(SortStage { k: 0, j: 0, padded: padded_u32, count: count_u32 });

        // One uniform slot per stage, each at an aligned offset.
        let stride = (self.device.limits().min_uniform_buffer_offset_alignment as usize)
            .max(std::mem::size_of::<SortStage>());
        let mut bytes = vec![0u8; stages.len() * stride];
        for (i, stage) in stages.iter().enumerate() {
            bytes[i * stride..i * stride + std::mem::size_of::<SortStage>()]
                .copy_from_slice(bytemuck::bytes_of(stage));
        }
        let stage_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("sort_stages"),
            contents: &bytes,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let pairs = create_zeroed_buf(&self.device, "sort_pairs", padded * 8, wgpu::BufferUsages::STORAGE)?;
        let padded_groups = self.workgroups(padded)?;
        let count_groups = self.workgroups(count)?;
        let p = &self.pipelines;

        let result = self.checked("sort_by_key", || {
            let bind_groups: Vec<wgpu::BindGroup> = (0..stages.len())
                .map(|i| {
                    self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some("sort_stage"),
                        layout: &p.sort_bgl,
                        entries: &[
                            wgpu::BindGroupEntry {
                                binding: 0,
                                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                                    buffer: &stage_buffer,
                                    offset: (i * stride) as u64,
                                    size: NonZeroU64::new(std::mem::size_of::<SortStage>() as u64),
                                }),
                            },
                            wgpu::BindGroupEntry { binding: 1, resource: hash.as_entire_binding() },
                            wgpu::BindGroupEntry { binding: 2, resource: index.as_entire_binding() },
                            wgpu::BindGroupEntry { binding: 3, resource: pairs.as_entire_binding() },
                        ],
                    })
                })
                .collect();

            let last = bind_groups.len() - 1;
            let passes: Vec<(&wgpu::ComputePipeline, &wgpu::BindGroup, u32)> = bind_groups
                .iter()
                .enumerate()
                .map(|(i, bg)| match i {
                    0 => (&p.sort_pack, bg, padded_groups),
                    i if i == last => (&p.sort_unpack, bg, count_groups),
                    _ => (&p.sort_step, bg, padded_groups),
                })
                .collect();
            self.submit("sort_by_key", &passes);
            Ok(())
        });
        pairs.destroy();
        result
    }

    fn find_cell_bounds(
        &self,
        cell_start: Address,
        cell_end: Address,
        grid_hash: Address,
        count: usize,
        num_cells: usize,
    ) -> Result<()> {
        let (start, end, hash) = {
            let s = self.state.lock();
            (
                s.kernel_buffer(cell_start)?,
                s.kernel_buffer(cell_end)?,
                s.kernel_buffer(grid_hash)?,
            )
        };
        let launch = self.launch_params("cells_launch", count, num_cells, 0.0)?;
        let cell_groups = self.workgroups(num_cells)?;
        let particle_groups = self.workgroups(count)?;
        let p = &self.pipelines;
        self.checked("find_cell_bounds", || {
            let bg = self.bind_group("find_cell_bounds", &p.cells_bgl, &[&launch, &hash, &start, &end]);
            self.submit(
                "find_cell_bounds",
                &[(&p.cells_clear, &bg, cell_groups), (&p.cells_find, &bg, particle_groups)],
            );
            Ok(())
        })
    }

    fn collide(&self, args: &CollideArgs) -> Result<()> {
        let (params, buffers) = {
            let s = self.state.lock();
            let buffers = [
                s.kernel_buffer(args.positions)?,
                s.kernel_buffer(args.velocities)?,
                s.kernel_buffer(args.grid_index)?,
                s.kernel_buffer(args.cell_start)?,
                s.kernel_buffer(args.cell_end)?,
                s.kernel_buffer(args.new_velocities)?,
            ];
            (s.params()?, buffers)
        };
        let launch = self.launch_params("collide_launch", args.count, params.cell_count(), 0.0)?;
        let groups = self.workgroups(args.count)?;
        let p = &self.pipelines;
        self.checked("collide", || {
            let [pos, vel, index, start, end, out] = &buffers;
            let bg = self.bind_group(
                "collide",
                &p.collide_bgl,
                &[&self.params_buffer, &launch, pos, vel, index, start, end, out],
            );
            self.submit("collide", &[(&p.collide, &bg, groups)]);
            Ok(())
        })
    }

    fn synchronize(&self) -> Result<()> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

// ---- Pipeline construction helpers ----

fn shader(device: &wgpu::Device, label: &str, body: &str) -> wgpu::ShaderModule {
    let source = format!("{}\n{}", include_str!("shaders/common.wgsl"), body);
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    })
}

fn layout(device: &wgpu::Device, label: &str, entries: &[wgpu::BindGroupLayoutEntry]) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries,
    })
}

fn pipeline(
    device: &wgpu::Device,
    label: &str,
    module: &wgpu::ShaderModule,
    entry_point: &str,
    bgl: &wgpu::BindGroupLayout,
) -> wgpu::ComputePipeline {
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[bgl],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}

fn bgl_uniform(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_ro(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_rw(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
