//! In-process reference accelerator.
//!
//! `CpuDevice` implements every capability trait on host memory: device
//! reservations are byte blocks keyed by synthetic addresses, graphics buffers
//! are byte vectors keyed by handle, and kernels run the sequential versions
//! in [`kernels`]. It enforces the same sharing rules a real driver would
//! (no renderer access to a mapped buffer, no kernel access to an unmapped
//! one) and adds test seams: a device-memory limit, one-shot fault injection
//! per operation and a log of protocol calls.

pub mod kernels;

use std::collections::{HashMap, HashSet};

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::device::{BufferHandle, CollideArgs, ComputeKernels, GraphicsApi, InteropApi, InteropToken, MappedRange};
use crate::error::{KernelError, Result};
use crate::memory::{zeroed_bytes, Address, MemoryDomain, MemorySource};
use crate::params::SimParams;

/// Alignment of every synthetic address.
const ADDRESS_ALIGN: u64 = 256;

/// First address handed out. Keeps small integers recognisably invalid.
const ADDRESS_BASE: u64 = 0x1000_0000;

/// Operations that can be logged and made to fail. Variants mirror the
/// capability trait methods.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceOp {
    /// Memory reservation (not logged).
    Reserve,
    /// Memory release (not logged).
    Release,
    CreateBuffer,
    BufferStorage,
    WriteBuffer,
    ReadBuffer,
    DeleteBuffer,
    Register,
    Unregister,
    Map,
    Unmap,
    SetParameters,
    Integrate,
    ComputeHash,
    SortByKey,
    FindCellBounds,
    Collide,
    Synchronize,
}

impl DeviceOp {
    fn logged(self) -> bool {
        !matches!(self, DeviceOp::Reserve | DeviceOp::Release)
    }

    fn injected_error(self) -> KernelError {
        let msg = format!("injected {self:?} fault");
        match self {
            DeviceOp::CreateBuffer
            | DeviceOp::BufferStorage
            | DeviceOp::DeleteBuffer
            | DeviceOp::Register
            | DeviceOp::Unregister => KernelError::registration(msg),
            _ => KernelError::accelerator(msg),
        }
    }
}

struct Block {
    domain: MemoryDomain,
    bytes: Vec<u8>,
}

struct GraphicsBuffer {
    storage: Vec<u8>,
    registered: Option<InteropToken>,
}

struct Registration {
    handle: BufferHandle,
    mapped_at: Option<Address>,
}

struct CpuState {
    next_address: u64,
    blocks: HashMap<Address, Block>,
    device_limit: Option<usize>,
    device_bytes: usize,

    next_handle: u32,
    buffers: HashMap<BufferHandle, GraphicsBuffer>,
    next_token: u64,
    registrations: HashMap<InteropToken, Registration>,

    params: Option<SimParams>,
    pending: u64,

    faults: HashSet<DeviceOp>,
    calls: Vec<DeviceOp>,
}

impl CpuState {
    fn new(device_limit: Option<usize>) -> Self {
        Self {
            next_address: ADDRESS_BASE,
            blocks: HashMap::new(),
            device_limit,
            device_bytes: 0,
            next_handle: 1,
            buffers: HashMap::new(),
            next_token: 1,
            registrations: HashMap::new(),
            params: None,
            pending: 0,
            faults: HashSet::new(),
            calls: Vec::new(),
        }
    }

    /// Log `op` and fire its injected fault, if armed.
    fn enter(&mut self, op: DeviceOp) -> Result<()> {
        if op.logged() {
            self.calls.push(op);
        }
        if self.faults.remove(&op) {
            return Err(op.injected_error());
        }
        Ok(())
    }

    /// Like [`CpuState::enter`], for queued kernel work.
    fn submit(&mut self, op: DeviceOp) -> Result<()> {
        self.enter(op)?;
        self.pending += 1;
        Ok(())
    }

    fn fresh_address(&mut self, size: usize) -> Address {
        let address = Address::new(self.next_address);
        let span = (size as u64).max(1).div_ceil(ADDRESS_ALIGN) * ADDRESS_ALIGN;
        self.next_address += span;
        address
    }

    fn params(&self) -> Result<SimParams> {
        self.params
            .ok_or_else(|| KernelError::accelerator("kernel launched before parameters were uploaded"))
    }

    fn block(&self, domain: MemoryDomain, address: Address) -> Result<&Block> {
        match self.blocks.get(&address) {
            Some(block) if block.domain == domain => Ok(block),
            _ => Err(KernelError::InvalidPointer { address, domain }),
        }
    }

    fn block_mut(&mut self, domain: MemoryDomain, address: Address) -> Result<&mut Block> {
        match self.blocks.get_mut(&address) {
            Some(block) if block.domain == domain => Ok(block),
            _ => Err(KernelError::InvalidPointer { address, domain }),
        }
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&GraphicsBuffer> {
        self.buffers
            .get(&handle)
            .ok_or_else(|| KernelError::registration(format!("unknown {handle}")))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut GraphicsBuffer> {
        self.buffers
            .get_mut(&handle)
            .ok_or_else(|| KernelError::registration(format!("unknown {handle}")))
    }

    /// Fail if the renderer would touch a buffer the kernels currently own.
    fn check_renderer_access(&self, handle: BufferHandle, buffer: &GraphicsBuffer) -> Result<()> {
        let mapped = buffer
            .registered
            .and_then(|token| self.registrations.get(&token))
            .is_some_and(|r| r.mapped_at.is_some());
        if mapped {
            return Err(KernelError::accelerator(format!(
                "renderer access to {handle} while it is mapped for compute"
            )));
        }
        Ok(())
    }

    /// Kernel-visible bytes at `address`: a device block, or a mapped interop
    /// resource.
    fn kernel_bytes(&self, address: Address) -> Result<&Vec<u8>> {
        if let Some(block) = self.blocks.get(&address) {
            if block.domain == MemoryDomain::Device {
                return Ok(&block.bytes);
            }
        }
        let handle = self
            .registrations
            .values()
            .find(|r| r.mapped_at == Some(address))
            .map(|r| r.handle);
        if let Some(buffer) = handle.and_then(|h| self.buffers.get(&h)) {
            return Ok(&buffer.storage);
        }
        Err(KernelError::accelerator(format!(
            "{address} is neither device memory nor a mapped interop resource"
        )))
    }

    fn kernel_bytes_mut(&mut self, address: Address) -> Result<&mut Vec<u8>> {
        let is_device_block = self
            .blocks
            .get(&address)
            .is_some_and(|b| b.domain == MemoryDomain::Device);
        if is_device_block {
            if let Some(block) = self.blocks.get_mut(&address) {
                return Ok(&mut block.bytes);
            }
        }
        let handle = self
            .registrations
            .values()
            .find(|r| r.mapped_at == Some(address))
            .map(|r| r.handle);
        if let Some(buffer) = handle.and_then(|h| self.buffers.get_mut(&h)) {
            return Ok(&mut buffer.storage);
        }
        Err(KernelError::accelerator(format!(
            "{address} is neither device memory nor a mapped interop resource"
        )))
    }

    fn load<T: Pod>(&self, address: Address, count: usize) -> Result<Vec<T>> {
        let bytes = self.kernel_bytes(address)?;
        let need = count * std::mem::size_of::<T>();
        if bytes.len() < need {
            return Err(KernelError::accelerator(format!(
                "kernel read of {need} bytes overruns {address} ({} bytes)",
                bytes.len()
            )));
        }
        let mut out = vec![T::zeroed(); count];
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&bytes[..need]);
        Ok(out)
    }

    fn store<T: Pod>(&mut self, address: Address, data: &[T]) -> Result<()> {
        let bytes = self.kernel_bytes_mut(address)?;
        let src: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() < src.len() {
            return Err(KernelError::accelerator(format!(
                "kernel write of {} bytes overruns {address} ({} bytes)",
                src.len(),
                bytes.len()
            )));
        }
        bytes[..src.len()].copy_from_slice(src);
        Ok(())
    }
}

fn check_range(len: usize, offset: usize, count: usize, what: &str) -> Result<()> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(KernelError::invalid_argument(format!(
            "{what} of {count} bytes at offset {offset} exceeds {len} bytes"
        ))),
    }
}

/// Reference accelerator running everything on the calling thread.
pub struct CpuDevice {
    state: Mutex<CpuState>,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    /// Device with unlimited memory.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CpuState::new(None)),
        }
    }

    /// Device whose `Device`-domain reservations fail beyond `limit` bytes.
    pub fn with_device_memory_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(CpuState::new(Some(limit))),
        }
    }

    /// Make the next call of `op` fail.
    pub fn fail_next(&self, op: DeviceOp) {
        self.state.lock().faults.insert(op);
    }

    /// Protocol calls issued so far, in order. Memory reservations and
    /// transfers are not logged.
    pub fn calls(&self) -> Vec<DeviceOp> {
        self.state.lock().calls.clone()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Kernel submissions not yet synchronized.
    pub fn pending_work(&self) -> u64 {
        self.state.lock().pending
    }

    /// Last uploaded parameters.
    pub fn parameters(&self) -> Option<SimParams> {
        self.state.lock().params
    }

    /// Live graphics buffers.
    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Live interop registrations.
    pub fn registration_count(&self) -> usize {
        self.state.lock().registrations.len()
    }

    /// Registrations currently mapped.
    pub fn mapped_count(&self) -> usize {
        self.state
            .lock()
            .registrations
            .values()
            .filter(|r| r.mapped_at.is_some())
            .count()
    }

    /// Bytes reserved in the `Device` domain.
    pub fn device_bytes(&self) -> usize {
        self.state.lock().device_bytes
    }
}

impl std::fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("CpuDevice")
            .field("blocks", &s.blocks.len())
            .field("device_bytes", &s.device_bytes)
            .field("buffers", &s.buffers.len())
            .field("registrations", &s.registrations.len())
            .field("pending", &s.pending)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

impl MemorySource for CpuDevice {
    fn reserve(&self, domain: MemoryDomain, size: usize) -> Result<Address> {
        let mut s = self.state.lock();
        if s.faults.remove(&DeviceOp::Reserve) {
            return Err(KernelError::AllocationFailure { domain, size });
        }
        if domain == MemoryDomain::Device {
            let total = s
                .device_bytes
                .checked_add(size)
                .ok_or(KernelError::AllocationFailure { domain, size })?;
            if s.device_limit.is_some_and(|limit| total > limit) {
                return Err(KernelError::AllocationFailure { domain, size });
            }
        }
        let bytes = zeroed_bytes(domain, size)?;
        if domain == MemoryDomain::Device {
            s.device_bytes += size;
        }
        let address = s.fresh_address(size);
        s.blocks.insert(address, Block { domain, bytes });
        Ok(address)
    }

    fn release(&self, domain: MemoryDomain, address: Address) -> Result<()> {
        let mut s = self.state.lock();
        s.enter(DeviceOp::Release)?;
        let size = s.block(domain, address)?.bytes.len();
        s.blocks.remove(&address);
        if domain == MemoryDomain::Device {
            s.device_bytes -= size;
        }
        Ok(())
    }

    fn zero(&self, domain: MemoryDomain, address: Address, len: usize) -> Result<()> {
        let mut s = self.state.lock();
        let block = s.block_mut(domain, address)?;
        check_range(block.bytes.len(), 0, len, "zero")?;
        block.bytes[..len].fill(0);
        Ok(())
    }

    fn write(&self, domain: MemoryDomain, address: Address, offset: usize, data: &[u8]) -> Result<()> {
        let mut s = self.state.lock();
        let block = s.block_mut(domain, address)?;
        check_range(block.bytes.len(), offset, data.len(), "write")?;
        block.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, domain: MemoryDomain, address: Address, offset: usize, out: &mut [u8]) -> Result<()> {
        let s = self.state.lock();
        let block = s.block(domain, address)?;
        check_range(block.bytes.len(), offset, out.len(), "read")?;
        out.copy_from_slice(&block.bytes[offset..offset + out.len()]);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Renderer side
// ---------------------------------------------------------------------------

impl GraphicsApi for CpuDevice {
    fn create_buffer(&self) -> Result<BufferHandle> {
        let mut s = self.state.lock();
        s.enter(DeviceOp::CreateBuffer)?;
        let handle = BufferHandle::new(s.next_handle);
        s.next_handle += 1;
        s.buffers.insert(handle, GraphicsBuffer { storage: Vec::new(), registered: None });
        Ok(handle)
    }

    fn buffer_storage(&self, handle: BufferHandle, size: usize) -> Result<()> {
        let mut s = self.state.lock();
        s.enter(DeviceOp::BufferStorage)?;
        let buffer = s.buffer_mut(handle)?;
        if let Some(token) = buffer.registered {
            return Err(KernelError::registration(format!(
                "cannot respecify storage of {handle} while registered as {token}"
            )));
        }
        buffer.storage = zeroed_bytes(MemoryDomain::Device, size)?;
        Ok(())
    }

    fn write_buffer(&self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let mut s = self.state.lock();
        s.enter(DeviceOp::WriteBuffer)?;
        let buffer = s.buffer(handle)?;
        s.check_renderer_access(handle, buffer)?;
        check_range(buffer.storage.len(), offset, data.len(), "buffer write")?;
        let buffer = s.buffer_mut(handle)?;
        buffer.storage[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, handle: BufferHandle, offset: usize, out: &mut [u8]) -> Result<()> {
        let mut s = self.state.lock();
        s.enter(DeviceOp::ReadBuffer)?;
        let buffer = s.buffer(handle)?;
        s.check_renderer_access(handle, buffer)?;
        check_range(buffer.storage.len(), offset, out.len(), "buffer read")?;
        out.copy_from_slice(&buffer.storage[offset..offset + out.len()]);
        Ok(())
    }

    fn delete_buffer(&self, handle: BufferHandle) -> Result<()> {
        let mut s = self.state.lock();
        s.enter(DeviceOp::DeleteBuffer)?;
        if let Some(token) = s.buffer(handle)?.registered {
            return Err(KernelError::registration(format!(
                "cannot delete {handle} while registered as {token}"
            )));
        }
        s.buffers.remove(&handle);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Interop
// ---------------------------------------------------------------------------

impl InteropApi for CpuDevice {
    fn register_buffer(&self, handle: BufferHandle) -> Result<InteropToken> {
        let mut s = self.state.lock();
        s.enter(DeviceOp::Register)?;
        let token = InteropToken::new(s.next_token);
        let buffer = s.buffer_mut(handle)?;
        if let Some(existing) = buffer.registered {
            return Err(KernelError::registration(format!("{handle} is already registered as {existing}")));
        }
        if buffer.storage.is_empty() {
            return Err(KernelError::registration(format!("{handle} has no storage")));
        }
        buffer.registered = Some(token);
        s.next_token += 1;
        s.registrations.insert(token, Registration { handle, mapped_at: None });
        Ok(token)
    }

    fn unregister_buffer(&self, token: InteropToken) -> Result<()> {
        let mut s = self.state.lock();
        s.enter(DeviceOp::Unregister)?;
        let registration = s
            .registrations
            .get(&token)
            .ok_or_else(|| KernelError::registration(format!("unknown {token}")))?;
        if registration.mapped_at.is_some() {
            return Err(KernelError::registration(format!("{token} is still mapped")));
        }
        let handle = registration.handle;
        s.registrations.remove(&token);
        if let Some(buffer) = s.buffers.get_mut(&handle) {
            buffer.registered = None;
        }
        Ok(())
    }

    fn map_resource(&self, token: InteropToken) -> Result<MappedRange> {
        let mut s = self.state.lock();
        s.enter(DeviceOp::Map)?;
        let (handle, already) = match s.registrations.get(&token) {
            Some(r) => (r.handle, r.mapped_at.is_some()),
            None => return Err(KernelError::registration(format!("unknown {token}"))),
        };
        if already {
            return Err(KernelError::accelerator(format!("{token} is already mapped")));
        }
        let size = s.buffer(handle)?.storage.len();
        let address = s.fresh_address(size);
        if let Some(r) = s.registrations.get_mut(&token) {
            r.mapped_at = Some(address);
        }
        Ok(MappedRange { address, size })
    }

    fn unmap_resource(&self, token: InteropToken) -> Result<()> {
        let mut s = self.state.lock();
        s.enter(DeviceOp::Unmap)?;
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

impl ComputeKernels for CpuDevice {
    fn set_parameters(&self, params: &SimParams) -> Result<()> {
        let mut s = self.state.lock();
        s.enter(DeviceOp::SetParameters)?;
        params.validate()?;
        s.params = Some(*params);
        Ok(())
    }

    fn integrate(&self, positions: Address, velocities: Address, dt: f32, count: usize) -> Result<()> {
        let mut s = self.state.lock();
        s.submit(DeviceOp::Integrate)?;
        let params = s.params()?;
        let mut pos = s.load::<[f32; 4]>(positions, count)?;
        let mut vel = s.load::<[f32; 4]>(velocities, count)?;
        kernels::integrate(&params, &mut pos, &mut vel, dt);
        s.store(positions, &pos)?;
        s.store(velocities, &vel)
    }

    fn compute_hash(&self, grid_hash: Address, grid_index: Address, positions: Address, count: usize) -> Result<()> {
        let mut s = self.state.lock();
        s.submit(DeviceOp::ComputeHash)?;
        let params = s.params()?;
        let pos = s.load::<[f32; 4]>(positions, count)?;
        let mut hash = vec![0u32; count];
        let mut index = vec![0u32; count];
        kernels::compute_hash(&params, &pos, &mut hash, &mut index);
        s.store(grid_hash, &hash)?;
        s.store(grid_index, &index)
    }

    fn sort_by_key(&self, grid_hash: Address, grid_index: Address, count: usize) -> Result<()> {
        let mut s = self.state.lock();
        s.submit(DeviceOp::SortByKey)?;
        let mut hash = s.load::<u32>(grid_hash, count)?;
        let mut index = s.load::<u32>(grid_index, count)?;
        kernels::sort_by_key(&mut hash, &mut index);
        s.store(grid_hash, &hash)?;
        s.store(grid_index, &index)
    }

    fn find_cell_bounds(
        &self,
        cell_start: Address,
        cell_end: Address,
        grid_hash: Address,
        count: usize,
        num_cells: usize,
    ) -> Result<()> {
        let mut s = self.state.lock();
        s.submit(DeviceOp::FindCellBounds)?;
        let hash = s.load::<u32>(grid_hash, count)?;
        if let Some(&bad) = hash.iter().find(|&&h| h as usize >= num_cells) {
            return Err(KernelError::accelerator(format!("hash {bad} outside {num_cells} cells")));
        }
        let mut start = vec![0u32; num_cells];
        let mut end = vec![0u32; num_cells];
        kernels::find_cell_bounds(&hash, &mut start, &mut end);
        s.store(cell_start, &start)?;
        s.store(cell_end, &end)
    }

    fn collide(&self, args: &CollideArgs) -> Result<()> {
        let mut s = self.state.lock();
        s.submit(DeviceOp::Collide)?;
        let params = s.params()?;
        let num_cells = params.cell_count();
        let pos = s.load::<[f32; 4]>(args.positions, args.count)?;
        let vel = s.load::<[f32; 4]>(args.velocities, args.count)?;
        let index = s.load::<u32>(args.grid_index, args.count)?;
        let start = s.load::<u32>(args.cell_start, num_cells)?;
        let end = s.load::<u32>(args.cell_end, num_cells)?;
        let mut out = vec![[0.0f32; 4]; args.count];
        kernels::collide(&params, &pos, &vel, &index, &start, &end, &mut out);
        s.store(args.new_velocities, &out)
    }

    fn synchronize(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.enter(DeviceOp::Synchronize)?;
        s.pending = 0;
        Ok(())
    }
}
