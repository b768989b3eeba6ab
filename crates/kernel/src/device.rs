//! Accelerator capability traits and the context object threaded through
//! every component.
//!
//! An accelerator is split along the two subsystems that share buffers:
//!
//! - [`GraphicsApi`]: the renderer's view (native buffer handles, uploads and
//!   readbacks of whole buffers).
//! - [`InteropApi`]: registration of a native buffer with the compute side and
//!   mapping it into the compute address space.
//! - [`ComputeKernels`]: parameter upload, the particle pipeline kernels and
//!   the end-of-step synchronization.
//!
//! plus the raw [`MemorySource`] used by the tracking allocator. Anything that
//! implements all four is an [`Accelerator`].

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::memory::{Address, MemoryLedger, MemorySource, TrackingAllocator};
use crate::params::SimParams;

/// Native graphics buffer identifier. Zero is "no buffer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BufferHandle(u32);

impl BufferHandle {
    /// The "no buffer" sentinel.
    pub const NONE: BufferHandle = BufferHandle(0);

    /// Wrap a raw handle value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw handle value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// `true` for [`BufferHandle::NONE`].
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Registration token binding a native buffer into the compute subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InteropToken(u64);

impl InteropToken {
    /// Wrap a raw token value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw token value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InteropToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource#{}", self.0)
    }
}

/// Device-visible view of a mapped interop resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    /// Device address of the first byte.
    pub address: Address,
    /// Mapped size in bytes.
    pub size: usize,
}

/// Renderer-side buffer operations.
pub trait GraphicsApi: Send + Sync {
    /// Create a buffer name with no storage attached.
    fn create_buffer(&self) -> Result<BufferHandle>;

    /// Attach `size` bytes of zeroed storage, replacing any previous storage.
    fn buffer_storage(&self, handle: BufferHandle, size: usize) -> Result<()>;

    /// Upload `data` at byte `offset`.
    fn write_buffer(&self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<()>;

    /// Read back into `out` from byte `offset`.
    fn read_buffer(&self, handle: BufferHandle, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Destroy the buffer and its storage.
    fn delete_buffer(&self, handle: BufferHandle) -> Result<()>;
}

/// Compute-side registration and mapping of renderer buffers.
pub trait InteropApi: Send + Sync {
    /// Register `handle` for compute access.
    fn register_buffer(&self, handle: BufferHandle) -> Result<InteropToken>;

    /// Drop a registration. Fails while the resource is mapped.
    fn unregister_buffer(&self, token: InteropToken) -> Result<()>;

    /// Map the resource into the compute address space.
    fn map_resource(&self, token: InteropToken) -> Result<MappedRange>;

    /// Unmap the resource, invalidating the mapped address.
    fn unmap_resource(&self, token: InteropToken) -> Result<()>;
}

/// Arguments of the collision kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollideArgs {
    /// Output velocities (`[f32; 4]` per particle).
    pub new_velocities: Address,
    /// Positions (`[f32; 4]` per particle).
    pub positions: Address,
    /// Velocities read by the kernel (`[f32; 4]` per particle).
    pub velocities: Address,
    /// Sorted original indices (`u32` per particle).
    pub grid_index: Address,
    /// First sorted slot per cell (`u32` per cell).
    pub cell_start: Address,
    /// One past the last sorted slot per cell (`u32` per cell).
    pub cell_end: Address,
    /// Number of particles.
    pub count: usize,
}

/// Particle pipeline kernels.
///
/// Kernel calls are submitted to an in-order queue and may return before the
/// work has run; [`ComputeKernels::synchronize`] blocks until everything
/// submitted so far is complete.
pub trait ComputeKernels: Send + Sync {
    /// Upload simulation parameters to accelerator constant storage.
    fn set_parameters(&self, params: &SimParams) -> Result<()>;

    /// Advance positions and velocities by `dt`.
    fn integrate(&self, positions: Address, velocities: Address, dt: f32, count: usize) -> Result<()>;

    /// Fill per-particle cell hash and identity index.
    fn compute_hash(&self, grid_hash: Address, grid_index: Address, positions: Address, count: usize) -> Result<()>;

    /// Sort `(hash, index)` pairs ascending by hash, ties by index.
    fn sort_by_key(&self, grid_hash: Address, grid_index: Address, count: usize) -> Result<()>;

    /// Derive per-cell start/end offsets from the sorted hash array.
    fn find_cell_bounds(
        &self,
        cell_start: Address,
        cell_end: Address,
        grid_hash: Address,
        count: usize,
        num_cells: usize,
    ) -> Result<()>;

    /// Resolve particle collisions into `args.new_velocities`.
    fn collide(&self, args: &CollideArgs) -> Result<()>;

    /// Block until all submitted work has completed.
    fn synchronize(&self) -> Result<()>;
}

/// A complete accelerator: memory, graphics, interop and kernels.
pub trait Accelerator: MemorySource + GraphicsApi + InteropApi + ComputeKernels {}

impl<T> Accelerator for T where T: MemorySource + GraphicsApi + InteropApi + ComputeKernels {}

/// Capability object handed to every component instead of ambient GPU state.
///
/// Bundles the accelerator with the [`TrackingAllocator`] bound to it. Clones
/// share both.
#[derive(Clone)]
pub struct GpuContext {
    accelerator: Arc<dyn Accelerator>,
    allocator: TrackingAllocator,
}

impl GpuContext {
    /// Context over `accelerator`, accounted in the process-wide ledger.
    pub fn new<A: Accelerator + 'static>(accelerator: Arc<A>) -> Self {
        Self::with_ledger(accelerator, MemoryLedger::global())
    }

    /// Context over `accelerator`, accounted in `ledger`.
    pub fn with_ledger<A: Accelerator + 'static>(accelerator: Arc<A>, ledger: Arc<MemoryLedger>) -> Self {
        let source: Arc<dyn MemorySource> = accelerator.clone();
        let accelerator: Arc<dyn Accelerator> = accelerator;
        Self {
            accelerator,
            allocator: TrackingAllocator::with_ledger(source, ledger),
        }
    }

    /// The accelerator.
    pub fn accelerator(&self) -> &dyn Accelerator {
        self.accelerator.as_ref()
    }

    /// The allocator bound to this accelerator.
    pub fn allocator(&self) -> &TrackingAllocator {
        &self.allocator
    }
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}
