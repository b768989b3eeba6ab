//! Buffers shared between the renderer and the compute kernels.
//!
//! An [`InteropBuffer`] owns one native graphics buffer that is also
//! registered with the compute subsystem. The two sides must never touch it
//! at the same time, so access is gated by an explicit state:
//!
//! ```text
//!               allocate(n)              bind()
//! Unallocated ─────────────► Registered ───────► Mapped
//!      ▲                         ▲   ◄───────────  │
//!      │          free()         │     unbind()    │
//!      └─────────────────────────┴─────────────────┘
//! ```
//!
//! The renderer may use [`InteropBuffer::handle`] (and [`InteropBuffer::write`]
//! / [`InteropBuffer::read`]) only while `Registered`; kernels may use the
//! address returned by [`InteropBuffer::bind`] only while `Mapped`.

use std::fmt;
use std::marker::PhantomData;

use bytemuck::Pod;

use crate::device::{BufferHandle, GpuContext, InteropToken, MappedRange};
use crate::error::{KernelError, Result};
use crate::memory::{byte_size, Address, MemoryDomain};

/// Sharing state of an [`InteropBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// No native buffer exists.
    Unallocated,
    /// Native buffer exists and is registered; the renderer owns it.
    Registered,
    /// Mapped into the compute address space; kernels own it.
    Mapped,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferState::Unallocated => f.write_str("unallocated"),
            BufferState::Registered => f.write_str("registered"),
            BufferState::Mapped => f.write_str("mapped"),
        }
    }
}

// The token only exists while registered, the range only while mapped.
#[derive(Debug, Clone, Copy)]
enum Binding {
    Unallocated,
    Registered { token: InteropToken },
    Mapped { token: InteropToken, range: MappedRange },
}

impl Binding {
    fn state(&self) -> BufferState {
        match self {
            Binding::Unallocated => BufferState::Unallocated,
            Binding::Registered { .. } => BufferState::Registered,
            Binding::Mapped { .. } => BufferState::Mapped,
        }
    }

    fn token(&self) -> Option<InteropToken> {
        match *self {
            Binding::Unallocated => None,
            Binding::Registered { token } | Binding::Mapped { token, .. } => Some(token),
        }
    }
}

/// A renderer buffer of `T` elements, registered for compute access.
pub struct InteropBuffer<T: Pod> {
    ctx: GpuContext,
    handle: BufferHandle,
    capacity: usize,
    binding: Binding,
    _marker: PhantomData<T>,
}

impl<T: Pod> InteropBuffer<T> {
    /// An unallocated buffer bound to `ctx`.
    pub fn new(ctx: &GpuContext) -> Self {
        Self {
            ctx: ctx.clone(),
            handle: BufferHandle::NONE,
            capacity: 0,
            binding: Binding::Unallocated,
            _marker: PhantomData,
        }
    }

    /// Current sharing state.
    pub fn state(&self) -> BufferState {
        self.binding.state()
    }

    /// Element count backing the buffer (0 while unallocated).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Device address of the buffer; `Some` iff the buffer is mapped.
    pub fn mapped_pointer(&self) -> Option<Address> {
        match self.binding {
            Binding::Mapped { range, .. } => Some(range.address),
            _ => None,
        }
    }

    /// Registration token; `Some` iff registered or mapped.
    pub fn interop_token(&self) -> Option<InteropToken> {
        self.binding.token()
    }

    /// Native handle for the renderer.
    ///
    /// [`BufferHandle::NONE`] once the native buffer is deleted. Fails while
    /// mapped, since the renderer must not touch the buffer while kernels own it.
    pub fn handle(&self) -> Result<BufferHandle> {
        match self.binding {
            Binding::Mapped { .. } => Err(KernelError::InvalidState {
                operation: "hand the native buffer to the renderer",
                state: BufferState::Mapped,
            }),
            _ => Ok(self.handle),
        }
    }

    /// Size the buffer to `capacity` elements and register it.
    ///
    /// Re-allocating with the current capacity is a no-op that keeps the
    /// native handle. Any other capacity frees the current buffer first.
    pub fn allocate(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(KernelError::ZeroCapacity);
        }
        let bytes = byte_size::<T>(MemoryDomain::Device, capacity)?;
        if self.state() != BufferState::Unallocated && capacity == self.capacity {
            return Ok(());
        }
        // A half-freed buffer still holds its native handle.
        if self.state() != BufferState::Unallocated || !self.handle.is_none() {
            self.free()?;
        }

        let accel = self.ctx.accelerator();
        let handle = accel.create_buffer()?;
        let registered = accel
            .buffer_storage(handle, bytes)
            .and_then(|()| accel.register_buffer(handle));
        let token = match registered {
            Ok(token) => token,
            Err(e) => {
                if let Err(cleanup) = accel.delete_buffer(handle) {
                    tracing::warn!(%handle, "failed to delete half-built buffer: {cleanup}");
                }
                return Err(e);
            }
        };

        self.handle = handle;
        self.capacity = capacity;
        self.binding = Binding::Registered { token };
        tracing::debug!(%handle, %token, capacity, bytes, "interop buffer registered");
        Ok(())
    }

    /// Map the buffer for kernel access and return its device address.
    ///
    /// Binding an already-mapped buffer returns the same address.
    pub fn bind(&mut self) -> Result<Address> {
        match self.binding {
            Binding::Unallocated => Err(KernelError::InvalidState {
                operation: "bind",
                state: BufferState::Unallocated,
            }),
            Binding::Mapped { range, .. } => Ok(range.address),
            Binding::Registered { token } => {
                let range = self.ctx.accelerator().map_resource(token)?;
                if range.address.is_null() {
                    // Leave the resource unmapped rather than hand out null.
                    self.ctx.accelerator().unmap_resource(token)?;
                    return Err(KernelError::accelerator(format!("{token} mapped to a null address")));
                }
                self.binding = Binding::Mapped { token, range };
                tracing::trace!(%token, address = %range.address, "mapped");
                Ok(range.address)
            }
        }
    }

    /// Give the buffer back to the renderer. No-op unless mapped.
    pub fn unbind(&mut self) -> Result<()> {
        if let Binding::Mapped { token, .. } = self.binding {
            self.ctx.accelerator().unmap_resource(token)?;
            self.binding = Binding::Registered { token };
            tracing::trace!(%token, "unmapped");
        }
        Ok(())
    }

    /// Unmap, unregister and delete the native buffer.
    ///
    /// Stops at the first step that fails and keeps whatever it could not
    /// release, so calling `free` again retries the rest.
    pub fn free(&mut self) -> Result<()> {
        let accel = self.ctx.accelerator();

        if let Binding::Mapped { token, .. } = self.binding {
            accel.unmap_resource(token)?;
            self.binding = Binding::Registered { token };
        }
        if let Binding::Registered { token } = self.binding {
            accel.unregister_buffer(token)?;
            self.binding = Binding::Unallocated;
        }
        if !self.handle.is_none() {
            accel.delete_buffer(self.handle)?;
            tracing::debug!(handle = %self.handle, "interop buffer freed");
            self.handle = BufferHandle::NONE;
        }

        self.capacity = 0;
        Ok(())
    }

    /// Upload `data` through the renderer path. Only legal while registered.
    pub fn write(&self, data: &[T]) -> Result<()> {
        self.require_registered("write through the renderer")?;
        if data.len() > self.capacity {
            return Err(KernelError::invalid_argument(format!(
                "{} elements do not fit in a buffer of {}",
                data.len(),
                self.capacity
            )));
        }
        self.ctx
            .accelerator()
            .write_buffer(self.handle, 0, bytemuck::cast_slice(data))
    }

    /// Read the whole buffer through the renderer path. Only legal while
    /// registered.
    pub fn read(&self) -> Result<Vec<T>> {
        self.require_registered("read through the renderer")?;
        let mut out = vec![T::zeroed(); self.capacity];
        self.ctx
            .accelerator()
            .read_buffer(self.handle, 0, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    fn require_registered(&self, operation: &'static str) -> Result<()> {
        match self.state() {
            BufferState::Registered => Ok(()),
            state => Err(KernelError::InvalidState { operation, state }),
        }
    }
}

impl<T: Pod> Drop for InteropBuffer<T> {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            tracing::warn!("failed to release interop buffer: {e}");
        }
    }
}

impl<T: Pod> fmt::Debug for InteropBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteropBuffer")
            .field("handle", &self.handle)
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .field("mapped_pointer", &self.mapped_pointer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cpu::{CpuDevice, DeviceOp};
    use crate::memory::MemoryLedger;

    fn setup() -> (Arc<CpuDevice>, GpuContext) {
        let device = Arc::new(CpuDevice::new());
        let ctx = GpuContext::with_ledger(device.clone(), Arc::new(MemoryLedger::new()));
        (device, ctx)
    }

    #[test]
    fn starts_unallocated() {
        let (_device, ctx) = setup();
        let buf = InteropBuffer::<[f32; 4]>::new(&ctx);
        assert_eq!(buf.state(), BufferState::Unallocated);
        assert_eq!(buf.capacity(), 0);
        assert_eq!(buf.handle().unwrap(), BufferHandle::NONE);
        assert!(buf.mapped_pointer().is_none());
        assert!(buf.interop_token().is_none());
    }

    #[test]
    fn allocate_registers() {
        let (device, ctx) = setup();
        let mut buf = InteropBuffer::<[f32; 4]>::new(&ctx);
        buf.allocate(16).unwrap();
        assert_eq!(buf.state(), BufferState::Registered);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.read().unwrap().len(), 16);
        assert!(!buf.handle().unwrap().is_none());
        assert_eq!(device.registration_count(), 1);
    }

    #[test]
    fn zero_capacity_rejected() {
        let (_device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        assert_eq!(buf.allocate(0), Err(KernelError::ZeroCapacity));
        assert_eq!(buf.state(), BufferState::Unallocated);
    }

    #[test]
    fn same_capacity_keeps_handle() {
        let (device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        buf.allocate(8).unwrap();
        let handle = buf.handle().unwrap();
        let token = buf.interop_token();
        device.clear_calls();

        buf.allocate(8).unwrap();
        assert_eq!(buf.handle().unwrap(), handle);
        assert_eq!(buf.interop_token(), token);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn resize_replaces_buffer() {
        let (device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        buf.allocate(8).unwrap();
        buf.bind().unwrap();
        device.clear_calls();

        buf.allocate(32).unwrap();
        assert_eq!(buf.state(), BufferState::Registered);
        assert_eq!(buf.capacity(), 32);
        assert_eq!(
            device.calls(),
            vec![
                DeviceOp::Unmap,
                DeviceOp::Unregister,
                DeviceOp::DeleteBuffer,
                DeviceOp::CreateBuffer,
                DeviceOp::BufferStorage,
                DeviceOp::Register,
            ]
        );
        assert_eq!(device.buffer_count(), 1);
    }

    #[test]
    fn bind_is_idempotent() {
        let (device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        buf.allocate(4).unwrap();
        let first = buf.bind().unwrap();
        let second = buf.bind().unwrap();
        assert_eq!(first, second);
        assert_eq!(buf.mapped_pointer(), Some(first));
        assert_eq!(
            device.calls().iter().filter(|&&op| op == DeviceOp::Map).count(),
            1
        );
    }

    #[test]
    fn unbind_returns_to_registered() {
        let (_device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        buf.allocate(4).unwrap();
        buf.unbind().unwrap();
        assert_eq!(buf.state(), BufferState::Registered);
        buf.bind().unwrap();
        buf.unbind().unwrap();
        assert_eq!(buf.state(), BufferState::Registered);
        assert!(buf.mapped_pointer().is_none());
    }

    #[test]
    fn bind_unallocated_fails() {
        let (_device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        assert_eq!(
            buf.bind(),
            Err(KernelError::InvalidState { operation: "bind", state: BufferState::Unallocated })
        );
    }

    #[test]
    fn renderer_access_blocked_while_mapped() {
        let (_device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        buf.allocate(4).unwrap();
        buf.write(&[1, 2, 3, 4]).unwrap();
        buf.bind().unwrap();

        assert!(matches!(buf.handle(), Err(KernelError::InvalidState { .. })));
        assert!(matches!(buf.read(), Err(KernelError::InvalidState { .. })));
        assert!(matches!(buf.write(&[0]), Err(KernelError::InvalidState { .. })));

        buf.unbind().unwrap();
        assert_eq!(buf.read().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn free_releases_in_order() {
        let (device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        buf.allocate(4).unwrap();
        buf.bind().unwrap();
        device.clear_calls();

        buf.free().unwrap();
        assert_eq!(buf.state(), BufferState::Unallocated);
        assert_eq!(buf.capacity(), 0);
        assert_eq!(
            device.calls(),
            vec![DeviceOp::Unmap, DeviceOp::Unregister, DeviceOp::DeleteBuffer]
        );
        assert_eq!(device.buffer_count(), 0);
        assert_eq!(device.registration_count(), 0);

        // Freeing twice is harmless.
        buf.free().unwrap();
    }

    #[test]
    fn failed_teardown_step_keeps_what_it_could_not_release() {
        let (device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        buf.allocate(4).unwrap();
        buf.bind().unwrap();
        let handle = buf.handle;

        device.fail_next(DeviceOp::Unmap);
        assert!(buf.free().is_err());
        assert_eq!(buf.state(), BufferState::Mapped);
        assert_eq!(device.mapped_count(), 1);

        device.fail_next(DeviceOp::Unregister);
        assert!(buf.free().is_err());
        assert_eq!(buf.state(), BufferState::Registered);
        assert_eq!(buf.handle().unwrap(), handle);
        assert_eq!(device.registration_count(), 1);

        device.fail_next(DeviceOp::DeleteBuffer);
        assert!(buf.free().is_err());
        assert_eq!(buf.state(), BufferState::Unallocated);
        assert_eq!(device.registration_count(), 0);
        assert_eq!(device.buffer_count(), 1);

        buf.free().unwrap();
        assert_eq!(device.buffer_count(), 0);
        assert_eq!(buf.handle().unwrap(), BufferHandle::NONE);
    }

    #[test]
    fn resize_after_failed_free_retries_teardown() {
        let (device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        buf.allocate(4).unwrap();

        device.fail_next(DeviceOp::Unregister);
        assert!(buf.allocate(8).is_err());
        assert_eq!(buf.state(), BufferState::Registered);
        assert_eq!(buf.capacity(), 4);

        buf.allocate(8).unwrap();
        assert_eq!(buf.capacity(), 8);
        assert_eq!(device.buffer_count(), 1);
        assert_eq!(device.registration_count(), 1);
    }

    #[test]
    fn capacity_overflow_is_an_allocation_error() {
        let (device, ctx) = setup();
        let mut buf = InteropBuffer::<[f32; 4]>::new(&ctx);
        let err = buf.allocate(usize::MAX / 8).unwrap_err();
        assert!(matches!(err, KernelError::AllocationFailure { domain: MemoryDomain::Device, .. }));
        assert_eq!(buf.state(), BufferState::Unallocated);
        assert_eq!(device.buffer_count(), 0);
    }

    #[test]
    fn drop_frees() {
        let (device, ctx) = setup();
        {
            let mut buf = InteropBuffer::<u32>::new(&ctx);
            buf.allocate(4).unwrap();
            buf.bind().unwrap();
        }
        assert_eq!(device.buffer_count(), 0);
        assert_eq!(device.registration_count(), 0);
    }

    #[test]
    fn failed_registration_leaves_nothing_behind() {
        let (device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        device.fail_next(DeviceOp::Register);
        let err = buf.allocate(4).unwrap_err();
        assert!(matches!(err, KernelError::ResourceRegistrationFailure(_)));
        assert_eq!(buf.state(), BufferState::Unallocated);
        assert_eq!(device.buffer_count(), 0);
    }

    #[test]
    fn failed_map_stays_registered() {
        let (device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        buf.allocate(4).unwrap();
        device.fail_next(DeviceOp::Map);
        assert!(buf.bind().is_err());
        assert_eq!(buf.state(), BufferState::Registered);
        assert!(buf.mapped_pointer().is_none());
    }

    #[test]
    fn pointer_present_iff_mapped() {
        let (_device, ctx) = setup();
        let mut buf = InteropBuffer::<u32>::new(&ctx);
        let check = |b: &InteropBuffer<u32>| {
            assert_eq!(b.mapped_pointer().is_some(), b.state() == BufferState::Mapped);
            assert_eq!(b.interop_token().is_some(), b.state() != BufferState::Unallocated);
        };
        check(&buf);
        buf.allocate(4).unwrap();
        check(&buf);
        buf.bind().unwrap();
        check(&buf);
        buf.allocate(4).unwrap();
        check(&buf);
        buf.allocate(5).unwrap();
        check(&buf);
        buf.bind().unwrap();
        check(&buf);
        buf.unbind().unwrap();
        check(&buf);
        buf.free().unwrap();
        check(&buf);
        let _ = buf.bind();
        check(&buf);
    }
}
