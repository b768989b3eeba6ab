//! Typed, tracked arrays that free themselves on drop.

use std::marker::PhantomData;

use bytemuck::Pod;

use crate::error::{KernelError, Result};
use crate::memory::{byte_size, Address, MemoryDomain, TrackingAllocator};

/// Fixed-length array of `T` allocated through a [`TrackingAllocator`].
///
/// Contents are zeroed at creation. Host and device arrays share this type;
/// transfers go through the allocator's memory source.
pub struct TrackedArray<T: Pod> {
    allocator: TrackingAllocator,
    domain: MemoryDomain,
    address: Address,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> TrackedArray<T> {
    /// Allocate `len` zeroed elements in `domain`.
    pub fn zeroed(allocator: &TrackingAllocator, domain: MemoryDomain, len: usize) -> Result<Self> {
        let bytes = byte_size::<T>(domain, len)?;
        let address = allocator.allocate(bytes, domain)?;
        let array = Self {
            allocator: allocator.clone(),
            domain,
            address,
            len,
            _marker: PhantomData,
        };
        allocator.source().zero(domain, address, bytes)?;
        Ok(array)
    }

    /// Start address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` when the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Overwrite the leading `data.len()` elements.
    pub fn write(&self, data: &[T]) -> Result<()> {
        if data.len() > self.len {
            return Err(KernelError::invalid_argument(format!(
                "{} elements do not fit in an array of {}",
                data.len(),
                self.len
            )));
        }
        self.allocator
            .source()
            .write(self.domain, self.address, 0, bytemuck::cast_slice(data))
    }

    /// Copy the whole array out.
    pub fn read(&self) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); self.len];
        self.allocator
            .source()
            .read(self.domain, self.address, 0, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    /// Free now, surfacing any error instead of logging it on drop.
    pub fn free(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.address.is_null() {
            return Ok(());
        }
        self.allocator.free(&mut self.address, self.domain)
    }
}

impl<T: Pod> Drop for TrackedArray<T> {
    fn drop(&mut self) {
        let address = self.address;
        if let Err(e) = self.release() {
            tracing::warn!(%address, domain = %self.domain, "failed to free tracked array: {e}");
        }
    }
}

impl<T: Pod> std::fmt::Debug for TrackedArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedArray")
            .field("domain", &self.domain)
            .field("address", &self.address)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cpu::CpuDevice;
    use crate::memory::{MemoryLedger, MemorySource};

    fn allocator() -> TrackingAllocator {
        let source: Arc<dyn MemorySource> = Arc::new(CpuDevice::new());
        TrackingAllocator::with_ledger(source, Arc::new(MemoryLedger::new()))
    }

    #[test]
    fn zeroed_then_written() {
        let alloc = allocator();
        let a = TrackedArray::<u32>::zeroed(&alloc, MemoryDomain::Device, 8).unwrap();
        assert_eq!(a.read().unwrap(), vec![0; 8]);
        a.write(&[1, 2, 3]).unwrap();
        assert_eq!(a.read().unwrap(), vec![1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(alloc.usage(MemoryDomain::Device), 32);
    }

    #[test]
    fn drop_releases() {
        let alloc = allocator();
        {
            let _a = TrackedArray::<[f32; 4]>::zeroed(&alloc, MemoryDomain::Host, 4).unwrap();
            assert_eq!(alloc.usage(MemoryDomain::Host), 64);
        }
        assert_eq!(alloc.usage(MemoryDomain::Host), 0);
    }

    #[test]
    fn oversized_write_rejected() {
        let alloc = allocator();
        let a = TrackedArray::<u32>::zeroed(&alloc, MemoryDomain::Device, 2).unwrap();
        assert!(matches!(a.write(&[1, 2, 3]), Err(KernelError::InvalidArgument(_))));
    }

    #[test]
    fn explicit_free() {
        let alloc = allocator();
        let a = TrackedArray::<u32>::zeroed(&alloc, MemoryDomain::Device, 2).unwrap();
        a.free().unwrap();
        assert_eq!(alloc.usage(MemoryDomain::Device), 0);
    }
}
