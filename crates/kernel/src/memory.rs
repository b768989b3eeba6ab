//! Host and device memory accounting.
//!
//! Every allocation made through a [`TrackingAllocator`] is recorded in a
//! [`MemoryLedger`] keyed by address and partitioned by [`MemoryDomain`].
//! The ledger keeps one byte counter per domain that always equals the sum of
//! the live records in that domain, and rejects frees of addresses it does not
//! know about (including double frees).
//!
//! There is one logical accountant per process ([`MemoryLedger::global`]),
//! created on first use and never torn down. The memory itself comes from an
//! explicit [`MemorySource`] (an accelerator runtime) handed to the allocator
//! at construction.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{KernelError, Result};

/// Memory domain an allocation lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MemoryDomain {
    /// Memory addressable from the controlling process (pinned staging memory).
    Host = 0,
    /// Memory owned by the accelerator.
    Device = 1,
}

impl MemoryDomain {
    /// Both domains, in tag order.
    pub const ALL: [MemoryDomain; 2] = [MemoryDomain::Host, MemoryDomain::Device];

    #[inline]
    fn slot(self) -> usize {
        self as usize
    }
}

impl TryFrom<u32> for MemoryDomain {
    type Error = KernelError;

    fn try_from(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(MemoryDomain::Host),
            1 => Ok(MemoryDomain::Device),
            other => Err(KernelError::UnknownDomain(other)),
        }
    }
}

impl fmt::Display for MemoryDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryDomain::Host => f.write_str("host"),
            MemoryDomain::Device => f.write_str("device"),
        }
    }
}

/// Address inside a memory domain. Zero is the null sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(u64);

impl Address {
    /// The null address. Never handed out by a memory source.
    pub const NULL: Address = Address(0);

    /// Wrap a raw address value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw address value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// `true` for [`Address::NULL`].
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012x}", self.0)
    }
}

/// Raw memory provider for both domains, implemented by accelerators.
pub trait MemorySource: Send + Sync {
    /// Reserve `size` bytes in `domain`. Returns a non-null address.
    fn reserve(&self, domain: MemoryDomain, size: usize) -> Result<Address>;

    /// Give a reservation back.
    fn release(&self, domain: MemoryDomain, address: Address) -> Result<()>;

    /// Zero `len` bytes starting at `address`.
    fn zero(&self, domain: MemoryDomain, address: Address, len: usize) -> Result<()>;

    /// Copy `data` into the reservation at byte `offset`.
    fn write(&self, domain: MemoryDomain, address: Address, offset: usize, data: &[u8]) -> Result<()>;

    /// Copy from the reservation at byte `offset` into `out`.
    fn read(&self, domain: MemoryDomain, address: Address, offset: usize, out: &mut [u8]) -> Result<()>;
}

/// One live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRecord {
    /// Start address.
    pub address: Address,
    /// Size in bytes, always non-zero.
    pub size: usize,
    /// Owning domain.
    pub domain: MemoryDomain,
}

#[derive(Default)]
struct RecordTable {
    live: [HashMap<Address, usize>; 2],
    bytes: [usize; 2],
}

/// Record table plus per-domain byte counters.
///
/// All mutation goes through [`TrackingAllocator`]; the table is guarded by a
/// single mutex since allocation is not a hot-path operation.
#[derive(Default)]
pub struct MemoryLedger {
    table: Mutex<RecordTable>,
}

impl MemoryLedger {
    /// Create an empty ledger, independent of the process-wide one.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide ledger, created on first use.
    pub fn global() -> Arc<MemoryLedger> {
        static LEDGER: OnceLock<Arc<MemoryLedger>> = OnceLock::new();
        Arc::clone(LEDGER.get_or_init(|| Arc::new(MemoryLedger::new())))
    }

    /// Bytes currently live in `domain`.
    pub fn usage(&self, domain: MemoryDomain) -> usize {
        self.table.lock().bytes[domain.slot()]
    }

    /// Bytes currently live for a raw domain tag; 0 for unknown tags.
    pub fn usage_by_tag(&self, tag: u32) -> usize {
        MemoryDomain::try_from(tag)
            .map(|domain| self.usage(domain))
            .unwrap_or(0)
    }

    /// Look up the live record at `address`, if any.
    pub fn record(&self, domain: MemoryDomain, address: Address) -> Option<MemoryRecord> {
        self.table.lock().live[domain.slot()]
            .get(&address)
            .map(|&size| MemoryRecord { address, size, domain })
    }

    /// All live records in `domain`, ordered by address.
    pub fn records(&self, domain: MemoryDomain) -> Vec<MemoryRecord> {
        let table = self.table.lock();
        let mut records: Vec<MemoryRecord> = table.live[domain.slot()]
            .iter()
            .map(|(&address, &size)| MemoryRecord { address, size, domain })
            .collect();
        records.sort_by_key(|r| r.address);
        records
    }

    /// Number of live allocations in `domain`.
    pub fn live_count(&self, domain: MemoryDomain) -> usize {
        self.table.lock().live[domain.slot()].len()
    }
}

impl fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("MemoryLedger")
            .field("host_bytes", &table.bytes[MemoryDomain::Host.slot()])
            .field("device_bytes", &table.bytes[MemoryDomain::Device.slot()])
            .field("host_records", &table.live[MemoryDomain::Host.slot()].len())
            .field("device_records", &table.live[MemoryDomain::Device.slot()].len())
            .finish()
    }
}

/// Allocator that records every reservation it makes in a [`MemoryLedger`].
///
/// Cloning is cheap and clones share both the memory source and the ledger.
#[derive(Clone)]
pub struct TrackingAllocator {
    source: Arc<dyn MemorySource>,
    ledger: Arc<MemoryLedger>,
}

impl TrackingAllocator {
    /// Allocator over `source`, accounted in the process-wide ledger.
    pub fn new(source: Arc<dyn MemorySource>) -> Self {
        Self::with_ledger(source, MemoryLedger::global())
    }

    /// Allocator over `source`, accounted in `ledger`.
    pub fn with_ledger(source: Arc<dyn MemorySource>, ledger: Arc<MemoryLedger>) -> Self {
        Self { source, ledger }
    }

    /// The ledger this allocator records into.
    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    /// The memory source backing this allocator.
    pub fn source(&self) -> &dyn MemorySource {
        self.source.as_ref()
    }

    /// Reserve `size` bytes in `domain` and record the allocation.
    ///
    /// Zero-sized requests fail with [`KernelError::AllocationFailure`].
    pub fn allocate(&self, size: usize, domain: MemoryDomain) -> Result<Address> {
        if size == 0 {
            return Err(KernelError::AllocationFailure { domain, size });
        }

        let mut table = self.ledger.table.lock();
        let address = self.source.reserve(domain, size)?;
        if address.is_null() {
            return Err(KernelError::AllocationFailure { domain, size });
        }
        if table.live[domain.slot()].contains_key(&address) {
            // The source handed out an address that is still live here.
            self.source.release(domain, address)?;
            return Err(KernelError::accelerator(format!(
                "{domain} source reused live address {address}"
            )));
        }

        table.live[domain.slot()].insert(address, size);
        table.bytes[domain.slot()] += size;
        tracing::debug!(%domain, %address, size, "allocated");
        Ok(address)
    }

    /// Release a tracked allocation and reset `pointer` to [`Address::NULL`].
    ///
    /// Null or untracked addresses (including already-freed ones) fail with
    /// [`KernelError::InvalidPointer`] and leave the counters untouched.
    pub fn free(&self, pointer: &mut Address, domain: MemoryDomain) -> Result<()> {
        let address = *pointer;
        let mut table = self.ledger.table.lock();
        let size = match table.live[domain.slot()].get(&address) {
            Some(&size) if !address.is_null() => size,
            _ => return Err(KernelError::InvalidPointer { address, domain }),
        };

        self.source.release(domain, address)?;

        table.live[domain.slot()].remove(&address);
        table.bytes[domain.slot()] -= size;
        *pointer = Address::NULL;
        tracing::debug!(%domain, %address, size, "freed");
        Ok(())
    }

    /// Bytes currently live in `domain` (ledger-wide).
    pub fn usage(&self, domain: MemoryDomain) -> usize {
        self.ledger.usage(domain)
    }
}

impl fmt::Debug for TrackingAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingAllocator")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

/// Byte length of `len` elements of `T`, or `AllocationFailure` on overflow.
pub(crate) fn byte_size<T>(domain: MemoryDomain, len: usize) -> Result<usize> {
    len.checked_mul(std::mem::size_of::<T>())
        .ok_or(KernelError::AllocationFailure { domain, size: usize::MAX })
}

/// Zeroed host-side backing store; a request the process cannot satisfy is an
/// `AllocationFailure` instead of an abort.
pub(crate) fn zeroed_bytes(domain: MemoryDomain, size: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(size)
        .map_err(|_| KernelError::AllocationFailure { domain, size })?;
    bytes.resize(size, 0);
    Ok(bytes)
}
