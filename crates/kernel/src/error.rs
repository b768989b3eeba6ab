//! Error type shared by the allocator, interop buffers and accelerators.

use thiserror::Error;

use crate::interop::BufferState;
use crate::memory::{Address, MemoryDomain};

/// Result type for kernel-crate operations.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors surfaced by memory tracking, buffer sharing and kernel dispatch.
///
/// Every error means "this object or this step did not complete": callers must
/// not render or keep simulating from the state that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The memory domain could not satisfy the request (out of memory, or a
    /// zero-sized request).
    #[error("failed to allocate {size} bytes of {domain} memory")]
    AllocationFailure {
        /// Domain the request was made in.
        domain: MemoryDomain,
        /// Requested size in bytes.
        size: usize,
    },

    /// A raw domain tag did not name `Host` or `Device`.
    #[error("unknown memory domain tag {0}")]
    UnknownDomain(u32),

    /// Null address, or an address not currently tracked in that domain.
    #[error("{address} is not a live {domain} allocation")]
    InvalidPointer {
        /// Offending address.
        address: Address,
        /// Domain the address was presented in.
        domain: MemoryDomain,
    },

    /// Registering, unregistering, mapping or deleting a shared buffer was
    /// rejected by the compute or rendering runtime.
    #[error("interop resource registration failed: {0}")]
    ResourceRegistrationFailure(String),

    /// Opaque failure from a kernel launch, transfer or synchronization.
    #[error("accelerator failure: {0}")]
    AcceleratorFailure(String),

    /// Operation is illegal in the buffer's current sharing state.
    #[error("cannot {operation} while buffer is {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the buffer was in.
        state: BufferState,
    },

    /// Interop buffers cannot be sized to zero elements.
    #[error("buffer capacity must be non-zero")]
    ZeroCapacity,

    /// Argument rejected before touching any resource.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl KernelError {
    /// Create an accelerator failure.
    pub fn accelerator(msg: impl Into<String>) -> Self {
        Self::AcceleratorFailure(msg.into())
    }

    /// Create a registration failure.
    pub fn registration(msg: impl Into<String>) -> Self {
        Self::ResourceRegistrationFailure(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
