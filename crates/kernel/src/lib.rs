//! Particle Kernel
//!
//! Memory tracking, renderer/compute buffer sharing and the particle pipeline
//! kernels that a simulation orchestrator drives each step.
//!
//! # Modules
//! - [`memory`] -- Host/device memory domains and the process-wide tracking allocator.
//! - [`device`] -- Accelerator capability traits and the [`GpuContext`] threaded through every component.
//! - [`array`] -- RAII device/host arrays allocated through the tracking allocator.
//! - [`interop`] -- Buffers shared between the renderer and the compute kernels.
//! - [`params`] -- Simulation parameters, laid out for a GPU uniform.
//! - [`grid`] -- Uniform-grid cell addressing.
//! - [`cpu`] -- In-process reference accelerator.
//! - `gpu` -- wgpu accelerator (feature `gpu`).

#![warn(missing_docs)]

pub mod array;
pub mod cpu;
pub mod device;
pub mod error;
pub mod grid;
pub mod interop;
pub mod memory;
pub mod params;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use array::TrackedArray;
pub use cpu::{CpuDevice, DeviceOp};
pub use device::{
    Accelerator, BufferHandle, CollideArgs, ComputeKernels, GpuContext, GraphicsApi, InteropApi, InteropToken,
    MappedRange,
};
pub use error::{KernelError, Result};
pub use grid::{UniformGrid, EMPTY_CELL};
pub use interop::{BufferState, InteropBuffer};
pub use memory::{Address, MemoryDomain, MemoryLedger, MemoryRecord, MemorySource, TrackingAllocator};
pub use params::{SimParams, DEFAULT_PARTICLE_RADIUS};

#[cfg(feature = "gpu")]
pub use gpu::{gpu_available, WgpuDevice};
