//! wgpu buffer helpers: creation with error scopes, readback, uniforms.

use wgpu::util::DeviceExt;

use crate::error::{KernelError, Result};
use crate::memory::MemoryDomain;

/// Minimum buffer size (wgpu requires non-zero buffers).
const MIN_BUF_SIZE: u64 = 4;

/// Round a byte count up to the copy alignment.
pub(crate) fn align4(bytes: usize) -> u64 {
    (bytes as u64)
        .div_ceil(wgpu::COPY_BUFFER_ALIGNMENT)
        .saturating_mul(wgpu::COPY_BUFFER_ALIGNMENT)
        .max(MIN_BUF_SIZE)
}

/// Create a zero-initialised buffer of at least `bytes` bytes, reporting
/// out-of-memory as an allocation failure.
pub(crate) fn create_zeroed_buf(
    device: &wgpu::Device,
    label: &str,
    bytes: usize,
    usage: wgpu::BufferUsages,
) -> Result<wgpu::Buffer> {
    if align4(bytes) > device.limits().max_buffer_size {
        return Err(KernelError::AllocationFailure { domain: MemoryDomain::Device, size: bytes });
    }
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: align4(bytes),
        usage,
        mapped_at_creation: false,
    });
    let validation = pollster::block_on(device.pop_error_scope());
    let oom = pollster::block_on(device.pop_error_scope());

    if oom.is_some() {
        buffer.destroy();
        return Err(KernelError::AllocationFailure { domain: MemoryDomain::Device, size: bytes });
    }
    if let Some(err) = validation {
        buffer.destroy();
        return Err(KernelError::accelerator(format!("creating {label}: {err}")));
    }
    Ok(buffer)
}

/// Usage of device-domain allocations.
pub(crate) fn storage_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
}

/// Usage of renderer buffers: drawable and kernel-writable.
pub(crate) fn graphics_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::VERTEX | storage_usage()
}

/// Small uniform buffer holding `value`.
pub(crate) fn create_uniform<T: bytemuck::Pod>(device: &wgpu::Device, label: &str, value: &T) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::bytes_of(value),
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    })
}

/// Create a staging (MAP_READ) buffer for readback.
fn create_staging_buf(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size.max(MIN_BUF_SIZE),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Upload `data` at byte `offset`. Both must be 4-byte aligned.
pub(crate) fn write_bytes(queue: &wgpu::Queue, buffer: &wgpu::Buffer, offset: usize, data: &[u8]) -> Result<()> {
    if offset as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0 || data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
        return Err(KernelError::invalid_argument(format!(
            "unaligned upload of {} bytes at offset {offset}",
            data.len()
        )));
    }
    if offset as u64 + data.len() as u64 > buffer.size() {
        return Err(KernelError::invalid_argument(format!(
            "upload of {} bytes at offset {offset} exceeds {} bytes",
            data.len(),
            buffer.size()
        )));
    }
    if !data.is_empty() {
        queue.write_buffer(buffer, offset as u64, data);
    }
    Ok(())
}

/// Copy `out.len()` bytes starting at `offset` back to the host, blocking
/// until the copy completes.
pub(crate) fn read_bytes(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buffer: &wgpu::Buffer,
    offset: usize,
    out: &mut [u8],
) -> Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    let size = align4(out.len());
    if offset as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0 || offset as u64 + size > buffer.size() {
        return Err(KernelError::invalid_argument(format!(
            "readback of {} bytes at offset {offset} from a {}-byte buffer",
            out.len(),
            buffer.size()
        )));
    }

    let staging = create_staging_buf(device, "readback_staging", size);
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("readback"),
    });
    encoder.copy_buffer_to_buffer(buffer, offset as u64, &staging, 0, size);
    queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|_| KernelError::accelerator("readback callback dropped"))?
        .map_err(|e| KernelError::accelerator(format!("readback map failed: {e}")))?;

    let data = slice.get_mapped_range();
    out.copy_from_slice(&data[..out.len()]);
    drop(data);
    staging.unmap();
    Ok(())
}
