//! GPU vs CPU parity.
//!
//! Runs the same particle pipeline (integrate, hash, sort, cell bounds,
//! collide) through `CpuDevice` and `WgpuDevice` and compares the results.
//! Skipped when no adapter is available.

#![cfg(feature = "gpu")]

use std::sync::Arc;

use kernel::{
    gpu_available, Accelerator, CollideArgs, CpuDevice, GpuContext, InteropBuffer, MemoryDomain, MemoryLedger,
    SimParams, TrackedArray, WgpuDevice,
};

struct Output {
    positions: Vec<[f32; 4]>,
    velocities: Vec<[f32; 4]>,
    grid_hash: Vec<u32>,
    grid_index: Vec<u32>,
    cell_start: Vec<u32>,
    cell_end: Vec<u32>,
}

/// Particles at cell centres of a 16^3 grid, three per cell along x so the
/// collide kernel has real contacts.
fn scene(params: &SimParams) -> (Vec<[f32; 4]>, Vec<[f32; 4]>) {
    let r = params.particle_radius;
    let mut positions = Vec::new();
    let mut velocities = Vec::new();
    for z in 0..6 {
        for y in 0..6 {
            for x in 0..6 {
                let centre = [
                    params.grid_origin[0] + (x as f32 * 2.0 + 4.5) * params.cell_size[0],
                    params.grid_origin[1] + (y as f32 * 2.0 + 4.5) * params.cell_size[1],
                    params.grid_origin[2] + (z as f32 * 2.0 + 4.5) * params.cell_size[2],
                ];
                for k in -1..=1 {
                    positions.push([centre[0] + k as f32 * 1.5 * r, centre[1], centre[2], 1.0]);
                    velocities.push([0.01 * k as f32, 0.0, -0.01 * k as f32, 0.0]);
                }
            }
        }
    }
    (positions, velocities)
}

fn run<A: Accelerator + 'static>(device: Arc<A>, params: &SimParams) -> Output {
    let ctx = GpuContext::with_ledger(device, Arc::new(MemoryLedger::new()));
    let alloc = ctx.allocator();
    let (positions, velocities) = scene(params);
    let n = positions.len();
    let cells = params.cell_count();

    ctx.accelerator().set_parameters(params).expect("set_parameters");

    let mut pos = InteropBuffer::<[f32; 4]>::new(&ctx);
    pos.allocate(n).expect("allocate positions");
    pos.write(&positions).expect("upload positions");

    let vel = TrackedArray::<[f32; 4]>::zeroed(alloc, MemoryDomain::Device, n).expect("velocities");
    vel.write(&velocities).expect("upload velocities");
    let new_vel = TrackedArray::<[f32; 4]>::zeroed(alloc, MemoryDomain::Device, n).expect("scratch");
    let hash = TrackedArray::<u32>::zeroed(alloc, MemoryDomain::Device, n).expect("hash");
    let index = TrackedArray::<u32>::zeroed(alloc, MemoryDomain::Device, n).expect("index");
    let start = TrackedArray::<u32>::zeroed(alloc, MemoryDomain::Device, cells).expect("cell start");
    let end = TrackedArray::<u32>::zeroed(alloc, MemoryDomain::Device, cells).expect("cell end");

    let accel = ctx.accelerator();
    let p = pos.bind().expect("bind");
    accel.integrate(p, vel.address(), 0.5, n).expect("integrate");
    accel.compute_hash(hash.address(), index.address(), p, n).expect("hash");
    accel.sort_by_key(hash.address(), index.address(), n).expect("sort");
    accel
        .find_cell_bounds(start.address(), end.address(), hash.address(), n, cells)
        .expect("cell bounds");
    accel
        .collide(&CollideArgs {
            new_velocities: new_vel.address(),
            positions: p,
            velocities: vel.address(),
            grid_index: index.address(),
            cell_start: start.address(),
            cell_end: end.address(),
            count: n,
        })
        .expect("collide");
    pos.unbind().expect("unbind");
    accel.synchronize().expect("synchronize");

    Output {
        positions: pos.read().expect("read positions"),
        velocities: new_vel.read().expect("read velocities"),
        grid_hash: hash.read().expect("read hash"),
        grid_index: index.read().expect("read index"),
        cell_start: start.read().expect("read start"),
        cell_end: end.read().expect("read end"),
    }
}

fn max_abs_diff(a: &[[f32; 4]], b: &[[f32; 4]]) -> f32 {
    a.iter()
        .zip(b)
        .flat_map(|(x, y)| x.iter().zip(y).map(|(p, q)| (p - q).abs()))
        .fold(0.0, f32::max)
}

#[test]
fn gpu_matches_cpu_reference() {
    if !gpu_available() {
        eprintln!("SKIPPED: no GPU adapter available");
        return;
    }

    let params = SimParams::new([16, 16, 16]);
    let cpu = run(Arc::new(CpuDevice::new()), &params);
    let gpu = run(Arc::new(WgpuDevice::new().expect("wgpu device")), &params);

    assert_eq!(gpu.grid_hash, cpu.grid_hash, "sorted hashes differ");
    assert_eq!(gpu.grid_index, cpu.grid_index, "sorted indices differ");
    assert_eq!(gpu.cell_start, cpu.cell_start, "cell starts differ");
    assert_eq!(gpu.cell_end, cpu.cell_end, "cell ends differ");

    let pos_err = max_abs_diff(&gpu.positions, &cpu.positions);
    let vel_err = max_abs_diff(&gpu.velocities, &cpu.velocities);
    println!("max position error {pos_err:.3e}, max velocity error {vel_err:.3e}");
    assert!(pos_err < 1e-5, "positions diverge by {pos_err}");
    assert!(vel_err < 1e-5, "velocities diverge by {vel_err}");
}

#[test]
fn sort_handles_non_power_of_two_counts() {
    if !gpu_available() {
        eprintln!("SKIPPED: no GPU adapter available");
        return;
    }

    let device = Arc::new(WgpuDevice::new().expect("wgpu device"));
    let ctx = GpuContext::with_ledger(device, Arc::new(MemoryLedger::new()));
    let alloc = ctx.allocator();

    let keys: Vec<u32> = (0..1000u32).map(|i| (i * 7919) % 97).collect();
    let hash = TrackedArray::<u32>::zeroed(alloc, MemoryDomain::Device, keys.len()).expect("hash");
    let index = TrackedArray::<u32>::zeroed(alloc, MemoryDomain::Device, keys.len()).expect("index");
    hash.write(&keys).expect("upload keys");
    index.write(&(0..keys.len() as u32).collect::<Vec<_>>()).expect("upload index");

    ctx.accelerator()
        .sort_by_key(hash.address(), index.address(), keys.len())
        .expect("sort");
    ctx.accelerator().synchronize().expect("synchronize");

    let mut expected: Vec<(u32, u32)> = keys.iter().copied().zip(0..).collect();
    expected.sort_unstable();
    let sorted: Vec<(u32, u32)> = hash
        .read()
        .expect("read hash")
        .into_iter()
        .zip(index.read().expect("read index"))
        .collect();
    assert_eq!(sorted, expected);
}
