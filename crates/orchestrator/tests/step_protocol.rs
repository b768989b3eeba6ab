//! End-to-end lifecycle and step protocol of `ParticleSystem` on the CPU
//! reference accelerator.
//!
//! The accelerator's call log is the observable: it shows the order in which
//! the position buffer is mapped, the kernels are issued, and the buffer is
//! handed back to the renderer.

use std::sync::Arc;

use kernel::{BufferState, CpuDevice, DeviceOp, GpuContext, KernelError, MemoryDomain, MemoryLedger, EMPTY_CELL};
use orchestrator::{InitialLayout, ParamOverrides, ParticleSystem, SceneConfig};

fn setup() -> (Arc<CpuDevice>, GpuContext) {
    let device = Arc::new(CpuDevice::new());
    let ctx = GpuContext::with_ledger(Arc::clone(&device), Arc::new(MemoryLedger::new()));
    (device, ctx)
}

fn jittered_scene(count: usize) -> SceneConfig {
    SceneConfig {
        name: "jittered".to_string(),
        particle_count: count,
        grid_size: [16, 16, 16],
        params: ParamOverrides::default(),
        layout: InitialLayout::Grid { spacing: None, jitter: 0.4, seed: 11 },
        timestep: 0.5,
        steps: 3,
    }
}

const STEP_CALLS: [DeviceOp; 8] = [
    DeviceOp::Map,
    DeviceOp::Integrate,
    DeviceOp::ComputeHash,
    DeviceOp::SortByKey,
    DeviceOp::FindCellBounds,
    DeviceOp::Collide,
    DeviceOp::Unmap,
    DeviceOp::Synchronize,
];

#[test]
fn construction_allocates_seven_device_arrays() {
    let (device, ctx) = setup();
    let alloc = ctx.allocator().clone();

    {
        let system = ParticleSystem::new(&ctx, 1024, [8, 8, 8]).expect("construct");

        // 3 x vec4 per particle + 2 x u32 per particle + 2 x u32 per cell.
        let expected = 3 * 1024 * 16 + 2 * 1024 * 4 + 2 * 512 * 4;
        assert_eq!(expected, 61440);
        assert_eq!(alloc.usage(MemoryDomain::Device), expected);
        assert_eq!(alloc.ledger().live_count(MemoryDomain::Device), 7);

        // Host mirrors for positions and velocities.
        assert_eq!(alloc.usage(MemoryDomain::Host), 2 * 1024 * 16);

        // One renderer buffer sized for the positions, registered, not mapped.
        assert_eq!(device.buffer_count(), 1);
        assert_eq!(device.registration_count(), 1);
        assert_eq!(device.mapped_count(), 0);
        assert_eq!(system.positions_state(), BufferState::Registered);
        assert_eq!(system.positions().expect("positions").len(), 1024);
    }

    assert_eq!(alloc.usage(MemoryDomain::Device), 0);
    assert_eq!(alloc.usage(MemoryDomain::Host), 0);
    assert_eq!(device.buffer_count(), 0);
    assert_eq!(device.registration_count(), 0);
}

#[test]
fn teardown_unregisters_before_deleting() {
    let (device, ctx) = setup();
    let system = ParticleSystem::new(&ctx, 64, [8, 8, 8]).expect("construct");
    device.clear_calls();

    drop(system);
    assert_eq!(device.calls(), vec![DeviceOp::Unregister, DeviceOp::DeleteBuffer]);
}

#[test]
fn failed_construction_leaves_nothing_behind() {
    for op in [
        DeviceOp::CreateBuffer,
        DeviceOp::BufferStorage,
        DeviceOp::Register,
        DeviceOp::SetParameters,
    ] {
        let (device, ctx) = setup();
        device.fail_next(op);

        let result = ParticleSystem::new(&ctx, 256, [8, 8, 8]);
        assert!(result.is_err(), "construction should fail when {op:?} fails");
        assert_eq!(ctx.allocator().usage(MemoryDomain::Device), 0, "{op:?}");
        assert_eq!(ctx.allocator().usage(MemoryDomain::Host), 0, "{op:?}");
        assert_eq!(device.buffer_count(), 0, "{op:?}");
        assert_eq!(device.registration_count(), 0, "{op:?}");
    }
}

#[test]
fn out_of_device_memory_is_fatal_at_construction() {
    let device = Arc::new(CpuDevice::with_device_memory_limit(32 * 1024));
    let ctx = GpuContext::with_ledger(Arc::clone(&device), Arc::new(MemoryLedger::new()));

    let err = ParticleSystem::new(&ctx, 1024, [8, 8, 8]).expect_err("too little device memory");
    assert!(matches!(err, KernelError::AllocationFailure { domain: MemoryDomain::Device, .. }));
    assert_eq!(ctx.allocator().usage(MemoryDomain::Device), 0);
    assert_eq!(device.device_bytes(), 0);
}

#[test]
fn oversized_particle_count_is_an_allocation_error() {
    for count in [usize::MAX / 8, usize::MAX / 32] {
        let (device, ctx) = setup();

        let err = ParticleSystem::new(&ctx, count, [8, 8, 8]).expect_err("count cannot fit in memory");
        assert!(matches!(err, KernelError::AllocationFailure { .. }), "{count}: {err}");
        assert_eq!(ctx.allocator().usage(MemoryDomain::Host), 0);
        assert_eq!(ctx.allocator().usage(MemoryDomain::Device), 0);
        assert_eq!(device.buffer_count(), 0);
    }
}

#[test]
fn update_follows_the_step_protocol() {
    let (device, ctx) = setup();
    let mut system = ParticleSystem::new(&ctx, 128, [8, 8, 8]).expect("construct");
    device.clear_calls();

    system.update(0.5).expect("update");

    assert_eq!(device.calls(), STEP_CALLS.to_vec());
    assert_eq!(system.positions_state(), BufferState::Registered);
    assert_eq!(device.pending_work(), 0, "update must not return before the queue drains");
    assert_eq!(system.steps(), 1);
    assert!(system.positions_handle().is_ok());
}

#[test]
fn stage_failure_unmaps_and_skips_synchronize() {
    for op in [
        DeviceOp::Integrate,
        DeviceOp::ComputeHash,
        DeviceOp::SortByKey,
        DeviceOp::FindCellBounds,
        DeviceOp::Collide,
    ] {
        let (device, ctx) = setup();
        let mut system = ParticleSystem::new(&ctx, 128, [8, 8, 8]).expect("construct");
        device.clear_calls();
        device.fail_next(op);

        let err = system.update(0.5).expect_err("stage failure should propagate");
        assert!(matches!(err, KernelError::AcceleratorFailure(_)), "{op:?}: {err}");
        assert_eq!(system.positions_state(), BufferState::Registered, "{op:?}");
        assert_eq!(device.mapped_count(), 0, "{op:?}");

        let calls = device.calls();
        assert_eq!(calls.last(), Some(&DeviceOp::Unmap), "{op:?}: {calls:?}");
        assert!(!calls.contains(&DeviceOp::Synchronize), "{op:?}");
        assert_eq!(system.steps(), 0);

        // The caller decides whether to go on; the system itself is intact.
        system.update(0.5).expect("next update");
        assert_eq!(system.steps(), 1);
    }
}

#[test]
fn map_and_synchronize_failures_leave_buffer_registered() {
    let (device, ctx) = setup();
    let mut system = ParticleSystem::new(&ctx, 32, [8, 8, 8]).expect("construct");

    device.fail_next(DeviceOp::Map);
    assert!(system.update(0.5).is_err());
    assert_eq!(system.positions_state(), BufferState::Registered);

    device.fail_next(DeviceOp::Synchronize);
    assert!(matches!(system.update(0.5), Err(KernelError::AcceleratorFailure(_))));
    assert_eq!(system.positions_state(), BufferState::Registered);
    assert_eq!(system.steps(), 0);
}

#[test]
fn identical_inputs_give_identical_sorted_arrays() {
    let scene = jittered_scene(2000);
    let run = || {
        let (_device, ctx) = setup();
        let mut system = scene.build(&ctx).expect("build");
        for _ in 0..scene.steps {
            system.update(scene.timestep).expect("update");
        }
        (
            system.grid_hash().expect("hash"),
            system.grid_index().expect("index"),
            system.positions().expect("positions"),
        )
    };

    let (hash_a, index_a, pos_a) = run();
    let (hash_b, index_b, pos_b) = run();
    assert_eq!(hash_a, hash_b);
    assert_eq!(index_a, index_b);
    let bits = |v: &[[f32; 4]]| v.iter().flatten().map(|f| f.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&pos_a), bits(&pos_b));
}

#[test]
fn sorted_arrays_and_cell_bounds_are_consistent() {
    let scene = jittered_scene(500);
    let (_device, ctx) = setup();
    let mut system = scene.build(&ctx).expect("build");
    system.update(scene.timestep).expect("update");

    let hash = system.grid_hash().expect("hash");
    let index = system.grid_index().expect("index");
    for w in hash.iter().zip(&index).collect::<Vec<_>>().windows(2) {
        assert!(w[0] < w[1], "pairs not strictly ascending: {:?} then {:?}", w[0], w[1]);
    }

    let mut seen = index.clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..500).collect::<Vec<u32>>(), "index must be a permutation");

    let (start, end) = system.cell_bounds().expect("bounds");
    let mut covered = 0;
    for cell in 0..start.len() {
        if start[cell] == EMPTY_CELL {
            assert_eq!(end[cell], EMPTY_CELL);
            continue;
        }
        for slot in start[cell]..end[cell] {
            assert_eq!(hash[slot as usize], cell as u32);
        }
        covered += end[cell] - start[cell];
    }
    assert_eq!(covered, 500);
}

#[test]
fn gravity_pulls_particles_down() {
    let (_device, ctx) = setup();
    let mut system = ParticleSystem::new(&ctx, 1, [64, 64, 64]).expect("construct");
    system.set_positions(&[[0.0, 0.5, 0.0, 1.0]]).expect("positions");

    system.update(0.5).expect("update");

    let p = system.positions().expect("positions")[0];
    let v = system.velocities().expect("velocities")[0];
    assert!(p[1] < 0.5);
    assert!(v[1] < 0.0);
    assert_eq!([p[0], p[2], p[3]], [0.0, 0.0, 1.0]);
}
