//! The shipped scene files load, build and run.

use std::sync::Arc;

use kernel::{CpuDevice, GpuContext, MemoryLedger};
use orchestrator::{create_system, SceneConfig};

fn scene_path(name: &str) -> String {
    format!("{}/../../configs/{}", env!("CARGO_MANIFEST_DIR"), name)
}

fn context() -> GpuContext {
    GpuContext::with_ledger(Arc::new(CpuDevice::new()), Arc::new(MemoryLedger::new()))
}

#[test]
fn all_scenes_validate() {
    for name in ["dam-drop.json", "settle-small.json", "two-spheres.json"] {
        let scene = SceneConfig::load(&scene_path(name)).unwrap_or_else(|e| panic!("{name}: {e}"));
        assert_eq!(scene.initial_positions().len(), scene.particle_count, "{name}");
    }
}

#[test]
fn overlapping_spheres_separate() {
    let ctx = context();
    let (scene, mut system) = create_system(&scene_path("two-spheres.json"), &ctx).expect("create");

    let distance = |p: &[[f32; 4]]| {
        let d = [p[1][0] - p[0][0], p[1][1] - p[0][1], p[1][2] - p[0][2]];
        (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt()
    };
    let before = distance(&system.positions().expect("positions"));

    for _ in 0..scene.steps {
        system.update(scene.timestep).expect("update");
    }

    let after = distance(&system.positions().expect("positions"));
    assert!(after > before, "spheres should be pushed apart: {before} -> {after}");
    assert!(after >= 2.0 * system.radius() * 0.99, "spheres still overlap: {after}");
}

#[test]
fn missing_file_is_reported() {
    let err = SceneConfig::load(&scene_path("does-not-exist.json")).expect_err("missing file");
    assert!(err.contains("Failed to read scene file"));
}
