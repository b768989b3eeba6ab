//! Reference scenarios run through `cargo test`.

use crate::{ExpectedResult, ReferenceTest, SeparationCheck, SettlingCheck};

/// Resolve a path relative to the workspace root (one level up from this crate)
fn project_path(relative: &str) -> String {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let project_root = std::path::Path::new(manifest_dir)
        .parent()
        .expect("Could not find workspace root");
    project_root.join(relative).to_string_lossy().to_string()
}

fn assert_passed(test: ReferenceTest) {
    let result = test.run().expect("scenario failed to run");
    result.print_summary();
    for check in &result.checks {
        assert!(check.passed, "{}: {} failed: {:?}", result.name, check.name, check.message);
    }
}

#[test]
fn test_two_spheres() {
    assert_passed(ReferenceTest {
        name: "Two Overlapping Spheres".to_string(),
        config_path: project_path("configs/two-spheres.json"),
        steps: None,
        expected: ExpectedResult {
            position_bounds: true,
            separation: Some(SeparationCheck { min_distance: 1.98 }),
            ..Default::default()
        },
    });
}

#[test]
fn test_small_settle() {
    assert_passed(ReferenceTest {
        name: "Small Settle".to_string(),
        config_path: project_path("configs/settle-small.json"),
        steps: None,
        expected: ExpectedResult {
            position_bounds: true,
            settling: Some(SettlingCheck { max_mean_height: 5.0 }),
            replay: true,
            ..Default::default()
        },
    });
}

#[test]
fn test_dam_drop_short() {
    assert_passed(ReferenceTest {
        name: "Dam Drop (short)".to_string(),
        config_path: project_path("configs/dam-drop.json"),
        steps: Some(10),
        expected: ExpectedResult {
            position_bounds: true,
            replay: true,
            ..Default::default()
        },
    });
}

#[test]
fn test_missing_scene_is_an_error() {
    let test = ReferenceTest {
        name: "Missing".to_string(),
        config_path: project_path("configs/nope.json"),
        steps: None,
        expected: ExpectedResult::default(),
    };
    assert!(test.run().is_err());
}
