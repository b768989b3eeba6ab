//! Reference scenario binary entry point
//!
//! Runs every reference scenario from the repository root and exits non-zero
//! if any fails. Pass `--gpu` (with the `gpu` feature) to run on wgpu.

use reference_tests::{ExpectedResult, ReferenceTest, SeparationCheck, SettlingCheck, TestResult};

/// Two overlapping particles are pushed apart and stay apart.
fn two_spheres_test() -> ReferenceTest {
    ReferenceTest {
        name: "Two Overlapping Spheres".to_string(),
        config_path: "configs/two-spheres.json".to_string(),
        steps: None,
        expected: ExpectedResult {
            position_bounds: true,
            separation: Some(SeparationCheck { min_distance: 1.98 }),
            ..Default::default()
        },
    }
}

/// A jittered block falls under weak gravity and piles up on the floor;
/// a second run must reproduce it exactly.
fn small_settle_test() -> ReferenceTest {
    ReferenceTest {
        name: "Small Settle".to_string(),
        config_path: "configs/settle-small.json".to_string(),
        steps: None,
        expected: ExpectedResult {
            position_bounds: true,
            settling: Some(SettlingCheck { max_mean_height: 5.0 }),
            replay: true,
            ..Default::default()
        },
    }
}

/// A large block dropped into the full [-1, 1] box stays inside it.
fn dam_drop_test() -> ReferenceTest {
    ReferenceTest {
        name: "Dam Drop".to_string(),
        config_path: "configs/dam-drop.json".to_string(),
        steps: None,
        expected: ExpectedResult {
            position_bounds: true,
            ..Default::default()
        },
    }
}

/// Get all reference scenarios
fn all_tests() -> Vec<ReferenceTest> {
    vec![two_spheres_test(), small_settle_test(), dam_drop_test()]
}

#[cfg(feature = "gpu")]
fn run(test: &ReferenceTest, gpu: bool) -> Result<TestResult, String> {
    if gpu {
        test.run_with(|| kernel::WgpuDevice::new().map(std::sync::Arc::new).map_err(|e| e.to_string()))
    } else {
        test.run()
    }
}

#[cfg(not(feature = "gpu"))]
fn run(test: &ReferenceTest, gpu: bool) -> Result<TestResult, String> {
    if gpu {
        return Err("built without the `gpu` feature".to_string());
    }
    test.run()
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let gpu = std::env::args().any(|a| a == "--gpu");

    tracing::info!("Particle Reference Suite ({})", if gpu { "wgpu" } else { "cpu" });
    tracing::info!("========================");

    let tests = all_tests();
    tracing::info!("Found {} reference scenarios", tests.len());

    let mut results: Vec<TestResult> = Vec::new();
    let mut passed_count = 0;
    let mut failed_count = 0;

    for test in tests {
        match run(&test, gpu) {
            Ok(result) => {
                if result.passed {
                    passed_count += 1;
                } else {
                    failed_count += 1;
                }
                result.print_summary();
                results.push(result);
            }
            Err(e) => {
                eprintln!("\nERROR running scenario {}: {}", test.name, e);
                failed_count += 1;
            }
        }
    }

    // Print overall summary
    println!("\n{}", "=".repeat(80));
    println!("OVERALL SUMMARY");
    println!("{}", "=".repeat(80));
    println!("Total scenarios: {}", results.len());
    println!("Passed: {}", passed_count);
    println!("Failed: {}", failed_count);
    println!("{}", "=".repeat(80));

    // Exit with error code if any scenario failed
    if failed_count > 0 {
        std::process::exit(1);
    }
}
