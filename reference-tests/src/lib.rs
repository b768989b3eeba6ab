//! Reference scenario framework for the particle simulation
//!
//! Each scenario loads a scene file, runs it end to end on an accelerator and
//! validates both the physical outcome (bounds, settling, separation) and the
//! resource lifecycle (buffer handed back to the renderer, sorted arrays
//! consistent, every tracked byte returned on teardown).

#[cfg(test)]
mod tests;


use std::sync::Arc;
use std::time::Instant;

use kernel::{Accelerator, BufferState, GpuContext, MemoryDomain, MemoryLedger, MemoryRecord, EMPTY_CELL};
use orchestrator::{SceneConfig, StepProfile};

/// Expected result criteria for a reference scenario
#[derive(Debug, Clone, Default)]
pub struct ExpectedResult {
    /// Particles stay inside the grid volume
    pub position_bounds: bool,
    /// Particles come to rest near the floor
    pub settling: Option<SettlingCheck>,
    /// No pair of particles ends closer than this
    pub separation: Option<SeparationCheck>,
    /// A second run from the same scene produces bit-identical results
    pub replay: bool,
}

/// Check that the pile ends near the floor
#[derive(Debug, Clone)]
pub struct SettlingCheck {
    /// Maximum mean height above the floor, in particle radii
    pub max_mean_height: f32,
}

/// Check the minimum pair distance
#[derive(Debug, Clone)]
pub struct SeparationCheck {
    /// Minimum distance between any two particles, in particle radii
    pub min_distance: f32,
}

/// Result of running a reference scenario
#[derive(Debug)]
pub struct TestResult {
    /// Scenario name
    pub name: String,
    /// Whether every check passed
    pub passed: bool,
    /// Individual check results
    pub checks: Vec<CheckResult>,
    /// Number of updates executed
    pub steps: u64,
    /// Particle count
    pub particles: usize,
    /// Device bytes tracked while the system was alive
    pub device_bytes: usize,
    /// Accumulated stage timings
    pub profile: StepProfile,
}

/// Result of an individual validation check
#[derive(Debug)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// Whether check passed
    pub passed: bool,
    /// Detail or error message
    pub message: Option<String>,
}

impl CheckResult {
    fn pass(name: &str, message: Option<String>) -> Self {
        Self { name: name.to_string(), passed: true, message }
    }

    fn fail(name: &str, message: String) -> Self {
        Self { name: name.to_string(), passed: false, message: Some(message) }
    }
}

/// A reference scenario
pub struct ReferenceTest {
    /// Scenario name
    pub name: String,
    /// Path to the scene file
    pub config_path: String,
    /// Override the scene's step count
    pub steps: Option<u64>,
    /// Expected results to validate
    pub expected: ExpectedResult,
}

/// State captured at the end of one run.
struct RunOutput {
    initial_positions: Vec<[f32; 4]>,
    positions: Vec<[f32; 4]>,
    grid_hash: Vec<u32>,
    grid_index: Vec<u32>,
    cell_start: Vec<u32>,
    cell_end: Vec<u32>,
    state: BufferState,
    device_bytes: usize,
    leaked: Vec<MemoryRecord>,
    profile: StepProfile,
}

impl ReferenceTest {
    /// Run on the CPU reference accelerator
    pub fn run(&self) -> Result<TestResult, String> {
        self.run_with(|| Ok(Arc::new(kernel::CpuDevice::new())))
    }

    /// Run on accelerators produced by `make_device` (called once per run)
    pub fn run_with<A, F>(&self, make_device: F) -> Result<TestResult, String>
    where
        A: Accelerator + 'static,
        F: Fn() -> Result<Arc<A>, String>,
    {
        tracing::info!("Running reference scenario: {}", self.name);

        let scene = SceneConfig::load(&self.config_path)?;
        let steps = self.steps.unwrap_or(scene.steps);
        let params = scene.sim_params();

        let start = Instant::now();
        let out = run_scene(&scene, steps, make_device()?)?;
        tracing::info!(
            "Scenario complete: {} steps in {:.2}s",
            steps,
            start.elapsed().as_secs_f64()
        );

        let mut checks = vec![
            validate_buffer_state(out.state),
            validate_sort_order(&out, scene.particle_count),
            validate_memory(&out.leaked),
        ];

        if self.expected.position_bounds {
            checks.push(validate_position_bounds(&out.positions, &params));
        }
        if let Some(ref settling) = self.expected.settling {
            checks.push(validate_settling(&out, &params, settling));
        }
        if let Some(ref separation) = self.expected.separation {
            checks.push(validate_separation(&out.positions, params.particle_radius, separation));
        }
        if self.expected.replay {
            let second = run_scene(&scene, steps, make_device()?)?;
            checks.push(validate_replay(&out, &second));
        }

        Ok(TestResult {
            name: self.name.clone(),
            passed: checks.iter().all(|c| c.passed),
            checks,
            steps,
            particles: scene.particle_count,
            device_bytes: out.device_bytes,
            profile: out.profile,
        })
    }
}

fn run_scene<A: Accelerator + 'static>(scene: &SceneConfig, steps: u64, device: Arc<A>) -> Result<RunOutput, String> {
    let ledger = Arc::new(MemoryLedger::new());
    let ctx = GpuContext::with_ledger(device, Arc::clone(&ledger));

    let mut system = scene.build(&ctx).map_err(|e| format!("Failed to build scene: {e}"))?;
    let device_bytes = ledger.usage(MemoryDomain::Device);
    tracing::info!(
        "Initialized: {} particles, {} device bytes",
        system.count(),
        device_bytes
    );

    let err = |e: kernel::KernelError| e.to_string();
    let initial_positions = system.positions().map_err(err)?;

    let mut profile = StepProfile::default();
    for step in 0..steps {
        profile += system.update_profiled(scene.timestep).map_err(err)?;

        // Log progress every 10% of steps
        if (step + 1) % (steps / 10).max(1) == 0 {
            let progress = ((step + 1) as f32 / steps as f32) * 100.0;
            tracing::info!("Progress: {:.0}% ({}/{})", progress, step + 1, steps);
        }
    }

    let (cell_start, cell_end) = system.cell_bounds().map_err(err)?;
    let out = RunOutput {
        initial_positions,
        positions: system.positions().map_err(err)?,
        grid_hash: system.grid_hash().map_err(err)?,
        grid_index: system.grid_index().map_err(err)?,
        cell_start,
        cell_end,
        state: system.positions_state(),
        device_bytes,
        leaked: Vec::new(),
        profile,
    };

    drop(system);
    Ok(RunOutput {
        leaked: [MemoryDomain::Host, MemoryDomain::Device]
            .into_iter()
            .flat_map(|domain| ledger.records(domain))
            .collect(),
        ..out
    })
}

/// Validate that the position buffer was handed back to the renderer
fn validate_buffer_state(state: BufferState) -> CheckResult {
    if state == BufferState::Registered {
        CheckResult::pass("Buffer State", None)
    } else {
        CheckResult::fail("Buffer State", format!("position buffer left {state} after the last step"))
    }
}

/// Validate the sorted (hash, index) pairs and the cell ranges derived from them
fn validate_sort_order(out: &RunOutput, count: usize) -> CheckResult {
    const NAME: &str = "Sort Order";

    let pairs: Vec<(u32, u32)> = out.grid_hash.iter().copied().zip(out.grid_index.iter().copied()).collect();
    if let Some(i) = pairs.windows(2).position(|w| w[0] >= w[1]) {
        return CheckResult::fail(NAME, format!("pairs out of order at slot {}: {:?}", i, &pairs[i..i + 2]));
    }

    let mut seen = vec![false; count];
    for &index in &out.grid_index {
        match seen.get_mut(index as usize) {
            Some(slot) if !*slot => *slot = true,
            _ => return CheckResult::fail(NAME, format!("index {index} repeated or out of range")),
        }
    }

    let mut covered = 0u64;
    for (cell, (&start, &end)) in out.cell_start.iter().zip(&out.cell_end).enumerate() {
        if start == EMPTY_CELL {
            continue;
        }
        if end <= start || (start..end).any(|slot| out.grid_hash[slot as usize] != cell as u32) {
            return CheckResult::fail(NAME, format!("cell {cell} range [{start}, {end}) is inconsistent"));
        }
        covered += u64::from(end - start);
    }
    if covered != count as u64 {
        return CheckResult::fail(NAME, format!("cell ranges cover {covered} of {count} particles"));
    }

    CheckResult::pass(NAME, None)
}

/// Validate that teardown returned every tracked byte
fn validate_memory(leaked: &[MemoryRecord]) -> CheckResult {
    if leaked.is_empty() {
        return CheckResult::pass("Memory Accounting", None);
    }
    let bytes: usize = leaked.iter().map(|r| r.size).sum();
    let first = &leaked[0];
    CheckResult::fail(
        "Memory Accounting",
        format!(
            "{} allocations ({} bytes) still tracked after teardown, first {} bytes at {} in {}",
            leaked.len(),
            bytes,
            first.size,
            first.address,
            first.domain
        ),
    )
}

/// Validate that particles remain inside the grid volume (inset by the radius)
fn validate_position_bounds(positions: &[[f32; 4]], params: &kernel::SimParams) -> CheckResult {
    let lo = params.world_min();
    let hi = params.world_max();
    let r = params.particle_radius;
    let tolerance = 1e-5;

    let mut violations = 0;
    let mut max_violation = 0.0_f32;
    for p in positions {
        for axis in 0..3 {
            let below = (lo[axis] + r) - p[axis];
            let above = p[axis] - (hi[axis] - r);
            let violation = below.max(above);
            if violation > tolerance {
                violations += 1;
                max_violation = max_violation.max(violation);
            }
        }
    }

    if violations == 0 {
        CheckResult::pass("Position Bounds", None)
    } else {
        CheckResult::fail(
            "Position Bounds",
            format!("{} coordinates out of bounds (max violation: {:.6})", violations, max_violation),
        )
    }
}

/// Validate that the pile's mean height above the floor is small
fn validate_settling(out: &RunOutput, params: &kernel::SimParams, check: &SettlingCheck) -> CheckResult {
    let r = params.particle_radius;
    let floor = params.world_min()[1] + r;
    let mean_height = |ps: &[[f32; 4]]| ps.iter().map(|p| p[1] - floor).sum::<f32>() / ps.len().max(1) as f32 / r;

    let before = mean_height(&out.initial_positions);
    let after = mean_height(&out.positions);
    let message = format!(
        "mean height {:.2} r (start {:.2} r, limit {:.2} r)",
        after, before, check.max_mean_height
    );
    if after <= check.max_mean_height {
        CheckResult::pass("Settling", Some(message))
    } else {
        CheckResult::fail("Settling", message)
    }
}

/// Validate the minimum pair distance (quadratic; for small scenes)
fn validate_separation(positions: &[[f32; 4]], radius: f32, check: &SeparationCheck) -> CheckResult {
    let mut min_distance = f32::INFINITY;
    for (i, a) in positions.iter().enumerate() {
        for b in &positions[i + 1..] {
            let d = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
            min_distance = min_distance.min((d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt());
        }
    }
    let in_radii = min_distance / radius;
    let message = format!("closest pair {:.3} r (limit {:.3} r)", in_radii, check.min_distance);
    if in_radii >= check.min_distance {
        CheckResult::pass("Separation", Some(message))
    } else {
        CheckResult::fail("Separation", message)
    }
}

/// Validate that two runs of the same scene agree bit for bit
fn validate_replay(a: &RunOutput, b: &RunOutput) -> CheckResult {
    if a.grid_hash != b.grid_hash || a.grid_index != b.grid_index {
        return CheckResult::fail("Deterministic Replay", "sorted hash/index arrays differ".to_string());
    }
    let bits = |ps: &[[f32; 4]]| ps.iter().flatten().map(|f| f.to_bits()).collect::<Vec<_>>();
    if bits(&a.positions) != bits(&b.positions) {
        return CheckResult::fail("Deterministic Replay", "final positions differ".to_string());
    }
    CheckResult::pass("Deterministic Replay", None)
}

impl TestResult {
    /// Print a summary of the scenario result
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(80));
        println!("Scenario: {}", self.name);
        println!("{}", "=".repeat(80));
        println!("Status: {}", if self.passed { "PASSED" } else { "FAILED" });
        println!("Particles: {}", self.particles);
        println!("Steps: {}", self.steps);
        println!("Device memory: {:.1} KiB", self.device_bytes as f64 / 1024.0);
        if self.steps > 0 {
            let avg = |v: u64| v as f64 / self.steps as f64;
            println!("\nAverage stage time (µs):");
            println!("  Kernels: {:.1}", avg(self.profile.kernels_us()));
            println!("  Map + unmap: {:.1}", avg(self.profile.map_us + self.profile.unmap_us));
            println!("  Synchronize: {:.1}", avg(self.profile.synchronize_us));
            println!("  Total: {:.1}", avg(self.profile.total_us));
        }
        println!("\nValidation Checks:");
        for check in &self.checks {
            let status = if check.passed { "PASS" } else { "FAIL" };
            print!("  [{}] {}", status, check.name);
            if let Some(ref msg) = check.message {
                print!(" - {}", msg);
            }
            println!();
        }
        println!("{}", "=".repeat(80));
    }
}
