//! Orchestration Layer
//!
//! This crate drives the particle simulation on top of the kernel crate:
//! - [`system`] -- `ParticleSystem`, the per-step map/kernel/unmap/synchronize protocol
//! - [`profile`] -- per-stage step timings
//! - [`config`] -- JSON scene files and initial particle layouts

#![warn(missing_docs)]

pub mod config;
pub mod profile;
pub mod system;

pub use config::{InitialLayout, ParamOverrides, SceneConfig};
pub use profile::StepProfile;
pub use system::ParticleSystem;

use kernel::GpuContext;

/// Create a particle system from a scene file.
///
/// Loads and validates the scene, allocates the system on `ctx`, applies the
/// parameter overrides and uploads the initial layout.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use kernel::{CpuDevice, GpuContext};
/// use orchestrator::create_system;
///
/// let ctx = GpuContext::new(Arc::new(CpuDevice::new()));
/// let (scene, mut system) = create_system("configs/dam-drop.json", &ctx)?;
/// for _ in 0..scene.steps {
///     system.update(scene.timestep)?;
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn create_system(
    config_path: &str,
    ctx: &GpuContext,
) -> Result<(SceneConfig, ParticleSystem), Box<dyn std::error::Error>> {
    tracing::info!("Creating particle system from scene: {}", config_path);

    let scene = SceneConfig::load(config_path)?;
    tracing::info!(
        "Scene loaded: {} ({} particles, grid {:?})",
        scene.name,
        scene.particle_count,
        scene.grid_size
    );

    let system = scene.build(ctx)?;
    Ok((scene, system))
}
