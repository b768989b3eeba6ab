//! Simulation parameters shared with the accelerator.

use crate::error::{KernelError, Result};

/// Default particle radius.
pub const DEFAULT_PARTICLE_RADIUS: f32 = 1.0 / 64.0;

/// Simulation parameters uniform layout.
/// Must match the `SimParams` struct in all WGSL shaders exactly.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SimParams {
    /// Gravitational acceleration.
    pub gravity: [f32; 3],
    /// Particle radius; collisions happen below `2 * particle_radius`.
    pub particle_radius: f32,
    /// Minimum corner of the grid.
    pub grid_origin: [f32; 3],
    /// Velocity multiplier applied every step.
    pub global_damping: f32,
    /// Cell extent per axis.
    pub cell_size: [f32; 3],
    /// Velocity multiplier applied on wall contact (negative reflects).
    pub boundary_damping: f32,
    /// Cells per axis.
    pub grid_size: [u32; 3],
    /// `grid_size` product.
    pub num_cells: u32,
    /// Collision spring stiffness.
    pub collide_spring: f32,
    /// Collision damping.
    pub collide_damping: f32,
    /// Collision tangential (shear) coefficient.
    pub collide_shear: f32,
    /// Collision attraction coefficient.
    pub collide_attraction: f32,
}

impl SimParams {
    /// Default parameters for a grid of `grid_size` cells.
    ///
    /// The grid starts at `(-1, -1, -1)` with cells two radii wide, so a
    /// 64-cell axis spans `[-1, 1]`.
    pub fn new(grid_size: [u32; 3]) -> Self {
        let r = DEFAULT_PARTICLE_RADIUS;
        Self {
            gravity: [0.0, -0.05, 0.0],
            particle_radius: r,
            grid_origin: [-1.0, -1.0, -1.0],
            global_damping: 1.0,
            cell_size: [2.0 * r; 3],
            boundary_damping: -0.5,
            grid_size,
            num_cells: grid_size[0]
                .saturating_mul(grid_size[1])
                .saturating_mul(grid_size[2]),
            collide_spring: 0.5,
            collide_damping: 0.02,
            collide_shear: 0.1,
            collide_attraction: 0.0,
        }
    }

    /// Number of grid cells.
    pub fn cell_count(&self) -> usize {
        self.grid_size.iter().map(|&d| d as usize).product()
    }

    /// Lower corner of the simulated volume.
    pub fn world_min(&self) -> [f32; 3] {
        self.grid_origin
    }

    /// Upper corner of the simulated volume.
    pub fn world_max(&self) -> [f32; 3] {
        [
            self.grid_origin[0] + self.grid_size[0] as f32 * self.cell_size[0],
            self.grid_origin[1] + self.grid_size[1] as f32 * self.cell_size[1],
            self.grid_origin[2] + self.grid_size[2] as f32 * self.cell_size[2],
        ]
    }

    /// Reject parameter sets the kernels cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.particle_radius.is_finite() && self.particle_radius > 0.0) {
            return Err(KernelError::invalid_argument(format!(
                "particle radius must be positive, got {}",
                self.particle_radius
            )));
        }
        if self.grid_size.contains(&0) {
            return Err(KernelError::invalid_argument(format!(
                "grid size must be non-zero on every axis, got {:?}",
                self.grid_size
            )));
        }
        if self.num_cells as usize != self.cell_count() {
            return Err(KernelError::invalid_argument(format!(
                "num_cells {} does not match grid size {:?}",
                self.num_cells, self.grid_size
            )));
        }
        if self.cell_size.iter().any(|&c| !(c.is_finite() && c > 0.0)) {
            return Err(KernelError::invalid_argument(format!(
                "cell size must be positive, got {:?}",
                self.cell_size
            )));
        }
        // The 27-cell neighbour walk only reaches one cell in each direction.
        let diameter = 2.0 * self.particle_radius;
        if self.cell_size.iter().any(|&c| c < diameter) {
            return Err(KernelError::invalid_argument(format!(
                "cell size {:?} is smaller than the particle diameter {diameter}",
                self.cell_size
            )));
        }
        let finite = self
            .gravity
            .iter()
            .chain(&self.grid_origin)
            .chain(&[
                self.global_damping,
                self.boundary_damping,
                self.collide_spring,
                self.collide_damping,
                self.collide_shear,
                self.collide_attraction,
            ])
            .all(|v| v.is_finite());
        if !finite {
            return Err(KernelError::invalid_argument("parameters must be finite"));
        }
        Ok(())
    }
}
