//! Scene configuration parsing and validation

use kernel::{GpuContext, SimParams};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::system::ParticleSystem;

/// A particle scene: size, parameters, initial layout and run length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    /// Human-readable scene name
    pub name: String,
    /// Number of particles (fixed for the scene's lifetime)
    pub particle_count: usize,
    /// Cells per axis
    #[serde(default = "default_grid_size")]
    pub grid_size: [u32; 3],
    /// Overrides on top of the default simulation parameters
    #[serde(default)]
    pub params: ParamOverrides,
    /// Initial particle placement
    #[serde(default)]
    pub layout: InitialLayout,
    /// Time step per update
    #[serde(default = "default_timestep")]
    pub timestep: f32,
    /// Number of updates to run
    #[serde(default = "default_steps")]
    pub steps: u64,
}

/// Optional parameter overrides. Unset fields keep the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamOverrides {
    /// Particle radius
    pub particle_radius: Option<f32>,
    /// Gravity vector
    pub gravity: Option<[f32; 3]>,
    /// Minimum corner of the grid
    pub grid_origin: Option<[f32; 3]>,
    /// Cell edge lengths; at least one particle diameter
    pub cell_size: Option<[f32; 3]>,
    /// Per-step velocity damping factor
    pub global_damping: Option<f32>,
    /// Velocity factor on wall contact
    pub boundary_damping: Option<f32>,
    /// Contact spring stiffness
    pub collide_spring: Option<f32>,
    /// Contact damping
    pub collide_damping: Option<f32>,
    /// Contact shear
    pub collide_shear: Option<f32>,
    /// Contact attraction
    pub collide_attraction: Option<f32>,
}

/// Initial particle placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InitialLayout {
    /// Cube lattice starting at the grid's minimum corner.
    Grid {
        /// Lattice spacing; defaults to one particle diameter
        #[serde(default)]
        spacing: Option<f32>,
        /// Random offset per axis, in particle radii
        #[serde(default)]
        jitter: f32,
        /// Seed for the jitter
        #[serde(default)]
        seed: u64,
    },
    /// One position per particle.
    Explicit {
        /// Particle positions [x, y, z]
        positions: Vec<[f32; 3]>,
    },
}

impl Default for InitialLayout {
    fn default() -> Self {
        InitialLayout::Grid { spacing: None, jitter: 0.0, seed: 0 }
    }
}

// Default values
fn default_grid_size() -> [u32; 3] {
    [64, 64, 64]
}

fn default_timestep() -> f32 {
    0.5
}

fn default_steps() -> u64 {
    100
}

impl SceneConfig {
    /// Load and validate a scene from a JSON file
    pub fn load(path: &str) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read scene file {}: {}", path, e))?;

        let config: SceneConfig = serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse scene JSON: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.particle_count == 0 {
            return Err("particle_count must be at least 1".to_string());
        }
        if self.grid_size.contains(&0) {
            return Err("grid_size must be non-zero on every axis".to_string());
        }
        if !(self.timestep.is_finite() && self.timestep > 0.0) {
            return Err("timestep must be positive".to_string());
        }
        if self.steps == 0 {
            return Err("steps must be at least 1".to_string());
        }

        match &self.layout {
            InitialLayout::Grid { spacing, jitter, .. } => {
                if let Some(spacing) = spacing {
                    if *spacing <= 0.0 {
                        return Err("Grid spacing must be positive".to_string());
                    }
                }
                if *jitter < 0.0 {
                    return Err("Grid jitter must be non-negative".to_string());
                }
            }
            InitialLayout::Explicit { positions } => {
                if positions.len() != self.particle_count {
                    return Err(format!(
                        "Explicit layout has {} positions for {} particles",
                        positions.len(),
                        self.particle_count
                    ));
                }
            }
        }

        self.sim_params().validate().map_err(|e| e.to_string())
    }

    /// Default parameters for the grid with the overrides applied.
    pub fn sim_params(&self) -> SimParams {
        let mut p = SimParams::new(self.grid_size);
        let o = &self.params;
        if let Some(r) = o.particle_radius {
            p.particle_radius = r;
        }
        if let Some(g) = o.gravity {
            p.gravity = g;
        }
        if let Some(origin) = o.grid_origin {
            p.grid_origin = origin;
        }
        if let Some(cell) = o.cell_size {
            p.cell_size = cell;
        }
        if let Some(v) = o.global_damping {
            p.global_damping = v;
        }
        if let Some(v) = o.boundary_damping {
            p.boundary_damping = v;
        }
        if let Some(v) = o.collide_spring {
            p.collide_spring = v;
        }
        if let Some(v) = o.collide_damping {
            p.collide_damping = v;
        }
        if let Some(v) = o.collide_shear {
            p.collide_shear = v;
        }
        if let Some(v) = o.collide_attraction {
            p.collide_attraction = v;
        }
        p
    }

    /// Initial positions (`w = 1`) for the configured layout.
    pub fn initial_positions(&self) -> Vec<[f32; 4]> {
        let params = self.sim_params();
        match &self.layout {
            InitialLayout::Explicit { positions } => positions.iter().map(|p| [p[0], p[1], p[2], 1.0]).collect(),
            InitialLayout::Grid { spacing, jitter, seed } => {
                let r = params.particle_radius;
                let spacing = spacing.unwrap_or(2.0 * r);
                let side = (self.particle_count as f64).cbrt().ceil() as usize;
                let origin = params.world_min();
                let mut rng = StdRng::seed_from_u64(*seed);

                let mut out = Vec::with_capacity(self.particle_count);
                'fill: for z in 0..side {
                    for y in 0..side {
                        for x in 0..side {
                            if out.len() == self.particle_count {
                                break 'fill;
                            }
                            let mut p = [0.0f32; 4];
                            for (axis, i) in [x, y, z].into_iter().enumerate() {
                                let offset = if *jitter > 0.0 { rng.gen_range(-1.0f32..=1.0) * jitter * r } else { 0.0 };
                                p[axis] = origin[axis] + r + spacing * i as f32 + offset;
                            }
                            p[3] = 1.0;
                            out.push(p);
                        }
                    }
                }
                out
            }
        }
    }

    /// Create the particle system, apply the parameter overrides and upload
    /// the initial positions.
    pub fn build(&self, ctx: &GpuContext) -> Result<ParticleSystem, Box<dyn std::error::Error>> {
        self.validate()?;
        let mut system = ParticleSystem::new(ctx, self.particle_count, self.grid_size)?;
        system.set_params(self.sim_params())?;
        system.set_positions(&self.initial_positions())?;
        Ok(system)
    }
}
