//! Particle simulation orchestrator.
//!
//! [`ParticleSystem`] owns the simulation parameters and every per-particle
//! array. Positions live in an [`InteropBuffer`] so the renderer can draw them
//! directly; everything else is device memory allocated through the tracking
//! allocator.
//!
//! # Step protocol
//! 1. map the position buffer
//! 2. integrate
//! 3. compute grid hash + identity index
//! 4. sort `(hash, index)` by hash, ties by index
//! 5. cell start/end extraction, then collide into the scratch velocities
//! 6. unmap the position buffer
//! 7. synchronize
//!
//! If any stage fails the buffer is still unmapped before the stage error is
//! returned, and synchronization is skipped.

use std::fmt;
use std::time::Instant;

use kernel::{
    Address, BufferHandle, BufferState, CollideArgs, GpuContext, InteropBuffer, InteropToken, KernelError,
    MemoryDomain, Result, SimParams, TrackedArray,
};

use crate::profile::StepProfile;

type Vec4 = [f32; 4];

/// A fixed-size particle simulation bound to one accelerator.
pub struct ParticleSystem {
    count: usize,
    params: SimParams,
    steps: u64,

    // Fields drop in declaration order: host mirrors, device arrays, then the
    // shared position buffer (unmap, unregister, delete).
    host_positions: TrackedArray<Vec4>,
    host_velocities: TrackedArray<Vec4>,

    velocities: TrackedArray<Vec4>,
    scratch_velocities: TrackedArray<Vec4>,
    colors: TrackedArray<Vec4>,
    grid_hash: TrackedArray<u32>,
    grid_index: TrackedArray<u32>,
    cell_start: TrackedArray<u32>,
    cell_end: TrackedArray<u32>,

    positions: InteropBuffer<Vec4>,
    ctx: GpuContext,
}

fn micros(since: Instant) -> u64 {
    since.elapsed().as_micros() as u64
}

impl ParticleSystem {
    /// Allocate every array for `count` particles on a `grid_size` grid,
    /// register the position buffer and push default parameters.
    ///
    /// Nothing stays allocated if any step fails.
    pub fn new(ctx: &GpuContext, count: usize, grid_size: [u32; 3]) -> Result<Self> {
        if count == 0 {
            return Err(KernelError::invalid_argument("particle count must be non-zero"));
        }
        let params = SimParams::new(grid_size);
        params.validate()?;

        let cells = params.cell_count();
        let alloc = ctx.allocator();

        let host_positions = TrackedArray::zeroed(alloc, MemoryDomain::Host, count)?;
        let host_velocities = TrackedArray::zeroed(alloc, MemoryDomain::Host, count)?;

        let velocities = TrackedArray::zeroed(alloc, MemoryDomain::Device, count)?;
        let scratch_velocities = TrackedArray::zeroed(alloc, MemoryDomain::Device, count)?;
        let colors = TrackedArray::zeroed(alloc, MemoryDomain::Device, count)?;
        let grid_hash = TrackedArray::zeroed(alloc, MemoryDomain::Device, count)?;
        let grid_index = TrackedArray::zeroed(alloc, MemoryDomain::Device, count)?;
        let cell_start = TrackedArray::zeroed(alloc, MemoryDomain::Device, cells)?;
        let cell_end = TrackedArray::zeroed(alloc, MemoryDomain::Device, cells)?;

        let mut positions = InteropBuffer::new(ctx);
        positions.allocate(count)?;

        ctx.accelerator().set_parameters(&params)?;

        tracing::info!(
            count,
            ?grid_size,
            device_bytes = alloc.usage(MemoryDomain::Device),
            "particle system created"
        );

        Ok(Self {
            count,
            params,
            steps: 0,
            host_positions,
            host_velocities,
            velocities,
            scratch_velocities,
            colors,
            grid_hash,
            grid_index,
            cell_start,
            cell_end,
            positions,
            ctx: ctx.clone(),
        })
    }

    // ---- Stepping ----

    /// Advance the simulation by `dt`. Blocks until the step is complete.
    pub fn update(&mut self, dt: f32) -> Result<()> {
        self.update_profiled(dt).map(|_| ())
    }

    /// [`ParticleSystem::update`] with per-stage timings.
    pub fn update_profiled(&mut self, dt: f32) -> Result<StepProfile> {
        if !dt.is_finite() {
            return Err(KernelError::invalid_argument(format!("time step must be finite, got {dt}")));
        }
        let step_start = Instant::now();
        let mut profile = StepProfile::default();

        let t = Instant::now();
        let positions = self.positions.bind()?;
        profile.map_us = micros(t);

        let staged = self.run_stages(positions, dt, &mut profile);

        let t = Instant::now();
        let unbound = self.positions.unbind();
        profile.unmap_us = micros(t);

        if let Err(e) = staged {
            if let Err(unbind_err) = unbound {
                tracing::warn!(step = self.steps, "unmap after failed step also failed: {unbind_err}");
            }
            tracing::debug!(step = self.steps, "step failed: {e}");
            return Err(e);
        }
        unbound?;

        // Collide wrote the new velocities into the scratch array.
        std::mem::swap(&mut self.velocities, &mut self.scratch_velocities);

        let t = Instant::now();
        self.ctx.accelerator().synchronize()?;
        profile.synchronize_us = micros(t);

        self.steps += 1;
        profile.total_us = micros(step_start);
        tracing::trace!(step = self.steps, total_us = profile.total_us, "step complete");
        Ok(profile)
    }

    fn run_stages(&self, positions: Address, dt: f32, profile: &mut StepProfile) -> Result<()> {
        let accel = self.ctx.accelerator();
        let n = self.count;

        let t = Instant::now();
        accel.integrate(positions, self.velocities.address(), dt, n)?;
        profile.integrate_us = micros(t);

        let t = Instant::now();
        accel.compute_hash(self.grid_hash.address(), self.grid_index.address(), positions, n)?;
        profile.hash_us = micros(t);

        let t = Instant::now();
        accel.sort_by_key(self.grid_hash.address(), self.grid_index.address(), n)?;
        profile.sort_us = micros(t);

        let t = Instant::now();
        accel.find_cell_bounds(
            self.cell_start.address(),
            self.cell_end.address(),
            self.grid_hash.address(),
            n,
            self.params.cell_count(),
        )?;
        profile.cell_bounds_us = micros(t);

        let t = Instant::now();
        accel.collide(&CollideArgs {
            new_velocities: self.scratch_velocities.address(),
            positions,
            velocities: self.velocities.address(),
            grid_index: self.grid_index.address(),
            cell_start: self.cell_start.address(),
            cell_end: self.cell_end.address(),
            count: n,
        })?;
        profile.collide_us = micros(t);
        Ok(())
    }

    // ---- Parameters ----
    //
    // Every setter validates, updates the host copy and pushes it to the
    // accelerator. If the push fails the host copy keeps the new value and
    // the error tells the caller the accelerator copy is stale.

    /// Particle radius.
    pub fn radius(&self) -> f32 {
        self.params.particle_radius
    }

    /// Set the particle radius. Cell size is left unchanged, so the new
    /// diameter must still fit in one cell.
    pub fn set_radius(&mut self, radius: f32) -> Result<()> {
        self.edit_params(|p| p.particle_radius = radius)
    }

    /// Vertical gravity component.
    pub fn gravity(&self) -> f32 {
        self.params.gravity[1]
    }

    /// Set gravity to `(0, gravity, 0)`.
    pub fn set_gravity(&mut self, gravity: f32) -> Result<()> {
        self.edit_params(|p| p.gravity = [0.0, gravity, 0.0])
    }

    /// Set the per-step velocity damping factor.
    pub fn set_global_damping(&mut self, damping: f32) -> Result<()> {
        self.edit_params(|p| p.global_damping = damping)
    }

    /// Set the velocity factor applied on wall contact.
    pub fn set_boundary_damping(&mut self, damping: f32) -> Result<()> {
        self.edit_params(|p| p.boundary_damping = damping)
    }

    /// Set the contact force coefficients.
    pub fn set_collide_coefficients(&mut self, spring: f32, damping: f32, shear: f32, attraction: f32) -> Result<()> {
        self.edit_params(|p| {
            p.collide_spring = spring;
            p.collide_damping = damping;
            p.collide_shear = shear;
            p.collide_attraction = attraction;
        })
    }

    /// Replace every parameter at once. The grid size cannot change.
    pub fn set_params(&mut self, params: SimParams) -> Result<()> {
        if params.grid_size != self.params.grid_size || params.num_cells != self.params.num_cells {
            return Err(KernelError::invalid_argument(format!(
                "grid size is fixed at {:?}, got {:?}",
                self.params.grid_size, params.grid_size
            )));
        }
        self.edit_params(|p| *p = params)
    }

    fn edit_params(&mut self, edit: impl FnOnce(&mut SimParams)) -> Result<()> {
        let mut next = self.params;
        edit(&mut next);
        next.validate()?;
        self.params = next;
        self.ctx.accelerator().set_parameters(&self.params)
    }

    // ---- Particle data ----

    fn check_len(&self, what: &str, len: usize) -> Result<()> {
        if len != self.count {
            return Err(KernelError::invalid_argument(format!(
                "expected {} {what}, got {len}",
                self.count
            )));
        }
        Ok(())
    }

    /// Upload positions through the renderer path.
    pub fn set_positions(&mut self, positions: &[Vec4]) -> Result<()> {
        self.check_len("positions", positions.len())?;
        self.host_positions.write(positions)?;
        self.positions.write(positions)
    }

    /// Read positions back through the renderer path.
    pub fn positions(&self) -> Result<Vec<Vec4>> {
        let data = self.positions.read()?;
        self.host_positions.write(&data)?;
        Ok(data)
    }

    /// Upload velocities.
    pub fn set_velocities(&mut self, velocities: &[Vec4]) -> Result<()> {
        self.check_len("velocities", velocities.len())?;
        self.host_velocities.write(velocities)?;
        self.velocities.write(velocities)
    }

    /// Read velocities back.
    pub fn velocities(&self) -> Result<Vec<Vec4>> {
        let data = self.velocities.read()?;
        self.host_velocities.write(&data)?;
        Ok(data)
    }

    /// Upload per-particle colours.
    pub fn set_colors(&mut self, colors: &[Vec4]) -> Result<()> {
        self.check_len("colors", colors.len())?;
        self.colors.write(colors)
    }

    /// Sorted grid hashes from the last step.
    pub fn grid_hash(&self) -> Result<Vec<u32>> {
        self.grid_hash.read()
    }

    /// Original particle indices in sorted order from the last step.
    pub fn grid_index(&self) -> Result<Vec<u32>> {
        self.grid_index.read()
    }

    /// Per-cell `(start, end)` offsets from the last step.
    pub fn cell_bounds(&self) -> Result<(Vec<u32>, Vec<u32>)> {
        Ok((self.cell_start.read()?, self.cell_end.read()?))
    }

    // ---- Accessors ----

    /// Number of particles.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Cells per axis.
    pub fn grid_size(&self) -> [u32; 3] {
        self.params.grid_size
    }

    /// Current parameters.
    pub fn params(&self) -> &SimParams {
        &self.params
    }

    /// Completed steps.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// The accelerator context this system runs on.
    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    /// Native position buffer for the renderer. Fails while mapped.
    pub fn positions_handle(&self) -> Result<BufferHandle> {
        self.positions.handle()
    }

    /// Compute-side registration of the position buffer.
    pub fn positions_token(&self) -> Option<InteropToken> {
        self.positions.interop_token()
    }

    /// Sharing state of the position buffer.
    pub fn positions_state(&self) -> BufferState {
        self.positions.state()
    }

    /// Device address of the live velocity array.
    pub fn velocities_address(&self) -> Address {
        self.velocities.address()
    }

    /// Device address of the colour array.
    pub fn colors_address(&self) -> Address {
        self.colors.address()
    }
}

impl Drop for ParticleSystem {
    fn drop(&mut self) {
        tracing::debug!(count = self.count, steps = self.steps, "particle system destroyed");
    }
}

impl fmt::Debug for ParticleSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticleSystem")
            .field("count", &self.count)
            .field("grid_size", &self.params.grid_size)
            .field("steps", &self.steps)
            .field("positions", &self.positions)
            .finish_non_exhaustive()
    }
}
