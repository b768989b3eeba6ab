//! Per-stage wall-clock timings of one simulation step.

/// Wall-clock breakdown of [`crate::ParticleSystem::update_profiled`].
///
/// Kernel stages measure submission time only; work still queued on the
/// accelerator is accounted to `synchronize_us`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepProfile {
    /// Mapping the position buffer for the kernels (microseconds).
    pub map_us: u64,
    /// Integration submit (microseconds).
    pub integrate_us: u64,
    /// Grid hash submit (microseconds).
    pub hash_us: u64,
    /// Key sort submit (microseconds).
    pub sort_us: u64,
    /// Cell start/end extraction submit (microseconds).
    pub cell_bounds_us: u64,
    /// Collision submit (microseconds).
    pub collide_us: u64,
    /// Handing the position buffer back to the renderer (microseconds).
    pub unmap_us: u64,
    /// Blocking wait for the accelerator queue (microseconds).
    pub synchronize_us: u64,
    /// Total wall-clock time for the entire step (microseconds).
    pub total_us: u64,
}

impl StepProfile {
    /// Sum of the kernel submit stages.
    pub fn kernels_us(&self) -> u64 {
        self.integrate_us + self.hash_us + self.sort_us + self.cell_bounds_us + self.collide_us
    }
}

impl std::ops::AddAssign for StepProfile {
    fn add_assign(&mut self, rhs: Self) {
        self.map_us += rhs.map_us;
        self.integrate_us += rhs.integrate_us;
        self.hash_us += rhs.hash_us;
        self.sort_us += rhs.sort_us;
        self.cell_bounds_us += rhs.cell_bounds_us;
        self.collide_us += rhs.collide_us;
        self.unmap_us += rhs.unmap_us;
        self.synchronize_us += rhs.synchronize_us;
        self.total_us += rhs.total_us;
    }
}
