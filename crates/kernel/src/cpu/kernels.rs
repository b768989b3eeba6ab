//! Sequential reference implementations of the particle pipeline kernels.
//!
//! These operate on plain slices; [`super::CpuDevice`] resolves addresses to
//! slices and calls them. Positions and velocities are `[x, y, z, w]`.

use crate::grid::{UniformGrid, EMPTY_CELL};
use crate::params::SimParams;

#[inline]
fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
fn xyz(v: [f32; 4]) -> [f32; 3] {
    [v[0], v[1], v[2]]
}

/// Advance every particle by `dt`: gravity, global damping, then reflection
/// off the walls of the grid volume (inset by the particle radius).
pub fn integrate(params: &SimParams, positions: &mut [[f32; 4]], velocities: &mut [[f32; 4]], dt: f32) {
    let lo = params.world_min();
    let hi = params.world_max();
    let r = params.particle_radius;

    for (pos, vel) in positions.iter_mut().zip(velocities.iter_mut()) {
        for axis in 0..3 {
            vel[axis] += params.gravity[axis] * dt;
            vel[axis] *= params.global_damping;
            pos[axis] += vel[axis] * dt;

            if pos[axis] > hi[axis] - r {
                pos[axis] = hi[axis] - r;
                vel[axis] *= params.boundary_damping;
            }
            if pos[axis] < lo[axis] + r {
                pos[axis] = lo[axis] + r;
                vel[axis] *= params.boundary_damping;
            }
        }
    }
}

/// Cell hash of every particle, and the identity permutation.
pub fn compute_hash(params: &SimParams, positions: &[[f32; 4]], grid_hash: &mut [u32], grid_index: &mut [u32]) {
    let grid = UniformGrid::new(params);
    for (i, pos) in positions.iter().enumerate() {
        grid_hash[i] = grid.hash_position(xyz(*pos));
        grid_index[i] = i as u32;
    }
}

/// Sort `(hash, index)` pairs ascending by hash, ties by index.
pub fn sort_by_key(grid_hash: &mut [u32], grid_index: &mut [u32]) {
    let mut pairs: Vec<(u32, u32)> = grid_hash
        .iter()
        .copied()
        .zip(grid_index.iter().copied())
        .collect();
    pairs.sort_unstable();
    for (slot, (hash, index)) in pairs.into_iter().enumerate() {
        grid_hash[slot] = hash;
        grid_index[slot] = index;
    }
}

/// Per-cell `[start, end)` ranges in the sorted hash array.
///
/// Every hash must be below `cell_start.len()`; cells without particles are
/// left at [`EMPTY_CELL`].
pub fn find_cell_bounds(grid_hash: &[u32], cell_start: &mut [u32], cell_end: &mut [u32]) {
    cell_start.fill(EMPTY_CELL);
    cell_end.fill(EMPTY_CELL);

    for (slot, &hash) in grid_hash.iter().enumerate() {
        let cell = hash as usize;
        if slot == 0 || grid_hash[slot - 1] != hash {
            cell_start[cell] = slot as u32;
            if slot > 0 {
                cell_end[grid_hash[slot - 1] as usize] = slot as u32;
            }
        }
        if slot == grid_hash.len() - 1 {
            cell_end[cell] = slot as u32 + 1;
        }
    }
}

/// DEM contact force on particle A from particle B.
fn collide_spheres(
    params: &SimParams,
    pos_a: [f32; 3],
    pos_b: [f32; 3],
    vel_a: [f32; 3],
    vel_b: [f32; 3],
) -> [f32; 3] {
    let rel_pos = sub(pos_b, pos_a);
    let dist = dot(rel_pos, rel_pos).sqrt();
    let collide_dist = 2.0 * params.particle_radius;

    // Coincident particles have no contact normal.
    if dist >= collide_dist || dist <= f32::EPSILON {
        return [0.0; 3];
    }

    let norm = [rel_pos[0] / dist, rel_pos[1] / dist, rel_pos[2] / dist];
    let rel_vel = sub(vel_b, vel_a);
    let normal_speed = dot(rel_vel, norm);

    let mut force = [0.0; 3];
    for axis in 0..3 {
        let tan_vel = rel_vel[axis] - normal_speed * norm[axis];
        force[axis] = -params.collide_spring * (collide_dist - dist) * norm[axis]
            + params.collide_damping * rel_vel[axis]
            + params.collide_shear * tan_vel
            + params.collide_attraction * rel_pos[axis];
    }
    force
}

/// Accumulate contact forces from the 27 surrounding cells and write
/// `velocity + force` per particle into `new_velocities`.
pub fn collide(
    params: &SimParams,
    positions: &[[f32; 4]],
    velocities: &[[f32; 4]],
    grid_index: &[u32],
    cell_start: &[u32],
    cell_end: &[u32],
    new_velocities: &mut [[f32; 4]],
) {
    let grid = UniformGrid::new(params);

    for i in 0..positions.len() {
        let pos = xyz(positions[i]);
        let vel = xyz(velocities[i]);
        let mut force = [0.0f32; 3];

        grid.for_each_neighbor_cell(grid.pos_to_cell(pos), |cell| {
            let start = cell_start[cell as usize];
            if start == EMPTY_CELL {
                return;
            }
            for slot in start..cell_end[cell as usize] {
                let j = grid_index[slot as usize] as usize;
                if j == i {
                    continue;
                }
                let f = collide_spheres(params, pos, xyz(positions[j]), vel, xyz(velocities[j]));
                force[0] += f[0];
                force[1] += f[1];
                force[2] += f[2];
            }
        });

        new_velocities[i] = [vel[0] + force[0], vel[1] + force[1], vel[2] + force[2], velocities[i][3]];
    }
}
