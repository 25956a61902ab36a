//! Gravity field recomputation.
//!
//! The particle phase accumulates element masses into the mass map
//! (commutative adds, so the accumulation is independent of iteration
//! order). The post-step runs one Jacobi sweep of the potential per tick
//! and differentiates it into the gravity velocity grids, adding the
//! uniform base pull. Reads come only from the previous potential buffer.

use dustbox_common::GridDims;

use crate::world::WorldState;

/// Uniform downward pull, cells/tick².
pub const BASE_GRAVITY: f32 = 0.05;
const NEWTONIAN_SCALE: f32 = 0.008;
const POTENTIAL_RETAIN: f32 = 0.99;

/// Reused potential buffer.
#[derive(Debug, Default)]
pub struct GravScratch {
    value: Vec<f32>,
}

fn at(grid: &[f32], dims: GridDims, x: i32, y: i32) -> f32 {
    grid[dims.index_clamped(x, y)]
}

/// One sweep: mass map → potential → gravity velocity.
pub fn relax(state: &mut WorldState, scratch: &mut GravScratch) {
    let dims = state.dims();
    let n = dims.cell_count();
    scratch.value.resize(n, 0.0);

    for y in 0..dims.height() as i32 {
        for x in 0..dims.width() as i32 {
            let c = dims.index(x as u32, y as u32);
            let avg = (at(&state.grav_value, dims, x - 1, y)
                + at(&state.grav_value, dims, x + 1, y)
                + at(&state.grav_value, dims, x, y - 1)
                + at(&state.grav_value, dims, x, y + 1))
                * 0.25;
            scratch.value[c] = avg * POTENTIAL_RETAIN + state.grav_mass[c] * NEWTONIAN_SCALE;
        }
    }
    std::mem::swap(&mut state.grav_value, &mut scratch.value);

    // Acceleration points toward higher potential (toward mass).
    for y in 0..dims.height() as i32 {
        for x in 0..dims.width() as i32 {
            let c = dims.index(x as u32, y as u32);
            state.grav_vx[c] = (at(&state.grav_value, dims, x + 1, y)
                - at(&state.grav_value, dims, x - 1, y))
                * 0.5;
            state.grav_vy[c] = (at(&state.grav_value, dims, x, y + 1)
                - at(&state.grav_value, dims, x, y - 1))
                * 0.5
                + BASE_GRAVITY;
        }
    }
}
