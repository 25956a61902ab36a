//! Post-step relaxation of the air and heat grids.
//!
//! Pressure absorbs the local velocity divergence and diffuses toward its
//! neighbor average; velocity follows the pressure gradient plus the fan
//! grids; ambient heat diffuses. Every pass reads only the previous buffers
//! and writes fresh ones in a fixed scan order, so the output depends solely
//! on the field values left by the particle phase — never on how that phase
//! iterated.
//!
//! Walls pin pressure and velocity to zero and hold ambient temperature;
//! porous walls pass air unchanged.

use dustbox_common::GridDims;

use crate::world::{AMBIENT_TEMP, BLOCK_WALL, WorldState};

const DIFFUSION: f32 = 0.5;
const PRESSURE_LOSS: f32 = 0.999;
const VELOCITY_LOSS: f32 = 0.999;
const PRESSURE_STEP: f32 = 0.15;
const VELOCITY_STEP: f32 = 0.1;
const HEAT_DIFFUSION: f32 = 0.1;
const MAX_PRESSURE: f32 = 256.0;
const FAN_DECAY: f32 = 0.9;

/// Reused double buffers for the air pass.
#[derive(Debug, Default)]
pub struct AirScratch {
    pressure: Vec<f32>,
    vx: Vec<f32>,
    vy: Vec<f32>,
    heat: Vec<f32>,
}

impl AirScratch {
    fn resize(&mut self, n: usize) {
        self.pressure.resize(n, 0.0);
        self.vx.resize(n, 0.0);
        self.vy.resize(n, 0.0);
        self.heat.resize(n, 0.0);
    }
}

/// Clamped sample of a grid at `(x, y)`.
fn at(grid: &[f32], dims: GridDims, x: i32, y: i32) -> f32 {
    grid[dims.index_clamped(x, y)]
}

fn avg4(grid: &[f32], dims: GridDims, x: i32, y: i32) -> f32 {
    (at(grid, dims, x - 1, y)
        + at(grid, dims, x + 1, y)
        + at(grid, dims, x, y - 1)
        + at(grid, dims, x, y + 1))
        * 0.25
}

/// One relaxation step over pressure, air velocity, and ambient heat.
pub fn relax(state: &mut WorldState, scratch: &mut AirScratch) {
    let dims = state.dims();
    let n = dims.cell_count();
    scratch.resize(n);

    for y in 0..dims.height() as i32 {
        for x in 0..dims.width() as i32 {
            let c = dims.index(x as u32, y as u32);
            if state.block_map[c] == BLOCK_WALL {
                scratch.pressure[c] = 0.0;
                scratch.vx[c] = 0.0;
                scratch.vy[c] = 0.0;
                scratch.heat[c] = AMBIENT_TEMP;
                continue;
            }

            let p = state.pressure[c];
            let div = (at(&state.air_vx, dims, x - 1, y) - at(&state.air_vx, dims, x + 1, y)
                + at(&state.air_vy, dims, x, y - 1)
                - at(&state.air_vy, dims, x, y + 1))
                * 0.5;
            let relaxed = (p + (avg4(&state.pressure, dims, x, y) - p) * DIFFUSION)
                * PRESSURE_LOSS
                + div * PRESSURE_STEP;
            scratch.pressure[c] = relaxed.clamp(-MAX_PRESSURE, MAX_PRESSURE);

            let gx = (at(&state.pressure, dims, x - 1, y)
                - at(&state.pressure, dims, x + 1, y))
                * 0.5;
            let gy = (at(&state.pressure, dims, x, y - 1)
                - at(&state.pressure, dims, x, y + 1))
                * 0.5;
            let vx = state.air_vx[c];
            let vy = state.air_vy[c];
            scratch.vx[c] = (vx + (avg4(&state.air_vx, dims, x, y) - vx) * DIFFUSION)
                * VELOCITY_LOSS
                + gx * VELOCITY_STEP
                + state.fan_vx[c];
            scratch.vy[c] = (vy + (avg4(&state.air_vy, dims, x, y) - vy) * DIFFUSION)
                * VELOCITY_LOSS
                + gy * VELOCITY_STEP
                + state.fan_vy[c];

            let h = state.heat[c];
            scratch.heat[c] = h + (avg4(&state.heat, dims, x, y) - h) * HEAT_DIFFUSION;
        }
    }

    std::mem::swap(&mut state.pressure, &mut scratch.pressure);
    std::mem::swap(&mut state.air_vx, &mut scratch.vx);
    std::mem::swap(&mut state.air_vy, &mut scratch.vy);
    std::mem::swap(&mut state.heat, &mut scratch.heat);

    // Fan influence decays so removed fans stop pushing.
    for v in state.fan_vx.iter_mut().chain(state.fan_vy.iter_mut()) {
        *v *= FAN_DECAY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dustbox_common::GridDims;

    fn world() -> WorldState {
        WorldState::new(GridDims::new(32, 32).unwrap())
    }

    #[test]
    fn ambient_field_is_a_fixed_point() {
        let mut w = world();
        let mut scratch = AirScratch::default();
        relax(&mut w, &mut scratch);
        assert!(w.pressure.iter().all(|&p| p == 0.0));
        assert!(w.air_vx.iter().all(|&v| v == 0.0));
        assert!(w.heat.iter().all(|&h| h == AMBIENT_TEMP));
    }

    #[test]
    fn pressure_spike_spreads_and_decays() {
        let mut w = world();
        let dims = w.dims();
        let center = dims.index(16, 16);
        w.pressure[center] = 100.0;
        let mut scratch = AirScratch::default();
        relax(&mut w, &mut scratch);
        assert!(w.pressure[center] < 100.0);
        assert!(w.pressure[dims.index(15, 16)] > 0.0);
        assert!(w.pressure[dims.index(16, 15)] > 0.0);
    }

    #[test]
    fn pressure_gradient_induces_velocity() {
        let mut w = world();
        let dims = w.dims();
        w.pressure[dims.index(10, 16)] = 50.0;
        let mut scratch = AirScratch::default();
        relax(&mut w, &mut scratch);
        // Cell to the right of the spike is pushed rightward (away).
        assert!(w.air_vx[dims.index(11, 16)] > 0.0);
        // Cell to the left is pushed leftward.
        assert!(w.air_vx[dims.index(9, 16)] < 0.0);
    }

    #[test]
    fn walls_pin_pressure_and_hold_ambient_heat() {
        let mut w = world();
        let dims = w.dims();
        let c = dims.index(5, 5);
        w.block_map[c] = BLOCK_WALL;
        w.pressure[c] = 40.0;
        w.heat[c] = 900.0;
        let mut scratch = AirScratch::default();
        relax(&mut w, &mut scratch);
        assert_eq!(w.pressure[c], 0.0);
        assert_eq!(w.air_vx[c], 0.0);
        assert_eq!(w.heat[c], AMBIENT_TEMP);
    }

    #[test]
    fn heat_diffuses_toward_neighbors() {
        let mut w = world();
        let dims = w.dims();
        let c = dims.index(16, 16);
        w.heat[c] = AMBIENT_TEMP + 100.0;
        let mut scratch = AirScratch::default();
        relax(&mut w, &mut scratch);
        assert!(w.heat[c] < AMBIENT_TEMP + 100.0);
        assert!(w.heat[dims.index(17, 16)] > AMBIENT_TEMP);
    }

    #[test]
    fn fan_grids_decay() {
        let mut w = world();
        let dims = w.dims();
        let c = dims.index(8, 8);
        w.fan_vx[c] = 1.0;
        let mut scratch = AirScratch::default();
        relax(&mut w, &mut scratch);
        assert!(w.fan_vx[c] < 1.0 && w.fan_vx[c] > 0.0);
    }

    #[test]
    fn relax_is_a_pure_function_of_the_grids() {
        let mut a = world();
        let dims = a.dims();
        a.pressure[dims.index(4, 4)] = 25.0;
        a.air_vy[dims.index(20, 20)] = -2.0;
        let mut b = a.clone();
        let mut s1 = AirScratch::default();
        let mut s2 = AirScratch::default();
        relax(&mut a, &mut s1);
        relax(&mut b, &mut s2);
        assert_eq!(a.pressure, b.pressure);
        assert_eq!(a.air_vx, b.air_vx);
        assert_eq!(a.air_vy, b.air_vy);
        assert_eq!(a.heat, b.heat);
    }
}
