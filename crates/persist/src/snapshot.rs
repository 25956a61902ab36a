//! Full-state snapshots for comparison, persistence, and determinism
//! checks.
//!
//! A snapshot is a verbatim copy of everything physical: the twelve field
//! grids, the entire particle pool including dead slots, the portal buffer,
//! the wireless channels, and the player table. It deliberately omits signs
//! (cosmetic), the tick counter, and derived bookkeeping such as the free
//! list and the position map, so two stores in identical physical state
//! produce equal snapshots even if they arrived there differently.

use dustbox_common::GridDims;
use dustbox_kernel::{Particle, Player, WirelessChannel, WorldState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub dims: GridDims,
    pub pressure: Vec<f32>,
    pub air_vx: Vec<f32>,
    pub air_vy: Vec<f32>,
    pub heat: Vec<f32>,
    /// The whole pool, dead slots included; liveness is the type tag.
    pub particles: Vec<Particle>,
    pub grav_vx: Vec<f32>,
    pub grav_vy: Vec<f32>,
    pub grav_value: Vec<f32>,
    pub grav_mass: Vec<f32>,
    pub block_map: Vec<u8>,
    pub elec_map: Vec<u8>,
    pub fan_vx: Vec<f32>,
    pub fan_vy: Vec<f32>,
    pub portal: Vec<Particle>,
    pub wireless: Vec<WirelessChannel>,
    pub players: Vec<Player>,
}

impl Snapshot {
    pub fn capture(state: &WorldState) -> Self {
        Self {
            dims: state.dims(),
            pressure: state.pressure.clone(),
            air_vx: state.air_vx.clone(),
            air_vy: state.air_vy.clone(),
            heat: state.heat.clone(),
            particles: state.parts().to_vec(),
            grav_vx: state.grav_vx.clone(),
            grav_vy: state.grav_vy.clone(),
            grav_value: state.grav_value.clone(),
            grav_mass: state.grav_mass.clone(),
            block_map: state.block_map.clone(),
            elec_map: state.elec_map.clone(),
            fan_vx: state.fan_vx.clone(),
            fan_vy: state.fan_vy.clone(),
            portal: state.portal.clone(),
            wireless: state.wireless.clone(),
            players: state.players.clone(),
        }
    }

    /// Rebuild a runnable store. The free list comes back in ascending
    /// order and the sign table comes back empty; neither is part of the
    /// captured physical state.
    ///
    /// Panics if the snapshot's grids are inconsistent with its dimensions
    /// — that is corrupted data, not a recoverable condition.
    pub fn restore(&self) -> WorldState {
        let n = self.dims.cell_count();
        for (name, len) in [
            ("pressure", self.pressure.len()),
            ("air_vx", self.air_vx.len()),
            ("air_vy", self.air_vy.len()),
            ("heat", self.heat.len()),
            ("grav_vx", self.grav_vx.len()),
            ("grav_vy", self.grav_vy.len()),
            ("grav_value", self.grav_value.len()),
            ("grav_mass", self.grav_mass.len()),
            ("block_map", self.block_map.len()),
            ("elec_map", self.elec_map.len()),
            ("fan_vx", self.fan_vx.len()),
            ("fan_vy", self.fan_vy.len()),
        ] {
            assert_eq!(len, n, "snapshot grid `{name}` holds {len} cells, dims say {n}");
        }

        let mut state = WorldState::from_parts(self.dims, self.particles.clone());
        state.pressure = self.pressure.clone();
        state.air_vx = self.air_vx.clone();
        state.air_vy = self.air_vy.clone();
        state.heat = self.heat.clone();
        state.grav_vx = self.grav_vx.clone();
        state.grav_vy = self.grav_vy.clone();
        state.grav_value = self.grav_value.clone();
        state.grav_mass = self.grav_mass.clone();
        state.block_map = self.block_map.clone();
        state.elec_map = self.elec_map.clone();
        state.fan_vx = self.fan_vx.clone();
        state.fan_vy = self.fan_vy.clone();
        state.portal = self.portal.clone();
        state.wireless = self.wireless.clone();
        state.players = self.players.clone();
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dustbox_kernel::{Element, NPART, Sign};
    use glam::Vec2;

    fn dims() -> GridDims {
        GridDims::new(48, 32).unwrap()
    }

    fn populated() -> WorldState {
        let mut state = WorldState::new(dims());
        state
            .spawn(Particle::of(Element::Dust, Vec2::new(10.5, 10.5)))
            .unwrap();
        state
            .spawn(Particle::of(Element::Water, Vec2::new(11.5, 10.5)))
            .unwrap();
        state.pressure[dims().index(5, 5)] = 12.5;
        state.players[0] = Player::spawned_at(Vec2::new(20.5, 20.5));
        state.wireless[7].strength = 1.0;
        state
    }

    #[test]
    fn capture_copies_the_full_pool() {
        let mut state = populated();
        state.kill(0);
        let snap = Snapshot::capture(&state);
        assert_eq!(snap.particles.len(), NPART);
        assert!(!snap.particles[0].is_live());
        assert!(snap.particles[1].is_live());
    }

    #[test]
    fn equal_physical_states_give_equal_snapshots() {
        let a = populated();
        let b = populated();
        assert_eq!(Snapshot::capture(&a), Snapshot::capture(&b));
    }

    #[test]
    fn signs_are_excluded_from_snapshots() {
        let a = populated();
        let mut b = populated();
        b.signs.push(Sign {
            x: 3,
            y: 3,
            text: "do not hash me".into(),
        });
        assert_eq!(Snapshot::capture(&a), Snapshot::capture(&b));
    }

    #[test]
    fn free_list_history_does_not_leak_into_snapshots() {
        // Same final pool contents reached through different alloc orders.
        let mut a = WorldState::new(dims());
        a.spawn(Particle::of(Element::Dust, Vec2::new(1.5, 1.5))).unwrap();
        a.spawn(Particle::of(Element::Water, Vec2::new(2.5, 1.5))).unwrap();
        a.kill(0);

        let mut b = WorldState::new(dims());
        b.spawn(Particle::of(Element::Vapor, Vec2::new(9.5, 9.5))).unwrap();
        b.spawn(Particle::of(Element::Water, Vec2::new(2.5, 1.5))).unwrap();
        b.kill(0);
        b.spawn(Particle::of(Element::Dust, Vec2::new(1.5, 1.5))).unwrap();
        b.kill(0);
        // Both end with slot 0 dead and slot 1 water.
        assert_eq!(Snapshot::capture(&a), Snapshot::capture(&b));
    }

    #[test]
    fn restore_round_trips_physical_state() {
        let mut state = populated();
        state.kill(0);
        let snap = Snapshot::capture(&state);
        let restored = snap.restore();
        assert_eq!(Snapshot::capture(&restored), snap);
        // The restored store is runnable: the reclaimed slot is reusable.
        let mut restored = restored;
        let slot = restored
            .spawn(Particle::of(Element::Dust, Vec2::new(1.5, 1.5)))
            .unwrap();
        assert_eq!(slot, 0);
    }

    #[test]
    #[should_panic(expected = "snapshot grid `pressure`")]
    fn restore_panics_on_corrupted_grid_length() {
        let state = populated();
        let mut snap = Snapshot::capture(&state);
        snap.pressure.pop();
        let _ = snap.restore();
    }
}
