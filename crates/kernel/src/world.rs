//! The world state store: field grids plus the particle pool.
//!
//! Pure data with structural operations only; all physics lives in the
//! engine. A `WorldState` is self-contained — every array it owns is sized
//! from its dimensions at construction and never read past its bounds.
//!
//! # Invariants
//! - Every live particle's type tag resolves to a recognized element.
//! - All field grids hold exactly `width * height` cells at all times.
//! - Slot indices are reused after death (LIFO free list); holders of an
//!   index must re-check liveness before use.

use bytemuck::{Pod, Zeroable};
use dustbox_common::GridDims;
use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::element::Element;

/// Fixed capacity of the main particle pool.
pub const NPART: usize = 65_536;
/// Capacity of the in-transit portal buffer.
pub const PORTAL_CAPACITY: usize = 256;
/// Number of wireless channels.
pub const WIRELESS_CHANNELS: usize = 128;
/// Number of player slots.
pub const MAX_PLAYERS: usize = 4;
/// Ambient temperature (kelvin) of fresh worlds and insulating walls.
pub const AMBIENT_TEMP: f32 = 295.15;

/// Block map cell values.
pub const BLOCK_OPEN: u8 = 0;
/// Blocks particles and air.
pub const BLOCK_WALL: u8 = 1;
/// Blocks particles, passes air.
pub const BLOCK_POROUS: u8 = 2;

/// One mobile simulated element.
///
/// `repr(C)` with exclusively 4-byte fields: 36 bytes, no padding, so pools
/// of particles can be hashed and compared as raw little-endian bytes.
/// A `ptype` of zero marks the slot unused.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Pod, Zeroable)]
#[repr(C)]
pub struct Particle {
    pub ptype: u32,
    pub pos: Vec2,
    pub vel: Vec2,
    pub temp: f32,
    pub life: i32,
    pub tmp: i32,
    pub ctype: u32,
}

const _: () = assert!(core::mem::size_of::<Particle>() == 36);

impl Particle {
    pub const EMPTY: Self = Self {
        ptype: 0,
        pos: Vec2::ZERO,
        vel: Vec2::ZERO,
        temp: 0.0,
        life: 0,
        tmp: 0,
        ctype: 0,
    };

    /// A fresh particle of `elem` at `pos`, with the element's default
    /// life and temperature.
    pub fn of(elem: Element, pos: Vec2) -> Self {
        let props = elem.props();
        Self {
            ptype: elem.tag(),
            pos,
            vel: Vec2::ZERO,
            temp: props.initial_temp,
            life: props.initial_life,
            tmp: 0,
            ctype: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.ptype != 0
    }

    pub fn element(&self) -> Option<Element> {
        Element::from_tag(self.ptype)
    }
}

/// One humanoid avatar slot. 32 bytes, no padding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Pod, Zeroable)]
#[repr(C)]
pub struct Player {
    /// Nonzero while the slot is occupied.
    pub active: u32,
    pub pos: Vec2,
    pub vel: Vec2,
    pub health: f32,
    /// -1.0 or +1.0.
    pub facing: f32,
    /// Element tag of the held item (0 = empty hands).
    pub held: u32,
}

const _: () = assert!(core::mem::size_of::<Player>() == 32);

impl Player {
    pub const INACTIVE: Self = Self {
        active: 0,
        pos: Vec2::ZERO,
        vel: Vec2::ZERO,
        health: 0.0,
        facing: 1.0,
        held: 0,
    };

    pub fn spawned_at(pos: Vec2) -> Self {
        Self {
            active: 1,
            pos,
            vel: Vec2::ZERO,
            health: 100.0,
            facing: 1.0,
            held: 0,
        }
    }
}

/// One wireless channel: `strength` is readable this tick, `pulse`
/// accumulates transmissions for the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, Pod, Zeroable)]
#[repr(C)]
pub struct WirelessChannel {
    pub strength: f32,
    pub pulse: f32,
}

/// A text label anchored to a cell. Cosmetic metadata: carried through
/// saves, excluded from snapshots, equality, and hashing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sign {
    pub x: u32,
    pub y: u32,
    pub text: String,
}

/// Raised when the particle pool cannot hold another live particle.
#[derive(Debug, thiserror::Error)]
#[error("particle pool exhausted: all {NPART} slots are live")]
pub struct CapacityError;

/// The engine's full mutable state.
///
/// Equality (`PartialEq`) compares the complete store including signs and
/// bookkeeping; the persistence layer defines the narrower physical-state
/// equality via its snapshot type.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldState {
    dims: GridDims,

    // Field grids; all `dims.cell_count()` long.
    pub pressure: Vec<f32>,
    pub air_vx: Vec<f32>,
    pub air_vy: Vec<f32>,
    pub heat: Vec<f32>,
    pub grav_vx: Vec<f32>,
    pub grav_vy: Vec<f32>,
    pub grav_value: Vec<f32>,
    pub grav_mass: Vec<f32>,
    pub block_map: Vec<u8>,
    pub elec_map: Vec<u8>,
    pub fan_vx: Vec<f32>,
    pub fan_vy: Vec<f32>,

    // Main pool. `parts` is always NPART long; `free` holds the dead slot
    // indices, popped LIFO.
    parts: Vec<Particle>,
    free: Vec<u32>,
    last_active: usize,

    /// Particles in transit between portals. Disjoint storage and
    /// lifecycle from the main pool.
    pub portal: Vec<Particle>,
    pub wireless: Vec<WirelessChannel>,
    pub players: Vec<Player>,
    pub signs: Vec<Sign>,
}

impl WorldState {
    pub fn new(dims: GridDims) -> Self {
        let n = dims.cell_count();
        Self {
            dims,
            pressure: vec![0.0; n],
            air_vx: vec![0.0; n],
            air_vy: vec![0.0; n],
            heat: vec![AMBIENT_TEMP; n],
            grav_vx: vec![0.0; n],
            grav_vy: vec![0.0; n],
            grav_value: vec![0.0; n],
            grav_mass: vec![0.0; n],
            block_map: vec![BLOCK_OPEN; n],
            elec_map: vec![0; n],
            fan_vx: vec![0.0; n],
            fan_vy: vec![0.0; n],
            parts: vec![Particle::EMPTY; NPART],
            free: (0..NPART as u32).rev().collect(),
            last_active: 0,
            portal: vec![Particle::EMPTY; PORTAL_CAPACITY],
            wireless: vec![WirelessChannel::default(); WIRELESS_CHANNELS],
            players: vec![Player::INACTIVE; MAX_PLAYERS],
            signs: Vec::new(),
        }
    }

    /// Rebuild a store from a verbatim particle pool (must be `NPART`
    /// records). The free list is reconstructed in ascending order.
    pub fn from_parts(dims: GridDims, parts: Vec<Particle>) -> Self {
        assert_eq!(
            parts.len(),
            NPART,
            "particle pool must hold exactly {NPART} slots, got {}",
            parts.len()
        );
        let mut state = Self::new(dims);
        state.free = parts
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, p)| !p.is_live())
            .map(|(i, _)| i as u32)
            .collect();
        state.parts = parts;
        state.refresh_last_active();
        state
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn parts(&self) -> &[Particle] {
        &self.parts
    }

    pub fn part(&self, i: usize) -> &Particle {
        &self.parts[i]
    }

    pub fn part_mut(&mut self, i: usize) -> &mut Particle {
        &mut self.parts[i]
    }

    pub fn live_count(&self) -> usize {
        NPART - self.free.len()
    }

    /// One past the highest index that may hold a live particle. Refreshed
    /// by the engine's pre-step; may overestimate between refreshes.
    pub fn last_active(&self) -> usize {
        self.last_active
    }

    /// Indices of live particles, ascending.
    pub fn live_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.parts[..self.last_active]
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_live())
            .map(|(i, _)| i)
    }

    /// Place a particle in the lowest-available reclaimed slot.
    pub fn spawn(&mut self, p: Particle) -> Result<usize, CapacityError> {
        debug_assert!(
            p.element().is_some(),
            "spawned particle must carry a recognized element tag, got {}",
            p.ptype
        );
        let slot = self.free.pop().ok_or(CapacityError)? as usize;
        self.parts[slot] = p;
        self.last_active = self.last_active.max(slot + 1);
        Ok(slot)
    }

    /// Mark a slot dead and reclaim its index. No-op on dead slots.
    pub fn kill(&mut self, i: usize) {
        if self.parts[i].is_live() {
            self.parts[i] = Particle::EMPTY;
            self.free.push(i as u32);
        }
    }

    /// Shrink `last_active` down to the true live bound.
    pub fn refresh_last_active(&mut self) {
        let mut bound = self.parts.len();
        while bound > 0 && !self.parts[bound - 1].is_live() {
            bound -= 1;
        }
        self.last_active = bound;
    }

    /// First unused portal-buffer slot, if any.
    pub fn portal_free_slot(&self) -> Option<usize> {
        self.portal.iter().position(|p| !p.is_live())
    }

    /// Cell index under a particle position. Positions are kept in bounds
    /// by the engine; stray values clamp to the border cell.
    pub fn cell_at(&self, pos: Vec2) -> usize {
        self.dims.index_clamped(pos.x as i32, pos.y as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> GridDims {
        GridDims::new(64, 48).unwrap()
    }

    #[test]
    fn fresh_world_is_empty_and_consistent() {
        let w = WorldState::new(dims());
        let n = w.dims().cell_count();
        assert_eq!(w.pressure.len(), n);
        assert_eq!(w.heat.len(), n);
        assert_eq!(w.block_map.len(), n);
        assert_eq!(w.fan_vy.len(), n);
        assert_eq!(w.live_count(), 0);
        assert_eq!(w.last_active(), 0);
        assert!(w.heat.iter().all(|&h| h == AMBIENT_TEMP));
    }

    #[test]
    fn spawn_fills_lowest_slot_first() {
        let mut w = WorldState::new(dims());
        let a = w.spawn(Particle::of(Element::Dust, Vec2::new(1.5, 1.5))).unwrap();
        let b = w.spawn(Particle::of(Element::Dust, Vec2::new(2.5, 1.5))).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(w.live_count(), 2);
        assert_eq!(w.last_active(), 2);
    }

    #[test]
    fn killed_index_is_reused() {
        let mut w = WorldState::new(dims());
        let a = w.spawn(Particle::of(Element::Dust, Vec2::new(1.5, 1.5))).unwrap();
        let _b = w.spawn(Particle::of(Element::Dust, Vec2::new(2.5, 1.5))).unwrap();
        w.kill(a);
        assert!(!w.part(a).is_live());
        let c = w.spawn(Particle::of(Element::Water, Vec2::new(3.5, 1.5))).unwrap();
        assert_eq!(c, a);
        assert_eq!(w.part(c).element(), Some(Element::Water));
    }

    #[test]
    fn double_kill_is_harmless() {
        let mut w = WorldState::new(dims());
        let a = w.spawn(Particle::of(Element::Dust, Vec2::new(1.5, 1.5))).unwrap();
        w.kill(a);
        w.kill(a);
        assert_eq!(w.live_count(), 0);
        // The freed index must not appear twice.
        let b = w.spawn(Particle::of(Element::Dust, Vec2::new(1.5, 1.5))).unwrap();
        let c = w.spawn(Particle::of(Element::Dust, Vec2::new(2.5, 1.5))).unwrap();
        assert_ne!(b, c);
    }

    #[test]
    fn live_iteration_matches_liveness_tags() {
        let mut w = WorldState::new(dims());
        let mut expected = Vec::new();
        for i in 0..10 {
            let slot = w
                .spawn(Particle::of(Element::Dust, Vec2::new(i as f32 + 0.5, 0.5)))
                .unwrap();
            expected.push(slot);
        }
        w.kill(expected[3]);
        w.kill(expected[7]);
        w.refresh_last_active();
        let live: Vec<usize> = w.live_indices().collect();
        assert_eq!(live.len(), 8);
        for &i in &live {
            assert!(w.part(i).is_live());
        }
        assert!(!live.contains(&expected[3]));
        assert!(!live.contains(&expected[7]));
    }

    #[test]
    fn refresh_last_active_shrinks_bound() {
        let mut w = WorldState::new(dims());
        let a = w.spawn(Particle::of(Element::Dust, Vec2::new(1.5, 1.5))).unwrap();
        let b = w.spawn(Particle::of(Element::Dust, Vec2::new(2.5, 1.5))).unwrap();
        w.kill(b);
        w.refresh_last_active();
        assert_eq!(w.last_active(), a + 1);
        w.kill(a);
        w.refresh_last_active();
        assert_eq!(w.last_active(), 0);
    }

    #[test]
    fn from_parts_round_trips_pool() {
        let mut w = WorldState::new(dims());
        for i in 0..5 {
            w.spawn(Particle::of(Element::Dust, Vec2::new(i as f32 + 0.5, 0.5)))
                .unwrap();
        }
        w.kill(2);
        let rebuilt = WorldState::from_parts(dims(), w.parts().to_vec());
        assert_eq!(rebuilt.live_count(), 4);
        assert_eq!(rebuilt.parts(), w.parts());
        // Lowest dead slot is handed out first after a rebuild.
        let mut rebuilt = rebuilt;
        let slot = rebuilt
            .spawn(Particle::of(Element::Water, Vec2::new(0.5, 0.5)))
            .unwrap();
        assert_eq!(slot, 2);
    }

    #[test]
    fn capacity_error_when_pool_full() {
        let mut w = WorldState::new(dims());
        for _ in 0..NPART {
            w.spawn(Particle::of(Element::Dust, Vec2::new(0.5, 0.5))).unwrap();
        }
        assert!(w.spawn(Particle::of(Element::Dust, Vec2::new(0.5, 0.5))).is_err());
    }

    #[test]
    fn record_sizes_are_padding_free() {
        assert_eq!(core::mem::size_of::<Particle>(), 36);
        assert_eq!(core::mem::size_of::<Player>(), 32);
        assert_eq!(core::mem::size_of::<WirelessChannel>(), 8);
    }

    #[test]
    fn cell_at_clamps_stray_positions() {
        let w = WorldState::new(dims());
        assert_eq!(w.cell_at(Vec2::new(-5.0, -5.0)), 0);
        assert_eq!(
            w.cell_at(Vec2::new(1e6, 1e6)),
            w.dims().cell_count() - 1
        );
    }
}
