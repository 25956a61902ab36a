//! The simulation engine: owns one world state and advances it one tick at
//! a time through three ordered phases.
//!
//! 1. **Pre-step** (`begin_tick`): advance the master RNG stream, apply the
//!    deferred edits queued during the previous tick in fixed order (kills
//!    sorted ascending, then spawns, then portal absorptions), zero the
//!    gravity mass accumulator, and rebuild the particle position map by
//!    ascending slot scan (last write wins).
//! 2. **Particle update** (`update_particles(start, end)`): apply each live
//!    particle's element rule in ascending slot order. The range signature
//!    is the parallelism seam: per-particle randomness is derived from
//!    `(tick, slot)` and cross-slot effects go through the deferred queues,
//!    so results do not depend on how the range is split.
//! 3. **Post-step** (`end_tick`): release due portal particles, latch
//!    wireless pulses, decay the electrical map, and relax the air, heat,
//!    and gravity fields from the values the particle phase left behind.
//!
//! Out-of-bounds neighbor access clamps or no-ops. A live slot with an
//! unrecognized tag is a data-integrity bug and aborts the process.

use dustbox_common::{GridDims, PlaceOffset};
use glam::Vec2;
use tracing::{debug, warn};

use crate::air::{self, AirScratch};
use crate::element::{Element, MatterKind};
use crate::gravity::{self, GravScratch};
use crate::rng::SimRng;
use crate::world::{
    BLOCK_OPEN, CapacityError, MAX_PLAYERS, NPART, PORTAL_CAPACITY, Particle, Player, Sign,
    WIRELESS_CHANNELS, WorldState,
};

const MAX_VELOCITY: f32 = 4.0;
const EDGE_MARGIN: f32 = 1e-3;
const ELEC_COOLDOWN: u8 = 8;
const PORTAL_TRANSIT_TICKS: i32 = 10;
const PORTAL_RETRY_TICKS: i32 = 2;
const FAN_STRENGTH: f32 = 0.4;
const FIRE_CELL_HEAT: f32 = 6.0;
const IGNITE_CHANCE_IN: u32 = 1;
const IGNITE_CHANCE_OF: u32 = 4;
const HEAT_BACKFLOW: f32 = 0.1;
const WIRELESS_THRESHOLD: f32 = 0.5;
const PLAYER_DRAG: f32 = 0.9;
const PLAYER_DAMAGE: f32 = 1.5;
const PRESSURE_DAMAGE_LIMIT: f32 = 30.0;
const HEAT_DAMAGE_LIMIT: f32 = 600.0;

/// Fixed neighbor scan order for conduction and ignition.
const NEIGHBORS_8: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Errors from installing or merging a parsed state.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("particle pool exhausted while loading ({placed} of {total} particles placed)")]
    Capacity { placed: usize, total: usize },
}

/// Edits queued during the particle phase, applied at the next pre-step.
#[derive(Debug, Default)]
struct PendingEdits {
    kills: Vec<u32>,
    spawns: Vec<Particle>,
    portal_in: Vec<Particle>,
}

/// Owns exactly one [`WorldState`] and all derived bookkeeping.
pub struct Simulation {
    state: WorldState,
    rng: SimRng,
    tick: u64,
    /// Cell → slot + 1 of the particle occupying it; 0 = empty. Derived
    /// state: rebuilt every pre-step, never snapshotted.
    pmap: Vec<u32>,
    pending: PendingEdits,
    air: AirScratch,
    grav: GravScratch,
}

impl Simulation {
    pub fn new(dims: GridDims) -> Self {
        Self::from_state(WorldState::new(dims))
    }

    pub fn from_state(state: WorldState) -> Self {
        let cells = state.dims().cell_count();
        let mut sim = Self {
            state,
            rng: SimRng::new(0),
            tick: 0,
            pmap: vec![0; cells],
            pending: PendingEdits::default(),
            air: AirScratch::default(),
            grav: GravScratch::default(),
        };
        sim.state.refresh_last_active();
        sim.rebuild_pmap();
        sim
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }

    pub fn into_state(self) -> WorldState {
        self.state
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn rng_state(&self) -> u64 {
        self.rng.state()
    }

    /// Reset the deterministic random source. Replay-harness startup only.
    pub fn reseed(&mut self, seed: u64) {
        self.rng.reseed(seed);
    }

    /// Queue a particle for creation at the next pre-step.
    pub fn queue_spawn(&mut self, p: Particle) {
        self.pending.spawns.push(p);
    }

    /// Queue a slot for deletion at the next pre-step.
    pub fn queue_kill(&mut self, slot: usize) {
        self.pending.kills.push(slot as u32);
    }

    /// Install (`replace`) or merge a parsed state at a grid offset.
    ///
    /// Merging stamps the incoming grids over the destination where they
    /// land in bounds and re-spawns incoming particles in ascending slot
    /// order; when two particles land on one cell the later write wins.
    /// The only hard failure is pool exhaustion.
    pub fn load(
        &mut self,
        incoming: &WorldState,
        replace: bool,
        offset: PlaceOffset,
    ) -> Result<(), LoadError> {
        if replace {
            self.state = WorldState::new(incoming.dims());
            self.pending = PendingEdits::default();
            self.pmap = vec![0; incoming.dims().cell_count()];
            self.tick = 0;
        }
        self.merge(incoming, offset)?;
        self.state.refresh_last_active();
        self.rebuild_pmap();
        debug!(
            replace,
            offset_x = offset.x,
            offset_y = offset.y,
            live = self.state.live_count(),
            "state loaded"
        );
        Ok(())
    }

    /// Phase 1: make the previous tick's deferred effects visible.
    pub fn begin_tick(&mut self) {
        self.rng.step_stream();

        let mut kills = std::mem::take(&mut self.pending.kills);
        kills.sort_unstable();
        kills.dedup();
        for slot in kills {
            self.state.kill(slot as usize);
        }
        for p in std::mem::take(&mut self.pending.spawns) {
            if self.state.spawn(p).is_err() {
                warn!("deferred spawn dropped: particle pool exhausted");
            }
        }
        for p in std::mem::take(&mut self.pending.portal_in) {
            match self.state.portal_free_slot() {
                Some(slot) => self.state.portal[slot] = p,
                None => warn!("portal buffer full; in-transit particle dropped"),
            }
        }

        self.state.grav_mass.fill(0.0);
        self.state.refresh_last_active();
        self.rebuild_pmap();
    }

    /// Phase 2: update live particles in `[start, end)`, ascending.
    pub fn update_particles(&mut self, start: usize, end: usize) {
        let stop = end.min(self.state.last_active());
        for i in start.min(stop)..stop {
            let tag = self.state.part(i).ptype;
            if tag == 0 {
                continue;
            }
            let Some(elem) = Element::from_tag(tag) else {
                panic!("corrupted particle slot {i}: unknown element tag {tag}");
            };
            let mut rng = self.rng.derive(self.tick, i as u64);
            self.update_one(i, elem, &mut rng);
        }
    }

    /// Phase 3: field relaxation and secondary-state upkeep.
    pub fn end_tick(&mut self) {
        self.release_portal_particles();

        // Transmissions latched this tick become readable next tick.
        for ch in &mut self.state.wireless {
            ch.strength = ch.pulse;
            ch.pulse = 0.0;
        }
        for e in &mut self.state.elec_map {
            *e = e.saturating_sub(1);
        }

        air::relax(&mut self.state, &mut self.air);
        gravity::relax(&mut self.state, &mut self.grav);

        self.tick += 1;
        debug!(tick = self.tick, live = self.state.live_count(), "tick complete");
    }

    /// One full tick: the three phases in order.
    pub fn tick(&mut self) {
        self.begin_tick();
        self.update_particles(0, NPART);
        self.end_tick();
    }

    // ---- internals ----

    fn merge(&mut self, incoming: &WorldState, offset: PlaceOffset) -> Result<(), LoadError> {
        let dst = self.state.dims();
        let src = incoming.dims();

        for sy in 0..src.height() as i32 {
            for sx in 0..src.width() as i32 {
                let (dx, dy) = (sx + offset.x, sy + offset.y);
                if !dst.contains(dx, dy) {
                    continue;
                }
                let s = src.index(sx as u32, sy as u32);
                let d = dst.index(dx as u32, dy as u32);
                self.state.pressure[d] = incoming.pressure[s];
                self.state.air_vx[d] = incoming.air_vx[s];
                self.state.air_vy[d] = incoming.air_vy[s];
                self.state.heat[d] = incoming.heat[s];
                self.state.grav_vx[d] = incoming.grav_vx[s];
                self.state.grav_vy[d] = incoming.grav_vy[s];
                self.state.grav_value[d] = incoming.grav_value[s];
                self.state.grav_mass[d] = incoming.grav_mass[s];
                self.state.block_map[d] = incoming.block_map[s];
                self.state.elec_map[d] = incoming.elec_map[s];
                self.state.fan_vx[d] = incoming.fan_vx[s];
                self.state.fan_vy[d] = incoming.fan_vy[s];
            }
        }

        for (d, s) in self.state.wireless.iter_mut().zip(&incoming.wireless) {
            if s.strength != 0.0 || s.pulse != 0.0 {
                *d = *s;
            }
        }

        let shift = Vec2::new(offset.x as f32, offset.y as f32);
        for (slot, src_player) in incoming.players.iter().enumerate() {
            if src_player.active != 0 {
                let mut p = *src_player;
                p.pos += shift;
                p.pos.x = p.pos.x.clamp(0.0, dst.width() as f32 - EDGE_MARGIN);
                p.pos.y = p.pos.y.clamp(0.0, dst.height() as f32 - EDGE_MARGIN);
                self.state.players[slot] = p;
            }
        }

        for p in incoming.portal.iter().filter(|p| p.is_live()) {
            match self.state.portal_free_slot() {
                Some(slot) => self.state.portal[slot] = *p,
                None => warn!("portal buffer full during load; in-transit particle dropped"),
            }
        }

        for sign in &incoming.signs {
            let (dx, dy) = (sign.x as i32 + offset.x, sign.y as i32 + offset.y);
            if dst.contains(dx, dy) {
                self.state.signs.push(Sign {
                    x: dx as u32,
                    y: dy as u32,
                    text: sign.text.clone(),
                });
            }
        }

        // Particles last, over the stamped grids. Fixed ascending scan with
        // last-write-wins collision resolution per destination cell.
        let mut occupancy: Vec<u32> = vec![0; dst.cell_count()];
        let existing: Vec<usize> = self.state.live_indices().collect();
        for i in existing {
            occupancy[self.state.cell_at(self.state.part(i).pos)] = i as u32 + 1;
        }
        let total = incoming.live_indices().count();
        let mut placed = 0usize;
        for si in incoming.live_indices() {
            let mut p = *incoming.part(si);
            p.pos += shift;
            let (cx, cy) = (p.pos.x.floor() as i32, p.pos.y.floor() as i32);
            if !dst.contains(cx, cy) {
                continue;
            }
            let cell = dst.index(cx as u32, cy as u32);
            if occupancy[cell] != 0 {
                self.state.kill(occupancy[cell] as usize - 1);
            }
            let slot = self
                .state
                .spawn(p)
                .map_err(|CapacityError| LoadError::Capacity { placed, total })?;
            occupancy[cell] = slot as u32 + 1;
            placed += 1;
        }
        Ok(())
    }

    fn rebuild_pmap(&mut self) {
        self.pmap.fill(0);
        let live: Vec<usize> = self.state.live_indices().collect();
        for i in live {
            let cell = self.state.cell_at(self.state.part(i).pos);
            self.pmap[cell] = i as u32 + 1;
        }
    }

    /// Live occupant of `(x, y)`, if in bounds and occupied.
    fn occupant(&self, x: i32, y: i32) -> Option<usize> {
        if !self.state.dims().contains(x, y) {
            return None;
        }
        let v = self.pmap[self.state.dims().index(x as u32, y as u32)];
        let slot = v.checked_sub(1)? as usize;
        self.state.part(slot).is_live().then_some(slot)
    }

    /// Whether a mover may enter `(x, y)`: in bounds, open block map, no
    /// occupant.
    fn cell_open(&self, x: i32, y: i32) -> bool {
        self.state.dims().contains(x, y)
            && self.state.block_map[self.state.dims().index(x as u32, y as u32)] == BLOCK_OPEN
            && self.occupant(x, y).is_none()
    }

    fn kill_now(&mut self, i: usize) {
        let cell = self.state.cell_at(self.state.part(i).pos);
        if self.pmap[cell] == i as u32 + 1 {
            self.pmap[cell] = 0;
        }
        self.state.kill(i);
    }

    fn move_pmap(&mut self, i: usize, old_cell: usize, new_cell: usize) {
        if self.pmap[old_cell] == i as u32 + 1 {
            self.pmap[old_cell] = 0;
        }
        self.pmap[new_cell] = i as u32 + 1;
    }

    fn update_one(&mut self, i: usize, elem: Element, rng: &mut SimRng) {
        let props = elem.props();
        let cell = self.state.cell_at(self.state.part(i).pos);

        // Gravity sources accumulate commutatively.
        if props.mass != 0.0 {
            self.state.grav_mass[cell] += props.mass;
        }

        if props.heat_conduct > 0.0 {
            let temp = self.state.part(i).temp;
            let delta = (self.state.heat[cell] - temp) * props.heat_conduct;
            self.state.part_mut(i).temp = temp + delta;
            self.state.heat[cell] -= delta * HEAT_BACKFLOW;
        }

        if props.hot_air != 0.0 {
            self.state.pressure[cell] += props.hot_air;
        }

        match elem {
            Element::Brick | Element::Metal | Element::Portal => {}
            Element::Fan => self.update_fan(i),
            Element::Spark => self.update_spark(i),
            Element::Emitter => self.update_emitter(i),
            Element::Player => self.update_player(i),
            Element::Dust | Element::Water | Element::Vapor | Element::Fire => {
                self.update_mobile(i, elem, rng);
            }
        }
    }

    fn update_fan(&mut self, i: usize) {
        let p = *self.state.part(i);
        let cell = self.state.cell_at(p.pos);
        self.state.fan_vx[cell] = p.vel.x * FAN_STRENGTH;
        self.state.fan_vy[cell] = p.vel.y * FAN_STRENGTH;
    }

    /// Convert one conductor neighbor to a spark, gated by the cooldown map.
    fn spark_neighbor(&mut self, n: usize) {
        let neighbor = *self.state.part(n);
        let Some(nelem) = neighbor.element() else {
            return;
        };
        if !nelem.props().conducts || nelem == Element::Spark {
            return;
        }
        let ncell = self.state.cell_at(neighbor.pos);
        if self.state.elec_map[ncell] != 0 {
            return;
        }
        {
            let np = self.state.part_mut(n);
            np.ctype = nelem.tag();
            np.ptype = Element::Spark.tag();
            np.life = Element::Spark.props().initial_life;
            np.temp = np.temp.max(Element::Spark.props().initial_temp);
        }
        self.state.elec_map[ncell] = ELEC_COOLDOWN;
    }

    fn update_spark(&mut self, i: usize) {
        let p = *self.state.part(i);
        let (cx, cy) = (p.pos.x.floor() as i32, p.pos.y.floor() as i32);

        // Fresh charge conducts outward exactly once.
        if p.life == Element::Spark.props().initial_life {
            for (dx, dy) in NEIGHBORS_8 {
                if let Some(n) = self.occupant(cx + dx, cy + dy) {
                    self.spark_neighbor(n);
                }
            }
        }

        let p = self.state.part_mut(i);
        p.life -= 1;
        if p.life <= 0 {
            // The charge expires; the substrate it rode remains.
            let substrate = Element::from_tag(p.ctype).unwrap_or(Element::Metal);
            p.ptype = substrate.tag();
            p.life = 0;
            p.ctype = 0;
        }
    }

    fn update_emitter(&mut self, i: usize) {
        let p = *self.state.part(i);
        let channel = p.tmp.rem_euclid(WIRELESS_CHANNELS as i32) as usize;
        let (cx, cy) = (p.pos.x.floor() as i32, p.pos.y.floor() as i32);

        // Transmit: an adjacent spark raises the channel pulse (max-merge,
        // so emitter order within the tick is irrelevant).
        let sparked = NEIGHBORS_8.iter().any(|&(dx, dy)| {
            self.occupant(cx + dx, cy + dy)
                .is_some_and(|n| self.state.part(n).ptype == Element::Spark.tag())
        });
        if sparked {
            let ch = &mut self.state.wireless[channel];
            ch.pulse = ch.pulse.max(1.0);
        }

        // Receive: a channel latched hot last tick sparks adjacent
        // conductors.
        if self.state.wireless[channel].strength > WIRELESS_THRESHOLD {
            for (dx, dy) in NEIGHBORS_8 {
                if let Some(n) = self.occupant(cx + dx, cy + dy) {
                    self.spark_neighbor(n);
                }
            }
        }
    }

    fn update_player(&mut self, i: usize) {
        let anchor = *self.state.part(i);
        let slot = anchor.tmp.rem_euclid(MAX_PLAYERS as i32) as usize;
        let mut pl = self.state.players[slot];
        if pl.active == 0 {
            pl = Player::spawned_at(anchor.pos);
        }

        let cell = self.state.cell_at(pl.pos);
        pl.vel.x = (pl.vel.x + self.state.grav_vx[cell]) * PLAYER_DRAG;
        pl.vel.y = (pl.vel.y + self.state.grav_vy[cell]) * PLAYER_DRAG;
        pl.vel.x = pl.vel.x.clamp(-MAX_VELOCITY, MAX_VELOCITY);
        pl.vel.y = pl.vel.y.clamp(-MAX_VELOCITY, MAX_VELOCITY);

        // Axis-separated movement; blocked components cancel.
        let mut pos = pl.pos;
        let nx = pos.x + pl.vel.x;
        if self.standable(nx, pos.y) {
            pos.x = nx;
        } else {
            pl.vel.x = 0.0;
        }
        let ny = pos.y + pl.vel.y;
        if self.standable(pos.x, ny) {
            pos.y = ny;
        } else {
            pl.vel.y = 0.0;
        }
        let dims = self.state.dims();
        pos.x = pos.x.clamp(0.0, dims.width() as f32 - EDGE_MARGIN);
        pos.y = pos.y.clamp(0.0, dims.height() as f32 - EDGE_MARGIN);

        if pl.vel.x.abs() > 0.01 {
            pl.facing = pl.vel.x.signum();
        }

        let here = self.state.cell_at(pos);
        if self.state.pressure[here].abs() > PRESSURE_DAMAGE_LIMIT
            || self.state.heat[here] > HEAT_DAMAGE_LIMIT
        {
            pl.health -= PLAYER_DAMAGE;
        }
        if pl.health <= 0.0 {
            pl.active = 0;
            pl.vel = Vec2::ZERO;
            self.state.players[slot] = pl;
            self.kill_now(i);
            return;
        }

        pl.pos = pos;
        self.state.players[slot] = pl;

        let old_cell = self.state.cell_at(anchor.pos);
        {
            let ap = self.state.part_mut(i);
            ap.pos = pos;
            ap.vel = pl.vel;
        }
        let new_cell = self.state.cell_at(pos);
        if new_cell != old_cell {
            self.move_pmap(i, old_cell, new_cell);
        }
    }

    /// Whether a player may occupy the cell under `(x, y)`: no wall and no
    /// solid occupant. Players wade through powders, liquids, and gases.
    fn standable(&self, x: f32, y: f32) -> bool {
        let (cx, cy) = (x.floor() as i32, y.floor() as i32);
        if !self.state.dims().contains(cx, cy) {
            return false;
        }
        if self.state.block_map[self.state.dims().index(cx as u32, cy as u32)] != BLOCK_OPEN {
            return false;
        }
        match self.occupant(cx, cy) {
            Some(n) => !matches!(
                self.state.part(n).element().map(|e| e.props().kind),
                Some(MatterKind::Solid)
            ),
            None => true,
        }
    }

    fn update_mobile(&mut self, i: usize, elem: Element, rng: &mut SimRng) {
        let props = elem.props();
        let mut p = *self.state.part(i);
        let old_cell = self.state.cell_at(p.pos);

        p.vel.x = p.vel.x * props.vel_loss
            + self.state.grav_vx[old_cell] * props.gravity
            + (self.state.air_vx[old_cell] + self.state.fan_vx[old_cell] - p.vel.x)
                * props.air_drag;
        p.vel.y = p.vel.y * props.vel_loss
            + self.state.grav_vy[old_cell] * props.gravity
            + (self.state.air_vy[old_cell] + self.state.fan_vy[old_cell] - p.vel.y)
                * props.air_drag;
        p.vel.x = p.vel.x.clamp(-MAX_VELOCITY, MAX_VELOCITY);
        p.vel.y = p.vel.y.clamp(-MAX_VELOCITY, MAX_VELOCITY);

        if elem == Element::Fire {
            self.state.heat[old_cell] += FIRE_CELL_HEAT;
            p.life -= 1;
            if p.life <= 0 {
                self.kill_now(i);
                return;
            }
            let (cx, cy) = (p.pos.x.floor() as i32, p.pos.y.floor() as i32);
            // Water quenches before anything ignites.
            for (dx, dy) in NEIGHBORS_8 {
                if let Some(n) = self.occupant(cx + dx, cy + dy) {
                    if self.state.part(n).ptype == Element::Water.tag() {
                        self.kill_now(i);
                        return;
                    }
                }
            }
            for (dx, dy) in NEIGHBORS_8 {
                let Some(n) = self.occupant(cx + dx, cy + dy) else {
                    continue;
                };
                let nelem = self.state.part(n).element();
                if nelem.is_some_and(|e| e.props().flammable)
                    && rng.chance(IGNITE_CHANCE_IN, IGNITE_CHANCE_OF)
                {
                    let fire = Element::Fire.props();
                    let np = self.state.part_mut(n);
                    np.ptype = Element::Fire.tag();
                    np.life = fire.initial_life + rng.range_i32(-10, 10);
                    np.temp = fire.initial_temp;
                    np.ctype = 0;
                }
            }
        }

        // Ballistic target, clamped to the playfield border.
        let dims = self.state.dims();
        let max_x = dims.width() as f32 - EDGE_MARGIN;
        let max_y = dims.height() as f32 - EDGE_MARGIN;
        let mut target = p.pos + p.vel;
        if target.x < 0.0 {
            target.x = 0.0;
            p.vel.x = 0.0;
        } else if target.x > max_x {
            target.x = max_x;
            p.vel.x = 0.0;
        }
        if target.y < 0.0 {
            target.y = 0.0;
            p.vel.y = 0.0;
        } else if target.y > max_y {
            target.y = max_y;
            p.vel.y = 0.0;
        }

        // Walk toward the target in sub-cell steps so fast movers cannot
        // jump over walls or portals. Velocity is bounded by MAX_VELOCITY,
        // so the step count stays small.
        let disp = target - p.pos;
        let steps = disp.x.abs().max(disp.y.abs()).ceil() as i32;
        let mut blocked = false;
        if steps > 0 {
            let step = disp / steps as f32;
            let mut cur = p.pos;
            for _ in 0..steps {
                let next = cur + step;
                let (cx, cy) = (cur.x.floor() as i32, cur.y.floor() as i32);
                let (nx, ny) = (next.x.floor() as i32, next.y.floor() as i32);
                if (nx, ny) != (cx, cy) {
                    // An entry portal on the crossed cell captures the
                    // mover into the transit queue; the absorption lands
                    // at the next pre-step.
                    if let Some(n) = self.occupant(nx, ny) {
                        let blocker = *self.state.part(n);
                        if blocker.ptype == Element::Portal.tag() && blocker.ctype == 0 {
                            let mut transit = p;
                            transit.tmp = blocker.tmp;
                            transit.life = PORTAL_TRANSIT_TICKS;
                            self.pending.portal_in.push(transit);
                            self.kill_now(i);
                            return;
                        }
                    }
                    if !self.cell_open(nx, ny) {
                        blocked = true;
                        break;
                    }
                }
                cur = next;
            }
            p.pos = cur;
        }

        // Keep the position map honest even for partial walks.
        let here = self.state.cell_at(p.pos);
        if here != old_cell {
            self.move_pmap(i, old_cell, here);
        }

        if !blocked {
            *self.state.part_mut(i) = p;
            return;
        }

        // Blocked: displacement fallback by matter kind, from wherever the
        // walk stopped.
        let (ox, oy) = (p.pos.x.floor() as i32, p.pos.y.floor() as i32);
        let moved_to = match props.kind {
            MatterKind::Powder => {
                p.vel.y = 0.0;
                p.vel.x *= 0.5;
                let side = rng.sign();
                [(ox, oy + 1), (ox + side, oy + 1), (ox - side, oy + 1)]
                    .into_iter()
                    .find(|&(x, y)| self.cell_open(x, y))
            }
            MatterKind::Liquid => {
                p.vel.y = 0.0;
                let side = rng.sign();
                [
                    (ox, oy + 1),
                    (ox + side, oy + 1),
                    (ox - side, oy + 1),
                    (ox + side, oy),
                    (ox - side, oy),
                ]
                .into_iter()
                .find(|&(x, y)| self.cell_open(x, y))
            }
            MatterKind::Gas => {
                p.vel *= 0.5;
                let dx = rng.range_i32(-1, 1);
                let dy = rng.range_i32(-1, 1);
                ((dx, dy) != (0, 0) && self.cell_open(ox + dx, oy + dy))
                    .then_some((ox + dx, oy + dy))
            }
            MatterKind::Energy => {
                p.vel *= 0.5;
                None
            }
            MatterKind::Solid | MatterKind::Special => None,
        };

        if let Some((nx, ny)) = moved_to {
            p.pos = Vec2::new(nx as f32 + 0.5, ny as f32 + 0.5);
            *self.state.part_mut(i) = p;
            self.move_pmap(i, here, self.state.cell_at(p.pos));
        } else {
            *self.state.part_mut(i) = p;
        }
    }

    fn release_portal_particles(&mut self) {
        for slot in 0..PORTAL_CAPACITY {
            if !self.state.portal[slot].is_live() {
                continue;
            }
            self.state.portal[slot].life -= 1;
            if self.state.portal[slot].life > 0 {
                continue;
            }
            let transit = self.state.portal[slot];
            let Some(anchor) = self.find_exit_portal(transit.tmp) else {
                debug!(channel = transit.tmp, "portal channel has no exit; particle dropped");
                self.state.portal[slot] = Particle::EMPTY;
                continue;
            };
            let apos = self.state.part(anchor).pos;
            let (ax, ay) = (apos.x.floor() as i32, apos.y.floor() as i32);
            let dir = (
                if transit.vel.x > 0.25 {
                    1
                } else if transit.vel.x < -0.25 {
                    -1
                } else {
                    0
                },
                if transit.vel.y > 0.25 {
                    1
                } else if transit.vel.y < -0.25 {
                    -1
                } else {
                    0
                },
            );
            let dir = if dir == (0, 0) { (0, 1) } else { dir };
            let (ex, ey) = (ax + dir.0, ay + dir.1);
            if !self.cell_open(ex, ey) {
                self.state.portal[slot].life = PORTAL_RETRY_TICKS;
                continue;
            }
            let elem = transit.element();
            let mut out = transit;
            out.pos = Vec2::new(ex as f32 + 0.5, ey as f32 + 0.5);
            out.tmp = 0;
            out.life = elem.map(|e| e.props().initial_life).unwrap_or(0);
            match self.state.spawn(out) {
                Ok(new_slot) => {
                    let cell = self.state.cell_at(out.pos);
                    self.pmap[cell] = new_slot as u32 + 1;
                    self.state.portal[slot] = Particle::EMPTY;
                }
                Err(CapacityError) => {
                    // Pool full; hold the particle and retry next tick.
                    self.state.portal[slot].life = PORTAL_RETRY_TICKS;
                }
            }
        }
    }

    /// Lowest-index live exit-portal anchor (`ctype != 0`) on a channel.
    fn find_exit_portal(&self, channel: i32) -> Option<usize> {
        self.state.live_indices().find(|&i| {
            let p = self.state.part(i);
            p.ptype == Element::Portal.tag() && p.ctype != 0 && p.tmp == channel
        })
    }
}
