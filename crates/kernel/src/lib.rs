//! Simulation kernel: world state store, element rules, and the
//! deterministic three-phase tick engine.
//!
//! # Invariants
//! - A tick is three ordered phases with a full barrier between them:
//!   pre-step, particle update, post-step.
//! - Given identical state and RNG seed, ticking is bit-identical across
//!   runs and supported platforms.
//! - All randomness flows through the explicit [`SimRng`] threaded into the
//!   engine; there is no hidden global random state.

pub mod air;
pub mod element;
pub mod engine;
pub mod gravity;
pub mod rng;
pub mod world;

pub use element::{Element, ElementProps, MatterKind};
pub use engine::{LoadError, Simulation};
pub use rng::SimRng;
pub use world::{
    AMBIENT_TEMP, BLOCK_OPEN, BLOCK_POROUS, BLOCK_WALL, CapacityError, MAX_PLAYERS, NPART,
    PORTAL_CAPACITY, Particle, Player, Sign, WIRELESS_CHANNELS, WirelessChannel, WorldState,
};
