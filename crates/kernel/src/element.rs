//! The closed element set and its behavior constants.
//!
//! Particle behavior dispatches over a fixed, enumerable set of element
//! types resolved once per particle from its type tag; per-element physics
//! constants live in a static table so rules stay data-driven and testable
//! without touching the engine.

use serde::{Deserialize, Serialize};

use crate::world::AMBIENT_TEMP;

/// Broad behavior class of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatterKind {
    /// Never moves; occupies its cell permanently.
    Solid,
    /// Falls with gravity, slides to lower diagonals.
    Powder,
    /// Falls with gravity, also spreads horizontally.
    Liquid,
    /// Random-walks, buoyant.
    Gas,
    /// Ballistic mover with a finite lifetime.
    Energy,
    /// Anchor for a player record.
    Special,
}

/// All recognized element types. Tag `0` is the dead-slot sentinel and is
/// deliberately not representable here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Element {
    Brick = 1,
    Dust = 2,
    Water = 3,
    Vapor = 4,
    Fire = 5,
    Metal = 6,
    Spark = 7,
    Fan = 8,
    Portal = 9,
    Emitter = 10,
    Player = 11,
}

/// Per-element physics constants.
#[derive(Debug, Clone, Copy)]
pub struct ElementProps {
    pub name: &'static str,
    pub kind: MatterKind,
    /// Scale applied to the gravity field when integrating velocity.
    /// Negative values are buoyant.
    pub gravity: f32,
    /// Fraction of velocity retained per tick.
    pub vel_loss: f32,
    /// Fraction of the local air+fan velocity blended in per tick.
    pub air_drag: f32,
    /// Pressure added to the particle's cell every tick.
    pub hot_air: f32,
    /// Contribution to the gravity mass map.
    pub mass: f32,
    /// Starting `life` for freshly spawned particles (0 = unused).
    pub initial_life: i32,
    /// Default spawn temperature, kelvin.
    pub initial_temp: f32,
    /// Rate of heat exchange with the ambient heat grid, in `[0, 1]`.
    pub heat_conduct: f32,
    /// Whether sparks travel through this element.
    pub conducts: bool,
    /// Whether adjacent fire can ignite this element.
    pub flammable: bool,
}

const INERT: ElementProps = ElementProps {
    name: "",
    kind: MatterKind::Solid,
    gravity: 0.0,
    vel_loss: 0.0,
    air_drag: 0.0,
    hot_air: 0.0,
    mass: 1.0,
    initial_life: 0,
    initial_temp: AMBIENT_TEMP,
    heat_conduct: 0.0,
    conducts: false,
    flammable: false,
};

/// Properties table, indexed by `tag - 1`.
static TABLE: [ElementProps; 11] = [
    // Brick: the fully inert reference solid.
    ElementProps {
        name: "brick",
        ..INERT
    },
    ElementProps {
        name: "dust",
        kind: MatterKind::Powder,
        gravity: 1.0,
        vel_loss: 0.98,
        air_drag: 0.1,
        mass: 0.6,
        heat_conduct: 0.05,
        flammable: true,
        ..INERT
    },
    ElementProps {
        name: "water",
        kind: MatterKind::Liquid,
        gravity: 1.0,
        vel_loss: 0.95,
        air_drag: 0.2,
        mass: 0.8,
        heat_conduct: 0.3,
        conducts: true,
        ..INERT
    },
    ElementProps {
        name: "vapor",
        kind: MatterKind::Gas,
        gravity: -0.05,
        vel_loss: 0.99,
        air_drag: 0.75,
        mass: 0.05,
        heat_conduct: 0.1,
        ..INERT
    },
    ElementProps {
        name: "fire",
        kind: MatterKind::Energy,
        gravity: -0.15,
        vel_loss: 0.9,
        air_drag: 0.3,
        hot_air: 0.08,
        mass: 0.0,
        initial_life: 60,
        initial_temp: 700.0,
        heat_conduct: 0.4,
        ..INERT
    },
    ElementProps {
        name: "metal",
        mass: 1.2,
        heat_conduct: 0.5,
        conducts: true,
        ..INERT
    },
    // Spark: a charge riding a conductor; `ctype` remembers the substrate.
    ElementProps {
        name: "spark",
        mass: 1.2,
        initial_life: 4,
        initial_temp: 400.0,
        heat_conduct: 0.5,
        ..INERT
    },
    ElementProps {
        name: "fan",
        ..INERT
    },
    ElementProps {
        name: "portal",
        ..INERT
    },
    // Emitter: detects adjacent sparks, so it must not itself conduct.
    ElementProps {
        name: "emitter",
        ..INERT
    },
    ElementProps {
        name: "player",
        kind: MatterKind::Special,
        ..INERT
    },
];

impl Element {
    /// Resolve a type tag. Returns `None` for the sentinel and for any
    /// unrecognized value.
    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            1 => Self::Brick,
            2 => Self::Dust,
            3 => Self::Water,
            4 => Self::Vapor,
            5 => Self::Fire,
            6 => Self::Metal,
            7 => Self::Spark,
            8 => Self::Fan,
            9 => Self::Portal,
            10 => Self::Emitter,
            11 => Self::Player,
            _ => return None,
        })
    }

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn props(self) -> &'static ElementProps {
        &TABLE[self as usize - 1]
    }

    /// Whether this element participates in the common movement pass.
    pub fn is_mobile(self) -> bool {
        matches!(
            self.props().kind,
            MatterKind::Powder | MatterKind::Liquid | MatterKind::Gas | MatterKind::Energy
        )
    }
}
