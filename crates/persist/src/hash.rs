//! The snapshot content digest.
//!
//! One incremental SHA-256 over the snapshot fields, truncated to its
//! leading 128 bits. The digest exists for equality and regression checks
//! only: identical physical state must always produce the identical digest,
//! on every build of every supported (little-endian) platform. The hash
//! input is therefore exclusively raw bytes of padding-free records in the
//! fixed field order below. No pointers, no lengths, no map iteration
//! order, and never signs.
//!
//! Feed order:
//! 1. pressure, air_vx, air_vy, heat
//! 2. the full particle pool (dead slots included)
//! 3. grav_vx, grav_vy, grav_value, grav_mass
//! 4. block_map, elec_map
//! 5. fan_vx, fan_vy
//! 6. the portal buffer
//! 7. the wireless channels
//! 8. the player table

use std::fmt;

use sha2::{Digest, Sha256};

use crate::snapshot::Snapshot;

/// A 128-bit content digest, rendered as two concatenated 64-bit hex
/// halves, high then low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest128 {
    pub high: u64,
    pub low: u64,
}

impl fmt::Display for Digest128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

/// Digest a snapshot in the documented field order.
pub fn hash_snapshot(snap: &Snapshot) -> Digest128 {
    let mut hasher = Sha256::new();

    hasher.update(bytemuck::cast_slice::<f32, u8>(&snap.pressure));
    hasher.update(bytemuck::cast_slice::<f32, u8>(&snap.air_vx));
    hasher.update(bytemuck::cast_slice::<f32, u8>(&snap.air_vy));
    hasher.update(bytemuck::cast_slice::<f32, u8>(&snap.heat));

    hasher.update(bytemuck::cast_slice::<_, u8>(&snap.particles));

    hasher.update(bytemuck::cast_slice::<f32, u8>(&snap.grav_vx));
    hasher.update(bytemuck::cast_slice::<f32, u8>(&snap.grav_vy));
    hasher.update(bytemuck::cast_slice::<f32, u8>(&snap.grav_value));
    hasher.update(bytemuck::cast_slice::<f32, u8>(&snap.grav_mass));

    hasher.update(&snap.block_map);
    hasher.update(&snap.elec_map);

    hasher.update(bytemuck::cast_slice::<f32, u8>(&snap.fan_vx));
    hasher.update(bytemuck::cast_slice::<f32, u8>(&snap.fan_vy));

    hasher.update(bytemuck::cast_slice::<_, u8>(&snap.portal));
    hasher.update(bytemuck::cast_slice::<_, u8>(&snap.wireless));
    hasher.update(bytemuck::cast_slice::<_, u8>(&snap.players));

    let out = hasher.finalize();
    let mut high = [0u8; 8];
    let mut low = [0u8; 8];
    high.copy_from_slice(&out[0..8]);
    low.copy_from_slice(&out[8..16]);
    Digest128 {
        high: u64::from_be_bytes(high),
        low: u64::from_be_bytes(low),
    }
}
