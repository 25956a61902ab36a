//! The versioned binary save format.
//!
//! Layout:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "DBOX"
//! 4       2     format version, little-endian
//! 6       2     flags, reserved (must decode as ignored)
//! 8       4     body length, little-endian
//! 12      n     zstd-compressed CBOR body
//! ```
//!
//! The body is a CBOR map keyed by field name, so decoders ignore unknown
//! future fields; the version gate rejects only incompatible layouts.
//! Saves store live particles in ascending slot order; decoding packs them
//! back into the pool from slot zero up. Every declared length is checked
//! against the actual buffer before any indexing.

use dustbox_common::{DimsError, GridDims, MAX_DIM, PlaceOffset};
use dustbox_kernel::{
    BLOCK_POROUS, MAX_PLAYERS, NPART, PORTAL_CAPACITY, Particle, Player, Sign, WIRELESS_CHANNELS,
    WirelessChannel, WorldState,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SAVE_MAGIC: [u8; 4] = *b"DBOX";
pub const SAVE_VERSION: u16 = 1;
const HEADER_LEN: usize = 12;
const ZSTD_LEVEL: i32 = 3;

/// Decode failures. Decoding has no side effects: on error the simulation
/// never starts.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("save too short: need at least {HEADER_LEN} header bytes, got {got}")]
    HeaderTooShort { got: usize },
    #[error("bad magic {found:02x?}, expected {SAVE_MAGIC:02x?}")]
    BadMagic { found: [u8; 4] },
    #[error("unsupported save version {found}, newest supported is {SAVE_VERSION}")]
    UnsupportedVersion { found: u16 },
    #[error("truncated save body: header declares {declared} bytes, buffer holds {got}")]
    Truncated { declared: usize, got: usize },
    #[error("save body is not valid compressed CBOR: {0}")]
    Body(String),
    #[error(transparent)]
    Dims(#[from] DimsError),
    #[error("grid `{grid}` holds {got} cells, dimensions require {expected}")]
    GridLenMismatch {
        grid: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("block map cell {cell} holds invalid value {value}")]
    BadBlockValue { cell: usize, value: u8 },
    #[error("save declares {got} particles, pool capacity is {NPART}")]
    TooManyParticles { got: usize },
    #[error("particle {index} carries unknown element tag {tag}")]
    UnknownTag { index: usize, tag: u32 },
    #[error("particle {index} at ({x}, {y}) lies outside the {width}x{height} playfield")]
    ParticleOutOfBounds {
        index: usize,
        x: f32,
        y: f32,
        width: u32,
        height: u32,
    },
    #[error("save holds {got} in-transit portal particles, buffer capacity is {PORTAL_CAPACITY}")]
    TooManyPortalParticles { got: usize },
    #[error("wireless table holds {got} channels, limit is {WIRELESS_CHANNELS}")]
    TooManyChannels { got: usize },
    #[error("player table holds {got} slots, limit is {MAX_PLAYERS}")]
    TooManyPlayers { got: usize },
    #[error("placement offset ({x}, {y}) is out of range")]
    OffsetOutOfBounds { x: i32, y: i32 },
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("CBOR encode failed: {0}")]
    Cbor(String),
    #[error("zstd compression failed: {0}")]
    Compress(#[from] std::io::Error),
    #[error("save body of {got} bytes exceeds the format limit")]
    BodyTooLarge { got: usize },
}

/// The CBOR body. Field names are the wire schema; adding fields with
/// `serde(default)` keeps old saves decodable, and old decoders skip
/// fields they do not know.
#[derive(Debug, Serialize, Deserialize)]
struct SaveBody {
    dims: GridDims,
    offset: PlaceOffset,
    pressure: Vec<f32>,
    air_vx: Vec<f32>,
    air_vy: Vec<f32>,
    heat: Vec<f32>,
    grav_vx: Vec<f32>,
    grav_vy: Vec<f32>,
    grav_value: Vec<f32>,
    grav_mass: Vec<f32>,
    block_map: Vec<u8>,
    elec_map: Vec<u8>,
    fan_vx: Vec<f32>,
    fan_vy: Vec<f32>,
    /// Live particles only, ascending slot order.
    particles: Vec<Particle>,
    portal: Vec<Particle>,
    wireless: Vec<WirelessChannel>,
    players: Vec<Player>,
    #[serde(default)]
    signs: Vec<Sign>,
}

/// A decoded save: a ready world state plus placement metadata.
#[derive(Debug)]
pub struct ParsedSave {
    pub state: WorldState,
    pub offset: PlaceOffset,
    pub version: u16,
}

/// Parse an opaque save buffer. Pure: mutates nothing beyond the returned
/// structure.
pub fn decode_save(bytes: &[u8]) -> Result<ParsedSave, ParseError> {
    if bytes.len() < HEADER_LEN {
        return Err(ParseError::HeaderTooShort { got: bytes.len() });
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[0..4]);
    if magic != SAVE_MAGIC {
        return Err(ParseError::BadMagic { found: magic });
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version == 0 || version > SAVE_VERSION {
        return Err(ParseError::UnsupportedVersion { found: version });
    }
    let declared = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let got = bytes.len() - HEADER_LEN;
    if got < declared {
        return Err(ParseError::Truncated { declared, got });
    }
    let body = &bytes[HEADER_LEN..HEADER_LEN + declared];

    let raw = zstd::decode_all(body).map_err(|e| ParseError::Body(e.to_string()))?;
    let body: SaveBody =
        ciborium::from_reader(raw.as_slice()).map_err(|e| ParseError::Body(e.to_string()))?;

    let state = build_state(&body)?;
    if body.offset.x.unsigned_abs() > MAX_DIM || body.offset.y.unsigned_abs() > MAX_DIM {
        return Err(ParseError::OffsetOutOfBounds {
            x: body.offset.x,
            y: body.offset.y,
        });
    }
    debug!(
        version,
        width = state.dims().width(),
        height = state.dims().height(),
        particles = state.live_count(),
        signs = state.signs.len(),
        "save decoded"
    );
    Ok(ParsedSave {
        state,
        offset: body.offset,
        version,
    })
}

fn build_state(body: &SaveBody) -> Result<WorldState, ParseError> {
    // Re-validate dimensions even though GridDims deserialized: a
    // hand-crafted body could carry degenerate values.
    let dims = GridDims::new(body.dims.width(), body.dims.height())?;
    let n = dims.cell_count();
    for (grid, len) in [
        ("pressure", body.pressure.len()),
        ("air_vx", body.air_vx.len()),
        ("air_vy", body.air_vy.len()),
        ("heat", body.heat.len()),
        ("grav_vx", body.grav_vx.len()),
        ("grav_vy", body.grav_vy.len()),
        ("grav_value", body.grav_value.len()),
        ("grav_mass", body.grav_mass.len()),
        ("block_map", body.block_map.len()),
        ("elec_map", body.elec_map.len()),
        ("fan_vx", body.fan_vx.len()),
        ("fan_vy", body.fan_vy.len()),
    ] {
        if len != n {
            return Err(ParseError::GridLenMismatch {
                grid,
                got: len,
                expected: n,
            });
        }
    }
    if let Some(cell) = body.block_map.iter().position(|&b| b > BLOCK_POROUS) {
        return Err(ParseError::BadBlockValue {
            cell,
            value: body.block_map[cell],
        });
    }
    if body.particles.len() > NPART {
        return Err(ParseError::TooManyParticles {
            got: body.particles.len(),
        });
    }
    if body.portal.len() > PORTAL_CAPACITY {
        return Err(ParseError::TooManyPortalParticles {
            got: body.portal.len(),
        });
    }
    if body.wireless.len() > WIRELESS_CHANNELS {
        return Err(ParseError::TooManyChannels {
            got: body.wireless.len(),
        });
    }
    if body.players.len() > MAX_PLAYERS {
        return Err(ParseError::TooManyPlayers {
            got: body.players.len(),
        });
    }

    let mut state = WorldState::new(dims);
    state.pressure.copy_from_slice(&body.pressure);
    state.air_vx.copy_from_slice(&body.air_vx);
    state.air_vy.copy_from_slice(&body.air_vy);
    state.heat.copy_from_slice(&body.heat);
    state.grav_vx.copy_from_slice(&body.grav_vx);
    state.grav_vy.copy_from_slice(&body.grav_vy);
    state.grav_value.copy_from_slice(&body.grav_value);
    state.grav_mass.copy_from_slice(&body.grav_mass);
    state.block_map.copy_from_slice(&body.block_map);
    state.elec_map.copy_from_slice(&body.elec_map);
    state.fan_vx.copy_from_slice(&body.fan_vx);
    state.fan_vy.copy_from_slice(&body.fan_vy);

    let (w, h) = (dims.width(), dims.height());
    for (index, p) in body.particles.iter().enumerate() {
        if p.element().is_none() {
            return Err(ParseError::UnknownTag {
                index,
                tag: p.ptype,
            });
        }
        if !(p.pos.x >= 0.0 && p.pos.x < w as f32 && p.pos.y >= 0.0 && p.pos.y < h as f32) {
            return Err(ParseError::ParticleOutOfBounds {
                index,
                x: p.pos.x,
                y: p.pos.y,
                width: w,
                height: h,
            });
        }
        // Cannot fail: the pool is fresh and the count was checked.
        let _ = state.spawn(*p);
    }

    for (index, p) in body.portal.iter().filter(|p| p.is_live()).enumerate() {
        if p.element().is_none() {
            return Err(ParseError::UnknownTag {
                index,
                tag: p.ptype,
            });
        }
        if let Some(slot) = state.portal_free_slot() {
            state.portal[slot] = *p;
        }
    }

    for (i, ch) in body.wireless.iter().enumerate() {
        state.wireless[i] = *ch;
    }
    for (i, pl) in body.players.iter().enumerate() {
        state.players[i] = *pl;
    }
    // Signs are cosmetic: out-of-bounds anchors are dropped, not errors.
    state.signs = body
        .signs
        .iter()
        .filter(|s| dims.contains(s.x as i32, s.y as i32))
        .cloned()
        .collect();

    Ok(state)
}

/// Serialize a world state (plus placement offset) into a save blob.
/// Exact inverse of [`decode_save`] for any state it produced.
pub fn encode_save(state: &WorldState, offset: PlaceOffset) -> Result<Vec<u8>, EncodeError> {
    let body = SaveBody {
        dims: state.dims(),
        offset,
        pressure: state.pressure.clone(),
        air_vx: state.air_vx.clone(),
        air_vy: state.air_vy.clone(),
        heat: state.heat.clone(),
        grav_vx: state.grav_vx.clone(),
        grav_vy: state.grav_vy.clone(),
        grav_value: state.grav_value.clone(),
        grav_mass: state.grav_mass.clone(),
        block_map: state.block_map.clone(),
        elec_map: state.elec_map.clone(),
        fan_vx: state.fan_vx.clone(),
        fan_vy: state.fan_vy.clone(),
        particles: state.live_indices().map(|i| *state.part(i)).collect(),
        portal: state.portal.iter().filter(|p| p.is_live()).copied().collect(),
        wireless: state.wireless.clone(),
        players: state.players.clone(),
        signs: state.signs.clone(),
    };
    let framed = frame_body(&encode_body(&body)?)?;
    debug!(bytes = framed.len(), particles = body.particles.len(), "save encoded");
    Ok(framed)
}

fn encode_body(body: &SaveBody) -> Result<Vec<u8>, EncodeError> {
    let mut raw = Vec::new();
    ciborium::into_writer(body, &mut raw).map_err(|e| EncodeError::Cbor(e.to_string()))?;
    Ok(zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)?)
}

fn frame_body(compressed: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let declared: u32 = compressed
        .len()
        .try_into()
        .map_err(|_| EncodeError::BodyTooLarge {
            got: compressed.len(),
        })?;
    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(&SAVE_MAGIC);
    out.extend_from_slice(&SAVE_VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&declared.to_le_bytes());
    out.extend_from_slice(compressed);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use dustbox_kernel::Element;
    use glam::Vec2;

    fn dims() -> GridDims {
        GridDims::new(48, 32).unwrap()
    }

    fn at(x: u32, y: u32) -> Vec2 {
        Vec2::new(x as f32 + 0.5, y as f32 + 0.5)
    }

    fn populated() -> WorldState {
        let mut state = WorldState::new(dims());
        let d = state.dims();
        state.spawn(Particle::of(Element::Dust, at(10, 10))).unwrap();
        state.spawn(Particle::of(Element::Water, at(11, 10))).unwrap();
        let mut portal = Particle::of(Element::Portal, at(20, 20));
        portal.tmp = 2;
        state.spawn(portal).unwrap();
        let mut transit = Particle::of(Element::Vapor, at(20, 20));
        transit.life = 5;
        transit.tmp = 2;
        state.portal[0] = transit;
        state.pressure[d.index(4, 4)] = -3.25;
        state.heat[d.index(9, 9)] = 512.0;
        state.block_map[d.index(0, 31)] = BLOCK_POROUS;
        state.wireless[9].strength = 1.0;
        state.players[1] = Player::spawned_at(at(30, 12));
        state.signs.push(Sign {
            x: 10,
            y: 9,
            text: "dust pile".into(),
        });
        state
    }

    #[test]
    fn round_trip_preserves_snapshot_and_signs() {
        let original = populated();
        let bytes = encode_save(&original, PlaceOffset::new(2, -1)).unwrap();
        let parsed = decode_save(&bytes).unwrap();
        assert_eq!(parsed.version, SAVE_VERSION);
        assert_eq!(parsed.offset, PlaceOffset::new(2, -1));
        assert_eq!(parsed.state.signs, original.signs);
        assert_eq!(Snapshot::capture(&parsed.state), Snapshot::capture(&original));

        // Decode → snapshot → encode → decode → snapshot: equal.
        let bytes2 = encode_save(&parsed.state, parsed.offset).unwrap();
        let parsed2 = decode_save(&bytes2).unwrap();
        assert_eq!(
            Snapshot::capture(&parsed2.state),
            Snapshot::capture(&parsed.state)
        );
    }

    #[test]
    fn one_byte_short_fails_with_truncated() {
        let bytes = encode_save(&populated(), PlaceOffset::ZERO).unwrap();
        let err = decode_save(&bytes[..bytes.len() - 1]).unwrap_err();
        match err {
            ParseError::Truncated { declared, got } => assert_eq!(got, declared - 1),
            other => panic!("expected Truncated, got {other}"),
        }
    }

    #[test]
    fn header_too_short_is_reported() {
        assert!(matches!(
            decode_save(&[0u8; 5]),
            Err(ParseError::HeaderTooShort { got: 5 })
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode_save(&populated(), PlaceOffset::ZERO).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            decode_save(&bytes),
            Err(ParseError::BadMagic { .. })
        ));
    }

    #[test]
    fn future_version_is_rejected() {
        let mut bytes = encode_save(&populated(), PlaceOffset::ZERO).unwrap();
        bytes[4..6].copy_from_slice(&(SAVE_VERSION + 1).to_le_bytes());
        assert!(matches!(
            decode_save(&bytes),
            Err(ParseError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn garbage_body_is_a_body_error() {
        let framed = frame_body(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        assert!(matches!(decode_save(&framed), Err(ParseError::Body(_))));
    }

    #[test]
    fn trailing_garbage_is_tolerated() {
        let mut bytes = encode_save(&populated(), PlaceOffset::ZERO).unwrap();
        bytes.extend_from_slice(b"future trailer");
        assert!(decode_save(&bytes).is_ok());
    }

    fn body_of(state: &WorldState) -> SaveBody {
        let raw = zstd::decode_all(
            &encode_save(state, PlaceOffset::ZERO).unwrap()[HEADER_LEN..],
        )
        .unwrap();
        ciborium::from_reader(raw.as_slice()).unwrap()
    }

    fn reframe(body: &SaveBody) -> Vec<u8> {
        frame_body(&encode_body(body).unwrap()).unwrap()
    }

    #[test]
    fn unknown_element_tag_is_rejected() {
        let mut body = body_of(&populated());
        body.particles[1].ptype = 999;
        assert!(matches!(
            decode_save(&reframe(&body)),
            Err(ParseError::UnknownTag { index: 1, tag: 999 })
        ));
    }

    #[test]
    fn out_of_bounds_particle_is_rejected() {
        let mut body = body_of(&populated());
        body.particles[0].pos = Vec2::new(-1.0, 5.0);
        assert!(matches!(
            decode_save(&reframe(&body)),
            Err(ParseError::ParticleOutOfBounds { index: 0, .. })
        ));
        let mut body = body_of(&populated());
        body.particles[0].pos = Vec2::new(f32::NAN, 5.0);
        assert!(matches!(
            decode_save(&reframe(&body)),
            Err(ParseError::ParticleOutOfBounds { .. })
        ));
    }

    #[test]
    fn grid_length_mismatch_is_rejected() {
        let mut body = body_of(&populated());
        body.heat.pop();
        assert!(matches!(
            decode_save(&reframe(&body)),
            Err(ParseError::GridLenMismatch { grid: "heat", .. })
        ));
    }

    #[test]
    fn invalid_block_value_is_rejected() {
        let mut body = body_of(&populated());
        body.block_map[7] = 9;
        assert!(matches!(
            decode_save(&reframe(&body)),
            Err(ParseError::BadBlockValue { cell: 7, value: 9 })
        ));
    }

    #[test]
    fn oversized_tables_are_rejected() {
        let mut body = body_of(&populated());
        body.players.push(Player::INACTIVE);
        body.players.push(Player::INACTIVE);
        body.players.push(Player::INACTIVE);
        assert!(matches!(
            decode_save(&reframe(&body)),
            Err(ParseError::TooManyPlayers { .. })
        ));

        let mut body = body_of(&populated());
        body.wireless = vec![WirelessChannel::default(); WIRELESS_CHANNELS + 1];
        assert!(matches!(
            decode_save(&reframe(&body)),
            Err(ParseError::TooManyChannels { .. })
        ));
    }

    #[test]
    fn wild_offset_is_rejected() {
        let mut body = body_of(&populated());
        body.offset = PlaceOffset::new(1_000_000, 0);
        assert!(matches!(
            decode_save(&reframe(&body)),
            Err(ParseError::OffsetOutOfBounds { .. })
        ));
    }

    #[test]
    fn unknown_future_fields_are_ignored() {
        let original = populated();
        let bytes = encode_save(&original, PlaceOffset::ZERO).unwrap();
        let raw = zstd::decode_all(&bytes[HEADER_LEN..]).unwrap();
        let mut value: ciborium::value::Value =
            ciborium::from_reader(raw.as_slice()).unwrap();
        if let ciborium::value::Value::Map(entries) = &mut value {
            entries.push((
                ciborium::value::Value::Text("future_field".into()),
                ciborium::value::Value::Integer(7.into()),
            ));
        } else {
            panic!("save body should be a CBOR map");
        }
        let mut raw2 = Vec::new();
        ciborium::into_writer(&value, &mut raw2).unwrap();
        let framed = frame_body(&zstd::encode_all(raw2.as_slice(), ZSTD_LEVEL).unwrap()).unwrap();
        let parsed = decode_save(&framed).unwrap();
        assert_eq!(Snapshot::capture(&parsed.state), Snapshot::capture(&original));
    }

    #[test]
    fn decoding_packs_particles_from_slot_zero() {
        let mut state = WorldState::new(dims());
        state.spawn(Particle::of(Element::Dust, at(1, 1))).unwrap();
        state.spawn(Particle::of(Element::Water, at(2, 1))).unwrap();
        state.spawn(Particle::of(Element::Vapor, at(3, 1))).unwrap();
        state.kill(1);
        let bytes = encode_save(&state, PlaceOffset::ZERO).unwrap();
        let parsed = decode_save(&bytes).unwrap();
        assert_eq!(parsed.state.live_count(), 2);
        assert_eq!(parsed.state.part(0).element(), Some(Element::Dust));
        assert_eq!(parsed.state.part(1).element(), Some(Element::Vapor));
    }

    #[test]
    fn save_file_round_trip_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("demo.dbox");
        let original = populated();
        std::fs::write(&path, encode_save(&original, PlaceOffset::ZERO).unwrap()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let parsed = decode_save(&bytes).unwrap();
        assert_eq!(Snapshot::capture(&parsed.state), Snapshot::capture(&original));
    }
}
