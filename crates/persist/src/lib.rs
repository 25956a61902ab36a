//! Persistence: versioned binary saves, snapshots, content digests.
//!
//! # Invariants
//! - Decoding validates every declared length before indexing; a truncated
//!   buffer fails with a typed error, never an out-of-bounds read.
//! - Snapshots capture physical state only: signs and derived bookkeeping
//!   are excluded from capture, equality, and hashing.
//! - The content digest feeds fields to the hash in one fixed, documented
//!   order over padding-free little-endian bytes.

pub mod hash;
pub mod save;
pub mod snapshot;

pub use hash::{Digest128, hash_snapshot};
pub use save::{EncodeError, ParseError, ParsedSave, SAVE_VERSION, decode_save, encode_save};
pub use snapshot::Snapshot;
