//! Mirrors Certificate Transparency logs into a local, cryptographically
//! verified archive and republishes the archive as BitTorrent swarms.
//!
//! Each run extends the mirror to the log's newest Signed Tree Head, proves
//! that every downloaded entry is consistent with both the previously trusted
//! STH and the new one, slices the extension into fixed-size shards, and
//! hands sealed shards to the packager for torrent/magnet/RSS emission.

pub mod client;
pub mod config;
pub mod entry;
pub mod error;
/// Known-logs list handling and per-log descriptors.
pub mod logs;
/// Streaming Merkle tree construction and consistency-proof verification.
pub mod merkle;
pub mod pipeline;
/// Shard files, manifests, and resumable archive state.
pub mod shard;
pub mod sth;
pub mod sync;
/// Packager: torrent metainfo, magnet links, and the RSS feed.
pub mod torrent;

pub use error::MirrorError;

use sha2::{Digest, Sha256};

/// SHA-256 output; every tree node and root in the system is one of these.
pub type Hash = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// `SHA-256(0x00 || leaf_bytes)` per RFC 6962 §2.1.
pub fn leaf_hash(leaf: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf);
    hasher.finalize().into()
}

/// `SHA-256(0x01 || left || right)` for interior nodes.
pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Serde adapter: a 32-byte hash as a base64 string, as CT's JSON bodies and
/// our on-disk state both carry hashes.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::Hash;

    pub fn serialize<S: Serializer>(hash: &Hash, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Hash, D::Error> {
        let raw = String::deserialize(de)?;
        let bytes = STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes of base64"))
    }
}

/// Serde adapter: arbitrary bytes as a base64 string.
pub mod b64bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(de)?;
        STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
