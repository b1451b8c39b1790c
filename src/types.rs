//! Identifier types and hashing helpers shared across components

use sha3::{Digest, Keccak256};

/// Shard identifier
pub type ShardId = u64;

/// Cross-shard transaction identifier
pub type TransactionId = uuid::Uuid;

/// Channel identifier (32 bytes, hex in logs)
pub type ChannelId = [u8; 32];

/// Participant or validator identity
pub type Identity = String;

/// 32-byte digest
pub type Hash = [u8; 32];

/// keccak256 over the concatenation of `parts`
pub fn keccak256(parts: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Hex form of a channel id for logs and keys
pub fn channel_hex(id: &ChannelId) -> String {
    hex::encode(id)
}

/// Parse a hex channel id, as used by the status API
pub fn parse_channel_id(s: &str) -> Option<ChannelId> {
    let bytes = hex::decode(s.trim_start_matches("0x")).ok()?;
    bytes.try_into().ok()
}

/// Serde adapter writing 32-byte hashes as hex strings
pub mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_concatenates_parts() {
        assert_eq!(keccak256(&[b"ab", b"c"]), keccak256(&[b"abc"]));
        assert_ne!(keccak256(&[b"abc"]), keccak256(&[b"abd"]));
    }

    #[test]
    fn test_channel_id_hex_round_trip() {
        let id = [0xabu8; 32];
        assert_eq!(parse_channel_id(&channel_hex(&id)), Some(id));
        assert_eq!(parse_channel_id("0xabab"), None);
    }
}
