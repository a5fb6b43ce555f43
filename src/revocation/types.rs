use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

/// Length of the truncated hashes published in chunk lists.
pub const HASH_PREFIX_LEN: usize = 16;

/// Key identifier scoping a revocation list to one issuing key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Kid(Vec<u8>);

impl Kid {
    pub fn new<T: AsRef<[u8]>>(value: T) -> Self {
        Self(value.as_ref().to_vec())
    }

    /// Decode a kid as it appears in certificate headers.
    pub fn from_base64(value: &str) -> Result<Self, base64::DecodeError> {
        STANDARD.decode(value.trim()).map(Self)
    }

    pub fn from_hex(value: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(value).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kid({})", self.to_hex())
    }
}

impl Serialize for Kid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Kid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Kid::from_hex(&value).map_err(D::Error::custom)
    }
}

/// Hash variants understood by this client.
///
/// Kids may publish other variant bytes; those are synchronized but never matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum HashVariant {
    /// SHA-256 over the signature value
    Signature = 0x0a,
    /// SHA-256 over the unique certificate identifier
    Uci = 0x0b,
    /// SHA-256 over issuer country followed by the certificate identifier
    CountryUci = 0x0c,
}

impl HashVariant {
    pub const ALL: [HashVariant; 3] = [
        HashVariant::Signature,
        HashVariant::Uci,
        HashVariant::CountryUci,
    ];

    pub fn byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for HashVariant {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0a => Ok(HashVariant::Signature),
            0x0b => Ok(HashVariant::Uci),
            0x0c => Ok(HashVariant::CountryUci),
            other => Err(other),
        }
    }
}

/// One kid together with the hash variants it publishes and their entry counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KidEntry {
    pub kid: Kid,
    pub hash_variants: BTreeMap<u8, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Byte2Entry {
    pub timestamp: i64,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub timestamp: i64,
    pub count: u32,
    pub byte2: BTreeMap<u8, Byte2Entry>,
}

/// Index of one `(kid, variant)`, keyed by the first hash byte.
pub type RevocationIndex = BTreeMap<u8, IndexEntry>;

/// A 16-byte truncated hash as published in chunk lists.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashPrefix([u8; HASH_PREFIX_LEN]);

impl HashPrefix {
    /// Truncate a full hash. Returns `None` for inputs shorter than 16 bytes.
    pub fn truncate(hash: &[u8]) -> Option<Self> {
        let prefix: [u8; HASH_PREFIX_LEN] = hash.get(..HASH_PREFIX_LEN)?.try_into().ok()?;
        Some(Self(prefix))
    }

    /// Exact 16-byte slice; any other length is rejected.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn byte1(&self) -> u8 {
        self.0[0]
    }

    pub fn byte2(&self) -> u8 {
        self.0[1]
    }

    pub fn as_bytes(&self) -> &[u8; HASH_PREFIX_LEN] {
        &self.0
    }
}

impl From<[u8; HASH_PREFIX_LEN]> for HashPrefix {
    fn from(value: [u8; HASH_PREFIX_LEN]) -> Self {
        Self(value)
    }
}

impl fmt::Debug for HashPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashPrefix({})", hex::encode(self.0))
    }
}

impl Serialize for HashPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for HashPrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        let bytes = hex::decode(&value).map_err(D::Error::custom)?;
        HashPrefix::from_slice(&bytes)
            .ok_or_else(|| D::Error::custom(format!("hash prefix must be 16 bytes: {value}")))
    }
}

/// Cached index row. `synced_at` is the epoch second at which the writing pass started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub index: RevocationIndex,
    pub synced_at: i64,
}

/// Cached chunk list row (byte1 or byte2 granularity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunks: Vec<HashPrefix>,
    pub synced_at: i64,
}

impl ChunkRecord {
    pub fn contains(&self, hash: &HashPrefix) -> bool {
        self.chunks.iter().any(|chunk| chunk == hash)
    }
}

/// Last phase committed by the current (or last) sync pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    #[default]
    Completed,
    KidList,
    Index,
    ByteOne,
    ByteTwo,
}

impl SyncPhase {
    /// The phase that runs after this one.
    pub fn next(self) -> SyncPhase {
        match self {
            SyncPhase::Completed => SyncPhase::KidList,
            SyncPhase::KidList => SyncPhase::Index,
            SyncPhase::Index => SyncPhase::ByteOne,
            SyncPhase::ByteOne => SyncPhase::ByteTwo,
            SyncPhase::ByteTwo => SyncPhase::Completed,
        }
    }
}

/// Process-wide synchronization bookkeeping, persisted through the cache store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub caching_enabled: bool,
    pub last_sync_start: DateTime<Utc>,
    pub last_sync_finish: DateTime<Utc>,
    pub phase: SyncPhase,
}

impl SyncState {
    pub fn new(caching_enabled: bool) -> Self {
        Self {
            caching_enabled,
            last_sync_start: DateTime::<Utc>::UNIX_EPOCH,
            last_sync_finish: DateTime::<Utc>::UNIX_EPOCH,
            phase: SyncPhase::Completed,
        }
    }

    /// Whether any pass has ever completed.
    pub fn has_synced(&self) -> bool {
        self.last_sync_finish > DateTime::<Utc>::UNIX_EPOCH
    }

    /// Whether a pass was interrupted and has not completed since.
    pub fn is_interrupted(&self) -> bool {
        self.phase != SyncPhase::Completed
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kid_from_base64() {
        let kid = Kid::from_base64("9cWXDDA52FQ=").unwrap();
        assert_eq!(kid.to_hex(), "f5c5970c3039d854");
        assert!(Kid::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_hash_prefix_truncate() {
        let full = [7u8; 32];
        let prefix = HashPrefix::truncate(&full).unwrap();
        assert_eq!(prefix.as_bytes(), &[7u8; 16]);
        assert!(HashPrefix::truncate(&[1u8; 15]).is_none());
        assert!(HashPrefix::from_slice(&[1u8; 17]).is_none());
    }

    #[test]
    fn test_hash_variant_bytes() {
        assert_eq!(HashVariant::try_from(0x0b), Ok(HashVariant::Uci));
        assert_eq!(HashVariant::try_from(0x0d), Err(0x0d));
        assert_eq!(HashVariant::CountryUci.byte(), 0x0c);
    }

    #[test]
    fn test_chunk_record_serde() {
        let record = ChunkRecord {
            chunks: vec![HashPrefix::from([0xab; 16])],
            synced_at: 42,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("abababababababababababababababab"));
        assert_eq!(serde_json::from_str::<ChunkRecord>(&json).unwrap(), record);
    }

    #[test]
    fn test_sync_phase_order() {
        let mut phase = SyncPhase::Completed;
        let mut seen = Vec::new();
        loop {
            phase = phase.next();
            seen.push(phase);
            if phase == SyncPhase::Completed {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                SyncPhase::KidList,
                SyncPhase::Index,
                SyncPhase::ByteOne,
                SyncPhase::ByteTwo,
                SyncPhase::Completed
            ]
        );
    }
}
