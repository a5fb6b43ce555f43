use ::redis::RedisError;
use async_trait::async_trait;
use color_eyre::Report;
use std::error::Error as StdError;
use std::fmt;

use super::types::{ChunkRecord, IndexRecord, Kid, KidEntry, SyncState};

#[cfg(test)]
mod fixtures;
mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// `(kid, variant)`
pub type VariantKey = (Kid, u8);
/// `(kid, variant, byte1)`
pub type Byte1Key = (Kid, u8, u8);
/// `(kid, variant, byte1, byte2)`
pub type Byte2Key = (Kid, u8, u8, u8);

/// Error type for cache store operations.
#[derive(Debug)]
pub struct StoreError {
    error: Report,
}

impl StoreError {
    pub fn new<T>(error: T) -> Self
    where
        T: StdError + Send + Sync + 'static,
    {
        Self {
            error: Report::new(error),
        }
    }

    pub fn msg<T>(message: T) -> Self
    where
        T: fmt::Debug + fmt::Display + Send + Sync + 'static,
    {
        Self {
            error: Report::msg(message),
        }
    }
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl From<RedisError> for StoreError {
    fn from(error: RedisError) -> Self {
        Self {
            error: Report::new(error),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self {
            error: Report::new(error),
        }
    }
}

/// Persistent mirror of the published revocation data.
///
/// Each write is atomic at row granularity; the `apply_*` diffs and the
/// cascading deletes are atomic as a whole.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// All cached kid entries, ordered by kid.
    async fn kid_entries(&self) -> StoreResult<Vec<KidEntry>>;

    async fn kid_entry(&self, kid: &Kid) -> StoreResult<Option<KidEntry>>;

    async fn index(&self, kid: &Kid, variant: u8) -> StoreResult<Option<IndexRecord>>;

    /// All cached indices, ordered by `(kid, variant)`.
    async fn indices(&self) -> StoreResult<Vec<(VariantKey, IndexRecord)>>;

    async fn byte1_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
    ) -> StoreResult<Option<ChunkRecord>>;

    async fn byte2_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
    ) -> StoreResult<Option<ChunkRecord>>;

    /// Keys of every cached byte1 chunk list.
    async fn byte1_keys(&self) -> StoreResult<Vec<Byte1Key>>;

    /// Keys of every cached byte2 chunk list.
    async fn byte2_keys(&self) -> StoreResult<Vec<Byte2Key>>;

    async fn sync_state(&self) -> StoreResult<Option<SyncState>>;

    /// Replace the kid table.
    ///
    /// Index and chunk rows of kids that disappeared, or of variants a kid no
    /// longer declares, are deleted in the same step. Returns the number of
    /// rows removed.
    async fn apply_kid_list(&self, entries: Vec<KidEntry>) -> StoreResult<usize>;

    /// Replace the index of `(kid, variant)`.
    ///
    /// Chunk rows whose byte1 or byte2 partition is missing from the new index
    /// are deleted in the same step. Returns the number of rows removed.
    async fn apply_index(&self, kid: &Kid, variant: u8, record: IndexRecord)
    -> StoreResult<usize>;

    async fn put_byte1_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        record: ChunkRecord,
    ) -> StoreResult<()>;

    async fn put_byte2_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
        record: ChunkRecord,
    ) -> StoreResult<()>;

    /// Delete a kid together with its indices and chunk lists.
    async fn delete_kid(&self, kid: &Kid) -> StoreResult<()>;

    /// Delete the index and chunk lists of `(kid, variant)`.
    async fn delete_variant(&self, kid: &Kid, variant: u8) -> StoreResult<()>;

    /// Delete a byte1 chunk list and every byte2 chunk list beneath it.
    async fn delete_byte1(&self, kid: &Kid, variant: u8, byte1: u8) -> StoreResult<()>;

    async fn delete_byte2(&self, kid: &Kid, variant: u8, byte1: u8, byte2: u8)
    -> StoreResult<()>;

    async fn save_sync_state(&self, state: &SyncState) -> StoreResult<()>;

    /// Drop every kid, index and chunk row. The sync state is left alone.
    async fn clear(&self) -> StoreResult<()>;
}

/// Whether a cached index row has to go after the kid table changed.
pub(crate) fn variant_declared(kids: &[KidEntry], kid: &Kid, variant: u8) -> bool {
    kids.iter()
        .any(|entry| &entry.kid == kid && entry.hash_variants.contains_key(&variant))
}

/// Whether a byte1 chunk row is still covered by its (new) index.
pub(crate) fn byte1_covered(index: &IndexRecord, byte1: u8) -> bool {
    index.index.contains_key(&byte1)
}

/// Whether a byte2 chunk row is still covered by its (new) index.
pub(crate) fn byte2_covered(index: &IndexRecord, byte1: u8, byte2: u8) -> bool {
    index
        .index
        .get(&byte1)
        .is_some_and(|entry| entry.byte2.contains_key(&byte2))
}
